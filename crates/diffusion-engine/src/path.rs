//! `/panels/...` path resolution
//!
//! Accepted forms:
//!   /panels/-                 append (add only)
//!   /panels/<index>           positional, legacy
//!   /panels/<id>              resolved by scanning ids at apply time
//!   /panels/<x>/<field>       data | timestamp | context | id | type
//!   /panels/<x>/data/<key>    one member of the data object
//!
//! Segments use JSON-pointer escaping (`~1` for `/`, `~0` for `~`).

use diffusion_core::{ApplyError, Panel};

const ROOT: &str = "/panels";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelRef {
    Append,
    Index(usize),
    Id(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelField {
    Whole,
    Data,
    DataKey(String),
    Timestamp,
    Context,
    Id,
    Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelPath {
    pub target: PanelRef,
    pub field: PanelField,
}

pub fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

pub fn escape(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Path addressing a panel by id.
pub fn id_path(id: &str) -> String {
    format!("{}/{}", ROOT, escape(id))
}

pub fn data_path(id: &str) -> String {
    format!("{}/data", id_path(id))
}

pub fn append_path() -> String {
    format!("{}/-", ROOT)
}

impl PanelPath {
    pub fn parse(path: &str) -> Result<Self, ApplyError> {
        let rest = path
            .strip_prefix(ROOT)
            .ok_or_else(|| ApplyError::validation(format!("path must address /panels/..., got {:?}", path)))?;
        let rest = rest
            .strip_prefix('/')
            .ok_or_else(|| ApplyError::validation(format!("path must address a panel, got {:?}", path)))?;

        let segments: Vec<String> = rest.split('/').map(unescape).collect();
        let head = &segments[0];
        if head.is_empty() {
            return Err(ApplyError::validation(format!("empty panel segment in {:?}", path)));
        }

        let target = if head == "-" {
            PanelRef::Append
        } else if let Some(i) = head.parse::<usize>().ok().filter(|i| i.to_string() == *head) {
            PanelRef::Index(i)
        } else {
            PanelRef::Id(head.clone())
        };

        let field = match segments.get(1).map(String::as_str) {
            None => PanelField::Whole,
            Some("data") => match segments.get(2) {
                None => PanelField::Data,
                Some(key) if segments.len() == 3 && !key.is_empty() => PanelField::DataKey(key.clone()),
                Some(_) => {
                    return Err(ApplyError::validation(format!(
                        "nested data paths are not supported: {:?}",
                        path
                    )))
                }
            },
            Some(f) if segments.len() > 2 => {
                return Err(ApplyError::validation(format!("field {:?} has no members: {:?}", f, path)))
            }
            Some("timestamp") => PanelField::Timestamp,
            Some("context") | Some("module") => PanelField::Context,
            Some("id") => PanelField::Id,
            Some("type") => PanelField::Kind,
            Some(other) => {
                return Err(ApplyError::validation(format!("unknown panel field {:?} in {:?}", other, path)))
            }
        };

        if target == PanelRef::Append && field != PanelField::Whole {
            return Err(ApplyError::validation(format!("append path cannot address a field: {:?}", path)));
        }

        Ok(Self { target, field })
    }

    /// Resolve the target against the current panel list.
    ///
    /// A numeric segment matches a panel with that id before falling back to
    /// the legacy positional index.
    pub fn resolve(&self, panels: &[Panel]) -> Result<usize, ApplyError> {
        match &self.target {
            PanelRef::Append => Err(ApplyError::validation("append path does not address an existing panel")),
            PanelRef::Index(i) => {
                let as_id = i.to_string();
                match panels.iter().position(|p| p.id == as_id) {
                    Some(pos) => Ok(pos),
                    None if *i < panels.len() => Ok(*i),
                    None => Err(ApplyError::not_found(format!(
                        "no panel at index {} ({} panels)",
                        i,
                        panels.len()
                    ))),
                }
            }
            PanelRef::Id(id) => panels
                .iter()
                .position(|p| &p.id == id)
                .ok_or_else(|| ApplyError::not_found(format!("panel not found: {}", id))),
        }
    }
}
