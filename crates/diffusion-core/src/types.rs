//! Core types for dashboard diffusion

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Free-form panel payload. Always a JSON object.
pub type PanelData = Map<String, Value>;

/// Maximum number of operations carried by one envelope.
pub const MAX_OPS_PER_ENVELOPE: usize = 20;

/// Id and kind of the synthetic notice prepended on safe-mode entry.
pub const SAFE_MODE_PANEL: &str = "safe_mode_notice";

/// A named, typed unit of result state (one UI card).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Panel {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: PanelData,
    pub timestamp: i64,
    #[serde(default, alias = "module", skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Panel {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        data: PanelData,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            data,
            timestamp,
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Structural patch operation kind.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
    Test,
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Replace => write!(f, "replace"),
            Self::Remove => write!(f, "remove"),
            Self::Test => write!(f, "test"),
        }
    }
}

/// One JSON-Patch style operation addressing `/panels/...`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, rename = "from", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl PatchOperation {
    fn build(op: PatchOp, path: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            op,
            path: path.into(),
            value,
            from: None,
        }
    }

    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self::build(PatchOp::Add, path, Some(value))
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::build(PatchOp::Replace, path, Some(value))
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::build(PatchOp::Remove, path, None)
    }

    pub fn test(path: impl Into<String>, value: Value) -> Self {
        Self::build(PatchOp::Test, path, Some(value))
    }
}

fn patch_action() -> String {
    "patch".to_string()
}

/// Ordered batch of operations; the unit of atomic application.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PatchEnvelope {
    #[serde(default = "patch_action")]
    pub action: String,
    pub ops: Vec<PatchOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl PatchEnvelope {
    pub fn new(ops: Vec<PatchOperation>) -> Self {
        Self {
            action: patch_action(),
            ops,
            session_id: None,
            batch_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Action of a producer intent, parsed from its `action` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntentAction {
    ShowPanel,
    UpdatePanel,
    RemovePanel,
    Patch,
    /// Status, messages and other actions that never touch panel state.
    Administrative(String),
}

impl IntentAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "show_panel" => Self::ShowPanel,
            "update_panel" => Self::UpdatePanel,
            "remove_panel" => Self::RemovePanel,
            "patch" => Self::Patch,
            other => Self::Administrative(other.to_string()),
        }
    }
}

/// High-level producer instruction, translated into patch operations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PanelData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Intent {
    fn build(action: &str) -> Self {
        Self {
            action: action.to_string(),
            panel: None,
            id: None,
            data: None,
            message: None,
        }
    }

    pub fn show_panel(kind: impl Into<String>, data: PanelData) -> Self {
        Self {
            panel: Some(kind.into()),
            data: Some(data),
            ..Self::build("show_panel")
        }
    }

    pub fn update_panel(id: impl Into<String>, data: PanelData) -> Self {
        Self {
            id: Some(id.into()),
            data: Some(data),
            ..Self::build("update_panel")
        }
    }

    pub fn remove_panel(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::build("remove_panel")
        }
    }

    /// Raw operations wrapped as an intent (`data.ops`).
    pub fn patch(ops: Vec<PatchOperation>) -> Self {
        let mut data = PanelData::new();
        data.insert(
            "ops".to_string(),
            serde_json::to_value(ops).unwrap_or(Value::Array(Vec::new())),
        );
        Self {
            data: Some(data),
            ..Self::build("patch")
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            ..Self::build("status")
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn kind(&self) -> IntentAction {
        IntentAction::parse(&self.action)
    }
}

/// Operating mode selecting the budget ceilings for a run.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    #[serde(alias = "conservative")]
    Stable,
    #[serde(alias = "exploratory")]
    Deep,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Deep => "deep",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stable" | "conservative" => Ok(Self::Stable),
            "deep" | "exploratory" => Ok(Self::Deep),
            other => Err(format!("unknown run mode: {}", other)),
        }
    }
}

/// Validated UI state. Each successful patch yields a new value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DashboardState {
    #[serde(default)]
    pub panels: Vec<Panel>,
    #[serde(alias = "module")]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub safe_mode: bool,
    #[serde(default)]
    pub error_count: u32,
}

impl DashboardState {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            panels: Vec::new(),
            context: context.into(),
            session_id: None,
            safe_mode: false,
            error_count: 0,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.panels.iter().position(|p| p.id == id)
    }

    pub fn find(&self, id: &str) -> Option<&Panel> {
        self.panels.iter().find(|p| p.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn panel_ids(&self) -> Vec<&str> {
        self.panels.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn count_of_kind(&self, kind: &str) -> usize {
        self.panels.iter().filter(|p| p.kind == kind).count()
    }

    pub fn len(&self) -> usize {
        self.panels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }
}
