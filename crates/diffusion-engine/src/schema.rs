//! Panel and state validation schemas
//!
//! Each kind may declare a data schema. Kinds without one only require `data`
//! to be an object. Unknown extra fields are always allowed.

use crate::registry::Registry;
use diffusion_core::{ApplyError, DashboardState, Panel, PanelData, SAFE_MODE_PANEL};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub enum FieldKind {
    Str,
    Number { min: Option<f64>, max: Option<f64> },
    Bool,
    OneOf(&'static [&'static str]),
    List(Box<FieldKind>),
    Object(Vec<Field>),
    AnyObject,
    Any,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

fn req(name: &'static str, kind: FieldKind) -> Field {
    Field { name, kind, required: true }
}

fn opt(name: &'static str, kind: FieldKind) -> Field {
    Field { name, kind, required: false }
}

fn list(kind: FieldKind) -> FieldKind {
    FieldKind::List(Box::new(kind))
}

fn number() -> FieldKind {
    FieldKind::Number { min: None, max: None }
}

fn ranged(min: f64, max: f64) -> FieldKind {
    FieldKind::Number { min: Some(min), max: Some(max) }
}

/// Declarative schema for one panel kind's `data` object.
#[derive(Debug, Clone)]
pub struct DataSchema {
    pub fields: Vec<Field>,
}

fn build_schemas() -> HashMap<&'static str, DataSchema> {
    let factor = FieldKind::Object(vec![
        req("factor", FieldKind::Str),
        req("weight", FieldKind::OneOf(&["substantial", "moderate", "limited"])),
        opt("description", FieldKind::Str),
    ]);
    let point = FieldKind::Object(vec![
        req("lat", ranged(-90.0, 90.0)),
        req("lng", ranged(-180.0, 180.0)),
    ]);

    let mut m = HashMap::new();
    m.insert("applicable_policies", DataSchema { fields: vec![
        req("policies", list(FieldKind::Object(vec![
            req("id", FieldKind::Str),
            req("title", FieldKind::Str),
            opt("text", FieldKind::Str),
            opt("relevance", ranged(0.0, 1.0)),
            opt("source", FieldKind::Str),
        ]))),
    ]});
    m.insert("precedents", DataSchema { fields: vec![
        req("cases", list(FieldKind::Object(vec![
            req("ref", FieldKind::Str),
            req("title", FieldKind::Str),
            opt("decision", FieldKind::Str),
            opt("relevance", ranged(0.0, 1.0)),
            opt("url", FieldKind::Str),
        ]))),
    ]});
    m.insert("key_issues_matrix", DataSchema { fields: vec![
        req("issues", list(FieldKind::Object(vec![
            req("id", FieldKind::Str),
            req("topic", FieldKind::Str),
            req("concern", FieldKind::Str),
            req("policies", list(FieldKind::Str)),
            opt("weight", FieldKind::OneOf(&["major", "moderate", "minor"])),
        ]))),
    ]});
    m.insert("planning_balance", DataSchema { fields: vec![
        req("benefits", list(factor.clone())),
        req("harms", list(factor)),
        opt("overall", FieldKind::OneOf(&["approve", "refuse", "marginal"])),
    ]});
    m.insert("draft_decision", DataSchema { fields: vec![
        req("recommendation", FieldKind::OneOf(&["approve", "refuse", "defer"])),
        req("reasons", list(FieldKind::Str)),
        opt("conditions", list(FieldKind::Str)),
        opt("informatives", list(FieldKind::Str)),
    ]});
    m.insert("evidence_snapshot", DataSchema { fields: vec![
        opt("site", FieldKind::AnyObject),
        req("constraints", list(FieldKind::Object(vec![
            req("type", FieldKind::Str),
            req("description", FieldKind::Str),
            opt("severity", FieldKind::OneOf(&["high", "medium", "low"])),
        ]))),
        opt("docs", list(FieldKind::AnyObject)),
    ]});
    m.insert("map", DataSchema { fields: vec![req("center", point)] });
    m.insert("doc_viewer", DataSchema { fields: vec![req("doc_id", FieldKind::Str)] });
    m.insert(SAFE_MODE_PANEL, DataSchema { fields: vec![
        req("reason", FieldKind::Str),
        req("errorCount", number()),
        req("timestamp", number()),
        req("message", FieldKind::Str),
    ]});
    m
}

pub fn data_schema(kind: &str) -> Option<&'static DataSchema> {
    static SCHEMAS: OnceLock<HashMap<&'static str, DataSchema>> = OnceLock::new();
    SCHEMAS.get_or_init(build_schemas).get(kind)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_fields(fields: &[Field], obj: &PanelData, at: &str) -> Result<(), String> {
    for field in fields {
        let path = if at.is_empty() { field.name.to_string() } else { format!("{}.{}", at, field.name) };
        match obj.get(field.name) {
            None | Some(Value::Null) if field.required => {
                return Err(format!("{}: required", path));
            }
            None | Some(Value::Null) => {}
            Some(v) => check_value(&field.kind, v, &path)?,
        }
    }
    Ok(())
}

fn check_value(kind: &FieldKind, v: &Value, at: &str) -> Result<(), String> {
    let mismatch = |want: &str| Err(format!("{}: expected {}, got {}", at, want, type_name(v)));
    match kind {
        FieldKind::Any => Ok(()),
        FieldKind::Str => if v.is_string() { Ok(()) } else { mismatch("string") },
        FieldKind::Bool => if v.is_boolean() { Ok(()) } else { mismatch("boolean") },
        FieldKind::Number { min, max } => {
            let Some(n) = v.as_f64() else { return mismatch("number") };
            if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                return Err(format!(
                    "{}: {} out of range [{}, {}]",
                    at,
                    n,
                    min.map(|m| m.to_string()).unwrap_or_else(|| "-inf".into()),
                    max.map(|m| m.to_string()).unwrap_or_else(|| "inf".into()),
                ));
            }
            Ok(())
        }
        FieldKind::OneOf(allowed) => match v.as_str() {
            Some(s) if allowed.iter().any(|a| *a == s) => Ok(()),
            Some(s) => Err(format!("{}: \"{}\" is not one of {:?}", at, s, allowed)),
            None => mismatch("string"),
        },
        FieldKind::List(item) => {
            let Some(items) = v.as_array() else { return mismatch("array") };
            for (i, it) in items.iter().enumerate() {
                check_value(item, it, &format!("{}[{}]", at, i))?;
            }
            Ok(())
        }
        FieldKind::Object(fields) => {
            let Some(obj) = v.as_object() else { return mismatch("object") };
            check_fields(fields, obj, at)
        }
        FieldKind::AnyObject => if v.is_object() { Ok(()) } else { mismatch("object") },
    }
}

/// Validate a panel payload against its kind's schema.
pub fn validate_panel_data(kind: &str, data: &PanelData) -> Result<(), ApplyError> {
    match data_schema(kind) {
        Some(schema) => check_fields(&schema.fields, data, "")
            .map_err(|e| ApplyError::validation(format!("invalid {} data: {}", kind, e))),
        None => Ok(()),
    }
}

/// Parse an operation value into a panel. Shape errors are validation errors.
pub fn parse_panel(value: &Value) -> Result<Panel, ApplyError> {
    serde_json::from_value(value.clone())
        .map_err(|e| ApplyError::validation(format!("malformed panel: {}", e)))
}

/// Full panel validation: identity fields, registered kind, data schema.
pub fn validate_panel(panel: &Panel, registry: &Registry) -> Result<(), ApplyError> {
    if panel.id.trim().is_empty() {
        return Err(ApplyError::validation("panel id must not be empty"));
    }
    if panel.id == "-" {
        return Err(ApplyError::validation("panel id \"-\" is reserved for append"));
    }
    if panel.kind.trim().is_empty() {
        return Err(ApplyError::validation("panel type must not be empty"));
    }
    if !registry.is_panel_type_allowed(&panel.kind) {
        return Err(ApplyError::validation(format!("unknown panel type: {}", panel.kind)));
    }
    if panel.timestamp <= 0 {
        return Err(ApplyError::validation(format!(
            "panel {} timestamp must be positive, got {}",
            panel.id, panel.timestamp
        )));
    }
    validate_panel_data(&panel.kind, &panel.data)
}

/// Whole-state validation, run before any new state is published.
pub fn validate_state(state: &DashboardState, registry: &Registry) -> Result<(), ApplyError> {
    if state.context.trim().is_empty() {
        return Err(ApplyError::validation("state context must not be empty"));
    }
    let mut seen = HashSet::new();
    for panel in &state.panels {
        if !seen.insert(panel.id.as_str()) {
            return Err(ApplyError::validation(format!("duplicate panel id: {}", panel.id)));
        }
        validate_panel(panel, registry)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(v: Value) -> PanelData {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_policy_list_is_valid() {
        assert!(validate_panel_data("applicable_policies", &data(json!({"policies": []}))).is_ok());
    }

    #[test]
    fn missing_required_field_names_the_path() {
        let err = validate_panel_data(
            "applicable_policies",
            &data(json!({"policies": [{"id": "H1"}]})),
        )
        .unwrap_err();
        assert!(err.message.contains("policies[0].title"), "{}", err.message);
    }

    #[test]
    fn relevance_range_is_enforced() {
        let bad = data(json!({"cases": [{"ref": "A/1", "title": "t", "relevance": 1.5}]}));
        assert!(validate_panel_data("precedents", &bad).is_err());
    }

    #[test]
    fn append_marker_is_not_a_panel_id() {
        let reg = Registry::default();
        let panel = Panel::new("-", "doc_viewer", data(json!({"doc_id": "x"})), 1000);
        assert!(validate_panel(&panel, &reg).unwrap_err().message.contains("reserved"));
    }

    #[test]
    fn kinds_without_schema_accept_any_object() {
        assert!(validate_panel_data("consultation_themes", &data(json!({"anything": 1}))).is_ok());
    }
}
