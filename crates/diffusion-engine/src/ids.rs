//! Deterministic panel identifiers
//!
//! Ids are a pure function of panel kind and semantic content, never of time
//! or arrival order, so the same logical panel gets the same id within and
//! across runs. That is what lets `show_panel` upsert instead of duplicating.
//!
//! Id format: `kind`, `kind_<hash8>`, `kind_<hash8>_<index>` or `kind_<index>`,
//! where `hash8` is the first 8 hex chars of SHA-256 over the content key.
//!
//! Content key strategies (equivalence classes are what matter):
//!
//! | kind                | key                                           |
//! |---------------------|-----------------------------------------------|
//! | applicable_policies | sorted `policies[].id` joined by `,`          |
//! | precedents          | sorted `cases[].ref` joined by `,`            |
//! | doc_viewer          | `doc_id`                                      |
//! | policy_editor       | `policy_id`                                   |
//! | scenario_compare    | sorted `scenarios[].id` joined by `_vs_`      |
//! | map                 | `center.lat,center.lng` at 4 decimals         |
//! | evidence_snapshot   | `site.lat,site.lng` at 4 decimals             |

use diffusion_core::PanelData;
use ring::digest;
use serde_json::Value;

/// First 8 lowercase hex chars of SHA-256(`s`).
pub fn hash_string(s: &str) -> String {
    let d = digest::digest(&digest::SHA256, s.as_bytes());
    d.as_ref()[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn generate_panel_id(kind: &str, content_key: Option<&str>, index: Option<usize>) -> String {
    let key = content_key.filter(|k| !k.is_empty());
    match (key, index) {
        (None, None) => kind.to_string(),
        (Some(k), None) => format!("{}_{}", kind, hash_string(k)),
        (Some(k), Some(i)) => format!("{}_{}_{}", kind, hash_string(k), i),
        (None, Some(i)) => format!("{}_{}", kind, i),
    }
}

/// Sorted, non-empty string values of `field` across the objects in `data[list]`.
fn sorted_refs(data: &PanelData, list: &str, field: &str) -> Vec<String> {
    let mut refs: Vec<String> = data
        .get(list)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get(field).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    refs.sort();
    refs
}

fn joined(refs: Vec<String>, sep: &str) -> Option<String> {
    if refs.is_empty() {
        None
    } else {
        Some(refs.join(sep))
    }
}

fn coordinates(data: &PanelData, field: &str) -> Option<String> {
    let point = data.get(field)?.as_object()?;
    let lat = point.get("lat")?.as_f64()?;
    let lng = point.get("lng")?.as_f64()?;
    Some(format!("{:.4},{:.4}", lat, lng))
}

fn string_field(data: &PanelData, field: &str) -> Option<String> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Derive an order-independent content key from a panel payload.
pub fn extract_content_key(kind: &str, data: &PanelData) -> Option<String> {
    match kind {
        "applicable_policies" => joined(sorted_refs(data, "policies", "id"), ","),
        "precedents" => joined(sorted_refs(data, "cases", "ref"), ","),
        "doc_viewer" => string_field(data, "doc_id"),
        "policy_editor" => string_field(data, "policy_id"),
        "scenario_compare" => joined(sorted_refs(data, "scenarios", "id"), "_vs_"),
        "map" => coordinates(data, "center"),
        "evidence_snapshot" => coordinates(data, "site"),
        _ => None,
    }
}

pub fn generate_panel_id_from_data(kind: &str, data: &PanelData, index: Option<usize>) -> String {
    let key = extract_content_key(kind, data);
    generate_panel_id(kind, key.as_deref(), index)
}

pub fn matches_panel_id(panel_id: &str, kind: &str, content_key: Option<&str>) -> bool {
    let expected = generate_panel_id(kind, content_key, None);
    panel_id == expected || panel_id.starts_with(&format!("{}_", expected))
}

fn looks_like_hash(s: &str) -> bool {
    s.len() == 8 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Recover the kind from an id, stripping a trailing index and hash.
pub fn panel_kind_from_id(panel_id: &str) -> &str {
    let mut kind = panel_id;
    if let Some((head, last)) = kind.rsplit_once('_') {
        if !last.is_empty() && last.chars().all(|c| c.is_ascii_digit()) {
            kind = head;
        }
    }
    if let Some((head, last)) = kind.rsplit_once('_') {
        if looks_like_hash(last) {
            kind = head;
        }
    }
    kind
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(v: Value) -> PanelData {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn bare_kind_without_key_or_index() {
        assert_eq!(generate_panel_id("applicable_policies", None, None), "applicable_policies");
    }

    #[test]
    fn empty_key_counts_as_no_key() {
        assert_eq!(generate_panel_id("map", Some(""), None), "map");
        assert_eq!(generate_panel_id("map", Some(""), Some(2)), "map_2");
    }

    #[test]
    fn hash_is_eight_lower_hex() {
        let h = hash_string("appeal_case_123");
        assert_eq!(h.len(), 8);
        assert!(looks_like_hash(&h));
    }

    #[test]
    fn keyed_and_indexed_ids() {
        let keyed = generate_panel_id("doc_viewer", Some("LP_2024"), None);
        let indexed = generate_panel_id("doc_viewer", Some("LP_2024"), Some(1));
        assert!(keyed.starts_with("doc_viewer_"));
        assert_eq!(indexed, format!("{}_1", keyed));
    }

    #[test]
    fn policy_order_does_not_change_key() {
        let a = data(json!({"policies": [{"id": "H1"}, {"id": "D2"}]}));
        let b = data(json!({"policies": [{"id": "D2"}, {"id": "H1"}]}));
        assert_eq!(extract_content_key("applicable_policies", &a).as_deref(), Some("D2,H1"));
        assert_eq!(
            generate_panel_id_from_data("applicable_policies", &a, None),
            generate_panel_id_from_data("applicable_policies", &b, None)
        );
    }

    #[test]
    fn coordinates_round_to_four_places() {
        let a = data(json!({"center": {"lat": 51.50001, "lng": -0.12}}));
        assert_eq!(extract_content_key("map", &a).as_deref(), Some("51.5000,-0.1200"));
    }

    #[test]
    fn kind_roundtrips_through_id() {
        let id = generate_panel_id("key_issues_matrix", Some("x"), Some(3));
        assert_eq!(panel_kind_from_id(&id), "key_issues_matrix");
        assert_eq!(panel_kind_from_id("doc_viewer_2"), "doc_viewer");
        assert_eq!(panel_kind_from_id("map"), "map");
        assert!(matches_panel_id(&id, "key_issues_matrix", Some("x")));
    }
}
