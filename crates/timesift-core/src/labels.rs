use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{SketchId, UserId};

/// Document field holding sketch-scoped labels.
pub const LABEL_FIELD: &str = "timesketch_label";
/// Document field holding free-form tags.
pub const TAG_FIELD: &str = "tag";
pub const STAR_LABEL: &str = "__ts_star";
pub const COMMENT_LABEL: &str = "__ts_comment";

/// One label entry as stored on a document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub user_id: UserId,
    pub sketch_id: SketchId,
}

impl Label {
    pub fn new(name: impl Into<String>, user_id: UserId, sketch_id: SketchId) -> Self {
        Self {
            name: name.into(),
            user_id,
            sketch_id,
        }
    }
}

/// Apply a label to an existing label list.
///
/// With `toggle` the label is removed when present and added when absent.
/// Without it the label is asserted: adding an already present label leaves
/// the list unchanged.
pub fn apply_label(mut existing: Vec<Label>, label: Label, toggle: bool) -> Vec<Label> {
    let position = existing.iter().position(|l| *l == label);
    match (position, toggle) {
        (Some(idx), true) => {
            existing.remove(idx);
        }
        (Some(_), false) => {}
        (None, _) => existing.push(label),
    }
    existing
}

/// Decode the label list of a document body. A missing or null field is an
/// empty list.
pub fn labels_from_source(source: &Map<String, Value>) -> Result<Vec<Label>, serde_json::Error> {
    match source.get(LABEL_FIELD) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()),
    }
}

/// Partial document update replacing the label field.
pub fn label_update(labels: &[Label]) -> Map<String, Value> {
    let mut update = Map::new();
    update.insert(
        LABEL_FIELD.to_string(),
        serde_json::to_value(labels).unwrap_or_else(|_| Value::Array(Vec::new())),
    );
    update
}

/// Union of the tags already on a document and `new_tags`.
///
/// The stored field may be a list or a single string; non-string entries are
/// ignored. The result is deduplicated and sorted so repeated writes of the
/// same set are byte-identical.
pub fn merge_tags<S: AsRef<str>>(existing: Option<&Value>, new_tags: &[S]) -> Vec<String> {
    let mut merged: BTreeSet<String> = BTreeSet::new();
    match existing {
        Some(Value::Array(items)) => {
            merged.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)));
        }
        Some(Value::String(tag)) => {
            merged.insert(tag.clone());
        }
        _ => {}
    }
    merged.extend(new_tags.iter().map(|t| t.as_ref().to_string()));
    merged.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SYSTEM_USER;
    use serde_json::json;

    fn star(sketch: i64) -> Label {
        Label::new(STAR_LABEL, SYSTEM_USER, SketchId::from_raw(sketch))
    }

    #[test]
    fn toggle_removes_then_restores() {
        let once = apply_label(Vec::new(), star(1), true);
        assert_eq!(once, vec![star(1)]);
        let twice = apply_label(once, star(1), true);
        assert!(twice.is_empty());
        let thrice = apply_label(twice, star(1), true);
        assert_eq!(thrice, vec![star(1)]);
    }

    #[test]
    fn assert_without_toggle_is_idempotent() {
        let labels = apply_label(Vec::new(), star(1), false);
        let labels = apply_label(labels, star(1), false);
        assert_eq!(labels, vec![star(1)]);
    }

    #[test]
    fn labels_are_scoped_by_sketch() {
        let labels = apply_label(vec![star(1)], star(2), false);
        assert_eq!(labels.len(), 2);
        let labels = apply_label(labels, star(2), true);
        assert_eq!(labels, vec![star(1)]);
    }

    #[test]
    fn decode_missing_label_field() {
        let source = Map::new();
        assert!(labels_from_source(&source).unwrap().is_empty());
    }

    #[test]
    fn decode_and_encode_label_field() {
        let body = json!({
            "timesketch_label": [{"name": "__ts_star", "user_id": 0, "sketch_id": 3}]
        });
        let labels = labels_from_source(body.as_object().unwrap()).unwrap();
        assert_eq!(labels, vec![star(3)]);

        let update = label_update(&labels);
        assert_eq!(update[LABEL_FIELD], body[LABEL_FIELD]);
    }

    #[test]
    fn decode_rejects_garbage() {
        let body = json!({"timesketch_label": "not-a-list"});
        assert!(labels_from_source(body.as_object().unwrap()).is_err());
    }

    #[test]
    fn merge_tags_is_a_set_union() {
        let existing = json!(["malware", "reviewed"]);
        let merged = merge_tags(Some(&existing), &["reviewed", "Malware", "c2"]);
        assert_eq!(merged, vec!["Malware", "c2", "malware", "reviewed"]);
    }

    #[test]
    fn merge_tags_is_order_independent() {
        let a = merge_tags(None, &["x", "y", "z"]);
        let b = merge_tags(None, &["z", "x", "y", "x"]);
        assert_eq!(a, b);
    }

    #[test]
    fn merge_tags_accepts_scalar_field() {
        let existing = json!("legacy");
        assert_eq!(merge_tags(Some(&existing), &["new"]), vec!["legacy", "new"]);
    }
}
