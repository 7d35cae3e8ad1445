use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Typed branch condition evaluated against a step's result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BranchPredicate {
    /// `result.<field> == "<value>"`
    Equals { field: String, value: String },
    /// `result.<field> == <expected>`
    Flag { field: String, expected: bool },
}

impl BranchPredicate {
    /// `None` when the result cannot answer the question: not an object, the
    /// field is missing, or the field has the wrong type.
    pub fn evaluate(&self, result: &Value) -> Option<bool> {
        if !result.is_object() {
            return None;
        }
        match self {
            BranchPredicate::Equals { field, value } => {
                lookup_path(result, field)?.as_str().map(|actual| actual == value)
            }
            BranchPredicate::Flag { field, expected } => lookup_path(result, field)?
                .as_bool()
                .map(|actual| actual == *expected),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            BranchPredicate::Equals { field, .. } | BranchPredicate::Flag { field, .. } => field,
        }
    }
}

/// Walks `a.b.c` through nested JSON objects.
pub fn lookup_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Same walk, rooted at a key/value bag instead of a JSON value.
pub fn lookup_map_path<'v>(map: &'v Map<String, Value>, path: &str) -> Option<&'v Value> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let root = map.get(head)?;
    match rest {
        Some(rest) => lookup_path(root, rest),
        None => Some(root),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equals_matches_string_fields() {
        let predicate = BranchPredicate::Equals {
            field: "verdict".to_string(),
            value: "pass".to_string(),
        };
        assert_eq!(predicate.evaluate(&json!({"verdict": "pass"})), Some(true));
        assert_eq!(predicate.evaluate(&json!({"verdict": "fail"})), Some(false));
        assert_eq!(predicate.evaluate(&json!({"verdict": true})), None);
        assert_eq!(predicate.evaluate(&json!({})), None);
    }

    #[test]
    fn flag_matches_boolean_fields() {
        let predicate = BranchPredicate::Flag {
            field: "review.approved".to_string(),
            expected: true,
        };
        assert_eq!(
            predicate.evaluate(&json!({"review": {"approved": true}})),
            Some(true)
        );
        assert_eq!(
            predicate.evaluate(&json!({"review": {"approved": false}})),
            Some(false)
        );
        assert_eq!(predicate.evaluate(&json!("approved")), None);
    }

    #[test]
    fn predicates_parse_from_tagged_yaml() {
        let predicate: BranchPredicate =
            serde_yaml::from_str("kind: flag\nfield: approved\nexpected: false\n")
                .expect("parse predicate");
        assert_eq!(
            predicate,
            BranchPredicate::Flag {
                field: "approved".to_string(),
                expected: false
            }
        );
    }

    #[test]
    fn lookup_path_stops_at_non_objects() {
        let value = json!({"a": {"b": [1, 2]}});
        assert_eq!(lookup_path(&value, "a.b"), Some(&json!([1, 2])));
        assert_eq!(lookup_path(&value, "a.b.c"), None);
        assert_eq!(lookup_path(&value, "missing"), None);
    }
}
