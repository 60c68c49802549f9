//! Flattened metadata maps.
//!
//! Extractors return nested JSON objects. Everything downstream (activity
//! assembly, sidecars, the record document) works on a depth-one map whose
//! keys join the nested path with [`SEPARATOR`]. A flattened key can collide
//! with a literal key that already contains the separator; the first value in
//! document order wins and the collision is reported.

use indexmap::IndexMap;
use serde_json::Value;

/// Joins nested key segments.
pub const SEPARATOR: &str = " <> ";

/// Keys that describe a single file and are never hoisted into setup parameters.
pub const RESERVED_KEYS: [&str; 3] = ["DatasetType", "Creation Time", "Extractor Warnings"];

/// Depth-one metadata in document order.
pub type FlatMetadata = IndexMap<String, Value>;

/// Output of [`flatten`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flattened {
    /// The flattened map.
    pub map: FlatMetadata,
    /// Keys produced more than once; only the first value was kept.
    pub collisions: Vec<String>,
}

impl Flattened {
    /// One warning per collision, suitable for a dataset's warning list.
    pub fn collision_warnings(&self) -> Vec<String> {
        self.collisions
            .iter()
            .map(|k| format!("metadata key collision on {k:?}; kept first value"))
            .collect()
    }
}

/// True for keys that never leave the per-file map.
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Flatten `value` to depth one.
///
/// A non-object top level is stored under `"Value"`. Empty nested objects and
/// arrays are kept as leaf values.
pub fn flatten(value: &Value) -> Flattened {
    let mut out = Flattened::default();
    match value {
        Value::Object(obj) => {
            for (k, v) in obj {
                walk(k.clone(), v, &mut out);
            }
        }
        other => insert(&mut out, "Value".to_string(), other.clone()),
    }
    out
}

fn walk(prefix: String, v: &Value, out: &mut Flattened) {
    match v {
        Value::Object(obj) if !obj.is_empty() => {
            for (k, child) in obj {
                walk(format!("{prefix}{SEPARATOR}{k}"), child, out);
            }
        }
        leaf => insert(out, prefix, leaf.clone()),
    }
}

fn insert(out: &mut Flattened, key: String, value: Value) {
    if out.map.contains_key(&key) {
        tracing::debug!(key = %key, "flattening collision");
        out.collisions.push(key);
    } else {
        out.map.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_keys_join_with_separator() {
        let f = flatten(&json!({
            "Microscope": {"Voltage": 300, "Stage": {"Tilt": 1.5}},
            "Detector": "Ceta",
            "Empty": {},
            "List": [1, 2]
        }));
        assert!(f.collisions.is_empty());
        let keys: Vec<&str> = f.map.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            [
                "Microscope <> Voltage",
                "Microscope <> Stage <> Tilt",
                "Detector",
                "Empty",
                "List"
            ]
        );
        assert_eq!(f.map["Microscope <> Stage <> Tilt"], json!(1.5));
        assert_eq!(f.map["Empty"], json!({}));
    }

    #[test]
    fn first_value_wins_on_collision() {
        let f = flatten(&json!({
            "a <> b": "literal",
            "a": {"b": "nested"}
        }));
        assert_eq!(f.map["a <> b"], json!("literal"));
        assert_eq!(f.collisions, vec!["a <> b".to_string()]);
        assert_eq!(f.collision_warnings().len(), 1);
    }

    #[test]
    fn scalars_land_under_value() {
        let f = flatten(&json!(42));
        assert_eq!(f.map["Value"], json!(42));
    }

    #[test]
    fn reserved_keys() {
        assert!(is_reserved("DatasetType"));
        assert!(is_reserved("Extractor Warnings"));
        assert!(!is_reserved("Voltage"));
    }
}
