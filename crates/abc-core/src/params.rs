//! Hierarchical parameter trees addressed by dotted leaf paths.
//!
//! Priors and perturbation kernels address leaves of the simulator's
//! nested default parameter tree by path, e.g.
//! `infectiousness_rate_fn.EmpiricalFromFile.scale`. Sampled leaf values
//! are merged back into the baseline tree with a recursive key-ordered
//! merge before the parameter file is written for the simulator.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AbcError, ErrorInfo};

/// Ordered path segments addressing one leaf in a nested parameter tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamPath(String);

impl ParamPath {
    /// Parses a dotted path such as `a.b.c`. Empty paths or empty
    /// segments are configuration errors.
    pub fn parse(raw: &str) -> Result<Self, AbcError> {
        if raw.is_empty() || raw.split('.').any(str::is_empty) {
            return Err(AbcError::Config(
                ErrorInfo::new("param-path-malformed", "parameter path has empty segments")
                    .with_context("path", raw),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    /// Returns the path segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Returns the dotted string form of the path.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Flattened leaf values of one sampled parameter set, keyed by path.
pub type ParamValues = BTreeMap<ParamPath, f64>;

/// Reads the numeric leaf at `path` from a nested tree.
pub fn get_leaf(tree: &Value, path: &ParamPath) -> Result<f64, AbcError> {
    let mut node = tree;
    for segment in path.segments() {
        node = node.get(segment).ok_or_else(|| {
            AbcError::Config(
                ErrorInfo::new("param-path-unknown", "path not found in parameter tree")
                    .with_context("path", path.as_str()),
            )
        })?;
    }
    node.as_f64().ok_or_else(|| {
        AbcError::Config(
            ErrorInfo::new("param-leaf-not-numeric", "path does not address a numeric leaf")
                .with_context("path", path.as_str()),
        )
    })
}

/// Reassembles sampled leaf values into a nested tree shaped like the
/// paths themselves, then key-order merges it over `baseline`.
pub fn materialize(baseline: &Value, values: &ParamValues) -> Result<Value, AbcError> {
    let mut overlay = Value::Object(Map::new());
    for (path, value) in values {
        insert_leaf(&mut overlay, path, *value)?;
    }
    Ok(merge(baseline, &overlay))
}

fn insert_leaf(tree: &mut Value, path: &ParamPath, value: f64) -> Result<(), AbcError> {
    let segments: Vec<&str> = path.segments().collect();
    let mut node = tree;
    for segment in &segments[..segments.len() - 1] {
        let map = node.as_object_mut().ok_or_else(|| {
            AbcError::Config(
                ErrorInfo::new("param-path-conflict", "path crosses a non-object node")
                    .with_context("path", path.as_str()),
            )
        })?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = node.as_object_mut().ok_or_else(|| {
        AbcError::Config(
            ErrorInfo::new("param-path-conflict", "path crosses a non-object node")
                .with_context("path", path.as_str()),
        )
    })?;
    let leaf = segments[segments.len() - 1];
    map.insert(leaf.to_string(), leaf_value(value));
    Ok(())
}

fn leaf_value(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Recursive key-ordered merge: object keys of `overlay` override or
/// extend `base`; any non-object overlay value replaces the base value.
pub fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged: BTreeMap<String, Value> = base_map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for (key, value) in overlay_map {
                let entry = match merged.get(key) {
                    Some(existing) => merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), entry);
            }
            Value::Object(merged.into_iter().collect())
        }
        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_rejects_empty_segments() {
        assert!(ParamPath::parse("a..b").is_err());
        assert!(ParamPath::parse("").is_err());
        assert!(ParamPath::parse("a.b.c").is_ok());
    }

    #[test]
    fn merge_is_recursive_and_key_ordered() {
        let base = json!({"b": {"x": 1.0, "y": 2.0}, "a": 0.5});
        let overlay = json!({"b": {"y": 9.0, "z": 3.0}});
        let merged = merge(&base, &overlay);
        assert_eq!(merged, json!({"a": 0.5, "b": {"x": 1.0, "y": 9.0, "z": 3.0}}));
        let keys: Vec<_> = merged.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn materialize_overrides_baseline_leaves() {
        let baseline = json!({"rate_fn": {"scale": 1.0, "file": "rates.csv"}, "pop": 1000});
        let mut values = ParamValues::new();
        values.insert(ParamPath::parse("rate_fn.scale").unwrap(), 0.25);
        let tree = materialize(&baseline, &values).unwrap();
        let path = ParamPath::parse("rate_fn.scale").unwrap();
        assert_eq!(get_leaf(&tree, &path).unwrap(), 0.25);
        assert_eq!(tree["rate_fn"]["file"], json!("rates.csv"));
        assert_eq!(tree["pop"], json!(1000));
    }

    #[test]
    fn get_leaf_reports_unknown_paths() {
        let tree = json!({"a": {"b": 1.0}});
        let path = ParamPath::parse("a.c").unwrap();
        let err = get_leaf(&tree, &path).unwrap_err();
        assert_eq!(err.info().code, "param-path-unknown");
    }
}
