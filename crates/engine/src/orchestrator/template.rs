//! Template resolution for node configs.
//!
//! `config` is a JSON tree; any string leaf may contain `{{node_id.path}}`
//! tokens referencing an upstream node's output.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use thiserror::Error;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z0-9_-]+)\.([A-Za-z0-9_.-]+)\}\}").unwrap());

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template token '{{{{{0}}}}}' could not be resolved")]
    Unresolved(String),
}

/// Resolve every `{{node.path}}` token in `config` against `outputs`
/// (upstream node outputs, keyed by node id).
pub fn resolve(config: &Value, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
    match config {
        Value::String(s) => resolve_string(s, outputs),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|v| resolve(v, outputs))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve(value, outputs)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
    if let Some(caps) = TOKEN.captures(s) {
        if caps.get(0).unwrap().as_str() == s {
            let value = lookup(&caps[1], &caps[2], outputs)?;
            if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null) {
                return Ok(value);
            }
            return Ok(Value::String(stringify(&value)));
        }
    }

    let mut first_error = None;
    let substituted = TOKEN.replace_all(s, |caps: &Captures| match lookup(&caps[1], &caps[2], outputs) {
        Ok(value) => stringify(&value),
        Err(e) => {
            first_error.get_or_insert(e);
            String::new()
        }
    });

    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(Value::String(substituted.into_owned()))
}

fn lookup(node_id: &str, path: &str, outputs: &HashMap<String, Value>) -> Result<Value, TemplateError> {
    let token = || format!("{node_id}.{path}");
    let mut current = outputs.get(node_id).ok_or_else(|| TemplateError::Unresolved(token()))?;
    for segment in path.split('.') {
        current = current
            .get(segment)
            .ok_or_else(|| TemplateError::Unresolved(token()))?;
    }
    Ok(current.clone())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> HashMap<String, Value> {
        let mut m = HashMap::new();
        m.insert("B".to_string(), json!({ "v": 10, "label": "ten" }));
        m.insert("C".to_string(), json!({ "v": 20 }));
        m
    }

    #[test]
    fn whole_string_token_preserves_scalar_type() {
        let resolved = resolve(&json!("{{B.v}}"), &outputs()).unwrap();
        assert_eq!(resolved, json!(10));
    }

    #[test]
    fn embedded_token_is_stringified_in_place() {
        let resolved = resolve(&json!("value is {{B.v}}!"), &outputs()).unwrap();
        assert_eq!(resolved, json!("value is 10!"));
    }

    #[test]
    fn object_tree_is_resolved_recursively() {
        let config = json!({
            "from_b": "{{B.v}}",
            "from_c": "{{C.v}}",
            "nested": { "label": "{{B.label}}" },
        });
        let resolved = resolve(&config, &outputs()).unwrap();
        assert_eq!(resolved["from_b"], json!(10));
        assert_eq!(resolved["from_c"], json!(20));
        assert_eq!(resolved["nested"]["label"], json!("ten"));
    }

    #[test]
    fn missing_node_fails_with_unresolved() {
        let err = resolve(&json!("{{Z.v}}"), &outputs()).unwrap_err();
        assert_eq!(err, TemplateError::Unresolved("Z.v".into()));
    }

    #[test]
    fn missing_path_segment_fails_with_unresolved() {
        let err = resolve(&json!("{{B.missing}}"), &outputs()).unwrap_err();
        assert_eq!(err, TemplateError::Unresolved("B.missing".into()));
    }

    #[test]
    fn whole_string_token_resolving_to_object_is_stringified() {
        let mut outputs = HashMap::new();
        outputs.insert("B".to_string(), json!({ "nested": { "label": "ten", "v": 10 } }));
        let resolved = resolve(&json!("{{B.nested}}"), &outputs).unwrap();
        assert_eq!(resolved, json!(r#"{"label":"ten","v":10}"#));
    }

    #[test]
    fn non_template_strings_pass_through() {
        let resolved = resolve(&json!("plain string"), &outputs()).unwrap();
        assert_eq!(resolved, json!("plain string"));
    }
}
