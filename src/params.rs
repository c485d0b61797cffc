//! LLM parameter merging and metadata validation.

use serde_json::Value;

use crate::error::{Error, Result};

/// A flat map of model/call parameters (`model`, `max_tokens`, ...).
pub type Params = serde_json::Map<String, Value>;

/// Merge the three parameter sources into one flat map.
///
/// Later sources override earlier ones on key collision:
/// template-defined < client-wide < per-call. This is a single-level
/// override; nested objects are replaced wholesale, never deep-merged.
pub fn merge_parameters(template: &Params, client: &Params, call: &Params) -> Params {
    let mut merged = Params::new();
    for source in [template, client, call] {
        for (key, value) in source {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Validate that a metadata or feedback map holds only scalar values.
///
/// Raised before any I/O; nested structures are the caller's mistake.
pub fn validate_scalar_map(map: &Params) -> Result<()> {
    for (key, value) in map {
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
            _ => {
                return Err(Error::Client(format!(
                    "invalid value for key '{key}': value must be a string, number, or boolean"
                )))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_merge_precedence_call_wins() {
        let template = params(json!({"model": "gpt-3.5-turbo", "temperature": 0.2, "top_p": 1.0}));
        let client = params(json!({"model": "gpt-4", "temperature": 0.5}));
        let call = params(json!({"temperature": 0.9}));

        let merged = merge_parameters(&template, &client, &call);
        assert_eq!(merged["model"], json!("gpt-4"));
        assert_eq!(merged["temperature"], json!(0.9));
        assert_eq!(merged["top_p"], json!(1.0));
    }

    #[test]
    fn test_merge_is_flat_not_deep() {
        let template = params(json!({"nested": {"a": 1, "b": 2}}));
        let call = params(json!({"nested": {"a": 3}}));

        let merged = merge_parameters(&template, &Params::new(), &call);
        assert_eq!(merged["nested"], json!({"a": 3}));
    }

    #[test]
    fn test_validate_scalar_map_accepts_scalars() {
        let map = params(json!({"user": "amy", "age": 3, "beta": true}));
        assert!(validate_scalar_map(&map).is_ok());
    }

    #[test]
    fn test_validate_scalar_map_rejects_structures() {
        let map = params(json!({"tags": ["a", "b"]}));
        let err = validate_scalar_map(&map).unwrap_err();
        assert!(matches!(err, Error::Client(_)));
        assert!(err.to_string().contains("tags"));
    }
}
