//! Encoding a configuration value as container environment variables.
//!
//! Nested fields become dotted paths and the whole key is upper-cased under a
//! prefix, so `{"database": {"port": 5432}}` with prefix `app` turns into
//! `APP_DATABASE.PORT=5432`. Array elements use their index as a path segment.
//! Unset and zero values (null, `""`, `0`, `false`, empty collections) are
//! left out so the application falls back to its own defaults.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Number, Value};

use crate::error::Result;

/// `PREFIX_PATH=value` entries for every non-zero leaf of `config`, sorted by key.
pub fn config_to_env_vars<T: Serialize + ?Sized>(config: &T, prefix: &str) -> Result<Vec<String>> {
    let value = serde_json::to_value(config)?;
    let mut leaves = BTreeMap::new();
    flatten(&value, String::new(), &mut leaves);

    let prefix = prefix.to_uppercase();
    Ok(leaves
        .into_iter()
        .map(|(path, value)| match (prefix.is_empty(), path.is_empty()) {
            (_, true) => format!("{}={}", prefix, value),
            (true, false) => format!("{}={}", path.to_uppercase(), value),
            (false, false) => format!("{}_{}={}", prefix, path.to_uppercase(), value),
        })
        .collect())
}

fn flatten(value: &Value, path: String, leaves: &mut BTreeMap<String, String>) {
    match value {
        Value::Null => {}
        Value::Bool(flag) => {
            if *flag {
                leaves.insert(path, "true".to_string());
            }
        }
        Value::Number(number) => {
            if !is_zero(number) {
                leaves.insert(path, number.to_string());
            }
        }
        Value::String(text) => {
            if !text.is_empty() {
                leaves.insert(path, text.clone());
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten(item, join(&path, &index.to_string()), leaves);
            }
        }
        Value::Object(fields) => {
            for (key, item) in fields {
                flatten(item, join(&path, key), leaves);
            }
        }
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

fn is_zero(number: &Number) -> bool {
    number.as_f64().map_or(false, |n| n == 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_fields_use_dotted_paths() {
        let vars = config_to_env_vars(
            &json!({
                "database": {"address": "10.0.0.2", "port": 5432},
                "moduleName": "billing",
            }),
            "app",
        )
        .unwrap();

        assert_eq!(
            vars,
            vec![
                "APP_DATABASE.ADDRESS=10.0.0.2".to_string(),
                "APP_DATABASE.PORT=5432".to_string(),
                "APP_MODULENAME=billing".to_string(),
            ]
        );
    }

    #[test]
    fn test_zero_values_are_skipped() {
        let vars = config_to_env_vars(
            &json!({
                "empty": "",
                "zero": 0,
                "disabled": false,
                "missing": null,
                "nested": {},
                "list": [],
                "enabled": true,
                "ratio": 0.5,
            }),
            "APP",
        )
        .unwrap();

        assert_eq!(vars, vec!["APP_ENABLED=true".to_string(), "APP_RATIO=0.5".to_string()]);
    }

    #[test]
    fn test_array_elements_are_indexed() {
        let vars = config_to_env_vars(&json!({"hosts": ["a", "b"]}), "APP_REMOTE").unwrap();
        assert_eq!(
            vars,
            vec!["APP_REMOTE_HOSTS.0=a".to_string(), "APP_REMOTE_HOSTS.1=b".to_string()]
        );
    }

    #[test]
    fn test_typed_struct() {
        #[derive(Serialize)]
        struct Limits {
            max_connections: u32,
            timeout_ms: u64,
        }

        let vars = config_to_env_vars(
            &Limits {
                max_connections: 10,
                timeout_ms: 0,
            },
            "svc",
        )
        .unwrap();
        assert_eq!(vars, vec!["SVC_MAX_CONNECTIONS=10".to_string()]);
    }
}
