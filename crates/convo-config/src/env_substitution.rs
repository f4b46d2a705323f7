use convo_core::{ConvoError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::env;

// ${VAR} and ${VAR:-default}
static ENV_VAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("Invalid regex pattern")
});

/// Recursively substitute environment variables in string leaves of a
/// parsed configuration document.
pub fn substitute_env_vars(value: &mut Value) -> Result<()> {
    match value {
        Value::String(s) => {
            *s = substitute_in_string(s)?;
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_in_string(input: &str) -> Result<String> {
    let mut missing_vars = Vec::new();

    let result = ENV_VAR_REGEX.replace_all(input, |cap: &regex::Captures| {
        let var_name = &cap[1];
        match (env::var(var_name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing_vars.push(var_name.to_string());
                String::new()
            }
        }
    });

    if !missing_vars.is_empty() {
        return Err(ConvoError::ConfigError(format!(
            "Missing required environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substitute_env_vars() {
        env::set_var("CONVO_SUBST_TEST_VAR", "test_value");

        let mut value = json!({
            "path": "${CONVO_SUBST_TEST_VAR}/some/path",
            "default": "${CONVO_SUBST_NON_EXISTENT:-default_value}",
            "nested": {
                "value": "${CONVO_SUBST_TEST_VAR}"
            },
            "count": 3
        });

        substitute_env_vars(&mut value).unwrap();

        assert_eq!(value["path"], "test_value/some/path");
        assert_eq!(value["default"], "default_value");
        assert_eq!(value["nested"]["value"], "test_value");
        assert_eq!(value["count"], 3);

        env::remove_var("CONVO_SUBST_TEST_VAR");
    }

    #[test]
    fn test_missing_variable_is_reported() {
        let mut value = json!({"key": "${CONVO_SUBST_DEFINITELY_UNSET}"});
        let err = substitute_env_vars(&mut value).unwrap_err();
        assert!(err.to_string().contains("CONVO_SUBST_DEFINITELY_UNSET"));
    }
}
