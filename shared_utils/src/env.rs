//! Environment variable lookups.

use thiserror::Error;

/// An environment variable required by the application is not set.
#[derive(Debug, Error)]
#[error("Missing environment variable: {0}")]
pub struct MissingEnvVarError(pub String);

/// Reads an environment variable, returning a structured error if it's missing.
///
/// # Arguments
/// * `name` - The name of the environment variable to read.
pub fn get_env_var(name: &str) -> Result<String, MissingEnvVarError> {
    std::env::var(name).map_err(|_| MissingEnvVarError(name.to_string()))
}

/// Reads an optional environment variable; unset and empty values are both `None`.
pub fn get_env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Interprets an environment variable as a boolean switch.
///
/// `1`, `true`, `yes` and `on` (any case) are truthy; anything else, including
/// an unset variable, is `false`.
pub fn env_flag(name: &str) -> bool {
    get_env_var_opt(name).is_some_and(|v| parse_flag(&v))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(parse_flag(v), "{v} should be truthy");
        }
        for v in ["0", "false", "", "nope"] {
            assert!(!parse_flag(v), "{v} should be falsy");
        }
    }

    #[test]
    fn missing_var_is_reported_by_name() {
        let err = get_env_var("RECORD_BUILDER_SURELY_UNSET_VAR").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing environment variable: RECORD_BUILDER_SURELY_UNSET_VAR"
        );
        assert!(get_env_var_opt("RECORD_BUILDER_SURELY_UNSET_VAR").is_none());
        assert!(!env_flag("RECORD_BUILDER_SURELY_UNSET_VAR"));
    }
}
