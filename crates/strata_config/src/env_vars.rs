//! Environment variable naming for Strata configuration.
//!
//! Two naming schemes are in use:
//!
//! * overrides: `STRATA__REPOSITORY__CACHE__MAX_SIZE` for `repository.cache.max_size`
//! * secrets: `STRATA_SECRET_DATABASE_URL` for `database.url`
//!
//! A configuration string equal to [`SECRET_MARKER`] is a placeholder that
//! [`inject_env_secrets`] fills from the secret variable of its path.

use serde_json::Value;
use std::env;
use tracing::{debug, warn};

pub const DEFAULT_PREFIX: &str = "STRATA";

pub const SECRET_PREFIX: &str = "STRATA_SECRET";

/// Separates path segments in override variables.
pub const CONFIG_SEPARATOR: &str = "__";

/// Separates path segments in secret variables.
pub const SECRET_SEPARATOR: &str = "_";

/// Placeholder for a value that must come from the environment.
pub const SECRET_MARKER: &str = "secret_from_env";

/// Override prefix, taken from `PREFIX` when set.
pub fn get_config_prefix() -> String {
    env::var("PREFIX").unwrap_or_else(|_| DEFAULT_PREFIX.to_string())
}

fn env_var_name(prefix: &str, separator: &str, path: &str) -> String {
    let mut name = String::from(prefix);
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        name.push_str(separator);
        name.push_str(segment);
    }
    name.to_uppercase()
}

/// `"database.url"` → `"STRATA__DATABASE__URL"`
pub fn config_path_to_env_var(path: &str) -> String {
    env_var_name(&get_config_prefix(), CONFIG_SEPARATOR, path)
}

/// `"database.url"` → `"STRATA_SECRET_DATABASE_URL"`
pub fn secret_path_to_env_var(path: &str) -> String {
    env_var_name(SECRET_PREFIX, SECRET_SEPARATOR, path)
}

pub fn get_config_env_var(path: &str) -> Option<String> {
    env::var(config_path_to_env_var(path)).ok()
}

pub fn get_secret_env_var(path: &str) -> Option<String> {
    env::var(secret_path_to_env_var(path)).ok()
}

/// Resolves every [`SECRET_MARKER`] in `value` from the environment.
///
/// Markers without a matching variable are left in place and logged.
///
/// # Returns
///
/// `true` when at least one marker was replaced.
pub fn inject_env_secrets(value: &mut Value) -> bool {
    let mut path = Vec::new();
    resolve_markers(value, &mut path)
}

fn resolve_markers(value: &mut Value, path: &mut Vec<String>) -> bool {
    match value {
        Value::Object(map) => {
            let mut replaced = false;
            for (key, child) in map.iter_mut() {
                path.push(key.clone());
                replaced |= resolve_markers(child, path);
                path.pop();
            }
            replaced
        }
        Value::Array(items) => {
            let mut replaced = false;
            for (idx, child) in items.iter_mut().enumerate() {
                path.push(idx.to_string());
                replaced |= resolve_markers(child, path);
                path.pop();
            }
            replaced
        }
        Value::String(current) if current == SECRET_MARKER => {
            let dotted = path.join(".");
            match get_secret_env_var(&dotted) {
                Some(secret) => {
                    *current = secret;
                    debug!(path = %dotted, "Resolved secret from environment");
                    true
                }
                None => {
                    warn!(
                        path = %dotted,
                        variable = %secret_path_to_env_var(&dotted),
                        "Secret placeholder has no environment variable"
                    );
                    false
                }
            }
        }
        _ => false,
    }
}
