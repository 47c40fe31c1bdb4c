//! Configuration models and loading for the Strata workspace.
//!
//! Sources are layered in this order, later ones winning:
//!
//! 1. `<config dir>/default.{toml,json,yaml}`
//! 2. `<config dir>/<RUN_ENV>.{toml,json,yaml}`
//! 3. `STRATA__<SECTION>__<KEY>` environment variables
//!
//! String values equal to `"secret_from_env"` are then replaced from
//! `STRATA_SECRET_<SECTION>_<KEY>`. A `.env` file is loaded once per process
//! before any lookup.

use config::{Config, ConfigError, Environment, File};
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod env_vars;
pub mod models;

pub use models::*;

/// Directory used when `CONFIG_DIR` is not set
pub const DEFAULT_CONFIG_DIR: &str = "config";

/// Environment used when `RUN_ENV` is not set
pub const DEFAULT_RUN_ENV: &str = "debug";

/// Loads the application configuration using `CONFIG_DIR` and `RUN_ENV`.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    ensure_dotenv_loaded();

    let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_RUN_ENV.to_string());

    load_config_from(config_dir, &run_env)
}

/// Loads the application configuration from an explicit directory and environment name.
pub fn load_config_from(config_dir: impl AsRef<Path>, run_env: &str) -> Result<AppConfig, ConfigError> {
    ensure_dotenv_loaded();

    let config_dir = config_dir.as_ref();
    let default_path = config_dir.join("default");
    let env_path = config_dir.join(run_env);

    debug!(
        default_path = %default_path.display(),
        env_path = %env_path.display(),
        "Loading configuration"
    );

    let builder = Config::builder()
        .add_source(File::from(default_path).required(false))
        .add_source(File::from(env_path).required(false))
        .add_source(
            Environment::with_prefix(&env_vars::get_config_prefix())
                .separator(env_vars::CONFIG_SEPARATOR)
                .try_parsing(true),
        );

    let mut raw: Value = builder.build()?.try_deserialize()?;
    if env_vars::inject_env_secrets(&mut raw) {
        debug!("Injected secrets from environment");
    }

    serde_json::from_value(raw).map_err(|e| ConfigError::Message(e.to_string()))
}

/// Replaces `"secret_from_env"` markers in an already built configuration.
pub fn apply_env_overrides_from_marker(config: AppConfig) -> Result<AppConfig, ConfigError> {
    let mut json = serde_json::to_value(&config).map_err(|e| ConfigError::Message(e.to_string()))?;
    env_vars::inject_env_secrets(&mut json);
    serde_json::from_value(json).map_err(|e| ConfigError::Message(e.to_string()))
}

static INIT_DOTENV: OnceCell<PathBuf> = OnceCell::new();

/// Loads a dotenv file into the process environment the first time it is called.
///
/// The file named by `DOTENV_OVERRIDE` is used when set, `.env` otherwise.
/// A missing file is fine; variables already set in the environment win.
///
/// # Returns
///
/// The dotenv path chosen on the first call.
pub fn ensure_dotenv_loaded() -> &'static Path {
    INIT_DOTENV.get_or_init(|| {
        let path = env::var_os("DOTENV_OVERRIDE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".env"));
        match dotenv::from_path(&path) {
            Ok(()) => debug!(path = %path.display(), "Loaded dotenv file"),
            Err(e) => debug!(path = %path.display(), "No dotenv file loaded: {}", e),
        }
        path
    })
}
