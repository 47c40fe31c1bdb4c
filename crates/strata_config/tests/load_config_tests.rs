use std::env;
use std::fs;

use strata_config::{load_config_from, AppConfig};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).expect("failed to write config fixture");
}

#[test]
fn test_missing_files_yield_defaults() {
    let dir = TempDir::new().expect("tempdir");

    let config = load_config_from(dir.path(), "nonexistent").expect("load should succeed");

    let defaults = AppConfig::default();
    assert_eq!(config.repository.default_options, defaults.repository.default_options);
    assert_eq!(config.repository.monitoring, defaults.repository.monitoring);
    assert!(config.database.is_none());
}

#[test]
fn test_environment_file_overrides_default_file() {
    let dir = TempDir::new().expect("tempdir");
    write(
        &dir,
        "default.toml",
        r#"
[database]
url = "sqlite:data/strata.db"
max_connections = 4

[repository.default_options]
soft_delete = false
cache_ttl_ms = 1000

[repository.monitoring]
slow_query_threshold_ms = 250
"#,
    );
    write(
        &dir,
        "staging.toml",
        r#"
[database]
url = "sqlite:data/staging.db"

[repository.default_options]
soft_delete = true
"#,
    );

    let config = load_config_from(dir.path(), "staging").expect("load should succeed");

    let database = config.database.expect("database section present");
    assert_eq!(database.url, "sqlite:data/staging.db");
    assert_eq!(database.max_connections, 4);
    assert!(config.repository.default_options.soft_delete);
    assert_eq!(config.repository.default_options.cache_ttl_ms, 1000);
    assert_eq!(config.repository.monitoring.slow_query_threshold_ms, 250);
    assert!(config.repository.monitoring.enabled);
}

#[test]
fn test_env_var_overrides_file_value() {
    let dir = TempDir::new().expect("tempdir");
    write(
        &dir,
        "default.toml",
        r#"
[repository.cache]
max_size = 50
"#,
    );
    env::set_var("STRATA__REPOSITORY__CACHE__MAX_SIZE", "7");

    let config = load_config_from(dir.path(), "debug").expect("load should succeed");

    env::remove_var("STRATA__REPOSITORY__CACHE__MAX_SIZE");
    assert_eq!(config.repository.cache.max_size, 7);
}

#[test]
fn test_secret_marker_resolved_from_environment() {
    let dir = TempDir::new().expect("tempdir");
    write(
        &dir,
        "default.toml",
        r#"
[database]
url = "secret_from_env"
"#,
    );
    env::set_var("STRATA_SECRET_DATABASE_URL", "sqlite:secret.db");

    let config = load_config_from(dir.path(), "debug").expect("load should succeed");

    assert_eq!(
        config.database.map(|db| db.url),
        Some("sqlite:secret.db".to_string())
    );
}
