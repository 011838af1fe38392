//! Configuration loading tests.
//!
//! Each test writes a TOML file and loads it through `Config::from_file`.

use std::io::Write;
use std::time::Duration;

use stratum_core::config::Config;
use stratum_core::error::ErrorCode;
use stratum_core::telemetry::LogFormat;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("stratum-config")
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn load(contents: &str) -> stratum_core::Result<Config> {
    let file = write_config(contents);
    Config::from_file(file.path().to_str().unwrap())
}

const MINIMAL: &str = r#"
[jwt]
access_secret = "file-access-secret"
refresh_secret = "file-refresh-secret"
"#;

#[test]
fn test_minimal_file_fills_defaults() {
    let config = load(MINIMAL).unwrap();

    assert_eq!(config.server.port, 8080);
    assert_eq!(config.server.domain, "localhost");
    assert_eq!(config.server.request_timeout, Duration::from_secs(30));
    assert_eq!(config.database.name, "stratum");
    assert_eq!(config.database.max_connections, 20);
    assert_eq!(config.jwt.access_issuer, "stratum-access");
    assert_eq!(config.jwt.refresh_issuer, "stratum-refresh");
    assert_eq!(config.jwt.access_ttl, Duration::from_secs(15 * 60));
    assert_eq!(config.jwt.refresh_ttl, Duration::from_secs(7 * 24 * 60 * 60));
    assert_eq!(config.logging.format, LogFormat::Json);
    assert!(config.metrics.enabled);
}

#[test]
fn test_full_file_overrides_defaults() {
    let config = load(
        r#"
[server]
host = "127.0.0.1"
port = 9000
domain = "stratum.test"
request_timeout = "10s"

[database]
host = "db.internal"
user = "stratum"
password = "hunter2"
name = "stratum_prod"
max_connections = 50
min_connections = 10
acquire_timeout = "2s"

[jwt]
access_secret = "file-access-secret"
access_issuer = "acme-access"
access_ttl = "5m"
refresh_secret = "file-refresh-secret"
refresh_issuer = "acme-refresh"
refresh_ttl = "30d"

[logging]
level = "debug"
format = "pretty"

[logging.module_levels]
sqlx = "warn"

[metrics]
enabled = false
"#,
    )
    .unwrap();

    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 9000);
    assert_eq!(config.server.domain, "stratum.test");
    assert_eq!(config.server.request_timeout, Duration::from_secs(10));
    assert_eq!(config.database.max_connections, 50);
    assert_eq!(config.database.acquire_timeout, Duration::from_secs(2));
    assert_eq!(config.jwt.access_issuer, "acme-access");
    assert_eq!(config.jwt.access_ttl, Duration::from_secs(300));
    assert_eq!(config.jwt.refresh_ttl, Duration::from_secs(30 * 24 * 60 * 60));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.logging.module_levels.get("sqlx").map(String::as_str), Some("warn"));
    assert!(!config.metrics.enabled);
}

#[test]
fn test_missing_jwt_section_is_rejected() {
    let err = load("[server]\nport = 8081\n").unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}

#[test]
fn test_shared_secret_is_rejected() {
    let err = load(
        r#"
[jwt]
access_secret = "same"
refresh_secret = "same"
"#,
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}

#[test]
fn test_pool_bounds_are_checked() {
    let err = load(
        r#"
[database]
max_connections = 2
min_connections = 5

[jwt]
access_secret = "file-access-secret"
refresh_secret = "file-refresh-secret"
"#,
    )
    .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}

#[test]
fn test_missing_file_is_rejected() {
    let err = Config::from_file("/nonexistent/stratum.toml").unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}
