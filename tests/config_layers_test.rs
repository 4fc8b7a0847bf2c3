//! Layered configuration loading: TOML file under CLI overrides.

use std::io::Write;
use std::path::Path;

use tandem::ConfigError;
use tandem::NodeConfig;
use tandem::ScopePolicy;
use tandem::StoreBackend;
use tandem::load_config;
use tandem_ratelimit::FailurePolicy;
use tempfile::NamedTempFile;

fn toml_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_toml_file_is_loaded_and_validated() {
    let file = toml_file(
        r#"
        http_addr = "0.0.0.0:9100"
        failure_policy = "open"
        store = "kv"

        [policies.chat-send]
        capacity = 4
        refill_rate = 0.2

        [policies.uploads]
        capacity = 2
        refill_rate = 0.05
        "#,
    );

    let config = load_config(Some(file.path()), NodeConfig::default()).unwrap();
    assert_eq!(config.http_addr().port(), 9100);
    assert_eq!(config.failure_policy(), FailurePolicy::Open);
    assert_eq!(config.store_backend(), StoreBackend::Kv);

    let policies = config.effective_policies();
    assert_eq!(policies["chat-send"], ScopePolicy::new(4, 0.2));
    assert_eq!(policies["uploads"], ScopePolicy::new(2, 0.05));
    assert_eq!(policies["api"], ScopePolicy::new(60, 1.0));
}

#[test]
fn test_cli_overrides_beat_toml() {
    let file = toml_file(
        r#"
        key_prefix = "from-file"
        failure_policy = "open"

        [policies.api]
        capacity = 5
        refill_rate = 1.0
        "#,
    );

    let mut overrides = NodeConfig {
        key_prefix: Some("from-cli".into()),
        failure_policy: Some(FailurePolicy::Closed),
        ..NodeConfig::default()
    };
    overrides.policies.insert("api".into(), ScopePolicy::new(50, 5.0));

    let config = load_config(Some(file.path()), overrides).unwrap();
    assert_eq!(config.key_prefix(), "from-cli");
    assert_eq!(config.failure_policy(), FailurePolicy::Closed);
    assert_eq!(config.effective_policies()["api"], ScopePolicy::new(50, 5.0));
    assert_eq!(config.limiter_configs()["api"].key_prefix, "from-cli");
}

#[test]
fn test_invalid_policy_fails_before_startup() {
    let file = toml_file(
        r#"
        [policies.chat-send]
        capacity = 10
        refill_rate = 0.0
        "#,
    );

    let err = load_config(Some(file.path()), NodeConfig::default()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidLimiter { ref scope, .. } if scope == "chat-send"));
    assert!(err.to_string().contains("chat-send"));
}

#[test]
fn test_unknown_failure_policy_in_toml_is_rejected() {
    let file = toml_file(r#"failure_policy = "sometimes""#);
    let err = load_config(Some(file.path()), NodeConfig::default()).unwrap_err();
    assert!(matches!(err, ConfigError::ParseToml { .. }));
}

#[test]
fn test_missing_file_is_reported() {
    let err = load_config(Some(Path::new("/nonexistent/tandem.toml")), NodeConfig::default()).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFile { .. }));
}
