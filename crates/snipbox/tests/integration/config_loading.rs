use std::time::Duration;

use snipbox::config::{Backend, Config};

use super::fixture_config;

#[test]
fn test_example_config_matches_defaults() {
    let config = Config::parse_toml(snipbox::EXAMPLE_CONFIG).expect("Failed to parse");
    assert_eq!(config.timeout(), Duration::from_secs(5));
    assert_eq!(config.namespaces.len(), 7);
    assert_eq!(config.sandbox.backend, Backend::Process);
}

#[test]
fn test_load_full_config() {
    let config = Config::from_file(fixture_config("valid_full.toml")).expect("Failed to load");

    assert_eq!(config.timeout(), Duration::from_millis(2500));
    assert_eq!(config.namespaces, ["std::collections::*", "std::fmt"]);
    assert_eq!(config.compiler.edition, "2021");
    assert_eq!(config.sandbox.backend, Backend::Isolate);
    assert_eq!(config.sandbox.first_box_id, 10);
    assert_eq!(config.sandbox.box_count, 8);
    assert_eq!(config.sandbox.mounts.len(), 1);
    assert!(config.sandbox.mounts[0].optional);
}

#[test]
fn test_load_minimal_config() {
    let config = Config::from_file(fixture_config("valid_minimal.toml")).expect("Failed to load");
    assert_eq!(config.timeout(), Duration::from_secs(3));
    assert_eq!(config.namespaces.len(), 7);
    assert_eq!(config.compiler.rustc.to_str(), Some("rustc"));
}

#[test]
fn test_load_invalid_namespace() {
    assert!(Config::from_file(fixture_config("invalid_namespace.toml")).is_err());
}

#[test]
fn test_load_invalid_timeout() {
    assert!(Config::from_file(fixture_config("invalid_timeout.toml")).is_err());
}

#[test]
fn test_load_missing_file() {
    assert!(Config::from_file(fixture_config("does_not_exist.toml")).is_err());
}
