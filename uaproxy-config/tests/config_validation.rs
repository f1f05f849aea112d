use std::path::PathBuf;
use uaproxy_config::{Config, Direction, RewriteMode};

fn get_test_config_path(filename: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("test_configs");
    path.push(filename);
    path
}

#[test]
fn test_basic_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_basic.yaml"))
        .expect("Failed to load basic config");

    assert_eq!(config.listen_addrs.len(), 2);
    assert_eq!(config.listen_addrs[0], "127.0.0.1:1080");
    assert_eq!(config.listen_addrs[1], "0.0.0.0:1081");
    assert_eq!(config.user_agent, "Mozilla/5.0 (uaproxy)");

    assert_eq!(config.timeouts.connect, 10);
    assert_eq!(config.timeouts.sniff, 3);
    assert_eq!(config.timeouts.idle, 300);

    assert!(config.metrics.enabled);
    assert_eq!(config.metrics.address, "0.0.0.0:9091");

    // Everything else falls back to defaults
    assert_eq!(config.rewrite_mode, RewriteMode::Global);
    assert_eq!(config.cache.capacity, 100);
    assert!(config.header_rules.is_empty());
}

#[test]
fn test_rules_config_loads() {
    let config = Config::from_file(&get_test_config_path("test_rules.yaml"))
        .expect("Failed to load rules config");

    assert_eq!(config.rewrite_mode, RewriteMode::Rule);
    assert!(!config.preserve_length);
    assert_eq!(config.max_body_size, 65536);
    assert_eq!(config.cache.capacity, 512);
    assert_eq!(config.cache.ttl, 1800);
    assert_eq!(config.cache.cleanup_interval, 60);

    assert_eq!(config.header_rules.len(), 4);
    assert_eq!(config.header_rules[0].kind, "DOMAIN-SUFFIX");
    assert_eq!(config.header_rules[0].rewrite_header, "X-Forwarded-For");
    assert!(config.header_rules[0].chain);
    assert_eq!(
        config.header_rules[1].rewrite_regex.as_deref(),
        Some("(iPhone|Android)")
    );
    assert_eq!(config.header_rules[3].action, "DIRECT");

    assert_eq!(config.body_rules.len(), 1);
    assert_eq!(config.body_rules[0].direction, Direction::Response);

    assert_eq!(config.redirect_rules.len(), 1);
    assert_eq!(config.redirect_rules[0].action, "REDIRECT-302");

    assert_eq!(config.mitm.hostnames, vec!["*.example.com", "api.test.com:0"]);
}

#[test]
fn test_sample_config_loads() {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.pop(); // Go up to workspace root
    path.push("config.yaml");

    let config = Config::from_file(&path).expect("Failed to load sample config");

    assert_eq!(config.listen_addrs, vec!["127.0.0.1:1080"]);
    assert_eq!(config.rewrite_mode, RewriteMode::Global);
    assert!(config.metrics.enabled);
    assert_eq!(config.header_rules.len(), 2);
    assert!(config.header_rules[0].cache);
}

#[test]
fn test_missing_file() {
    let result = Config::from_file(&get_test_config_path("does_not_exist.yaml"));
    assert!(result.is_err());
}

#[test]
fn test_rule_missing_action() {
    let yaml = r#"
listen_addrs:
  - "127.0.0.1:1080"
header_rules:
  - type: FINAL
"#;

    let result = Config::parse(yaml);
    assert!(result.is_err(), "Should fail when a rule has no action");
}

#[test]
fn test_config_invalid_yaml() {
    let yaml = r#"
listen_addrs: [invalid
timeouts:
  - invalid
"#;

    let result = Config::parse(yaml);
    assert!(result.is_err(), "Should fail on invalid YAML");
}
