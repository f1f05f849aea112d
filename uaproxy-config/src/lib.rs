use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// uaproxy configuration loaded from YAML.
///
/// Only `listen_addrs` is required; every other section falls back to the
/// defaults documented on its field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// SOCKS5 listen addresses (e.g., "127.0.0.1:1080")
    pub listen_addrs: Vec<String>,
    /// Rewrite policy applied to HTTP traffic (default: GLOBAL)
    #[serde(default)]
    pub rewrite_mode: RewriteMode,
    /// Replacement User-Agent used by GLOBAL mode (default: "FFF")
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Only User-Agents matching this pattern are rewritten (case-insensitive)
    #[serde(default)]
    pub user_agent_regex: Option<String>,
    /// Replace only the parts of the User-Agent matched by `user_agent_regex`
    #[serde(default)]
    pub partial_replace: bool,
    /// Overwrite header values in place, padding or truncating to the original length
    #[serde(default = "default_preserve_length")]
    pub preserve_length: bool,
    /// Largest request/response head accepted before falling back to raw copy
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// Largest body buffered for body rewrite rules
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Timeout configuration for various operations
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Destination classification cache
    #[serde(default)]
    pub cache: CacheConfig,
    /// Prometheus metrics configuration
    #[serde(default)]
    pub metrics: Metrics,
    /// Event sink configuration
    #[serde(default)]
    pub events: EventsConfig,
    /// Header rules evaluated in RULE mode
    #[serde(default)]
    pub header_rules: Vec<RuleConfig>,
    /// Body rules evaluated in RULE mode
    #[serde(default)]
    pub body_rules: Vec<RuleConfig>,
    /// Redirect rules evaluated in RULE mode
    #[serde(default)]
    pub redirect_rules: Vec<RuleConfig>,
    /// Hostnames eligible for TLS interception
    #[serde(default)]
    pub mitm: MitmConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addrs: vec!["127.0.0.1:1080".to_string()],
            rewrite_mode: RewriteMode::default(),
            user_agent: default_user_agent(),
            user_agent_regex: None,
            partial_replace: false,
            preserve_length: default_preserve_length(),
            max_header_size: default_max_header_size(),
            max_body_size: default_max_body_size(),
            timeouts: Timeouts::default(),
            cache: CacheConfig::default(),
            metrics: Metrics::default(),
            events: EventsConfig::default(),
            header_rules: Vec::new(),
            body_rules: Vec::new(),
            redirect_rules: Vec::new(),
            mitm: MitmConfig::default(),
        }
    }
}

fn default_user_agent() -> String {
    "FFF".to_string()
}

fn default_preserve_length() -> bool {
    true
}

fn default_max_header_size() -> usize {
    64 * 1024
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

/// How HTTP traffic is rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RewriteMode {
    /// Forward everything untouched
    Direct,
    /// Replace every User-Agent outside the built-in whitelist
    #[default]
    Global,
    /// Evaluate the configured rule lists
    Rule,
}

impl RewriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewriteMode::Direct => "DIRECT",
            RewriteMode::Global => "GLOBAL",
            RewriteMode::Rule => "RULE",
        }
    }
}

impl std::str::FromStr for RewriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DIRECT" => Ok(RewriteMode::Direct),
            "GLOBAL" => Ok(RewriteMode::Global),
            "RULE" => Ok(RewriteMode::Rule),
            other => Err(format!("unknown rewrite mode: {}", other)),
        }
    }
}

/// Message direction a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    #[default]
    Request,
    Response,
    Dual,
}

/// A single rule as written in the configuration file.
///
/// `type` and `action` stay free-form strings here; the core validates them
/// and disables the rule (with a warning) instead of rejecting the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(default = "default_rule_enabled")]
    pub enabled: bool,
    /// Matcher kind: HEADER-KEYWORD, HEADER-REGEX, DOMAIN, DOMAIN-SUFFIX,
    /// DOMAIN-KEYWORD, SRC-IP, IP-CIDR, DEST-PORT, URL-REGEX or FINAL
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub match_header: Option<String>,
    #[serde(default)]
    pub match_value: Option<String>,
    /// Action kind: DIRECT, DROP, REJECT, REPLACE, REPLACE-REGEX, DELETE, ADD,
    /// REDIRECT-302 or REDIRECT-307
    pub action: String,
    #[serde(default = "default_rewrite_header")]
    pub rewrite_header: String,
    #[serde(default)]
    pub rewrite_value: Option<String>,
    #[serde(default)]
    pub rewrite_regex: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    /// Keep evaluating later rules after this one fires
    #[serde(rename = "continue", default)]
    pub chain: bool,
    /// Mark the destination so later connections skip sniffing
    #[serde(default)]
    pub cache: bool,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            enabled: default_rule_enabled(),
            kind: "FINAL".to_string(),
            match_header: None,
            match_value: None,
            action: "DIRECT".to_string(),
            rewrite_header: default_rewrite_header(),
            rewrite_value: None,
            rewrite_regex: None,
            direction: Direction::default(),
            chain: false,
            cache: false,
        }
    }
}

fn default_rule_enabled() -> bool {
    true
}

fn default_rewrite_header() -> String {
    "User-Agent".to_string()
}

/// Timeout settings for proxy operations (all values in seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time to establish the upstream connection (default: 10s)
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
    /// Maximum time to classify the first bytes of a connection (default: 5s)
    #[serde(default = "default_sniff_timeout")]
    pub sniff: u64,
    /// Maximum idle time for established connections (default: 300s)
    #[serde(default = "default_idle_timeout")]
    pub idle: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: default_connect_timeout(),
            sniff: default_sniff_timeout(),
            idle: default_idle_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_sniff_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    300
}

/// Destination classification cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of remembered destinations (default: 100)
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Entry lifetime in seconds (default: 600)
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,
    /// Background eviction interval in seconds (default: 60)
    #[serde(default = "default_cache_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl: default_cache_ttl(),
            cleanup_interval: default_cache_cleanup_interval(),
        }
    }
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_ttl() -> u64 {
    600
}

fn default_cache_cleanup_interval() -> u64 {
    60
}

/// Prometheus metrics server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Whether to enable metrics collection
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind metrics HTTP server (e.g., "127.0.0.1:9000")
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "127.0.0.1:9000".to_string()
}

/// Event sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Bounded queue size; events beyond it are dropped (default: 3000)
    #[serde(default = "default_events_capacity")]
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_events_capacity(),
        }
    }
}

fn default_events_capacity() -> usize {
    3000
}

/// TLS interception opt-in list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MitmConfig {
    /// Entries of the form `domain[:port]`; port defaults to 443, 0 means any port
    #[serde(default)]
    pub hostnames: Vec<String>,
}

impl Config {
    /// Loads configuration from a YAML file.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use uaproxy_config::Config;
    /// use std::path::Path;
    ///
    /// let config = Config::from_file(Path::new("config.yaml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Examples
    ///
    /// ```
    /// use uaproxy_config::{Config, RewriteMode};
    ///
    /// let yaml = r#"
    /// listen_addrs:
    ///   - "127.0.0.1:1080"
    /// rewrite_mode: RULE
    /// "#;
    ///
    /// let config = Config::parse(yaml).unwrap();
    /// assert_eq!(config.listen_addrs[0], "127.0.0.1:1080");
    /// assert_eq!(config.rewrite_mode, RewriteMode::Rule);
    /// assert_eq!(config.user_agent, "FFF");
    /// ```
    pub fn parse(contents: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = serde_yaml_ng::from_str(contents)?;
        if config.listen_addrs.is_empty() {
            return Err("listen_addrs must contain at least one address".into());
        }
        Ok(config)
    }
}

/// Checks if a hostname matches a glob pattern, ignoring ASCII case.
///
/// `*` matches any run of characters (including none) and `?` matches
/// exactly one.
///
/// ```
/// use uaproxy_config::matches_hostname_pattern;
///
/// assert!(matches_hostname_pattern("api.example.com", "*.example.com"));
/// assert!(matches_hostname_pattern("api-1.example.com", "api-?.example.com"));
/// assert!(!matches_hostname_pattern("example.com", "*.example.com"));
/// ```
pub fn matches_hostname_pattern(hostname: &str, pattern: &str) -> bool {
    let text = hostname.as_bytes();
    let pat = pattern.as_bytes();

    let (mut t, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pat.len() && (pat[p] == b'?' || pat[p].eq_ignore_ascii_case(&text[t])) {
            t += 1;
            p += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // Let the last star swallow one more character and retry.
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pat[p..].iter().all(|&b| b == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:1080"
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.rewrite_mode, RewriteMode::Global);
        assert_eq!(config.user_agent, "FFF");
        assert!(config.user_agent_regex.is_none());
        assert!(!config.partial_replace);
        assert!(config.preserve_length);
        assert_eq!(config.timeouts.connect, 10);
        assert_eq!(config.timeouts.sniff, 5);
        assert_eq!(config.timeouts.idle, 300);
        assert_eq!(config.cache.capacity, 100);
        assert_eq!(config.cache.ttl, 600);
        assert_eq!(config.events.capacity, 3000);
        assert!(!config.metrics.enabled);
        assert!(config.header_rules.is_empty());
        assert!(config.mitm.hostnames.is_empty());
    }

    #[test]
    fn test_rule_config_parsing() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:1080"
rewrite_mode: RULE
header_rules:
  - type: HEADER-KEYWORD
    match_header: User-Agent
    match_value: curl
    action: REPLACE
    rewrite_value: "Mozilla/5.0"
    continue: true
  - type: FINAL
    action: DIRECT
    direction: DUAL
    enabled: false
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.rewrite_mode, RewriteMode::Rule);
        assert_eq!(config.header_rules.len(), 2);

        let first = &config.header_rules[0];
        assert!(first.enabled);
        assert_eq!(first.kind, "HEADER-KEYWORD");
        assert_eq!(first.match_header.as_deref(), Some("User-Agent"));
        assert_eq!(first.rewrite_header, "User-Agent");
        assert_eq!(first.rewrite_value.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(first.direction, Direction::Request);
        assert!(first.chain);
        assert!(!first.cache);

        let second = &config.header_rules[1];
        assert!(!second.enabled);
        assert_eq!(second.direction, Direction::Dual);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let yaml = r#"
listen_addrs:
  - "127.0.0.1:1080"
rewrite_mode: SOMETIMES
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_missing_listen_addrs() {
        assert!(Config::parse("rewrite_mode: GLOBAL\n").is_err());
        assert!(Config::parse("listen_addrs: []\n").is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let yaml = "invalid: yaml: content: ::::";
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn test_rewrite_mode_from_str() {
        assert_eq!("rule".parse::<RewriteMode>().unwrap(), RewriteMode::Rule);
        assert_eq!("DIRECT".parse::<RewriteMode>().unwrap(), RewriteMode::Direct);
        assert!("fast".parse::<RewriteMode>().is_err());
    }

    #[test]
    fn test_hostname_pattern_exact() {
        assert!(matches_hostname_pattern("example.com", "example.com"));
        assert!(matches_hostname_pattern("Example.COM", "example.com"));
        assert!(!matches_hostname_pattern("other.com", "example.com"));
    }

    #[test]
    fn test_hostname_pattern_wildcards() {
        assert!(matches_hostname_pattern("sub.example.com", "*.example.com"));
        assert!(matches_hostname_pattern("deep.sub.example.com", "*.example.com"));
        assert!(!matches_hostname_pattern("example.com.evil.com", "*.example.com"));
        assert!(matches_hostname_pattern("anything", "*"));
        assert!(matches_hostname_pattern("api-x.example.com", "api-?.example.com"));
        assert!(!matches_hostname_pattern("api-xy.example.com", "api-?.example.com"));
        assert!(matches_hostname_pattern("a.b.c", "a*c"));
    }
}
