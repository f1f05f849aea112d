//! TLS interception hand-off.
//!
//! The proxy never terminates TLS itself. When an interceptor is installed
//! and the ClientHello's server name is opted in, both streams are handed to
//! the interceptor, which returns plaintext streams the HTTP pipeline can
//! work on.

use crate::connection::BoxedStream;
use futures::future::BoxFuture;
use std::io;
use tracing::{info, warn};
use uaproxy_config::matches_hostname_pattern;

const DEFAULT_PORT: u16 = 443;

pub trait TlsInterceptor: Send + Sync {
    /// Final say on whether `server_name` on `port` is intercepted.
    fn intercepts(&self, _server_name: &str, _port: u16) -> bool {
        true
    }

    /// Terminates TLS towards the client and re-originates it towards the
    /// server. The ClientHello is still unread in `local`.
    fn intercept(
        &self,
        local: BoxedStream,
        remote: BoxedStream,
        server_name: String,
    ) -> BoxFuture<'static, io::Result<(BoxedStream, BoxedStream)>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostnameEntry {
    pattern: String,
    /// `None` matches every port
    port: Option<u16>,
}

/// Opt-in list of `domain[:port]` glob entries.
#[derive(Debug, Clone, Default)]
pub struct HostnameFilter {
    entries: Vec<HostnameEntry>,
}

impl HostnameFilter {
    pub fn parse(hostnames: &[String]) -> Self {
        let mut entries = Vec::with_capacity(hostnames.len());
        for raw in hostnames {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match parse_entry(raw) {
                Ok(entry) => entries.push(entry),
                Err(reason) => warn!(entry = raw, reason, "Ignoring MitM hostname entry"),
            }
        }

        if !entries.is_empty() {
            info!(entries = entries.len(), "MitM hostname filter configured");
        }
        Self { entries }
    }

    /// Whether any entry could match a connection to `port`.
    pub fn covers_port(&self, port: u16) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.port.is_none_or(|p| p == port))
    }

    pub fn matches(&self, server_name: &str, port: u16) -> bool {
        if server_name.is_empty() {
            return false;
        }
        self.entries.iter().any(|entry| {
            entry.port.is_none_or(|p| p == port) && matches_hostname_pattern(server_name, &entry.pattern)
        })
    }
}

fn parse_entry(raw: &str) -> Result<HostnameEntry, &'static str> {
    let (pattern, port) = match raw.rsplit_once(':') {
        Some((domain, port)) => match port.parse::<u32>() {
            Ok(0) => (domain, None),
            Ok(p) => (domain, Some(u16::try_from(p).map_err(|_| "port out of range")?)),
            // Not a number: the colon belongs to the domain
            Err(_) => (raw, Some(DEFAULT_PORT)),
        },
        None => (raw, Some(DEFAULT_PORT)),
    };

    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err("empty domain");
    }
    Ok(HostnameEntry {
        pattern: pattern.to_ascii_lowercase(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(entries: &[&str]) -> HostnameFilter {
        HostnameFilter::parse(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn test_default_port() {
        let f = filter(&["example.com"]);
        assert!(f.matches("example.com", 443));
        assert!(!f.matches("example.com", 8443));
        assert!(!f.matches("api.example.com", 443));
    }

    #[test]
    fn test_explicit_and_any_port() {
        let f = filter(&["api.example.com:8443", "*.test.org:0"]);
        assert!(f.matches("api.example.com", 8443));
        assert!(!f.matches("api.example.com", 443));
        assert!(f.matches("cdn.test.org", 80));
        assert!(f.matches("cdn.test.org", 9999));
    }

    #[test]
    fn test_covers_port() {
        assert!(!filter(&[]).covers_port(443));

        let f = filter(&["example.com", "api.example.com:8443"]);
        assert!(f.covers_port(443));
        assert!(f.covers_port(8443));
        assert!(!f.covers_port(25));

        assert!(filter(&["*.test.org:0"]).covers_port(25));
    }

    #[test]
    fn test_glob_patterns() {
        let f = filter(&["api-?.example.com", "*"]);
        assert!(f.matches("api-1.example.com", 443));
        assert!(f.matches("anything.net", 443));
        assert!(!f.matches("anything.net", 80));
        assert!(!f.matches("", 443));
    }

    #[test]
    fn test_bad_entries_ignored() {
        let f = filter(&["", ":443", "example.com:70000", "ok.com"]);
        assert_eq!(f.entries.len(), 1);
        assert!(f.matches("ok.com", 443));
        assert!(!f.matches("example.com", 4464));
    }
}
