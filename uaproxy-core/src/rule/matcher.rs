use super::RuleError;
use crate::metadata::Metadata;
use cidr::IpCidr;
use regex::Regex;
use std::net::IpAddr;
use std::str::FromStr;
use uaproxy_config::RuleConfig;

/// Predicate half of a rule.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Case-insensitive substring of a request header; the keyword is
    /// stored lowercased.
    HeaderKeyword { header: String, keyword: String },
    HeaderRegex { header: String, regex: Regex },
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    /// Client address
    SrcIp(IpCidr),
    /// Upstream peer address
    IpCidr(IpCidr),
    DestPort(u16),
    UrlRegex(Regex),
    Final,
}

impl Matcher {
    pub fn from_config(rule: &RuleConfig) -> Result<Self, RuleError> {
        let kind = rule.kind.to_ascii_uppercase();
        let value = || required(&rule.match_value, "match_value");

        let matcher = match kind.as_str() {
            "HEADER-KEYWORD" => Matcher::HeaderKeyword {
                header: required(&rule.match_header, "match_header")?,
                keyword: value()?.to_lowercase(),
            },
            "HEADER-REGEX" => Matcher::HeaderRegex {
                header: required(&rule.match_header, "match_header")?,
                regex: Regex::new(&format!("(?i){}", value()?))?,
            },
            "DOMAIN" => Matcher::Domain(value()?.to_ascii_lowercase()),
            "DOMAIN-SUFFIX" => Matcher::DomainSuffix(value()?.to_ascii_lowercase()),
            "DOMAIN-KEYWORD" => Matcher::DomainKeyword(value()?.to_ascii_lowercase()),
            "SRC-IP" => Matcher::SrcIp(parse_cidr(&value()?)?),
            "IP-CIDR" => Matcher::IpCidr(parse_cidr(&value()?)?),
            "DEST-PORT" => {
                let raw = value()?;
                let port = raw
                    .trim()
                    .parse::<u16>()
                    .map_err(|_| RuleError::InvalidPort(raw.clone()))?;
                Matcher::DestPort(port)
            }
            "URL-REGEX" => Matcher::UrlRegex(Regex::new(&value()?)?),
            "FINAL" => Matcher::Final,
            _ => return Err(RuleError::UnknownType(rule.kind.clone())),
        };
        Ok(matcher)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Matcher::HeaderKeyword { .. } => "HEADER-KEYWORD",
            Matcher::HeaderRegex { .. } => "HEADER-REGEX",
            Matcher::Domain(_) => "DOMAIN",
            Matcher::DomainSuffix(_) => "DOMAIN-SUFFIX",
            Matcher::DomainKeyword(_) => "DOMAIN-KEYWORD",
            Matcher::SrcIp(_) => "SRC-IP",
            Matcher::IpCidr(_) => "IP-CIDR",
            Matcher::DestPort(_) => "DEST-PORT",
            Matcher::UrlRegex(_) => "URL-REGEX",
            Matcher::Final => "FINAL",
        }
    }

    pub fn matches(&self, meta: &Metadata) -> bool {
        match self {
            Matcher::HeaderKeyword { header, keyword } => meta
                .request_header(header)
                .is_some_and(|value| value.to_lowercase().contains(keyword.as_str())),
            Matcher::HeaderRegex { header, regex } => meta
                .request_header(header)
                .is_some_and(|value| regex.is_match(&value)),
            Matcher::Domain(domain) => meta.host() == domain,
            Matcher::DomainSuffix(suffix) => meta.host().ends_with(suffix.as_str()),
            Matcher::DomainKeyword(keyword) => meta.host().contains(keyword.as_str()),
            Matcher::SrcIp(cidr) => meta.src_ip().is_some_and(|ip| cidr.contains(&ip)),
            Matcher::IpCidr(cidr) => meta
                .remote_ip()
                .or_else(|| meta.link().dest_host().parse::<IpAddr>().ok())
                .is_some_and(|ip| cidr.contains(&ip)),
            Matcher::DestPort(port) => meta.dest_port() == Some(*port),
            Matcher::UrlRegex(regex) => regex.is_match(meta.url()),
            Matcher::Final => true,
        }
    }
}

fn required(field: &Option<String>, name: &'static str) -> Result<String, RuleError> {
    match field {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(RuleError::MissingField(name)),
    }
}

/// Accepts `a.b.c.d/n`, `v6/n`, or a bare address meaning a single host.
fn parse_cidr(raw: &str) -> Result<IpCidr, RuleError> {
    let raw = raw.trim();
    let text = if raw.contains('/') {
        raw.to_string()
    } else {
        match raw.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => format!("{}/32", raw),
            Ok(IpAddr::V6(_)) => format!("{}/128", raw),
            Err(_) => return Err(RuleError::InvalidCidr(raw.to_string())),
        }
    };
    IpCidr::from_str(&text).map_err(|_| RuleError::InvalidCidr(raw.to_string()))
}
