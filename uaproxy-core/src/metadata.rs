//! Per-message view handed to the rewriter and the rule engine.

use crate::http::HttpHead;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use uaproxy_config::Direction;

/// Addressing of a connection, shared by every message on it.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    /// Client address as `ip:port`.
    pub laddr: String,
    /// Destination as `host:port`, exactly as requested.
    pub raddr: String,
    /// Resolved peer address of the upstream socket.
    pub remote_ip: Option<IpAddr>,
}

impl LinkInfo {
    pub fn new(laddr: impl Into<String>, raddr: impl Into<String>) -> Self {
        Self {
            laddr: laddr.into(),
            raddr: raddr.into(),
            remote_ip: None,
        }
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.laddr.parse::<SocketAddr>().ok().map(|addr| addr.ip())
    }

    pub fn dest_port(&self) -> Option<u16> {
        self.raddr.rsplit_once(':')?.1.parse().ok()
    }

    pub fn dest_host(&self) -> &str {
        strip_port(&self.raddr)
    }
}

/// One header rewrite, reported as an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEdit {
    pub header: String,
    pub original: String,
    pub rewritten: String,
}

#[derive(Debug)]
pub struct Metadata {
    link: Arc<LinkInfo>,
    direction: Direction,
    request: Option<HttpHead>,
    request_body: Option<Vec<u8>>,
    response: Option<HttpHead>,
    response_body: Option<Vec<u8>>,
    reply: Option<Vec<u8>>,
    edits: Vec<HeaderEdit>,
    modified: bool,
    host: OnceLock<String>,
    user_agent: OnceLock<String>,
    url: OnceLock<String>,
}

impl Metadata {
    pub fn for_request(link: Arc<LinkInfo>, request: HttpHead, body: Option<Vec<u8>>) -> Self {
        Self {
            request_body: body,
            ..Self::for_request_parts(link, Some(request))
        }
    }

    /// `request` is the snapshot of the request this response answers, if
    /// one is still known.
    pub fn for_response(
        link: Arc<LinkInfo>,
        request: Option<HttpHead>,
        response: HttpHead,
        body: Option<Vec<u8>>,
    ) -> Self {
        Self {
            direction: Direction::Response,
            response: Some(response),
            response_body: body,
            ..Self::for_request_parts(link, request)
        }
    }

    fn for_request_parts(link: Arc<LinkInfo>, request: Option<HttpHead>) -> Self {
        Self {
            link,
            direction: Direction::Request,
            request,
            request_body: None,
            response: None,
            response_body: None,
            reply: None,
            edits: Vec::new(),
            modified: false,
            host: OnceLock::new(),
            user_agent: OnceLock::new(),
            url: OnceLock::new(),
        }
    }

    pub fn link(&self) -> &LinkInfo {
        &self.link
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn src_addr(&self) -> &str {
        &self.link.laddr
    }

    pub fn dest_addr(&self) -> &str {
        &self.link.raddr
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.link.src_ip()
    }

    pub fn dest_port(&self) -> Option<u16> {
        self.link.dest_port()
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.link.remote_ip
    }

    pub fn request(&self) -> Option<&HttpHead> {
        self.request.as_ref()
    }

    /// Mutable request head. Derived fields are recomputed afterwards.
    pub fn request_mut(&mut self) -> Option<&mut HttpHead> {
        self.reset_derived();
        self.request.as_mut()
    }

    pub fn response(&self) -> Option<&HttpHead> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut HttpHead> {
        self.response.as_mut()
    }

    /// Head of the message travelling in `direction`.
    pub fn message_mut(&mut self, direction: Direction) -> Option<&mut HttpHead> {
        match direction {
            Direction::Response => self.response_mut(),
            Direction::Request | Direction::Dual => self.request_mut(),
        }
    }

    /// Buffered body of the message travelling in `direction`, if the
    /// orchestrator buffered one.
    pub fn body(&self, direction: Direction) -> Option<&[u8]> {
        match direction {
            Direction::Response => self.response_body.as_deref(),
            Direction::Request | Direction::Dual => self.request_body.as_deref(),
        }
    }

    pub fn set_body(&mut self, direction: Direction, body: Vec<u8>) {
        self.modified = true;
        match direction {
            Direction::Response => self.response_body = Some(body),
            Direction::Request | Direction::Dual => self.request_body = Some(body),
        }
    }

    /// Host header without its port, or the destination host when the
    /// request carries none.
    pub fn host(&self) -> &str {
        self.host.get_or_init(|| {
            self.request
                .as_ref()
                .and_then(HttpHead::host)
                .filter(|host| !host.is_empty())
                .map(|host| strip_port(host).to_ascii_lowercase())
                .unwrap_or_else(|| self.link.dest_host().to_ascii_lowercase())
        })
    }

    /// Request `User-Agent`; empty when absent.
    pub fn user_agent(&self) -> &str {
        self.user_agent.get_or_init(|| {
            self.request
                .as_ref()
                .and_then(|req| req.header_str("User-Agent"))
                .unwrap_or_default()
        })
    }

    /// Absolute URL of the request: absolute-form targets as sent, origin
    /// form prefixed with `http://host`.
    pub fn url(&self) -> &str {
        self.url.get_or_init(|| {
            let Some(request) = self.request.as_ref() else {
                return String::new();
            };
            let target = String::from_utf8_lossy(request.target());
            if target.starts_with("http://") || target.starts_with("https://") {
                return target.into_owned();
            }
            let authority = request
                .host()
                .filter(|host| !host.is_empty())
                .unwrap_or(&self.link.raddr);
            format!("http://{}{}", authority, target)
        })
    }

    /// Value of a request header as text.
    pub fn request_header(&self, name: &str) -> Option<String> {
        self.request.as_ref()?.header_str(name)
    }

    pub fn set_reply(&mut self, reply: Vec<u8>) {
        self.reply = Some(reply);
    }

    pub fn take_reply(&mut self) -> Option<Vec<u8>> {
        self.reply.take()
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub fn record_edit(&mut self, header: &str, original: String, rewritten: String) {
        self.modified = true;
        self.edits.push(HeaderEdit {
            header: header.to_string(),
            original,
            rewritten,
        });
    }

    pub fn take_edits(&mut self) -> Vec<HeaderEdit> {
        std::mem::take(&mut self.edits)
    }

    /// Whether any header or body of this message was rewritten.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn into_request_parts(self) -> (Option<HttpHead>, Option<Vec<u8>>) {
        (self.request, self.request_body)
    }

    pub fn into_response_parts(self) -> (Option<HttpHead>, Option<Vec<u8>>) {
        (self.response, self.response_body)
    }

    fn reset_derived(&mut self) {
        self.host = OnceLock::new();
        self.user_agent = OnceLock::new();
        self.url = OnceLock::new();
    }
}

/// `host:port` → `host`; bracketed IPv6 literals lose their brackets.
fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, port))
            if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => addr,
    }
}
