use super::{RuleError, RuleSet};
use crate::http::ParseError;
use crate::metadata::Metadata;
use flate2::Compression;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use regex::Regex;
use std::io::{self, Read, Write};
use thiserror::Error;
use uaproxy_config::{Direction, RuleConfig};

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("no {0} message to act on")]
    MissingMessage(&'static str),
    #[error("header edit rejected: {0}")]
    Edit(#[from] ParseError),
    #[error("body codec error: {0}")]
    Codec(#[from] io::Error),
}

/// Effect half of a rule.
#[derive(Debug, Clone)]
pub enum Action {
    /// Forward untouched and stop evaluating.
    Direct,
    /// Swallow the message.
    Drop,
    /// Close the connection.
    Reject,
    ReplaceHeader {
        header: String,
        value: String,
    },
    /// `value` may reference capture groups as `$1`.
    ReplaceHeaderRegex {
        header: String,
        regex: Regex,
        value: String,
    },
    DeleteHeader {
        header: String,
    },
    AddHeader {
        header: String,
        value: String,
    },
    /// Runs over the buffered body, decoding gzip or deflate first.
    ReplaceBodyRegex {
        regex: regex::bytes::Regex,
        value: String,
    },
    /// Answers the request with a redirect built from the rewritten URL.
    Redirect {
        status: u16,
        regex: Regex,
        value: String,
    },
}

impl Action {
    pub fn from_config(rule: &RuleConfig, set: RuleSet) -> Result<Self, RuleError> {
        let action = rule.action.to_ascii_uppercase();
        let header = || rule.rewrite_header.clone();
        let value = || {
            rule.rewrite_value
                .clone()
                .ok_or(RuleError::MissingField("rewrite_value"))
        };
        let pattern = || {
            rule.rewrite_regex
                .clone()
                .filter(|re| !re.is_empty())
                .ok_or(RuleError::MissingField("rewrite_regex"))
        };

        let built = match (set, action.as_str()) {
            (_, "DIRECT") => Action::Direct,
            (RuleSet::Header | RuleSet::Body, "DROP") => Action::Drop,
            (RuleSet::Header | RuleSet::Body, "REJECT") => Action::Reject,
            (RuleSet::Header, "REPLACE") => Action::ReplaceHeader {
                header: header(),
                value: value()?,
            },
            (RuleSet::Header, "REPLACE-REGEX") => Action::ReplaceHeaderRegex {
                header: header(),
                regex: Regex::new(&pattern()?)?,
                value: value()?,
            },
            (RuleSet::Header, "DELETE") => Action::DeleteHeader { header: header() },
            (RuleSet::Header, "ADD") => Action::AddHeader {
                header: header(),
                value: value()?,
            },
            (RuleSet::Body, "REPLACE-REGEX") => Action::ReplaceBodyRegex {
                regex: regex::bytes::Regex::new(&pattern()?)?,
                value: value()?,
            },
            (RuleSet::Redirect, "REDIRECT-302") => Action::Redirect {
                status: 302,
                regex: Regex::new(&pattern()?)?,
                value: value()?,
            },
            (RuleSet::Redirect, "REDIRECT-307") => Action::Redirect {
                status: 307,
                regex: Regex::new(&pattern()?)?,
                value: value()?,
            },
            _ => return Err(RuleError::UnknownAction(rule.action.clone())),
        };
        Ok(built)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Direct => "DIRECT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
            Action::ReplaceHeader { .. } => "REPLACE",
            Action::ReplaceHeaderRegex { .. } | Action::ReplaceBodyRegex { .. } => "REPLACE-REGEX",
            Action::DeleteHeader { .. } => "DELETE",
            Action::AddHeader { .. } => "ADD",
            Action::Redirect { status: 307, .. } => "REDIRECT-307",
            Action::Redirect { .. } => "REDIRECT-302",
        }
    }

    /// Applies the action to the message currently travelling through
    /// `meta`. Returns whether evaluation may go on to later rules.
    ///
    /// Nothing is modified when an error is returned.
    pub fn execute(&self, meta: &mut Metadata) -> Result<bool, ActionError> {
        let direction = meta.direction();
        match self {
            Action::Direct | Action::Drop | Action::Reject => Ok(false),

            Action::ReplaceHeader { header, value } => {
                let head = message(meta, direction)?;
                let original = head.header_str(header).unwrap_or_default();
                head.set_header(header, value)?;
                meta.record_edit(header, original, value.clone());
                Ok(true)
            }

            Action::ReplaceHeaderRegex { header, regex, value } => {
                let head = message(meta, direction)?;
                let Some(original) = head.header_str(header) else {
                    return Ok(true);
                };
                let rewritten = regex.replace_all(&original, value.as_str()).into_owned();
                if rewritten == original {
                    return Ok(true);
                }
                head.set_header(header, &rewritten)?;
                meta.record_edit(header, original, rewritten);
                Ok(true)
            }

            Action::DeleteHeader { header } => {
                let head = message(meta, direction)?;
                let original = head.header_str(header);
                if head.delete_header(header)? > 0 {
                    meta.record_edit(header, original.unwrap_or_default(), String::new());
                }
                Ok(true)
            }

            Action::AddHeader { header, value } => {
                message(meta, direction)?.add_header(header, value)?;
                meta.record_edit(header, String::new(), value.clone());
                Ok(true)
            }

            Action::ReplaceBodyRegex { regex, value } => {
                replace_body(meta, direction, regex, value)?;
                Ok(true)
            }

            Action::Redirect { status, regex, value } => {
                if meta.request().is_none() {
                    return Err(ActionError::MissingMessage("request"));
                }
                let url = meta.url();
                if !regex.is_match(url) {
                    return Ok(true);
                }
                let location = regex.replace_all(url, value.as_str()).into_owned();
                if location.bytes().any(|b| b == b'\r' || b == b'\n') {
                    return Err(ActionError::Edit(ParseError::BadProto));
                }
                let reply = format!(
                    "HTTP/1.1 {} {}\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
                    status,
                    reason_phrase(*status),
                    location
                );
                meta.set_reply(reply.into_bytes());
                Ok(false)
            }
        }
    }
}

fn message(
    meta: &mut Metadata,
    direction: Direction,
) -> Result<&mut crate::http::HttpHead, ActionError> {
    let name = match direction {
        Direction::Response => "response",
        Direction::Request | Direction::Dual => "request",
    };
    meta.message_mut(direction)
        .ok_or(ActionError::MissingMessage(name))
}

fn replace_body(
    meta: &mut Metadata,
    direction: Direction,
    regex: &regex::bytes::Regex,
    value: &str,
) -> Result<(), ActionError> {
    let head = match direction {
        Direction::Response => meta.response(),
        Direction::Request | Direction::Dual => meta.request(),
    };
    let encoding = head
        .and_then(|head| head.header_str("Content-Encoding"))
        .map(|e| e.trim().to_ascii_lowercase())
        .unwrap_or_default();
    // Bodies are only present when they were small enough to buffer
    let Some(raw) = meta.body(direction) else {
        return Ok(());
    };
    let Some(decoded) = decode_body(raw, &encoding)? else {
        return Ok(());
    };

    let replaced = regex.replace_all(&decoded, value.as_bytes());
    if replaced.as_ref() == decoded.as_slice() {
        return Ok(());
    }
    let encoded = encode_body(&replaced, &encoding)?;

    message(meta, direction)?.set_header("Content-Length", &encoded.len().to_string())?;
    meta.set_body(direction, encoded);
    Ok(())
}

/// `None` for encodings that cannot be rewritten.
fn decode_body(body: &[u8], encoding: &str) -> io::Result<Option<Vec<u8>>> {
    let mut out = Vec::with_capacity(body.len());
    match encoding {
        "" | "identity" => return Ok(Some(body.to_vec())),
        "gzip" | "x-gzip" => GzDecoder::new(body).read_to_end(&mut out)?,
        "deflate" => ZlibDecoder::new(body).read_to_end(&mut out)?,
        _ => return Ok(None),
    };
    Ok(Some(out))
}

fn encode_body(body: &[u8], encoding: &str) -> io::Result<Vec<u8>> {
    match encoding {
        "gzip" | "x-gzip" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        "deflate" => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()
        }
        _ => Ok(body.to_vec()),
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        307 => "Temporary Redirect",
        _ => "Found",
    }
}
