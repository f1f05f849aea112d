//! Peek-only protocol classifiers.
//!
//! Every detector here looks at the stream through [`PeekReader::peek`] and
//! leaves the buffer exactly as it found it, so a negative answer can be
//! followed by another detector or by a raw copy of the untouched bytes.

use crate::peek::PeekReader;
use std::io;
use tokio::io::AsyncRead;
use tracing::debug;

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const TLS_RECORD_HEADER_LEN: usize = 5;
const MAX_TLS_RECORD_LEN: usize = 16384;
const CLIENT_HELLO: u8 = 0x01;
const SNI_EXTENSION: u16 = 0x0000;
const SNI_HOST_NAME: u8 = 0x00;
const MAX_HOSTNAME_LEN: usize = 253;

const MAX_METHOD_LEN: usize = 7;
const MAX_REQUEST_LINE: usize = 128;
const HTTP_RESPONSE_PREFIX: &[u8] = b"HTTP/1.";

struct TrieNode {
    byte: u8,
    terminal: bool,
    children: &'static [TrieNode],
}

/// Single-branch tail of the trie, last byte terminal.
macro_rules! tail {
    ($last:literal) => {
        &[TrieNode { byte: $last, terminal: true, children: &[] }]
    };
    ($first:literal $($rest:literal)+) => {
        &[TrieNode { byte: $first, terminal: false, children: tail!($($rest)+) }]
    };
}

/// GET POST PUT PATCH HEAD DELETE OPTIONS TRACE CONNECT
static METHOD_TRIE: &[TrieNode] = &[
    TrieNode { byte: b'G', terminal: false, children: tail!(b'E' b'T') },
    TrieNode {
        byte: b'P',
        terminal: false,
        children: &[
            TrieNode { byte: b'O', terminal: false, children: tail!(b'S' b'T') },
            TrieNode { byte: b'U', terminal: false, children: tail!(b'T') },
            TrieNode { byte: b'A', terminal: false, children: tail!(b'T' b'C' b'H') },
        ],
    },
    TrieNode { byte: b'H', terminal: false, children: tail!(b'E' b'A' b'D') },
    TrieNode { byte: b'D', terminal: false, children: tail!(b'E' b'L' b'E' b'T' b'E') },
    TrieNode { byte: b'O', terminal: false, children: tail!(b'P' b'T' b'I' b'O' b'N' b'S') },
    TrieNode { byte: b'T', terminal: false, children: tail!(b'R' b'A' b'C' b'E') },
    TrieNode { byte: b'C', terminal: false, children: tail!(b'O' b'N' b'N' b'E' b'C' b'T') },
];

/// What a ClientHello told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// Empty when the ClientHello carries no usable SNI.
    pub server_name: String,
    /// `client_version` from the handshake body, 0 if truncated before it.
    pub client_version: u16,
}

/// Checks whether the stream starts with one of the nine HTTP methods.
///
/// Peeks one byte at a time and stops as soon as the trie either reaches a
/// complete method or diverges, so at most seven bytes are ever required.
pub async fn sniff_http_method<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
) -> io::Result<bool> {
    let mut level = METHOD_TRIE;
    for depth in 0..MAX_METHOD_LEN {
        let byte = reader.peek(depth + 1).await?[depth];
        match level.iter().find(|node| node.byte == byte) {
            Some(node) if node.terminal => return Ok(true),
            Some(node) => level = node.children,
            None => return Ok(false),
        }
    }
    Ok(false)
}

/// Connection-start check: method trie plus a look at the request line.
///
/// Only bytes already buffered are inspected for the line itself. When no
/// complete line is available within the first 128 bytes the method check
/// decides; when one is, its version token must be `HTTP/1.0` or `HTTP/1.1`.
pub async fn sniff_http_request_line<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
) -> io::Result<bool> {
    if !sniff_http_method(reader).await? {
        return Ok(false);
    }

    let buffered = reader.buffered();
    let window = &buffered[..buffered.len().min(MAX_REQUEST_LINE)];
    let Some(line_end) = window.iter().position(|&b| b == b'\n') else {
        return Ok(true);
    };

    let line = window[..line_end].strip_suffix(b"\r").unwrap_or(&window[..line_end]);
    let mut parts = line.splitn(3, |&b| b == b' ');
    let (Some(_method), Some(_target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Ok(true);
    };

    let ok = version == b"HTTP/1.1" || version == b"HTTP/1.0";
    if !ok {
        debug!(version = %String::from_utf8_lossy(version), "Request line has unsupported version");
    }
    Ok(ok)
}

/// Checks for an HTTP/1.x status line.
pub async fn sniff_http_response<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
) -> io::Result<bool> {
    if reader.peek(1).await?[0] != b'H' {
        return Ok(false);
    }
    Ok(reader.peek(HTTP_RESPONSE_PREFIX.len()).await? == HTTP_RESPONSE_PREFIX)
}

/// Validates a TLS handshake record header.
///
/// Returns false after a single byte when the stream does not start with
/// the handshake content type.
pub async fn sniff_tls_record<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
) -> io::Result<bool> {
    if reader.peek(1).await?[0] != TLS_HANDSHAKE {
        return Ok(false);
    }
    let header = reader.peek(TLS_RECORD_HEADER_LEN).await?;
    Ok(is_tls_record_header(header))
}

/// Sniffs a TLS ClientHello and extracts its SNI.
///
/// `Ok(None)` means the bytes are not a ClientHello. `Ok(Some(info))` with an
/// empty `server_name` means a ClientHello without a usable SNI.
pub async fn sniff_tls_client_hello<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
) -> io::Result<Option<TlsInfo>> {
    if !sniff_tls_record(reader).await? {
        return Ok(None);
    }

    let buffered = reader.buffered();
    let record_len = ((buffered[3] as usize) << 8) | buffered[4] as usize;
    let total = TLS_RECORD_HEADER_LEN + record_len;

    match reader.peek(total).await {
        Ok(record) => Ok(parse_client_hello(record)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!(
                expected = total,
                got = reader.buffered().len(),
                "TLS record truncated by EOF"
            );
            Ok(parse_client_hello(reader.buffered()))
        }
        Err(e) => Err(e),
    }
}

#[inline]
fn is_tls_record_header(header: &[u8]) -> bool {
    if header.len() < TLS_RECORD_HEADER_LEN {
        return false;
    }
    let length = ((header[3] as usize) << 8) | header[4] as usize;
    header[0] == TLS_HANDSHAKE
        && header[1] == TLS_VERSION_MAJOR
        && (0x01..=0x04).contains(&header[2])
        && length > 0
        && length <= MAX_TLS_RECORD_LEN
}

/// Walks a (possibly truncated) TLS record holding a ClientHello.
pub fn parse_client_hello(record: &[u8]) -> Option<TlsInfo> {
    if !is_tls_record_header(record) {
        debug!("Not a TLS handshake record header");
        return None;
    }

    let handshake_start = TLS_RECORD_HEADER_LEN;
    if record.len() <= handshake_start || record[handshake_start] != CLIENT_HELLO {
        debug!("Not a Client Hello message");
        return None;
    }

    // From here on the record is a ClientHello; truncation only costs the SNI.
    let mut info = TlsInfo {
        server_name: String::new(),
        client_version: 0,
    };

    // handshake type(1) + length(3)
    let mut pos = handshake_start + 4;
    let Some(version) = record.get(pos..pos + 2) else {
        return Some(info);
    };
    info.client_version = u16::from_be_bytes([version[0], version[1]]);

    // Skip over version and random
    pos += 2 + 32;

    // Skip session ID
    let Some(&session_id_length) = record.get(pos) else {
        return Some(info);
    };
    pos += 1 + session_id_length as usize;

    // Skip cipher suites
    let Some(len) = read_u16(record, pos) else {
        return Some(info);
    };
    pos += 2 + len as usize;

    // Skip compression methods
    let Some(&compression_methods_length) = record.get(pos) else {
        return Some(info);
    };
    pos += 1 + compression_methods_length as usize;

    let Some(extensions_length) = read_u16(record, pos) else {
        return Some(info);
    };
    pos += 2;
    let extensions_end = (pos + extensions_length as usize).min(record.len());

    while pos + 4 <= extensions_end {
        let extension_type = u16::from_be_bytes([record[pos], record[pos + 1]]);
        let extension_length = u16::from_be_bytes([record[pos + 2], record[pos + 3]]) as usize;
        pos += 4;

        if extension_type == SNI_EXTENSION {
            let end = (pos + extension_length).min(extensions_end);
            if let Some(name) = first_host_name(&record[pos..end]) {
                info.server_name = name;
            }
            return Some(info);
        }
        pos += extension_length;
    }

    Some(info)
}

fn first_host_name(ext: &[u8]) -> Option<String> {
    let list_length = read_u16(ext, 0)? as usize;
    let list = &ext[2..(2 + list_length).min(ext.len())];

    let mut pos = 0;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_length = u16::from_be_bytes([list[pos + 1], list[pos + 2]]) as usize;
        pos += 3;
        let name = list.get(pos..pos + name_length)?;
        pos += name_length;

        if name_type == SNI_HOST_NAME && is_valid_hostname(name) {
            // Hostname bytes are restricted to ASCII, so this cannot fail.
            return std::str::from_utf8(name).ok().map(str::to_string);
        }
    }
    None
}

#[inline]
fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn is_valid_hostname(name: &[u8]) -> bool {
    !name.is_empty()
        && name.len() <= MAX_HOSTNAME_LEN
        && name
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    pub(crate) fn build_client_hello(domain: Option<&str>) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(domain) = domain {
            let name = domain.as_bytes();
            let list_len = 3 + name.len();
            extensions.extend_from_slice(&[0x00, 0x00]);
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(0x00);
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0; 32]);
        body.extend_from_slice(&[0x00, 0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    async fn reader_with(data: &[u8]) -> PeekReader<tokio::io::DuplexStream> {
        let (mut tx, rx) = tokio::io::duplex(1 << 16);
        tx.write_all(data).await.unwrap();
        drop(tx);
        PeekReader::new(rx)
    }

    #[tokio::test]
    async fn test_all_methods_detected() {
        for method in [
            "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "PATCH", "TRACE", "CONNECT",
        ] {
            let request = format!("{} / HTTP/1.1\r\n\r\n", method);
            let mut reader = reader_with(request.as_bytes()).await;
            assert!(sniff_http_method(&mut reader).await.unwrap(), "{}", method);
            // Nothing consumed
            assert_eq!(reader.buffered(), request.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_method_divergence() {
        let mut reader = reader_with(b"GOT / HTTP/1.1\r\n").await;
        assert!(!sniff_http_method(&mut reader).await.unwrap());

        let mut reader = reader_with(b"SSH-2.0-OpenSSH_9.6\r\n").await;
        assert!(!sniff_http_method(&mut reader).await.unwrap());
    }

    #[tokio::test]
    async fn test_method_needs_only_its_own_bytes() {
        // "PUT" is decided after three bytes even though nothing else arrives
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"PUT").await.unwrap();
        let mut reader = PeekReader::new(rx);
        assert!(sniff_http_method(&mut reader).await.unwrap());
        drop(tx);
    }

    #[tokio::test]
    async fn test_method_eof_is_error() {
        let mut reader = reader_with(b"PO").await;
        assert!(sniff_http_method(&mut reader).await.is_err());
        assert_eq!(reader.buffered(), b"PO");
    }

    #[tokio::test]
    async fn test_request_line_versions() {
        let mut reader = reader_with(b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n").await;
        assert!(sniff_http_request_line(&mut reader).await.unwrap());

        let mut reader = reader_with(b"GET / HTTP/1.0\r\n\r\n").await;
        assert!(sniff_http_request_line(&mut reader).await.unwrap());

        let mut reader = reader_with(b"GET / HTTP/2.0\r\n\r\n").await;
        assert!(!sniff_http_request_line(&mut reader).await.unwrap());

        let mut reader = reader_with(b"GET / RTSP/1.0\r\n\r\n").await;
        assert!(!sniff_http_request_line(&mut reader).await.unwrap());
    }

    #[tokio::test]
    async fn test_request_line_incomplete_trusts_method() {
        let mut reader = reader_with(b"GET /a-very-long-path").await;
        assert!(sniff_http_request_line(&mut reader).await.unwrap());
    }

    #[tokio::test]
    async fn test_response_sniff() {
        let mut reader = reader_with(b"HTTP/1.1 200 OK\r\n\r\n").await;
        assert!(sniff_http_response(&mut reader).await.unwrap());

        let mut reader = reader_with(b"\x16\x03\x03\x00\x10").await;
        assert!(!sniff_http_response(&mut reader).await.unwrap());
    }

    #[tokio::test]
    async fn test_client_hello_with_sni() {
        let record = build_client_hello(Some("example.com"));
        let mut reader = reader_with(&record).await;

        let info = sniff_tls_client_hello(&mut reader).await.unwrap().unwrap();
        assert_eq!(info.server_name, "example.com");
        assert_eq!(info.client_version, 0x0303);
        assert_eq!(reader.buffered(), &record[..]);
    }

    #[tokio::test]
    async fn test_client_hello_without_sni() {
        let record = build_client_hello(None);
        let mut reader = reader_with(&record).await;

        let info = sniff_tls_client_hello(&mut reader).await.unwrap().unwrap();
        assert_eq!(info.server_name, "");
    }

    #[tokio::test]
    async fn test_client_hello_rejects_non_tls() {
        let mut reader = reader_with(b"GET / HTTP/1.1\r\n\r\n").await;
        assert!(sniff_tls_client_hello(&mut reader).await.unwrap().is_none());
        assert!(!sniff_tls_record(&mut reader).await.unwrap());
    }

    #[test]
    fn test_record_header_validation() {
        assert!(is_tls_record_header(&[0x16, 0x03, 0x01, 0x00, 0x10]));
        assert!(is_tls_record_header(&[0x16, 0x03, 0x04, 0x40, 0x00]));
        // Bad minor version
        assert!(!is_tls_record_header(&[0x16, 0x03, 0x05, 0x00, 0x10]));
        assert!(!is_tls_record_header(&[0x16, 0x03, 0x00, 0x00, 0x10]));
        // Zero and oversized lengths
        assert!(!is_tls_record_header(&[0x16, 0x03, 0x01, 0x00, 0x00]));
        assert!(!is_tls_record_header(&[0x16, 0x03, 0x01, 0x40, 0x01]));
        // Alert record
        assert!(!is_tls_record_header(&[0x15, 0x03, 0x01, 0x00, 0x02]));
    }

    #[test]
    fn test_invalid_hostname_characters() {
        let record = build_client_hello(Some("bad host!"));
        let info = parse_client_hello(&record).unwrap();
        assert_eq!(info.server_name, "");

        let record = build_client_hello(Some("under_score.example-site.com"));
        let info = parse_client_hello(&record).unwrap();
        assert_eq!(info.server_name, "under_score.example-site.com");
    }

    #[test]
    fn test_truncated_client_hello() {
        let record = build_client_hello(Some("example.com"));
        // Cut inside the extensions block
        let info = parse_client_hello(&record[..record.len() - 4]).unwrap();
        assert_eq!(info.server_name, "");
        assert_eq!(info.client_version, 0x0303);

        // Not a ClientHello handshake type
        let mut server_hello = record.clone();
        server_hello[5] = 0x02;
        assert!(parse_client_hello(&server_hello).is_none());
    }
}
