//! Incremental HTTP/1.x head parser and the editable message head built on it.
//!
//! [`HttpParser`] tokenizes a buffer that starts at a message boundary and
//! records byte offsets for every header. It keeps no progress between
//! calls: a `MissingData` result means "read more and parse the longer
//! buffer again".
//!
//! [`HttpHead`] owns the head bytes of one message together with its tokens.
//! Edits splice the owned buffer and re-tokenize it, so offsets always
//! describe the current bytes.

use crate::peek::PeekReader;
use bytes::BytesMut;
use std::io;
use std::ops::Range;
use std::sync::OnceLock;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

const HEADER_SLOT_GROWTH: usize = 10;
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The buffer ends before the blank line closing the head.
    #[error("incomplete message head")]
    MissingData,
    /// Broken line terminator or an unparseable line.
    #[error("malformed message head")]
    BadProto,
}

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("message head exceeds {0} bytes")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NextHeader,
    NextHeaderCr,
    HeaderName,
    HeaderValueLeadingSpace,
    HeaderValue,
    HeaderValueCr,
    FoldedLeadingSpace,
    FoldedValue,
}

/// One header line as found in the buffer.
#[derive(Debug, Clone)]
pub struct HeaderToken {
    name: Range<usize>,
    value: Range<usize>,
    line: Range<usize>,
    /// Space-joined value when continuation lines followed the header.
    folded: Option<Vec<u8>>,
}

impl HeaderToken {
    pub fn name<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.name.clone()]
    }

    pub fn value<'a>(&'a self, buf: &'a [u8]) -> &'a [u8] {
        match &self.folded {
            Some(joined) => joined,
            None => &buf[self.value.clone()],
        }
    }

    /// Offsets of the value on its first line.
    pub fn value_range(&self) -> Range<usize> {
        self.value.clone()
    }

    /// Offsets of the whole header, continuation lines and terminator included.
    pub fn line_range(&self) -> Range<usize> {
        self.line.clone()
    }

    pub fn is_folded(&self) -> bool {
        self.folded.is_some()
    }
}

/// A header lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRef<'a> {
    pub value: &'a [u8],
    pub start: usize,
    pub end: usize,
    pub folded: bool,
}

/// Offsets of a parsed head. For a status line the three start-line parts
/// are version, status code and reason phrase.
#[derive(Debug, Clone, Default)]
pub struct HttpParser {
    method: Range<usize>,
    target: Range<usize>,
    version: Range<usize>,
    headers: Vec<HeaderToken>,
    body_offset: usize,
    content_length: OnceLock<Option<u64>>,
    host: OnceLock<Option<String>>,
}

impl HttpParser {
    pub fn new() -> Self {
        Self {
            headers: Vec::with_capacity(HEADER_SLOT_GROWTH),
            ..Default::default()
        }
    }

    /// Tokenizes `buf` and returns the offset of the first body byte.
    pub fn parse(&mut self, buf: &[u8]) -> Result<usize, ParseError> {
        self.headers.clear();
        self.body_offset = 0;
        self.content_length = OnceLock::new();
        self.host = OnceLock::new();

        let mut pos = self.parse_start_line(buf)?;

        let mut state = State::NextHeader;
        let mut name = 0..0;
        let mut line_start = 0;
        let mut value_start = 0;
        let mut value_end = 0;
        let mut folding = false;

        while pos < buf.len() {
            let c = buf[pos];
            match state {
                State::NextHeader => match c {
                    b'\r' => state = State::NextHeaderCr,
                    b'\n' => return Ok(self.finish(pos + 1)),
                    b' ' | b'\t' => {
                        if self.headers.is_empty() {
                            return Err(ParseError::BadProto);
                        }
                        folding = true;
                        state = State::FoldedLeadingSpace;
                    }
                    _ => {
                        line_start = pos;
                        name.start = pos;
                        folding = false;
                        state = State::HeaderName;
                    }
                },
                State::NextHeaderCr => {
                    if c != b'\n' {
                        return Err(ParseError::BadProto);
                    }
                    return Ok(self.finish(pos + 1));
                }
                State::HeaderName => match c {
                    b':' => {
                        if pos == name.start {
                            return Err(ParseError::BadProto);
                        }
                        name.end = pos;
                        state = State::HeaderValueLeadingSpace;
                    }
                    b'\r' | b'\n' => return Err(ParseError::BadProto),
                    _ => {}
                },
                State::HeaderValueLeadingSpace | State::FoldedLeadingSpace => match c {
                    b' ' | b'\t' => {}
                    b'\r' => {
                        value_start = pos;
                        value_end = pos;
                        state = State::HeaderValueCr;
                    }
                    b'\n' => {
                        self.end_line(buf, name.clone(), line_start, pos..pos, pos + 1, folding);
                        state = State::NextHeader;
                    }
                    _ => {
                        value_start = pos;
                        state = if folding {
                            State::FoldedValue
                        } else {
                            State::HeaderValue
                        };
                    }
                },
                State::HeaderValue | State::FoldedValue => match c {
                    b'\r' => {
                        value_end = pos;
                        state = State::HeaderValueCr;
                    }
                    b'\n' => {
                        self.end_line(buf, name.clone(), line_start, value_start..pos, pos + 1, folding);
                        state = State::NextHeader;
                    }
                    _ => {}
                },
                State::HeaderValueCr => {
                    if c != b'\n' {
                        return Err(ParseError::BadProto);
                    }
                    self.end_line(
                        buf,
                        name.clone(),
                        line_start,
                        value_start..value_end,
                        pos + 1,
                        folding,
                    );
                    state = State::NextHeader;
                }
            }
            pos += 1;
        }

        Err(ParseError::MissingData)
    }

    fn parse_start_line(&mut self, buf: &[u8]) -> Result<usize, ParseError> {
        let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
            // A stray CR before any newline can never become valid.
            if let Some(cr) = buf.iter().position(|&b| b == b'\r')
                && cr + 1 < buf.len()
            {
                return Err(ParseError::BadProto);
            }
            return Err(ParseError::MissingData);
        };

        let content_end = if newline > 0 && buf[newline - 1] == b'\r' {
            newline - 1
        } else {
            newline
        };
        let line = &buf[..content_end];
        if line.is_empty() || line.contains(&b'\r') {
            return Err(ParseError::BadProto);
        }

        let first_space = line
            .iter()
            .position(|&b| b == b' ')
            .ok_or(ParseError::BadProto)?;
        if first_space == 0 {
            return Err(ParseError::BadProto);
        }
        self.method = 0..first_space;

        let rest = first_space + 1;
        match line[rest..].iter().position(|&b| b == b' ') {
            Some(second_space) => {
                self.target = rest..rest + second_space;
                self.version = rest + second_space + 1..content_end;
            }
            None => {
                // Status line without a reason phrase.
                self.target = rest..content_end;
                self.version = content_end..content_end;
            }
        }

        Ok(newline + 1)
    }

    fn end_line(
        &mut self,
        buf: &[u8],
        name: Range<usize>,
        line_start: usize,
        value: Range<usize>,
        line_end: usize,
        folding: bool,
    ) {
        if folding {
            if let Some(last) = self.headers.last_mut() {
                let mut joined = match last.folded.take() {
                    Some(joined) => joined,
                    None => buf[last.value.clone()].to_vec(),
                };
                let continuation = &buf[value];
                if !continuation.is_empty() {
                    if !joined.is_empty() {
                        joined.push(b' ');
                    }
                    joined.extend_from_slice(continuation);
                }
                last.folded = Some(joined);
                last.line.end = line_end;
            }
            return;
        }

        if self.headers.len() == self.headers.capacity() {
            self.headers.reserve_exact(HEADER_SLOT_GROWTH);
        }
        self.headers.push(HeaderToken {
            name,
            value,
            line: line_start..line_end,
            folded: None,
        });
    }

    fn finish(&mut self, body_offset: usize) -> usize {
        self.body_offset = body_offset;
        body_offset
    }

    pub fn body_offset(&self) -> usize {
        self.body_offset
    }

    pub fn headers(&self) -> &[HeaderToken] {
        &self.headers
    }

    pub fn method<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.method.clone()]
    }

    pub fn target<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.target.clone()]
    }

    pub fn version<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.version.clone()]
    }

    /// Looks a header up by name: exact match first, then ASCII
    /// case-insensitive.
    pub fn find_header<'a>(&'a self, buf: &'a [u8], name: &str) -> Option<HeaderRef<'a>> {
        let name = name.as_bytes();
        let token = self
            .headers
            .iter()
            .find(|h| h.name(buf) == name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|h| h.name(buf).eq_ignore_ascii_case(name))
            })?;

        Some(HeaderRef {
            value: token.value(buf),
            start: token.value.start,
            end: token.value.end,
            folded: token.is_folded(),
        })
    }

    fn find_token(&self, buf: &[u8], name: &str) -> Option<&HeaderToken> {
        let name = name.as_bytes();
        self.headers
            .iter()
            .find(|h| h.name(buf) == name)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|h| h.name(buf).eq_ignore_ascii_case(name))
            })
    }

    /// `Content-Length`, parsed on first use. `None` when absent or not a
    /// number.
    pub fn content_length(&self, buf: &[u8]) -> Option<u64> {
        *self.content_length.get_or_init(|| {
            let header = self.find_header(buf, "Content-Length")?;
            std::str::from_utf8(header.value).ok()?.trim().parse().ok()
        })
    }

    /// `Host` header value, extracted on first use.
    pub fn host(&self, buf: &[u8]) -> Option<&str> {
        self.host
            .get_or_init(|| {
                let header = self.find_header(buf, "Host")?;
                Some(String::from_utf8_lossy(header.value).trim().to_string())
            })
            .as_deref()
    }

    fn clear_caches(&mut self) {
        self.content_length = OnceLock::new();
        self.host = OnceLock::new();
    }
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Response body runs until the server closes the connection.
    UntilClose,
}

/// The head of one HTTP message plus its tokens.
#[derive(Debug, Clone)]
pub struct HttpHead {
    buf: Vec<u8>,
    parser: HttpParser,
}

impl HttpHead {
    /// Parses a complete head. Bytes after the head are ignored.
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        let mut parser = HttpParser::new();
        let end = parser.parse(buf)?;
        Ok(Self {
            buf: buf[..end].to_vec(),
            parser,
        })
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn parser(&self) -> &HttpParser {
        &self.parser
    }

    pub fn method(&self) -> &[u8] {
        self.parser.method(&self.buf)
    }

    pub fn target(&self) -> &[u8] {
        self.parser.target(&self.buf)
    }

    pub fn version(&self) -> &[u8] {
        self.parser.version(&self.buf)
    }

    /// Status code of a response head; 0 when the head is not a response.
    pub fn status_code(&self) -> u16 {
        if !self.method().starts_with(b"HTTP/") {
            return 0;
        }
        std::str::from_utf8(self.target())
            .ok()
            .and_then(|code| code.parse().ok())
            .unwrap_or(0)
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.parser.find_header(&self.buf, name).map(|h| h.value)
    }

    /// Header value as text; invalid UTF-8 is replaced.
    pub fn header_str(&self, name: &str) -> Option<String> {
        self.header(name)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    pub fn find_header(&self, name: &str) -> Option<HeaderRef<'_>> {
        self.parser.find_header(&self.buf, name)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.parser
            .headers()
            .iter()
            .map(|h| (h.name(&self.buf), h.value(&self.buf)))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.parser.content_length(&self.buf)
    }

    pub fn host(&self) -> Option<&str> {
        self.parser.host(&self.buf)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .map(|value| has_token(value, b"chunked"))
            .unwrap_or(false)
    }

    /// `Upgrade: websocket` together with `Connection: upgrade`.
    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self
            .header("Upgrade")
            .map(|value| has_token(value, b"websocket"))
            .unwrap_or(false);
        let connection = self
            .header("Connection")
            .map(|value| has_token(value, b"upgrade"))
            .unwrap_or(false);
        upgrade && connection
    }

    pub fn request_framing(&self) -> BodyFraming {
        if self.is_chunked() {
            return BodyFraming::Chunked;
        }
        match self.content_length() {
            Some(0) | None => BodyFraming::None,
            Some(n) => BodyFraming::Length(n),
        }
    }

    /// Body framing of a response to a request made with `request_method`.
    pub fn response_framing(&self, request_method: Option<&[u8]>) -> BodyFraming {
        let status = self.status_code();
        if request_method == Some(b"HEAD".as_slice())
            || (100..200).contains(&status)
            || status == 204
            || status == 304
        {
            return BodyFraming::None;
        }
        if self.is_chunked() {
            return BodyFraming::Chunked;
        }
        match self.content_length() {
            Some(0) => BodyFraming::None,
            Some(n) => BodyFraming::Length(n),
            None => BodyFraming::UntilClose,
        }
    }

    /// Overwrites a single-line header value in place without moving any
    /// other byte: the new value is padded with spaces or truncated to the
    /// length of the old one. Folded headers are rewritten with
    /// [`HttpHead::set_header`] instead.
    ///
    /// Returns false when the header is absent.
    pub fn overwrite_header_fixed(&mut self, name: &str, value: &str) -> Result<bool, ParseError> {
        validate_value(value)?;
        let Some(header) = self.parser.find_header(&self.buf, name) else {
            return Ok(false);
        };
        if header.folded {
            self.set_header(name, value)?;
            return Ok(true);
        }

        let (start, end) = (header.start, header.end);
        let width = end - start;
        let slot = &mut self.buf[start..end];
        let bytes = value.as_bytes();
        let copied = bytes.len().min(width);
        slot[..copied].copy_from_slice(&bytes[..copied]);
        slot[copied..].fill(b' ');
        self.parser.clear_caches();
        Ok(true)
    }

    /// Replaces a header value, adding the header when it is missing.
    ///
    /// A single-line value is spliced in place; a folded header is written
    /// back as one line over its whole span.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        validate_value(value)?;
        let Some(token) = self.parser.find_token(&self.buf, name) else {
            return self.add_header(name, value);
        };

        if token.is_folded() {
            let line = token.line_range();
            let mut replacement = token.name(&self.buf).to_vec();
            replacement.extend_from_slice(b": ");
            replacement.extend_from_slice(value.as_bytes());
            replacement.extend_from_slice(b"\r\n");
            self.splice(line, &replacement)
        } else {
            let range = token.value_range();
            self.splice(range, value.as_bytes())
        }
    }

    /// Removes every occurrence of a header; returns how many were removed.
    pub fn delete_header(&mut self, name: &str) -> Result<usize, ParseError> {
        let mut removed = 0;
        while let Some(token) = self.parser.find_token(&self.buf, name) {
            let line = token.line_range();
            self.splice(line, b"")?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Appends a header line right before the blank line ending the head.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), ParseError> {
        validate_name(name)?;
        validate_value(value)?;
        let terminator = if self.buf.ends_with(b"\r\n") { 2 } else { 1 };
        let at = self.buf.len() - terminator;

        let mut line = Vec::with_capacity(name.len() + value.len() + 4);
        line.extend_from_slice(name.as_bytes());
        line.extend_from_slice(b": ");
        line.extend_from_slice(value.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.splice(at..at, &line)
    }

    fn splice(&mut self, range: Range<usize>, replacement: &[u8]) -> Result<(), ParseError> {
        let mut buf = Vec::with_capacity(self.buf.len() - range.len() + replacement.len());
        buf.extend_from_slice(&self.buf[..range.start]);
        buf.extend_from_slice(replacement);
        buf.extend_from_slice(&self.buf[range.end..]);

        let mut parser = HttpParser::new();
        if parser.parse(&buf)? != buf.len() {
            return Err(ParseError::BadProto);
        }
        self.buf = buf;
        self.parser = parser;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), ParseError> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':');
    if ok { Ok(()) } else { Err(ParseError::BadProto) }
}

fn validate_value(value: &str) -> Result<(), ParseError> {
    if value.bytes().any(|b| b == b'\r' || b == b'\n') {
        return Err(ParseError::BadProto);
    }
    Ok(())
}

/// Comma-separated token list membership, ASCII case-insensitive.
fn has_token(value: &[u8], token: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| part.trim_ascii().eq_ignore_ascii_case(token))
}

/// Reads one complete head from `reader`, consuming exactly its bytes.
///
/// The buffer is re-parsed from the start after every read. Nothing is
/// consumed on error, so the caller can hand the reader to the raw path.
pub async fn read_head<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
    max_size: usize,
) -> Result<HttpHead, HeadError> {
    let mut parser = HttpParser::new();
    loop {
        match parser.parse(reader.buffered()) {
            Ok(end) => {
                let buf = reader.take(end).to_vec();
                return Ok(HttpHead { buf, parser });
            }
            Err(ParseError::MissingData) => {
                if reader.buffered().len() >= max_size {
                    return Err(HeadError::TooLarge(max_size));
                }
                if reader.fill().await? == 0 {
                    return Err(HeadError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed inside a message head",
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
    Done,
}

/// Pulls the body of one message off a reader piece by piece, framing bytes
/// included, so the caller decides where each piece goes and when.
#[derive(Debug)]
pub struct BodyStream {
    state: BodyState,
}

impl BodyStream {
    /// `UntilClose` yields nothing; the caller relays the rest of the stream.
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Length(0) | BodyFraming::None | BodyFraming::UntilClose => {
                BodyState::Done
            }
            BodyFraming::Length(n) => BodyState::Length(n),
            BodyFraming::Chunked => BodyState::ChunkSize,
        };
        Self { state }
    }

    /// Returns the next piece of the body, or `None` once it is complete.
    ///
    /// A malformed chunk-size or chunk-terminator line fails with
    /// `InvalidData` and stays buffered in `reader`.
    pub async fn next_piece<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut PeekReader<R>,
    ) -> io::Result<Option<BytesMut>> {
        match self.state {
            BodyState::Done => Ok(None),
            BodyState::Length(remaining) => {
                let piece = reader.read_some(remaining).await?;
                let left = remaining - piece.len() as u64;
                self.state = if left == 0 {
                    BodyState::Done
                } else {
                    BodyState::Length(left)
                };
                Ok(Some(piece))
            }
            BodyState::ChunkSize => {
                let len = reader.peek_line(MAX_CHUNK_LINE).await?;
                let size = parse_chunk_size(&reader.buffered()[..len])?;
                self.state = if size == 0 {
                    BodyState::Trailers
                } else {
                    BodyState::ChunkData(size)
                };
                Ok(Some(reader.take(len)))
            }
            BodyState::ChunkData(remaining) => {
                let piece = reader.read_some(remaining).await?;
                let left = remaining - piece.len() as u64;
                self.state = if left == 0 {
                    BodyState::ChunkEnd
                } else {
                    BodyState::ChunkData(left)
                };
                Ok(Some(piece))
            }
            BodyState::ChunkEnd => {
                let len = reader.peek_line(MAX_CHUNK_LINE).await?;
                if !is_empty_line(&reader.buffered()[..len]) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "chunk data not followed by CRLF",
                    ));
                }
                self.state = BodyState::ChunkSize;
                Ok(Some(reader.take(len)))
            }
            BodyState::Trailers => {
                // Trailer section ends with an empty line
                let line = reader.read_line(MAX_CHUNK_LINE).await?;
                if is_empty_line(&line) {
                    self.state = BodyState::Done;
                }
                Ok(Some(line))
            }
        }
    }
}

/// Moves the body described by `framing` from `reader` to `out`.
pub async fn forward_body<R, W>(
    reader: &mut PeekReader<R>,
    framing: BodyFraming,
    out: &mut W,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut body = BodyStream::new(framing);
    while let Some(piece) = body.next_piece(reader).await? {
        out.write_all(&piece).await?;
    }
    Ok(())
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let digits = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or_default()
        .trim_ascii();
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

#[inline]
fn is_empty_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}
