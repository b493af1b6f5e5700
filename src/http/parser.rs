//! Incremental HTTP/1.x message parser.
//!
//! A [`Parser`] is fed the receive buffer every time new bytes arrive. The
//! buffer must start at the first byte of the message being parsed and may
//! only grow between calls, until the parser reports
//! [`ParseResult::Complete`]; the caller then drops the consumed prefix and
//! keeps feeding the remainder. Progress is remembered across calls, so
//! bytes already classified are never scanned twice.
//!
//! The outcome is a function of the bytes alone: delivering a stream one
//! byte at a time or all at once yields the same messages and the same
//! error, if any.

use std::marker::PhantomData;

use crate::http::framing::Framing;
use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};

/// Longest accepted start line, CRLF included.
pub const MAX_START_LINE: usize = 8 * 1024;
/// Longest accepted start line plus header fields.
pub const MAX_HEADER_SECTION: usize = 64 * 1024;
/// Longest accepted chunk-size line, extensions included.
pub const MAX_CHUNK_LINE: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("bad start line")]
    BadStartLine,
    #[error("invalid header field")]
    InvalidHeader,
    #[error("header section too large")]
    HeadersTooLarge,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    InvalidTransferEncoding,
    #[error("both Content-Length and Transfer-Encoding present")]
    AmbiguousBodyLength,
    #[error("bad chunk syntax")]
    BadChunk,
    #[error("trailing garbage after message end ({len} bytes)")]
    TrailingGarbage { len: usize },
    #[error("connection closed in the middle of a message")]
    UnexpectedEof,
}

/// Outcome of one [`Parser::feed`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult<M> {
    /// More bytes are needed. Nothing may be dropped from the buffer.
    Incomplete,
    /// A full message and the number of leading buffer bytes it occupied.
    Complete(M, usize),
    /// The bytes can never form a valid message.
    Malformed(ParseError),
}

/// Fields shared by requests and responses, handed over once a message is
/// complete.
pub struct Parts {
    pub headers: Headers,
    pub body: Vec<u8>,
    pub trailer: Headers,
    pub framing: Framing,
}

/// A message kind the parser can produce.
pub trait HttpMessage: Sized {
    type StartLine;

    fn parse_start_line(line: &[u8]) -> Result<Self::StartLine, ParseError>;

    /// Picks the body framing once the header section is complete.
    /// `request_method` is the method of the request a response answers.
    fn framing(
        start: &Self::StartLine,
        headers: &Headers,
        request_method: Option<&Method>,
    ) -> Result<Framing, ParseError>;

    fn assemble(start: Self::StartLine, parts: Parts) -> Self;
}

pub type RequestParser = Parser<Request>;
pub type ResponseParser = Parser<Response>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    Body(Body),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Fixed { remaining: usize },
    ChunkSize,
    ChunkData { remaining: usize },
    ChunkDataEnd,
    /// Offset where the trailer section begins.
    Trailer { start: usize },
    UntilClose,
}

pub struct Parser<M: HttpMessage> {
    state: State,
    pos: usize,
    start: Option<M::StartLine>,
    headers: Headers,
    trailer: Headers,
    body: Vec<u8>,
    framing: Framing,
    request_method: Option<Method>,
    error: Option<ParseError>,
    _message: PhantomData<fn() -> M>,
}

impl<M: HttpMessage> Default for Parser<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: HttpMessage> Parser<M> {
    pub fn new() -> Self {
        Self {
            state: State::StartLine,
            pos: 0,
            start: None,
            headers: Headers::new(),
            trailer: Headers::new(),
            body: Vec::new(),
            framing: Framing::None,
            request_method: None,
            error: None,
            _message: PhantomData,
        }
    }

    /// Sets the method of the request the next response answers. Ignored when
    /// parsing requests.
    pub fn set_request_method(&mut self, method: Option<Method>) {
        self.request_method = method;
    }

    /// True while no byte of a new message has been classified.
    pub fn is_idle(&self) -> bool {
        self.state == State::StartLine && self.pos == 0
    }

    /// Advances over whatever `buf` holds.
    ///
    /// Once `Malformed` is returned the parser stays failed and returns the
    /// same error for every later call.
    pub fn feed(&mut self, buf: &[u8]) -> ParseResult<M> {
        if let Some(err) = &self.error {
            return ParseResult::Malformed(err.clone());
        }
        if buf.len() < self.pos {
            // The caller dropped bytes we had already scanned; start over.
            self.reset();
        }

        match self.advance(buf) {
            Ok(Some(message)) => {
                let consumed = self.pos;
                self.reset();
                ParseResult::Complete(message, consumed)
            }
            Ok(None) => ParseResult::Incomplete,
            Err(err) => {
                self.error = Some(err.clone());
                ParseResult::Malformed(err)
            }
        }
    }

    /// Signals that the peer closed the connection after sending `buf`.
    ///
    /// Completes a close-delimited body. An empty buffer between messages is
    /// a clean close and yields `Incomplete`; anything else left unfinished
    /// is `UnexpectedEof`.
    pub fn finish(&mut self, buf: &[u8]) -> ParseResult<M> {
        match self.feed(buf) {
            ParseResult::Incomplete => {}
            done => return done,
        }

        match self.state {
            State::StartLine if buf.is_empty() => ParseResult::Incomplete,
            State::Body(Body::UntilClose) => match self.assemble() {
                Ok(message) => {
                    let consumed = self.pos;
                    self.reset();
                    ParseResult::Complete(message, consumed)
                }
                Err(err) => self.fail(err),
            },
            _ => self.fail(ParseError::UnexpectedEof),
        }
    }

    fn fail(&mut self, err: ParseError) -> ParseResult<M> {
        self.error = Some(err.clone());
        ParseResult::Malformed(err)
    }

    fn reset(&mut self) {
        self.state = State::StartLine;
        self.pos = 0;
        self.start = None;
        self.headers = Headers::new();
        self.trailer = Headers::new();
        self.body = Vec::new();
        self.framing = Framing::None;
    }

    fn assemble(&mut self) -> Result<M, ParseError> {
        let start = self.start.take().ok_or(ParseError::BadStartLine)?;
        Ok(M::assemble(
            start,
            Parts {
                headers: std::mem::take(&mut self.headers),
                body: std::mem::take(&mut self.body),
                trailer: std::mem::take(&mut self.trailer),
                framing: self.framing,
            },
        ))
    }

    fn advance(&mut self, buf: &[u8]) -> Result<Option<M>, ParseError> {
        loop {
            match self.state {
                State::StartLine => {
                    let Some(line) = take_line(
                        buf,
                        self.pos,
                        MAX_START_LINE,
                        ParseError::BadStartLine,
                        ParseError::BadStartLine,
                    )?
                    else {
                        return Ok(None);
                    };
                    self.start = Some(M::parse_start_line(&buf[line.content])?);
                    self.pos = line.next;
                    self.state = State::Headers;
                }

                State::Headers => {
                    let limit = MAX_HEADER_SECTION.saturating_sub(self.pos);
                    let Some(line) = take_line(
                        buf,
                        self.pos,
                        limit,
                        ParseError::InvalidHeader,
                        ParseError::HeadersTooLarge,
                    )?
                    else {
                        return Ok(None);
                    };
                    self.pos = line.next;

                    if line.content.is_empty() {
                        let start = self.start.as_ref().ok_or(ParseError::BadStartLine)?;
                        self.framing =
                            M::framing(start, &self.headers, self.request_method.as_ref())?;
                        self.state = match self.framing {
                            Framing::None | Framing::ContentLength(0) => State::Done,
                            Framing::ContentLength(n) => State::Body(Body::Fixed { remaining: n }),
                            Framing::Chunked => State::Body(Body::ChunkSize),
                            Framing::CloseDelimited => State::Body(Body::UntilClose),
                        };
                    } else {
                        let (name, value) = parse_field(&buf[line.content])?;
                        self.headers.add(name, value);
                    }
                }

                State::Body(Body::Fixed { remaining }) => {
                    let left = self.copy_body(buf, remaining);
                    if left > 0 {
                        self.state = State::Body(Body::Fixed { remaining: left });
                        return Ok(None);
                    }
                    self.state = State::Done;
                }

                State::Body(Body::ChunkSize) => {
                    let Some(line) = take_line(
                        buf,
                        self.pos,
                        MAX_CHUNK_LINE,
                        ParseError::BadChunk,
                        ParseError::BadChunk,
                    )?
                    else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&buf[line.content])?;
                    self.pos = line.next;
                    self.state = if size == 0 {
                        State::Body(Body::Trailer { start: line.next })
                    } else {
                        State::Body(Body::ChunkData { remaining: size })
                    };
                }

                State::Body(Body::ChunkData { remaining }) => {
                    let left = self.copy_body(buf, remaining);
                    if left > 0 {
                        self.state = State::Body(Body::ChunkData { remaining: left });
                        return Ok(None);
                    }
                    self.state = State::Body(Body::ChunkDataEnd);
                }

                State::Body(Body::ChunkDataEnd) => {
                    if buf.len() < self.pos + 2 {
                        return Ok(None);
                    }
                    if &buf[self.pos..self.pos + 2] != b"\r\n" {
                        return Err(ParseError::BadChunk);
                    }
                    self.pos += 2;
                    self.state = State::Body(Body::ChunkSize);
                }

                State::Body(Body::Trailer { start }) => {
                    let limit = MAX_HEADER_SECTION.saturating_sub(self.pos - start);
                    let Some(line) = take_line(
                        buf,
                        self.pos,
                        limit,
                        ParseError::BadChunk,
                        ParseError::HeadersTooLarge,
                    )?
                    else {
                        return Ok(None);
                    };
                    self.pos = line.next;
                    if line.content.is_empty() {
                        self.state = State::Done;
                    } else {
                        let (name, value) = parse_field(&buf[line.content])?;
                        self.trailer.add(name, value);
                    }
                }

                State::Body(Body::UntilClose) => {
                    self.body.extend_from_slice(&buf[self.pos..]);
                    self.pos = buf.len();
                    return Ok(None);
                }

                State::Done => return self.assemble().map(Some),
            }
        }
    }

    /// Moves up to `remaining` body bytes out of `buf`, returns what is
    /// still missing.
    fn copy_body(&mut self, buf: &[u8], remaining: usize) -> usize {
        let take = remaining.min(buf.len() - self.pos);
        self.body.extend_from_slice(&buf[self.pos..self.pos + take]);
        self.pos += take;
        remaining - take
    }
}

impl ResponseParser {
    /// Parser for the response to a request sent with `method`.
    pub fn for_request(method: Option<Method>) -> Self {
        let mut parser = Self::new();
        parser.set_request_method(method);
        parser
    }
}

struct Line {
    content: std::ops::Range<usize>,
    next: usize,
}

/// Finds the CRLF-terminated line starting at `from`.
///
/// The line, CRLF included, must fit in `limit` bytes; otherwise
/// `too_long`. A line ending in a bare LF is `bad`.
fn take_line(
    buf: &[u8],
    from: usize,
    limit: usize,
    bad: ParseError,
    too_long: ParseError,
) -> Result<Option<Line>, ParseError> {
    let window_end = buf.len().min(from.saturating_add(limit));
    match buf[from..window_end].iter().position(|&b| b == b'\n') {
        Some(offset) => {
            let lf = from + offset;
            if lf == from || buf[lf - 1] != b'\r' {
                return Err(bad);
            }
            Ok(Some(Line {
                content: from..lf - 1,
                next: lf + 1,
            }))
        }
        None if buf.len() - from >= limit => Err(too_long),
        None => Ok(None),
    }
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn is_field_byte(b: u8) -> bool {
    b == b'\t' || b == b' ' || (0x21..=0x7e).contains(&b) || b >= 0x80
}

/// `HTTP/` DIGIT `.` DIGIT
fn parse_version(v: &[u8]) -> Result<String, ParseError> {
    match v {
        [b'H', b'T', b'T', b'P', b'/', major, b'.', minor]
            if major.is_ascii_digit() && minor.is_ascii_digit() =>
        {
            Ok(String::from_utf8_lossy(v).into_owned())
        }
        _ => Err(ParseError::BadStartLine),
    }
}

/// Splits `name: value`, rejecting whitespace before the colon, empty or
/// non-token names, control bytes and obsolete line folding.
fn parse_field(line: &[u8]) -> Result<(String, String), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let (name, value) = (&line[..colon], &line[colon + 1..]);

    if name.is_empty() || !name.iter().all(|&b| is_tchar(b)) {
        return Err(ParseError::InvalidHeader);
    }
    if !value.iter().all(|&b| is_field_byte(b)) {
        return Err(ParseError::InvalidHeader);
    }

    let name = std::str::from_utf8(name).map_err(|_| ParseError::InvalidHeader)?;
    let value = std::str::from_utf8(value).map_err(|_| ParseError::InvalidHeader)?;
    Ok((name.to_string(), value.trim_matches([' ', '\t']).to_string()))
}

/// 1*HEXDIG [ BWS ";" chunk-ext ]
fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let digits = line.iter().take_while(|b| b.is_ascii_hexdigit()).count();
    if digits == 0 {
        return Err(ParseError::BadChunk);
    }

    let rest = &line[digits..];
    let ext = rest
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .map(|i| &rest[i..])
        .unwrap_or_default();
    if !ext.is_empty() && (ext[0] != b';' || !ext.iter().all(|&b| is_field_byte(b))) {
        return Err(ParseError::BadChunk);
    }

    line[..digits].iter().try_fold(0usize, |acc, &b| {
        let digit = (b as char).to_digit(16).ok_or(ParseError::BadChunk)? as usize;
        acc.checked_mul(16)
            .and_then(|acc| acc.checked_add(digit))
            .ok_or(ParseError::BadChunk)
    })
}

fn content_length(headers: &Headers) -> Result<usize, ParseError> {
    let mut length = None;
    for value in headers.get_list("Content-Length") {
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let n: usize = value.parse().map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(prev) if prev != n => return Err(ParseError::InvalidContentLength),
            _ => length = Some(n),
        }
    }
    length.ok_or(ParseError::InvalidContentLength)
}

/// Framing from `Transfer-Encoding` / `Content-Length`.
///
/// A request without either has no body; a response without either, or
/// with a transfer coding other than a final `chunked`, runs until close.
fn body_framing(headers: &Headers, is_request: bool) -> Result<Framing, ParseError> {
    let has_length = headers.contains("Content-Length");

    if headers.contains("Transfer-Encoding") {
        if has_length {
            return Err(ParseError::AmbiguousBodyLength);
        }
        let codings: Vec<&str> = headers.get_list("Transfer-Encoding").collect();
        let chunked_last = codings
            .last()
            .is_some_and(|c| c.eq_ignore_ascii_case("chunked"));
        let chunked_before = codings
            .iter()
            .rev()
            .skip(1)
            .any(|c| c.eq_ignore_ascii_case("chunked"));

        return match (chunked_last && !chunked_before, is_request) {
            (true, _) => Ok(Framing::Chunked),
            (false, true) => Err(ParseError::InvalidTransferEncoding),
            (false, false) => Ok(Framing::CloseDelimited),
        };
    }

    if has_length {
        return Ok(Framing::ContentLength(content_length(headers)?));
    }

    Ok(if is_request {
        Framing::None
    } else {
        Framing::CloseDelimited
    })
}

impl HttpMessage for Request {
    type StartLine = (Method, String, String);

    /// method SP request-target SP HTTP-version
    fn parse_start_line(line: &[u8]) -> Result<Self::StartLine, ParseError> {
        let mut parts = line.split(|&b| b == b' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::BadStartLine);
        };

        if method.is_empty() || !method.iter().all(|&b| is_tchar(b)) {
            return Err(ParseError::BadStartLine);
        }
        if target.is_empty() || !target.iter().all(|b| (0x21..=0x7e).contains(b)) {
            return Err(ParseError::BadStartLine);
        }
        let version = parse_version(version)?;

        // Both checked to be ASCII above.
        let method = Method::parse(&String::from_utf8_lossy(method));
        let target = String::from_utf8_lossy(target).into_owned();
        Ok((method, target, version))
    }

    fn framing(
        _start: &Self::StartLine,
        headers: &Headers,
        _request_method: Option<&Method>,
    ) -> Result<Framing, ParseError> {
        body_framing(headers, true)
    }

    fn assemble((method, uri, version): Self::StartLine, parts: Parts) -> Self {
        Request {
            method,
            uri,
            version,
            headers: parts.headers,
            body: parts.body,
            trailer: parts.trailer,
            framing: parts.framing,
            original: None,
        }
    }
}

impl HttpMessage for Response {
    type StartLine = (String, StatusCode, String);

    /// HTTP-version SP 3DIGIT [ SP reason-phrase ]
    fn parse_start_line(line: &[u8]) -> Result<Self::StartLine, ParseError> {
        if line.len() < 12 || line[8] != b' ' {
            return Err(ParseError::BadStartLine);
        }
        let version = parse_version(&line[..8])?;

        let code = &line[9..12];
        if !code.iter().all(u8::is_ascii_digit) {
            return Err(ParseError::BadStartLine);
        }
        let status = code
            .iter()
            .fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'));

        let reason: &[u8] = match &line[12..] {
            [] => &[],
            [b' ', rest @ ..] if rest.iter().all(|&b| is_field_byte(b)) => rest,
            _ => return Err(ParseError::BadStartLine),
        };

        Ok((
            version,
            StatusCode(status),
            String::from_utf8_lossy(reason).into_owned(),
        ))
    }

    fn framing(
        (_, status, _): &Self::StartLine,
        headers: &Headers,
        request_method: Option<&Method>,
    ) -> Result<Framing, ParseError> {
        let bodiless = status.is_informational()
            || *status == StatusCode::NO_CONTENT
            || *status == StatusCode::NOT_MODIFIED
            || request_method == Some(&Method::HEAD)
            || (request_method == Some(&Method::CONNECT) && status.is_success());
        if bodiless {
            return Ok(Framing::None);
        }
        body_framing(headers, false)
    }

    fn assemble((version, status, reason): Self::StartLine, parts: Parts) -> Self {
        Response {
            version,
            status,
            reason,
            headers: parts.headers,
            body: parts.body,
            trailer: parts.trailer,
            framing: parts.framing,
            original: None,
        }
    }
}

/// Best-effort method of a raw, possibly malformed, request: the leading
/// token up to the first space.
pub fn sniff_method(raw: &[u8]) -> Option<Method> {
    let end = raw.iter().position(|&b| b == b' ')?;
    let token = &raw[..end];
    if token.is_empty() || !token.iter().all(|&b| is_tchar(b)) {
        return None;
    }
    Some(Method::parse(&String::from_utf8_lossy(token)))
}
