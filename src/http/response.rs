use bytes::Bytes;

use crate::http::framing::Framing;
use crate::http::headers::Headers;
use crate::http::writer::serialize_response;

/// HTTP status code.
///
/// Any three-digit code can be carried; the common ones have constants and
/// a standard reason phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const BAD_GATEWAY: StatusCode = StatusCode(502);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const GATEWAY_TIMEOUT: StatusCode = StatusCode(504);

    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use deproxy::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.as_u16(), 200);
    /// assert_eq!(StatusCode::NOT_FOUND.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the standard reason phrase, or an empty string for codes
    /// without one.
    ///
    /// # Example
    ///
    /// ```
    /// # use deproxy::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    /// assert_eq!(StatusCode(299).reason_phrase(), "");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            304 => "Not Modified",
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Represents an HTTP response, either parsed off the wire or built for
/// sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    /// The HTTP status code
    pub status: StatusCode,
    /// Reason phrase as sent, possibly empty
    pub reason: String,
    /// Header fields in the order received
    pub headers: Headers,
    /// Decoded response body
    pub body: Vec<u8>,
    /// Trailer fields of a chunked body
    pub trailer: Headers,
    /// How the body was delimited
    pub framing: Framing,
    /// Raw bytes of the whole message, when captured
    pub original: Option<Bytes>,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```
/// # use deproxy::http::response::{ResponseBuilder, StatusCode};
/// let response = ResponseBuilder::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// assert_eq!(response.header("Content-Length"), Some("2"));
/// ```
pub struct ResponseBuilder {
    status: StatusCode,
    reason: Option<String>,
    headers: Headers,
    body: Vec<u8>,
    framing: Option<Framing>,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            headers: Headers::new(),
            body: Vec::new(),
            framing: None,
        }
    }

    /// Overrides the standard reason phrase.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Appends a header; duplicates are kept.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(key, value);
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sends the body with `Transfer-Encoding: chunked`.
    pub fn chunked(mut self) -> Self {
        self.framing = Some(Framing::Chunked);
        self
    }

    /// Sends the body without any framing header; the peer only learns the
    /// body ended when the connection closes.
    pub fn close_delimited(mut self) -> Self {
        self.framing = Some(Framing::CloseDelimited);
        self
    }

    /// Builds the final Response.
    ///
    /// Unless chunked or close-delimited framing was requested, adds a
    /// Content-Length header based on body size if not already present.
    pub fn build(mut self) -> Response {
        let framing = match self.framing {
            Some(Framing::Chunked) => {
                if !self.headers.contains("Transfer-Encoding") {
                    self.headers.add("Transfer-Encoding", "chunked");
                }
                Framing::Chunked
            }
            Some(Framing::CloseDelimited) => Framing::CloseDelimited,
            _ => {
                if !self.headers.contains("Content-Length") {
                    self.headers.add("Content-Length", self.body.len().to_string());
                }
                Framing::ContentLength(self.body.len())
            }
        };

        Response {
            version: "HTTP/1.1".to_string(),
            reason: self
                .reason
                .unwrap_or_else(|| self.status.reason_phrase().to_string()),
            status: self.status,
            headers: self.headers,
            body: self.body,
            trailer: Headers::new(),
            framing,
            original: None,
        }
    }
}

impl Response {
    /// Retrieves the first header value by name (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Serializes the response for sending.
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize_response(self)
    }

    /// Attaches the raw bytes the response was parsed from.
    pub fn with_original(mut self, raw: Bytes) -> Self {
        self.original = Some(raw);
        self
    }
}
