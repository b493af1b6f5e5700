use bytes::Bytes;

use crate::http::framing::Framing;
use crate::http::headers::Headers;
use crate::http::writer::serialize_request;

/// HTTP request methods.
///
/// Any token is a valid method on the wire; the well-known verbs get their
/// own variant and everything else is carried as [`Method::Extension`].
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
    /// CONNECT - Establish a tunnel
    CONNECT,
    /// TRACE - Loop-back test
    TRACE,
    /// Any other method token, e.g. `PURGE`
    Extension(String),
}

/// Represents a parsed HTTP request.
///
/// `body` is the decoded payload: for a chunked request the chunk framing is
/// stripped and any trailer fields end up in `trailer`. `original` holds the
/// exact bytes received when the endpoint was configured to keep them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target as sent (e.g., "/index.html")
    pub uri: String,
    /// HTTP version (typically "HTTP/1.1")
    pub version: String,
    /// Header fields in the order received
    pub headers: Headers,
    /// Decoded request body
    pub body: Vec<u8>,
    /// Trailer fields of a chunked body
    pub trailer: Headers,
    /// How the body was delimited
    pub framing: Framing,
    /// Raw bytes of the whole message, when captured
    pub original: Option<Bytes>,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<String>,
    headers: Headers,
    body: Vec<u8>,
    chunked: bool,
}

impl Method {
    /// Parses a method token. Case-sensitive: `get` is an extension method.
    ///
    /// # Example
    ///
    /// ```
    /// # use deproxy::http::request::Method;
    /// assert_eq!(Method::parse("GET"), Method::GET);
    /// assert_eq!(Method::parse("PURGE"), Method::Extension("PURGE".to_string()));
    /// ```
    pub fn parse(s: &str) -> Self {
        match s {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "HEAD" => Method::HEAD,
            "OPTIONS" => Method::OPTIONS,
            "PATCH" => Method::PATCH,
            "CONNECT" => Method::CONNECT,
            "TRACE" => Method::TRACE,
            other => Method::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
            Method::Extension(m) => m,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            uri: None,
            version: None,
            headers: Headers::new(),
            body: Vec::new(),
            chunked: false,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Appends a header; duplicates are kept.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(key, value);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Sends the body with `Transfer-Encoding: chunked` instead of a length.
    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    /// Builds the request.
    ///
    /// Adds `Transfer-Encoding: chunked` for chunked bodies and
    /// `Content-Length` for non-empty bodies that don't declare one.
    pub fn build(mut self) -> Result<Request, &'static str> {
        let framing = if self.chunked {
            if !self.headers.contains("Transfer-Encoding") {
                self.headers.add("Transfer-Encoding", "chunked");
            }
            Framing::Chunked
        } else {
            if !self.body.is_empty() && !self.headers.contains("Content-Length") {
                self.headers.add("Content-Length", self.body.len().to_string());
            }
            if self.headers.contains("Content-Length") {
                Framing::ContentLength(self.body.len())
            } else {
                Framing::None
            }
        };

        Ok(Request {
            method: self.method.ok_or("method missing")?,
            uri: self.uri.ok_or("uri missing")?,
            version: self.version.unwrap_or_else(|| "HTTP/1.1".to_string()),
            headers: self.headers,
            body: self.body,
            trailer: Headers::new(),
            framing,
            original: None,
        })
    }
}

impl Request {
    /// Retrieves the first header value by name (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close` is present;
    /// HTTP/1.0 only keeps the connection on an explicit `keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let mut tokens = self.headers.get_list("Connection");
        if self.version == "HTTP/1.0" {
            tokens.any(|v| v.eq_ignore_ascii_case("keep-alive"))
        } else {
            !tokens.any(|v| v.eq_ignore_ascii_case("close"))
        }
    }

    /// Serializes the request for sending. Chunked bodies are re-encoded as a
    /// single chunk; use `original` to replay the exact bytes received.
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize_request(self)
    }

    /// Attaches the raw bytes the request was parsed from.
    pub fn with_original(mut self, raw: Bytes) -> Self {
        self.original = Some(raw);
        self
    }
}
