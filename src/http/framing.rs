use std::fmt;

/// How the end of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length: n`
    ContentLength(usize),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Body runs until the peer closes the connection (responses only).
    CloseDelimited,
    /// No body at all.
    None,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::ContentLength(n) => write!(f, "content-length({n})"),
            Framing::Chunked => f.write_str("chunked"),
            Framing::CloseDelimited => f.write_str("close-delimited"),
            Framing::None => f.write_str("none"),
        }
    }
}
