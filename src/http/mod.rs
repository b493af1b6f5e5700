//! HTTP/1.x message model and framing.
//!
//! This is the oracle side of the deproxy: it has to agree byte-for-byte with
//! RFC 7230 framing on well-formed traffic and refuse the malformed inputs a
//! proxy under test is expected to reject.
//!
//! # Architecture
//!
//! - **`headers`**: ordered header list with duplicate and case-insensitive semantics
//! - **`request`** / **`response`**: message types and their builders
//! - **`framing`**: how a body is delimited
//! - **`parser`**: incremental parser for both message kinds
//! - **`chunked`**: chunked transfer-coding encoder
//! - **`writer`**: serializes messages for sending
//!
//! # Parser State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │  StartLine  │ ← request line / status line, strict grammar
//!        └──────┬──────┘
//!               ▼
//!        ┌─────────────┐
//!        │   Headers   │ ← one field per CRLF line until an empty line
//!        └──────┬──────┘
//!               │ framing picked from the header section
//!               ├─ Content-Length → Fixed
//!               ├─ chunked        → ChunkSize ⇄ ChunkData → Trailer
//!               ├─ neither (resp) → UntilClose (completed by `finish`)
//!               └─ no body        → Done
//! ```
//!
//! # Example
//!
//! ```
//! use deproxy::http::parser::{ParseResult, RequestParser};
//!
//! let wire = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
//! let mut parser = RequestParser::new();
//!
//! let ParseResult::Complete(first, consumed) = parser.feed(wire) else { panic!() };
//! assert_eq!(first.uri, "/a");
//! let ParseResult::Complete(second, _) = parser.feed(&wire[consumed..]) else { panic!() };
//! assert_eq!(second.uri, "/b");
//! ```

pub mod chunked;
pub mod framing;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;

pub use framing::Framing;
pub use headers::Headers;
pub use parser::{ParseError, ParseResult, Parser, RequestParser, ResponseParser};
pub use request::{Method, Request, RequestBuilder};
pub use response::{Response, ResponseBuilder, StatusCode};
