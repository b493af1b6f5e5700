#![allow(dead_code)]

use std::time::{Duration, Instant};

use deproxy::http::parser::{HttpMessage, ParseError, ParseResult, Parser};

/// Set up a global tracing subscriber, once per test binary.
pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// `len` bytes cycling through the lowercase alphabet.
pub fn make_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

/// Splits `wire` into fragments whose sizes cycle through `sizes`.
pub fn fragments<'a>(wire: &'a [u8], sizes: &[usize]) -> Vec<&'a [u8]> {
    let mut out = Vec::new();
    let mut offset = 0;
    for &size in sizes.iter().cycle() {
        if offset >= wire.len() {
            break;
        }
        let end = (offset + size.max(1)).min(wire.len());
        out.push(&wire[offset..end]);
        offset = end;
    }
    out
}

/// What a receiver sees after delivering every fragment.
#[derive(Debug, PartialEq)]
pub struct Outcome<M> {
    pub messages: Vec<M>,
    pub error: Option<ParseError>,
    pub leftover: usize,
}

/// Feeds fragments the way a transport does: append, then parse until the
/// parser asks for more, dropping each complete message from the buffer.
pub fn parse_fragments<M: HttpMessage>(fragments: &[&[u8]]) -> Outcome<M> {
    let mut parser = Parser::<M>::new();
    let mut buf = Vec::new();
    let mut messages = Vec::new();

    for fragment in fragments {
        buf.extend_from_slice(fragment);
        loop {
            match parser.feed(&buf) {
                ParseResult::Incomplete => break,
                ParseResult::Complete(message, consumed) => {
                    messages.push(message);
                    buf.drain(..consumed);
                }
                ParseResult::Malformed(err) => {
                    return Outcome {
                        messages,
                        error: Some(err),
                        leftover: buf.len(),
                    };
                }
            }
        }
    }

    Outcome {
        messages,
        error: None,
        leftover: buf.len(),
    }
}

pub fn parse_whole<M: HttpMessage>(wire: &[u8]) -> Outcome<M> {
    parse_fragments(&[wire])
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
