//! Chunked transfer-coding encoder.
//!
//! Decoding lives in the incremental parser, which has to cope with chunk
//! boundaries landing anywhere in a read.

/// Encodes `body` as a sequence of chunks of at most `chunk_size` bytes,
/// followed by the last-chunk and the terminating CRLF.
///
/// Sizes are written in upper-case hex. An empty body encodes to the bare
/// terminator `0\r\n\r\n`. A `chunk_size` of zero puts the whole body in one
/// chunk.
///
/// ```
/// use deproxy::http::chunked::encode;
///
/// assert_eq!(encode(b"hello", 0), b"5\r\nhello\r\n0\r\n\r\n".to_vec());
/// assert_eq!(encode(b"", 0), b"0\r\n\r\n".to_vec());
/// ```
pub fn encode(body: &[u8], chunk_size: usize) -> Vec<u8> {
    let chunk_size = if chunk_size == 0 { body.len().max(1) } else { chunk_size };
    let mut buf = Vec::with_capacity(body.len() + 16);

    for chunk in body.chunks(chunk_size) {
        buf.extend_from_slice(format!("{:X}\r\n", chunk.len()).as_bytes());
        buf.extend_from_slice(chunk);
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"0\r\n\r\n");
    buf
}
