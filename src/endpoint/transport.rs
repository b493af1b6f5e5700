use std::collections::VecDeque;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::endpoint::error::EndpointError;

/// Role-specific handling of inbound bytes.
///
/// The [`Transport`] owns the buffers and the socket; a peer only decides
/// what a complete message means for its role.
pub trait Peer: Send + 'static {
    /// Called after new bytes were appended to `buf`. Consumed bytes must be
    /// split off the front of `buf`; whatever remains is kept for the next
    /// call.
    fn on_bytes(&mut self, buf: &mut BytesMut, queue: &mut WriteQueue)
    -> Result<Flow, EndpointError>;

    /// Called once when the peer closed its side, with whatever is left
    /// unparsed.
    fn on_eof(&mut self, buf: &mut BytesMut) -> Result<(), EndpointError>;

    /// Called for every outbound chunk handed over by the owning handle,
    /// before it is queued.
    fn on_outbound(&mut self, _bytes: &Bytes) {}
}

/// What the transport should do after a peer handled inbound bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Flush the write queue, then close the connection.
    CloseWhenFlushed,
}

/// Result of one [`Transport::on_readable`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readable {
    /// That many bytes were read and handed to the peer.
    Data(usize),
    /// Spurious wakeup, nothing to read yet.
    WouldBlock,
    /// The peer closed its side.
    Closed,
}

/// Ordered outbound bytes, optionally pre-sliced into fixed-size segments.
#[derive(Debug, Default)]
pub struct WriteQueue {
    chunks: VecDeque<Bytes>,
    segment_size: Option<usize>,
}

impl WriteQueue {
    /// `segment_size` of `None` or zero keeps each chunk whole.
    pub fn new(segment_size: Option<usize>) -> Self {
        Self {
            chunks: VecDeque::new(),
            segment_size: segment_size.filter(|&n| n > 0),
        }
    }

    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        match self.segment_size {
            Some(size) => {
                let mut offset = 0;
                while offset < bytes.len() {
                    let end = (offset + size).min(bytes.len());
                    self.chunks.push_back(bytes.slice(offset..end));
                    offset = end;
                }
            }
            None => self.chunks.push_back(bytes),
        }
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Drops `n` written bytes from the front chunk.
    pub fn advance(&mut self, n: usize) {
        if let Some(front) = self.chunks.front_mut() {
            front.advance(n.min(front.len()));
            if front.is_empty() {
                self.chunks.pop_front();
            }
        }
    }

    /// Number of chunks (or segments) still to write.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

/// Non-blocking socket wrapper shared by the client and server roles.
///
/// The event loop asks [`wants_to_write`](Transport::wants_to_write) and
/// calls [`on_readable`](Transport::on_readable) /
/// [`on_writable`](Transport::on_writable) as the socket becomes ready;
/// neither ever blocks.
pub struct Transport<P: Peer> {
    stream: TcpStream,
    peer: P,
    read_buf: BytesMut,
    queue: WriteQueue,
    read_chunk_size: usize,
    closing: bool,
}

impl<P: Peer> Transport<P> {
    pub fn new(
        stream: TcpStream,
        peer: P,
        segment_size: Option<usize>,
        read_chunk_size: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            read_buf: BytesMut::with_capacity(4096),
            queue: WriteQueue::new(segment_size),
            read_chunk_size: read_chunk_size.max(1),
            closing: false,
        }
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn wants_to_write(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn enqueue(&mut self, bytes: Bytes) {
        trace!(len = bytes.len(), "Enqueued outbound bytes");
        self.queue.push(bytes);
    }

    /// Drains at most `read_chunk_size` bytes from the socket and lets the
    /// peer parse them.
    pub fn on_readable(&mut self) -> Result<Readable, EndpointError> {
        self.read_buf.reserve(self.read_chunk_size);
        let mut limited = (&mut self.read_buf).limit(self.read_chunk_size);

        match self.stream.try_read_buf(&mut limited) {
            Ok(0) => {
                debug!(unparsed = self.read_buf.len(), "Peer closed connection");
                self.peer.on_eof(&mut self.read_buf)?;
                Ok(Readable::Closed)
            }
            Ok(n) => {
                trace!(read = n, buffered = self.read_buf.len(), "Received bytes");
                if self.closing {
                    // Final response already queued; nothing more is answered.
                    self.read_buf.clear();
                    return Ok(Readable::Data(n));
                }
                if self.peer.on_bytes(&mut self.read_buf, &mut self.queue)?
                    == Flow::CloseWhenFlushed
                {
                    self.closing = true;
                }
                Ok(Readable::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Readable::WouldBlock),
            Err(e) => Err(EndpointError::transport("read", e)),
        }
    }

    /// Writes at most one queued chunk or segment. Returns the bytes written.
    pub fn on_writable(&mut self) -> Result<usize, EndpointError> {
        let Some(front) = self.queue.front() else {
            return Ok(0);
        };

        match self.stream.try_write(front) {
            Ok(n) => {
                self.queue.advance(n);
                trace!(written = n, pending = self.queue.pending_bytes(), "Sent bytes");
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(EndpointError::transport("write", e)),
        }
    }

    /// Services the socket until the peer closes, a shutdown is signalled,
    /// or a final response was flushed.
    ///
    /// `outbound` feeds bytes from the owning handle into the write queue.
    pub async fn run(
        mut self,
        mut outbound: Option<mpsc::UnboundedReceiver<Bytes>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EndpointError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            if self.closing && !self.wants_to_write() {
                debug!("Closing connection after final response");
                return Ok(());
            }

            let interest = if self.wants_to_write() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                Some(bytes) = next_outbound(&mut outbound) => {
                    self.peer.on_outbound(&bytes);
                    self.enqueue(bytes);
                }
                ready = self.stream.ready(interest) => {
                    let ready = ready.map_err(|e| EndpointError::transport("poll", e))?;
                    if ready.is_readable() && self.on_readable()? == Readable::Closed {
                        return Ok(());
                    }
                    if ready.is_writable() && self.wants_to_write() {
                        self.on_writable()?;
                    }
                }
            }
        }
    }
}

async fn next_outbound(outbound: &mut Option<mpsc::UnboundedReceiver<Bytes>>) -> Option<Bytes> {
    match outbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_are_sliced_up_front() {
        let mut queue = WriteQueue::new(Some(4));
        queue.push(Bytes::from_static(b"GET / HTTP/1.1\r\n"));

        assert_eq!(queue.len(), 4);
        assert_eq!(queue.front().map(|b| &b[..]), Some(&b"GET "[..]));

        queue.advance(3);
        assert_eq!(queue.front().map(|b| &b[..]), Some(&b" "[..]));
        queue.advance(1);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pending_bytes(), 12);
    }

    #[test]
    fn zero_segment_size_keeps_chunks_whole() {
        let mut queue = WriteQueue::new(Some(0));
        queue.push(Bytes::from_static(b"abc"));
        queue.push(Bytes::new());

        assert_eq!(queue.len(), 1);
    }
}
