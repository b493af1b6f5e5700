//! Deproxy client: sends scripted, possibly malformed, requests and checks
//! that what comes back is exactly one well-formed response per request.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::endpoint::error::EndpointError;
use crate::endpoint::manager::{Manager, wait_finished};
use crate::endpoint::state::{ConnectionState, Phase, StopOnDrop, lock};
use crate::endpoint::transport::{Flow, Peer, Transport, WriteQueue};
use crate::http::parser::{ParseError, ParseResult, ResponseParser, sniff_method};
use crate::http::request::{Method, Request};
use crate::http::response::Response;

/// Client-side handling of inbound bytes.
///
/// Responses are not pipelined: once every request has its final response,
/// any further byte is trailing garbage and fails the connection, however
/// the reads happen to split it.
pub struct ClientPeer {
    state: Arc<ConnectionState<Response>>,
    parser: ResponseParser,
    pending: VecDeque<Option<Method>>,
    answered: usize,
    keep_original_data: bool,
}

impl ClientPeer {
    pub fn new(state: Arc<ConnectionState<Response>>, keep_original_data: bool) -> Self {
        Self {
            state,
            parser: ResponseParser::new(),
            pending: VecDeque::new(),
            answered: 0,
            keep_original_data,
        }
    }

    /// Tells an idle parser which request the next response answers.
    fn prime_parser(&mut self) {
        if self.parser.is_idle() {
            let method = self.pending.front().cloned().flatten();
            self.parser.set_request_method(method);
        }
    }

    /// Rejects bytes that start while no request is outstanding.
    fn check_unexpected(&self, buf: &BytesMut) -> Result<(), EndpointError> {
        if buf.is_empty() || !self.pending.is_empty() || !self.parser.is_idle() {
            return Ok(());
        }
        if self.answered == 0 {
            return Err(EndpointError::UnsolicitedResponse);
        }
        Err(ParseError::TrailingGarbage { len: buf.len() }.into())
    }

    fn receive(&mut self, response: Response, raw: Bytes) -> Result<(), EndpointError> {
        if response.status.is_informational() {
            trace!(status = response.status.as_u16(), "Skipping interim response");
            return Ok(());
        }
        if self.pending.pop_front().is_none() {
            return Err(EndpointError::UnsolicitedResponse);
        }

        let response = if self.keep_original_data {
            response.with_original(raw)
        } else {
            response
        };
        debug!(
            status = response.status.as_u16(),
            framing = %response.framing,
            body_len = response.body.len(),
            "Received response"
        );
        self.answered += 1;
        self.state.record(response);
        Ok(())
    }
}

impl Peer for ClientPeer {
    fn on_bytes(
        &mut self,
        buf: &mut BytesMut,
        _queue: &mut WriteQueue,
    ) -> Result<Flow, EndpointError> {
        loop {
            self.check_unexpected(buf)?;
            self.prime_parser();
            match self.parser.feed(buf) {
                ParseResult::Incomplete => return Ok(Flow::Continue),
                ParseResult::Malformed(err) => return Err(err.into()),
                ParseResult::Complete(response, consumed) => {
                    let raw = buf.split_to(consumed).freeze();
                    self.receive(response, raw)?;
                }
            }
        }
    }

    fn on_eof(&mut self, buf: &mut BytesMut) -> Result<(), EndpointError> {
        self.check_unexpected(buf)?;
        self.prime_parser();
        match self.parser.finish(buf) {
            ParseResult::Incomplete => Ok(()),
            ParseResult::Malformed(err) => Err(err.into()),
            ParseResult::Complete(response, consumed) => {
                let raw = buf.split_to(consumed).freeze();
                self.receive(response, raw)
            }
        }
    }

    fn on_outbound(&mut self, bytes: &Bytes) {
        self.pending.push_back(sniff_method(bytes));
    }
}

/// Test-facing handle of a deproxy client.
///
/// ```no_run
/// use std::time::Duration;
/// use deproxy::config::ClientConfig;
/// use deproxy::endpoint::{Client, Manager};
///
/// let manager = Manager::start()?;
/// let mut client = Client::new(ClientConfig::new("127.0.0.1:80"));
/// client.start(&manager)?;
/// client.make_request("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
/// if client.wait_for_response(Duration::from_secs(5))? {
///     println!("{:?}", client.last_response());
/// }
/// # Ok::<(), deproxy::endpoint::EndpointError>(())
/// ```
pub struct Client {
    config: ClientConfig,
    state: Arc<ConnectionState<Response>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            state: Arc::new(ConnectionState::new()),
            outbound: Mutex::new(None),
            shutdown: None,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to the configured address and hands the socket to the event
    /// loop. A failed connect stops the client for good.
    pub fn start(&mut self, manager: &Manager) -> Result<(), EndpointError> {
        if self.state.phase() != Phase::Idle {
            return Err(EndpointError::InvalidPhase {
                expected: Phase::Idle,
                actual: self.state.phase(),
            });
        }

        let stream = match self.connect() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(addr = %self.config.addr, error = %err, "Client failed to connect");
                self.state.fail(err.clone());
                return Err(err);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.state.start()?;

        let state = Arc::clone(&self.state);
        let peer = ClientPeer::new(Arc::clone(&self.state), self.config.keep_original_data);
        let segment_size = self.config.segment_size;
        let read_chunk_size = self.config.read_chunk_size;

        let task = manager.spawn(async move {
            let _stop = StopOnDrop(Arc::clone(&state));
            let stream = match TcpStream::from_std(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    state.fail(EndpointError::transport("register", e));
                    return;
                }
            };

            let transport = Transport::new(stream, peer, segment_size, read_chunk_size);
            if let Err(err) = transport.run(Some(outbound_rx), shutdown_rx).await {
                warn!(error = %err, "Client connection failed");
                state.fail(err);
            }
        });
        *lock(&self.task) = Some(task);
        *lock(&self.outbound) = Some(outbound_tx);
        self.shutdown = Some(shutdown_tx);

        info!(addr = %self.config.addr, segment_size = ?self.config.segment_size, "Client started");
        Ok(())
    }

    fn connect(&self) -> Result<std::net::TcpStream, EndpointError> {
        let addr: SocketAddr = self
            .config
            .addr
            .to_socket_addrs()
            .map_err(|e| EndpointError::transport("resolve", e))?
            .next()
            .ok_or_else(|| {
                EndpointError::transport(
                    "resolve",
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
                )
            })?;

        let stream = std::net::TcpStream::connect_timeout(&addr, self.config.connect_timeout())
            .map_err(|e| EndpointError::transport("connect", e))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| EndpointError::transport("connect", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| EndpointError::transport("connect", e))?;
        Ok(stream)
    }

    /// Enqueues raw request bytes, sent as-is even when malformed.
    ///
    /// Only legal while Started. `sent_count` moves immediately; the bytes
    /// reach the wire on later writable events.
    pub fn make_request(&self, request: impl Into<Bytes>) -> Result<(), EndpointError> {
        let outbound = lock(&self.outbound);
        let outbound = outbound.as_ref().ok_or(EndpointError::InvalidPhase {
            expected: Phase::Started,
            actual: self.state.phase(),
        })?;
        self.state.begin_exchange()?;

        outbound
            .send(request.into())
            .map_err(|_| EndpointError::Runtime("client task is gone".to_string()))
    }

    pub fn make_request_message(&self, request: &Request) -> Result<(), EndpointError> {
        self.make_request(request.to_bytes())
    }

    /// Waits for the response to the last request made.
    ///
    /// `Ok(false)` means the timeout elapsed or the client stopped; a
    /// protocol violation or socket failure comes back as `Err`, even when
    /// the response itself was recorded before the failure.
    pub fn wait_for_response(&self, timeout: Duration) -> Result<bool, EndpointError> {
        self.state.wait_for_next(timeout)
    }

    pub fn last_response(&self) -> Option<Response> {
        self.state.last()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.state.messages()
    }

    pub fn sent_count(&self) -> usize {
        self.state.sent()
    }

    pub fn received_count(&self) -> usize {
        self.state.received()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn error(&self) -> Option<EndpointError> {
        self.state.error()
    }

    /// Closes the socket. Waits blocked on other threads return `false`.
    pub fn stop(&self) {
        if self.state.stop() {
            debug!(addr = %self.config.addr, "Stopping client");
        }
        lock(&self.outbound).take();
        if let Some(shutdown) = &self.shutdown {
            let _ = shutdown.send(true);
        }
        let task = lock(&self.task).take();
        if let Some(task) = task {
            wait_finished(&task);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
