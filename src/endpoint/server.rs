//! Deproxy server: the backend the proxy under test forwards to.
//!
//! Records every request exactly as parsed (pipelined requests included)
//! and answers each with the configured response.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::endpoint::error::EndpointError;
use crate::endpoint::manager::{Manager, wait_finished};
use crate::endpoint::state::{ConnectionState, POLL_INTERVAL, Phase, StopOnDrop, lock};
use crate::endpoint::transport::{Flow, Peer, Transport, WriteQueue};
use crate::http::parser::{ParseResult, RequestParser};
use crate::http::request::Request;

/// Server-side handling of inbound bytes for one accepted connection.
pub struct ServerPeer {
    state: Arc<ConnectionState<Request>>,
    parser: RequestParser,
    response: Bytes,
    keep_alive: Option<usize>,
    keep_original_data: bool,
    served: usize,
}

impl ServerPeer {
    pub fn new(
        state: Arc<ConnectionState<Request>>,
        response: Bytes,
        keep_alive: Option<usize>,
        keep_original_data: bool,
    ) -> Self {
        Self {
            state,
            parser: RequestParser::new(),
            response,
            keep_alive,
            keep_original_data,
            served: 0,
        }
    }

    fn receive(&mut self, request: Request, raw: Bytes, queue: &mut WriteQueue) -> Flow {
        let keep_alive = request.keep_alive();
        info!(
            method = %request.method,
            uri = %request.uri,
            framing = %request.framing,
            body_len = request.body.len(),
            "Received request"
        );
        let request = if self.keep_original_data {
            request.with_original(raw)
        } else {
            request
        };
        self.state.record(request);

        queue.push(self.response.clone());
        self.state.mark_sent();
        self.served += 1;

        if self.keep_alive == Some(self.served) {
            debug!(served = self.served, "Keep-alive limit reached");
            Flow::CloseWhenFlushed
        } else if !keep_alive {
            debug!(served = self.served, "Client asked to close");
            Flow::CloseWhenFlushed
        } else {
            Flow::Continue
        }
    }
}

impl Peer for ServerPeer {
    fn on_bytes(&mut self, buf: &mut BytesMut, queue: &mut WriteQueue) -> Result<Flow, EndpointError> {
        loop {
            match self.parser.feed(buf) {
                ParseResult::Incomplete => return Ok(Flow::Continue),
                ParseResult::Malformed(err) => return Err(err.into()),
                ParseResult::Complete(request, consumed) => {
                    let raw = buf.split_to(consumed).freeze();
                    if self.receive(request, raw, queue) == Flow::CloseWhenFlushed {
                        return Ok(Flow::CloseWhenFlushed);
                    }
                }
            }
        }
    }

    fn on_eof(&mut self, buf: &mut BytesMut) -> Result<(), EndpointError> {
        match self.parser.finish(buf) {
            ParseResult::Incomplete => Ok(()),
            ParseResult::Malformed(err) => Err(err.into()),
            ParseResult::Complete(request, consumed) => {
                let raw = buf.split_to(consumed).freeze();
                // Nobody is left to read the response.
                let mut discard = WriteQueue::new(None);
                self.receive(request, raw, &mut discard);
                Ok(())
            }
        }
    }
}

struct Shared {
    state: Arc<ConnectionState<Request>>,
    connections: AtomicUsize,
}

/// Test-facing handle of a deproxy server.
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Arc::new(ConnectionState::new()),
                connections: AtomicUsize::new(0),
            }),
            local_addr: None,
            shutdown: None,
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listening socket and starts accepting on the event loop.
    pub fn start(&mut self, manager: &Manager) -> Result<(), EndpointError> {
        let state = &self.shared.state;
        if state.phase() != Phase::Idle {
            return Err(EndpointError::InvalidPhase {
                expected: Phase::Idle,
                actual: state.phase(),
            });
        }

        let listener = match bind(&self.config.listen) {
            Ok(listener) => listener,
            Err(err) => {
                error!(listen = %self.config.listen, error = %err, "Server failed to bind");
                state.fail(err.clone());
                return Err(err);
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| EndpointError::transport("bind", e))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        state.start()?;

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        *lock(&self.task) = Some(manager.spawn(serve(listener, config, shared, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        info!(listen = %local_addr, "Server started");
        Ok(())
    }

    /// Address actually bound, known once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Waits until at least `n` connections were accepted.
    pub fn wait_for_connections(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.connections() >= n {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || self.phase() != Phase::Started {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Waits until at least `n` requests were received in total.
    pub fn wait_for_requests(&self, n: usize, timeout: Duration) -> Result<bool, EndpointError> {
        self.shared.state.wait_for(n, timeout)
    }

    pub fn last_request(&self) -> Option<Request> {
        self.shared.state.last()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.shared.state.messages()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    pub fn received_count(&self) -> usize {
        self.shared.state.received()
    }

    /// Responses enqueued so far.
    pub fn sent_count(&self) -> usize {
        self.shared.state.sent()
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.phase()
    }

    /// First protocol or socket error seen on any connection.
    pub fn error(&self) -> Option<EndpointError> {
        self.shared.state.error()
    }

    /// Stops accepting and closes every connection.
    pub fn stop(&self) {
        if self.shared.state.stop() {
            debug!(listen = %self.config.listen, "Stopping server");
        }
        if let Some(shutdown) = &self.shutdown {
            let _ = shutdown.send(true);
        }
        let task = lock(&self.task).take();
        if let Some(task) = task {
            wait_finished(&task);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(listen: &str) -> Result<std::net::TcpListener, EndpointError> {
    let listener =
        std::net::TcpListener::bind(listen).map_err(|e| EndpointError::transport("bind", e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| EndpointError::transport("bind", e))?;
    Ok(listener)
}

async fn serve(
    listener: std::net::TcpListener,
    config: ServerConfig,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _stop = StopOnDrop(Arc::clone(&shared.state));
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            shared.state.fail(EndpointError::transport("register", e));
            return;
        }
    };

    let response = config.response.to_bytes();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        shared.state.fail(EndpointError::transport("accept", e));
                        break;
                    }
                };
                info!(%peer, "Accepted connection");
                shared.connections.fetch_add(1, Ordering::AcqRel);

                if config.segment_size.is_some() {
                    let _ = socket.set_nodelay(true);
                }
                let state = Arc::clone(&shared.state);
                let server_peer = ServerPeer::new(
                    Arc::clone(&state),
                    response.clone(),
                    config.keep_alive,
                    config.keep_original_data,
                );
                let transport = Transport::new(
                    socket,
                    server_peer,
                    config.segment_size,
                    config.read_chunk_size,
                );
                let shutdown = shutdown.clone();

                connections.spawn(async move {
                    match transport.run(None, shutdown).await {
                        Ok(()) => debug!(%peer, "Connection closed"),
                        Err(err) => {
                            warn!(%peer, error = %err, "Connection failed");
                            state.record_error(err);
                        }
                    }
                });
            }
        }
    }

    // Sockets are closed once this returns.
    connections.shutdown().await;
}
