//! The event loop every endpoint runs on.
//!
//! One OS thread drives a current-thread tokio runtime, so the readiness
//! hooks of all endpoints are serialized on that thread while test code
//! keeps running (and blocking) on its own.

use std::future::Future;
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::endpoint::error::EndpointError;
use crate::endpoint::state::POLL_INTERVAL;

/// How long stopping an endpoint waits for its task to close the socket.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Manager {
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Manager {
    /// Spawns the event loop thread.
    pub fn start() -> Result<Self, EndpointError> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name("deproxy-loop".to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Event loop stopped");
            })
            .map_err(|e| EndpointError::Runtime(e.to_string()))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| EndpointError::Runtime("event loop thread exited".to_string()))?
            .map_err(|e| EndpointError::Runtime(e.to_string()))?;

        info!("Event loop started");
        Ok(Self {
            handle,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Runs `future` to completion on the event loop, blocking the caller.
    ///
    /// Must not be called from the event loop thread itself.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Stops the loop. Tasks still running are dropped with their sockets.
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Polls until `task` finished or [`STOP_TIMEOUT`] elapsed.
pub(crate) fn wait_finished<T>(task: &JoinHandle<T>) -> bool {
    let deadline = Instant::now() + STOP_TIMEOUT;
    while !task.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
    true
}
