//! Per-endpoint connection state.
//!
//! The event loop thread records completed messages here while test code on
//! another thread reads counters and blocks in [`ConnectionState::wait_for`].
//! Counters are atomics; message history and the first error sit behind
//! mutexes that are only held for a push or a clone.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::endpoint::error::EndpointError;

/// Sleep between two checks of a blocking wait.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of an endpoint: `Idle -[start]-> Started -[stop]-> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Created, no socket yet
    Idle = 0,
    /// Serviced by the event loop
    Started = 1,
    /// Socket closed; never restarted
    Stopped = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Idle,
            1 => Phase::Started,
            _ => Phase::Stopped,
        }
    }
}

/// Counters and message history of one endpoint.
///
/// `sent` counts messages enqueued for sending, `received` counts messages
/// that parsed completely. For a client, `received <= sent` always holds.
#[derive(Debug)]
pub struct ConnectionState<M> {
    phase: AtomicU8,
    sent: AtomicUsize,
    received: AtomicUsize,
    awaited: AtomicUsize,
    messages: Mutex<Vec<M>>,
    error: Mutex<Option<EndpointError>>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<M: Clone> Default for ConnectionState<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone> ConnectionState<M> {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Idle as u8),
            sent: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            awaited: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Idle → Started. Any other starting phase is an error.
    pub fn start(&self) -> Result<(), EndpointError> {
        self.phase
            .compare_exchange(
                Phase::Idle as u8,
                Phase::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|actual| EndpointError::InvalidPhase {
                expected: Phase::Idle,
                actual: Phase::from_u8(actual),
            })
    }

    /// Moves to Stopped. Returns false if it already was.
    pub fn stop(&self) -> bool {
        self.phase.swap(Phase::Stopped as u8, Ordering::AcqRel) != Phase::Stopped as u8
    }

    pub fn ensure_started(&self) -> Result<(), EndpointError> {
        match self.phase() {
            Phase::Started => Ok(()),
            actual => Err(EndpointError::InvalidPhase {
                expected: Phase::Started,
                actual,
            }),
        }
    }

    /// Counts a request about to be enqueued and remembers how many
    /// responses had arrived, so [`ConnectionState::wait_for_next`] waits
    /// for one more than that.
    pub fn begin_exchange(&self) -> Result<(), EndpointError> {
        self.ensure_started()?;
        self.awaited
            .store(self.received.load(Ordering::Acquire), Ordering::Release);
        self.sent.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Counts a message enqueued without a matching wait, e.g. a server's
    /// response.
    pub fn mark_sent(&self) -> usize {
        self.sent.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Stores a completed message and bumps `received`.
    pub fn record(&self, message: M) -> usize {
        lock(&self.messages).push(message);
        self.received.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Keeps the first error reported; later ones are dropped.
    pub fn record_error(&self, err: EndpointError) {
        let mut slot = lock(&self.error);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Records `err` and stops the endpoint.
    pub fn fail(&self, err: EndpointError) {
        self.record_error(err);
        self.stop();
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Acquire)
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<EndpointError> {
        lock(&self.error).clone()
    }

    pub fn last(&self) -> Option<M> {
        lock(&self.messages).last().cloned()
    }

    pub fn messages(&self) -> Vec<M> {
        lock(&self.messages).clone()
    }

    /// Blocks the calling thread until `received >= target`.
    ///
    /// Checks every [`POLL_INTERVAL`] until `timeout`, measured from this
    /// call, elapses. Returns `Ok(false)` on timeout or once the endpoint is
    /// no longer Started, and the recorded error if the endpoint failed. A
    /// message that already arrived wins over both.
    pub fn wait_for(&self, target: usize, timeout: Duration) -> Result<bool, EndpointError> {
        self.poll(target, timeout, false)
    }

    /// Waits for the message answering the last [`begin_exchange`].
    ///
    /// Unlike [`ConnectionState::wait_for`], a recorded error wins over a
    /// recorded message: an exchange followed by garbage failed.
    ///
    /// [`begin_exchange`]: ConnectionState::begin_exchange
    pub fn wait_for_next(&self, timeout: Duration) -> Result<bool, EndpointError> {
        self.poll(self.awaited.load(Ordering::Acquire) + 1, timeout, true)
    }

    fn poll(&self, target: usize, timeout: Duration, error_first: bool) -> Result<bool, EndpointError> {
        let deadline = Instant::now() + timeout;
        loop {
            if error_first && let Some(err) = self.error() {
                return Err(err);
            }
            if self.received() >= target {
                return Ok(true);
            }
            if let Some(err) = self.error() {
                return Err(err);
            }
            if self.phase() != Phase::Started {
                return Ok(false);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Stops the endpoint when the task owning its socket ends, however it ends.
pub(crate) struct StopOnDrop<M: Clone>(pub(crate) Arc<ConnectionState<M>>);

impl<M: Clone> Drop for StopOnDrop<M> {
    fn drop(&mut self) {
        if self.0.stop() {
            tracing::debug!("Endpoint stopped");
        }
    }
}
