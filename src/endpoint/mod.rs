//! Deproxy endpoints: scriptable HTTP peers driven by a single event loop.
//!
//! - **`manager`**: the event loop thread
//! - **`transport`**: socket wrapper with read buffer, segmenting write queue and readiness hooks
//! - **`client`** / **`server`**: the two roles plugged into the transport
//! - **`state`**: phase, counters and blocking waits shared with test code
//! - **`error`**: protocol and transport failures
//!
//! # Endpoint Lifecycle
//!
//! ```text
//!   Idle ──start()──▶ Started ──stop() / peer close / failure──▶ Stopped
//! ```
//!
//! Only Started endpoints are serviced by the event loop, and requests can
//! only be made on a Started client. A stopped endpoint is never restarted;
//! create a new one instead.

pub mod client;
pub mod error;
pub mod manager;
pub mod server;
pub mod state;
pub mod transport;

pub use client::Client;
pub use error::EndpointError;
pub use manager::Manager;
pub use server::Server;
pub use state::{ConnectionState, Phase};
