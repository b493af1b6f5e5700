use std::io;
use std::sync::Arc;

use crate::endpoint::state::Phase;
use crate::http::parser::ParseError;

/// Why an endpoint gave up on its connection.
///
/// Cloneable so the error recorded on the event loop can be handed to every
/// caller that asks for it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EndpointError {
    /// The peer sent bytes that can't be a valid message.
    #[error("malformed message: {0}")]
    Malformed(#[from] ParseError),

    /// Socket-level failure: connect refused, reset, bind failed...
    #[error("transport failure during {op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    /// A response arrived while no request was outstanding.
    #[error("response received with no request outstanding")]
    UnsolicitedResponse,

    #[error("endpoint is {actual:?}, expected {expected:?}")]
    InvalidPhase { expected: Phase, actual: Phase },

    /// The event loop is not running.
    #[error("event loop unavailable: {0}")]
    Runtime(String),
}

impl EndpointError {
    pub fn transport(op: &'static str, source: io::Error) -> Self {
        EndpointError::Transport {
            op,
            source: Arc::new(source),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, EndpointError::Malformed(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, EndpointError::Transport { .. })
    }
}
