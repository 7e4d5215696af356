//! Error types shared by the nearby ranging core

use thiserror::Error;

use crate::identity::PeerId;
use crate::ranging::SessionState;

/// Errors raised by the connection, token exchange and ranging components.
///
/// None of these are fatal to the process: callers log them and degrade the
/// affected peer only.
#[derive(Debug, Error)]
pub enum NearbyError {
    /// No pairwise channel is open to the peer
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    /// Discovery/transport collaborator reported a failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Ranging engine collaborator reported a failure
    #[error("ranging engine error: {0}")]
    Engine(String),

    /// The device has no ranging hardware
    #[error("ranging is not supported on this device")]
    RangingUnsupported,

    /// A received frame could not be decoded
    #[error("malformed frame: {0}")]
    Decode(String),

    /// A ranging session was asked to make a transition its state forbids
    #[error("invalid session transition from {from:?} on {event}")]
    InvalidTransition {
        from: SessionState,
        event: &'static str,
    },

    /// An internal component channel has shut down
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NearbyError>;
