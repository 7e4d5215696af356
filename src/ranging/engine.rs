//! Boundary of the hardware ranging engine
//!
//! The engine turns two exchanged tokens into a stream of distance/direction
//! samples. This crate only drives it through [`RangingEngine`] and consumes
//! the asynchronous [`RangingEvent`]s it reports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::Result;

/// Engine-side identifier of one ranging session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineHandle(pub u64);

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque token produced by the engine, meaningful only to the engine
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RangingToken(Vec<u8>);

impl RangingToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short digest for logs; the raw token is never logged
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.0);
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for RangingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RangingToken({}, {} bytes)", self.fingerprint(), self.0.len())
    }
}

/// One raw engine measurement; either part may be missing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Meters
    pub distance: Option<f64>,
    pub direction: Option<[f64; 3]>,
}

/// Why the engine stopped reporting a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    Timeout,
    PeerEnded,
}

/// Inbound engine notifications
#[derive(Debug, Clone)]
pub enum RangingEvent {
    Samples {
        handle: EngineHandle,
        samples: Vec<RawSample>,
    },
    Removed {
        handle: EngineHandle,
        reason: RemovalReason,
    },
    Suspended {
        handle: EngineHandle,
    },
    Resumed {
        handle: EngineHandle,
    },
    Invalidated {
        handle: EngineHandle,
        error: String,
    },
}

/// Outbound engine calls
#[async_trait]
pub trait RangingEngine: Send + Sync {
    /// Whether the device has ranging hardware at all
    fn is_supported(&self) -> bool;

    async fn create_session(&self) -> Result<EngineHandle>;

    /// The session's local token, or `None` while the engine is not ready yet
    async fn local_token(&self, handle: EngineHandle) -> Option<RangingToken>;

    async fn configure(&self, handle: EngineHandle, peer_token: &RangingToken) -> Result<()>;

    /// Release the session; no further events are reported for it
    async fn invalidate(&self, handle: EngineHandle);
}
