//! Boundary of the discovery/transport collaborator
//!
//! The radio-level advertising, browsing and pairwise channel plumbing lives
//! outside this crate. Outbound calls go through [`Transport`]; everything the
//! transport observes comes back as a [`TransportEvent`] on an mpsc stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::identity::{PeerId, PeerIdentity};

/// Key/value pairs published while advertising
pub type DiscoveryAttributes = HashMap<String, String>;

/// Pairwise channel state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    Connecting,
    Connected,
    NotConnected,
}

#[derive(Debug)]
pub enum TransportEvent {
    PeerDiscovered {
        peer: PeerId,
        attributes: DiscoveryAttributes,
    },
    PeerLost {
        peer: PeerId,
    },
    /// An inbound invitation; answer through `respond`
    InvitationReceived {
        peer: PeerId,
        attributes: DiscoveryAttributes,
        respond: oneshot::Sender<bool>,
    },
    ChannelStateChanged {
        peer: PeerId,
        state: ChannelState,
    },
    DataReceived {
        peer: PeerId,
        bytes: Vec<u8>,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_advertise(
        &self,
        identity: &PeerIdentity,
        attributes: DiscoveryAttributes,
    ) -> Result<()>;

    async fn start_browse(&self) -> Result<()>;

    /// Send an invitation; the outcome arrives as channel state changes
    async fn invite(&self, peer: &PeerId, timeout: Duration) -> Result<()>;

    /// Reliable, ordered delivery over an established channel
    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<()>;

    async fn disconnect(&self, peer: &PeerId) -> Result<()>;
}
