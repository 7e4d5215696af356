//! Nearby Radar - peer discovery and ranging core
//!
//! Discovers nearby devices, settles on exactly one pairwise channel per
//! peer pair, exchanges opaque ranging tokens and smooths the ranging
//! engine's raw distance/direction samples into per-peer estimates.
//!
//! The radio transport and the ranging hardware stay outside the crate
//! behind the [`Transport`] and [`RangingEngine`] traits. [`LoopbackHub`]
//! and [`SimulatedEngine`] stand in for both in tests and demos.

pub mod config;
pub mod error;
pub mod filter;
pub mod identity;
pub mod mesh;
pub mod node;
pub mod ranging;
pub mod registry;

pub use config::NearbyConfig;
pub use error::{NearbyError, Result};
pub use filter::{FilteredEstimate, SignalFilter};
pub use identity::{LexicographicTieBreaker, PeerId, PeerIdentity, TieBreaker};
pub use mesh::{ChannelState, LoopbackHub, Transport, TransportEvent};
pub use node::{Collaborators, NearbyNode};
pub use ranging::{RangingEngine, RangingEvent, RangingToken, RawSample, SessionState, SimulatedEngine};
pub use registry::{ConnectionState, DeviceRecord, DeviceRegistry, RegistryEvent};
