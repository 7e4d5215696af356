//! Pairwise Mesh Module
//!
//! Transport boundary, wire framing, the connection coordinator and the
//! token exchange that run on top of it.

pub mod coordinator;
pub mod loopback;
pub mod protocol;
pub mod token_exchange;
pub mod transport;

pub use coordinator::{ChannelSinks, ConnectionCoordinator, CoordinatorCommand, InviteReason};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use protocol::{Frame, MessageType, PROTOCOL_VERSION, SERVICE_TYPE, TIE_BREAK_ATTRIBUTE};
pub use token_exchange::{ExchangeCommand, TokenExchange};
pub use transport::{ChannelState, DiscoveryAttributes, Transport, TransportEvent};
