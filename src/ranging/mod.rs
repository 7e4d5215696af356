//! Ranging Module
//!
//! Engine boundary, the per-peer session state machine and the manager actor
//! that owns all sessions.

pub mod engine;
pub mod manager;
pub mod session;
pub mod simulated;

pub use engine::{EngineHandle, RangingEngine, RangingEvent, RangingToken, RawSample, RemovalReason};
pub use manager::{RangingCommand, RangingManager, SessionSummary, TokenReply};
pub use session::{RangingSession, SessionState, TokenDisposition};
pub use simulated::SimulatedEngine;
