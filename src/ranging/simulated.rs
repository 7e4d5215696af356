//! Scripted ranging engine for tests and the demo binary
//!
//! Sessions hand out deterministic tokens, every call is recorded, and the
//! caller injects engine events by hand.

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{NearbyError, Result};
use crate::ranging::engine::{
    EngineHandle, RangingEngine, RangingEvent, RangingToken, RawSample, RemovalReason,
};

#[derive(Debug, Clone)]
pub struct ConfigureCall {
    pub handle: EngineHandle,
    pub peer_token: RangingToken,
    pub at: Instant,
}

#[derive(Debug)]
struct SimState {
    next_handle: u64,
    tokens_ready: bool,
    fail_configure: bool,
    auto_sample: Option<RawSample>,
    live: HashMap<EngineHandle, RangingToken>,
    configure_calls: Vec<ConfigureCall>,
    invalidated: Vec<EngineHandle>,
}

pub struct SimulatedEngine {
    label: String,
    supported: bool,
    state: Mutex<SimState>,
    events: mpsc::UnboundedSender<RangingEvent>,
}

impl SimulatedEngine {
    /// Engine with ranging hardware; returns the event stream to hand to the node
    pub fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<RangingEvent>) {
        Self::build(label, true)
    }

    /// Engine on a device without ranging hardware
    pub fn unsupported(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<RangingEvent>) {
        Self::build(label, false)
    }

    fn build(label: &str, supported: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<RangingEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            label: label.to_string(),
            supported,
            state: Mutex::new(SimState {
                next_handle: 1,
                tokens_ready: true,
                fail_configure: false,
                auto_sample: None,
                live: HashMap::new(),
                configure_calls: Vec::new(),
                invalidated: Vec::new(),
            }),
            events,
        };
        (Arc::new(engine), rx)
    }

    /// While false, `local_token` answers `None`
    pub fn set_tokens_ready(&self, ready: bool) {
        self.state.lock().tokens_ready = ready;
    }

    pub fn set_fail_configure(&self, fail: bool) {
        self.state.lock().fail_configure = fail;
    }

    /// Sample emitted right after every successful `configure`
    pub fn set_auto_sample(&self, sample: Option<RawSample>) {
        self.state.lock().auto_sample = sample;
    }

    pub fn configure_calls(&self) -> Vec<ConfigureCall> {
        self.state.lock().configure_calls.clone()
    }

    pub fn live_handles(&self) -> Vec<EngineHandle> {
        let mut handles: Vec<_> = self.state.lock().live.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn invalidated_handles(&self) -> Vec<EngineHandle> {
        self.state.lock().invalidated.clone()
    }

    pub fn emit_samples(&self, handle: EngineHandle, samples: Vec<RawSample>) {
        self.emit(RangingEvent::Samples { handle, samples });
    }

    pub fn emit_removed(&self, handle: EngineHandle, reason: RemovalReason) {
        self.emit(RangingEvent::Removed { handle, reason });
    }

    pub fn emit_suspended(&self, handle: EngineHandle) {
        self.emit(RangingEvent::Suspended { handle });
    }

    pub fn emit_resumed(&self, handle: EngineHandle) {
        self.emit(RangingEvent::Resumed { handle });
    }

    /// Report a fatal session error; the engine forgets the session
    pub fn emit_invalidated(&self, handle: EngineHandle, error: &str) {
        self.state.lock().live.remove(&handle);
        self.emit(RangingEvent::Invalidated {
            handle,
            error: error.to_string(),
        });
    }

    fn emit(&self, event: RangingEvent) {
        if self.events.send(event).is_err() {
            debug!("[{}] event dropped, nobody listening", self.label);
        }
    }
}

#[async_trait]
impl RangingEngine for SimulatedEngine {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn create_session(&self) -> Result<EngineHandle> {
        if !self.supported {
            return Err(NearbyError::RangingUnsupported);
        }

        let mut state = self.state.lock();
        let handle = EngineHandle(state.next_handle);
        state.next_handle += 1;

        let token = format!("{}-session-{}", self.label, handle.0).into_bytes();
        state.live.insert(handle, RangingToken::new(token));
        Ok(handle)
    }

    async fn local_token(&self, handle: EngineHandle) -> Option<RangingToken> {
        let state = self.state.lock();
        if !state.tokens_ready {
            return None;
        }
        state.live.get(&handle).cloned()
    }

    async fn configure(&self, handle: EngineHandle, peer_token: &RangingToken) -> Result<()> {
        let auto_sample = {
            let mut state = self.state.lock();
            if !state.live.contains_key(&handle) {
                return Err(NearbyError::Engine(format!("unknown session {}", handle)));
            }
            if state.fail_configure {
                return Err(NearbyError::Engine("configuration rejected".to_string()));
            }
            state.configure_calls.push(ConfigureCall {
                handle,
                peer_token: peer_token.clone(),
                at: Instant::now(),
            });
            state.auto_sample
        };

        if let Some(sample) = auto_sample {
            self.emit_samples(handle, vec![sample]);
        }
        Ok(())
    }

    async fn invalidate(&self, handle: EngineHandle) {
        let mut state = self.state.lock();
        state.live.remove(&handle);
        state.invalidated.push(handle);
    }
}
