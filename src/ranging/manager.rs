//! Ranging Session Manager
//!
//! Owns one engine session per connected peer. Exchanged tokens are applied
//! through a single configuration queue with a settle interval between
//! engine calls, samples are smoothed through the [`SignalFilter`] and the
//! results are published to the registry.

use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{FilterSettings, RangingSettings};
use crate::error::NearbyError;
use crate::filter::SignalFilter;
use crate::identity::PeerId;
use crate::mesh::ExchangeCommand;
use crate::ranging::engine::{EngineHandle, RangingEngine, RangingEvent, RangingToken, RawSample};
use crate::ranging::session::{RangingSession, SessionState, TokenDisposition};
use crate::registry::{DeviceRegistry, EvictionListener, RecordUpdate};

/// Answer to a local token request
#[derive(Debug, Clone)]
pub enum TokenReply {
    Ready(RangingToken),
    /// The engine has not produced the token yet; ask again later
    NotReady,
    /// No session exists for the peer (unsupported, invalidated or disconnected)
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub peer: PeerId,
    pub state: SessionState,
    pub handle: Option<EngineHandle>,
}

#[derive(Debug)]
pub enum RangingCommand {
    ChannelConnected(PeerId),
    ChannelClosed(PeerId),
    LocalToken {
        peer: PeerId,
        reply: oneshot::Sender<TokenReply>,
    },
    PeerToken {
        peer: PeerId,
        token: RangingToken,
    },
    /// Host app went to the background
    Suspend,
    Resume,
    Evict(PeerId),
    SettleElapsed,
    Recreate(PeerId),
    GraceExpired {
        peer: PeerId,
        epoch: u64,
    },
    Snapshot(oneshot::Sender<Vec<SessionSummary>>),
    Shutdown,
}

impl EvictionListener for mpsc::UnboundedSender<RangingCommand> {
    fn on_evicted(&self, peer: &PeerId) {
        let _ = self.send(RangingCommand::Evict(peer.clone()));
    }
}

pub struct RangingManager {
    settings: RangingSettings,
    engine: Arc<dyn RangingEngine>,
    registry: Arc<DeviceRegistry>,
    exchange: mpsc::UnboundedSender<ExchangeCommand>,
    commands: mpsc::UnboundedSender<RangingCommand>,
    filter: SignalFilter,
    sessions: HashMap<PeerId, RangingSession>,
    handles: HashMap<EngineHandle, PeerId>,
    connected: HashSet<PeerId>,
    config_queue: VecDeque<PeerId>,
    settling: bool,
    settle_timer: Option<JoinHandle<()>>,
    recreate_timers: HashMap<PeerId, JoinHandle<()>>,
    recreate_attempts: HashMap<PeerId, u32>,
    grace_timers: HashMap<PeerId, (u64, JoinHandle<()>)>,
    next_epoch: u64,
    host_suspended: bool,
}

impl RangingManager {
    pub fn new(
        settings: RangingSettings,
        filter: FilterSettings,
        engine: Arc<dyn RangingEngine>,
        registry: Arc<DeviceRegistry>,
        exchange: mpsc::UnboundedSender<ExchangeCommand>,
        commands: mpsc::UnboundedSender<RangingCommand>,
    ) -> Self {
        Self {
            settings,
            engine,
            registry,
            exchange,
            commands,
            filter: SignalFilter::new(filter),
            sessions: HashMap::new(),
            handles: HashMap::new(),
            connected: HashSet::new(),
            config_queue: VecDeque::new(),
            settling: false,
            settle_timer: None,
            recreate_timers: HashMap::new(),
            recreate_attempts: HashMap::new(),
            grace_timers: HashMap::new(),
            next_epoch: 0,
            host_suspended: false,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RangingCommand>,
        mut events: mpsc::UnboundedReceiver<RangingEvent>,
    ) {
        info!(
            "Ranging manager started (ranging supported: {})",
            self.engine.is_supported()
        );
        let mut engine_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RangingCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = events.recv(), if engine_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Ranging engine event stream closed");
                        engine_open = false;
                    }
                },
            }
        }

        self.shutdown().await;
        info!("Ranging manager stopped");
    }

    async fn handle_command(&mut self, command: RangingCommand) {
        match command {
            RangingCommand::ChannelConnected(peer) => self.on_channel_connected(peer).await,
            RangingCommand::ChannelClosed(peer) => self.on_channel_closed(peer),
            RangingCommand::LocalToken { peer, reply } => {
                let answer = self.local_token(&peer).await;
                let _ = reply.send(answer);
            }
            RangingCommand::PeerToken { peer, token } => self.on_peer_token(peer, token).await,
            RangingCommand::Suspend => {
                info!("Host suspended, pausing all ranging sessions");
                self.host_suspended = true;
                let peers: Vec<_> = self.sessions.keys().cloned().collect();
                for peer in peers {
                    self.suspend_peer(&peer);
                }
            }
            RangingCommand::Resume => {
                info!("Host resumed, re-applying peer tokens");
                self.host_suspended = false;
                let peers: Vec<_> = self.sessions.keys().cloned().collect();
                for peer in peers {
                    self.resume_peer(&peer);
                }
                self.drain_queue().await;
            }
            RangingCommand::Evict(peer) => {
                self.connected.remove(&peer);
                self.teardown(&peer).await;
            }
            RangingCommand::SettleElapsed => {
                self.settling = false;
                self.settle_timer = None;
                self.drain_queue().await;
            }
            RangingCommand::Recreate(peer) => self.recreate(peer).await,
            RangingCommand::GraceExpired { peer, epoch } => {
                let current = self.grace_timers.get(&peer).map(|(e, _)| *e);
                if current == Some(epoch) {
                    self.grace_timers.remove(&peer);
                    if !self.connected.contains(&peer) {
                        debug!("Grace period over for {}", peer);
                        self.teardown(&peer).await;
                    }
                }
            }
            RangingCommand::Snapshot(reply) => {
                let mut summaries: Vec<_> = self
                    .sessions
                    .values()
                    .map(|session| SessionSummary {
                        peer: session.peer().clone(),
                        state: session.state(),
                        handle: session.handle(),
                    })
                    .collect();
                summaries.sort_by(|a, b| a.peer.cmp(&b.peer));
                let _ = reply.send(summaries);
            }
            RangingCommand::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: RangingEvent) {
        match event {
            RangingEvent::Samples { handle, samples } => {
                if let Some(peer) = self.handles.get(&handle).cloned() {
                    self.on_samples(&peer, &samples);
                } else {
                    debug!("Samples for unknown session {}", handle);
                }
            }
            RangingEvent::Removed { handle, reason } => {
                if let Some(peer) = self.handles.get(&handle).cloned() {
                    info!("{} left ranging ({:?}), distance now unknown", peer, reason);
                    self.filter.reset(&peer);
                    self.registry.update(&peer, RecordUpdate::EstimateCleared);
                }
            }
            RangingEvent::Suspended { handle } => {
                if let Some(peer) = self.handles.get(&handle).cloned() {
                    self.suspend_peer(&peer);
                }
            }
            RangingEvent::Resumed { handle } => {
                if self.host_suspended {
                    return;
                }
                if let Some(peer) = self.handles.get(&handle).cloned() {
                    self.resume_peer(&peer);
                    self.drain_queue().await;
                }
            }
            RangingEvent::Invalidated { handle, error } => {
                if let Some(peer) = self.handles.get(&handle).cloned() {
                    self.invalidate_session(&peer, &error).await;
                } else {
                    debug!("Invalidation for unknown session {}", handle);
                }
            }
        }
    }

    async fn on_channel_connected(&mut self, peer: PeerId) {
        self.connected.insert(peer.clone());

        if let Some((_, timer)) = self.grace_timers.remove(&peer) {
            timer.abort();
            info!("{} reconnected within grace period, keeping session", peer);
        }

        if !self.engine.is_supported() {
            self.registry
                .update(&peer, RecordUpdate::RangingAvailable(false));
            return;
        }

        match self.sessions.get(&peer).map(|session| session.state()) {
            None => {
                self.create_session(&peer).await;
            }
            Some(SessionState::Invalidated) if !self.recreate_timers.contains_key(&peer) => {
                self.schedule_recreate(&peer);
            }
            Some(SessionState::Idle) => {
                if self.sessions.get(&peer).is_some_and(|s| s.has_peer_token()) {
                    self.enqueue_configure(&peer).await;
                }
            }
            Some(_) => {}
        }
    }

    fn on_channel_closed(&mut self, peer: PeerId) {
        self.connected.remove(&peer);
        self.config_queue.retain(|queued| *queued != peer);
        if let Some(timer) = self.recreate_timers.remove(&peer) {
            timer.abort();
        }

        if !self.sessions.contains_key(&peer) {
            return;
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let commands = self.commands.clone();
        let grace = self.settings.session_grace();
        let grace_peer = peer.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = commands.send(RangingCommand::GraceExpired {
                peer: grace_peer,
                epoch,
            });
        });

        if let Some((_, previous)) = self.grace_timers.insert(peer.clone(), (epoch, timer)) {
            previous.abort();
        }
        debug!("{} disconnected, session kept for {:?}", peer, grace);
    }

    async fn local_token(&self, peer: &PeerId) -> TokenReply {
        if !self.engine.is_supported() || !self.connected.contains(peer) {
            return TokenReply::Unavailable;
        }
        match self.sessions.get(peer).and_then(|session| session.handle()) {
            Some(handle) => match self.engine.local_token(handle).await {
                Some(token) => TokenReply::Ready(token),
                None => TokenReply::NotReady,
            },
            None => TokenReply::Unavailable,
        }
    }

    async fn on_peer_token(&mut self, peer: PeerId, token: RangingToken) {
        if !self.engine.is_supported() {
            debug!("Ignoring token from {}, ranging unsupported", peer);
            return;
        }
        if !self.sessions.contains_key(&peer) {
            if !self.connected.contains(&peer) {
                warn!("Token from {} without a channel, dropping", peer);
                return;
            }
            if !self.create_session(&peer).await {
                return;
            }
        }

        let fingerprint = token.fingerprint();
        let disposition = match self.sessions.get_mut(&peer) {
            Some(session) => session.set_peer_token(token),
            None => return,
        };

        match disposition {
            TokenDisposition::Duplicate => {
                debug!("Duplicate token {} from {} ignored", fingerprint, peer)
            }
            TokenDisposition::Stored => {
                debug!("Token {} from {} stored for later", fingerprint, peer)
            }
            TokenDisposition::NeedsConfigure => self.enqueue_configure(&peer).await,
        }
    }

    fn on_samples(&mut self, peer: &PeerId, samples: &[RawSample]) {
        for sample in samples {
            let activated = match self.sessions.get_mut(peer).map(|s| s.on_sample()) {
                Some(Ok(activated)) => activated,
                Some(Err(e)) => {
                    debug!("Dropping sample for {}: {}", peer, e);
                    continue;
                }
                None => return,
            };

            if activated {
                info!("Ranging active with {}", peer);
                self.recreate_attempts.remove(peer);
                self.publish_state(peer, SessionState::Active);
            }

            if let Some(estimate) = self.filter.process_sample(peer, sample, Utc::now()) {
                debug!(
                    "{}: distance {:?} bearing {:?}",
                    peer, estimate.distance, estimate.bearing_degrees
                );
                self.registry.update(peer, RecordUpdate::Estimate(estimate));
            }
        }
    }

    /// Create a fresh engine session for `peer`; returns false on failure
    async fn create_session(&mut self, peer: &PeerId) -> bool {
        match self.engine.create_session().await {
            Ok(handle) => {
                info!("Created ranging session {} for {}", handle, peer);
                self.sessions
                    .insert(peer.clone(), RangingSession::new(peer.clone(), handle));
                self.handles.insert(handle, peer.clone());
                self.registry
                    .update(peer, RecordUpdate::RangingAvailable(true));
                self.publish_state(peer, SessionState::Idle);
                if self.host_suspended {
                    self.suspend_peer(peer);
                }
                true
            }
            Err(NearbyError::RangingUnsupported) => {
                self.registry
                    .update(peer, RecordUpdate::RangingAvailable(false));
                false
            }
            Err(e) => {
                warn!("Failed to create ranging session for {}: {}", peer, e);
                false
            }
        }
    }

    async fn recreate(&mut self, peer: PeerId) {
        self.recreate_timers.remove(&peer);
        if !self.connected.contains(&peer) || !self.engine.is_supported() {
            return;
        }

        let state = self.sessions.get(&peer).map(|session| session.state());
        let recreated = match state {
            None => self.create_session(&peer).await,
            Some(SessionState::Invalidated) => match self.engine.create_session().await {
                Ok(handle) => match self.sessions.get_mut(&peer).map(|s| s.recreate(handle)) {
                    Some(Ok(())) => {
                        info!("Recreated ranging session {} for {}", handle, peer);
                        self.handles.insert(handle, peer.clone());
                        self.publish_state(&peer, SessionState::Idle);
                        if self.host_suspended {
                            self.suspend_peer(&peer);
                        }
                        true
                    }
                    _ => {
                        self.engine.invalidate(handle).await;
                        false
                    }
                },
                Err(e) => {
                    warn!("Failed to recreate ranging session for {}: {}", peer, e);
                    false
                }
            },
            Some(_) => return,
        };

        if !recreated {
            self.schedule_recreate(&peer);
            return;
        }

        let _ = self
            .exchange
            .send(ExchangeCommand::SessionRecreated(peer.clone()));
        if self.sessions.get(&peer).is_some_and(|s| s.has_peer_token()) {
            self.enqueue_configure(&peer).await;
        }
    }

    fn schedule_recreate(&mut self, peer: &PeerId) {
        let attempts = self.recreate_attempts.entry(peer.clone()).or_insert(0);
        *attempts += 1;
        if *attempts > self.settings.max_recreate_attempts {
            warn!(
                "Giving up on ranging with {} after {} recreation attempts",
                peer, self.settings.max_recreate_attempts
            );
            return;
        }

        let commands = self.commands.clone();
        let backoff = self.settings.recreate_backoff();
        let recreate_peer = peer.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = commands.send(RangingCommand::Recreate(recreate_peer));
        });

        if let Some(previous) = self.recreate_timers.insert(peer.clone(), timer) {
            previous.abort();
        }
        debug!("Recreating ranging session for {} in {:?}", peer, backoff);
    }

    async fn invalidate_session(&mut self, peer: &PeerId, error: &str) {
        let handle = match self.sessions.get_mut(peer) {
            Some(session) => session.invalidate(),
            None => return,
        };
        warn!("Ranging session for {} invalidated: {}", peer, error);

        if let Some(handle) = handle {
            self.handles.remove(&handle);
            self.engine.invalidate(handle).await;
        }
        self.config_queue.retain(|queued| queued != peer);
        self.filter.reset(peer);
        self.publish_state(peer, SessionState::Invalidated);
        self.registry.update(peer, RecordUpdate::EstimateCleared);
        let _ = self.exchange.send(ExchangeCommand::SessionReset(peer.clone()));

        if self.engine.is_supported() && self.connected.contains(peer) {
            self.schedule_recreate(peer);
        }
    }

    /// Destroy the peer's session and everything derived from it
    async fn teardown(&mut self, peer: &PeerId) {
        if let Some((_, timer)) = self.grace_timers.remove(peer) {
            timer.abort();
        }
        if let Some(timer) = self.recreate_timers.remove(peer) {
            timer.abort();
        }
        self.recreate_attempts.remove(peer);
        self.config_queue.retain(|queued| queued != peer);

        if let Some(mut session) = self.sessions.remove(peer) {
            if let Some(handle) = session.invalidate() {
                self.handles.remove(&handle);
                self.engine.invalidate(handle).await;
            }
            info!("Ranging session for {} torn down", peer);
        }

        self.filter.reset(peer);
        self.registry.update(peer, RecordUpdate::RangingState(None));
        self.registry.update(peer, RecordUpdate::EstimateCleared);
        self.registry.update(peer, RecordUpdate::TokenReceived(false));
        let _ = self.exchange.send(ExchangeCommand::SessionReset(peer.clone()));
    }

    fn suspend_peer(&mut self, peer: &PeerId) {
        let suspended = self
            .sessions
            .get_mut(peer)
            .is_some_and(|session| session.suspend().is_ok());
        if suspended {
            self.config_queue.retain(|queued| queued != peer);
            self.publish_state(peer, SessionState::Suspended);
        }
    }

    /// Leave Suspended and queue the last known token if the channel is up
    fn resume_peer(&mut self, peer: &PeerId) {
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        if session.state() != SessionState::Suspended {
            return;
        }
        let has_token = session.resume();
        self.publish_state(peer, SessionState::Idle);

        if has_token && self.connected.contains(peer) && !self.config_queue.contains(peer) {
            self.config_queue.push_back(peer.clone());
        }
    }

    async fn enqueue_configure(&mut self, peer: &PeerId) {
        if !self.config_queue.contains(peer) {
            self.config_queue.push_back(peer.clone());
        }
        self.drain_queue().await;
    }

    /// Issue queued configurations, one per settle interval
    async fn drain_queue(&mut self) {
        while !self.settling {
            let Some(peer) = self.config_queue.pop_front() else {
                return;
            };
            if self.configure(&peer).await {
                self.start_settle();
            }
        }
    }

    /// Apply the stored peer token; returns true when the engine was called
    async fn configure(&mut self, peer: &PeerId) -> bool {
        if !self.connected.contains(peer) {
            return false;
        }
        let prepared = match self.sessions.get_mut(peer).map(|s| s.begin_configure()) {
            Some(Ok(prepared)) => prepared,
            Some(Err(e)) => {
                debug!("Skipping configuration for {}: {}", peer, e);
                return false;
            }
            None => return false,
        };
        let (handle, token) = prepared;

        info!(
            "Configuring ranging session {} for {} with token {}",
            handle,
            peer,
            token.fingerprint()
        );
        self.publish_state(peer, SessionState::Configuring);

        if let Err(e) = self.engine.configure(handle, &token).await {
            self.invalidate_session(peer, &e.to_string()).await;
        }
        true
    }

    fn start_settle(&mut self) {
        self.settling = true;
        let commands = self.commands.clone();
        let settle = self.settings.settle_interval();
        self.settle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let _ = commands.send(RangingCommand::SettleElapsed);
        }));
    }

    fn publish_state(&self, peer: &PeerId, state: SessionState) {
        self.registry
            .update(peer, RecordUpdate::RangingState(Some(state)));
    }

    async fn shutdown(&mut self) {
        if let Some(timer) = self.settle_timer.take() {
            timer.abort();
        }
        for (_, timer) in self.recreate_timers.drain() {
            timer.abort();
        }
        for (_, (_, timer)) in self.grace_timers.drain() {
            timer.abort();
        }
        for (handle, _) in self.handles.drain() {
            self.engine.invalidate(handle).await;
        }
        self.sessions.clear();
    }
}
