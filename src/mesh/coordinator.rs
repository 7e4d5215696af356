//! Connection Coordinator
//!
//! Turns discovery into at most one pairwise channel per peer pair. Only the
//! side whose tie-break key orders first sends the invitation; the other side
//! waits and accepts. Invitation attempts are bounded by a timeout, a retry
//! budget and a cooldown, and channel transitions are forwarded downstream to
//! the token exchange and the ranging session manager.

use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ConnectionSettings;
use crate::identity::{PeerId, PeerIdentity, TieBreaker};
use crate::mesh::protocol::TIE_BREAK_ATTRIBUTE;
use crate::mesh::token_exchange::ExchangeCommand;
use crate::mesh::transport::{ChannelState, DiscoveryAttributes, Transport, TransportEvent};
use crate::ranging::RangingCommand;
use crate::registry::{ConnectionState, DeviceRegistry, EvictionListener, RecordUpdate};

#[derive(Debug)]
pub enum CoordinatorCommand {
    /// User-requested invitation
    Invite(PeerId),
    Evict(PeerId),
    InviteTimeout { peer: PeerId, epoch: u64 },
    RetryDue { peer: PeerId, epoch: u64 },
    Snapshot(oneshot::Sender<Vec<(PeerId, ConnectionState)>>),
    Shutdown,
}

impl EvictionListener for mpsc::UnboundedSender<CoordinatorCommand> {
    fn on_evicted(&self, peer: &PeerId) {
        let _ = self.send(CoordinatorCommand::Evict(peer.clone()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteReason {
    Discovery,
    Retry,
    User,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    InviteTimeout,
    Retry,
}

/// Downstream components notified about channel transitions
#[derive(Clone)]
pub struct ChannelSinks {
    pub ranging: mpsc::UnboundedSender<RangingCommand>,
    pub exchange: mpsc::UnboundedSender<ExchangeCommand>,
}

struct PeerLink {
    tie_break_key: String,
    state: ConnectionState,
    /// Failed attempts since the last successful connection
    attempts: u32,
    retryable: bool,
    /// Currently visible to discovery
    present: bool,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

impl PeerLink {
    fn new(tie_break_key: String) -> Self {
        Self {
            tie_break_key,
            state: ConnectionState::Discovered,
            attempts: 0,
            retryable: true,
            present: true,
            epoch: 0,
            timer: None,
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn is_engaged(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::InvitationSent
                | ConnectionState::InvitationReceived
                | ConnectionState::Connecting
                | ConnectionState::Connected
        )
    }
}

pub struct ConnectionCoordinator {
    settings: ConnectionSettings,
    identity: PeerIdentity,
    tie_breaker: Arc<dyn TieBreaker>,
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    sinks: ChannelSinks,
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
    links: HashMap<PeerId, PeerLink>,
    next_epoch: u64,
}

impl ConnectionCoordinator {
    pub fn new(
        settings: ConnectionSettings,
        identity: PeerIdentity,
        tie_breaker: Arc<dyn TieBreaker>,
        transport: Arc<dyn Transport>,
        registry: Arc<DeviceRegistry>,
        sinks: ChannelSinks,
        commands: mpsc::UnboundedSender<CoordinatorCommand>,
    ) -> Self {
        Self {
            settings,
            identity,
            tie_breaker,
            transport,
            registry,
            sinks,
            commands,
            links: HashMap::new(),
            next_epoch: 0,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CoordinatorCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Connection coordinator started for {}", self.identity.id);
        let mut transport_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CoordinatorCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = events.recv(), if transport_open => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        warn!("Transport event stream closed");
                        transport_open = false;
                    }
                },
            }
        }

        for link in self.links.values_mut() {
            link.cancel_timer();
        }
        info!("Connection coordinator stopped");
    }

    async fn handle_command(&mut self, command: CoordinatorCommand) {
        match command {
            CoordinatorCommand::Invite(peer) => {
                match self.links.get_mut(&peer) {
                    Some(link) => {
                        link.attempts = 0;
                        link.retryable = true;
                    }
                    None => {
                        warn!("Cannot invite unknown peer {}", peer);
                        return;
                    }
                }
                self.try_invite(&peer, InviteReason::User).await;
            }
            CoordinatorCommand::Evict(peer) => self.evict(&peer).await,
            CoordinatorCommand::InviteTimeout { peer, epoch } => {
                if !self.timer_fired(&peer, epoch) {
                    return;
                }
                let pending = self.links.get(&peer).is_some_and(|link| {
                    matches!(
                        link.state,
                        ConnectionState::InvitationSent
                            | ConnectionState::InvitationReceived
                            | ConnectionState::Connecting
                    )
                });
                if pending {
                    warn!("Invitation with {} timed out", peer);
                    self.on_attempt_failed(&peer);
                }
            }
            CoordinatorCommand::RetryDue { peer, epoch } => {
                if !self.timer_fired(&peer, epoch) {
                    return;
                }
                let ready = self.links.get(&peer).is_some_and(|link| {
                    !link.is_engaged() && link.retryable && link.present
                });
                if ready {
                    self.try_invite(&peer, InviteReason::Retry).await;
                }
            }
            CoordinatorCommand::Snapshot(reply) => {
                let mut states: Vec<_> = self
                    .links
                    .iter()
                    .map(|(peer, link)| (peer.clone(), link.state))
                    .collect();
                states.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = reply.send(states);
            }
            CoordinatorCommand::Shutdown => {}
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerDiscovered { peer, attributes } => {
                let key = tie_break_key(&peer, &attributes);
                self.on_peer_discovered(&peer, key).await;
            }
            TransportEvent::PeerLost { peer } => self.on_peer_lost(&peer),
            TransportEvent::InvitationReceived {
                peer,
                attributes,
                respond,
            } => {
                let key = tie_break_key(&peer, &attributes);
                let accept = self.on_invitation_received(&peer, key);
                if respond.send(accept).is_err() {
                    debug!("Invitation from {} withdrawn before we answered", peer);
                }
            }
            TransportEvent::ChannelStateChanged { peer, state } => {
                self.on_channel_state_changed(&peer, state).await
            }
            TransportEvent::DataReceived { peer, bytes } => {
                let _ = self.sinks.exchange.send(ExchangeCommand::Data { peer, bytes });
            }
        }
    }

    pub async fn on_peer_discovered(&mut self, peer: &PeerId, tie_break_key: String) {
        if *peer == self.identity.id {
            return;
        }

        self.registry.upsert(
            peer,
            RecordUpdate::Discovered {
                tie_break_key: Some(tie_break_key.clone()),
            },
        );

        let link = self
            .links
            .entry(peer.clone())
            .or_insert_with(|| PeerLink::new(tie_break_key.clone()));
        link.tie_break_key = tie_break_key;
        if !link.present {
            // Back in range: the retry budget starts over
            link.present = true;
            link.attempts = 0;
            link.retryable = true;
        }

        if link.is_engaged() {
            debug!("{} rediscovered while {:?}, ignoring", peer, link.state);
            return;
        }
        if link.timer.is_some() || !link.retryable {
            return;
        }

        if self
            .tie_breaker
            .local_invites(&self.identity.tie_break_key, &link.tie_break_key)
        {
            self.try_invite(peer, InviteReason::Discovery).await;
        } else {
            debug!("Discovered {}, waiting for its invitation", peer);
        }
    }

    pub fn on_peer_lost(&mut self, peer: &PeerId) {
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        link.present = false;
        info!("Lost sight of {}", peer);

        if matches!(
            link.state,
            ConnectionState::Discovered
                | ConnectionState::InvitationSent
                | ConnectionState::InvitationReceived
        ) {
            link.cancel_timer();
            link.state = ConnectionState::Disconnected;
            self.registry
                .update(peer, RecordUpdate::Connection(ConnectionState::Disconnected));
        }
    }

    /// Decide whether to accept an inbound invitation
    pub fn on_invitation_received(&mut self, peer: &PeerId, tie_break_key: String) -> bool {
        if *peer == self.identity.id {
            return false;
        }

        self.registry.upsert(
            peer,
            RecordUpdate::Discovered {
                tie_break_key: Some(tie_break_key.clone()),
            },
        );
        let engaged = self.engaged_count(peer);
        let link = self
            .links
            .entry(peer.clone())
            .or_insert_with(|| PeerLink::new(tie_break_key));

        match link.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                info!("Declining invitation from {}: already connected", peer);
                return false;
            }
            ConnectionState::InvitationSent => {
                info!("Invitations crossed with {}, accepting theirs", peer);
            }
            _ => {}
        }

        if engaged >= self.settings.max_connections {
            warn!(
                "Declining invitation from {}: {} connections already open",
                peer, engaged
            );
            return false;
        }

        link.state = ConnectionState::InvitationReceived;
        link.present = true;
        self.registry.update(
            peer,
            RecordUpdate::Connection(ConnectionState::InvitationReceived),
        );
        let timeout = self.settings.invite_timeout();
        self.arm_timer(peer, timeout, TimerKind::InviteTimeout);
        info!("Accepted invitation from {}", peer);
        true
    }

    pub async fn on_channel_state_changed(&mut self, peer: &PeerId, state: ChannelState) {
        if !self.links.contains_key(peer) {
            if state == ChannelState::NotConnected {
                return;
            }
            // Channel opened by a peer we never saw advertise
            self.registry
                .upsert(peer, RecordUpdate::Discovered { tie_break_key: None });
            self.links
                .insert(peer.clone(), PeerLink::new(peer.to_string()));
        }
        let engaged = self.engaged_count(peer);
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        let current = link.state;

        // A channel we neither invited nor accepted must still fit under the limit
        if state != ChannelState::NotConnected
            && !link.is_engaged()
            && engaged >= self.settings.max_connections
        {
            warn!(
                "Refusing channel from {}: {} connections already open",
                peer, engaged
            );
            link.state = ConnectionState::Disconnected;
            self.registry
                .update(peer, RecordUpdate::Connection(ConnectionState::Disconnected));
            if let Err(e) = self.transport.disconnect(peer).await {
                warn!("Failed to disconnect {}: {}", peer, e);
            }
            return;
        }

        match state {
            ChannelState::Connecting => {
                if current != ConnectionState::Connected {
                    link.state = ConnectionState::Connecting;
                    self.registry
                        .update(peer, RecordUpdate::Connection(ConnectionState::Connecting));
                }
            }
            ChannelState::Connected => {
                if current == ConnectionState::Connected {
                    return;
                }
                link.cancel_timer();
                link.state = ConnectionState::Connected;
                link.attempts = 0;
                link.retryable = true;
                info!("Channel to {} connected", peer);

                self.registry
                    .update(peer, RecordUpdate::Connection(ConnectionState::Connected));
                let _ = self
                    .sinks
                    .ranging
                    .send(RangingCommand::ChannelConnected(peer.clone()));
                let _ = self
                    .sinks
                    .exchange
                    .send(ExchangeCommand::ChannelReady(peer.clone()));
            }
            ChannelState::NotConnected => match current {
                ConnectionState::Connected => {
                    link.cancel_timer();
                    link.state = ConnectionState::Disconnected;
                    let reconnect = link.present
                        && self
                            .tie_breaker
                            .local_invites(&self.identity.tie_break_key, &link.tie_break_key);
                    info!("Channel to {} closed", peer);

                    self.registry.update(
                        peer,
                        RecordUpdate::Connection(ConnectionState::Disconnected),
                    );
                    let _ = self
                        .sinks
                        .ranging
                        .send(RangingCommand::ChannelClosed(peer.clone()));
                    let _ = self
                        .sinks
                        .exchange
                        .send(ExchangeCommand::ChannelClosed(peer.clone()));

                    if reconnect {
                        let delay = self.retry_delay();
                        self.arm_timer(peer, delay, TimerKind::Retry);
                    }
                }
                ConnectionState::InvitationSent
                | ConnectionState::InvitationReceived
                | ConnectionState::Connecting => self.on_attempt_failed(peer),
                ConnectionState::Discovered | ConnectionState::Disconnected => {}
            },
        }
    }

    /// Invite `peer` unless a connection already exists or is being made
    pub async fn try_invite(&mut self, peer: &PeerId, reason: InviteReason) {
        if self.links.get(peer).map_or(true, PeerLink::is_engaged) {
            return;
        }
        if self.engaged_count(peer) >= self.settings.max_connections {
            warn!(
                "Not inviting {}: connection limit of {} reached",
                peer, self.settings.max_connections
            );
            if reason != InviteReason::User {
                // Try again once a slot may have freed up
                let delay = self.retry_delay();
                self.arm_timer(peer, delay, TimerKind::Retry);
            }
            return;
        }
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };

        link.state = ConnectionState::InvitationSent;
        self.registry
            .update(peer, RecordUpdate::Connection(ConnectionState::InvitationSent));
        let timeout = self.settings.invite_timeout();
        self.arm_timer(peer, timeout, TimerKind::InviteTimeout);

        info!("Inviting {} ({:?})", peer, reason);
        if let Err(e) = self.transport.invite(peer, timeout).await {
            warn!("Invitation to {} failed: {}", peer, e);
            self.on_attempt_failed(peer);
        }
    }

    /// An invitation or channel setup did not complete
    fn on_attempt_failed(&mut self, peer: &PeerId) {
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        link.cancel_timer();
        link.state = ConnectionState::Discovered;
        self.registry
            .update(peer, RecordUpdate::Connection(ConnectionState::Discovered));

        let inviter = self
            .tie_breaker
            .local_invites(&self.identity.tie_break_key, &link.tie_break_key);
        if !inviter {
            return;
        }

        link.attempts += 1;
        if link.attempts >= self.settings.max_attempts {
            link.retryable = false;
            warn!(
                "{} unreachable after {} attempts, waiting for rediscovery",
                peer, link.attempts
            );
            return;
        }

        let delay = self.retry_delay();
        debug!("Retrying {} in {:?}", peer, delay);
        self.arm_timer(peer, delay, TimerKind::Retry);
    }

    async fn evict(&mut self, peer: &PeerId) {
        let Some(mut link) = self.links.remove(peer) else {
            return;
        };
        link.cancel_timer();
        info!("Evicting {} ({:?})", peer, link.state);

        if matches!(
            link.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            if let Err(e) = self.transport.disconnect(peer).await {
                warn!("Failed to disconnect {}: {}", peer, e);
            }
        }
        let _ = self
            .sinks
            .exchange
            .send(ExchangeCommand::ChannelClosed(peer.clone()));
    }

    /// Links other than `peer` holding a slot: pending invitations count too
    fn engaged_count(&self, peer: &PeerId) -> usize {
        self.links
            .iter()
            .filter(|(id, link)| *id != peer && link.is_engaged())
            .count()
    }

    fn retry_delay(&self) -> Duration {
        let jitter = match self.settings.retry_jitter_ms {
            0 => 0,
            max => rand::thread_rng().gen_range(0..=max),
        };
        self.settings.retry_cooldown() + Duration::from_millis(jitter)
    }

    fn arm_timer(&mut self, peer: &PeerId, delay: Duration, kind: TimerKind) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        link.cancel_timer();
        link.epoch = epoch;

        let commands = self.commands.clone();
        let peer = peer.clone();
        link.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let command = match kind {
                TimerKind::InviteTimeout => CoordinatorCommand::InviteTimeout { peer, epoch },
                TimerKind::Retry => CoordinatorCommand::RetryDue { peer, epoch },
            };
            let _ = commands.send(command);
        }));
    }

    /// True when `epoch` is the peer's live timer; clears it
    fn timer_fired(&mut self, peer: &PeerId, epoch: u64) -> bool {
        match self.links.get_mut(peer) {
            Some(link) if link.epoch == epoch && link.timer.is_some() => {
                link.timer = None;
                true
            }
            _ => false,
        }
    }
}

/// Tie-break key advertised by `peer`, falling back to its id
fn tie_break_key(peer: &PeerId, attributes: &DiscoveryAttributes) -> String {
    attributes
        .get(TIE_BREAK_ATTRIBUTE)
        .cloned()
        .unwrap_or_else(|| peer.to_string())
}
