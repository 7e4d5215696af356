//! Device Registry
//!
//! UI-facing aggregate state: one record per peer merging connection status,
//! token-exchange status and the latest filtered estimate. Producers publish
//! partial updates; nothing here blocks them for longer than a map write.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::filter::FilteredEstimate;
use crate::identity::PeerId;
use crate::ranging::SessionState;

/// Connection state for a peer, owned by the connection coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Discovered,         // Seen on the radio, no invitation in flight
    InvitationSent,     // We invited, waiting for the channel
    InvitationReceived, // We accepted their invitation
    Connecting,         // Transport is establishing the channel
    Connected,          // Pairwise channel is usable
    Disconnected,       // Channel closed or peer lost
}

/// Everything known about one peer
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub peer_id: PeerId,
    pub tie_break_key: Option<String>,
    pub connection_state: ConnectionState,
    pub token_sent: bool,
    pub token_received: bool,
    /// `None` means distance/direction unknown
    pub estimate: Option<FilteredEstimate>,
    pub ranging_state: Option<SessionState>,
    pub ranging_available: bool,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip)]
    last_seen: Instant,
}

impl DeviceRecord {
    fn new(peer_id: PeerId) -> Self {
        let now = Utc::now();
        Self {
            peer_id,
            tie_break_key: None,
            connection_state: ConnectionState::Discovered,
            token_sent: false,
            token_received: false,
            estimate: None,
            ranging_state: None,
            ranging_available: true,
            first_seen: now,
            last_activity: now,
            last_seen: Instant::now(),
        }
    }

    /// Time since the last observed event for this peer
    fn idle_for(&self) -> Duration {
        self.last_seen.elapsed()
    }

    fn apply(&mut self, update: RecordUpdate) {
        match update {
            RecordUpdate::Discovered { tie_break_key } => {
                if tie_break_key.is_some() {
                    self.tie_break_key = tie_break_key;
                }
            }
            RecordUpdate::Connection(state) => self.connection_state = state,
            RecordUpdate::TokenSent(sent) => self.token_sent = sent,
            RecordUpdate::TokenReceived(received) => self.token_received = received,
            RecordUpdate::Estimate(estimate) => self.estimate = Some(estimate),
            RecordUpdate::EstimateCleared => self.estimate = None,
            RecordUpdate::RangingState(state) => self.ranging_state = state,
            RecordUpdate::RangingAvailable(available) => self.ranging_available = available,
            RecordUpdate::Touch => {}
        }
        self.last_activity = Utc::now();
        self.last_seen = Instant::now();
    }
}

/// Partial update published by a producer component
#[derive(Debug, Clone)]
pub enum RecordUpdate {
    Discovered { tie_break_key: Option<String> },
    Connection(ConnectionState),
    TokenSent(bool),
    TokenReceived(bool),
    Estimate(FilteredEstimate),
    EstimateCleared,
    RangingState(Option<SessionState>),
    RangingAvailable(bool),
    Touch,
}

/// Change notification for consumers
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Updated(DeviceRecord),
    Evicted(PeerId),
}

/// Receives eviction requests for peers dropped by [`DeviceRegistry::evict_stale`]
pub trait EvictionListener: Send + Sync {
    fn on_evicted(&self, peer: &PeerId);
}

pub struct DeviceRegistry {
    records: DashMap<PeerId, DeviceRecord>,
    updates: broadcast::Sender<RegistryEvent>,
    listeners: RwLock<Vec<Arc<dyn EvictionListener>>>,
}

impl DeviceRegistry {
    pub fn new(update_buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(update_buffer.max(1));
        Self {
            records: DashMap::new(),
            updates,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_eviction_listener(&self, listener: Arc<dyn EvictionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.updates.subscribe()
    }

    /// Apply an update, creating the record for a peer seen for the first time
    pub fn upsert(&self, peer: &PeerId, update: RecordUpdate) {
        let snapshot = {
            let mut record = self.records.entry(peer.clone()).or_insert_with(|| {
                info!("Tracking new peer: {}", peer);
                DeviceRecord::new(peer.clone())
            });
            record.apply(update);
            record.clone()
        };
        self.publish(RegistryEvent::Updated(snapshot));
    }

    /// Apply an update only if the peer is already tracked
    pub fn update(&self, peer: &PeerId, update: RecordUpdate) -> bool {
        let snapshot = match self.records.get_mut(peer) {
            Some(mut record) => {
                record.apply(update);
                record.clone()
            }
            None => {
                debug!("Dropping update for untracked peer {}: {:?}", peer, update);
                return false;
            }
        };
        self.publish(RegistryEvent::Updated(snapshot));
        true
    }

    pub fn get(&self, peer: &PeerId) -> Option<DeviceRecord> {
        self.records.get(peer).map(|entry| entry.value().clone())
    }

    /// All tracked peers, ordered by peer id
    pub fn list_active(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove records idle longer than `timeout` and ask listeners to tear
    /// down their channel and session
    pub fn evict_stale(&self, timeout: Duration) -> Vec<PeerId> {
        let candidates: Vec<PeerId> = self
            .records
            .iter()
            .filter(|entry| entry.value().idle_for() > timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for peer in candidates {
            if self
                .records
                .remove_if(&peer, |_, record| record.idle_for() > timeout)
                .is_some()
            {
                evicted.push(peer);
            }
        }

        if evicted.is_empty() {
            return evicted;
        }

        let listeners = self.listeners.read().clone();
        for peer in &evicted {
            info!("Evicting stale peer: {}", peer);
            for listener in &listeners {
                listener.on_evicted(peer);
            }
            self.publish(RegistryEvent::Evicted(peer.clone()));
        }

        evicted
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        let records = self.list_active();
        let connected = records
            .iter()
            .filter(|r| r.connection_state == ConnectionState::Connected)
            .count();
        let ranging = records
            .iter()
            .filter(|r| r.ranging_state == Some(SessionState::Active))
            .count();
        let with_estimate = records.iter().filter(|r| r.estimate.is_some()).count();

        serde_json::json!({
            "total_peers": records.len(),
            "connected_peers": connected,
            "ranging_peers": ranging,
            "peers_with_estimate": with_estimate,
        })
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.updates.send(event);
    }
}
