//! Nearby Node
//!
//! Composition root: wires the coordinator, token exchange, ranging manager
//! and registry together over channels, starts advertising and browsing, and
//! exposes the consumer-facing API.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

use crate::config::{NearbyConfig, RegistrySettings};
use crate::error::NearbyError;
use crate::identity::{LexicographicTieBreaker, PeerId, PeerIdentity, TieBreaker};
use crate::mesh::{
    ChannelSinks, ConnectionCoordinator, CoordinatorCommand, DiscoveryAttributes, ExchangeCommand,
    TokenExchange, Transport, TransportEvent, SERVICE_TYPE, TIE_BREAK_ATTRIBUTE,
};
use crate::ranging::{RangingCommand, RangingEngine, RangingEvent, RangingManager, SessionSummary};
use crate::registry::{ConnectionState, DeviceRecord, DeviceRegistry, RegistryEvent};

/// External collaborators and their event streams
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub engine: Arc<dyn RangingEngine>,
    pub engine_events: mpsc::UnboundedReceiver<RangingEvent>,
}

/// A running nearby-ranging node
pub struct NearbyNode {
    identity: PeerIdentity,
    config: NearbyConfig,
    registry: Arc<DeviceRegistry>,
    coordinator: mpsc::UnboundedSender<CoordinatorCommand>,
    ranging: mpsc::UnboundedSender<RangingCommand>,
    exchange: mpsc::UnboundedSender<ExchangeCommand>,
    ranging_supported: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    eviction: Mutex<Option<JoinHandle<()>>>,
    is_running: AtomicBool,
    started_at: DateTime<Utc>,
}

impl NearbyNode {
    /// Start a node with the default tie-break ordering
    pub async fn start(
        config: NearbyConfig,
        identity: PeerIdentity,
        collaborators: Collaborators,
    ) -> Result<Self> {
        Self::start_with_tie_breaker(
            config,
            identity,
            collaborators,
            Arc::new(LexicographicTieBreaker),
        )
        .await
    }

    pub async fn start_with_tie_breaker(
        config: NearbyConfig,
        identity: PeerIdentity,
        collaborators: Collaborators,
        tie_breaker: Arc<dyn TieBreaker>,
    ) -> Result<Self> {
        config.validate().context("Invalid nearby configuration")?;
        info!("Starting nearby node {}", identity.id);

        let Collaborators {
            transport,
            transport_events,
            engine,
            engine_events,
        } = collaborators;

        let ranging_supported = engine.is_supported();
        if !ranging_supported {
            warn!("Ranging is not supported on this device, discovery only");
        }

        let registry = Arc::new(DeviceRegistry::new(config.registry.update_buffer));
        let (coordinator_tx, coordinator_rx) = mpsc::unbounded_channel();
        let (ranging_tx, ranging_rx) = mpsc::unbounded_channel();
        let (exchange_tx, exchange_rx) = mpsc::unbounded_channel();

        registry.add_eviction_listener(Arc::new(coordinator_tx.clone()));
        registry.add_eviction_listener(Arc::new(ranging_tx.clone()));

        let exchange = TokenExchange::new(
            config.ranging.clone(),
            transport.clone(),
            ranging_tx.clone(),
            registry.clone(),
            exchange_tx.clone(),
        );
        let manager = RangingManager::new(
            config.ranging.clone(),
            config.filter.clone(),
            engine,
            registry.clone(),
            exchange_tx.clone(),
            ranging_tx.clone(),
        );
        let coordinator = ConnectionCoordinator::new(
            config.connection.clone(),
            identity.clone(),
            tie_breaker,
            transport.clone(),
            registry.clone(),
            ChannelSinks {
                ranging: ranging_tx.clone(),
                exchange: exchange_tx.clone(),
            },
            coordinator_tx.clone(),
        );

        let tasks = vec![
            tokio::spawn(exchange.run(exchange_rx)),
            tokio::spawn(manager.run(ranging_rx, engine_events)),
            tokio::spawn(coordinator.run(coordinator_rx, transport_events)),
        ];
        let eviction = tokio::spawn(run_eviction(registry.clone(), config.registry.clone()));

        let node = Self {
            identity,
            config,
            registry,
            coordinator: coordinator_tx,
            ranging: ranging_tx,
            exchange: exchange_tx,
            ranging_supported,
            tasks: Mutex::new(tasks),
            eviction: Mutex::new(Some(eviction)),
            is_running: AtomicBool::new(true),
            started_at: Utc::now(),
        };

        if let Err(e) = node.start_radio(transport.as_ref()).await {
            node.stop().await;
            return Err(e);
        }

        info!("Nearby node {} started", node.identity.id);
        Ok(node)
    }

    async fn start_radio(&self, transport: &dyn Transport) -> Result<()> {
        let mut attributes = DiscoveryAttributes::new();
        attributes.insert(
            TIE_BREAK_ATTRIBUTE.to_string(),
            self.identity.tie_break_key.clone(),
        );

        transport
            .start_advertise(&self.identity, attributes)
            .await
            .context("Failed to start advertising")?;
        transport
            .start_browse()
            .await
            .context("Failed to start browsing")?;

        debug!("Advertising and browsing for {}", SERVICE_TYPE);
        Ok(())
    }

    /// Stop all components; idempotent
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping nearby node {}", self.identity.id);

        if let Some(eviction) = self.eviction.lock().take() {
            eviction.abort();
        }
        let _ = self.coordinator.send(CoordinatorCommand::Shutdown);
        let _ = self.exchange.send(ExchangeCommand::Shutdown);
        let _ = self.ranging.send(RangingCommand::Shutdown);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!("Component task failed: {}", e);
            }
        }
        info!("Nearby node {} stopped", self.identity.id);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NearbyConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    /// Current device list, ordered by peer id
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.registry.list_active()
    }

    pub fn device(&self, peer: &PeerId) -> Option<DeviceRecord> {
        self.registry.get(peer)
    }

    /// Stream of record updates and evictions
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Ask the coordinator to invite `peer` now
    pub fn invite(&self, peer: &PeerId) -> crate::Result<()> {
        self.coordinator
            .send(CoordinatorCommand::Invite(peer.clone()))
            .map_err(|_| NearbyError::ChannelClosed("coordinator"))
    }

    /// Pause ranging while the host is in the background
    pub fn suspend(&self) -> crate::Result<()> {
        self.ranging
            .send(RangingCommand::Suspend)
            .map_err(|_| NearbyError::ChannelClosed("ranging"))
    }

    pub fn resume(&self) -> crate::Result<()> {
        self.ranging
            .send(RangingCommand::Resume)
            .map_err(|_| NearbyError::ChannelClosed("ranging"))
    }

    pub async fn connection_states(&self) -> crate::Result<Vec<(PeerId, ConnectionState)>> {
        let (reply, response) = oneshot::channel();
        self.coordinator
            .send(CoordinatorCommand::Snapshot(reply))
            .map_err(|_| NearbyError::ChannelClosed("coordinator"))?;
        response
            .await
            .map_err(|_| NearbyError::ChannelClosed("coordinator"))
    }

    pub async fn ranging_sessions(&self) -> crate::Result<Vec<SessionSummary>> {
        let (reply, response) = oneshot::channel();
        self.ranging
            .send(RangingCommand::Snapshot(reply))
            .map_err(|_| NearbyError::ChannelClosed("ranging"))?;
        response
            .await
            .map_err(|_| NearbyError::ChannelClosed("ranging"))
    }

    /// Node status
    pub async fn get_status(&self) -> Result<Value> {
        let sessions = if self.is_running() {
            self.ranging_sessions().await?.len()
        } else {
            0
        };

        Ok(serde_json::json!({
            "is_running": self.is_running(),
            "peer_id": self.identity.id,
            "tie_break_key": self.identity.tie_break_key,
            "service_type": SERVICE_TYPE,
            "ranging_supported": self.ranging_supported,
            "ranging_sessions": sessions,
            "started_at": self.started_at,
            "peer_statistics": self.registry.get_statistics(),
            "config": self.config.to_json(),
        }))
    }

    /// Device list as JSON
    pub fn get_peer_list(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.devices())?)
    }
}

/// Periodically drop peers that have gone quiet
async fn run_eviction(registry: Arc<DeviceRegistry>, settings: RegistrySettings) {
    let mut interval = time::interval(settings.eviction_interval());
    // The first tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let evicted = registry.evict_stale(settings.inactivity_timeout());
        if !evicted.is_empty() {
            debug!("Evicted {} stale peers", evicted.len());
        }
    }
}
