//! Token Exchange
//!
//! Sends our ranging token to each connected peer exactly once per session
//! and hands received tokens to the ranging session manager. Token polling
//! and send retries are timer driven and bounded.

use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::RangingSettings;
use crate::identity::PeerId;
use crate::mesh::protocol::Frame;
use crate::mesh::transport::Transport;
use crate::ranging::{RangingCommand, TokenReply};
use crate::registry::{DeviceRegistry, RecordUpdate};

#[derive(Debug)]
pub enum ExchangeCommand {
    /// Pairwise channel became usable
    ChannelReady(PeerId),
    ChannelClosed(PeerId),
    Data { peer: PeerId, bytes: Vec<u8> },
    /// The peer's ranging session ended; a fresh token cycle is required
    SessionReset(PeerId),
    /// A new ranging session exists for the peer
    SessionRecreated(PeerId),
    Retry { peer: PeerId, epoch: u64 },
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
enum RetryKind {
    TokenNotReady,
    SendFailed,
}

#[derive(Default)]
struct PendingSend {
    token_attempts: u32,
    send_attempts: u32,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

impl PendingSend {
    fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub struct TokenExchange {
    settings: RangingSettings,
    transport: Arc<dyn Transport>,
    ranging: mpsc::UnboundedSender<RangingCommand>,
    registry: Arc<DeviceRegistry>,
    commands: mpsc::UnboundedSender<ExchangeCommand>,
    connected: HashSet<PeerId>,
    sent: HashSet<PeerId>,
    pending: HashMap<PeerId, PendingSend>,
    next_epoch: u64,
}

impl TokenExchange {
    pub fn new(
        settings: RangingSettings,
        transport: Arc<dyn Transport>,
        ranging: mpsc::UnboundedSender<RangingCommand>,
        registry: Arc<DeviceRegistry>,
        commands: mpsc::UnboundedSender<ExchangeCommand>,
    ) -> Self {
        Self {
            settings,
            transport,
            ranging,
            registry,
            commands,
            connected: HashSet::new(),
            sent: HashSet::new(),
            pending: HashMap::new(),
            next_epoch: 0,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ExchangeCommand>) {
        info!("Token exchange started");

        while let Some(command) = commands.recv().await {
            match command {
                ExchangeCommand::ChannelReady(peer) => {
                    self.connected.insert(peer.clone());
                    self.clear_pending(&peer);
                    self.send_local_token(&peer).await;
                }
                ExchangeCommand::ChannelClosed(peer) => {
                    self.connected.remove(&peer);
                    self.clear_pending(&peer);
                }
                ExchangeCommand::Data { peer, bytes } => self.on_token_received(&peer, &bytes),
                ExchangeCommand::SessionReset(peer) => {
                    self.clear_pending(&peer);
                    if self.sent.remove(&peer) {
                        debug!("Token for {} must be sent again", peer);
                    }
                    self.registry.update(&peer, RecordUpdate::TokenSent(false));
                }
                ExchangeCommand::SessionRecreated(peer) => {
                    self.clear_pending(&peer);
                    self.send_local_token(&peer).await;
                }
                ExchangeCommand::Retry { peer, epoch } => {
                    let current = self.pending.get(&peer).map(|pending| pending.epoch);
                    if current == Some(epoch) {
                        self.send_local_token(&peer).await;
                    }
                }
                ExchangeCommand::Shutdown => break,
            }
        }

        for pending in self.pending.values_mut() {
            pending.cancel();
        }
        info!("Token exchange stopped");
    }

    /// Send our token to `peer` unless it already has it for the current session
    async fn send_local_token(&mut self, peer: &PeerId) {
        if self.sent.contains(peer) || !self.connected.contains(peer) {
            self.clear_pending(peer);
            return;
        }

        let (reply, response) = oneshot::channel();
        let request = RangingCommand::LocalToken {
            peer: peer.clone(),
            reply,
        };
        if self.ranging.send(request).is_err() {
            warn!("Ranging manager is gone, cannot fetch token for {}", peer);
            return;
        }

        let token = match response.await {
            Ok(TokenReply::Ready(token)) => token,
            Ok(TokenReply::NotReady) => {
                debug!("Local token for {} not ready yet", peer);
                self.schedule_retry(peer, RetryKind::TokenNotReady);
                return;
            }
            Ok(TokenReply::Unavailable) | Err(_) => {
                debug!("No ranging session for {}, nothing to send", peer);
                self.clear_pending(peer);
                return;
            }
        };

        let bytes = match Frame::discovery_token(&token).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode token for {}: {}", peer, e);
                self.clear_pending(peer);
                return;
            }
        };

        match self.transport.send(peer, bytes).await {
            Ok(()) => {
                info!("Sent ranging token {} to {}", token.fingerprint(), peer);
                self.sent.insert(peer.clone());
                self.clear_pending(peer);
                self.registry.update(peer, RecordUpdate::TokenSent(true));
            }
            Err(e) => {
                warn!("Failed to send token to {}: {}", peer, e);
                self.schedule_retry(peer, RetryKind::SendFailed);
            }
        }
    }

    fn on_token_received(&mut self, peer: &PeerId, bytes: &[u8]) {
        // Any frame from a known peer counts as activity, decodable or not
        self.registry.update(peer, RecordUpdate::Touch);

        let token = match Frame::decode(bytes).map(|frame| frame.token()) {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("Ignoring non-token frame from {}", peer);
                return;
            }
            Err(e) => {
                warn!("Dropping frame from {}: {}", peer, e);
                return;
            }
        };

        info!("Received ranging token {} from {}", token.fingerprint(), peer);
        self.registry.upsert(peer, RecordUpdate::TokenReceived(true));

        let command = RangingCommand::PeerToken {
            peer: peer.clone(),
            token,
        };
        if self.ranging.send(command).is_err() {
            warn!("Ranging manager is gone, dropping token from {}", peer);
        }
    }

    fn schedule_retry(&mut self, peer: &PeerId, kind: RetryKind) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let pending = self.pending.entry(peer.clone()).or_default();

        let exhausted = match kind {
            RetryKind::TokenNotReady => {
                pending.token_attempts += 1;
                pending.token_attempts > self.settings.max_token_retries
            }
            RetryKind::SendFailed => {
                pending.send_attempts += 1;
                pending.send_attempts >= self.settings.max_send_attempts
            }
        };
        if exhausted {
            warn!("Giving up on sending token to {} ({:?})", peer, kind);
            self.clear_pending(peer);
            return;
        }

        pending.cancel();
        pending.epoch = epoch;

        let commands = self.commands.clone();
        let delay = self.settings.token_retry_delay();
        let retry_peer = peer.clone();
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(ExchangeCommand::Retry {
                peer: retry_peer,
                epoch,
            });
        }));
    }

    fn clear_pending(&mut self, peer: &PeerId) {
        if let Some(mut pending) = self.pending.remove(peer) {
            pending.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NearbyError, Result};
    use crate::identity::PeerIdentity;
    use crate::mesh::transport::DiscoveryAttributes;
    use crate::ranging::RangingToken;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn start_advertise(&self, _: &PeerIdentity, _: DiscoveryAttributes) -> Result<()> {
            Ok(())
        }

        async fn start_browse(&self) -> Result<()> {
            Ok(())
        }

        async fn invite(&self, _: &PeerId, _: Duration) -> Result<()> {
            Ok(())
        }

        async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<()> {
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(NearbyError::Transport("link busy".to_string()));
            }
            self.sent.lock().push((peer.clone(), bytes));
            Ok(())
        }

        async fn disconnect(&self, _: &PeerId) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        transport: Arc<RecordingTransport>,
        registry: Arc<DeviceRegistry>,
        exchange: mpsc::UnboundedSender<ExchangeCommand>,
        ranging: mpsc::UnboundedReceiver<RangingCommand>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(RecordingTransport::default());
        let registry = Arc::new(DeviceRegistry::new(16));
        let (ranging_tx, ranging) = mpsc::unbounded_channel();
        let (exchange, rx) = mpsc::unbounded_channel();

        let actor = TokenExchange::new(
            RangingSettings::default(),
            transport.clone(),
            ranging_tx,
            registry.clone(),
            exchange.clone(),
        );
        tokio::spawn(actor.run(rx));

        Harness {
            transport,
            registry,
            exchange,
            ranging,
        }
    }

    /// Answer token requests from the exchange with the given replies, in order
    async fn answer(ranging: &mut mpsc::UnboundedReceiver<RangingCommand>, reply: TokenReply) {
        match ranging.recv().await {
            Some(RangingCommand::LocalToken { reply: tx, .. }) => {
                let _ = tx.send(reply);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    fn token() -> RangingToken {
        RangingToken::new(b"local-token".to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_once_per_session() {
        let mut h = harness();
        let bob = PeerId::from("bob");
        h.registry.upsert(&bob, RecordUpdate::Touch);

        h.exchange.send(ExchangeCommand::ChannelReady(bob.clone())).unwrap();
        answer(&mut h.ranging, TokenReply::Ready(token())).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.sent.lock().len(), 1);
        assert!(h.registry.get(&bob).unwrap().token_sent);

        // Reconnect churn before the session ends does not resend
        h.exchange.send(ExchangeCommand::ChannelClosed(bob.clone())).unwrap();
        h.exchange.send(ExchangeCommand::ChannelReady(bob.clone())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.sent.lock().len(), 1);

        // A reset session allows exactly one more send
        h.exchange.send(ExchangeCommand::SessionReset(bob.clone())).unwrap();
        h.exchange.send(ExchangeCommand::SessionRecreated(bob.clone())).unwrap();
        answer(&mut h.ranging, TokenReply::Ready(token())).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.transport.sent.lock().len(), 2);

        let sent = h.transport.sent.lock();
        let frame = Frame::decode(&sent[0].1).unwrap();
        assert_eq!(frame.token(), Some(token()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_token_ready() {
        let mut h = harness();
        let bob = PeerId::from("bob");

        h.exchange.send(ExchangeCommand::ChannelReady(bob.clone())).unwrap();
        answer(&mut h.ranging, TokenReply::NotReady).await;
        answer(&mut h.ranging, TokenReply::NotReady).await;
        answer(&mut h.ranging, TokenReply::Ready(token())).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.transport.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_are_bounded() {
        let mut h = harness();
        let bob = PeerId::from("bob");
        *h.transport.failures_left.lock() = 10;

        h.exchange.send(ExchangeCommand::ChannelReady(bob.clone())).unwrap();
        for _ in 0..3 {
            answer(&mut h.ranging, TokenReply::Ready(token())).await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(h.transport.sent.lock().is_empty());
        assert_eq!(*h.transport.failures_left.lock(), 7);
        assert!(h.ranging.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_token_goes_to_ranging() {
        let mut h = harness();
        let bob = PeerId::from("bob");
        let bytes = Frame::discovery_token(&token()).encode().unwrap();

        h.exchange
            .send(ExchangeCommand::Data {
                peer: bob.clone(),
                bytes,
            })
            .unwrap();

        match h.ranging.recv().await {
            Some(RangingCommand::PeerToken { peer, token: received }) => {
                assert_eq!(peer, bob);
                assert_eq!(received, token());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.registry.get(&bob).unwrap().token_received);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_dropped() {
        let mut h = harness();
        let bob = PeerId::from("bob");

        h.exchange
            .send(ExchangeCommand::Data {
                peer: bob.clone(),
                bytes: vec![0xde, 0xad],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(h.ranging.try_recv().is_err());
        assert!(h.registry.get(&bob).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_keeps_peer_fresh() {
        let h = harness();
        let bob = PeerId::from("bob");
        h.registry.upsert(&bob, RecordUpdate::Touch);

        tokio::time::sleep(Duration::from_secs(9)).await;
        h.exchange
            .send(ExchangeCommand::Data {
                peer: bob.clone(),
                bytes: vec![0xde, 0xad],
            })
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(h.registry.evict_stale(Duration::from_secs(10)).is_empty());
        assert!(h.registry.get(&bob).is_some());
    }
}
