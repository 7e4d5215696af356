//! In-process transport
//!
//! A [`LoopbackHub`] stands in for the radio: every attached endpoint can
//! advertise, browse, invite and exchange bytes with the others. At most one
//! channel exists per unordered pair, so crossing invitations that are both
//! accepted still produce a single channel.

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::{NearbyError, Result};
use crate::identity::{PeerId, PeerIdentity};
use crate::mesh::transport::{ChannelState, DiscoveryAttributes, Transport, TransportEvent};

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    advertisement: Option<DiscoveryAttributes>,
    browsing: bool,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerId, Endpoint>,
    channels: HashSet<(PeerId, PeerId)>,
    invitations: Vec<(PeerId, PeerId)>,
    frames: HashMap<(PeerId, PeerId), usize>,
}

impl HubState {
    fn notify(&self, peer: &PeerId, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(peer) {
            if endpoint.events.send(event).is_err() {
                debug!("Loopback endpoint {} is gone", peer);
            }
        }
    }

    fn notify_channel(&self, a: &PeerId, b: &PeerId, state: ChannelState) {
        self.notify(
            a,
            TransportEvent::ChannelStateChanged {
                peer: b.clone(),
                state,
            },
        );
        self.notify(
            b,
            TransportEvent::ChannelStateChanged {
                peer: a.clone(),
                state,
            },
        );
    }
}

fn pair(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the hub as `peer`
    pub fn attach(
        &self,
        peer: PeerId,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        self.state.lock().endpoints.insert(
            peer.clone(),
            Endpoint {
                events,
                advertisement: None,
                browsing: false,
            },
        );

        let transport = LoopbackTransport {
            local: peer,
            hub: self.clone(),
        };
        (Arc::new(transport), rx)
    }

    /// The peer leaves radio range: its channels close and browsers lose it
    pub fn detach(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        let closed: Vec<_> = state
            .channels
            .iter()
            .filter(|(a, b)| a == peer || b == peer)
            .cloned()
            .collect();
        for (a, b) in closed {
            state.channels.remove(&(a.clone(), b.clone()));
            state.notify_channel(&a, &b, ChannelState::NotConnected);
        }

        let was_advertising = state
            .endpoints
            .remove(peer)
            .map(|endpoint| endpoint.advertisement.is_some())
            .unwrap_or(false);
        if was_advertising {
            let browsers: Vec<_> = state
                .endpoints
                .iter()
                .filter(|(_, endpoint)| endpoint.browsing)
                .map(|(id, _)| id.clone())
                .collect();
            for browser in browsers {
                state.notify(&browser, TransportEvent::PeerLost { peer: peer.clone() });
            }
        }
    }

    /// Drop the channel between two peers as if the link broke
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        if state.channels.remove(&pair(a, b)) {
            state.notify_channel(a, b, ChannelState::NotConnected);
        }
    }

    pub fn is_connected(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.lock().channels.contains(&pair(a, b))
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Invitations sent as (from, to), in order
    pub fn invitations(&self) -> Vec<(PeerId, PeerId)> {
        self.state.lock().invitations.clone()
    }

    /// Frames delivered from `from` to `to`
    pub fn frames_sent(&self, from: &PeerId, to: &PeerId) -> usize {
        self.state
            .lock()
            .frames
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }

    fn complete_invitation(&self, inviter: &PeerId, invitee: &PeerId, accepted: bool) {
        let mut state = self.state.lock();
        let both_present =
            state.endpoints.contains_key(inviter) && state.endpoints.contains_key(invitee);
        let key = pair(inviter, invitee);

        if accepted && both_present {
            if state.channels.insert(key) {
                state.notify_channel(inviter, invitee, ChannelState::Connecting);
                state.notify_channel(inviter, invitee, ChannelState::Connected);
            }
        } else if !state.channels.contains(&key) {
            state.notify(
                inviter,
                TransportEvent::ChannelStateChanged {
                    peer: invitee.clone(),
                    state: ChannelState::NotConnected,
                },
            );
        }
    }
}

/// One endpoint's view of the hub
pub struct LoopbackTransport {
    local: PeerId,
    hub: LoopbackHub,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn start_advertise(
        &self,
        _identity: &PeerIdentity,
        attributes: DiscoveryAttributes,
    ) -> Result<()> {
        let mut state = self.hub.state.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.local)
            .ok_or_else(|| NearbyError::Transport("endpoint detached".to_string()))?;
        endpoint.advertisement = Some(attributes.clone());

        let browsers: Vec<_> = state
            .endpoints
            .iter()
            .filter(|(id, endpoint)| **id != self.local && endpoint.browsing)
            .map(|(id, _)| id.clone())
            .collect();
        for browser in browsers {
            state.notify(
                &browser,
                TransportEvent::PeerDiscovered {
                    peer: self.local.clone(),
                    attributes: attributes.clone(),
                },
            );
        }
        Ok(())
    }

    async fn start_browse(&self) -> Result<()> {
        let mut state = self.hub.state.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.local)
            .ok_or_else(|| NearbyError::Transport("endpoint detached".to_string()))?;
        endpoint.browsing = true;

        let advertised: Vec<_> = state
            .endpoints
            .iter()
            .filter(|(id, _)| **id != self.local)
            .filter_map(|(id, endpoint)| {
                endpoint
                    .advertisement
                    .clone()
                    .map(|attributes| (id.clone(), attributes))
            })
            .collect();
        for (peer, attributes) in advertised {
            state.notify(&self.local, TransportEvent::PeerDiscovered { peer, attributes });
        }
        Ok(())
    }

    async fn invite(&self, peer: &PeerId, timeout: Duration) -> Result<()> {
        let (respond, response) = oneshot::channel();
        {
            let mut state = self.hub.state.lock();
            if !state.endpoints.contains_key(peer) {
                return Err(NearbyError::Transport(format!("unknown peer {}", peer)));
            }
            let attributes = state
                .endpoints
                .get(&self.local)
                .and_then(|endpoint| endpoint.advertisement.clone())
                .unwrap_or_default();

            state.invitations.push((self.local.clone(), peer.clone()));
            state.notify(
                peer,
                TransportEvent::InvitationReceived {
                    peer: self.local.clone(),
                    attributes,
                    respond,
                },
            );
        }

        let hub = self.hub.clone();
        let inviter = self.local.clone();
        let invitee = peer.clone();
        tokio::spawn(async move {
            let accepted = matches!(tokio::time::timeout(timeout, response).await, Ok(Ok(true)));
            hub.complete_invitation(&inviter, &invitee, accepted);
        });

        Ok(())
    }

    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<()> {
        let mut state = self.hub.state.lock();
        if !state.channels.contains(&pair(&self.local, peer)) {
            return Err(NearbyError::NotConnected(peer.clone()));
        }

        *state
            .frames
            .entry((self.local.clone(), peer.clone()))
            .or_insert(0) += 1;
        state.notify(
            peer,
            TransportEvent::DataReceived {
                peer: self.local.clone(),
                bytes,
            },
        );
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        self.hub.sever(&self.local, peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> PeerIdentity {
        PeerIdentity::new(id, id)
    }

    fn attrs(key: &str) -> DiscoveryAttributes {
        let mut attributes = DiscoveryAttributes::new();
        attributes.insert("tb".to_string(), key.to_string());
        attributes
    }

    #[tokio::test]
    async fn test_discovery_works_in_both_orders() {
        let hub = LoopbackHub::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let (ta, mut ea) = hub.attach(a.clone());
        let (tb, mut eb) = hub.attach(b.clone());

        ta.start_browse().await.unwrap();
        tb.start_advertise(&identity("b"), attrs("b2")).await.unwrap();
        tb.start_browse().await.unwrap();
        ta.start_advertise(&identity("a"), attrs("a1")).await.unwrap();

        match ea.recv().await {
            Some(TransportEvent::PeerDiscovered { peer, attributes }) => {
                assert_eq!(peer, b);
                assert_eq!(attributes.get("tb").map(String::as_str), Some("b2"));
            }
            other => panic!("unexpected {:?}", other),
        }
        match eb.recv().await {
            Some(TransportEvent::PeerDiscovered { peer, .. }) => assert_eq!(peer, a),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_accepted_invitation_opens_one_channel() {
        let hub = LoopbackHub::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let (ta, mut ea) = hub.attach(a.clone());
        let (_tb, mut eb) = hub.attach(b.clone());

        ta.invite(&b, Duration::from_secs(5)).await.unwrap();
        match eb.recv().await {
            Some(TransportEvent::InvitationReceived { peer, respond, .. }) => {
                assert_eq!(peer, a);
                respond.send(true).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut states = Vec::new();
        while states.len() < 2 {
            if let Some(TransportEvent::ChannelStateChanged { state, .. }) = ea.recv().await {
                states.push(state);
            }
        }
        assert_eq!(states, vec![ChannelState::Connecting, ChannelState::Connected]);
        assert!(hub.is_connected(&a, &b));
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.invitations(), vec![(a.clone(), b.clone())]);

        ta.send(&b, vec![1, 2, 3]).await.unwrap();
        loop {
            match eb.recv().await {
                Some(TransportEvent::DataReceived { peer, bytes }) => {
                    assert_eq!(peer, a);
                    assert_eq!(bytes, vec![1, 2, 3]);
                    break;
                }
                Some(_) => continue,
                None => panic!("stream closed"),
            }
        }
        assert_eq!(hub.frames_sent(&a, &b), 1);
    }

    #[tokio::test]
    async fn test_declined_invitation_reports_not_connected() {
        let hub = LoopbackHub::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let (ta, mut ea) = hub.attach(a.clone());
        let (_tb, mut eb) = hub.attach(b.clone());

        ta.invite(&b, Duration::from_secs(5)).await.unwrap();
        if let Some(TransportEvent::InvitationReceived { respond, .. }) = eb.recv().await {
            respond.send(false).unwrap();
        }

        match ea.recv().await {
            Some(TransportEvent::ChannelStateChanged { peer, state }) => {
                assert_eq!(peer, b);
                assert_eq!(state, ChannelState::NotConnected);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!hub.is_connected(&a, &b));
        assert!(ta.send(&b, vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn test_detach_closes_channels_and_reports_loss() {
        let hub = LoopbackHub::new();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        let (ta, mut ea) = hub.attach(a.clone());
        let (tb, mut eb) = hub.attach(b.clone());

        ta.start_browse().await.unwrap();
        tb.start_advertise(&identity("b"), attrs("b2")).await.unwrap();
        ta.invite(&b, Duration::from_secs(5)).await.unwrap();
        if let Some(TransportEvent::InvitationReceived { respond, .. }) = eb.recv().await {
            respond.send(true).unwrap();
        }

        let mut connected = false;
        while !connected {
            if let Some(TransportEvent::ChannelStateChanged {
                state: ChannelState::Connected,
                ..
            }) = ea.recv().await
            {
                connected = true;
            }
        }

        hub.detach(&b);
        assert!(!hub.is_connected(&a, &b));

        let mut saw_closed = false;
        let mut saw_lost = false;
        while !(saw_closed && saw_lost) {
            match ea.recv().await {
                Some(TransportEvent::ChannelStateChanged {
                    state: ChannelState::NotConnected,
                    ..
                }) => saw_closed = true,
                Some(TransportEvent::PeerLost { peer }) => {
                    assert_eq!(peer, b);
                    saw_lost = true;
                }
                Some(_) => {}
                None => panic!("stream closed"),
            }
        }
    }
}
