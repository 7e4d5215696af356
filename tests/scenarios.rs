//! End-to-end scenarios: two nodes on a loopback hub with simulated engines

use std::sync::Arc;
use std::time::Duration;

use nearby_radar::{
    Collaborators, ConnectionState, LoopbackHub, NearbyConfig, NearbyNode, PeerId, PeerIdentity,
    RawSample, SessionState, SimulatedEngine, TieBreaker,
};

struct TestNode {
    node: NearbyNode,
    engine: Arc<SimulatedEngine>,
}

fn config() -> NearbyConfig {
    let mut config = NearbyConfig::default();
    config.connection.retry_jitter_ms = 0;
    config
}

/// Every side believes it should invite, as with stale or asymmetric discovery
struct EveryoneInvites;

impl TieBreaker for EveryoneInvites {
    fn local_invites(&self, _: &str, _: &str) -> bool {
        true
    }
}

async fn start(hub: &LoopbackHub, id: &str, key: &str, config: NearbyConfig, auto: bool) -> TestNode {
    start_with(hub, id, key, config, auto, None).await
}

async fn start_with(
    hub: &LoopbackHub,
    id: &str,
    key: &str,
    config: NearbyConfig,
    auto: bool,
    tie_breaker: Option<Arc<dyn TieBreaker>>,
) -> TestNode {
    let (transport, transport_events) = hub.attach(PeerId::from(id));
    let (engine, engine_events) = SimulatedEngine::new(id);
    if auto {
        engine.set_auto_sample(Some(RawSample {
            distance: Some(2.0),
            direction: Some([0.0, 0.0, -1.0]),
        }));
    }

    let collaborators = Collaborators {
        transport,
        transport_events,
        engine: engine.clone(),
        engine_events,
    };
    let identity = PeerIdentity::new(id, key);
    let node = match tie_breaker {
        Some(tie_breaker) => {
            NearbyNode::start_with_tie_breaker(config, identity, collaborators, tie_breaker).await
        }
        None => NearbyNode::start(config, identity, collaborators).await,
    }
    .unwrap();

    TestNode { node, engine }
}

async fn pair(hub: &LoopbackHub) -> (TestNode, TestNode) {
    let alice = start(hub, "alice", "a1", config(), true).await;
    let bob = start(hub, "bob", "b2", config(), true).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    (alice, bob)
}

async fn session_state(node: &NearbyNode) -> Option<SessionState> {
    node.ranging_sessions()
        .await
        .unwrap()
        .first()
        .map(|session| session.state)
}

#[tokio::test(start_paused = true)]
async fn simultaneous_discovery_yields_one_connection_and_active_ranging() {
    let hub = LoopbackHub::new();
    let (alice, bob) = pair(&hub).await;
    let a = PeerId::from("alice");
    let b = PeerId::from("bob");

    // Only the lower key invited
    assert_eq!(hub.invitations(), vec![(a.clone(), b.clone())]);
    assert!(hub.is_connected(&a, &b));
    assert_eq!(hub.channel_count(), 1);

    assert_eq!(hub.frames_sent(&a, &b), 1);
    assert_eq!(hub.frames_sent(&b, &a), 1);

    for (node, peer) in [(&alice.node, &b), (&bob.node, &a)] {
        let record = node.device(peer).unwrap();
        assert_eq!(record.connection_state, ConnectionState::Connected);
        assert!(record.token_sent);
        assert!(record.token_received);
        assert_eq!(record.ranging_state, Some(SessionState::Active));
        assert_eq!(record.estimate.unwrap().distance, Some(2.0));
        assert_eq!(session_state(node).await, Some(SessionState::Active));
    }
    assert_eq!(alice.engine.configure_calls().len(), 1);
    assert_eq!(bob.engine.configure_calls().len(), 1);

    alice.node.stop().await;
    bob.node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn crossed_invitations_collapse_into_one_channel() {
    let hub = LoopbackHub::new();
    let eager: Arc<dyn TieBreaker> = Arc::new(EveryoneInvites);
    let alice = start_with(&hub, "alice", "a1", config(), true, Some(eager.clone())).await;
    let bob = start_with(&hub, "bob", "b2", config(), true, Some(eager)).await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let a = PeerId::from("alice");
    let b = PeerId::from("bob");

    // Both sides invited and both accepted the other's invitation
    assert_eq!(hub.invitations().len(), 2);
    assert_eq!(hub.channel_count(), 1);
    assert!(hub.is_connected(&a, &b));

    assert_eq!(hub.frames_sent(&a, &b), 1);
    assert_eq!(hub.frames_sent(&b, &a), 1);
    for (node, peer) in [(&alice.node, &b), (&bob.node, &a)] {
        let record = node.device(peer).unwrap();
        assert_eq!(record.connection_state, ConnectionState::Connected);
        assert!(record.token_sent);
        assert!(record.token_received);
        assert_eq!(session_state(node).await, Some(SessionState::Active));
    }
    assert_eq!(alice.engine.configure_calls().len(), 1);
    assert_eq!(bob.engine.configure_calls().len(), 1);

    alice.node.stop().await;
    bob.node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn invalidated_session_is_recreated_and_token_resent() {
    let hub = LoopbackHub::new();
    let (alice, bob) = pair(&hub).await;
    let a = PeerId::from("alice");
    let b = PeerId::from("bob");

    let old = alice.node.ranging_sessions().await.unwrap()[0].handle.unwrap();
    alice.engine.emit_invalidated(old, "engine fault");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(session_state(&alice.node).await, Some(SessionState::Invalidated));
    let record = alice.node.device(&b).unwrap();
    assert!(!record.token_sent);
    assert!(record.estimate.is_none());

    // Recreated after the backoff, fresh token goes out once
    tokio::time::sleep(Duration::from_secs(3)).await;
    let sessions = alice.node.ranging_sessions().await.unwrap();
    assert_eq!(sessions[0].state, SessionState::Active);
    assert_ne!(sessions[0].handle, Some(old));
    assert!(alice.node.device(&b).unwrap().token_sent);

    assert_eq!(hub.frames_sent(&a, &b), 2);
    assert_eq!(hub.frames_sent(&b, &a), 1);
    assert_eq!(alice.engine.configure_calls().len(), 2);
    assert_eq!(bob.engine.configure_calls().len(), 2);
    assert_eq!(session_state(&bob.node).await, Some(SessionState::Active));
    assert!(hub.is_connected(&a, &b));

    alice.node.stop().await;
    bob.node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_allows_exactly_one_more_token() {
    let hub = LoopbackHub::new();
    let (alice, bob) = pair(&hub).await;
    let a = PeerId::from("alice");
    let b = PeerId::from("bob");

    hub.sever(&a, &b);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        alice.node.device(&b).unwrap().connection_state,
        ConnectionState::Disconnected
    );

    // Sessions end after the grace period, the inviter reconnects after its cooldown
    tokio::time::sleep(Duration::from_secs(8)).await;

    assert!(hub.is_connected(&a, &b));
    assert_eq!(hub.invitations().len(), 2);
    assert_eq!(hub.frames_sent(&a, &b), 2);
    assert_eq!(hub.frames_sent(&b, &a), 2);
    assert_eq!(session_state(&alice.node).await, Some(SessionState::Active));
    assert_eq!(session_state(&bob.node).await, Some(SessionState::Active));
    assert_eq!(
        bob.node.device(&a).unwrap().connection_state,
        ConnectionState::Connected
    );

    alice.node.stop().await;
    bob.node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn inactive_peer_is_evicted_with_session_and_channel() {
    let hub = LoopbackHub::new();
    let mut quick = config();
    quick.registry.inactivity_timeout_secs = 10;
    quick.registry.eviction_interval_secs = 1;

    let alice = start(&hub, "alice", "a1", quick, false).await;
    let bob = start(&hub, "bob", "b2", config(), false).await;
    let a = PeerId::from("alice");
    let b = PeerId::from("bob");

    let mut updates = alice.node.subscribe();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(hub.is_connected(&a, &b));
    assert_eq!(alice.engine.live_handles().len(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(alice.node.device(&b).is_none());
    assert!(!hub.is_connected(&a, &b));
    assert!(alice.engine.live_handles().is_empty());
    assert!(alice.node.ranging_sessions().await.unwrap().is_empty());
    assert!(alice.node.connection_states().await.unwrap().is_empty());

    let mut evicted = false;
    while let Ok(event) = updates.try_recv() {
        if matches!(event, nearby_radar::RegistryEvent::Evicted(ref p) if *p == b) {
            evicted = true;
        }
    }
    assert!(evicted);

    alice.node.stop().await;
    bob.node.stop().await;
}

#[tokio::test(start_paused = true)]
async fn suspend_and_resume_reconfigure_sessions() {
    let hub = LoopbackHub::new();
    let (alice, bob) = pair(&hub).await;

    alice.node.suspend().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session_state(&alice.node).await, Some(SessionState::Suspended));

    alice.node.resume().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session_state(&alice.node).await, Some(SessionState::Active));
    assert_eq!(alice.engine.configure_calls().len(), 2);

    alice.node.stop().await;
    bob.node.stop().await;
}
