//! Nearby Radar demo
//!
//! Runs two nodes over the in-process loopback transport with simulated
//! ranging engines, feeds a short noisy sample stream through and prints
//! each node's device list.
//!
//! A JSON object in `NEARBY_CONFIG` is merged over the default configuration.

use anyhow::{Context, Result};
use log::info;
use std::time::Duration;

use nearby_radar::{
    Collaborators, LoopbackHub, NearbyConfig, NearbyNode, PeerId, PeerIdentity, RawSample,
    SimulatedEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("=== Nearby Radar: discovery and ranging demo ===");

    let mut config = NearbyConfig::new();
    if let Ok(patch) = std::env::var("NEARBY_CONFIG") {
        let patch = serde_json::from_str(&patch).context("NEARBY_CONFIG is not valid JSON")?;
        config.update_from_json(patch)?;
    }

    let hub = LoopbackHub::new();
    let (alice, alice_engine) = start_node(&hub, &config, "alice").await?;
    let (bob, bob_engine) = start_node(&hub, &config, "bob").await?;

    // Connection, token exchange and first configuration
    tokio::time::sleep(Duration::from_secs(2)).await;

    let walk = [2.0, 2.1, 1.9, 6.5, 2.0, 1.8];
    for (step, distance) in walk.iter().enumerate() {
        let angle = (step as f64 * 4.0).to_radians();
        let sample = RawSample {
            distance: Some(*distance),
            direction: Some([angle.sin(), 0.0, -angle.cos()]),
        };
        for (node, engine) in [(&alice, &alice_engine), (&bob, &bob_engine)] {
            for session in node.ranging_sessions().await? {
                if let Some(handle) = session.handle {
                    engine.emit_samples(handle, vec![sample]);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    for node in [&alice, &bob] {
        println!("== {} ==", node.identity().id);
        println!("{}", serde_json::to_string_pretty(&node.get_peer_list()?)?);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&alice.get_status().await?)?
    );

    alice.stop().await;
    bob.stop().await;
    Ok(())
}

async fn start_node(
    hub: &LoopbackHub,
    config: &NearbyConfig,
    name: &str,
) -> Result<(NearbyNode, std::sync::Arc<SimulatedEngine>)> {
    let (transport, transport_events) = hub.attach(PeerId::from(name));
    let (engine, engine_events) = SimulatedEngine::new(name);
    engine.set_auto_sample(Some(RawSample {
        distance: Some(2.0),
        direction: Some([0.0, 0.0, -1.0]),
    }));

    let collaborators = Collaborators {
        transport,
        transport_events,
        engine: engine.clone(),
        engine_events,
    };
    let node = NearbyNode::start(config.clone(), PeerIdentity::generate(name), collaborators)
        .await
        .with_context(|| format!("Failed to start node {}", name))?;

    Ok((node, engine))
}
