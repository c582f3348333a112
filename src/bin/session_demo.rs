// src/bin/session_demo.rs
//! Three peers on one simulated room converging on a shared canvas:
//! two browser tabs and the voice agent. The room echoes every packet back
//! to its sender and one tab receives everything twice.
//!
//! Run with:
//!   RUST_LOG=canvas_sync=debug cargo run --bin session_demo

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::json;

use canvas_sync::registry::origin;
use canvas_sync::transport::simulated::SimBroadcastNetwork;
use canvas_sync::{AgentIntent, NewEntity, State, SyncConfig, SyncSession, UpdateMeta};

fn state(value: serde_json::Value) -> State {
    value.as_object().cloned().unwrap_or_default()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn print_canvas(label: &str, session: &SyncSession) -> Result<()> {
    println!("  {}:", label);
    for record in session.registry().snapshot()? {
        println!(
            "    {} [{}] v{} {} (origin {})",
            record.id,
            record.kind,
            record.version,
            serde_json::Value::Object(record.state),
            record.origin
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let base = SyncConfig::from_env()?;
    let room = SimBroadcastNetwork::new();

    let tab_a_link = Arc::new(room.join());
    let tab_b_link = Arc::new(room.join());
    tab_b_link.set_duplicate_delivery(true);
    let agent_link = Arc::new(room.join());

    let tab_a = SyncSession::new(
        SyncConfig { origin: origin::LOCAL.into(), ..base.clone() },
        tab_a_link,
    );
    let tab_b = SyncSession::new(
        SyncConfig { origin: origin::LOCAL.into(), ..base.clone() },
        tab_b_link,
    );
    let agent = SyncSession::new(
        SyncConfig { origin: origin::REMOTE_AGENT.into(), ..base },
        agent_link,
    );

    for session in [&tab_a, &tab_b, &agent] {
        session.start();
    }

    println!("Tab A places a counter and bumps it twice");
    tab_a.registry().create(
        NewEntity::new("cmp-1", "counter", "canvas").with_state(state(json!({"value": 0}))),
    )?;
    for version in 1..=2 {
        tab_a.registry().update(
            "cmp-1",
            &state(json!({"value": version})),
            UpdateMeta::new(version, origin::LOCAL),
        )?;
    }
    settle().await;

    println!("Agent sets the counter label by voice");
    let outcome = agent
        .dispatcher()
        .dispatch(AgentIntent::new("cmp-1", state(json!({"label": "Score"}))))?;
    println!("  tool response: {}", serde_json::to_string(&outcome)?);
    settle().await;

    println!("Agent retries the same tool call");
    let retry = agent
        .dispatcher()
        .dispatch(AgentIntent::new("cmp-1", state(json!({"label": "Score"}))))?;
    println!("  tool response: {}", serde_json::to_string(&retry)?);
    settle().await;

    print_canvas("tab A", &tab_a)?;
    print_canvas("tab B", &tab_b)?;
    print_canvas("agent", &agent)?;

    let versions: Vec<u64> = [&tab_a, &tab_b, &agent]
        .iter()
        .map(|s| s.registry().get("cmp-1").map(|r| r.version))
        .collect::<Result<_, _>>()?;
    if versions.iter().any(|v| *v != versions[0]) {
        bail!("peers diverged: {:?}", versions);
    }

    println!("Tab B removes the counter");
    tab_b.registry().remove("cmp-1")?;
    settle().await;

    for (label, session) in [("tab A", &tab_a), ("tab B", &tab_b), ("agent", &agent)] {
        let stats = session.bridge().stats();
        println!(
            "  {}: {} records, published {}, ingested {}, dropped {}",
            label,
            session.registry().len(),
            stats.published,
            stats.ingested,
            stats.dropped
        );
    }

    for session in [&tab_a, &tab_b, &agent] {
        session.shutdown().await;
    }
    Ok(())
}
