use anyhow::{Context, Result};
use collabcall::{
    CallConfig, CallController, CallEvent, CallPhase, LoopbackMediaEngine, MemorySignalingStore,
    PeerInfo, SessionContext,
};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Scripted two-party call against the in-memory signaling store and the
/// loopback media engine: Alice rings Bob, Bob answers, both connect, Bob
/// hangs up.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let store = Arc::new(MemorySignalingStore::new());
    let media = Arc::new(LoopbackMediaEngine::new());

    let (alice, mut alice_events) = CallController::new(
        store.clone(),
        media.clone(),
        SessionContext::new("alice", "Alice"),
        PeerInfo::new("bob", "Bob"),
        CallConfig::default(),
    );
    let (bob, mut bob_events) = CallController::new(
        store.clone(),
        media.clone(),
        SessionContext::new("bob", "Bob"),
        PeerInfo::new("alice", "Alice"),
        CallConfig::default(),
    );

    alice.initiate().await?;

    let prompt = loop {
        let event = timeout(Duration::from_secs(5), bob_events.recv())
            .await
            .context("no incoming call surfaced")?
            .context("bob's event stream closed")?;
        if let CallEvent::IncomingCall(prompt) = event {
            break prompt;
        }
    };
    info!("bob sees an incoming call from {}", prompt.caller_name);

    bob.answer().await?;
    wait_for(&alice, CallPhase::is_connected).await?;
    wait_for(&bob, CallPhase::is_connected).await?;
    info!("call {} connected on both sides", prompt.call_id);

    let stream = wait_remote_media(&mut alice_events).await?;
    info!("alice renders remote stream {}", stream.id);

    bob.hang_up().await?;
    wait_for(&alice, CallPhase::is_idle).await?;
    wait_for(&bob, CallPhase::is_idle).await?;
    info!("call ended, both sides idle");

    alice.dispose().await;
    bob.dispose().await;
    Ok(())
}

async fn wait_for(controller: &CallController, pred: fn(&CallPhase) -> bool) -> Result<()> {
    let mut watch = controller.phase_watch();
    timeout(Duration::from_secs(5), watch.wait_for(pred))
        .await
        .context("timed out waiting for call phase")?
        .context("session ended early")?;
    Ok(())
}

async fn wait_remote_media(
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
) -> Result<collabcall::MediaStreamHandle> {
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .context("no remote media surfaced")?
            .context("event stream closed")?;
        if let CallEvent::RemoteMedia(handle) = event {
            return Ok(handle);
        }
    }
}
