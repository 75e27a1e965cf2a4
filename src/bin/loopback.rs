//! In-process demo: two clients complete a voice call through the memory
//! store and the loopback peer factory.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --bin loopback

use std::sync::Arc;
use std::time::Duration;

use log::info;
use spancall::{
    CallConfig, CallSessionManager, EventBus, LoopbackPeerFactory, MemorySignalingStore,
    MediaKind, PresenceListener, SignalingStore, SimulatedMediaDevices, UserId,
};

fn client(
    user: &str,
    store: Arc<MemorySignalingStore>,
) -> Arc<CallSessionManager> {
    CallSessionManager::new(
        UserId::new(user),
        CallConfig::default(),
        store,
        LoopbackPeerFactory::new(),
        SimulatedMediaDevices::new(),
        Arc::new(EventBus::new()),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let store = MemorySignalingStore::new();
    let alice = client("alice", store.clone());
    let bob = client("bob", store.clone());

    let bob_listener = PresenceListener::start(bob.clone()).await?;
    let mut bob_incoming = bob.events().incoming_call.subscribe();
    let mut alice_states = alice.events().call_state.subscribe();

    let call_id = alice
        .start_call(UserId::new("bob"), MediaKind::Voice)
        .await?;
    info!("alice started call {call_id}");

    let incoming = bob_incoming.recv().await?;
    info!(
        "bob sees incoming call {} from {}",
        incoming.call_id, incoming.initiator_id
    );
    bob_listener.accept(&incoming.call_id).await?;

    // Wait for alice to observe the answer.
    loop {
        let state = alice_states.recv().await?;
        info!("alice call state: {:?}", state.status);
        if state.status == spancall::CallStatus::Active {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;
    alice.end_call(&call_id).await?;

    let record = store.fetch_session(&call_id).await?.expect("record exists");
    info!(
        "final record: status {:?}, duration {:?}s",
        record.status, record.duration_seconds
    );

    bob_listener.stop().await;
    Ok(())
}
