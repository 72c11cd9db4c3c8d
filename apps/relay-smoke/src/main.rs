use std::{sync::Arc, time::Duration};

use relay_core::{CryptoEngine, MEGOLM_ALGORITHM, SyncResponse, Transport};
use relay_session::{
    Session, SessionConfig, logging,
    mock::{MockCryptoEngine, MockTransport},
};
use serde_json::json;
use tokio::runtime::Handle;
use tracing::{error, info};

const SMOKE_USER: &str = "@relay-smoke:example.org";
const SMOKE_ROOM: &str = "!smoke:example.org";
const SYNC_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SessionConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid relay configuration: {err}");
            std::process::exit(1);
        }
    };

    let engine = Arc::new(MockCryptoEngine::new());
    engine.add_room(SMOKE_ROOM, "Smoke", true);
    engine.add_room_key(
        "smoke-session",
        json!({
            "type": "m.room.message",
            "content": {"msgtype": "m.text", "body": "hello from the relay"}
        }),
        true,
    );

    let transport = MockTransport::logged_in();
    transport.push_sync(Ok(SyncResponse::ok(json!({"next_batch": "smoke-1"}))));

    let (notifications, _receiver) = config.notification_queue();
    let engine_handle: Arc<dyn CryptoEngine> = engine;
    let transport_handle: Arc<dyn Transport> = Arc::new(transport);
    let session = Session::new(
        SMOKE_USER,
        engine_handle,
        transport_handle,
        notifications,
        config,
        Handle::current(),
    );

    if let Err(err) = session.start().await {
        error!(error = %err, "failed to start sync loop");
        std::process::exit(1);
    }

    match tokio::time::timeout(SYNC_DEADLINE, session.await_synced()).await {
        Ok(cycle) => info!(cycle, "sync loop completed a cycle"),
        Err(_) => {
            error!("sync loop did not complete a cycle in time");
            let _ = session.stop().await;
            std::process::exit(1);
        }
    }

    let mut body = json!({
        "next_batch": "smoke-1",
        "rooms": {"join": {SMOKE_ROOM: {"timeline": {"events": [
            {
                "type": "m.room.encrypted",
                "event_id": "$smoke",
                "sender": "@alice:example.org",
                "content": {
                    "algorithm": MEGOLM_ALGORITHM,
                    "ciphertext": "AwgAEpAB",
                    "session_id": "smoke-session"
                }
            },
            {
                "type": "m.room.encrypted",
                "event_id": "$missing",
                "sender": "@alice:example.org",
                "content": {
                    "algorithm": MEGOLM_ALGORITHM,
                    "ciphertext": "AwgAEpAB",
                    "session_id": "unknown-session"
                }
            }
        ]}}}}
    });

    if let Err(err) = session.decrypt_sync_body(&mut body, true) {
        error!(error = %err, "decryption pipeline failed");
    }
    info!(body = %body, "decrypted sync body");

    match session.stop().await {
        Ok(()) => println!("Relay smoke run completed in state {:?}.", session.state()),
        Err(err) => {
            eprintln!("Failed to stop sync loop: {err}");
            std::process::exit(1);
        }
    }
}
