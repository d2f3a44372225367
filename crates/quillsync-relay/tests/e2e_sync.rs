//! End-to-end: two sync engines talking through a real relay over TCP
//!
//! Everything is live here: redb-backed storage, sealed envelopes,
//! fragmentation, announce-driven convergence. Timings are shortened so
//! convergence happens within test timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use quillsync_core::crypto::DocumentCrypto;
use quillsync_core::engine::{EngineConfig, SyncEngine};
use quillsync_core::identity::DeviceKeypair;
use quillsync_core::keys::StaticKeyProvider;
use quillsync_core::storage::Storage;
use quillsync_core::sync::events::SyncEvent;
use quillsync_core::sync::session::SessionState;
use quillsync_core::sync::transport::{TcpConnector, TransportConfig};
use quillsync_core::types::DocumentId;
use quillsync_relay::RelayServer;
use tokio_util::sync::CancellationToken;

fn doc() -> DocumentId {
    DocumentId::new("chapters/one")
}

fn notes_doc() -> DocumentId {
    DocumentId::new("notes/villain")
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        transport: TransportConfig {
            ping_interval: Duration::from_millis(500),
            pong_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
        },
        announce_interval: Duration::from_millis(500),
        debounce: Duration::from_millis(50),
    }
}

struct TestPeer {
    engine: SyncEngine,
    provider: Arc<StaticKeyProvider>,
    keypair: DeviceKeypair,
    _dir: tempfile::TempDir,
}

fn make_peer(relay_addr: &str, document_key: [u8; 32]) -> TestPeer {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = Storage::new(dir.path().join("peer.redb")).unwrap();
    let keypair = DeviceKeypair::generate().unwrap();
    let provider = Arc::new(StaticKeyProvider::new(keypair.clone()));
    provider.set_document_key(doc(), document_key);

    let engine = SyncEngine::new(
        storage,
        provider.clone(),
        Arc::new(TcpConnector::new(relay_addr)),
        fast_config(),
    )
    .unwrap();

    TestPeer {
        engine,
        provider,
        keypair,
        _dir: dir,
    }
}

/// Relay + two peers sharing a document key and trusting each other
async fn linked_setup() -> (TestPeer, TestPeer, CancellationToken) {
    let relay = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = relay.local_addr().unwrap().to_string();
    let cancel = relay.cancel_token();
    tokio::spawn(relay.run());

    let key = DocumentCrypto::generate_key();
    let a = make_peer(&addr, key);
    let b = make_peer(&addr, key);

    a.provider
        .trust_peer(b.engine.replica_id(), b.keypair.verifying_key());
    b.provider
        .trust_peer(a.engine.replica_id(), a.keypair.verifying_key());
    (a, b, cancel)
}

async fn wait_for_text(
    events: &mut broadcast::Receiver<SyncEvent>,
    expected: &str,
) {
    let deadline = Duration::from_secs(20);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::DocumentChanged { new_text, .. }) if new_text == expected => {
                    return;
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for text {:?}", expected));
}

async fn wait_for_status(
    events: &mut broadcast::Receiver<SyncEvent>,
    expected: SessionState,
) {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::StatusChanged { status, .. }) if status == expected => return,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for status {:?}", expected));
}

#[tokio::test]
async fn typing_on_one_peer_appears_on_the_other() {
    let (a, b, cancel) = linked_setup().await;
    let mut b_events = b.engine.subscribe_events();

    a.engine.attach(&doc(), "").unwrap();
    b.engine.attach(&doc(), "").unwrap();
    a.engine.connect();
    b.engine.connect();

    a.engine
        .on_editor_change(&doc(), "The harbor was empty at dawn.".to_string());

    wait_for_text(&mut b_events, "The harbor was empty at dawn.").await;

    a.engine.shutdown().unwrap();
    b.engine.shutdown().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn peers_reach_in_sync_status() {
    let (a, b, cancel) = linked_setup().await;
    let mut a_events = a.engine.subscribe_events();
    let mut b_events = b.engine.subscribe_events();

    a.engine.attach(&doc(), "").unwrap();
    b.engine.attach(&doc(), "").unwrap();
    a.engine.connect();
    b.engine.connect();

    a.engine.on_editor_change(&doc(), "draft".to_string());

    wait_for_status(&mut b_events, SessionState::InSync).await;
    wait_for_status(&mut a_events, SessionState::InSync).await;

    a.engine.shutdown().unwrap();
    b.engine.shutdown().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn late_joiner_receives_full_state() {
    let (a, b, cancel) = linked_setup().await;

    // A writes alone, offline
    a.engine.attach(&doc(), "").unwrap();
    a.engine
        .on_editor_change(&doc(), "written before anyone joined".to_string());
    tokio::time::sleep(Duration::from_millis(200)).await;

    a.engine.connect();
    let mut b_events = b.engine.subscribe_events();
    b.engine.attach(&doc(), "").unwrap();
    b.engine.connect();

    wait_for_text(&mut b_events, "written before anyone joined").await;

    a.engine.shutdown().unwrap();
    b.engine.shutdown().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn concurrent_edits_converge_identically() {
    let (a, b, cancel) = linked_setup().await;
    let mut a_events = a.engine.subscribe_events();
    let mut b_events = b.engine.subscribe_events();

    // Both type before either connects
    a.engine.attach(&doc(), "").unwrap();
    b.engine.attach(&doc(), "").unwrap();
    a.engine.on_editor_change(&doc(), "cat".to_string());
    b.engine.on_editor_change(&doc(), "dog".to_string());
    tokio::time::sleep(Duration::from_millis(200)).await;

    a.engine.connect();
    b.engine.connect();

    // Replica ids are random, so either word may sort first; both sides
    // must agree on the same order.
    let expected_one = "catdog";
    let expected_two = "dogcat";
    let wait_both = |events: &mut broadcast::Receiver<SyncEvent>| {
        let mut events = events.resubscribe();
        async move {
            tokio::time::timeout(Duration::from_secs(20), async {
                loop {
                    if let Ok(SyncEvent::DocumentChanged { new_text, .. }) = events.recv().await {
                        if new_text == expected_one || new_text == expected_two {
                            return new_text;
                        }
                    }
                }
            })
            .await
            .expect("timed out waiting for convergence")
        }
    };
    let text_a = wait_both(&mut a_events).await;
    let text_b = wait_both(&mut b_events).await;
    assert_eq!(text_a, text_b);

    a.engine.shutdown().unwrap();
    b.engine.shutdown().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn reconnect_after_going_offline_catches_up() {
    let (a, b, cancel) = linked_setup().await;
    let key = DocumentCrypto::generate_key();
    a.provider.set_document_key(notes_doc(), key);
    b.provider.set_document_key(notes_doc(), key);
    let mut b_events = b.engine.subscribe_events();

    // Both peers work on two documents at once
    a.engine.attach(&doc(), "").unwrap();
    a.engine.attach(&notes_doc(), "").unwrap();
    b.engine.attach(&doc(), "").unwrap();
    b.engine.attach(&notes_doc(), "").unwrap();
    a.engine.connect();
    b.engine.connect();

    a.engine.on_editor_change(&doc(), "first".to_string());
    wait_for_text(&mut b_events, "first").await;

    // B drops offline; A keeps writing in both documents
    b.engine.disconnect();
    a.engine
        .on_editor_change(&doc(), "first and second".to_string());
    a.engine
        .on_editor_change(&notes_doc(), "the villain limps".to_string());
    tokio::time::sleep(Duration::from_millis(300)).await;

    // On reconnect B resubscribes both rooms, announces, and pulls the
    // deltas for each document; they can land in either order.
    b.engine.connect();
    let mut missing: Vec<&str> = vec!["first and second", "the villain limps"];
    tokio::time::timeout(Duration::from_secs(20), async {
        while !missing.is_empty() {
            if let Ok(SyncEvent::DocumentChanged { new_text, .. }) = b_events.recv().await {
                missing.retain(|text| *text != new_text);
            }
        }
    })
    .await
    .expect("timed out waiting for both documents to catch up");

    a.engine.shutdown().unwrap();
    b.engine.shutdown().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn presence_hints_reach_other_peer() {
    let (a, b, cancel) = linked_setup().await;
    let mut b_events = b.engine.subscribe_events();

    a.engine.attach(&doc(), "").unwrap();
    b.engine.attach(&doc(), "").unwrap();
    a.engine.connect();
    b.engine.connect();

    // Make sure both subscriptions are live before the one-shot hint
    a.engine.on_editor_change(&doc(), "warmup".to_string());
    wait_for_text(&mut b_events, "warmup").await;

    a.engine.publish_presence(&doc(), 3, "June");

    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Ok(SyncEvent::PresenceReceived { document_id, hint }) = b_events.recv().await {
                assert_eq!(document_id, doc());
                assert_eq!(hint.cursor, 3);
                assert_eq!(hint.label, "June");
                assert_eq!(hint.replica, a.engine.replica_id());
                return;
            }
        }
    })
    .await
    .expect("timed out waiting for presence");

    a.engine.shutdown().unwrap();
    b.engine.shutdown().unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn untrusted_peer_cannot_inject_text() {
    let relay = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = relay.local_addr().unwrap().to_string();
    let cancel = relay.cancel_token();
    tokio::spawn(relay.run());

    let key = DocumentCrypto::generate_key();
    let a = make_peer(&addr, key);
    let b = make_peer(&addr, key);
    // B trusts A, but A never trusts B
    b.provider
        .trust_peer(a.engine.replica_id(), a.keypair.verifying_key());

    let mut a_events = a.engine.subscribe_events();
    a.engine.attach(&doc(), "").unwrap();
    b.engine.attach(&doc(), "").unwrap();
    a.engine.connect();
    b.engine.connect();

    b.engine.on_editor_change(&doc(), "injected".to_string());

    // A must reject the envelope and surface an error, never the text
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match a_events.recv().await {
                Ok(SyncEvent::DocumentChanged { new_text, .. }) => {
                    panic!("untrusted text applied: {:?}", new_text);
                }
                Ok(SyncEvent::SyncError { message, .. })
                    if message.contains("Untrusted sender") =>
                {
                    return;
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for rejection");

    a.engine.shutdown().unwrap();
    b.engine.shutdown().unwrap();
    cancel.cancel();
}
