//! Persistence across disconnects, unloads and manager restarts.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tessera_collab::{
    ManagerConfig, MemoryStore, Persistence, ServerConfig, SyncManager, SyncMessage, SyncServer,
};
use tessera_core::{Doc, Origin, StateVector};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server(manager: SyncManager) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        manager: manager.config().clone(),
    };
    let server = SyncServer::with_manager(config, manager);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    port
}

async fn connect(port: u16, document: &str, user: &str) -> Client {
    let url = format!("ws://127.0.0.1:{port}/?document={document}&user={user}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    // Greeting.
    next_message(&mut ws).await;
    ws
}

async fn next_message(ws: &mut Client) -> SyncMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no message within timeout")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Binary(bytes) => return SyncMessage::decode_binary(&bytes).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

fn text_update(client_id: u64, body: &str) -> Vec<u8> {
    let mut doc = Doc::builder().client_id(client_id).build();
    let text = doc.get_or_insert_text("body");
    doc.run_in_transaction(Origin::Local, |txn| text.push(txn, body))
        .unwrap()
        .update
}

/// Full resync of `document` as a fresh client would see it.
async fn fetch(port: u16, document: &str) -> serde_json::Value {
    let mut ws = connect(port, document, "reader").await;
    let sv = StateVector::new().encode().unwrap();
    ws.send(Message::Binary(SyncMessage::SyncStep1(sv).encode_binary().unwrap().into()))
        .await
        .unwrap();
    next_message(&mut ws).await;
    let SyncMessage::SyncStep2(diff) = next_message(&mut ws).await else {
        panic!("expected sync step 2");
    };
    let mut replica = Doc::new();
    replica.apply_update(&diff, Origin::Peer("server".into())).unwrap();
    replica.to_json()
}

#[tokio::test]
async fn test_updates_persisted_and_replayed_after_unload() {
    let store = Arc::new(MemoryStore::new());
    let manager = SyncManager::with_persistence(ManagerConfig::default(), store.clone());
    let port = start_server(manager.clone()).await;

    let mut alice = connect(port, "notes", "alice").await;
    let update = text_update(1, "persisted");
    alice
        .send(Message::Binary(SyncMessage::Update(update).encode_binary().unwrap().into()))
        .await
        .unwrap();
    eventually(|| store.entry_count("notes").unwrap() == 1).await;

    alice.close(None).await.unwrap();
    drop(alice);
    for _ in 0..200 {
        if manager.stats().await.active_sessions == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let report = manager.reap().await;
    assert_eq!(report.documents_unloaded, 1);
    assert_eq!(report.logs_compacted, 1);
    assert!(manager.document("notes").await.is_none());
    assert_eq!(store.entry_count("notes").unwrap(), 1);

    assert_eq!(fetch(port, "notes").await, json!({"body": "persisted"}));
}

#[tokio::test]
async fn test_restarted_manager_serves_stored_log() {
    let store = Arc::new(MemoryStore::new());
    store.save_update("log", &text_update(1, "one ")).unwrap();
    store.save_update("log", &text_update(2, "two")).unwrap();

    let manager = SyncManager::with_persistence(ManagerConfig::default(), store.clone());
    let port = start_server(manager.clone()).await;

    let content = fetch(port, "log").await;
    let body = content["body"].as_str().unwrap();
    assert_eq!(body.len(), "one two".len());
    assert!(body.contains("one ") && body.contains("two"));
    // Replay does not write the log back.
    assert_eq!(store.entry_count("log").unwrap(), 2);
}

#[tokio::test]
async fn test_compaction_above_threshold_keeps_content() {
    let store = Arc::new(MemoryStore::new());
    let config = ManagerConfig {
        compact_threshold: 3,
        ..ManagerConfig::default()
    };
    let manager = SyncManager::with_persistence(config, store.clone());
    let port = start_server(manager.clone()).await;

    let mut alice = connect(port, "busy", "alice").await;
    let mut doc = Doc::builder().client_id(7).build();
    let text = doc.get_or_insert_text("body");
    for chunk in ["a", "b", "c", "d", "e"] {
        let update = doc
            .run_in_transaction(Origin::Local, |txn| text.push(txn, chunk))
            .unwrap()
            .update;
        alice
            .send(Message::Binary(SyncMessage::Update(update).encode_binary().unwrap().into()))
            .await
            .unwrap();
    }
    eventually(|| store.entry_count("busy").unwrap() == 5).await;

    let report = manager.reap().await;
    assert_eq!(report.logs_compacted, 1);
    assert_eq!(report.documents_unloaded, 0);
    assert_eq!(store.entry_count("busy").unwrap(), 1);
    assert_eq!(fetch(port, "busy").await, json!({"body": "abcde"}));
}
