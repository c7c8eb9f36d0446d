//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on an ephemeral port and talks to it with
//! plain tokio-tungstenite clients.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tessera_collab::{ManagerConfig, ServerConfig, SyncManager, SyncMessage, SyncServer};
use tessera_core::{Doc, Origin, ReadTxn, StateVector};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a server on a free port, return the port and its manager.
async fn start_test_server() -> (u16, SyncManager) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        manager: ManagerConfig::default(),
    });
    let manager = server.manager().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, manager)
}

async fn connect(port: u16, document: &str, user: &str) -> Client {
    let url = format!("ws://127.0.0.1:{port}/?document={document}&user={user}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

/// Next protocol message, skipping transport pings.
async fn next_message(ws: &mut Client) -> SyncMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no message within timeout")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Binary(bytes) => return SyncMessage::decode_binary(&bytes).unwrap(),
            Message::Text(text) => return SyncMessage::decode_text(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

async fn next_text(ws: &mut Client) -> Value {
    let msg = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("no message within timeout")
        .expect("stream ended")
        .unwrap();
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn send(ws: &mut Client, msg: SyncMessage) {
    ws.send(Message::Binary(msg.encode_binary().unwrap().into()))
        .await
        .unwrap();
}

/// Wait until the server copy of `document` reaches `target`.
async fn wait_for_state(manager: &SyncManager, document: &str, target: &StateVector) {
    for _ in 0..100 {
        if let Some(room) = manager.document(document).await {
            if room.state_vector().await.dominates(target) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server never reached {target:?}");
}

#[tokio::test]
async fn test_server_greets_with_state_vector() {
    let (port, _manager) = start_test_server().await;
    let mut ws = connect(port, "doc-1", "alice").await;
    match next_message(&mut ws).await {
        SyncMessage::SyncStep1(sv) => assert!(StateVector::decode(&sv).unwrap().is_empty()),
        other => panic!("expected sync step 1, got {other:?}"),
    }
}

#[tokio::test]
async fn test_upgrade_without_valid_ids_rejected() {
    let (port, manager) = start_test_server().await;
    for query in ["document=doc-1", "user=alice", "document=bad%20id&user=alice", ""] {
        let url = format!("ws://127.0.0.1:{port}/?{query}");
        match tokio_tungstenite::connect_async(&url).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
            other => panic!("expected HTTP 400 for {query:?}, got {other:?}"),
        }
    }
    assert!(manager.document_ids().await.is_empty());
}

#[tokio::test]
async fn test_sync_from_empty_state_vector() {
    let (port, manager) = start_test_server().await;

    // Alice seeds the document.
    let mut alice = connect(port, "doc-1", "alice").await;
    next_message(&mut alice).await;
    let mut local = Doc::builder().client_id(1).build();
    let text = local.get_or_insert_text("body");
    let update = local
        .run_in_transaction(Origin::Local, |txn| text.insert(txn, 0, "Hello"))
        .unwrap()
        .update;
    send(&mut alice, SyncMessage::Update(update)).await;
    wait_for_state(&manager, "doc-1", &local.state_vector()).await;

    // Bob starts from nothing.
    let mut bob = connect(port, "doc-1", "bob").await;
    next_message(&mut bob).await;
    send(&mut bob, SyncMessage::SyncStep1(StateVector::new().encode().unwrap())).await;

    let server_state = match next_message(&mut bob).await {
        SyncMessage::SyncStep1(sv) => StateVector::decode(&sv).unwrap(),
        other => panic!("expected state vector, got {other:?}"),
    };
    let diff = match next_message(&mut bob).await {
        SyncMessage::SyncStep2(diff) => diff,
        other => panic!("expected sync step 2, got {other:?}"),
    };

    let mut replica = Doc::builder().client_id(2).build();
    replica.apply_update(&diff, Origin::Peer("server".into())).unwrap();
    assert_eq!(replica.state_vector(), server_state);
    assert_eq!(replica.to_json(), json!({"body": "Hello"}));
    let room = manager.document("doc-1").await.unwrap();
    assert_eq!(room.read().await.to_json(), replica.to_json());
}

#[tokio::test]
async fn test_update_broadcast_to_other_sessions_only() {
    let (port, manager) = start_test_server().await;
    let mut alice = connect(port, "doc-2", "alice").await;
    let mut bob = connect(port, "doc-2", "bob").await;
    next_message(&mut alice).await;
    next_message(&mut bob).await;

    let mut local = Doc::builder().client_id(1).build();
    let list = local.get_or_insert_list("items");
    let update = local
        .run_in_transaction(Origin::Local, |txn| list.push(txn, 42))
        .unwrap()
        .update;
    send(&mut alice, SyncMessage::Update(update.clone())).await;

    assert_eq!(next_message(&mut bob).await, SyncMessage::Update(update));
    // The origin does not get its own update back.
    assert!(timeout(Duration::from_millis(100), alice.next()).await.is_err());
    assert_eq!(manager.stats().await.active_sessions, 2);
}

#[tokio::test]
async fn test_awareness_relayed_verbatim() {
    let (port, manager) = start_test_server().await;
    let mut alice = connect(port, "doc-3", "alice").await;
    let mut bob = connect(port, "doc-3", "bob").await;
    next_message(&mut alice).await;
    next_message(&mut bob).await;

    send(&mut alice, SyncMessage::Awareness(vec![7, 7, 7])).await;
    assert_eq!(next_message(&mut bob).await, SyncMessage::Awareness(vec![7, 7, 7]));

    let room = manager.document("doc-3").await.unwrap();
    assert!(room.read().await.to_json().as_object().unwrap().is_empty());
    assert_eq!(manager.stats().await.awareness_entries, 1);
}

#[tokio::test]
async fn test_text_protocol_session() {
    let (port, _manager) = start_test_server().await;
    let mut ws = connect(port, "doc-4", "alice").await;
    next_message(&mut ws).await;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
    assert_eq!(next_text(&mut ws).await, json!({"type": "pong"}));

    ws.send(Message::Text(r#"{"type":"sync_request","document":"doc-4"}"#.into()))
        .await
        .unwrap();
    let reply = next_text(&mut ws).await;
    assert_eq!(reply["type"], "sync");
    assert_eq!(reply["document"], "doc-4");
    assert!(reply["state"].is_array());

    // Index-keyed payloads are accepted and answered in text.
    let mut local = Doc::builder().client_id(3).build();
    let map = local.get_or_insert_map("m");
    let update = local
        .run_in_transaction(Origin::Local, |txn| map.insert(txn, "k", "v"))
        .unwrap()
        .update;
    let keyed: serde_json::Map<String, Value> = update
        .iter()
        .enumerate()
        .map(|(i, b)| (i.to_string(), json!(b)))
        .collect();
    let frame = json!({"type": "update", "document": "doc-4", "update": keyed});
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();

    ws.send(Message::Text(r#"{"type":"sync","document":"doc-4","state":[]}"#.into()))
        .await
        .unwrap();
    let state = next_text(&mut ws).await;
    assert_eq!(state["type"], "sync");
    assert!(state["state"].is_array());
    let diff = next_text(&mut ws).await;
    let SyncMessage::SyncStep2(bytes) = SyncMessage::decode_text(&diff.to_string()).unwrap() else {
        panic!("expected sync step 2, got {diff}");
    };
    let mut replica = Doc::new();
    replica.apply_update(&bytes, Origin::Peer("server".into())).unwrap();
    assert_eq!(replica.to_json(), json!({"m": {"k": "v"}}));
}

#[tokio::test]
async fn test_external_event_reaches_sessions() {
    let (port, manager) = start_test_server().await;
    let mut alice = connect(port, "tbl_1", "alice").await;
    next_message(&mut alice).await;

    let summary = manager
        .apply_external_event("tbl_1", json!({"type": "record.update", "record_id": "r1"}))
        .await
        .unwrap();
    assert_eq!(next_message(&mut alice).await, SyncMessage::Update(summary.update));
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let (port, manager) = start_test_server().await;
    let mut ws = connect(port, "doc-5", "alice").await;
    next_message(&mut ws).await;

    manager.shutdown().await;
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
}
