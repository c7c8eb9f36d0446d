//! WebSocket front end for the sync manager.
//!
//! ```text
//! ws://host/?document=<id>&user=<id>
//!        │
//!        ├── invalid / missing ids ──► HTTP 400, no upgrade
//!        ▼
//!   accept_hdr_async ──► Session::run ──► SyncManager (rooms, fan-out, reaper)
//! ```
//!
//! Binary and text WebSocket messages map one-to-one onto protocol frames;
//! transport-level ping/pong is answered by tungstenite itself.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{future, SinkExt, StreamExt};
use tessera_core::is_valid_id;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use url::form_urlencoded;

use crate::manager::{ManagerConfig, SyncManager};
use crate::protocol::Frame;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub manager: ManagerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            manager: ManagerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TESSERA_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns. Unparsable values
    /// are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("TESSERA_BIND_ADDR") {
            config.bind_addr = addr;
        }
        let m = &mut config.manager;
        read_var(&lookup, "TESSERA_SESSION_QUEUE", &mut m.session_queue_capacity);
        read_secs(&lookup, "TESSERA_SESSION_TIMEOUT_SECS", &mut m.session_timeout);
        read_secs(&lookup, "TESSERA_AWARENESS_TIMEOUT_SECS", &mut m.awareness_timeout);
        read_secs(&lookup, "TESSERA_REAPER_INTERVAL_SECS", &mut m.reaper_interval);
        read_var(&lookup, "TESSERA_GC", &mut m.gc_enabled);
        read_var(&lookup, "TESSERA_MAX_PENDING", &mut m.max_pending);
        read_secs(&lookup, "TESSERA_PENDING_TIMEOUT_SECS", &mut m.pending_timeout);
        read_var(&lookup, "TESSERA_COMPACT_THRESHOLD", &mut m.compact_threshold);
        config
    }
}

fn read_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => log::warn!("Ignoring {key}={raw:?}: not a valid value"),
    }
}

fn read_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut Duration) {
    let mut secs = target.as_secs();
    read_var(lookup, key, &mut secs);
    *target = Duration::from_secs(secs);
}

/// Identity of a connecting client, taken from the upgrade query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub document: String,
    pub user: String,
}

impl ConnectParams {
    /// Parse and validate `document` and `user` from a query string.
    pub fn from_query(query: Option<&str>) -> Result<Self, String> {
        let mut document = None;
        let mut user = None;
        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "document" => document = Some(value.into_owned()),
                "user" => user = Some(value.into_owned()),
                _ => {}
            }
        }
        let document = document.ok_or("missing document parameter")?;
        let user = user.ok_or("missing user parameter")?;
        if !is_valid_id(&document) {
            return Err(format!("invalid document id {document:?}"));
        }
        if !is_valid_id(&user) {
            return Err(format!("invalid user id {user:?}"));
        }
        Ok(Self { document, user })
    }
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

fn message_to_frame(msg: Message) -> Option<Frame> {
    match msg {
        Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Close(_) => Some(Frame::Close),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Close => Message::Close(None),
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    manager: SyncManager,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let manager = SyncManager::new(config.manager.clone());
        Self { config, manager }
    }

    /// Serve an existing manager (e.g. one with persistence attached).
    pub fn with_manager(config: ServerConfig, manager: SyncManager) -> Self {
        Self { config, manager }
    }

    pub fn manager(&self) -> &SyncManager {
        &self.manager
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind to the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from `listener` until the manager shuts down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let reaper = self.manager.spawn_reaper();
        let mut shutdown = self.manager.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let manager = self.manager.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, manager).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
        let _ = reaper.await;
        log::info!("Sync server stopped");
        Ok(())
    }
}

/// Upgrade one TCP connection and run its session.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: SyncManager,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut params = None;
    let callback = |request: &Request, response: Response| match ConnectParams::from_query(request.uri().query()) {
        Ok(p) => {
            params = Some(p);
            Ok(response)
        }
        Err(reason) => {
            log::warn!("Rejecting upgrade from {addr}: {reason}");
            Err(bad_request(reason))
        }
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let Some(params) = params else {
        return Ok(());
    };

    let session = manager.connect(&params.document, &params.user).await?;
    log::info!(
        "WebSocket session {} from {addr} on document {}",
        session.id(),
        params.document
    );

    let (sink, stream) = ws_stream.split();
    let incoming = stream.filter_map(|msg| {
        future::ready(match msg {
            Ok(msg) => message_to_frame(msg).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });
    let outgoing = sink.with(|frame: Frame| {
        future::ready(Ok::<Message, tungstenite::Error>(frame_to_message(frame)))
    });
    session.run(incoming, outgoing).await;
    Ok(())
}
