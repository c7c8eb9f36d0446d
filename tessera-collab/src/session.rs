//! One client connection to one document.
//!
//! ```text
//! Connecting ──greeting──► AwaitingSync ──step 2 / update──► Synced
//!      │                        │                              │
//!      └────────────────────────┴── close / fault / timeout ───┴──► Closed
//! ```
//!
//! The session is transport-agnostic: [`Session::run`] drives any stream
//! of inbound [`Frame`]s and sink of outbound ones.

use std::fmt::Display;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tessera_core::{Origin, ReadTxn, StateVector};
use uuid::Uuid;

use crate::broadcast::{SessionHandle, SessionReceiver};
use crate::error::SyncError;
use crate::manager::{Room, SyncManager};
use crate::protocol::{Frame, FrameKind, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingSync,
    Synced,
    Closed,
}

pub struct Session {
    manager: SyncManager,
    room: Arc<Room>,
    handle: Arc<SessionHandle>,
    receiver: SessionReceiver,
    state: SessionState,
    frame_kind: FrameKind,
    /// Server state the peer holds once the pending replies are written.
    unsent_state: Option<StateVector>,
}

impl Session {
    pub(crate) fn new(
        manager: SyncManager,
        room: Arc<Room>,
        handle: Arc<SessionHandle>,
        receiver: SessionReceiver,
    ) -> Self {
        Self {
            manager,
            room,
            handle,
            receiver,
            state: SessionState::Connecting,
            frame_kind: FrameKind::default(),
            unsent_state: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.handle.id
    }

    pub fn document(&self) -> &str {
        self.room.id()
    }

    pub fn user(&self) -> &str {
        &self.handle.user
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frame_kind(&self) -> FrameKind {
        self.frame_kind
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    fn origin(&self) -> Origin {
        Origin::Peer(self.handle.id.to_string())
    }

    /// Messages sent right after connecting: the server state vector, then
    /// the presence of everyone else on the document.
    pub async fn start(&mut self) -> Result<Vec<SyncMessage>, SyncError> {
        let state = self.room.read().await.encode_state_vector()?;
        let mut out = vec![SyncMessage::SyncStep1(state)];
        out.extend(
            self.manager
                .awareness_snapshot(self.room.id(), &self.handle.user)
                .await
                .into_iter()
                .map(SyncMessage::Awareness),
        );
        self.state = SessionState::AwaitingSync;
        Ok(out)
    }

    /// Handle one decoded message and return the direct replies.
    ///
    /// Malformed payloads are logged and dropped; only errors that end the
    /// session are returned.
    pub async fn handle_message(&mut self, msg: SyncMessage) -> Result<Vec<SyncMessage>, SyncError> {
        match msg {
            SyncMessage::SyncStep1(bytes) => {
                let remote = match StateVector::decode(&bytes) {
                    Ok(sv) => sv,
                    Err(e) => {
                        self.log_dropped("state vector", bytes.len(), &e);
                        return Ok(Vec::new());
                    }
                };
                self.handle.observe_state(&remote).await;
                let (own, diff) = {
                    let doc = self.room.read().await;
                    (doc.state_vector(), doc.encode_state_as_update(&remote)?)
                };
                // Counts toward the GC floor only after the diff is written.
                let encoded = own.encode()?;
                self.unsent_state = Some(own);
                Ok(vec![SyncMessage::SyncStep1(encoded), SyncMessage::SyncStep2(diff)])
            }
            SyncMessage::SyncStep2(bytes) | SyncMessage::Update(bytes) => {
                match self.manager.apply_update(&self.room, &bytes, self.origin()).await {
                    Ok(summary) => {
                        self.state = SessionState::Synced;
                        if summary.applied.dropped > 0 {
                            log::warn!(
                                "Document {} session {}: dropped {} malformed items from {} bytes",
                                self.room.id(),
                                self.handle.id,
                                summary.applied.dropped,
                                bytes.len()
                            );
                        }
                    }
                    Err(SyncError::Crdt(e)) => self.log_dropped("update", bytes.len(), &e),
                    Err(e) => return Err(e),
                }
                Ok(Vec::new())
            }
            SyncMessage::Awareness(blob) => {
                self.manager.relay_awareness(&self.room, &self.handle, blob).await;
                Ok(Vec::new())
            }
            SyncMessage::SyncRequest => {
                let state = self.room.read().await.encode_state_vector()?;
                Ok(vec![SyncMessage::SyncStep1(state)])
            }
            SyncMessage::Ping => Ok(vec![SyncMessage::Pong]),
            SyncMessage::Pong => Ok(Vec::new()),
        }
    }

    /// Record that the replies returned so far reached the peer.
    pub async fn replies_sent(&mut self) {
        if let Some(state) = self.unsent_state.take() {
            self.handle.observe_state(&state).await;
        }
    }

    /// Handle one inbound frame and return the encoded replies.
    pub async fn handle_frame(&mut self, frame: &Frame) -> Result<Vec<Frame>, SyncError> {
        if let Some(kind) = frame.kind() {
            self.frame_kind = kind;
        }
        self.handle.touch();
        let msg = match SyncMessage::from_frame(frame) {
            Ok(msg) => msg,
            Err(e) => {
                self.log_dropped("frame", frame.len(), &e);
                return Ok(Vec::new());
            }
        };
        let replies = self.handle_message(msg).await?;
        Ok(self.encode_all(&replies))
    }

    fn encode_all(&self, messages: &[SyncMessage]) -> Vec<Frame> {
        messages.iter().filter_map(|m| self.encode(m)).collect()
    }

    /// Encode in the frame form this session last used.
    pub fn encode(&self, msg: &SyncMessage) -> Option<Frame> {
        match msg.to_frame(self.frame_kind, self.room.id()) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::error!(
                    "Document {} session {}: cannot encode outbound message: {e}",
                    self.room.id(),
                    self.handle.id
                );
                None
            }
        }
    }

    /// Next message queued by the broadcast group. `None` once the session
    /// has been closed from outside.
    pub async fn next_outbound(&mut self) -> Option<Arc<SyncMessage>> {
        if *self.receiver.closed.borrow() {
            return None;
        }
        tokio::select! {
            msg = self.receiver.outbound.recv() => msg,
            _ = self.receiver.closed.changed() => None,
        }
    }

    fn log_dropped(&self, what: &str, len: usize, err: &dyn Display) {
        log::warn!(
            "Document {} session {}: dropped {what} of {len} bytes: {err}",
            self.room.id(),
            self.handle.id
        );
    }

    /// Leave the document.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.manager.detach(&self.room, &self.handle).await;
    }

    /// Drive the session until the peer disconnects, a write fails or the
    /// manager closes it.
    pub async fn run<R, W, E>(mut self, mut incoming: R, mut outgoing: W)
    where
        R: Stream<Item = Result<Frame, E>> + Unpin,
        W: Sink<Frame> + Unpin,
        W::Error: Display,
        E: Display,
    {
        let greeting = match self.start().await {
            Ok(messages) => self.encode_all(&messages),
            Err(e) => {
                log::error!("Session {} could not start: {e}", self.handle.id);
                self.close().await;
                return;
            }
        };
        let mut open = send_all(&mut outgoing, greeting).await;

        while open {
            tokio::select! {
                inbound = incoming.next() => match inbound {
                    Some(Ok(Frame::Close)) | None => open = false,
                    Some(Ok(frame)) => match self.handle_frame(&frame).await {
                        Ok(replies) => {
                            open = send_all(&mut outgoing, replies).await;
                            if open {
                                self.replies_sent().await;
                            }
                        }
                        Err(e) => {
                            log::warn!("Session {} ending: {e}", self.handle.id);
                            open = false;
                        }
                    },
                    Some(Err(e)) => {
                        log::debug!("Session {} transport error: {e}", self.handle.id);
                        open = false;
                    }
                },
                outbound = self.next_outbound() => match outbound {
                    Some(msg) => {
                        let frames: Vec<Frame> = self.encode(&msg).into_iter().collect();
                        open = send_all(&mut outgoing, frames).await;
                    }
                    None => open = false,
                },
            }
        }

        self.close().await;
        let _ = outgoing.send(Frame::Close).await;
    }
}

async fn send_all<W>(outgoing: &mut W, frames: Vec<Frame>) -> bool
where
    W: Sink<Frame> + Unpin,
    W::Error: Display,
{
    for frame in frames {
        if let Err(e) = outgoing.send(frame).await {
            log::debug!("Write failed: {e}");
            return false;
        }
    }
    true
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.handle.close();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let room = self.room.clone();
            let handle = self.handle.clone();
            runtime.spawn(async move {
                manager.detach(&room, &handle).await;
            });
        }
    }
}
