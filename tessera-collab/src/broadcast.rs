//! Fan-out of document messages to the sessions of one document.
//!
//! Every session owns a bounded outbound queue. Broadcasting never waits:
//! a session whose queue is full is marked inactive and dropped from the
//! group, so one slow reader cannot stall the others.
//!
//! ```text
//!  update observer ──► fan-out task ──► BroadcastGroup ──┬─► session A queue
//!                                                        ├─► session B queue
//!                                                        └─► (origin skipped)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera_core::StateVector;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::SyncMessage;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

/// Receiving half of a session's queues, owned by the session loop.
pub struct SessionReceiver {
    pub outbound: mpsc::Receiver<Arc<SyncMessage>>,
    pub closed: watch::Receiver<bool>,
}

/// Shared view of one connected session.
pub struct SessionHandle {
    pub id: Uuid,
    pub user: String,
    sender: mpsc::Sender<Arc<SyncMessage>>,
    close: watch::Sender<bool>,
    active: AtomicBool,
    created: Instant,
    /// Milliseconds after `created` of the last inbound frame.
    last_active_ms: AtomicU64,
    /// Newest state vector this session is known to have reached.
    known_state: Mutex<StateVector>,
}

impl SessionHandle {
    pub fn new(id: Uuid, user: impl Into<String>, capacity: usize) -> (Arc<Self>, SessionReceiver) {
        let (sender, outbound) = mpsc::channel(capacity.max(1));
        let (close, closed) = watch::channel(false);
        let handle = Arc::new(Self {
            id,
            user: user.into(),
            sender,
            close,
            active: AtomicBool::new(true),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            known_state: Mutex::new(StateVector::new()),
        });
        (handle, SessionReceiver { outbound, closed })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark inactive and tell the session loop to stop.
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        let _ = self.close.send(true);
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        let ms = self.created.elapsed().as_millis() as u64;
        self.last_active_ms.store(ms, Ordering::Relaxed);
    }

    pub fn last_active(&self) -> Instant {
        self.created + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed))
    }

    pub fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_active()) > timeout
    }

    /// Queue a message without waiting. Returns `false` if the queue is
    /// full or the session loop is gone.
    pub fn try_send(&self, msg: Arc<SyncMessage>) -> bool {
        self.is_active() && self.sender.try_send(msg).is_ok()
    }

    pub async fn known_state(&self) -> StateVector {
        self.known_state.lock().await.clone()
    }

    /// Merge `state` into what the session is known to have.
    pub async fn observe_state(&self, state: &StateVector) {
        self.known_state.lock().await.merge(state);
    }
}

/// Atomic broadcast stats, never locked on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Sessions attached to one document.
pub struct BroadcastGroup {
    sessions: RwLock<HashMap<Uuid, Arc<SessionHandle>>>,
    /// Set once the document is being unloaded; no session may join after.
    sealed: AtomicBool,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
            atomic_stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Attach a session. Returns false if the group has been sealed.
    pub async fn add_session(&self, handle: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write().await;
        if self.is_sealed() {
            return false;
        }
        sessions.insert(handle.id, handle);
        true
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Seal the group if no session is attached.
    pub async fn seal_if_empty(&self) -> bool {
        let sessions = self.sessions.write().await;
        if !sessions.is_empty() {
            return false;
        }
        self.sealed.store(true, Ordering::Release);
        true
    }

    pub async fn remove_session(&self, id: &Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(id)
    }

    /// Queue `msg` for every active session except `except`.
    ///
    /// Sessions that cannot accept the message are closed and removed.
    /// Returns the number of sessions the message was queued for.
    pub async fn broadcast(&self, msg: SyncMessage, except: Option<Uuid>) -> usize {
        let msg = Arc::new(msg);
        let mut delivered = 0;
        let mut overflowed = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, handle) in sessions.iter() {
                if Some(*id) == except {
                    continue;
                }
                if handle.try_send(msg.clone()) {
                    delivered += 1;
                } else {
                    overflowed.push(*id);
                }
            }
        }
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        if !overflowed.is_empty() {
            self.atomic_stats
                .messages_dropped
                .fetch_add(overflowed.len() as u64, Ordering::Relaxed);
            let mut sessions = self.sessions.write().await;
            for id in overflowed {
                if let Some(handle) = sessions.remove(&id) {
                    log::warn!(
                        "Session {id} (user {}) cannot keep up, dropping it",
                        handle.user
                    );
                    handle.close();
                }
            }
        }
        delivered
    }

    /// Seal the group, then close and remove every session.
    pub async fn close_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        self.sealed.store(true, Ordering::Release);
        for handle in sessions.values() {
            handle.close();
        }
        let closed = sessions.len();
        sessions.clear();
        closed
    }

    /// Close and remove sessions without inbound traffic for `timeout`.
    pub async fn evict_idle(&self, timeout: Duration, now: Instant) -> Vec<Uuid> {
        let mut sessions = self.sessions.write().await;
        let idle: Vec<Uuid> = sessions
            .values()
            .filter(|h| !h.is_active() || h.is_idle(timeout, now))
            .map(|h| h.id)
            .collect();
        for id in &idle {
            if let Some(handle) = sessions.remove(id) {
                handle.close();
            }
        }
        idle
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.values().filter(|h| h.is_active()).count()
    }

    pub async fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn has_session(&self, id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.active_count().await,
        }
    }
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}
