//! Per-document session registry.
//!
//! ```text
//! SyncManager ─┬─ rooms: document id → Room ─┬─ RwLock<Doc>
//!              │                             ├─ BroadcastGroup (sessions)
//!              │                             └─ fan-out task (persist + broadcast)
//!              ├─ AwarenessRegistry
//!              ├─ Persistence (optional)
//!              └─ reaper task (timeouts · pending · GC · compaction)
//! ```
//!
//! Mutations take the document's write guard; state vectors and diffs are
//! computed under the read guard. Commits reach the fan-out task through
//! the document's update observer, so broadcasting always happens after
//! the lock is released and in commit order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use tessera_core::{
    is_valid_id, Any, CrdtError, Doc, GcPolicy, Origin, ReadTxn, StateVector, TransactionSummary,
    DEFAULT_MAX_PENDING, DEFAULT_PENDING_TIMEOUT,
};
use tokio::sync::{mpsc, watch, Mutex, RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::AwarenessRegistry;
use crate::broadcast::{BroadcastGroup, SessionHandle};
use crate::error::SyncError;
use crate::events::{BusinessEvent, BUSINESS_EVENTS_MAP};
use crate::persistence::Persistence;
use crate::protocol::SyncMessage;
use crate::session::Session;

const REPLAY_ORIGIN: &str = "replay";
const BUSINESS_EVENT_ORIGIN: &str = "business_event";

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Outbound messages buffered per session before it is dropped
    pub session_queue_capacity: usize,
    /// Sessions without inbound traffic for this long are closed
    pub session_timeout: Duration,
    /// Awareness entries not refreshed for this long are forgotten
    pub awareness_timeout: Duration,
    pub reaper_interval: Duration,
    /// Purge tombstone content once every replica has seen the deletion
    pub gc_enabled: bool,
    pub max_pending: usize,
    pub pending_timeout: Duration,
    /// Stored log length that triggers a snapshot compaction
    pub compact_threshold: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_queue_capacity: 256,
            session_timeout: Duration::from_secs(300),
            awareness_timeout: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(30),
            gc_enabled: true,
            max_pending: DEFAULT_MAX_PENDING,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            compact_threshold: 256,
        }
    }
}

/// Snapshot of manager load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub documents: usize,
    pub active_sessions: usize,
    pub total_sessions: usize,
    pub awareness_entries: usize,
    /// Unix seconds
    pub timestamp: u64,
}

/// What one reaper pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub sessions_evicted: usize,
    pub awareness_evicted: usize,
    pub pending_dropped: usize,
    pub tombstones_collected: usize,
    pub logs_compacted: usize,
    pub documents_unloaded: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

struct CommittedUpdate {
    origin: Origin,
    update: Vec<u8>,
}

/// One open document and the sessions attached to it.
pub struct Room {
    id: String,
    doc: RwLock<Doc>,
    group: Arc<BroadcastGroup>,
    failed: AtomicBool,
}

impl Room {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &Arc<BroadcastGroup> {
        &self.group
    }

    /// Shared read access to the document.
    pub async fn read(&self) -> RwLockReadGuard<'_, Doc> {
        self.doc.read().await
    }

    pub async fn state_vector(&self) -> StateVector {
        self.doc.read().await.state_vector()
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }
}

struct Inner {
    config: ManagerConfig,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    awareness: Mutex<AwarenessRegistry>,
    persistence: Option<Arc<dyn Persistence>>,
    shutdown: watch::Sender<bool>,
}

/// Registry of open documents and their sessions. Cheap to clone.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_persistence(config: ManagerConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self::build(config, Some(persistence))
    }

    fn build(config: ManagerConfig, persistence: Option<Arc<dyn Persistence>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let awareness = AwarenessRegistry::new(config.awareness_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                rooms: RwLock::new(HashMap::new()),
                awareness: Mutex::new(awareness),
                persistence,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Receiver that flips to `true` when the manager shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Get or create the room of `document`, replaying stored updates on
    /// first open.
    pub async fn open_document(&self, document: &str) -> Result<Arc<Room>, SyncError> {
        if !is_valid_id(document) {
            return Err(SyncError::InvalidDocumentId(document.to_string()));
        }
        if self.is_shutting_down() {
            return Err(SyncError::ShuttingDown);
        }
        // Fast path: read lock
        {
            let rooms = self.inner.rooms.read().await;
            if let Some(room) = rooms.get(document) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.inner.rooms.write().await;
        if let Some(room) = rooms.get(document) {
            return Ok(room.clone());
        }
        let room = self.create_room(document)?;
        rooms.insert(document.to_string(), room.clone());
        log::info!("Opened document {document}");
        Ok(room)
    }

    fn create_room(&self, document: &str) -> Result<Arc<Room>, SyncError> {
        let config = &self.inner.config;
        let (tx, rx) = mpsc::unbounded_channel::<CommittedUpdate>();
        let gc = if config.gc_enabled {
            GcPolicy::always()
        } else {
            GcPolicy::Never
        };
        let mut doc = Doc::builder()
            .gc(gc)
            .max_pending(config.max_pending)
            .pending_timeout(config.pending_timeout)
            .on_update(move |event| {
                let _ = tx.send(CommittedUpdate {
                    origin: event.origin.clone(),
                    update: event.update.to_vec(),
                });
            })
            .build();

        if let Some(store) = &self.inner.persistence {
            let updates = store.load(document)?;
            let count = updates.len();
            for bytes in updates {
                if let Err(e) = doc.apply_update(&bytes, Origin::System(REPLAY_ORIGIN.into())) {
                    log::error!(
                        "Document {document}: skipping stored update of {} bytes: {e}",
                        bytes.len()
                    );
                }
            }
            if count > 0 {
                log::debug!("Document {document}: replayed {count} stored updates");
            }
        }

        let group = Arc::new(BroadcastGroup::new());
        tokio::spawn(fan_out(
            document.to_string(),
            group.clone(),
            self.inner.persistence.clone(),
            rx,
        ));
        Ok(Arc::new(Room {
            id: document.to_string(),
            doc: RwLock::new(doc),
            group,
            failed: AtomicBool::new(false),
        }))
    }

    pub async fn document(&self, document: &str) -> Option<Arc<Room>> {
        self.inner.rooms.read().await.get(document).cloned()
    }

    pub async fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Attach a new session for `user` to `document`.
    pub async fn connect(&self, document: &str, user: &str) -> Result<Session, SyncError> {
        if !is_valid_id(user) {
            return Err(SyncError::InvalidUserId(user.to_string()));
        }
        let (handle, receiver) = SessionHandle::new(
            Uuid::new_v4(),
            user,
            self.inner.config.session_queue_capacity,
        );
        handle.touch();
        // A sealed room has already left the registry, so reopening yields
        // a fresh one.
        let room = loop {
            let room = self.open_document(document).await?;
            if room.group.add_session(handle.clone()).await {
                break room;
            }
            log::debug!("Document {document} was unloaded while session {} joined, reopening", handle.id);
        };
        // The newcomer has seen nothing yet.
        room.doc.write().await.set_replica_floor(None);
        log::info!("Session {} (user {user}) joined document {document}", handle.id);
        Ok(Session::new(self.clone(), room, handle, receiver))
    }

    /// Remove a session from its document.
    pub(crate) async fn detach(&self, room: &Room, session: &SessionHandle) {
        session.close();
        if room.group.remove_session(&session.id).await.is_some() {
            log::info!(
                "Session {} (user {}) left document {}",
                session.id,
                session.user,
                room.id
            );
        }
        let user_still_here = room
            .group
            .sessions()
            .await
            .iter()
            .any(|h| h.user == session.user);
        if !user_still_here {
            self.inner.awareness.lock().await.remove(&room.id, &session.user);
        }
    }

    /// Integrate an update into `room` and map fatal store errors to a
    /// document failure.
    pub(crate) async fn apply_update(
        &self,
        room: &Room,
        bytes: &[u8],
        origin: Origin,
    ) -> Result<TransactionSummary, SyncError> {
        if room.is_failed() {
            return Err(SyncError::DocumentFailed(room.id.clone()));
        }
        let result = room.doc.write().await.apply_update(bytes, origin);
        self.check_failure(room, result).await
    }

    async fn check_failure<T>(&self, room: &Room, result: Result<T, CrdtError>) -> Result<T, SyncError> {
        match result {
            Err(CrdtError::Corrupted(reason)) => {
                self.fail_document(&room.id, &reason).await;
                Err(SyncError::DocumentFailed(room.id.clone()))
            }
            other => other.map_err(SyncError::from),
        }
    }

    /// Mark `document` failed, close its sessions and evict it.
    pub async fn fail_document(&self, document: &str, reason: &str) {
        log::error!("Document {document} failed: {reason}; closing all its sessions");
        if let Some(room) = self.document(document).await {
            room.failed.store(true, Ordering::Release);
        }
        self.close_document(document).await;
    }

    /// Close every session of `document` and drop it from memory.
    pub async fn close_document(&self, document: &str) -> bool {
        let (room, closed) = {
            let mut rooms = self.inner.rooms.write().await;
            let Some(room) = rooms.remove(document) else {
                return false;
            };
            let closed = room.group.close_all().await;
            (room, closed)
        };
        self.release(&room).await;
        log::info!("Closed document {document} ({closed} sessions)");
        true
    }

    /// Unload `room` if it is still registered and no session is attached.
    /// The check and the removal happen under the registry lock, so a
    /// concurrent `connect` either lands first or reopens a fresh room.
    async fn unload_if_idle(&self, room: &Arc<Room>) -> bool {
        {
            let mut rooms = self.inner.rooms.write().await;
            match rooms.get(&room.id) {
                Some(current) if Arc::ptr_eq(current, room) => {}
                _ => return false,
            }
            if !room.group.seal_if_empty().await {
                return false;
            }
            rooms.remove(&room.id);
        }
        self.release(room).await;
        log::info!("Unloaded idle document {}", room.id);
        true
    }

    async fn release(&self, room: &Room) {
        self.inner.awareness.lock().await.remove_document(&room.id);
        room.doc.write().await.destroy();
    }

    /// Record a presence blob and relay it to the document's other sessions.
    pub(crate) async fn relay_awareness(&self, room: &Room, session: &SessionHandle, blob: Vec<u8>) -> usize {
        self.inner
            .awareness
            .lock()
            .await
            .update(&room.id, &session.user, blob.clone(), Instant::now());
        room.group
            .broadcast(SyncMessage::Awareness(blob), Some(session.id))
            .await
    }

    /// Presence blobs on `document` from users other than `user`.
    pub async fn awareness_snapshot(&self, document: &str, user: &str) -> Vec<Vec<u8>> {
        self.inner
            .awareness
            .lock()
            .await
            .entries_for(document)
            .into_iter()
            .filter(|e| e.user != user)
            .map(|e| e.payload.clone())
            .collect()
    }

    /// Fold an opaque payload into `document`'s event map and broadcast the
    /// resulting update to every session on it.
    pub async fn apply_external_event(
        &self,
        document: &str,
        payload: Value,
    ) -> Result<TransactionSummary, SyncError> {
        let (room, result) = loop {
            let room = self.open_document(document).await?;
            if room.is_failed() {
                return Err(SyncError::DocumentFailed(room.id.clone()));
            }
            let mut doc = room.doc.write().await;
            if doc.is_destroyed() {
                // Unloaded between lookup and lock.
                continue;
            }
            let events = doc.get_or_insert_map(BUSINESS_EVENTS_MAP);
            let result = doc.run_in_transaction(Origin::System(BUSINESS_EVENT_ORIGIN.into()), |txn| {
                let mut stamp = unix_nanos();
                while events.contains_key(&*txn, &format!("event_{stamp}")) {
                    stamp += 1;
                }
                events.insert(txn, &format!("event_{stamp}"), Any::from(payload.clone()))
            });
            drop(doc);
            break (room, result);
        };
        let summary = self.check_failure(&room, result).await?;
        log::debug!(
            "Folded business event into {document} ({} bytes)",
            summary.update.len()
        );
        Ok(summary)
    }

    /// Route a typed business event to its document. Unrouted events are
    /// ignored.
    pub async fn publish_business_event(
        &self,
        event: &BusinessEvent,
    ) -> Result<Option<TransactionSummary>, SyncError> {
        let Some(document) = event.document_id() else {
            log::debug!("Ignoring business event {} without target document", event.kind.as_str());
            return Ok(None);
        };
        self.apply_external_event(&document, event.payload()).await.map(Some)
    }

    /// One maintenance pass over every open document.
    pub async fn reap(&self) -> ReapReport {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut report = ReapReport::default();
        let rooms: Vec<Arc<Room>> = self.inner.rooms.read().await.values().cloned().collect();

        for room in rooms {
            let evicted = room.group.evict_idle(config.session_timeout, now).await;
            for id in &evicted {
                log::info!("Session {id} on {} timed out", room.id);
            }
            report.sessions_evicted += evicted.len();

            let sessions = room.group.sessions().await;
            let mut floor: Option<StateVector> = None;
            for handle in &sessions {
                let known = handle.known_state().await;
                floor = Some(match floor {
                    Some(f) => f.intersect(&known),
                    None => known,
                });
            }

            {
                let mut doc = room.doc.write().await;
                report.pending_dropped += doc.prune_pending();
                if config.gc_enabled {
                    let floor = floor.unwrap_or_else(|| doc.state_vector());
                    doc.set_replica_floor(Some(floor));
                    report.tombstones_collected += doc.collect_garbage();
                }
            }

            if let Some(store) = &self.inner.persistence {
                // Idle documents are folded into one snapshot and unloaded.
                let result = if sessions.is_empty() {
                    self.compact(store.as_ref(), &room).await.map(|_| true)
                } else {
                    self.compact_if_needed(store.as_ref(), &room).await
                };
                match &result {
                    Ok(true) => report.logs_compacted += 1,
                    Ok(false) => {}
                    Err(e) => log::error!("Compaction of {} failed: {e}", room.id),
                }
                if sessions.is_empty() && result.is_ok() && self.unload_if_idle(&room).await {
                    report.documents_unloaded += 1;
                }
            }
        }

        let expired = self.inner.awareness.lock().await.evict_expired(now);
        report.awareness_evicted = expired.len();
        report
    }

    async fn compact_if_needed(&self, store: &dyn Persistence, room: &Room) -> Result<bool, SyncError> {
        if store.entry_count(&room.id)? <= self.inner.config.compact_threshold {
            return Ok(false);
        }
        self.compact(store, room).await?;
        Ok(true)
    }

    async fn compact(&self, store: &dyn Persistence, room: &Room) -> Result<(), SyncError> {
        let snapshot = room.doc.read().await.encode_state_as_update(&StateVector::new())?;
        store.compact(&room.id, &snapshot)?;
        log::debug!("Compacted log of {} into {} bytes", room.id, snapshot.len());
        Ok(())
    }

    /// Run [`SyncManager::reap`] every `reaper_interval` until shutdown.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut shutdown = self.shutdown_signal();
        let period = self.inner.config.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = manager.reap().await;
                        if !report.is_empty() {
                            log::debug!("Reaper pass: {report:?}");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("Reaper stopped");
        })
    }

    pub async fn stats(&self) -> ManagerStats {
        let rooms: Vec<Arc<Room>> = self.inner.rooms.read().await.values().cloned().collect();
        let mut stats = ManagerStats {
            documents: rooms.len(),
            ..ManagerStats::default()
        };
        for room in &rooms {
            stats.active_sessions += room.group.active_count().await;
            stats.total_sessions += room.group.session_count().await;
        }
        stats.awareness_entries = self.inner.awareness.lock().await.len();
        stats.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        stats
    }

    /// Close every session, persist snapshots and stop background tasks.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let rooms: Vec<Arc<Room>> = self.inner.rooms.read().await.values().cloned().collect();
        for room in &rooms {
            room.group.close_all().await;
            if let Some(store) = &self.inner.persistence {
                if let Err(e) = self.compact(store.as_ref(), room).await {
                    log::error!("Final snapshot of {} failed: {e}", room.id);
                }
            }
        }
        log::info!("Sync manager shut down ({} documents)", rooms.len());
    }
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Persist and broadcast committed updates of one document, in commit order.
async fn fan_out(
    document: String,
    group: Arc<BroadcastGroup>,
    persistence: Option<Arc<dyn Persistence>>,
    mut updates: mpsc::UnboundedReceiver<CommittedUpdate>,
) {
    while let Some(committed) = updates.recv().await {
        if committed.origin == Origin::System(REPLAY_ORIGIN.into()) {
            continue;
        }
        if let Some(store) = &persistence {
            if let Err(e) = store.save_update(&document, &committed.update) {
                log::error!(
                    "Document {document}: failed to store update of {} bytes: {e}",
                    committed.update.len()
                );
            }
        }
        let except = match &committed.origin {
            Origin::Peer(session) => Uuid::parse_str(session).ok(),
            _ => None,
        };
        let len = committed.update.len();
        let delivered = group.broadcast(SyncMessage::Update(committed.update), except).await;
        log::trace!(
            "Document {document}: update of {len} bytes from {} sent to {delivered} sessions",
            committed.origin
        );
    }
    log::debug!("Fan-out for {document} finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_document_is_shared() {
        let manager = SyncManager::new(ManagerConfig::default());
        let a = manager.open_document("doc-1").await.unwrap();
        let b = manager.open_document("doc-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.document_ids().await, vec!["doc-1".to_string()]);
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let manager = SyncManager::new(ManagerConfig::default());
        assert!(matches!(
            manager.open_document("bad id!").await,
            Err(SyncError::InvalidDocumentId(_))
        ));
        assert!(matches!(
            manager.connect("doc", "").await,
            Err(SyncError::InvalidUserId(_))
        ));
        assert!(manager.document_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_external_event_lands_in_event_map() {
        let manager = SyncManager::new(ManagerConfig::default());
        let summary = manager
            .apply_external_event("tbl_1", json!({"type": "record.update", "record_id": "r1"}))
            .await
            .unwrap();
        assert!(!summary.update.is_empty());
        assert_eq!(summary.origin, Origin::System("business_event".into()));

        let room = manager.document("tbl_1").await.unwrap();
        let doc = room.read().await;
        let events = doc.to_json()[BUSINESS_EVENTS_MAP].clone();
        let entries = events.as_object().unwrap();
        assert_eq!(entries.len(), 1);
        let (key, value) = entries.iter().next().unwrap();
        assert!(key.starts_with("event_"));
        assert_eq!(value["record_id"], "r1");
    }

    #[tokio::test]
    async fn test_typed_business_event_routing() {
        let manager = SyncManager::new(ManagerConfig::default());
        let table = BusinessEvent::new(crate::events::BusinessEventType::TableCreate, "tbl_1", json!({}));
        assert!(manager.publish_business_event(&table).await.unwrap().is_some());
        assert!(manager.document("global:tables").await.is_some());

        let calc = BusinessEvent::new(crate::events::BusinessEventType::CalculationUpdate, "tbl_1", json!({}));
        assert!(manager.publish_business_event(&calc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_counts_documents_and_sessions() {
        let manager = SyncManager::new(ManagerConfig::default());
        let _s1 = manager.connect("doc-a", "alice").await.unwrap();
        let _s2 = manager.connect("doc-a", "bob").await.unwrap();
        let _s3 = manager.connect("doc-b", "alice").await.unwrap();
        let stats = manager.stats().await;
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.active_sessions, 3);
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.awareness_entries, 0);
        assert!(stats.timestamp > 0);
    }

    #[tokio::test]
    async fn test_close_document_signals_sessions() {
        let manager = SyncManager::new(ManagerConfig::default());
        let session = manager.connect("doc", "alice").await.unwrap();
        assert!(manager.close_document("doc").await);
        assert!(!session.handle().is_active());
        assert!(manager.document("doc").await.is_none());
        assert!(!manager.close_document("doc").await);
    }

    #[tokio::test]
    async fn test_reaper_collects_without_sessions() {
        let manager = SyncManager::new(ManagerConfig::default());
        let room = manager.open_document("doc").await.unwrap();
        {
            let mut doc = room.doc.write().await;
            let text = doc.get_or_insert_text("t");
            doc.run_in_transaction(Origin::Local, |txn| text.insert(txn, 0, "abcdef"))
                .unwrap();
            doc.run_in_transaction(Origin::Local, |txn| text.remove_range(txn, 1, 3))
                .unwrap();
        }
        let report = manager.reap().await;
        assert_eq!(report.tombstones_collected, 1);
        let doc = room.read().await;
        assert_eq!(doc.to_json(), json!({"t": "aef"}));
    }

    #[tokio::test]
    async fn test_reaper_evicts_idle_sessions() {
        let config = ManagerConfig {
            session_timeout: Duration::ZERO,
            ..ManagerConfig::default()
        };
        let manager = SyncManager::new(config);
        let session = manager.connect("doc", "alice").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = manager.reap().await;
        assert_eq!(report.sessions_evicted, 1);
        assert!(!session.handle().is_active());
        assert_eq!(manager.stats().await.total_sessions, 0);
    }

    #[tokio::test]
    async fn test_corrupted_update_evicts_document() {
        let manager = SyncManager::new(ManagerConfig::default());
        let session = manager.connect("doc", "alice").await.unwrap();
        let room = manager.document("doc").await.unwrap();
        manager.fail_document("doc", "test").await;
        assert!(room.is_failed());
        assert!(!session.handle().is_active());
        assert!(matches!(
            manager.apply_update(&room, &[], Origin::Local).await,
            Err(SyncError::DocumentFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_persisted_updates_are_replayed() {
        let store = Arc::new(MemoryStore::new());
        let manager = SyncManager::with_persistence(ManagerConfig::default(), store.clone());
        manager
            .apply_external_event("doc", json!({"n": 1}))
            .await
            .unwrap();
        // Let the fan-out task persist the update.
        for _ in 0..50 {
            if store.entry_count("doc").unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.entry_count("doc").unwrap(), 1);

        let restarted = SyncManager::with_persistence(ManagerConfig::default(), store.clone());
        let room = restarted.open_document("doc").await.unwrap();
        let doc = room.read().await;
        let events = doc.to_json()[BUSINESS_EVENTS_MAP].clone();
        assert_eq!(events.as_object().unwrap().len(), 1);
        drop(doc);
        // Replay is not written back.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.entry_count("doc").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unload_skips_room_that_gained_a_session() {
        let store = Arc::new(MemoryStore::new());
        let manager = SyncManager::with_persistence(ManagerConfig::default(), store);
        let room = manager.open_document("doc").await.unwrap();
        let session = manager.connect("doc", "alice").await.unwrap();

        assert!(!manager.unload_if_idle(&room).await);
        assert!(session.handle().is_active());
        assert!(!room.group.is_sealed());
        assert!(manager.document("doc").await.is_some());
    }

    #[tokio::test]
    async fn test_connect_to_unloaded_room_reopens() {
        let store = Arc::new(MemoryStore::new());
        let manager = SyncManager::with_persistence(ManagerConfig::default(), store);
        let stale = manager.open_document("doc").await.unwrap();
        let report = manager.reap().await;
        assert_eq!(report.documents_unloaded, 1);
        assert!(stale.group.is_sealed());

        let session = manager.connect("doc", "alice").await.unwrap();
        let current = manager.document("doc").await.unwrap();
        assert!(!Arc::ptr_eq(&stale, session.room()));
        assert!(Arc::ptr_eq(&current, session.room()));
        assert!(!session.room().read().await.is_destroyed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reaper_and_connect_race() {
        let store = Arc::new(MemoryStore::new());
        let manager = SyncManager::with_persistence(ManagerConfig::default(), store);
        for i in 0..200 {
            let document = format!("doc-{i}");
            manager.open_document(&document).await.unwrap();
            let reaper = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.reap().await })
            };
            let session = manager.connect(&document, "alice").await.unwrap();
            reaper.await.unwrap();

            assert!(session.handle().is_active(), "session on {document} closed after joining");
            let registered = manager.document(&document).await.unwrap();
            assert!(Arc::ptr_eq(&registered, session.room()));
            assert!(!session.room().read().await.is_destroyed());
        }
    }

    #[tokio::test]
    async fn test_external_event_after_unload_reopens() {
        let store = Arc::new(MemoryStore::new());
        let manager = SyncManager::with_persistence(ManagerConfig::default(), store);
        manager.apply_external_event("doc", json!({"n": 1})).await.unwrap();
        assert_eq!(manager.reap().await.documents_unloaded, 1);

        manager.apply_external_event("doc", json!({"n": 2})).await.unwrap();
        let room = manager.document("doc").await.unwrap();
        let doc = room.read().await;
        assert_eq!(doc.to_json()[BUSINESS_EVENTS_MAP].as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_sessions() {
        let manager = SyncManager::new(ManagerConfig::default());
        let mut signal = manager.shutdown_signal();
        manager.shutdown().await;
        signal.changed().await.unwrap();
        assert!(manager.is_shutting_down());
        assert!(matches!(
            manager.connect("doc", "alice").await,
            Err(SyncError::ShuttingDown)
        ));
    }
}
