//! Replicated document.
//!
//! A `Doc` owns one item store, its named root types, the pending queue for
//! out-of-order updates, the GC policy and the change observers. Observers
//! are registered when the document is built and run synchronously inside
//! commit.

use serde_json::{Map, Value};
use std::time::{Duration, Instant};

use crate::error::CrdtError;
use crate::gc::GcPolicy;
use crate::id::{random_client_id, ClientId};
use crate::item::{BranchId, TypeKind};
use crate::state_vector::{DeleteSet, StateVector};
use crate::store::Store;
use crate::transaction::{
    AfterTransactionObserver, Origin, ReadTxn, TransactionMut, TransactionSummary, UpdateEvent, UpdateObserver,
};
use crate::types::{materialize, ListRef, MapRef, TextRef, TypeRef};
use crate::update::{PendingQueue, Update};

/// Default bound on buffered out-of-order entries.
pub const DEFAULT_MAX_PENDING: usize = 4096;

/// Default lifetime of a buffered out-of-order entry.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

/// Document configuration.
#[derive(Debug, Clone)]
pub struct DocOptions {
    /// Client id used for local items.
    pub client_id: ClientId,
    pub gc: GcPolicy,
    /// Maximum number of pending items and delete ranges.
    pub max_pending: usize,
    /// Pending entries older than this are dropped.
    pub pending_timeout: Duration,
}

impl Default for DocOptions {
    fn default() -> Self {
        Self {
            client_id: random_client_id(),
            gc: GcPolicy::Never,
            max_pending: DEFAULT_MAX_PENDING,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        }
    }
}

/// Builder for a [`Doc`] with observers attached.
#[derive(Default)]
pub struct DocBuilder {
    options: DocOptions,
    update_observers: Vec<UpdateObserver>,
    after_transaction_observers: Vec<AfterTransactionObserver>,
}

impl DocBuilder {
    pub fn options(mut self, options: DocOptions) -> Self {
        self.options = options;
        self
    }

    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.options.client_id = client_id;
        self
    }

    pub fn gc(mut self, policy: GcPolicy) -> Self {
        self.options.gc = policy;
        self
    }

    pub fn max_pending(mut self, max: usize) -> Self {
        self.options.max_pending = max;
        self
    }

    pub fn pending_timeout(mut self, timeout: Duration) -> Self {
        self.options.pending_timeout = timeout;
        self
    }

    /// Called after every commit that produced a non-empty delta.
    pub fn on_update(mut self, f: impl Fn(&UpdateEvent<'_>) + Send + Sync + 'static) -> Self {
        self.update_observers.push(Box::new(f));
        self
    }

    /// Called exactly once per committed transaction.
    pub fn on_after_transaction(mut self, f: impl Fn(&TransactionSummary) + Send + Sync + 'static) -> Self {
        self.after_transaction_observers.push(Box::new(f));
        self
    }

    pub fn build(self) -> Doc {
        Doc {
            options: self.options,
            store: Store::default(),
            pending: PendingQueue::default(),
            replica_floor: None,
            update_observers: self.update_observers,
            after_transaction_observers: self.after_transaction_observers,
            destroyed: false,
        }
    }
}

/// A replicated document.
pub struct Doc {
    pub(crate) options: DocOptions,
    pub(crate) store: Store,
    pub(crate) pending: PendingQueue,
    replica_floor: Option<StateVector>,
    pub(crate) update_observers: Vec<UpdateObserver>,
    pub(crate) after_transaction_observers: Vec<AfterTransactionObserver>,
    destroyed: bool,
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Doc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Doc")
            .field("client_id", &self.options.client_id)
            .field("items", &self.store.blocks.item_count())
            .field("types", &self.store.types.len())
            .field("pending", &self.pending.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Doc {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_options(options: DocOptions) -> Self {
        Self::builder().options(options).build()
    }

    pub fn builder() -> DocBuilder {
        DocBuilder::default()
    }

    pub fn client_id(&self) -> ClientId {
        self.options.client_id
    }

    pub fn options(&self) -> &DocOptions {
        &self.options
    }

    pub fn get_or_insert_text(&mut self, name: &str) -> TextRef {
        TextRef::new(self.store.get_or_create_root(name, TypeKind::Text))
    }

    pub fn get_or_insert_list(&mut self, name: &str) -> ListRef {
        ListRef::new(self.store.get_or_create_root(name, TypeKind::List))
    }

    pub fn get_or_insert_map(&mut self, name: &str) -> MapRef {
        MapRef::new(self.store.get_or_create_root(name, TypeKind::Map))
    }

    /// Handle of an existing root type.
    pub fn get(&self, name: &str) -> Option<TypeRef> {
        let id = BranchId::Root(name.to_string());
        let kind = self.store.branch(&id)?.kind;
        Some(TypeRef::from_branch(id, kind))
    }

    /// Names of all root types, sorted.
    pub fn root_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .types
            .keys()
            .filter_map(|id| match id {
                BranchId::Root(name) => Some(name.clone()),
                BranchId::Nested(_) => None,
            })
            .collect();
        names.sort();
        names
    }

    pub fn transact_mut(&mut self, origin: Origin) -> Result<TransactionMut<'_>, CrdtError> {
        if self.destroyed {
            return Err(CrdtError::Destroyed);
        }
        Ok(TransactionMut::new(self, origin))
    }

    /// Run `body` in a transaction and commit it. The transaction commits
    /// even if `body` fails part way; the error is returned afterwards.
    pub fn run_in_transaction<F>(&mut self, origin: Origin, body: F) -> Result<TransactionSummary, CrdtError>
    where
        F: FnOnce(&mut TransactionMut<'_>) -> Result<(), CrdtError>,
    {
        let mut txn = self.transact_mut(origin)?;
        let result = body(&mut txn);
        let summary = txn.commit()?;
        result.map(|_| summary)
    }

    /// Encoded state vector.
    pub fn encode_state_vector(&self) -> Result<Vec<u8>, CrdtError> {
        self.state_vector().encode()
    }

    /// Everything a replica at `since` is missing, plus the full delete set.
    pub fn encode_state_as_update(&self, since: &StateVector) -> Result<Vec<u8>, CrdtError> {
        if self.destroyed {
            return Err(CrdtError::Destroyed);
        }
        Update::diff(&self.store, since, self.store.delete_set())?.encode()
    }

    /// Decode and integrate an update in its own transaction.
    pub fn apply_update(&mut self, bytes: &[u8], origin: Origin) -> Result<TransactionSummary, CrdtError> {
        let update = Update::decode(bytes)?;
        let mut txn = self.transact_mut(origin)?;
        txn.apply_decoded(update)?;
        txn.commit()
    }

    /// State vector every known replica has reached. `None` disables GC.
    pub fn set_replica_floor(&mut self, floor: Option<StateVector>) {
        self.replica_floor = floor;
    }

    pub fn replica_floor(&self) -> Option<&StateVector> {
        self.replica_floor.as_ref()
    }

    pub(crate) fn collect_in(&mut self, scope: Option<&DeleteSet>) -> usize {
        let GcPolicy::Filter(filter) = &self.options.gc else {
            return 0;
        };
        let Some(floor) = &self.replica_floor else {
            return 0;
        };
        self.store.collect_garbage(floor, scope, filter.as_ref())
    }

    /// Full GC pass. Returns the number of purged tombstones.
    pub fn collect_garbage(&mut self) -> usize {
        let purged = self.collect_in(None);
        if purged > 0 {
            log::debug!("Collected {purged} tombstones");
        }
        purged
    }

    /// Drop expired and excess pending entries.
    pub fn prune_pending(&mut self) -> usize {
        self.pending
            .enforce(self.options.max_pending, self.options.pending_timeout, Instant::now())
    }

    /// Number of buffered out-of-order entries.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Release all items and observers. Later transactions fail with
    /// [`CrdtError::Destroyed`].
    pub fn destroy(&mut self) {
        self.store.clear();
        self.pending.clear();
        self.update_observers.clear();
        self.after_transaction_observers.clear();
        self.replica_floor = None;
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// All root types as one JSON object.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        for name in self.root_names() {
            let value = materialize(&self.store, &BranchId::Root(name.clone()));
            obj.insert(name, value);
        }
        Value::Object(obj)
    }
}

impl ReadTxn for Doc {
    fn store(&self) -> &Store {
        &self.store
    }
}
