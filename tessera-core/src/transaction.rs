//! Transactions.
//!
//! Every mutation happens inside a [`TransactionMut`]. Committing (or
//! dropping) it:
//! ```text
//! merge runs → encode delta → GC → update observers → after-txn observers
//! ```
//! Update observers only fire when the delta is non-empty; after-transaction
//! observers fire exactly once per transaction.

use std::collections::BTreeSet;
use std::time::Instant;

use crate::doc::Doc;
use crate::error::CrdtError;
use crate::id::{ClientId, Clock, Id};
use crate::item::{BranchId, Item};
use crate::state_vector::StateVector;
use crate::store::{Changes, Store};
use crate::update::{self, ApplyReport, Update};

/// Who caused a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A mutation made through this document's own handles.
    Local,
    /// Integration of an update received from a peer session.
    Peer(String),
    /// A server-side system action, tagged.
    System(String),
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Peer(session) => write!(f, "peer:{session}"),
            Origin::System(tag) => write!(f, "system:{tag}"),
        }
    }
}

/// Delta handed to update observers.
#[derive(Debug)]
pub struct UpdateEvent<'a> {
    pub origin: &'a Origin,
    /// Encoded [`Update`] with exactly this transaction's items and deletions.
    pub update: &'a [u8],
    pub changed: &'a BTreeSet<BranchId>,
}

/// Result of a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionSummary {
    pub origin: Origin,
    /// Encoded delta; empty when the transaction changed nothing.
    pub update: Vec<u8>,
    pub changed: BTreeSet<BranchId>,
    pub before_state: StateVector,
    pub after_state: StateVector,
    /// Tombstones purged by opportunistic GC.
    pub collected: usize,
    /// Integration statistics for updates applied in this transaction.
    pub applied: ApplyReport,
}

impl TransactionSummary {
    pub fn is_empty(&self) -> bool {
        self.update.is_empty()
    }
}

pub type UpdateObserver = Box<dyn Fn(&UpdateEvent<'_>) + Send + Sync>;
pub type AfterTransactionObserver = Box<dyn Fn(&TransactionSummary) + Send + Sync>;

/// Read access shared by documents and open transactions.
pub trait ReadTxn {
    fn store(&self) -> &Store;

    fn state_vector(&self) -> StateVector {
        self.store().blocks.state_vector()
    }
}

/// A read-write transaction over a [`Doc`].
pub struct TransactionMut<'doc> {
    doc: &'doc mut Doc,
    origin: Origin,
    before_state: StateVector,
    changes: Changes,
    applied: ApplyReport,
    committed: bool,
    /// Remote integration stopped part-way; observers are not told.
    failed: bool,
}

impl<'doc> TransactionMut<'doc> {
    pub(crate) fn new(doc: &'doc mut Doc, origin: Origin) -> Self {
        let before_state = doc.store.blocks.state_vector();
        Self {
            doc,
            origin,
            before_state,
            changes: Changes::default(),
            applied: ApplyReport::default(),
            committed: false,
            failed: false,
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn client_id(&self) -> ClientId {
        self.doc.options.client_id
    }

    pub fn before_state(&self) -> &StateVector {
        &self.before_state
    }

    /// Id for the next local run of `len` elements.
    pub(crate) fn next_id(&self, len: Clock) -> Result<Id, CrdtError> {
        let client = self.client_id();
        let clock = self.doc.store.blocks.get_state(client);
        clock
            .checked_add(len)
            .ok_or_else(|| CrdtError::Corrupted(format!("clock space of client {client} exhausted")))?;
        Ok(Id::new(client, clock))
    }

    pub(crate) fn store_mut(&mut self) -> &mut Store {
        &mut self.doc.store
    }

    pub(crate) fn integrate(&mut self, item: Item) -> Result<(), CrdtError> {
        self.doc.store.integrate(item, &mut self.changes)
    }

    pub(crate) fn delete_item(&mut self, start: Id) -> Result<bool, CrdtError> {
        self.doc.store.delete_item(start, &mut self.changes)
    }

    pub(crate) fn delete_at(&mut self, parent: &BranchId, index: Clock, len: Clock) -> Result<(), CrdtError> {
        self.doc.store.delete_at(parent, index, len, &mut self.changes)
    }

    /// Decode and integrate a remote update inside this transaction.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<ApplyReport, CrdtError> {
        let update = Update::decode(bytes)?;
        self.apply_decoded(update)
    }

    pub(crate) fn apply_decoded(&mut self, update: Update) -> Result<ApplyReport, CrdtError> {
        let doc = &mut *self.doc;
        let report = match update::apply(&mut doc.store, &mut doc.pending, update, &mut self.changes) {
            Ok(report) => report,
            Err(e) => {
                self.failed = true;
                return Err(e);
            }
        };
        let dropped = doc
            .pending
            .enforce(doc.options.max_pending, doc.options.pending_timeout, Instant::now());
        let mut report = report;
        if dropped > 0 {
            report.pending = report.pending.saturating_sub(dropped);
        }
        self.applied.absorb(&report);
        Ok(report)
    }

    /// Commit explicitly. Dropping the transaction commits as well.
    pub fn commit(mut self) -> Result<TransactionSummary, CrdtError> {
        self.commit_inner()
    }

    fn commit_inner(&mut self) -> Result<TransactionSummary, CrdtError> {
        self.committed = true;
        let doc = &mut *self.doc;
        let after_state = doc.store.blocks.state_vector();

        for (client, clock) in after_state.iter() {
            let from = self.before_state.get(client);
            if clock > from {
                doc.store.blocks.merge_range(client, from.saturating_sub(1), clock)?;
            }
        }
        for (client, ranges) in self.changes.deleted.iter() {
            for range in ranges {
                doc.store
                    .blocks
                    .merge_range(client, range.clock.saturating_sub(1), range.end())?;
            }
        }

        let has_items = after_state != self.before_state;
        let update = if has_items || !self.changes.deleted.is_empty() {
            Update::diff(&doc.store, &self.before_state, self.changes.deleted.clone())?.encode()?
        } else {
            Vec::new()
        };

        let collected = doc.collect_in(Some(&self.changes.deleted));
        let changed: BTreeSet<BranchId> = self.changes.changed.drain().collect();

        if self.failed {
            log::error!(
                "Commit by {} follows a failed integration; {} byte delta withheld from observers",
                self.origin,
                update.len()
            );
        } else if !update.is_empty() {
            log::trace!(
                "Commit by {} changed {} types, {} byte delta",
                self.origin,
                changed.len(),
                update.len()
            );
            let event = UpdateEvent {
                origin: &self.origin,
                update: &update,
                changed: &changed,
            };
            for observer in &doc.update_observers {
                observer(&event);
            }
        }

        let summary = TransactionSummary {
            origin: self.origin.clone(),
            update,
            changed,
            before_state: self.before_state.clone(),
            after_state,
            collected,
            applied: std::mem::take(&mut self.applied),
        };
        if !self.failed {
            for observer in &doc.after_transaction_observers {
                observer(&summary);
            }
        }
        Ok(summary)
    }
}

impl ReadTxn for TransactionMut<'_> {
    fn store(&self) -> &Store {
        &self.doc.store
    }
}

impl Drop for TransactionMut<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = self.commit_inner() {
                log::error!("Transaction commit failed: {e}");
            }
        }
    }
}

#[cfg(test)]
impl TransactionMut<'_> {
    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
    }
}
