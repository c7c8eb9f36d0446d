//! Update encoding, decoding and integration.
//!
//! Wire format (bincode, standard configuration, varint integers):
//! ```text
//! Update
//! ├── items: [ItemRecord]     per client, ascending clock
//! │     id · origin · right_origin · parent · parent_sub · content
//! └── delete_set: client → [(clock, len)]
//! ```
//!
//! Integration tolerates any delivery order. Items whose dependencies are
//! not yet known wait in a pending queue and are retried on every later
//! update; delete ranges targeting unknown ids wait the same way.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::error::CrdtError;
use crate::id::{ClientId, Clock, Id};
use crate::item::{BranchId, Content, Item, TypeKind};
use crate::state_vector::{DeleteSet, StateVector};
use crate::store::{Changes, Store};

/// Upper bound for a single decoded payload.
pub const MAX_UPDATE_SIZE: usize = 64 * 1024 * 1024;

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_UPDATE_SIZE>()
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CrdtError> {
    bincode::serde::encode_to_vec(value, config()).map_err(|e| CrdtError::Encode(e.to_string()))
}

pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CrdtError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CrdtError::Decode(e.to_string()))?;
    if read != bytes.len() {
        return Err(CrdtError::Decode(format!(
            "{} trailing bytes after payload",
            bytes.len() - read
        )));
    }
    Ok(value)
}

/// Parent of an encoded item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParentRef {
    Root { name: String, kind: TypeKind },
    Nested(Id),
}

/// An item as it travels inside an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: Id,
    pub origin: Option<Id>,
    pub right_origin: Option<Id>,
    pub parent: ParentRef,
    pub parent_sub: Option<String>,
    pub content: Content,
}

impl ItemRecord {
    fn from_item(item: &Item, store: &Store) -> Result<Self, CrdtError> {
        let parent = match &item.parent {
            BranchId::Root(name) => {
                let kind = store
                    .branch(&item.parent)
                    .map(|b| b.kind)
                    .ok_or_else(|| CrdtError::Corrupted(format!("item {} has no root {name}", item.id)))?;
                ParentRef::Root {
                    name: name.clone(),
                    kind,
                }
            }
            BranchId::Nested(anchor) => ParentRef::Nested(*anchor),
        };
        Ok(Self {
            id: item.id,
            origin: item.origin,
            right_origin: item.right_origin,
            parent,
            parent_sub: item.parent_sub.clone(),
            content: item.content.clone(),
        })
    }

    pub fn len(&self) -> Clock {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// The part of this record from `offset` on. Its origin becomes the
    /// element just before the cut.
    fn slice(&self, offset: Clock) -> Option<ItemRecord> {
        if offset == 0 {
            return Some(self.clone());
        }
        Some(ItemRecord {
            id: Id::new(self.id.client, self.id.clock + offset),
            origin: Some(Id::new(self.id.client, self.id.clock + offset - 1)),
            right_origin: self.right_origin,
            parent: self.parent.clone(),
            parent_sub: self.parent_sub.clone(),
            content: self.content.slice_from(offset)?,
        })
    }

    /// Structural problems that make the record unusable regardless of
    /// delivery order.
    fn malformed(&self) -> Option<&'static str> {
        let len = self.len();
        if len == 0 {
            return Some("zero length");
        }
        let Some(end) = self.id.clock.checked_add(len) else {
            return Some("clock overflow");
        };
        let inside = |id: &Id| id.client == self.id.client && id.clock >= self.id.clock && id.clock < end;
        if self.origin.as_ref().is_some_and(inside) {
            return Some("origin inside own range");
        }
        if self.right_origin.as_ref().is_some_and(inside) {
            return Some("right origin inside own range");
        }
        if self.parent_sub.is_some() && len != 1 {
            return Some("map entry longer than one element");
        }
        if matches!(self.parent, ParentRef::Nested(anchor) if inside(&anchor)) {
            return Some("parent inside own range");
        }
        None
    }
}

/// A self-contained batch of items and deletions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub items: Vec<ItemRecord>,
    pub delete_set: DeleteSet,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.delete_set.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        encode_value(self)
    }

    /// Decode an update. An empty payload is the empty update.
    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        decode_value(bytes)
    }

    /// Everything in `store` not covered by `since`, plus `delete_set`.
    pub(crate) fn diff(store: &Store, since: &StateVector, delete_set: DeleteSet) -> Result<Self, CrdtError> {
        let mut clients: Vec<ClientId> = store.blocks.clients().collect();
        clients.sort_unstable();
        let mut items = Vec::new();
        for client in clients {
            let from = since.get(client);
            let run = store.blocks.client_items(client);
            let first = run.partition_point(|item| item.id.clock + item.len <= from);
            for item in &run[first..] {
                let record = ItemRecord::from_item(item, store)?;
                let offset = from.saturating_sub(item.id.clock);
                let record = record.slice(offset).ok_or_else(|| {
                    CrdtError::Corrupted(format!("cannot slice {} at offset {offset}", item.id))
                })?;
                items.push(record);
            }
        }
        Ok(Self { items, delete_set })
    }
}

/// Outcome of integrating one update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Records integrated into the store (including retried pending ones).
    pub integrated: usize,
    /// Records skipped because they were already known.
    pub duplicates: usize,
    /// Malformed records discarded.
    pub dropped: usize,
    /// Records waiting for missing dependencies after this update.
    pub pending: usize,
    /// Delete ranges waiting for their targets after this update.
    pub pending_deletes: usize,
}

impl ApplyReport {
    pub(crate) fn absorb(&mut self, other: &ApplyReport) {
        self.integrated += other.integrated;
        self.duplicates += other.duplicates;
        self.dropped += other.dropped;
        self.pending = other.pending;
        self.pending_deletes = other.pending_deletes;
    }
}

#[derive(Debug, Clone)]
struct PendingDelete {
    id: Id,
    len: Clock,
    since: Instant,
}

/// Records and delete ranges waiting on a causal gap.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    items: Vec<(ItemRecord, Instant)>,
    deletes: Vec<PendingDelete>,
}

impl PendingQueue {
    pub fn len(&self) -> usize {
        self.items.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.deletes.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.deletes.clear();
    }

    /// Drop entries older than `timeout`, then the oldest entries beyond
    /// `max`. Returns how many were dropped.
    pub fn enforce(&mut self, max: usize, timeout: Duration, now: Instant) -> usize {
        let before = self.len();
        self.items
            .retain(|(_, since)| now.saturating_duration_since(*since) < timeout);
        self.deletes
            .retain(|d| now.saturating_duration_since(d.since) < timeout);
        let expired = before - self.len();
        if expired > 0 {
            log::warn!("Dropped {expired} pending entries older than {timeout:?}");
        }

        let excess = self.len().saturating_sub(max);
        if excess > 0 {
            let mut stamps: Vec<Instant> = self
                .items
                .iter()
                .map(|(_, since)| *since)
                .chain(self.deletes.iter().map(|d| d.since))
                .collect();
            stamps.sort_unstable();
            let cutoff = stamps[excess - 1];
            let mut budget = excess;
            self.items.retain(|(record, since)| {
                if budget > 0 && *since <= cutoff {
                    budget -= 1;
                    log::warn!("Pending queue full, dropping item {}", record.id);
                    false
                } else {
                    true
                }
            });
            self.deletes.retain(|d| {
                if budget > 0 && d.since <= cutoff {
                    budget -= 1;
                    log::warn!("Pending queue full, dropping delete range {}+{}", d.id, d.len);
                    false
                } else {
                    true
                }
            });
        }
        before - self.len()
    }
}

enum Readiness {
    /// Integrate, skipping the first `offset` already-known elements.
    Ready(Clock),
    Known,
    Blocked,
    Malformed(&'static str),
}

fn is_known(store: &Store, id: &Id) -> bool {
    id.clock < store.blocks.get_state(id.client)
}

fn classify(store: &Store, record: &ItemRecord) -> Readiness {
    if let Some(reason) = record.malformed() {
        return Readiness::Malformed(reason);
    }
    let state = store.blocks.get_state(record.id.client);
    let end = record.id.clock + record.len();
    if end <= state {
        return Readiness::Known;
    }
    if record.id.clock > state {
        return Readiness::Blocked;
    }
    let offset = state - record.id.clock;
    let origin = if offset > 0 {
        Some(Id::new(record.id.client, state - 1))
    } else {
        record.origin
    };

    if [origin, record.right_origin]
        .iter()
        .flatten()
        .any(|id| !is_known(store, id))
    {
        return Readiness::Blocked;
    }

    let parent = match &record.parent {
        ParentRef::Root { name, .. } => BranchId::Root(name.clone()),
        ParentRef::Nested(anchor) => {
            if !is_known(store, anchor) {
                return Readiness::Blocked;
            }
            let id = BranchId::Nested(*anchor);
            if store.branch(&id).is_none() {
                match store.blocks.get(anchor).map(|item| &item.content) {
                    Some(Content::Type(_)) | Some(Content::Deleted(_)) => {}
                    _ => return Readiness::Malformed("parent is not a type"),
                }
            }
            id
        }
    };

    for neighbor in [origin, record.right_origin].iter().flatten() {
        if let Some(item) = store.blocks.get(neighbor) {
            if item.parent != parent || item.parent_sub != record.parent_sub {
                return Readiness::Malformed("neighbor belongs to another parent");
            }
        }
    }
    Readiness::Ready(offset)
}

fn integrate_record(
    store: &mut Store,
    record: ItemRecord,
    offset: Clock,
    changes: &mut Changes,
) -> Result<(), CrdtError> {
    let record = record
        .slice(offset)
        .ok_or_else(|| CrdtError::Corrupted(format!("cannot slice {} at offset {offset}", record.id)))?;
    let parent = match &record.parent {
        ParentRef::Root { name, kind } => store.get_or_create_root(name, *kind),
        ParentRef::Nested(anchor) => store
            .resolve_nested(*anchor)
            .ok_or_else(|| CrdtError::Corrupted(format!("parent {anchor} vanished")))?,
    };
    let left = record
        .origin
        .map(|id| store.blocks.clean_end(&id))
        .transpose()?;
    let right = record
        .right_origin
        .map(|id| store.blocks.clean_start(&id))
        .transpose()?;
    let mut item = Item::new(
        record.id,
        record.origin,
        record.right_origin,
        parent,
        record.parent_sub,
        record.content,
    );
    item.left = left;
    item.right = right;
    store.integrate(item, changes)
}

/// Integrate `update` and retry anything pending.
pub(crate) fn apply(
    store: &mut Store,
    pending: &mut PendingQueue,
    update: Update,
    changes: &mut Changes,
) -> Result<ApplyReport, CrdtError> {
    let now = Instant::now();
    let mut report = ApplyReport::default();

    let mut queues: BTreeMap<ClientId, VecDeque<(ItemRecord, Instant)>> = BTreeMap::new();
    for (record, since) in pending
        .items
        .drain(..)
        .chain(update.items.into_iter().map(|r| (r, now)))
    {
        queues.entry(record.id.client).or_default().push_back((record, since));
    }
    for queue in queues.values_mut() {
        queue.make_contiguous().sort_by_key(|(record, _)| record.id.clock);
    }

    let mut progress = true;
    while progress {
        progress = false;
        for queue in queues.values_mut() {
            while let Some((record, _)) = queue.front() {
                match classify(store, record) {
                    Readiness::Blocked => break,
                    Readiness::Known => {
                        queue.pop_front();
                        report.duplicates += 1;
                    }
                    Readiness::Malformed(reason) => {
                        log::warn!("Dropping malformed item {}: {reason}", record.id);
                        queue.pop_front();
                        report.dropped += 1;
                    }
                    Readiness::Ready(offset) => {
                        if let Some((record, _)) = queue.pop_front() {
                            integrate_record(store, record, offset, changes)?;
                            report.integrated += 1;
                            progress = true;
                        }
                    }
                }
            }
        }
    }

    for (_, queue) in queues {
        for (record, since) in queue {
            log::debug!("Item {} waiting on a causal gap", record.id);
            pending.items.push((record, since));
        }
    }

    let retry: Vec<PendingDelete> = pending.deletes.drain(..).collect();
    let incoming = update.delete_set.iter().flat_map(|(client, ranges)| {
        ranges.iter().map(move |r| PendingDelete {
            id: Id::new(client, r.clock),
            len: r.len,
            since: now,
        })
    });
    let all: Vec<PendingDelete> = retry.into_iter().chain(incoming).collect();
    for range in all {
        apply_delete(store, pending, range, changes)?;
    }

    report.pending = pending.items.len();
    report.pending_deletes = pending.deletes.len();
    Ok(report)
}

fn apply_delete(
    store: &mut Store,
    pending: &mut PendingQueue,
    range: PendingDelete,
    changes: &mut Changes,
) -> Result<(), CrdtError> {
    let client = range.id.client;
    let state = store.blocks.get_state(client);
    let end = range.id.clock.saturating_add(range.len);
    let known_end = end.min(state);
    if range.id.clock < known_end {
        store.delete_range(client, range.id.clock, known_end - range.id.clock, changes)?;
    }
    if end > state {
        let start = range.id.clock.max(state);
        pending.deletes.push(PendingDelete {
            id: Id::new(client, start),
            len: end - start,
            since: range.since,
        });
    }
    Ok(())
}
