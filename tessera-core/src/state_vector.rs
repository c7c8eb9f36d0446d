//! State vectors and delete sets.
//!
//! A state vector maps each client to the next clock a replica expects from
//! it, so it fully describes which items the replica has seen. A delete set
//! lists tombstoned id ranges; deletions travel separately from items because
//! they can target items created by any client.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CrdtError;
use crate::id::{ClientId, Clock, Id};

/// `client → next expected clock`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ClientId, Clock>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected clock for `client` (zero if unseen).
    pub fn get(&self, client: ClientId) -> Clock {
        self.0.get(&client).copied().unwrap_or(0)
    }

    /// Raise the entry for `client` to `clock`; never lowers it.
    pub fn set_max(&mut self, client: ClientId, clock: Clock) {
        let entry = self.0.entry(client).or_insert(0);
        if clock > *entry {
            *entry = clock;
        }
    }

    /// Whether the element `id` has been seen.
    pub fn contains(&self, id: &Id) -> bool {
        id.clock < self.get(id.client)
    }

    /// Whether the whole run `id..id + len` has been seen.
    pub fn covers(&self, id: &Id, len: Clock) -> bool {
        id.clock.saturating_add(len) <= self.get(id.client)
    }

    /// Component-wise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (client, clock) in other.iter() {
            self.set_max(client, clock);
        }
    }

    /// Component-wise minimum. Clients absent from either side drop to zero.
    pub fn intersect(&self, other: &StateVector) -> StateVector {
        let mut out = BTreeMap::new();
        for (client, clock) in self.iter() {
            let min = clock.min(other.get(client));
            if min > 0 {
                out.insert(client, min);
            }
        }
        StateVector(out)
    }

    /// Whether every entry of `self` is at least the matching entry of `other`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.iter().all(|(client, clock)| self.get(client) >= clock)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, Clock)> + '_ {
        self.0.iter().map(|(c, k)| (*c, *k))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode to the binary form carried by sync-step-1.
    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        crate::update::encode_value(self)
    }

    /// Decode a state vector. An empty payload is the empty vector.
    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        crate::update::decode_value(bytes)
    }
}

impl FromIterator<(ClientId, Clock)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ClientId, Clock)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (client, clock) in iter {
            sv.set_max(client, clock);
        }
        sv
    }
}

/// A contiguous range of deleted clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRange {
    pub clock: Clock,
    pub len: Clock,
}

impl DeleteRange {
    pub fn end(&self) -> Clock {
        self.clock.saturating_add(self.len)
    }
}

/// Tombstoned ranges grouped by client, sorted and coalesced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSet(BTreeMap<ClientId, Vec<DeleteRange>>);

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `len` deleted elements starting at `id`.
    pub fn insert(&mut self, id: Id, len: Clock) {
        if len == 0 {
            return;
        }
        let ranges = self.0.entry(id.client).or_default();
        ranges.push(DeleteRange { clock: id.clock, len });
        Self::normalize(ranges);
    }

    /// Union with another delete set.
    pub fn merge(&mut self, other: &DeleteSet) {
        for (client, ranges) in other.0.iter() {
            let own = self.0.entry(*client).or_default();
            own.extend(ranges.iter().copied());
            Self::normalize(own);
        }
    }

    fn normalize(ranges: &mut Vec<DeleteRange>) {
        ranges.sort_by_key(|r| r.clock);
        let mut merged: Vec<DeleteRange> = Vec::with_capacity(ranges.len());
        for r in ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.clock <= last.end() => {
                    let end = last.end().max(r.end());
                    last.len = end - last.clock;
                }
                _ => merged.push(r),
            }
        }
        *ranges = merged;
    }

    /// Whether the element `id` is deleted.
    pub fn contains(&self, id: &Id) -> bool {
        self.0
            .get(&id.client)
            .map(|ranges| ranges.iter().any(|r| id.clock >= r.clock && id.clock < r.end()))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &[DeleteRange])> + '_ {
        self.0.iter().map(|(c, r)| (*c, r.as_slice()))
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.0.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|r| r.is_empty())
    }

    /// Total number of ranges across all clients.
    pub fn range_count(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }
}

impl FromIterator<(Id, Clock)> for DeleteSet {
    fn from_iter<T: IntoIterator<Item = (Id, Clock)>>(iter: T) -> Self {
        let mut map: BTreeMap<ClientId, Vec<DeleteRange>> = BTreeMap::new();
        for (id, len) in iter {
            if len > 0 {
                map.entry(id.client)
                    .or_default()
                    .push(DeleteRange { clock: id.clock, len });
            }
        }
        for ranges in map.values_mut() {
            Self::normalize(ranges);
        }
        DeleteSet(map)
    }
}
