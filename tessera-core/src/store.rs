//! Item store: per-client runs of items plus the shared-type registry.
//!
//! Architecture:
//! ```text
//! BlockStore                          types: BranchId → Branch
//! ┌────────┬──────────────────────┐   ┌────────────────────────────┐
//! │ client │ [item][item][item]…  │   │ Root("body")  start ──┐    │
//! │ client │ [item][item]…        │   │ Nested(3#7)   map k → id │
//! └────────┴──────────────────────┘   └───────────────────────┼────┘
//!        ▲ binary search by clock                             │
//!        └──────────── left/right links are Id keys ◄─────────┘
//! ```
//!
//! Each client's items are stored contiguously by clock, so looking up the
//! item containing an `Id` is a binary search. Document order is the linked
//! list formed by `left`/`right`, starting at `Branch::start` (sequences) or
//! at the leftmost item of a key chain (maps).

use std::collections::{HashMap, HashSet};

use crate::error::CrdtError;
use crate::id::{ClientId, Clock, Id};
use crate::item::{BranchId, Content, Item, TypeKind};
use crate::state_vector::{DeleteSet, StateVector};

/// A shared type instance: the head of an item list and/or key chains.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub kind: TypeKind,
    /// First item of the sequence part.
    pub start: Option<Id>,
    /// Map key → most recent (rightmost) item of that key's chain.
    pub map: HashMap<String, Id>,
    /// Visible length of the sequence part.
    pub len: Clock,
}

impl Branch {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            start: None,
            map: HashMap::new(),
            len: 0,
        }
    }
}

/// What a transaction has touched so far.
#[derive(Debug, Clone, Default)]
pub struct Changes {
    pub deleted: DeleteSet,
    pub changed: HashSet<BranchId>,
}

/// Items grouped by originating client, each run sorted by clock.
#[derive(Debug, Clone, Default)]
pub struct BlockStore {
    clients: HashMap<ClientId, Vec<Item>>,
}

impl BlockStore {
    /// Next clock expected from `client`.
    pub fn get_state(&self, client: ClientId) -> Clock {
        self.clients
            .get(&client)
            .and_then(|items| items.last())
            .map(|item| item.id.clock + item.len)
            .unwrap_or(0)
    }

    pub fn state_vector(&self) -> StateVector {
        self.clients
            .keys()
            .map(|client| (*client, self.get_state(*client)))
            .collect()
    }

    fn find_index(items: &[Item], clock: Clock) -> Option<usize> {
        let idx = items.partition_point(|item| item.id.clock <= clock);
        if idx == 0 {
            return None;
        }
        let candidate = &items[idx - 1];
        (clock < candidate.id.clock + candidate.len).then_some(idx - 1)
    }

    /// The item containing `id`.
    pub fn get(&self, id: &Id) -> Option<&Item> {
        let items = self.clients.get(&id.client)?;
        Self::find_index(items, id.clock).map(|idx| &items[idx])
    }

    pub fn get_mut(&mut self, id: &Id) -> Option<&mut Item> {
        let items = self.clients.get_mut(&id.client)?;
        Self::find_index(items, id.clock).map(move |idx| &mut items[idx])
    }

    fn get_required(&self, id: &Id) -> Result<&Item, CrdtError> {
        self.get(id).ok_or_else(|| CrdtError::missing(*id))
    }

    fn get_required_mut(&mut self, id: &Id) -> Result<&mut Item, CrdtError> {
        self.get_mut(id).ok_or_else(|| CrdtError::missing(*id))
    }

    /// Append an item; its clock must continue its client's run.
    pub fn push(&mut self, item: Item) -> Result<(), CrdtError> {
        let expected = self.get_state(item.id.client);
        if item.id.clock != expected {
            return Err(CrdtError::Corrupted(format!(
                "item {} pushed out of order, expected clock {expected}",
                item.id
            )));
        }
        self.clients.entry(item.id.client).or_default().push(item);
        Ok(())
    }

    /// Items of one client in clock order.
    pub fn client_items(&self, client: ClientId) -> &[Item] {
        self.clients.get(&client).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> + '_ {
        self.clients.values().flat_map(|items| items.iter())
    }

    /// Number of stored runs.
    pub fn item_count(&self) -> usize {
        self.clients.values().map(Vec::len).sum()
    }

    /// Split the item starting at `start` so that a new item begins at
    /// `start.clock + offset`. Returns the id of the right part.
    pub fn split(&mut self, start: &Id, offset: Clock) -> Result<Id, CrdtError> {
        let items = self
            .clients
            .get_mut(&start.client)
            .ok_or_else(|| CrdtError::missing(*start))?;
        let idx = Self::find_index(items, start.clock).ok_or_else(|| CrdtError::missing(*start))?;
        let left = &mut items[idx];
        if left.id != *start {
            return Err(CrdtError::Corrupted(format!("{start} is not the start of an item")));
        }
        let content = left
            .content
            .split(offset)
            .ok_or_else(|| CrdtError::Corrupted(format!("cannot split {start} at offset {offset}")))?;
        let right_id = Id::new(start.client, start.clock + offset);
        let right = Item {
            id: right_id,
            len: left.len - offset,
            origin: Some(Id::new(start.client, right_id.clock - 1)),
            right_origin: left.right_origin,
            left: Some(left.id),
            right: left.right,
            parent: left.parent.clone(),
            parent_sub: left.parent_sub.clone(),
            content,
            deleted: left.deleted,
        };
        left.len = offset;
        left.right = Some(right_id);
        let next = right.right;
        items.insert(idx + 1, right);
        if let Some(next) = next {
            self.get_required_mut(&next)?.left = Some(right_id);
        }
        Ok(right_id)
    }

    /// Make `id` the first element of an item, splitting if needed.
    pub fn clean_start(&mut self, id: &Id) -> Result<Id, CrdtError> {
        let start = self.get_required(id)?.id;
        if start == *id {
            return Ok(start);
        }
        self.split(&start, id.clock - start.clock)
    }

    /// Make `id` the last element of an item, splitting if needed.
    /// Returns the start id of the item ending at `id`.
    pub fn clean_end(&mut self, id: &Id) -> Result<Id, CrdtError> {
        let item = self.get_required(id)?;
        let start = item.id;
        if item.last_id() != *id {
            self.split(&start, id.clock - start.clock + 1)?;
        }
        Ok(start)
    }

    /// Merge the item at `idx` with its successor if they form one run.
    fn try_merge_at(&mut self, client: ClientId, idx: usize) -> Result<bool, CrdtError> {
        let Some(items) = self.clients.get_mut(&client) else {
            return Ok(false);
        };
        if idx + 1 >= items.len() {
            return Ok(false);
        }
        let (l, r) = (&items[idx], &items[idx + 1]);
        let mergeable = r.id.clock == l.id.clock + l.len
            && l.right == Some(r.id)
            && r.origin == Some(l.last_id())
            && r.right_origin == l.right_origin
            && l.deleted == r.deleted
            && l.parent == r.parent
            && l.parent_sub.is_none()
            && r.parent_sub.is_none()
            && l.content.can_merge(&r.content);
        if !mergeable {
            return Ok(false);
        }
        let right = items.remove(idx + 1);
        let left = &mut items[idx];
        left.content.try_merge(&right.content);
        left.len += right.len;
        left.right = right.right;
        let left_id = left.id;
        if let Some(next) = right.right {
            self.get_required_mut(&next)?.left = Some(left_id);
        }
        Ok(true)
    }

    /// Merge adjacent runs of `client` overlapping `from..=to`.
    pub fn merge_range(&mut self, client: ClientId, from: Clock, to: Clock) -> Result<usize, CrdtError> {
        let mut idx = self
            .client_items(client)
            .partition_point(|item| item.id.clock + item.len <= from)
            .saturating_sub(1);
        let mut merged = 0;
        loop {
            let items = self.client_items(client);
            if idx + 1 >= items.len() || items[idx + 1].id.clock > to {
                break;
            }
            if self.try_merge_at(client, idx)? {
                merged += 1;
            } else {
                idx += 1;
            }
        }
        Ok(merged)
    }

    fn items_mut(&mut self) -> impl Iterator<Item = &mut Item> + '_ {
        self.clients.values_mut().flat_map(|items| items.iter_mut())
    }

    pub(crate) fn clear(&mut self) {
        self.clients.clear();
    }
}

/// Walks a branch's sequence in document order.
pub struct BranchIter<'a> {
    blocks: &'a BlockStore,
    next: Option<Id>,
}

impl<'a> Iterator for BranchIter<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let item = self.blocks.get(&id)?;
        self.next = item.right;
        Some(item)
    }
}

/// An item that garbage collection may purge.
pub struct GcCandidate<'a> {
    pub id: Id,
    pub len: Clock,
    pub parent: &'a BranchId,
    pub content: &'a Content,
}

/// Block store plus the shared-type registry.
#[derive(Debug, Clone, Default)]
pub struct Store {
    pub blocks: BlockStore,
    pub types: HashMap<BranchId, Branch>,
}

impl Store {
    pub fn branch(&self, id: &BranchId) -> Option<&Branch> {
        self.types.get(id)
    }

    fn branch_required(&self, id: &BranchId) -> Result<&Branch, CrdtError> {
        self.types
            .get(id)
            .ok_or_else(|| CrdtError::UnknownType(id.to_string()))
    }

    fn branch_required_mut(&mut self, id: &BranchId) -> Result<&mut Branch, CrdtError> {
        self.types
            .get_mut(id)
            .ok_or_else(|| CrdtError::UnknownType(id.to_string()))
    }

    /// Root type `name`, created with `kind` on first reference.
    ///
    /// A root keeps the kind it was first defined with.
    pub fn get_or_create_root(&mut self, name: &str, kind: TypeKind) -> BranchId {
        let id = BranchId::Root(name.to_string());
        let branch = self.types.entry(id.clone()).or_insert_with(|| Branch::new(kind));
        if branch.kind != kind {
            log::warn!("Root type {name} is a {}, requested as {kind}", branch.kind);
        }
        id
    }

    /// Resolve the branch a nested item belongs to.
    ///
    /// A type whose anchor was garbage collected no longer carries its kind;
    /// late children are attached to a detached placeholder branch so they
    /// keep a position without becoming visible.
    pub fn resolve_nested(&mut self, anchor: Id) -> Option<BranchId> {
        let id = BranchId::Nested(anchor);
        if self.types.contains_key(&id) {
            return Some(id);
        }
        let item = self.blocks.get(&anchor)?;
        match item.content {
            Content::Type(kind) if item.id == anchor => {
                self.types.insert(id.clone(), Branch::new(kind));
                Some(id)
            }
            Content::Deleted(_) => {
                self.types.insert(id.clone(), Branch::new(TypeKind::List));
                Some(id)
            }
            _ => None,
        }
    }

    /// Items of a branch's sequence in document order (tombstones included).
    pub fn iter_branch(&self, id: &BranchId) -> BranchIter<'_> {
        BranchIter {
            blocks: &self.blocks,
            next: self.types.get(id).and_then(|b| b.start),
        }
    }

    /// Leftmost item of a map key chain.
    fn chain_start(&self, parent: &BranchId, key: &str) -> Result<Option<Id>, CrdtError> {
        let mut cur = self.branch_required(parent)?.map.get(key).copied();
        while let Some(id) = cur {
            match self.blocks.get_required(&id)?.left {
                Some(left) => cur = Some(left),
                None => break,
            }
        }
        Ok(cur)
    }

    /// Position an item between its neighbors and link it in.
    ///
    /// `item.left` / `item.right` must already be the clean start ids of the
    /// items holding `origin` / `right_origin`. Concurrent items found
    /// between them are ordered by the YATA rules; among siblings with the
    /// same origin the higher client id is placed first.
    pub fn integrate(&mut self, mut item: Item, changes: &mut Changes) -> Result<(), CrdtError> {
        let parent = item.parent.clone();
        self.branch_required(&parent)?;

        let needs_scan = match (item.left, item.right) {
            (None, None) => true,
            (None, Some(r)) => self.blocks.get_required(&r)?.left.is_some(),
            (Some(l), right) => self.blocks.get_required(&l)?.right != right,
        };

        if needs_scan {
            let mut left = item.left;
            let mut o = match (item.left, &item.parent_sub) {
                (Some(l), _) => self.blocks.get_required(&l)?.right,
                (None, Some(key)) => self.chain_start(&parent, key)?,
                (None, None) => self.branch_required(&parent)?.start,
            };
            let mut conflicting: HashSet<Id> = HashSet::new();
            let mut before_origin: HashSet<Id> = HashSet::new();
            while let Some(oid) = o {
                if Some(oid) == item.right {
                    break;
                }
                let other = self.blocks.get_required(&oid)?;
                before_origin.insert(oid);
                conflicting.insert(oid);
                if other.origin == item.origin {
                    if other.id.client > item.id.client {
                        left = Some(oid);
                        conflicting.clear();
                    } else if other.right_origin == item.right_origin {
                        break;
                    }
                } else {
                    let origin_start = other.origin.and_then(|oo| self.blocks.get(&oo)).map(|i| i.id);
                    match origin_start {
                        Some(start) if before_origin.contains(&start) => {
                            if !conflicting.contains(&start) {
                                left = Some(oid);
                                conflicting.clear();
                            }
                        }
                        _ => break,
                    }
                }
                o = other.right;
            }
            item.left = left;
        }

        let id = item.id;
        if let Some(l) = item.left {
            let left_item = self.blocks.get_required_mut(&l)?;
            item.right = left_item.right;
            left_item.right = Some(id);
        } else {
            item.right = match &item.parent_sub {
                Some(key) => self.chain_start(&parent, key)?,
                None => {
                    let branch = self.branch_required_mut(&parent)?;
                    let old = branch.start;
                    branch.start = Some(id);
                    old
                }
            };
        }

        let mut replaced = None;
        if let Some(r) = item.right {
            self.blocks.get_required_mut(&r)?.left = Some(id);
        } else if let Some(key) = &item.parent_sub {
            self.branch_required_mut(&parent)?.map.insert(key.clone(), id);
            replaced = item.left;
        }

        if item.is_collected() {
            item.deleted = true;
            changes.deleted.insert(id, item.len);
        }
        if item.parent_sub.is_none() && !item.deleted {
            self.branch_required_mut(&parent)?.len += item.len;
        }
        if let Content::Type(kind) = item.content {
            self.types
                .entry(BranchId::Nested(id))
                .or_insert_with(|| Branch::new(kind));
        }

        let overwritten = item.parent_sub.is_some() && item.right.is_some();
        self.blocks.push(item)?;
        changes.changed.insert(parent);

        if let Some(previous) = replaced {
            self.delete_item(previous, changes)?;
        }
        if overwritten {
            self.delete_item(id, changes)?;
        }
        Ok(())
    }

    /// Ids of every item directly owned by a branch.
    fn branch_children(&self, id: &BranchId) -> Result<Vec<Id>, CrdtError> {
        let Some(branch) = self.types.get(id) else {
            return Ok(Vec::new());
        };
        let mut children: Vec<Id> = self.iter_branch(id).map(|item| item.id).collect();
        for head in branch.map.values() {
            let mut cur = Some(*head);
            while let Some(c) = cur {
                children.push(c);
                cur = self.blocks.get_required(&c)?.left;
            }
        }
        Ok(children)
    }

    /// Tombstone the item starting at `start`. Nested types take their
    /// children with them. Returns false if it was already deleted.
    pub fn delete_item(&mut self, start: Id, changes: &mut Changes) -> Result<bool, CrdtError> {
        let Some(nested) = self.tombstone(start, changes)? else {
            return Ok(false);
        };
        let mut branches = if nested { vec![BranchId::Nested(start)] } else { Vec::new() };
        while let Some(branch) = branches.pop() {
            for child in self.branch_children(&branch)? {
                if self.tombstone(child, changes)? == Some(true) {
                    branches.push(BranchId::Nested(child));
                }
            }
        }
        Ok(true)
    }

    /// Flag one item deleted. `None` if it already was, otherwise whether
    /// it anchors a nested type.
    fn tombstone(&mut self, start: Id, changes: &mut Changes) -> Result<Option<bool>, CrdtError> {
        let item = self.blocks.get_required_mut(&start)?;
        if item.deleted {
            return Ok(None);
        }
        item.deleted = true;
        let (id, len, parent) = (item.id, item.len, item.parent.clone());
        let countable = item.parent_sub.is_none();
        let nested = matches!(item.content, Content::Type(_));

        if countable {
            if let Some(branch) = self.types.get_mut(&parent) {
                branch.len = branch.len.saturating_sub(len);
            }
        }
        changes.deleted.insert(id, len);
        changes.changed.insert(parent);
        Ok(Some(nested))
    }

    /// Tombstone the id range `clock..clock + len` of `client`, splitting
    /// runs at the range boundaries. Every id must already be integrated.
    pub fn delete_range(
        &mut self,
        client: ClientId,
        clock: Clock,
        len: Clock,
        changes: &mut Changes,
    ) -> Result<(), CrdtError> {
        let end = clock.saturating_add(len);
        let mut cur = clock;
        while cur < end {
            let at = Id::new(client, cur);
            let (start, item_len, deleted) = {
                let item = self.blocks.get_required(&at)?;
                (item.id, item.len, item.deleted)
            };
            if deleted {
                cur = start.clock + item_len;
                continue;
            }
            let start = self.blocks.clean_start(&at)?;
            let mut here = self.blocks.get_required(&start)?.len;
            if cur + here > end {
                self.blocks.split(&start, end - cur)?;
                here = end - cur;
            }
            self.delete_item(start, changes)?;
            cur += here;
        }
        Ok(())
    }

    /// Visible position → `(left, right)` neighbors, splitting a run if the
    /// position falls inside it.
    pub fn find_position(&mut self, parent: &BranchId, index: Clock) -> Result<(Option<Id>, Option<Id>), CrdtError> {
        let branch = self.branch_required(parent)?;
        let total = branch.len;
        let mut cur = branch.start;
        let mut left = None;
        let mut remaining = index;
        while let Some(id) = cur {
            if remaining == 0 {
                break;
            }
            let item = self.blocks.get_required(&id)?;
            let visible = item.visible_len();
            let next = item.right;
            if visible > 0 {
                if remaining < visible {
                    let right = self.blocks.split(&id, remaining)?;
                    return Ok((Some(id), Some(right)));
                }
                remaining -= visible;
            }
            left = Some(id);
            cur = next;
        }
        if remaining > 0 {
            return Err(CrdtError::IndexOutOfBounds { index, len: total });
        }
        Ok((left, cur))
    }

    /// Tombstone `len` visible elements starting at `index`.
    pub fn delete_at(
        &mut self,
        parent: &BranchId,
        index: Clock,
        len: Clock,
        changes: &mut Changes,
    ) -> Result<(), CrdtError> {
        let total = self.branch_required(parent)?.len;
        if index.checked_add(len).map_or(true, |end| end > total) {
            return Err(CrdtError::IndexOutOfBounds {
                index: index.saturating_add(len),
                len: total,
            });
        }
        if len == 0 {
            return Ok(());
        }
        let (_, mut cur) = self.find_position(parent, index)?;
        let mut remaining = len;
        while remaining > 0 {
            let Some(id) = cur else {
                return Err(CrdtError::Corrupted(format!("{parent} shorter than its length")));
            };
            let item = self.blocks.get_required(&id)?;
            let visible = item.visible_len();
            if visible == 0 {
                cur = item.right;
                continue;
            }
            if visible > remaining {
                self.blocks.split(&id, remaining)?;
            }
            let here = visible.min(remaining);
            self.delete_item(id, changes)?;
            remaining -= here;
            cur = self.blocks.get_required(&id)?.right;
        }
        Ok(())
    }

    /// Every tombstoned range in the store.
    pub fn delete_set(&self) -> DeleteSet {
        self.blocks
            .iter()
            .filter(|item| item.deleted)
            .map(|item| (item.id, item.len))
            .collect()
    }

    /// Discard the content of tombstones covered by `floor` and accepted by
    /// `filter`. With a `scope`, only tombstones inside it are considered.
    /// Ids, lengths and links are kept, so positions never shift.
    pub fn collect_garbage(
        &mut self,
        floor: &StateVector,
        scope: Option<&DeleteSet>,
        filter: &dyn Fn(&GcCandidate<'_>) -> bool,
    ) -> usize {
        let mut touched: HashSet<ClientId> = HashSet::new();
        let mut purged = 0;
        for item in self.blocks.items_mut() {
            if !item.deleted || item.is_collected() || !floor.covers(&item.id, item.len) {
                continue;
            }
            if scope.is_some_and(|ds| !ds.contains(&item.id)) {
                continue;
            }
            let candidate = GcCandidate {
                id: item.id,
                len: item.len,
                parent: &item.parent,
                content: &item.content,
            };
            if !filter(&candidate) {
                continue;
            }
            item.content = Content::Deleted(item.len);
            touched.insert(item.id.client);
            purged += 1;
        }
        for client in touched {
            let end = self.blocks.get_state(client);
            if let Err(e) = self.blocks.merge_range(client, 0, end) {
                log::error!("Merging collected runs of client {client} failed: {e}");
            }
        }
        purged
    }

    pub(crate) fn clear(&mut self) {
        self.blocks.clear();
        self.types.clear();
    }
}
