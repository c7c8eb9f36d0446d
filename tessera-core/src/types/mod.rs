//! Shared types: text, list and map handles.
//!
//! Handles are plain branch addresses. Reads take any [`ReadTxn`], writes
//! take the open [`TransactionMut`].

mod list;
mod map;
mod text;

pub use list::ListRef;
pub use map::MapRef;
pub use text::TextRef;

use serde_json::{Map, Value};

use crate::any::{Any, MAX_DEPTH};
use crate::error::CrdtError;
use crate::id::{Clock, Id};
use crate::item::{BranchId, Content, Item, TypeKind};
use crate::store::Store;
use crate::transaction::{ReadTxn, TransactionMut};

/// Any shared type handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeRef {
    Text(TextRef),
    List(ListRef),
    Map(MapRef),
}

impl TypeRef {
    pub(crate) fn from_branch(id: BranchId, kind: TypeKind) -> Self {
        match kind {
            TypeKind::Text => TypeRef::Text(TextRef::new(id)),
            TypeKind::List => TypeRef::List(ListRef::new(id)),
            TypeKind::Map => TypeRef::Map(MapRef::new(id)),
        }
    }

    pub fn branch_id(&self) -> &BranchId {
        match self {
            TypeRef::Text(t) => t.branch_id(),
            TypeRef::List(l) => l.branch_id(),
            TypeRef::Map(m) => m.branch_id(),
        }
    }

    pub fn to_json<T: ReadTxn>(&self, txn: &T) -> Value {
        materialize(txn.store(), self.branch_id())
    }
}

pub(crate) fn check_kind(store: &Store, id: &BranchId, expected: TypeKind) -> Result<(), CrdtError> {
    let branch = store
        .branch(id)
        .ok_or_else(|| CrdtError::UnknownType(id.to_string()))?;
    if branch.kind != expected {
        return Err(CrdtError::TypeMismatch {
            expected,
            found: branch.kind,
        });
    }
    Ok(())
}

/// Reject values peers would refuse to decode.
pub(crate) fn check_depth(values: &[Any]) -> Result<(), CrdtError> {
    match values.iter().map(Any::depth).max() {
        Some(depth) if depth > MAX_DEPTH => Err(CrdtError::Encode(format!(
            "value nested {depth} levels deep, limit is {MAX_DEPTH}"
        ))),
        _ => Ok(()),
    }
}

/// Insert `content` at a visible position of a sequence branch.
pub(crate) fn insert_at(
    txn: &mut TransactionMut<'_>,
    parent: &BranchId,
    index: Clock,
    content: Content,
) -> Result<Option<Id>, CrdtError> {
    let len = content.len();
    if len == 0 {
        return Ok(None);
    }
    let id = txn.next_id(len)?;
    let store = txn.store_mut();
    let (left, right) = store.find_position(parent, index)?;
    let origin = match left {
        Some(l) => Some(
            store
                .blocks
                .get(&l)
                .map(Item::last_id)
                .ok_or_else(|| CrdtError::missing(l))?,
        ),
        None => None,
    };
    let mut item = Item::new(id, origin, right, parent.clone(), None, content);
    item.left = left;
    item.right = right;
    txn.integrate(item)?;
    Ok(Some(id))
}

/// Write `content` under `key` of a map branch.
pub(crate) fn insert_entry(
    txn: &mut TransactionMut<'_>,
    parent: &BranchId,
    key: &str,
    content: Content,
) -> Result<Id, CrdtError> {
    let id = txn.next_id(1)?;
    let head = txn
        .store()
        .branch(parent)
        .ok_or_else(|| CrdtError::UnknownType(parent.to_string()))?
        .map
        .get(key)
        .copied();
    let mut item = Item::new(id, head, None, parent.clone(), Some(key.to_string()), content);
    item.left = head;
    txn.integrate(item)?;
    Ok(id)
}

/// Live item under `key`, if any.
pub(crate) fn live_entry<'a>(store: &'a Store, parent: &BranchId, key: &str) -> Option<&'a Item> {
    let head = store.branch(parent)?.map.get(key)?;
    store.blocks.get(head).filter(|item| !item.deleted)
}

/// A materialized value, or a nested branch still to be projected.
enum Slot {
    Ready(Value),
    Branch(BranchId),
}

fn entry_slot(item: &Item) -> Option<Slot> {
    match &item.content {
        Content::Any(values) => values.last().map(|v| Slot::Ready(v.to_json())),
        Content::String(s) => Some(Slot::Ready(Value::String(s.clone()))),
        Content::Type(_) => Some(Slot::Branch(BranchId::Nested(item.id))),
        Content::Deleted(_) => None,
    }
}

/// JSON value of one map entry or list element run.
pub(crate) fn entry_value(store: &Store, item: &Item) -> Option<Value> {
    entry_slot(item).map(|slot| match slot {
        Slot::Ready(value) => value,
        Slot::Branch(id) => materialize(store, &id),
    })
}

/// One branch being projected: its remaining slots and what is done.
struct Frame {
    kind: Option<TypeKind>,
    slots: std::vec::IntoIter<(Option<String>, Slot)>,
    done: Vec<(Option<String>, Value)>,
    descended: Option<String>,
}

impl Frame {
    fn open(store: &Store, id: &BranchId) -> Self {
        let Some(branch) = store.branch(id) else {
            return Self::with(None, Vec::new());
        };
        let mut slots = Vec::new();
        match branch.kind {
            TypeKind::Text => {
                let mut s = String::new();
                for item in store.iter_branch(id).filter(|i| !i.deleted) {
                    if let Content::String(run) = &item.content {
                        s.push_str(run);
                    }
                }
                slots.push((None, Slot::Ready(Value::String(s))));
            }
            TypeKind::List => {
                for item in store.iter_branch(id).filter(|i| !i.deleted) {
                    match &item.content {
                        Content::Any(values) => {
                            slots.extend(values.iter().map(|v| (None, Slot::Ready(v.to_json()))))
                        }
                        Content::Type(_) => slots.push((None, Slot::Branch(BranchId::Nested(item.id)))),
                        Content::String(s) => slots.extend(
                            s.chars()
                                .map(|c| (None, Slot::Ready(Value::String(c.to_string())))),
                        ),
                        Content::Deleted(_) => {}
                    }
                }
            }
            TypeKind::Map => {
                let mut keys: Vec<&String> = branch.map.keys().collect();
                keys.sort();
                for key in keys {
                    if let Some(slot) = live_entry(store, id, key).and_then(entry_slot) {
                        slots.push((Some(key.clone()), slot));
                    }
                }
            }
        }
        Self::with(Some(branch.kind), slots)
    }

    fn with(kind: Option<TypeKind>, slots: Vec<(Option<String>, Slot)>) -> Self {
        Self {
            kind,
            slots: slots.into_iter(),
            done: Vec::new(),
            descended: None,
        }
    }

    fn finish(self) -> Value {
        match self.kind {
            None => Value::Null,
            Some(TypeKind::Text) => self
                .done
                .into_iter()
                .next()
                .map(|(_, v)| v)
                .unwrap_or_else(|| Value::String(String::new())),
            Some(TypeKind::List) => Value::Array(self.done.into_iter().map(|(_, v)| v).collect()),
            Some(TypeKind::Map) => {
                let mut obj = Map::new();
                for (key, value) in self.done {
                    if let Some(key) = key {
                        obj.insert(key, value);
                    }
                }
                Value::Object(obj)
            }
        }
    }
}

/// Project a branch into a plain JSON value.
///
/// Nested branches are walked with an explicit stack, so arbitrarily deep
/// nesting does not grow the call stack.
pub fn materialize(store: &Store, id: &BranchId) -> Value {
    let mut stack = vec![Frame::open(store, id)];
    loop {
        let Some(top) = stack.last_mut() else {
            return Value::Null;
        };
        match top.slots.next() {
            Some((key, Slot::Ready(value))) => top.done.push((key, value)),
            Some((key, Slot::Branch(child))) => {
                top.descended = key;
                stack.push(Frame::open(store, &child));
            }
            None => {
                let Some(frame) = stack.pop() else {
                    return Value::Null;
                };
                let value = frame.finish();
                match stack.last_mut() {
                    Some(parent) => {
                        let key = parent.descended.take();
                        parent.done.push((key, value));
                    }
                    None => return value,
                }
            }
        }
    }
}

/// Value of the element at a visible position of a list branch.
pub(crate) fn element_at(store: &Store, id: &BranchId, index: Clock) -> Option<Value> {
    let mut remaining = index;
    for item in store.iter_branch(id).filter(|i| !i.deleted) {
        if remaining < item.len {
            return match &item.content {
                Content::Any(values) => values.get(remaining as usize).map(|v| v.to_json()),
                Content::Type(_) => Some(materialize(store, &BranchId::Nested(item.id))),
                Content::String(s) => s.chars().nth(remaining as usize).map(|c| Value::String(c.to_string())),
                Content::Deleted(_) => None,
            };
        }
        remaining -= item.len;
    }
    None
}

/// Nested type handle at a visible list position, if that element is one.
pub(crate) fn nested_at(store: &Store, id: &BranchId, index: Clock) -> Option<TypeRef> {
    let mut remaining = index;
    for item in store.iter_branch(id).filter(|i| !i.deleted) {
        if remaining < item.len {
            return match item.content {
                Content::Type(kind) => Some(TypeRef::from_branch(BranchId::Nested(item.id), kind)),
                _ => None,
            };
        }
        remaining -= item.len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Doc;
    use crate::transaction::Origin;
    use serde_json::json;

    #[test]
    fn test_to_json_of_nested_structure() {
        let mut doc = Doc::new();
        let root = doc.get_or_insert_map("root");
        {
            let mut txn = doc.transact_mut(Origin::Local).unwrap();
            root.insert(&mut txn, "title", "grid").unwrap();
            let rows = root.insert_list(&mut txn, "rows").unwrap();
            rows.push(&mut txn, 1).unwrap();
            let note = rows.push_text(&mut txn).unwrap();
            note.insert(&mut txn, 0, "hi").unwrap();
        }
        assert_eq!(
            root.to_json(&doc),
            json!({"title": "grid", "rows": [1, "hi"]})
        );
    }

    #[test]
    fn test_kind_mismatch_reported() {
        let mut doc = Doc::new();
        doc.get_or_insert_map("x");
        let text = doc.get_or_insert_text("x");
        let mut txn = doc.transact_mut(Origin::Local).unwrap();
        assert_eq!(
            text.insert(&mut txn, 0, "a"),
            Err(CrdtError::TypeMismatch {
                expected: TypeKind::Text,
                found: TypeKind::Map
            })
        );
    }

    #[test]
    fn test_materialize_deep_nesting() {
        let mut doc = Doc::new();
        let root = doc.get_or_insert_list("root");
        {
            let mut txn = doc.transact_mut(Origin::Local).unwrap();
            let mut current = root.insert_list(&mut txn, 0).unwrap();
            for _ in 1..2_000 {
                current = current.insert_list(&mut txn, 0).unwrap();
            }
            current.push(&mut txn, 7).unwrap();
        }
        let mut expected = json!([7]);
        for _ in 0..2_000 {
            expected = Value::Array(vec![expected]);
        }
        assert_eq!(root.to_json(&doc), expected);
    }

    #[test]
    fn test_delete_deeply_nested_lists() {
        let mut doc = Doc::new();
        let root = doc.get_or_insert_list("root");
        {
            let mut txn = doc.transact_mut(Origin::Local).unwrap();
            let mut current = root.insert_list(&mut txn, 0).unwrap();
            for _ in 0..100_000 {
                current = current.insert_list(&mut txn, 0).unwrap();
            }
            root.remove_range(&mut txn, 0, 1).unwrap();
        }
        assert_eq!(root.to_json(&doc), json!([]));
    }

    #[test]
    fn test_insert_rejects_too_deep_value() {
        let mut doc = Doc::new();
        let list = doc.get_or_insert_list("l");
        let map = doc.get_or_insert_map("m");
        let mut deep = Any::Null;
        for _ in 0..=MAX_DEPTH {
            deep = Any::Array(vec![deep]);
        }
        let mut txn = doc.transact_mut(Origin::Local).unwrap();
        assert!(matches!(list.push(&mut txn, deep.clone()), Err(CrdtError::Encode(_))));
        assert!(matches!(map.insert(&mut txn, "k", deep), Err(CrdtError::Encode(_))));
        assert_eq!(list.len(&txn), 0);
    }
}
