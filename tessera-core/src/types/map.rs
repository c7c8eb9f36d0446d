use serde_json::Value;

use super::{check_depth, check_kind, entry_value, insert_entry, live_entry, materialize, ListRef, TextRef, TypeRef};
use crate::any::Any;
use crate::error::CrdtError;
use crate::item::{BranchId, Content, TypeKind};
use crate::transaction::{ReadTxn, TransactionMut};

/// Collaborative key-value map. Concurrent writes to a key resolve to the
/// entry integrated rightmost in that key's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRef(BranchId);

impl MapRef {
    pub(crate) fn new(id: BranchId) -> Self {
        Self(id)
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.0
    }

    pub fn insert(&self, txn: &mut TransactionMut<'_>, key: &str, value: impl Into<Any>) -> Result<(), CrdtError> {
        check_kind(txn.store(), &self.0, TypeKind::Map)?;
        let values = vec![value.into()];
        check_depth(&values)?;
        insert_entry(txn, &self.0, key, Content::Any(values))?;
        Ok(())
    }

    fn insert_type(&self, txn: &mut TransactionMut<'_>, key: &str, kind: TypeKind) -> Result<BranchId, CrdtError> {
        check_kind(txn.store(), &self.0, TypeKind::Map)?;
        let id = insert_entry(txn, &self.0, key, Content::Type(kind))?;
        Ok(BranchId::Nested(id))
    }

    pub fn insert_text(&self, txn: &mut TransactionMut<'_>, key: &str) -> Result<TextRef, CrdtError> {
        self.insert_type(txn, key, TypeKind::Text).map(TextRef::new)
    }

    pub fn insert_list(&self, txn: &mut TransactionMut<'_>, key: &str) -> Result<ListRef, CrdtError> {
        self.insert_type(txn, key, TypeKind::List).map(ListRef::new)
    }

    pub fn insert_map(&self, txn: &mut TransactionMut<'_>, key: &str) -> Result<MapRef, CrdtError> {
        self.insert_type(txn, key, TypeKind::Map).map(MapRef::new)
    }

    /// Tombstone the live entry under `key`. Returns whether one existed.
    pub fn remove(&self, txn: &mut TransactionMut<'_>, key: &str) -> Result<bool, CrdtError> {
        check_kind(txn.store(), &self.0, TypeKind::Map)?;
        let Some(id) = live_entry(txn.store(), &self.0, key).map(|item| item.id) else {
            return Ok(false);
        };
        txn.delete_item(id)
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, key: &str) -> Option<Value> {
        let store = txn.store();
        live_entry(store, &self.0, key).and_then(|item| entry_value(store, item))
    }

    /// Handle of the nested type under `key`, if the entry is one.
    pub fn get_type<T: ReadTxn>(&self, txn: &T, key: &str) -> Option<TypeRef> {
        let item = live_entry(txn.store(), &self.0, key)?;
        match item.content {
            Content::Type(kind) => Some(TypeRef::from_branch(BranchId::Nested(item.id), kind)),
            _ => None,
        }
    }

    pub fn contains_key<T: ReadTxn>(&self, txn: &T, key: &str) -> bool {
        live_entry(txn.store(), &self.0, key).is_some()
    }

    /// Live keys in sorted order.
    pub fn keys<T: ReadTxn>(&self, txn: &T) -> Vec<String> {
        let store = txn.store();
        let Some(branch) = store.branch(&self.0) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = branch
            .map
            .keys()
            .filter(|key| live_entry(store, &self.0, key).is_some())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len<T: ReadTxn>(&self, txn: &T) -> usize {
        self.keys(txn).len()
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        self.len(txn) == 0
    }

    pub fn to_json<T: ReadTxn>(&self, txn: &T) -> Value {
        materialize(txn.store(), &self.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::doc::Doc;
    use crate::transaction::Origin;
    use serde_json::json;

    #[test]
    fn test_overwrite_keeps_latest() {
        let mut doc = Doc::new();
        let map = doc.get_or_insert_map("meta");
        let mut txn = doc.transact_mut(Origin::Local).unwrap();
        map.insert(&mut txn, "k", 1).unwrap();
        map.insert(&mut txn, "k", 2).unwrap();
        map.insert(&mut txn, "other", true).unwrap();
        assert_eq!(map.get(&txn, "k"), Some(json!(2)));
        assert_eq!(map.keys(&txn), vec!["k".to_string(), "other".to_string()]);
        assert_eq!(map.to_json(&txn), json!({"k": 2, "other": true}));
    }

    #[test]
    fn test_remove() {
        let mut doc = Doc::new();
        let map = doc.get_or_insert_map("meta");
        let mut txn = doc.transact_mut(Origin::Local).unwrap();
        map.insert(&mut txn, "k", 1).unwrap();
        assert!(map.remove(&mut txn, "k").unwrap());
        assert!(!map.remove(&mut txn, "k").unwrap());
        assert!(!map.contains_key(&txn, "k"));
        assert!(map.is_empty(&txn));
    }

    #[test]
    fn test_nested_text_under_key() {
        let mut doc = Doc::new();
        let map = doc.get_or_insert_map("meta");
        let mut txn = doc.transact_mut(Origin::Local).unwrap();
        let title = map.insert_text(&mut txn, "title").unwrap();
        title.insert(&mut txn, 0, "Q3 plan").unwrap();
        assert_eq!(map.get(&txn, "title"), Some(json!("Q3 plan")));
        map.insert(&mut txn, "title", "plain").unwrap();
        assert_eq!(title.len(&txn), 0);
        assert_eq!(map.get(&txn, "title"), Some(json!("plain")));
    }
}
