use serde_json::Value;

use super::{check_depth, check_kind, element_at, insert_at, materialize, nested_at, MapRef, TextRef, TypeRef};
use crate::any::Any;
use crate::error::CrdtError;
use crate::id::Clock;
use crate::item::{BranchId, Content, TypeKind};
use crate::transaction::{ReadTxn, TransactionMut};

/// Collaborative list of plain values and nested types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRef(BranchId);

impl ListRef {
    pub(crate) fn new(id: BranchId) -> Self {
        Self(id)
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.0
    }

    /// Insert a run of values at `index`.
    pub fn insert_range(
        &self,
        txn: &mut TransactionMut<'_>,
        index: Clock,
        values: Vec<Any>,
    ) -> Result<(), CrdtError> {
        check_kind(txn.store(), &self.0, TypeKind::List)?;
        check_depth(&values)?;
        insert_at(txn, &self.0, index, Content::Any(values))?;
        Ok(())
    }

    pub fn insert(&self, txn: &mut TransactionMut<'_>, index: Clock, value: impl Into<Any>) -> Result<(), CrdtError> {
        self.insert_range(txn, index, vec![value.into()])
    }

    pub fn push(&self, txn: &mut TransactionMut<'_>, value: impl Into<Any>) -> Result<(), CrdtError> {
        let len = self.len(&*txn);
        self.insert(txn, len, value)
    }

    fn insert_type(&self, txn: &mut TransactionMut<'_>, index: Clock, kind: TypeKind) -> Result<BranchId, CrdtError> {
        check_kind(txn.store(), &self.0, TypeKind::List)?;
        let id = insert_at(txn, &self.0, index, Content::Type(kind))?
            .ok_or_else(|| CrdtError::Corrupted("nested type insert produced no item".into()))?;
        Ok(BranchId::Nested(id))
    }

    pub fn insert_text(&self, txn: &mut TransactionMut<'_>, index: Clock) -> Result<TextRef, CrdtError> {
        self.insert_type(txn, index, TypeKind::Text).map(TextRef::new)
    }

    pub fn insert_list(&self, txn: &mut TransactionMut<'_>, index: Clock) -> Result<ListRef, CrdtError> {
        self.insert_type(txn, index, TypeKind::List).map(ListRef::new)
    }

    pub fn insert_map(&self, txn: &mut TransactionMut<'_>, index: Clock) -> Result<MapRef, CrdtError> {
        self.insert_type(txn, index, TypeKind::Map).map(MapRef::new)
    }

    /// Append a nested text.
    pub fn push_text(&self, txn: &mut TransactionMut<'_>) -> Result<TextRef, CrdtError> {
        let len = self.len(&*txn);
        self.insert_text(txn, len)
    }

    pub fn remove_range(&self, txn: &mut TransactionMut<'_>, index: Clock, len: Clock) -> Result<(), CrdtError> {
        check_kind(txn.store(), &self.0, TypeKind::List)?;
        txn.delete_at(&self.0, index, len)
    }

    pub fn get<T: ReadTxn>(&self, txn: &T, index: Clock) -> Option<Value> {
        element_at(txn.store(), &self.0, index)
    }

    /// Handle of the nested type at `index`, if that element is one.
    pub fn get_type<T: ReadTxn>(&self, txn: &T, index: Clock) -> Option<TypeRef> {
        nested_at(txn.store(), &self.0, index)
    }

    pub fn len<T: ReadTxn>(&self, txn: &T) -> Clock {
        txn.store().branch(&self.0).map(|b| b.len).unwrap_or(0)
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
    use crate::any::Any;
    use crate::doc::Doc;
    use crate::transaction::Origin;
    use crate::types::TypeRef;
    use serde_json::json;

    #[test]
    fn test_insert_push_remove() {
        let mut doc = Doc::new();
        let list = doc.get_or_insert_list("items");
        let mut txn = doc.transact_mut(Origin::Local).unwrap();
        list.push(&mut txn, 1).unwrap();
        list.push(&mut txn, "three").unwrap();
        list.insert(&mut txn, 1, 2.5).unwrap();
        list.insert_range(&mut txn, 0, vec![Any::Null, Any::Bool(true)]).unwrap();
        assert_eq!(list.to_json(&txn), json!([null, true, 1, 2.5, "three"]));
        list.remove_range(&mut txn, 1, 3).unwrap();
        assert_eq!(list.to_json(&txn), json!([null, "three"]));
        assert_eq!(list.get(&txn, 1), Some(json!("three")));
        assert_eq!(list.get(&txn, 2), None);
    }

    #[test]
    fn test_nested_types() {
        let mut doc = Doc::new();
        let list = doc.get_or_insert_list("items");
        let mut txn = doc.transact_mut(Origin::Local).unwrap();
        let map = list.insert_map(&mut txn, 0).unwrap();
        map.insert(&mut txn, "k", "v").unwrap();
        let inner = list.insert_list(&mut txn, 1).unwrap();
        inner.push(&mut txn, 7).unwrap();
        assert_eq!(list.to_json(&txn), json!([{"k": "v"}, [7]]));
        assert!(matches!(list.get_type(&txn, 0), Some(TypeRef::Map(_))));
    }

    #[test]
    fn test_removing_nested_type_deletes_children() {
        let mut doc = Doc::new();
        let list = doc.get_or_insert_list("items");
        let mut txn = doc.transact_mut(Origin::Local).unwrap();
        let text = list.insert_text(&mut txn, 0).unwrap();
        text.insert(&mut txn, 0, "gone").unwrap();
        list.remove_range(&mut txn, 0, 1).unwrap();
        assert_eq!(list.len(&txn), 0);
        assert_eq!(text.len(&txn), 0);
    }
}
