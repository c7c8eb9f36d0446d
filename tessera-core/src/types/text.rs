use serde_json::Value;

use super::{check_kind, insert_at, materialize};
use crate::error::CrdtError;
use crate::id::Clock;
use crate::item::{BranchId, Content, TypeKind};
use crate::transaction::{ReadTxn, TransactionMut};

/// Collaborative text. Positions count `char`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRef(BranchId);

impl TextRef {
    pub(crate) fn new(id: BranchId) -> Self {
        Self(id)
    }

    pub fn branch_id(&self) -> &BranchId {
        &self.0
    }

    pub fn insert(&self, txn: &mut TransactionMut<'_>, index: Clock, chunk: &str) -> Result<(), CrdtError> {
        check_kind(txn.store(), &self.0, TypeKind::Text)?;
        insert_at(txn, &self.0, index, Content::String(chunk.to_string()))?;
        Ok(())
    }

    /// Append at the end.
    pub fn push(&self, txn: &mut TransactionMut<'_>, chunk: &str) -> Result<(), CrdtError> {
        let len = self.len(&*txn);
        self.insert(txn, len, chunk)
    }

    pub fn remove_range(&self, txn: &mut TransactionMut<'_>, index: Clock, len: Clock) -> Result<(), CrdtError> {
        check_kind(txn.store(), &self.0, TypeKind::Text)?;
        txn.delete_at(&self.0, index, len)
    }

    pub fn len<T: ReadTxn>(&self, txn: &T) -> Clock {
        txn.store().branch(&self.0).map(|b| b.len).unwrap_or(0)
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        self.len(txn) == 0
    }

    pub fn get_string<T: ReadTxn>(&self, txn: &T) -> String {
        match materialize(txn.store(), &self.0) {
            Value::String(s) => s,
            _ => String::new(),
        }
    }

    pub fn to_json<T: ReadTxn>(&self, txn: &T) -> Value {
        materialize(txn.store(), &self.0)
    }
}
