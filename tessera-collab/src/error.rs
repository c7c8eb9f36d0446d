//! Errors surfaced by the synchronization layer.

use tessera_core::CrdtError;

use crate::persistence::PersistenceError;
use crate::protocol::ProtocolError;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Document id outside `[A-Za-z0-9_:-]{1,128}`.
    InvalidDocumentId(String),
    /// User id outside `[A-Za-z0-9_:-]{1,128}`.
    InvalidUserId(String),
    Protocol(ProtocolError),
    Crdt(CrdtError),
    Persistence(PersistenceError),
    /// The document was evicted after an internal failure.
    DocumentFailed(String),
    ShuttingDown,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidDocumentId(id) => write!(f, "Invalid document id {id:?}"),
            Self::InvalidUserId(id) => write!(f, "Invalid user id {id:?}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::Crdt(e) => write!(f, "Document error: {e}"),
            Self::Persistence(e) => write!(f, "Persistence error: {e}"),
            Self::DocumentFailed(id) => write!(f, "Document {id} failed and was closed"),
            Self::ShuttingDown => write!(f, "Sync manager is shutting down"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<CrdtError> for SyncError {
    fn from(e: CrdtError) -> Self {
        Self::Crdt(e)
    }
}

impl From<PersistenceError> for SyncError {
    fn from(e: PersistenceError) -> Self {
        Self::Persistence(e)
    }
}
