//! CRDT engine errors.

use crate::id::Id;
use crate::item::TypeKind;

/// Errors raised by document operations.
///
/// Malformed items inside an otherwise valid update are not errors: they are
/// dropped, logged and counted in the apply report. `Corrupted` signals a
/// broken store invariant and is fatal for the document it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum CrdtError {
    /// Outer update or state-vector encoding could not be decoded.
    Decode(String),
    /// A value could not be encoded.
    Encode(String),
    /// Position beyond the visible length of a sequence type.
    IndexOutOfBounds { index: u32, len: u32 },
    /// Operation does not apply to this kind of shared type.
    TypeMismatch { expected: TypeKind, found: TypeKind },
    /// The shared type no longer exists in this document.
    UnknownType(String),
    /// The document has been destroyed.
    Destroyed,
    /// A store invariant does not hold.
    Corrupted(String),
}

impl CrdtError {
    pub(crate) fn missing(id: Id) -> Self {
        CrdtError::Corrupted(format!("item {id} expected in store"))
    }
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::Encode(e) => write!(f, "Encode error: {e}"),
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "Index {index} out of bounds for length {len}")
            }
            Self::TypeMismatch { expected, found } => {
                write!(f, "Type mismatch: expected {expected}, found {found}")
            }
            Self::UnknownType(name) => write!(f, "Unknown shared type: {name}"),
            Self::Destroyed => write!(f, "Document destroyed"),
            Self::Corrupted(e) => write!(f, "Store corrupted: {e}"),
        }
    }
}

impl std::error::Error for CrdtError {}
