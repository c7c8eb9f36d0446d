//! Replicated items: the substrate every shared type is built on.
//!
//! An item is a run of content inserted by one client. It records the
//! neighbors it was inserted between (`origin` / `right_origin`, immutable)
//! and its current neighbors (`left` / `right`, rewired as concurrent items
//! integrate). Neighbor links are keys into the block store, never aliases.
//!
//! Reference: Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared
//! Editing on Extensible Data Types" (YATA), 2016

use serde::{Deserialize, Serialize};

use crate::any::Any;
use crate::id::{Clock, Id};

/// Kind of a shared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    Text,
    List,
    Map,
}

impl std::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeKind::Text => write!(f, "text"),
            TypeKind::List => write!(f, "list"),
            TypeKind::Map => write!(f, "map"),
        }
    }
}

/// Address of a shared type instance.
///
/// Root types are named; nested types are anchored on the item that holds
/// them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BranchId {
    Root(String),
    Nested(Id),
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchId::Root(name) => write!(f, "root:{name}"),
            BranchId::Nested(id) => write!(f, "nested:{id}"),
        }
    }
}

/// Item payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content {
    /// A run of text; one element per `char`.
    String(String),
    /// Embedded values; one element per value.
    Any(Vec<Any>),
    /// Anchor of a nested shared type.
    Type(TypeKind),
    /// Content discarded by garbage collection, length retained.
    Deleted(Clock),
}

impl Content {
    /// Number of id-space elements this content occupies.
    pub fn len(&self) -> Clock {
        match self {
            Content::String(s) => s.chars().count() as Clock,
            Content::Any(values) => values.len() as Clock,
            Content::Type(_) => 1,
            Content::Deleted(len) => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split off everything from `offset` on, leaving `[0, offset)` in place.
    ///
    /// Returns `None` for unsplittable content or an out-of-range offset.
    pub fn split(&mut self, offset: Clock) -> Option<Content> {
        if offset == 0 || offset >= self.len() {
            return None;
        }
        match self {
            Content::String(s) => {
                let byte = s.char_indices().nth(offset as usize).map(|(i, _)| i)?;
                Some(Content::String(s.split_off(byte)))
            }
            Content::Any(values) => Some(Content::Any(values.split_off(offset as usize))),
            Content::Deleted(len) => {
                let rest = *len - offset;
                *len = offset;
                Some(Content::Deleted(rest))
            }
            Content::Type(_) => None,
        }
    }

    /// Copy of the content starting at `offset`.
    pub fn slice_from(&self, offset: Clock) -> Option<Content> {
        let mut copy = self.clone();
        copy.split(offset)
    }

    /// Append `other` if both runs are of a mergeable kind.
    pub fn try_merge(&mut self, other: &Content) -> bool {
        match (self, other) {
            (Content::String(a), Content::String(b)) => {
                a.push_str(b);
                true
            }
            (Content::Any(a), Content::Any(b)) => {
                a.extend(b.iter().cloned());
                true
            }
            (Content::Deleted(a), Content::Deleted(b)) => {
                *a += *b;
                true
            }
            _ => false,
        }
    }

    /// Whether merging with `other` is possible without performing it.
    pub fn can_merge(&self, other: &Content) -> bool {
        matches!(
            (self, other),
            (Content::String(_), Content::String(_))
                | (Content::Any(_), Content::Any(_))
                | (Content::Deleted(_), Content::Deleted(_))
        )
    }
}

/// A replicated item living in the block store.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: Id,
    pub len: Clock,
    /// Last element of the left neighbor at insertion time.
    pub origin: Option<Id>,
    /// First element of the right neighbor at insertion time.
    pub right_origin: Option<Id>,
    /// Current left neighbor (start id of that item).
    pub left: Option<Id>,
    /// Current right neighbor (start id of that item).
    pub right: Option<Id>,
    pub parent: BranchId,
    /// Map key when the parent is a map.
    pub parent_sub: Option<String>,
    pub content: Content,
    pub deleted: bool,
}

impl Item {
    pub fn new(
        id: Id,
        origin: Option<Id>,
        right_origin: Option<Id>,
        parent: BranchId,
        parent_sub: Option<String>,
        content: Content,
    ) -> Self {
        Self {
            id,
            len: content.len(),
            origin,
            right_origin,
            left: None,
            right: None,
            parent,
            parent_sub,
            content,
            deleted: false,
        }
    }

    /// Id of the last element in this run.
    pub fn last_id(&self) -> Id {
        Id::new(self.id.client, self.id.clock + self.len - 1)
    }

    /// Whether `id` falls inside this run.
    pub fn contains(&self, id: &Id) -> bool {
        self.id.client == id.client && id.clock >= self.id.clock && id.clock < self.id.clock + self.len
    }

    /// Length visible to readers (zero once tombstoned).
    pub fn visible_len(&self) -> Clock {
        if self.deleted {
            0
        } else {
            self.len
        }
    }

    /// Whether the content has been discarded by GC.
    pub fn is_collected(&self) -> bool {
        matches!(self.content, Content::Deleted(_))
    }
}
