//! Tessera replication core.
//!
//! A sequence/map CRDT engine: documents hold named text, list and map
//! types built on one replicated-item substrate, mutate them inside
//! transactions, and exchange state-vector based deltas.
//!
//! ```text
//! Doc ─┬─ Store ─┬─ BlockStore   client → [Item] (sorted by clock)
//!      │         └─ types        BranchId → Branch
//!      ├─ PendingQueue           items / deletes waiting on causal gaps
//!      ├─ GcPolicy + replica floor
//!      └─ observers              update (delta) · after-transaction
//! ```
//!
//! Reference: Kleppmann & Beresford, "A Conflict-Free Replicated JSON
//! Datatype", IEEE TPDS 2017

pub mod any;
pub mod doc;
pub mod error;
pub mod gc;
pub mod id;
pub mod item;
pub mod state_vector;
pub mod store;
pub mod transaction;
pub mod types;
pub mod update;

pub use any::Any;
pub use doc::{Doc, DocBuilder, DocOptions, DEFAULT_MAX_PENDING, DEFAULT_PENDING_TIMEOUT};
pub use error::CrdtError;
pub use gc::{GcCandidate, GcPolicy};
pub use id::{is_valid_id, random_client_id, ClientId, Clock, Id};
pub use item::{BranchId, Content, TypeKind};
pub use state_vector::{DeleteSet, StateVector};
pub use transaction::{Origin, ReadTxn, TransactionMut, TransactionSummary, UpdateEvent};
pub use types::{ListRef, MapRef, TextRef, TypeRef};
pub use update::{ApplyReport, Update};
