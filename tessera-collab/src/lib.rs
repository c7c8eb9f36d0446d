//! # tessera-collab — real-time synchronization for Tessera documents
//!
//! Runs the sync protocol on top of `tessera-core` documents: sessions
//! handshake with state vectors, stream incremental updates, and relay
//! ephemeral presence.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  binary / JSON   ┌──────────────┐
//! │ client      │ ◄──────────────► │ Session      │  one task per socket
//! └─────────────┘    frames        └──────┬───────┘
//!                                         │
//!                                         ▼
//!                                  ┌──────────────┐
//!                                  │ SyncManager  │──► AwarenessRegistry
//!                                  └──────┬───────┘──► Persistence
//!                                         │
//!                              ┌──────────┴──────────┐
//!                              ▼                     ▼
//!                       Room: RwLock<Doc>     BroadcastGroup
//!                              │  update observer    ▲
//!                              └──► fan-out task ────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary and JSON wire frames
//! - [`session`] — per-connection state machine
//! - [`manager`] — document rooms, reaper, external events, stats
//! - [`broadcast`] — bounded per-session fan-out
//! - [`awareness`] — presence registry with expiry
//! - [`events`] — business-event routing
//! - [`persistence`] — pluggable update log with an LZ4 in-memory store
//! - [`server`] — WebSocket adapter

pub mod awareness;
pub mod broadcast;
pub mod error;
pub mod events;
pub mod manager;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod session;

pub use awareness::{AwarenessEntry, AwarenessRegistry};
pub use broadcast::{BroadcastGroup, BroadcastStats, SessionHandle};
pub use error::SyncError;
pub use events::{BusinessEvent, BusinessEventType};
pub use manager::{ManagerConfig, ManagerStats, ReapReport, Room, SyncManager};
pub use persistence::{MemoryStore, Persistence, PersistenceError};
pub use protocol::{Frame, FrameKind, MessageType, ProtocolError, SyncMessage};
pub use server::{ConnectParams, ServerConfig, SyncServer};
pub use session::{Session, SessionState};
