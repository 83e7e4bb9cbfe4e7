//! tabula-sync: multi-instance synchronization and persistence engine.
//!
//! Keeps several concurrently-open instances of one document eventually
//! consistent with each other and with durable local storage, without a
//! server:
//! - broadcasts local mutations to sibling instances over a per-document
//!   channel
//! - reconciles schema-version skew between instances (migrate, reload, or
//!   halt)
//! - debounces and retries writes to a durable backend, with full-snapshot
//!   recovery after failures
//! - recovers a document at startup, migrating it forward when the stored
//!   schema is older than the running build's

pub mod channel;
pub mod client;
pub mod ids;
pub mod messages;
pub mod scheduler;
pub mod storage;

pub use channel::{DocumentChannel, LocalChannel, LocalHub};
pub use client::{LoadError, ReloadReason, SessionEvent, SyncClient, WriteError};
pub use ids::{DocumentId, IdError, SessionId};
pub use messages::BroadcastMessage;
pub use scheduler::{ClientStatus, PendingChange, PersistenceState, SyncConfig, WriteMode};
pub use storage::{
    CancelToken, FsBackend, MemoryBackend, SessionSnapshot, StorageBackend, StorageError,
    StoredSnapshot,
};
