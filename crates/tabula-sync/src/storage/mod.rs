//! Durable storage contract for document snapshots and session state.
//!
//! Implementations:
//! - `MemoryBackend` - in-memory tables with failure injection, for tests
//! - `FsBackend` - one JSON file per document on the local filesystem
//!
//! Every operation takes a [`CancelToken`]. Backends must check it before
//! starting and again immediately before committing, and abort with
//! [`StorageError::Cancelled`] leaving no visible partial write.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabula_store::{Record, RecordId, RecordsDiff, SerializedSchema};
use thiserror::Error;

use crate::ids::{DocumentId, SessionId};

mod fs;
mod memory;

pub use fs::FsBackend;
pub use memory::MemoryBackend;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored data is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Cooperative cancellation flag shared between a client and its backend.
///
/// Cancelling is one-way and sticky. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Bail out with `StorageError::Cancelled` if the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The durable shape of one document: its record map and the schema stamp
/// of the build that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub records: BTreeMap<RecordId, Record>,
    pub schema: SerializedSchema,
}

/// The session-scope records of one instance, stored beside the document so
/// a reopened instance can restore its local view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub records: Vec<Record>,
    /// Milliseconds since the Unix epoch; newest-first ordering and pruning
    /// key.
    pub updated_at_ms: u64,
}

/// Storage adapter for document and session snapshots, keyed by document id.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Load the durable snapshot for a document.
    ///
    /// `Ok(None)` means the document has never been written. An indexed
    /// document whose data cannot be read is an error, never `None`, so
    /// callers can tell "nothing saved yet" from "storage is broken".
    async fn load(
        &self,
        document_id: &DocumentId,
        cancel: &CancelToken,
    ) -> Result<Option<StoredSnapshot>>;

    /// Apply a diff to the stored record map, stamp the schema, and upsert
    /// the session snapshot, all in one transaction.
    async fn write_diff(
        &self,
        document_id: &DocumentId,
        diff: &RecordsDiff,
        schema: &SerializedSchema,
        session: Option<&SessionSnapshot>,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Replace the stored record map wholesale, stamp the schema, and upsert
    /// the session snapshot, all in one transaction.
    async fn write_snapshot(
        &self,
        document_id: &DocumentId,
        records: &BTreeMap<RecordId, Record>,
        schema: &SerializedSchema,
        session: Option<&SessionSnapshot>,
        cancel: &CancelToken,
    ) -> Result<()>;

    /// Every document id this backend has data for.
    async fn list_documents(&self) -> Result<Vec<DocumentId>>;

    /// Session snapshots for a document, newest first.
    async fn list_sessions(&self, document_id: &DocumentId) -> Result<Vec<SessionSnapshot>>;

    /// Drop all but the newest `keep` session snapshots.
    async fn prune_sessions(
        &self,
        document_id: &DocumentId,
        keep: usize,
        cancel: &CancelToken,
    ) -> Result<()>;
}
