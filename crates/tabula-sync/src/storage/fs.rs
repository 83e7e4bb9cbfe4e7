//! Filesystem storage backend.
//!
//! Layout under the root directory:
//! - `index.json` - side index of known document ids
//! - `documents/<escaped-id>.json` - records, schema stamp, and session
//!   snapshots for one document
//!
//! Each document lives in one JSON file, so a commit is a single temp-file
//! write followed by an atomic rename. The document file is renamed before
//! the index is updated; a crash in between leaves an unindexed file that
//! `load` treats as absent and the next write replaces.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabula_store::{Record, RecordId, RecordsDiff, SerializedSchema};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CancelToken, Result, SessionSnapshot, StorageBackend, StoredSnapshot};
use crate::ids::{DocumentId, SessionId};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct IndexFile {
    documents: Vec<DocumentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentFile {
    records: BTreeMap<RecordId, Record>,
    schema: SerializedSchema,
    #[serde(default)]
    sessions: BTreeMap<SessionId, SessionSnapshot>,
}

/// Storage backend writing one JSON file per document.
pub struct FsBackend {
    root: PathBuf,
    // serializes read-modify-write cycles across documents
    lock: Mutex<()>,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn document_path(&self, document_id: &DocumentId) -> PathBuf {
        self.root
            .join("documents")
            .join(format!("{}.json", escape_id(document_id)))
    }

    async fn read_index(&self) -> Result<IndexFile> {
        match fs::read(self.index_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(IndexFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// `Ok(None)` only when the id is absent from the index. An indexed
    /// document whose file is missing or unreadable is an error.
    async fn read_document(&self, document_id: &DocumentId) -> Result<Option<DocumentFile>> {
        let index = self.read_index().await?;
        if !index.documents.contains(document_id) {
            return Ok(None);
        }
        let bytes = fs::read(self.document_path(document_id)).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(value)?;
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn commit_document(
        &self,
        document_id: &DocumentId,
        file: &DocumentFile,
        cancel: &CancelToken,
    ) -> Result<()> {
        cancel.check()?;
        self.write_json_atomic(&self.document_path(document_id), file)
            .await?;

        let mut index = self.read_index().await?;
        if !index.documents.contains(document_id) {
            index.documents.push(document_id.clone());
            index.documents.sort();
            self.write_json_atomic(&self.index_path(), &index).await?;
            debug!(document = %document_id, "indexed new document");
        }
        Ok(())
    }
}

fn escape_id(id: &DocumentId) -> String {
    // '.' is escaped too, which rules out path traversal
    let mut out = String::new();
    for byte in id.as_str().bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn sorted_sessions(file: &DocumentFile) -> Vec<SessionSnapshot> {
    let mut sessions: Vec<SessionSnapshot> = file.sessions.values().cloned().collect();
    sessions.sort_by(|a, b| {
        b.updated_at_ms
            .cmp(&a.updated_at_ms)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    sessions
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn load(
        &self,
        document_id: &DocumentId,
        cancel: &CancelToken,
    ) -> Result<Option<StoredSnapshot>> {
        let _guard = self.lock.lock().await;
        cancel.check()?;
        Ok(self
            .read_document(document_id)
            .await?
            .map(|file| StoredSnapshot {
                records: file.records,
                schema: file.schema,
            }))
    }

    async fn write_diff(
        &self,
        document_id: &DocumentId,
        diff: &RecordsDiff,
        schema: &SerializedSchema,
        session: Option<&SessionSnapshot>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        cancel.check()?;
        let mut file = self
            .read_document(document_id)
            .await?
            .unwrap_or_else(|| DocumentFile {
                records: BTreeMap::new(),
                schema: schema.clone(),
                sessions: BTreeMap::new(),
            });
        diff.apply_to(&mut file.records);
        file.schema = schema.clone();
        if let Some(session) = session {
            file.sessions
                .insert(session.session_id.clone(), session.clone());
        }
        self.commit_document(document_id, &file, cancel).await
    }

    async fn write_snapshot(
        &self,
        document_id: &DocumentId,
        records: &BTreeMap<RecordId, Record>,
        schema: &SerializedSchema,
        session: Option<&SessionSnapshot>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        cancel.check()?;
        let mut file = self
            .read_document(document_id)
            .await?
            .unwrap_or_else(|| DocumentFile {
                records: BTreeMap::new(),
                schema: schema.clone(),
                sessions: BTreeMap::new(),
            });
        file.records = records.clone();
        file.schema = schema.clone();
        if let Some(session) = session {
            file.sessions
                .insert(session.session_id.clone(), session.clone());
        }
        self.commit_document(document_id, &file, cancel).await
    }

    async fn list_documents(&self) -> Result<Vec<DocumentId>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_index().await?.documents)
    }

    async fn list_sessions(&self, document_id: &DocumentId) -> Result<Vec<SessionSnapshot>> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_document(document_id)
            .await?
            .map(|file| sorted_sessions(&file))
            .unwrap_or_default())
    }

    async fn prune_sessions(
        &self,
        document_id: &DocumentId,
        keep: usize,
        cancel: &CancelToken,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        cancel.check()?;
        let Some(mut file) = self.read_document(document_id).await? else {
            return Ok(());
        };
        if file.sessions.len() <= keep {
            return Ok(());
        }
        let mut sessions = sorted_sessions(&file);
        sessions.truncate(keep);
        file.sessions = sessions
            .into_iter()
            .map(|s| (s.session_id.clone(), s))
            .collect();
        self.commit_document(document_id, &file, cancel).await
    }
}
