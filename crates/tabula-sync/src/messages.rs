//! Messages broadcast between instances of the same document.
//!
//! The channel is fire-and-forget: no acknowledgements, no sequence numbers,
//! no replay. Every message carries the sender's schema stamp so receivers
//! can detect version skew before touching the payload.

use serde::{Deserialize, Serialize};
use tabula_store::{RecordsDiff, SerializedSchema};

use crate::ids::DocumentId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BroadcastMessage {
    /// A batch of document-scope changes made by one instance.
    #[serde(rename_all = "camelCase")]
    Diff {
        document_id: DocumentId,
        changes: RecordsDiff,
        schema: SerializedSchema,
    },
    /// Schema presence announcement. Sent once after startup and again
    /// whenever a stale peer is observed.
    Announce { schema: SerializedSchema },
}

impl BroadcastMessage {
    /// The sender's schema stamp.
    pub fn schema(&self) -> &SerializedSchema {
        match self {
            BroadcastMessage::Diff { schema, .. } => schema,
            BroadcastMessage::Announce { schema } => schema,
        }
    }
}
