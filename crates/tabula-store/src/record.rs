//! Record model: identifiers, typed JSON payloads, and persistence scopes.
//!
//! A record is the unit of storage, synchronization, and diffing. Its
//! `type_name` ties it to a registered type in the [`StoreSchema`], which
//! decides the record's scope.
//!
//! [`StoreSchema`]: crate::schema::StoreSchema

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordIdError {
    #[error("record id cannot be empty")]
    Empty,
}

/// A unique identifier for a record within one document.
///
/// Wraps a non-empty string. Sorts lexicographically, which keeps diff and
/// snapshot output deterministic.
///
/// # Examples
/// ```
/// use tabula_store::RecordId;
///
/// let id = RecordId::new("shape:abc");
/// assert_eq!(id.to_string(), "shape:abc");
///
/// let parsed: RecordId = "shape:abc".parse().unwrap();
/// assert_eq!(parsed, id);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(String);

impl RecordId {
    /// Create an id from a string. Empty strings are rejected through
    /// [`FromStr`] and deserialization; this constructor is for literals and
    /// trusted inputs.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = RecordIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(RecordIdError::Empty);
        }
        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// Serialize as a plain string so ids double as JSON object keys.
impl Serialize for RecordId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a record type lives and how far it travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordScope {
    /// Shared document state: persisted, broadcast to peers, and included in
    /// full snapshots.
    Document,
    /// Per-instance state (selections, cameras, UI). Never broadcast and never
    /// part of the shared document snapshot; persisted only in the instance's
    /// own session snapshot.
    Session,
}

/// One entity in a document: an id, a registered type, and a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(rename = "type")]
    pub type_name: String,
    pub data: serde_json::Value,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, type_name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            data,
        }
    }
}
