//! Schema registry: record types, version stamps, and forward migrations.
//!
//! Every persisted snapshot and every broadcast message carries a
//! [`SerializedSchema`] so readers can tell whether the writer was on the
//! same build, an older one (migrate the data forward), or a newer one
//! (stand down rather than clobber newer state).

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::record::{Record, RecordId, RecordScope};

/// Version of the serialized schema shape itself. Bump only if the
/// `SerializedSchema` JSON layout changes.
pub const SCHEMA_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("persisted data was written by a newer build (persisted {persisted}, current {current})")]
    NewerThanLocal {
        persisted: SerializedSchema,
        current: SerializedSchema,
    },
    #[error("persisted schema is from a different lineage (persisted {persisted}, current {current})")]
    IncompatibleLineage {
        persisted: SerializedSchema,
        current: SerializedSchema,
    },
}

/// How another schema relates to ours, from our point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaOrdering {
    /// Identical versions everywhere. Data is directly interchangeable.
    Equal,
    /// We are strictly newer. Their data can be migrated up to ours.
    Ahead,
    /// We are strictly older. We must not write over their state.
    Behind,
    /// Different sequence sets, different schema formats, or versions that
    /// cannot be linearly ordered. No migration path exists.
    Incompatible,
}

/// Version stamp attached to snapshots and broadcast messages: the schema
/// format version plus the current version of every migration sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedSchema {
    pub schema_version: u32,
    pub sequences: BTreeMap<String, u32>,
}

impl SerializedSchema {
    /// Compare from `self`'s perspective. `Ahead` means `self` is newer.
    pub fn compare(&self, other: &SerializedSchema) -> SchemaOrdering {
        if self.schema_version != other.schema_version {
            return SchemaOrdering::Incompatible;
        }
        if self.sequences.len() != other.sequences.len()
            || !self.sequences.keys().eq(other.sequences.keys())
        {
            return SchemaOrdering::Incompatible;
        }

        let mut ahead = false;
        let mut behind = false;
        for (id, ours) in &self.sequences {
            let theirs = other.sequences[id];
            if *ours > theirs {
                ahead = true;
            } else if *ours < theirs {
                behind = true;
            }
        }
        match (ahead, behind) {
            (false, false) => SchemaOrdering::Equal,
            (true, false) => SchemaOrdering::Ahead,
            (false, true) => SchemaOrdering::Behind,
            (true, true) => SchemaOrdering::Incompatible,
        }
    }
}

impl Display for SerializedSchema {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "v{}[", self.schema_version)?;
        for (i, (id, version)) in self.sequences.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}@{version}")?;
        }
        write!(f, "]")
    }
}

type MigrationFn = Arc<dyn Fn(&mut BTreeMap<RecordId, Record>) + Send + Sync>;
type ValidatorFn = Arc<dyn Fn(&Record) -> Result<(), String> + Send + Sync>;

/// One forward transform over a whole record map.
#[derive(Clone)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    run: MigrationFn,
}

impl Migration {
    pub fn new(
        version: u32,
        name: &'static str,
        run: impl Fn(&mut BTreeMap<RecordId, Record>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            version,
            name,
            run: Arc::new(run),
        }
    }
}

/// An ordered chain of migrations under one stable identifier.
#[derive(Clone)]
pub struct MigrationSequence {
    pub sequence_id: String,
    migrations: Vec<Migration>,
}

impl MigrationSequence {
    pub fn new(sequence_id: impl Into<String>, mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self {
            sequence_id: sequence_id.into(),
            migrations,
        }
    }

    /// Version this sequence is at with every migration applied.
    pub fn current_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version).unwrap_or(0)
    }
}

struct RecordType {
    scope: RecordScope,
    validator: Option<ValidatorFn>,
}

/// The runtime registry: which record types exist, what scope each has, and
/// how to bring old snapshots up to date.
#[derive(Default)]
pub struct StoreSchema {
    types: BTreeMap<String, RecordType>,
    sequences: Vec<MigrationSequence>,
}

impl StoreSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_type(&mut self, name: impl Into<String>, scope: RecordScope) {
        self.types.insert(
            name.into(),
            RecordType {
                scope,
                validator: None,
            },
        );
    }

    pub fn register_type_with_validator(
        &mut self,
        name: impl Into<String>,
        scope: RecordScope,
        validator: impl Fn(&Record) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.types.insert(
            name.into(),
            RecordType {
                scope,
                validator: Some(Arc::new(validator)),
            },
        );
    }

    pub fn add_sequence(&mut self, sequence: MigrationSequence) {
        self.sequences.push(sequence);
    }

    pub fn scope_of(&self, type_name: &str) -> Option<RecordScope> {
        self.types.get(type_name).map(|t| t.scope)
    }

    /// Run the type's validator, if one is registered. Unknown types pass;
    /// they are caught separately by the store's integrity check.
    pub(crate) fn validate(&self, record: &Record) -> Result<(), String> {
        match self.types.get(&record.type_name) {
            Some(RecordType {
                validator: Some(validator),
                ..
            }) => validator(record),
            _ => Ok(()),
        }
    }

    /// The version stamp for data written by this build.
    pub fn serialized(&self) -> SerializedSchema {
        SerializedSchema {
            schema_version: SCHEMA_FORMAT_VERSION,
            sequences: self
                .sequences
                .iter()
                .map(|s| (s.sequence_id.clone(), s.current_version()))
                .collect(),
        }
    }

    /// Bring a persisted record map up to the current schema.
    ///
    /// Snapshots stamped `Equal` pass through untouched. Older snapshots get
    /// each sequence's missing migrations applied in version order. Newer or
    /// divergent snapshots are refused.
    pub fn migrate_records(
        &self,
        mut records: BTreeMap<RecordId, Record>,
        persisted: &SerializedSchema,
    ) -> Result<BTreeMap<RecordId, Record>, MigrationError> {
        let current = self.serialized();
        match persisted.compare(&current) {
            SchemaOrdering::Equal => Ok(records),
            SchemaOrdering::Behind => {
                for sequence in &self.sequences {
                    let from = persisted
                        .sequences
                        .get(&sequence.sequence_id)
                        .copied()
                        .unwrap_or(0);
                    for migration in sequence.migrations.iter().filter(|m| m.version > from) {
                        (migration.run)(&mut records);
                        debug!(
                            sequence = %sequence.sequence_id,
                            version = migration.version,
                            name = migration.name,
                            "applied migration"
                        );
                    }
                }
                Ok(records)
            }
            SchemaOrdering::Ahead => Err(MigrationError::NewerThanLocal {
                persisted: persisted.clone(),
                current,
            }),
            SchemaOrdering::Incompatible => Err(MigrationError::IncompatibleLineage {
                persisted: persisted.clone(),
                current,
            }),
        }
    }
}
