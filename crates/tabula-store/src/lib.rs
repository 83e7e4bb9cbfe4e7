//! tabula-store: reactive record store for a single open document.
//!
//! This crate provides the data model the sync layer is built on:
//! - Records: typed JSON entities with document or session scope
//! - Diffs: batched changes with a squash operation for coalescing
//! - Schemas: version stamps, comparison, and forward migrations
//! - Store: the in-memory record map with a filtered change feed

pub mod diff;
pub mod record;
pub mod schema;
pub mod store;

pub use diff::RecordsDiff;
pub use record::{Record, RecordId, RecordIdError, RecordScope};
pub use schema::{
    Migration, MigrationError, MigrationSequence, SchemaOrdering, SerializedSchema, StoreSchema,
};
pub use store::{
    ChangeSet, ChangeSource, ChangeSubscription, ListenFilter, ScopeFilter, SourceFilter, Store,
    StoreError,
};
