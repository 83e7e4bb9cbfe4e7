//! Diff algebra over record maps.
//!
//! A [`RecordsDiff`] captures one batch of mutations as three id-keyed maps.
//! Queued diffs are combined with [`RecordsDiff::squash`] before being written
//! to storage, so applying the squashed diff must always produce the same
//! state as applying the originals in order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::record::{Record, RecordId, RecordScope};
use crate::schema::StoreSchema;

/// A batch of record changes. `updated` maps an id to `(previous, current)`.
///
/// An id appears in at most one of the three maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsDiff {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub added: BTreeMap<RecordId, Record>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updated: BTreeMap<RecordId, (Record, Record)>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub removed: BTreeMap<RecordId, Record>,
}

impl RecordsDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Number of ids touched by this diff.
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }

    /// Collapse an ordered sequence of diffs into one equivalent diff.
    ///
    /// Applying the result to a record map gives the same final state as
    /// applying each input in order. Intermediate states cancel out:
    /// an add followed by a remove of the same id vanishes entirely, and an
    /// add followed by updates stays an add of the final value.
    pub fn squash<'a>(diffs: impl IntoIterator<Item = &'a RecordsDiff>) -> RecordsDiff {
        let mut result = RecordsDiff::default();
        for diff in diffs {
            result.extend(diff);
        }
        result
    }

    /// Fold `next` into `self`, as if `next` happened immediately after the
    /// changes already recorded here.
    pub fn extend(&mut self, next: &RecordsDiff) {
        for (id, record) in &next.added {
            match self.removed.remove(id) {
                // remove then re-add: net update, unless the value came back
                // identical, in which case nothing happened at all
                Some(prior) => {
                    if prior != *record {
                        self.updated.insert(id.clone(), (prior, record.clone()));
                    }
                }
                None => {
                    self.added.insert(id.clone(), record.clone());
                }
            }
        }

        for (id, (prev, next_value)) in &next.updated {
            if let Some(added) = self.added.get_mut(id) {
                *added = next_value.clone();
                continue;
            }
            if let Some((_, current)) = self.updated.get_mut(id) {
                *current = next_value.clone();
                continue;
            }
            self.updated
                .insert(id.clone(), (prev.clone(), next_value.clone()));
        }

        for (id, record) in &next.removed {
            if self.added.remove(id).is_some() {
                // added earlier in the window, never observable
                continue;
            }
            match self.updated.remove(id) {
                Some((original, _)) => {
                    self.removed.insert(id.clone(), original);
                }
                None => {
                    self.removed.insert(id.clone(), record.clone());
                }
            }
        }
    }

    /// Apply this diff to a record map. Tolerant: adds upsert, updates write
    /// the current value regardless of what is held, removes of absent ids do
    /// nothing.
    pub fn apply_to(&self, records: &mut BTreeMap<RecordId, Record>) {
        for (id, record) in &self.added {
            records.insert(id.clone(), record.clone());
        }
        for (id, (_, current)) in &self.updated {
            records.insert(id.clone(), current.clone());
        }
        for id in self.removed.keys() {
            records.remove(id);
        }
    }

    /// Keep only the entries whose record type has the given scope.
    ///
    /// Types the schema does not know are treated as document scope, so they
    /// are never silently dropped from persistence or broadcast.
    pub fn filter_scope(&self, schema: &StoreSchema, scope: RecordScope) -> RecordsDiff {
        let keep = |record: &Record| {
            schema
                .scope_of(&record.type_name)
                .unwrap_or(RecordScope::Document)
                == scope
        };
        RecordsDiff {
            added: self
                .added
                .iter()
                .filter(|(_, r)| keep(r))
                .map(|(id, r)| (id.clone(), r.clone()))
                .collect(),
            updated: self
                .updated
                .iter()
                .filter(|(_, (_, current))| keep(current))
                .map(|(id, pair)| (id.clone(), pair.clone()))
                .collect(),
            removed: self
                .removed
                .iter()
                .filter(|(_, r)| keep(r))
                .map(|(id, r)| (id.clone(), r.clone()))
                .collect(),
        }
    }
}
