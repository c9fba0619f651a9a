use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use super::aggregate::{AccumulatorValue, Update, ValueKind};
use super::key::{AggregationKey, EntryId};

/// Errors raised by the accumulator table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("accumulator {key} holds a {existing} value, rejected {requested} update")]
    KindMismatch {
        key: AggregationKey,
        existing: ValueKind,
        requested: ValueKind,
    },
}

/// One aggregate row: identity, annotations and accumulated value.
///
/// Field names match the sink document layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccumulatorEntry {
    #[serde(rename = "_id")]
    pub id: EntryId,
    pub customer: String,
    pub game: String,
    pub value: AccumulatorValue,
}

/// Identity and annotations used when an accumulator is first created.
#[derive(Debug, Clone)]
pub struct EntrySeed {
    pub id: EntryId,
    pub game: String,
    pub customer: String,
}

/// Process-lifetime table of accumulators shared by every scanner and the
/// flush loop.
///
/// A single mutex guards the whole map so lookup-or-create and the mutation
/// that follows are one atomic step, and so a snapshot never observes a
/// partially updated entry. Entries are never removed.
pub struct AccumulatorTable {
    entries: parking_lot::Mutex<HashMap<AggregationKey, AccumulatorEntry>>,
}

impl AccumulatorTable {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Applies `update` to the accumulator at `key`, creating it from `seed`
    /// with a zero value of the update's kind if absent.
    ///
    /// An existing accumulator of another kind is left untouched.
    pub fn accumulate<F>(&self, key: AggregationKey, seed: F, update: Update) -> Result<(), AggregateError>
    where
        F: FnOnce() -> EntrySeed,
    {
        let mut entries = self.entries.lock();
        let entry = match entries.entry(key) {
            Entry::Occupied(occupied) => {
                let existing = occupied.get().value.kind();
                if existing != update.kind() {
                    return Err(AggregateError::KindMismatch {
                        key: occupied.key().clone(),
                        existing,
                        requested: update.kind(),
                    });
                }
                occupied.into_mut()
            }
            Entry::Vacant(vacant) => {
                let seed = seed();
                vacant.insert(AccumulatorEntry {
                    id: seed.id,
                    customer: seed.customer,
                    game: seed.game,
                    value: AccumulatorValue::zero(update.kind()),
                })
            }
        };

        entry.value.apply(update);
        Ok(())
    }

    /// Copies every entry as of lock acquisition.
    pub fn snapshot(&self) -> Vec<AccumulatorEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn get(&self, key: &AggregationKey) -> Option<AccumulatorEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for AccumulatorTable {
    fn default() -> Self {
        Self::new()
    }
}
