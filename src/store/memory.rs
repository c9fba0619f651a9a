//! In-process store used by tests and benches.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::StreamExt;
use parking_lot::Mutex;
use regex::RegexBuilder;

use super::{AggregateSink, DimensionSource, EventSource, EventStream, StoreError};
use crate::rollup::buffer::AccumulatorEntry;
use crate::rollup::dimension::DimensionRecord;
use crate::rollup::event::RawEvent;
use crate::rollup::key::EntryId;

#[derive(Default)]
struct State {
    /// Documents per collection; `Err` entries decode as failures.
    collections: BTreeMap<String, Vec<Result<RawEvent, String>>>,
    dimensions: Vec<DimensionRecord>,
    aggregates: HashMap<EntryId, AccumulatorEntry>,
    failing_counts: HashSet<String>,
    fail_listing: bool,
    fail_writes: bool,
    inserts: u64,
    updates: u64,
    scanned: Vec<String>,
}

/// Memory-backed implementation of every store port.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends events to `collection`, creating it if needed.
    pub fn insert_events(&self, collection: &str, events: impl IntoIterator<Item = RawEvent>) {
        let mut state = self.state.lock();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(events.into_iter().map(Ok));
    }

    /// Appends a document that fails to decode with `reason`.
    pub fn insert_malformed(&self, collection: &str, reason: &str) {
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(Err(reason.to_string()));
    }

    pub fn add_dimension(&self, id: &str, game: &str, customer: &str) {
        self.state.lock().dimensions.push(DimensionRecord {
            id: id.to_string(),
            game: game.to_string(),
            customer: customer.to_string(),
        });
    }

    /// Makes `count_documents` fail for `collection`.
    pub fn fail_count(&self, collection: &str) {
        self.state.lock().failing_counts.insert(collection.to_string());
    }

    /// Makes `list_collections` fail.
    pub fn fail_listing(&self) {
        self.state.lock().fail_listing = true;
    }

    /// Toggles failure of every sink write.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Every persisted aggregate row.
    pub fn aggregates(&self) -> Vec<AccumulatorEntry> {
        self.state.lock().aggregates.values().cloned().collect()
    }

    pub fn aggregate(&self, id: &EntryId) -> Option<AccumulatorEntry> {
        self.state.lock().aggregates.get(id).cloned()
    }

    /// Successful inserts so far.
    pub fn insert_count(&self) -> u64 {
        self.state.lock().inserts
    }

    /// Successful updates so far.
    pub fn update_count(&self) -> u64 {
        self.state.lock().updates
    }

    /// Collections opened by `scan`, in call order.
    pub fn scanned(&self) -> Vec<String> {
        self.state.lock().scanned.clone()
    }
}

impl EventSource for MemoryStore {
    async fn list_collections(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let filter = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| StoreError::Backend(format!("invalid collection filter: {e}")))?;

        let state = self.state.lock();
        if state.fail_listing {
            return Err(StoreError::Backend("listing unavailable".to_string()));
        }
        Ok(state
            .collections
            .keys()
            .filter(|name| filter.is_match(name))
            .cloned()
            .collect())
    }

    async fn count_documents(&self, collection: &str) -> Result<u64, StoreError> {
        let state = self.state.lock();
        if state.failing_counts.contains(collection) {
            return Err(StoreError::Backend(format!("count failed for {collection}")));
        }
        Ok(state
            .collections
            .get(collection)
            .map_or(0, |docs| docs.len() as u64))
    }

    async fn scan(&self, collection: &str) -> Result<EventStream, StoreError> {
        let mut state = self.state.lock();
        state.scanned.push(collection.to_string());
        let docs = state.collections.get(collection).cloned().unwrap_or_default();

        let name = collection.to_string();
        let stream = futures::stream::iter(docs)
            .map(move |doc| doc.map_err(|reason| StoreError::decode(name.clone(), reason)));
        Ok(stream.boxed())
    }
}

impl DimensionSource for MemoryStore {
    async fn load_dimensions(&self) -> Result<Vec<DimensionRecord>, StoreError> {
        Ok(self.state.lock().dimensions.clone())
    }
}

impl AggregateSink for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, entry: &AccumulatorEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(StoreError::Backend("sink unavailable".to_string()));
        }
        if state.aggregates.contains_key(&entry.id) {
            return Err(StoreError::Conflict);
        }
        state.aggregates.insert(entry.id.clone(), entry.clone());
        state.inserts += 1;
        Ok(())
    }

    async fn update(&self, id: &EntryId, entry: &AccumulatorEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(StoreError::Backend("sink unavailable".to_string()));
        }
        let Some(row) = state.aggregates.get_mut(id) else {
            return Err(StoreError::Backend(format!("no row with id {id:?}")));
        };
        row.customer.clone_from(&entry.customer);
        row.game.clone_from(&entry.game);
        row.value = entry.value.clone();
        state.updates += 1;
        Ok(())
    }
}
