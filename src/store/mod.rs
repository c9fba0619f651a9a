pub mod memory;
pub mod mongo;

use std::future::Future;

use futures::stream::BoxStream;
use thiserror::Error;

use crate::rollup::buffer::AccumulatorEntry;
use crate::rollup::dimension::DimensionRecord;
use crate::rollup::event::RawEvent;
use crate::rollup::key::EntryId;

/// Stream of decoded events from one source collection.
pub type EventStream = BoxStream<'static, Result<RawEvent, StoreError>>;

/// Errors raised by store adapters.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Insert hit an existing primary key.
    #[error("duplicate key")]
    Conflict,

    #[error("decoding document in {collection}: {source}")]
    Decode {
        collection: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("store backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn decode(
        collection: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Decode {
            collection: collection.into(),
            source: source.into(),
        }
    }

    /// Attributes a decode failure raised without a collection name.
    pub fn within(self, collection: &str) -> Self {
        match self {
            Self::Decode {
                collection: name,
                source,
            } if name.is_empty() => Self::Decode {
                collection: collection.to_string(),
                source,
            },
            other => other,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

/// Read side of the per-version raw event collections.
pub trait EventSource: Send + Sync + 'static {
    /// Lists collection names matching `pattern` (case-insensitive regex).
    fn list_collections(
        &self,
        pattern: &str,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Counts the documents in `collection`.
    fn count_documents(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Opens a cursor over every document in `collection`.
    fn scan(&self, collection: &str)
        -> impl Future<Output = Result<EventStream, StoreError>> + Send;
}

/// Source of the version → (game, customer) records.
pub trait DimensionSource: Send + Sync {
    fn load_dimensions(
        &self,
    ) -> impl Future<Output = Result<Vec<DimensionRecord>, StoreError>> + Send;
}

/// Destination of flushed aggregate rows.
pub trait AggregateSink: Send + Sync + 'static {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Inserts a new row. Fails with [`StoreError::Conflict`] when a row
    /// with the same id already exists.
    fn insert(
        &self,
        entry: &AccumulatorEntry,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Overwrites customer, game and value of the row with the given id.
    fn update(
        &self,
        id: &EntryId,
        entry: &AccumulatorEntry,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}
