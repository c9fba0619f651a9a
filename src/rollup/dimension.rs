use std::collections::HashMap;

use tracing::debug;

use crate::store::{DimensionSource, StoreError};

/// One `(game, customer, _id)` triple from the dimension source collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionRecord {
    /// Version id the game/customer pair belongs to.
    pub id: String,
    pub game: String,
    pub customer: String,
}

/// Game and customer a version resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimensions {
    pub game: String,
    pub customer: String,
}

/// Immutable version-id → (game, customer) lookup.
///
/// Built once before scanning starts and shared read-only through `Arc`,
/// so lookups take no lock.
#[derive(Debug, Default)]
pub struct DimensionCache {
    by_version: HashMap<String, Dimensions>,
}

impl DimensionCache {
    /// Builds the cache; a later record for the same id replaces an earlier one.
    pub fn from_records(records: impl IntoIterator<Item = DimensionRecord>) -> Self {
        let mut by_version = HashMap::new();
        for record in records {
            by_version.insert(
                record.id,
                Dimensions {
                    game: record.game,
                    customer: record.customer,
                },
            );
        }
        Self { by_version }
    }

    /// Loads every dimension record from `source`.
    pub async fn prefetch<D: DimensionSource>(source: &D) -> Result<Self, StoreError> {
        let records = source.load_dimensions().await?;
        debug!(records = records.len(), "loaded dimension records");
        Ok(Self::from_records(records))
    }

    /// Resolves a version id. Unknown versions, and versions missing either
    /// the game or the customer, resolve to `None`.
    pub fn resolve(&self, version: &str) -> Option<&Dimensions> {
        self.by_version
            .get(version)
            .filter(|d| !d.game.is_empty() && !d.customer.is_empty())
    }

    pub fn len(&self) -> usize {
        self.by_version.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_version.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn record(id: &str, game: &str, customer: &str) -> DimensionRecord {
        DimensionRecord {
            id: id.to_string(),
            game: game.to_string(),
            customer: customer.to_string(),
        }
    }

    #[test]
    fn test_resolve_known_version() {
        let cache = DimensionCache::from_records([record("v1", "g1", "c1")]);
        let dims = cache.resolve("v1").expect("resolved");
        assert_eq!(dims.game, "g1");
        assert_eq!(dims.customer, "c1");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_version() {
        let cache = DimensionCache::from_records([record("v1", "g1", "c1")]);
        assert!(cache.resolve("v2").is_none());
        assert!(DimensionCache::default().resolve("v1").is_none());
    }

    #[test]
    fn test_resolve_requires_game_and_customer() {
        let cache = DimensionCache::from_records([
            record("no-game", "", "c1"),
            record("no-customer", "g1", ""),
        ]);
        assert!(cache.resolve("no-game").is_none());
        assert!(cache.resolve("no-customer").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_later_record_wins() {
        let cache =
            DimensionCache::from_records([record("v1", "g1", "c1"), record("v1", "g2", "c2")]);
        assert_eq!(cache.resolve("v1").map(|d| d.game.as_str()), Some("g2"));
    }

    #[tokio::test]
    async fn test_prefetch_from_store() {
        let store = MemoryStore::new();
        store.add_dimension("v1", "g1", "c1");
        store.add_dimension("v2", "g2", "c2");

        let cache = DimensionCache::prefetch(&store).await.expect("prefetch");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.resolve("v2").map(|d| d.customer.as_str()), Some("c2"));
    }
}
