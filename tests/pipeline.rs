use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use event_rollup::config::{CtaRouting, DiscoveryConfig, EngineConfig, ScanConfig};
use event_rollup::rollup::aggregate::AccumulatorValue;
use event_rollup::rollup::buffer::AccumulatorEntry;
use event_rollup::rollup::dimension::DimensionCache;
use event_rollup::rollup::event::{HeatmapPayload, Orientation, RawEvent};
use event_rollup::rollup::{RollupService, RollupSettings};
use event_rollup::store::memory::MemoryStore;
use tokio_util::sync::CancellationToken;

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 5, 14, 9, 30, 0)
        .single()
        .expect("valid date")
}

fn event(version: &str, name: &str) -> RawEvent {
    RawEvent::new(version, "unity", name, ts()).with_os("android")
}

fn settings(min_documents: u64, cta_routing: CtaRouting) -> RollupSettings {
    RollupSettings {
        discovery: DiscoveryConfig {
            interval: Duration::from_secs(3600),
            collection_filter: "x00*".to_string(),
            min_documents,
        },
        scan: ScanConfig { max_concurrent: 2 },
        engine: EngineConfig { cta_routing },
    }
}

async fn dimensions(store: &MemoryStore) -> Arc<DimensionCache> {
    Arc::new(
        DimensionCache::prefetch(store)
            .await
            .expect("prefetch dimensions"),
    )
}

/// Polls until `done` holds, failing after a few seconds.
async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn row<'a>(rows: &'a [AccumulatorEntry], name: &str) -> &'a AccumulatorEntry {
    rows.iter()
        .find(|r| r.id.event == name)
        .unwrap_or_else(|| panic!("no row for {name}"))
}

#[tokio::test]
async fn test_end_to_end_rollup() {
    let store = Arc::new(MemoryStore::new());
    store.add_dimension("v1", "g1", "c1");
    store.insert_events(
        "x001",
        [
            event("v1", "start").with_time(10.0),
            event("v1", "start").with_time(10.0),
            event("v1", "click").with_value(0.0).with_time(5.0),
            event("unresolved", "start").with_time(10.0),
        ],
    );
    // Filtered out by name.
    store.insert_events("results", [event("v1", "impression")]);

    let service = RollupService::new(
        Arc::clone(&store),
        Arc::clone(&store),
        dimensions(&store).await,
        settings(1, CtaRouting::Observed),
        None,
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(cancel.clone()));

    wait_until(|| store.aggregates().len() == 4).await;
    cancel.cancel();
    handle.await.expect("join").expect("service");

    let rows = store.aggregates();
    assert_eq!(rows.len(), 4);
    assert_eq!(row(&rows, "gameStarted").value, AccumulatorValue::Counter(2));
    assert_eq!(
        row(&rows, "gameStartedTime").value,
        AccumulatorValue::TimeSum(20)
    );
    assert_eq!(row(&rows, "firstClick").value, AccumulatorValue::Counter(1));
    assert_eq!(
        row(&rows, "firstClickTime").value,
        AccumulatorValue::TimeSum(5)
    );
    for r in &rows {
        assert_eq!(r.game, "g1");
        assert_eq!(r.customer, "c1");
        assert_eq!(r.id.timestamp, "2023-05-14T00:00:00.000+00:00");
        assert_eq!(r.id.timespan_minutes, 1440);
    }
    assert_eq!(store.scanned(), vec!["x001"]);
}

#[tokio::test]
async fn test_later_scans_update_existing_rows() {
    let store = Arc::new(MemoryStore::new());
    store.add_dimension("v1", "g1", "c1");
    store.insert_events("x001", [event("v1", "impression")]);
    store.insert_events("x002", [event("v1", "impression"), event("v1", "impression")]);

    let mut settings = settings(1, CtaRouting::Observed);
    settings.scan.max_concurrent = 1;
    let service = RollupService::new(
        Arc::clone(&store),
        Arc::clone(&store),
        dimensions(&store).await,
        settings,
        None,
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(cancel.clone()));

    wait_until(|| {
        store
            .aggregates()
            .first()
            .is_some_and(|r| r.value == AccumulatorValue::Counter(3))
    })
    .await;
    cancel.cancel();
    handle.await.expect("join").expect("service");

    assert_eq!(store.aggregates().len(), 1);
    assert_eq!(store.insert_count(), 1);
    assert!(store.update_count() >= 1);
}

#[tokio::test]
async fn test_small_collections_wait_for_threshold() {
    let store = Arc::new(MemoryStore::new());
    store.add_dimension("v1", "g1", "c1");
    store.insert_events("x001", [event("v1", "impression")]);
    store.insert_events("x002", (0..3).map(|_| event("v1", "restart")));

    let service = RollupService::new(
        Arc::clone(&store),
        Arc::clone(&store),
        dimensions(&store).await,
        settings(3, CtaRouting::Observed),
        None,
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(cancel.clone()));

    wait_until(|| !store.aggregates().is_empty()).await;
    cancel.cancel();
    handle.await.expect("join").expect("service");

    let rows = store.aggregates();
    assert_eq!(rows.len(), 1);
    assert_eq!(row(&rows, "gameRestarted").value, AccumulatorValue::Counter(3));
    assert_eq!(store.scanned(), vec!["x002"]);
}

#[tokio::test]
async fn test_heatmap_and_merged_cta() {
    let store = Arc::new(MemoryStore::new());
    store.add_dimension("v1", "g1", "c1");
    let click = |x, y| {
        event("v1", "click")
            .with_value(4.0)
            .with_time(2.0)
            .with_heatmap(HeatmapPayload::new(x, y, 10, 20))
    };
    store.insert_events(
        "x001",
        [
            click(3, 2),
            click(3, 2),
            click(-1, 2),
            event("v1", "cta").with_value(0.0).with_time(90.0),
            event("v1", "cta").with_value(1.0).with_time(90.0),
            event("v1", "cta").with_value(2.0).with_time(90.0),
        ],
    );

    let service = RollupService::new(
        Arc::clone(&store),
        Arc::clone(&store),
        dimensions(&store).await,
        settings(1, CtaRouting::Merged),
        None,
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(cancel.clone()));

    wait_until(|| store.aggregates().len() == 2).await;
    cancel.cancel();
    handle.await.expect("join").expect("service");

    let rows = store.aggregates();
    let grid = row(&rows, "heatmap").value.as_heatmap().expect("grid");
    assert_eq!(grid.count(Orientation::Portrait, 2, 22), 2);
    assert_eq!(grid.count(Orientation::Landscape, 2, 20), 1);

    let split = row(&rows, "ctaClick").value.as_cta_split().expect("split");
    assert_eq!((split.user, split.auto, split.unknown), (1, 1, 1));
}

#[tokio::test]
async fn test_failed_scan_stops_service_after_flush() {
    let store = Arc::new(MemoryStore::new());
    store.add_dimension("v1", "g1", "c1");
    store.insert_events("x001", [event("v1", "impression")]);
    store.insert_malformed("x001", "heatmap dim has 1 components");

    let service = RollupService::new(
        Arc::clone(&store),
        Arc::clone(&store),
        dimensions(&store).await,
        settings(1, CtaRouting::Observed),
        None,
    );

    let err = tokio::time::timeout(Duration::from_secs(5), service.run(CancellationToken::new()))
        .await
        .expect("service stops")
        .expect_err("scan failure is fatal");
    assert!(format!("{err:#}").contains("x001"));
    assert_eq!(store.aggregates().len(), 1);
}

#[tokio::test]
async fn test_listing_failure_stops_service() {
    let store = Arc::new(MemoryStore::new());
    store.fail_listing();

    let service = RollupService::new(
        Arc::clone(&store),
        Arc::clone(&store),
        Arc::new(DimensionCache::default()),
        settings(1, CtaRouting::Observed),
        None,
    );

    let err = tokio::time::timeout(Duration::from_secs(5), service.run(CancellationToken::new()))
        .await
        .expect("service stops")
        .expect_err("listing failure is fatal");
    assert!(format!("{err:#}").contains("listing"));
}
