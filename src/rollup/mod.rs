//! Incremental per-day rollups of raw telemetry events.
//!
//! Discovery queues source collections, scanners stream them through the
//! aggregation engine into one shared [`buffer::AccumulatorTable`], and the
//! flush loop persists that table after every finished scan.

pub mod aggregate;
pub mod backlog;
pub mod buffer;
pub mod config;
pub mod dimension;
pub mod discovery;
pub mod engine;
pub mod event;
pub mod flush;
pub mod key;
pub mod scanner;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use self::backlog::Backlog;
use self::buffer::AccumulatorTable;
use self::config::{DiscoveryConfig, EngineConfig, ScanConfig};
use self::dimension::DimensionCache;
use self::discovery::Discoverer;
use self::engine::Aggregator;
use self::flush::FlushLoop;
use self::scanner::Scanner;
use crate::export::health::HealthMetrics;
use crate::store::{AggregateSink, EventSource};

/// Tunables of the rollup pipeline.
#[derive(Debug, Clone, Default)]
pub struct RollupSettings {
    pub discovery: DiscoveryConfig,
    pub scan: ScanConfig,
    pub engine: EngineConfig,
}

/// Wires discovery, scanners and the flush loop around one accumulator table.
pub struct RollupService<S, K> {
    source: Arc<S>,
    sink: Arc<K>,
    dimensions: Arc<DimensionCache>,
    table: Arc<AccumulatorTable>,
    settings: RollupSettings,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: EventSource, K: AggregateSink> RollupService<S, K> {
    pub fn new(
        source: Arc<S>,
        sink: Arc<K>,
        dimensions: Arc<DimensionCache>,
        settings: RollupSettings,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            source,
            sink,
            dimensions,
            table: Arc::new(AccumulatorTable::new()),
            settings,
            health,
        }
    }

    /// The table every scanner accumulates into.
    pub fn table(&self) -> &Arc<AccumulatorTable> {
        &self.table
    }

    /// Runs until `cancel` fires, discovery cannot list collections, or a
    /// scan fails. The table is flushed once more before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let stop = cancel.child_token();
        let backlog = Arc::new(Backlog::new(
            self.settings.scan.max_concurrent,
            self.health.clone(),
        ));
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&self.table),
            self.settings.engine.cta_routing,
        ));
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&self.source),
            Arc::clone(&self.dimensions),
            aggregator,
            completions_tx,
            stop.clone(),
            self.health.clone(),
        ));
        let discoverer = Discoverer::new(
            Arc::clone(&self.source),
            Arc::clone(&backlog),
            Arc::clone(&scanner),
            self.settings.discovery.clone(),
            self.health.clone(),
        );
        let flush = FlushLoop::new(
            Arc::clone(&self.table),
            Arc::clone(&self.sink),
            backlog,
            scanner,
            completions_rx,
            self.health.clone(),
        );

        info!(
            max_concurrent = self.settings.scan.max_concurrent,
            filter = %self.settings.discovery.collection_filter,
            min_documents = self.settings.discovery.min_documents,
            sink = self.sink.name(),
            "rollup service started",
        );

        let mut discovery_task = tokio::spawn({
            let stop = stop.clone();
            async move { discoverer.run(stop).await }
        });
        let mut flush_task = tokio::spawn(flush.run(stop.clone()));

        let (discovery_result, flush_result) = tokio::select! {
            res = &mut discovery_task => {
                stop.cancel();
                (res, flush_task.await)
            }
            res = &mut flush_task => {
                stop.cancel();
                (discovery_task.await, res)
            }
        };

        flush_result
            .context("flush task panicked")?
            .context("aggregation stopped on a failed scan")?;
        discovery_result
            .context("discovery task panicked")?
            .context("listing source collections")?;

        info!(entries = self.table.len(), "rollup service stopped");
        Ok(())
    }
}
