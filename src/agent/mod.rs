use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use mongodb::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::rollup::dimension::DimensionCache;
use crate::rollup::{RollupService, RollupSettings};
use crate::store::mongo::{self, MongoAggregateSink, MongoDimensionSource, MongoEventSource};

/// Agent orchestrates all components: store connections, dimension prefetch,
/// the rollup service and the health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    service: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            service: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin aggregating.
    pub async fn start(&mut self) -> Result<()> {
        let started = Instant::now();

        // 0. Start health metrics server so /healthz answers during prefetch.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Connect to the stores, sharing clients between equal URIs.
        let source_client = mongo::connect(&self.cfg.source.uri)
            .await
            .context("connecting to event source")?;
        let dimension_client = self
            .client_for(self.cfg.dimension_uri(), &source_client, "dimension source")
            .await?;
        let sink_client = self
            .client_for(self.cfg.sink_uri(), &source_client, "aggregate sink")
            .await?;
        info!(database = %self.cfg.source.database, "connected to stores");

        // 2. Prefetch the dimension cache before any scan can start.
        let dimension_source = MongoDimensionSource::new(
            dimension_client
                .database(&self.cfg.dimensions.database)
                .collection(&self.cfg.dimensions.collection),
        );
        let dimensions = DimensionCache::prefetch(&dimension_source)
            .await
            .context("prefetching dimensions")?;
        self.health.dimension_cache_entries.set(dimensions.len() as f64);
        info!(versions = dimensions.len(), "dimension cache loaded");

        // 3. Spawn the rollup service.
        let source = Arc::new(MongoEventSource::new(
            source_client.database(&self.cfg.source.database),
        ));
        let sink = Arc::new(MongoAggregateSink::new(
            sink_client
                .database(self.cfg.sink_database())
                .collection(&self.cfg.sink.collection),
        ));
        let settings = RollupSettings {
            discovery: self.cfg.discovery.clone(),
            scan: self.cfg.scan.clone(),
            engine: self.cfg.engine.clone(),
        };
        let service = RollupService::new(
            source,
            sink,
            Arc::new(dimensions),
            settings,
            Some(Arc::clone(&self.health)),
        );
        self.service = Some(tokio::spawn(service.run(self.cancel.clone())));

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "agent started",
        );

        Ok(())
    }

    /// Resolves when the rollup service stops on its own, with its result.
    /// Pending forever if the service was never started.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.service.as_mut() else {
            return std::future::pending().await;
        };
        let result = handle.await;
        self.service = None;
        result.context("rollup service panicked")?
    }

    /// Stop all components. The rollup service flushes once more first.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Wait for the service to finish its final flush.
        if let Some(handle) = self.service.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = ?e, "rollup service error during shutdown"),
                Err(e) => error!(error = %e, "rollup service panicked"),
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    async fn client_for(&self, uri: &str, source: &Client, what: &str) -> Result<Client> {
        if uri == self.cfg.source.uri {
            return Ok(source.clone());
        }
        mongo::connect(uri)
            .await
            .with_context(|| format!("connecting to {what}"))
    }
}
