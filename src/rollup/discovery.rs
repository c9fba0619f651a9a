use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backlog::Backlog;
use super::config::DiscoveryConfig;
use super::scanner::Scanner;
use crate::export::health::HealthMetrics;
use crate::store::{EventSource, StoreError};

/// Counts from one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryPass {
    /// Collections matching the name filter.
    pub listed: usize,
    /// Matching collections at or above the document threshold.
    pub eligible: usize,
    /// Eligible collections not seen before.
    pub enqueued: usize,
}

/// Periodically lists source collections and queues the ones large enough
/// to scan.
pub struct Discoverer<S> {
    source: Arc<S>,
    backlog: Arc<Backlog>,
    scanner: Arc<Scanner<S>>,
    cfg: DiscoveryConfig,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: EventSource> Discoverer<S> {
    pub fn new(
        source: Arc<S>,
        backlog: Arc<Backlog>,
        scanner: Arc<Scanner<S>>,
        cfg: DiscoveryConfig,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            source,
            backlog,
            scanner,
            cfg,
            health,
        }
    }

    /// Lists, counts and enqueues once. A failed listing aborts the pass;
    /// a failed count only skips that collection.
    pub async fn discover_once(&self) -> Result<DiscoveryPass, StoreError> {
        let names = match self.source.list_collections(&self.cfg.collection_filter).await {
            Ok(names) => names,
            Err(e) => {
                if let Some(h) = &self.health {
                    h.discovery_errors.with_label_values(&["list"]).inc();
                }
                return Err(e);
            }
        };

        let mut pass = DiscoveryPass {
            listed: names.len(),
            ..Default::default()
        };

        for name in &names {
            let count = match self.source.count_documents(name).await {
                Ok(count) => count,
                Err(e) => {
                    warn!(collection = %name, error = %e, "counting documents failed, skipping");
                    if let Some(h) = &self.health {
                        h.discovery_errors.with_label_values(&["count"]).inc();
                    }
                    continue;
                }
            };

            if count < self.cfg.min_documents {
                debug!(collection = %name, count, "below document threshold");
                continue;
            }

            pass.eligible += 1;
            if self.backlog.enqueue(name) {
                pass.enqueued += 1;
                debug!(collection = %name, count, "collection queued");
            }
        }

        if let Some(h) = &self.health {
            h.discovery_passes.inc();
        }

        Ok(pass)
    }

    /// Runs a pass immediately and then every `interval` until cancelled,
    /// admitting scanners after each pass.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("discovery stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            let pass = self.discover_once().await?;
            let started = self.scanner.admit(&self.backlog);

            info!(
                listed = pass.listed,
                eligible = pass.eligible,
                enqueued = pass.enqueued,
                started,
                queued = self.backlog.len(),
                "discovery pass finished",
            );
        }
    }
}
