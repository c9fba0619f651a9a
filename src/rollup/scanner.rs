use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::backlog::{Admission, Backlog};
use super::dimension::DimensionCache;
use super::engine::Aggregator;
use crate::export::health::HealthMetrics;
use crate::store::{EventSource, StoreError};

/// A scan that could not read its collection to the end.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scanning {collection}")]
    Store {
        collection: String,
        #[source]
        source: StoreError,
    },
}

impl ScanError {
    pub fn collection(&self) -> &str {
        match self {
            Self::Store { collection, .. } => collection,
        }
    }
}

/// Counters for one finished scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub collection: String,
    /// Documents read from the cursor.
    pub documents: u64,
    /// Documents whose version resolved and that went through the engine.
    pub aggregated: u64,
    /// Documents dropped because their version did not resolve.
    pub skipped: u64,
    /// Accumulator updates applied.
    pub updates: u64,
    /// Accumulator updates rejected for a kind mismatch.
    pub rejected: u64,
    pub elapsed: Duration,
    /// The scan stopped early on shutdown.
    pub cancelled: bool,
}

/// Completion signal sent once per admitted collection.
#[derive(Debug)]
pub struct ScanCompletion {
    pub collection: String,
    pub outcome: Result<ScanReport, ScanError>,
}

/// Streams source collections through the aggregation engine.
pub struct Scanner<S> {
    source: Arc<S>,
    dimensions: Arc<DimensionCache>,
    aggregator: Arc<Aggregator>,
    completions: mpsc::UnboundedSender<ScanCompletion>,
    cancel: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: EventSource> Scanner<S> {
    pub fn new(
        source: Arc<S>,
        dimensions: Arc<DimensionCache>,
        aggregator: Arc<Aggregator>,
        completions: mpsc::UnboundedSender<ScanCompletion>,
        cancel: CancellationToken,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            source,
            dimensions,
            aggregator,
            completions,
            cancel,
            health,
        }
    }

    /// Starts a scanner task for every collection the backlog admits.
    /// Returns the number started.
    pub fn admit(self: &Arc<Self>, backlog: &Arc<Backlog>) -> usize {
        let admitted = backlog.admit_all();
        let started = admitted.len();
        for admission in admitted {
            self.spawn(admission);
        }
        if started > 0 {
            debug!(started, queued = backlog.len(), "admitted scanners");
        }
        started
    }

    /// Scans the admitted collection on a new task.
    ///
    /// The admission is released before the completion is sent, so the
    /// receiver can immediately admit the next collection.
    pub fn spawn(self: &Arc<Self>, admission: Admission) -> JoinHandle<()> {
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            let collection = admission.collection().to_string();
            let outcome = scanner.scan(&collection).await;
            drop(admission);

            scanner.record_outcome(&outcome);
            if scanner
                .completions
                .send(ScanCompletion { collection, outcome })
                .is_err()
            {
                debug!("completion receiver closed");
            }
        })
    }

    /// Reads `collection` to the end, or until cancelled.
    pub async fn scan(&self, collection: &str) -> Result<ScanReport, ScanError> {
        let start = Instant::now();
        info!(collection, "scan started");
        if let Some(h) = &self.health {
            h.scans_started.inc();
        }

        let store_err = |source: StoreError| ScanError::Store {
            collection: collection.to_string(),
            source,
        };

        let mut stream = self.source.scan(collection).await.map_err(store_err)?;
        let mut report = ScanReport {
            collection: collection.to_string(),
            ..Default::default()
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                next = stream.next() => next,
            };
            let Some(item) = next else {
                break;
            };

            let event = item.map_err(store_err)?;
            report.documents += 1;
            if let Some(h) = &self.health {
                h.events_scanned.inc();
            }

            let Some(dims) = self.dimensions.resolve(&event.version) else {
                report.skipped += 1;
                if let Some(h) = &self.health {
                    h.events_unresolved.inc();
                }
                continue;
            };

            let outcome = self.aggregator.apply(&event, &dims.game, &dims.customer);
            report.aggregated += 1;
            report.updates += u64::from(outcome.updates);
            report.rejected += u64::from(outcome.rejected);
            if let Some(h) = &self.health {
                h.events_aggregated.inc();
                if outcome.rejected > 0 {
                    h.kind_mismatches.inc_by(f64::from(outcome.rejected));
                }
            }
        }

        report.elapsed = start.elapsed();
        info!(
            collection,
            documents = report.documents,
            aggregated = report.aggregated,
            skipped = report.skipped,
            rejected = report.rejected,
            cancelled = report.cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "scan finished",
        );

        Ok(report)
    }

    fn record_outcome(&self, outcome: &Result<ScanReport, ScanError>) {
        let result = match outcome {
            Ok(report) if report.cancelled => "cancelled",
            Ok(_) => "ok",
            Err(e) => {
                error!(collection = e.collection(), error = ?e, "scan failed");
                "failed"
            }
        };

        if let Some(h) = &self.health {
            h.scans_finished.with_label_values(&[result]).inc();
            if let Ok(report) = outcome {
                h.scan_duration.observe(report.elapsed.as_secs_f64());
            }
            h.accumulator_entries
                .set(self.aggregator.table().len() as f64);
        }
    }
}
