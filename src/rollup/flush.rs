use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backlog::Backlog;
use super::buffer::AccumulatorTable;
use super::scanner::{ScanCompletion, ScanError, Scanner};
use crate::export::health::HealthMetrics;
use crate::store::{AggregateSink, EventSource, StoreError};

/// Outcome of persisting one table snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub entries: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Writes a snapshot of `table` to `sink`: insert each entry, and update it
/// by id when the insert conflicts. Failures are logged and counted, never
/// retried, and never stop the remaining entries.
pub async fn flush_table<K: AggregateSink>(table: &AccumulatorTable, sink: &K) -> FlushReport {
    let snapshot = table.snapshot();
    let mut report = FlushReport {
        entries: snapshot.len(),
        ..Default::default()
    };

    for entry in &snapshot {
        let result = match sink.insert(entry).await {
            Ok(()) => {
                report.inserted += 1;
                continue;
            }
            Err(StoreError::Conflict) => sink.update(&entry.id, entry).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => report.updated += 1,
            Err(e) => {
                report.failed += 1;
                warn!(
                    sink = sink.name(),
                    version = %entry.id.version,
                    event = %entry.id.event,
                    day = %entry.id.timestamp,
                    error = %e,
                    "writing aggregate failed",
                );
            }
        }
    }

    report
}

/// Persists the accumulator table whenever a scan completes, and keeps the
/// backlog moving by admitting the next collections.
pub struct FlushLoop<S, K> {
    table: Arc<AccumulatorTable>,
    sink: Arc<K>,
    backlog: Arc<Backlog>,
    scanner: Arc<Scanner<S>>,
    completions: mpsc::UnboundedReceiver<ScanCompletion>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: EventSource, K: AggregateSink> FlushLoop<S, K> {
    pub fn new(
        table: Arc<AccumulatorTable>,
        sink: Arc<K>,
        backlog: Arc<Backlog>,
        scanner: Arc<Scanner<S>>,
        completions: mpsc::UnboundedReceiver<ScanCompletion>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            table,
            sink,
            backlog,
            scanner,
            completions,
            health,
        }
    }

    /// Consumes completions until cancelled. A failed scan flushes once more
    /// and ends the loop with its error.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ScanError> {
        loop {
            let completion = tokio::select! {
                _ = cancel.cancelled() => None,
                completion = self.completions.recv() => completion,
            };

            let Some(completion) = completion else {
                self.flush().await;
                debug!("flush loop stopped");
                return Ok(());
            };

            match completion.outcome {
                Ok(report) => {
                    debug!(
                        collection = %completion.collection,
                        documents = report.documents,
                        "scan completed",
                    );
                }
                Err(e) => {
                    self.flush().await;
                    return Err(e);
                }
            }

            self.scanner.admit(&self.backlog);
            self.flush().await;
        }
    }

    /// Persists the current table snapshot.
    pub async fn flush(&self) -> FlushReport {
        let start = Instant::now();
        let report = flush_table(&self.table, self.sink.as_ref()).await;
        let elapsed = start.elapsed();

        if let Some(h) = &self.health {
            h.flushes.inc();
            h.flush_duration.observe(elapsed.as_secs_f64());
            h.flush_entries
                .with_label_values(&["inserted"])
                .inc_by(report.inserted as f64);
            h.flush_entries
                .with_label_values(&["updated"])
                .inc_by(report.updated as f64);
            h.flush_entries
                .with_label_values(&["failed"])
                .inc_by(report.failed as f64);
            h.accumulator_entries.set(report.entries as f64);
        }

        info!(
            sink = self.sink.name(),
            entries = report.entries,
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "flushed aggregates",
        );

        report
    }
}
