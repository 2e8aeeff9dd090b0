// ABOUTME: Single parameterized sync run: fetch, classify, reconcile sinks, persist, post
// ABOUTME: Sink failures are isolated per sink and never block the snapshot save

use std::time::Instant;

use crate::backend::BackendClient;
use crate::differ::{ChangeEntry, ChangeSet, RecordDiffer};
use crate::error::{exit_code, SyncResult};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::record::{ColumnMapping, DataQualityIssue, Snapshot};
use crate::sink::{RowSink, SheetLayout};
use crate::snapshot::SnapshotStore;
use crate::source::RecordSource;
use crate::utils::RetryPolicy;

/// Number of sample records shown per category in the run summary.
const SUMMARY_SAMPLES: usize = 5;

/// A row sink together with its column layout.
pub struct SinkTarget<S: RowSink> {
    pub sink: S,
    pub layout: SheetLayout,
    /// Reconcile even when the source returned no records
    pub prune_on_empty: bool,
}

impl<S: RowSink> SinkTarget<S> {
    pub fn new(sink: S, layout: SheetLayout) -> Self {
        Self {
            sink,
            layout,
            prune_on_empty: false,
        }
    }

    pub fn prune_on_empty(mut self, prune: bool) -> Self {
        self.prune_on_empty = prune;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Not reconciled because the source returned nothing
    Skipped { sink: String },
    /// The pass ran; the report may still carry a phase failure
    Reconciled(ReconcileReport),
    /// The pass could not start or its batched update failed
    Failed { sink: String, error: String },
}

impl SinkOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            SinkOutcome::Skipped { .. } => true,
            SinkOutcome::Reconciled(report) => report.is_success(),
            SinkOutcome::Failed { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendStatus {
    #[default]
    Disabled,
    Unreachable,
    Posted,
    Failed,
}

/// Result of one fetch-and-classify step.
#[derive(Debug, Clone)]
pub struct Classification {
    pub current: Snapshot,
    pub previous: Snapshot,
    pub changes: ChangeSet,
    pub issues: Vec<DataQualityIssue>,
}

/// Statistics from a full run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub total: usize,
    pub changes: ChangeSet,
    /// Source rows rejected for a missing identifier
    pub rejected: usize,
    pub sinks: Vec<SinkOutcome>,
    pub backend: BackendStatus,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Check if every sink pass completed.
    pub fn is_success(&self) -> bool {
        self.sinks.iter().all(SinkOutcome::is_success)
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            exit_code::SUCCESS
        } else {
            exit_code::SINK
        }
    }

    pub fn log(&self) {
        let c = &self.changes;
        tracing::info!(
            "Run finished in {} ms: {} records ({} new, {} updated, {} unchanged, {} pruned, {} rejected)",
            self.duration_ms,
            self.total,
            c.new.len(),
            c.updated.len(),
            c.unchanged.len(),
            c.pruned.len(),
            self.rejected
        );
        log_samples("New", &c.new);
        log_samples("Updated", &c.updated);

        for outcome in &self.sinks {
            match outcome {
                SinkOutcome::Skipped { sink } => {
                    tracing::info!("  {}: skipped (no records)", sink)
                }
                SinkOutcome::Reconciled(r) => match &r.failure {
                    None => tracing::info!(
                        "  {}: {} updated, {} appended, {} deleted",
                        r.sink,
                        r.updated,
                        r.appended,
                        r.deleted
                    ),
                    Some(f) => tracing::warn!(
                        "  {}: stopped in {} phase ({} updated, {} appended, {} of {} deleted): {}",
                        r.sink,
                        f.phase,
                        r.updated,
                        r.appended,
                        r.deleted,
                        r.obsolete,
                        f.message
                    ),
                },
                SinkOutcome::Failed { sink, error } => {
                    tracing::error!("  {}: failed: {}", sink, error)
                }
            }
        }
        tracing::info!("  backend: {:?}", self.backend);
    }
}

fn log_samples(kind: &str, entries: &[ChangeEntry]) {
    for entry in entries.iter().take(SUMMARY_SAMPLES) {
        match &entry.change {
            Some(change) => tracing::info!(
                "  {} {} ({}): {} '{}' -> '{}'",
                kind,
                entry.id,
                entry.label,
                change.field,
                change.old,
                change.new
            ),
            None => tracing::info!("  {} {} ({})", kind, entry.id, entry.label),
        }
    }
    if entries.len() > SUMMARY_SAMPLES {
        tracing::info!("  ... and {} more", entries.len() - SUMMARY_SAMPLES);
    }
}

/// One run's collaborators and parameters.
pub struct SyncPipeline<'a, R: RecordSource> {
    source: &'a R,
    store: &'a SnapshotStore,
    differ: RecordDiffer,
    columns: ColumnMapping,
    max_records: usize,
    retry: RetryPolicy,
}

impl<'a, R: RecordSource> SyncPipeline<'a, R> {
    pub fn new(source: &'a R, store: &'a SnapshotStore) -> Self {
        Self {
            source,
            store,
            differ: RecordDiffer::default(),
            columns: ColumnMapping::default(),
            max_records: usize::MAX,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_differ(mut self, differ: RecordDiffer) -> Self {
        self.differ = differ;
        self
    }

    pub fn with_columns(mut self, columns: ColumnMapping) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_max_records(mut self, max_records: usize) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load the previous snapshot, fetch the current one and classify it.
    ///
    /// Writes nothing.
    pub async fn classify(&self) -> SyncResult<Classification> {
        let previous = self.store.load().await?;

        tracing::info!("Fetching appointments from {}", self.source.describe());
        let mut rows = self.source.fetch().await?;
        if rows.len() > self.max_records {
            tracing::warn!(
                "Source returned {} rows; keeping the first {}",
                rows.len(),
                self.max_records
            );
            rows.truncate(self.max_records);
        }
        if rows.is_empty() {
            tracing::warn!("Source returned no appointments");
        }

        let (current, issues) = Snapshot::from_raw_rows(&rows, &self.columns);
        for issue in &issues {
            tracing::warn!("Data quality: {}", issue);
        }

        let changes = self.differ.diff(&current, &previous);
        tracing::info!(
            "Classified {} records: {} new, {} updated, {} unchanged, {} pruned",
            current.len(),
            changes.new.len(),
            changes.updated.len(),
            changes.unchanged.len(),
            changes.pruned.len()
        );

        Ok(Classification {
            current,
            previous,
            changes,
            issues,
        })
    }

    /// Run the full pipeline.
    ///
    /// Source and persistence failures are returned as errors. Sink and
    /// backend failures are recorded in the summary and the run continues.
    pub async fn run<S: RowSink>(
        &self,
        sinks: &[SinkTarget<S>],
        backend: Option<&BackendClient>,
    ) -> SyncResult<RunSummary> {
        let start = Instant::now();
        let classification = self.classify().await?;
        let current = classification.current;

        let mut summary = RunSummary {
            total: current.len(),
            rejected: classification
                .issues
                .iter()
                .filter(|i| matches!(i, DataQualityIssue::MissingId { .. }))
                .count(),
            changes: classification.changes,
            ..Default::default()
        };

        for target in sinks {
            summary.sinks.push(self.reconcile_sink(target, &current).await);
        }

        self.store.save(&current).await?;

        if let Some(backend) = backend {
            summary.backend = post_to_backend(backend, &current).await;
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        Ok(summary)
    }

    async fn reconcile_sink<S: RowSink>(
        &self,
        target: &SinkTarget<S>,
        current: &Snapshot,
    ) -> SinkOutcome {
        let name = target.sink.describe();
        if current.is_empty() && !target.prune_on_empty {
            tracing::warn!("No records to write; leaving {} untouched", name);
            return SinkOutcome::Skipped { sink: name };
        }

        let reconciler = Reconciler::new(&target.sink, &target.layout).with_retry(self.retry);
        match reconciler.reconcile(current.records()).await {
            Ok(report) => SinkOutcome::Reconciled(report),
            Err(e) => {
                // Log with :? to show the phase and source of the failure
                tracing::error!("Reconciliation of {} failed: {:?}", name, e);
                SinkOutcome::Failed {
                    sink: name,
                    error: e.to_string(),
                }
            }
        }
    }
}

async fn post_to_backend(backend: &BackendClient, current: &Snapshot) -> BackendStatus {
    if !backend.health_check().await {
        tracing::warn!("Backend at {} is not available, skipping", backend.base_url());
        return BackendStatus::Unreachable;
    }
    match backend.post_appointments(current.records()).await {
        Ok(()) => BackendStatus::Posted,
        Err(e) => {
            tracing::warn!("Failed to post appointments to backend: {}", e);
            BackendStatus::Failed
        }
    }
}
