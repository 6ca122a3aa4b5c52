use std::sync::Arc;

use tokio::time::Duration;
use tracing::{info, warn};

use crate::committer::{BatchCommitter, CommitReport};
use crate::decision::{decide, Decision, ReconcileMode};
use crate::error::ReconcileError;
use crate::locks::IdentityLocks;
use crate::matcher::{IdentityMatcher, PendingIdentities, Resolved};
use crate::metrics::timing_guard;
use crate::metrics_consts::{BATCH_DURATION, BATCH_REJECTED, BATCH_SIZE, ROWS_RECONCILED};
use crate::normalize::{normalize_row, SystemTime, TimeSource};
use crate::record::{InboundRecord, RawRow};
use crate::store::DocumentStore;

/// Reconciles batches of spreadsheet rows against a document store.
///
/// Cheap to share: clone the `Arc` it lives in, not the reconciler. All requests
/// must go through the same instance for the identity locks to mean anything.
pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    locks: IdentityLocks,
    time: Arc<dyn TimeSource + Send + Sync>,
    store_timeout: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DocumentStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            locks: IdentityLocks::new(),
            time: Arc::new(SystemTime {}),
            store_timeout,
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource + Send + Sync>) -> Self {
        self.time = time;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub async fn reconcile(
        &self,
        rows: impl IntoIterator<Item = RawRow>,
    ) -> Result<CommitReport, ReconcileError> {
        self.reconcile_with_mode(rows, ReconcileMode::Upsert).await
    }

    /// `rows` is read once, front to back. A spreadsheet sheet can be passed straight in.
    pub async fn reconcile_with_mode(
        &self,
        rows: impl IntoIterator<Item = RawRow>,
        mode: ReconcileMode,
    ) -> Result<CommitReport, ReconcileError> {
        let _timer = timing_guard(BATCH_DURATION).label("mode", mode.as_str());

        let inserted_at = self.time.now();
        let records: Vec<(usize, InboundRecord)> = rows
            .into_iter()
            .map(|row| InboundRecord::from_normalized(normalize_row(row, inserted_at)))
            .enumerate()
            .filter(|(_, record)| !record.is_blank())
            .collect();

        if records.is_empty() {
            return Err(rejected(ReconcileError::EmptyBatch));
        }
        metrics::histogram!(BATCH_SIZE).record(records.len() as f64);

        // Held until the bulk write has returned.
        let _guard = self
            .locks
            .acquire(
                records
                    .iter()
                    .filter_map(|(_, record)| record.identity.email.clone()),
            )
            .await;

        let matcher = IdentityMatcher::new(self.store.as_ref(), self.store_timeout);
        let mut pending = PendingIdentities::default();
        let mut decisions = Vec::with_capacity(records.len());
        let mut skipped = Vec::new();

        for (row, record) in records {
            let Resolved { resolution, stored } = matcher
                .resolve(&record.identity, &pending)
                .await
                .map_err(|err| rejected(err.into()))?;

            match decide(row, resolution, record, mode) {
                Ok(decision) => {
                    match &decision {
                        Decision::Insert { id, record, .. } => {
                            pending.record_insert(id, &record.identity)
                        }
                        Decision::Update { id, record, .. } => {
                            pending.record_update(id, stored.get(id), &record.identity)
                        }
                    }
                    decisions.push(decision);
                }
                Err(skip) => {
                    warn!(row, reason = ?skip.reason, "row skipped");
                    skipped.push(skip);
                }
            }
        }

        let mut report = if decisions.is_empty() {
            CommitReport::default()
        } else {
            BatchCommitter::new(self.store.as_ref(), self.store_timeout)
                .commit(decisions)
                .await
                .map_err(rejected)?
        };
        report.skipped = skipped;

        metrics::counter!(ROWS_RECONCILED, "outcome" => "inserted").increment(report.inserted as u64);
        metrics::counter!(ROWS_RECONCILED, "outcome" => "updated").increment(report.updated as u64);
        metrics::counter!(ROWS_RECONCILED, "outcome" => "skipped")
            .increment(report.skipped.len() as u64);
        metrics::counter!(ROWS_RECONCILED, "outcome" => "failed")
            .increment(report.failed.len() as u64);

        info!(
            mode = mode.as_str(),
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "batch reconciled"
        );

        Ok(report)
    }
}

fn rejected(err: ReconcileError) -> ReconcileError {
    let reason = match &err {
        ReconcileError::EmptyBatch => "empty_batch",
        ReconcileError::StoreUnavailable(_) => "store_unavailable",
    };
    metrics::counter!(BATCH_REJECTED, "reason" => reason).increment(1);
    warn!(error = %err, "batch rejected");
    err
}
