use serde::Serialize;
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::decision::{Decision, SkippedRecord};
use crate::error::ReconcileError;
use crate::metrics_consts::BULK_WRITE_OPS;
use crate::store::{DocumentStore, StoreError};

/// A decision the store did not confirm. Other rows of the batch are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedWrite {
    pub row: usize,
    pub id: String,
    pub operation: &'static str,
    pub error: String,
}

/// Per-batch summary. `inserted + updated + failed.len()` always equals `submitted`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitReport {
    pub submitted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: Vec<SkippedRecord>,
    pub failed: Vec<FailedWrite>,
}

impl CommitReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

pub struct BatchCommitter<'a, S: ?Sized> {
    store: &'a S,
    timeout: Duration,
}

impl<'a, S: DocumentStore + ?Sized> BatchCommitter<'a, S> {
    pub fn new(store: &'a S, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Submit every decision in one bulk write. Inserts and updates are not applied
    /// atomically as a group: each one succeeds or fails on its own.
    pub async fn commit(&self, decisions: Vec<Decision>) -> Result<CommitReport, ReconcileError> {
        if decisions.is_empty() {
            return Err(ReconcileError::EmptyBatch);
        }

        let mut targets = Vec::with_capacity(decisions.len());
        let mut ops = Vec::with_capacity(decisions.len());
        for decision in decisions {
            targets.push((decision.row(), decision.id().to_owned(), decision.is_insert()));
            ops.push(decision.into_write_op());
        }

        let deadline = Instant::now() + self.timeout;
        let result = self.store.bulk_write(&ops, deadline).await?;

        let mut report = CommitReport {
            submitted: ops.len(),
            ..Default::default()
        };
        for (index, (row, id, is_insert)) in targets.into_iter().enumerate() {
            let operation = if is_insert { "insert" } else { "update" };
            let outcome = result
                .outcomes
                .get(index)
                .cloned()
                .unwrap_or(Err(StoreError::Timeout));

            match outcome {
                Ok(()) => {
                    metrics::counter!(BULK_WRITE_OPS, "operation" => operation, "outcome" => "ok")
                        .increment(1);
                    if is_insert {
                        report.inserted += 1;
                    } else {
                        report.updated += 1;
                    }
                }
                Err(err) => {
                    metrics::counter!(BULK_WRITE_OPS, "operation" => operation, "outcome" => "failed")
                        .increment(1);
                    warn!(row, id = id.as_str(), operation, error = %err, "write failed");
                    report.failed.push(FailedWrite {
                        row,
                        id,
                        operation,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            submitted = report.submitted,
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed.len(),
            "bulk write finished"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Identity, InboundRecord};
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::{json, Map};

    fn insert(row: usize, id: &str, email: &str) -> Decision {
        Decision::Insert {
            row,
            id: id.to_owned(),
            record: InboundRecord::new(
                Identity::new(Some("A"), Some(email), None),
                Map::new(),
                Utc::now(),
            ),
        }
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let store = MemoryStore::new();
        let committer = BatchCommitter::new(&store, Duration::from_secs(1));

        assert_eq!(
            committer.commit(vec![]).await,
            Err(ReconcileError::EmptyBatch)
        );
    }

    #[tokio::test]
    async fn counts_inserts_and_updates() {
        let store = MemoryStore::new();
        let committer = BatchCommitter::new(&store, Duration::from_secs(1));

        let decisions = vec![
            insert(0, "1", "a@x.com"),
            Decision::Update {
                row: 1,
                id: "1".to_owned(),
                record: InboundRecord::new(
                    Identity::default(),
                    json!({"city": "LA"}).as_object().unwrap().clone(),
                    Utc::now(),
                ),
            },
        ];
        let report = committer.commit(decisions).await.unwrap();

        assert_eq!(report.submitted, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.updated, 1);
        assert!(report.failed.is_empty());
        assert_eq!(
            store.get("1").await.unwrap().attributes.get("city"),
            Some(&json!("LA"))
        );
    }

    #[tokio::test]
    async fn one_failed_write_does_not_sink_the_batch() {
        let store = MemoryStore::new();
        store.fail_writes_for("2");
        let committer = BatchCommitter::new(&store, Duration::from_secs(1));

        let report = committer
            .commit(vec![
                insert(0, "1", "a@x.com"),
                insert(1, "2", "b@x.com"),
                insert(2, "3", "c@x.com"),
            ])
            .await
            .unwrap();

        assert_eq!(report.inserted, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].row, 1);
        assert_eq!(report.failed[0].operation, "insert");
        assert_eq!(report.written() + report.failed.len(), report.submitted);
    }

    #[tokio::test]
    async fn unreachable_store_fails_the_batch() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let committer = BatchCommitter::new(&store, Duration::from_secs(1));

        let err = committer
            .commit(vec![insert(0, "1", "a@x.com")])
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::StoreUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_writes_are_reported_as_timeouts() {
        let store = MemoryStore::new();
        store.set_latency(Duration::from_millis(600));
        let committer = BatchCommitter::new(&store, Duration::from_secs(1));

        let report = committer
            .commit(vec![insert(0, "1", "a@x.com"), insert(1, "2", "b@x.com")])
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].error, StoreError::Timeout.to_string());
    }
}
