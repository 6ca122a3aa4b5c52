use serde::Serialize;
use uuid::Uuid;

use crate::matcher::MatchResolution;
use crate::record::{Identity, InboundRecord, StoredEntity};
use crate::store::WriteOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcileMode {
    /// Unmatched rows become new entities.
    #[default]
    Upsert,
    /// Unmatched rows are skipped, only existing entities are touched.
    UpdateOnly,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileMode::Upsert => "upsert",
            ReconcileMode::UpdateOnly => "update_only",
        }
    }
}

/// What to do with one inbound row. `row` is the row's position in the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Insert {
        row: usize,
        id: String,
        record: InboundRecord,
    },
    Update {
        row: usize,
        id: String,
        record: InboundRecord,
    },
}

impl Decision {
    pub fn row(&self) -> usize {
        match self {
            Decision::Insert { row, .. } | Decision::Update { row, .. } => *row,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Decision::Insert { id, .. } | Decision::Update { id, .. } => id,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Decision::Insert { .. })
    }

    pub fn into_write_op(self) -> WriteOp {
        match self {
            Decision::Insert { id, record, .. } => WriteOp::Upsert(StoredEntity {
                id,
                identity: record.identity,
                attributes: record.attributes,
                inserted_at: record.inserted_at,
            }),
            Decision::Update { id, record, .. } => WriteOp::Merge {
                id,
                identity: record.identity,
                attributes: record.attributes,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The row matched more than one stored entity. Picking one could merge two distinct
    /// real-world entities, so nothing is written.
    AmbiguousIdentity { candidates: Vec<String> },
    /// Update-only reconciliation found nothing to update.
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub row: usize,
    #[serde(flatten)]
    pub identity: Identity,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// 32 hex chars of a random v4 UUID.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Turn a match resolution into exactly one decision, or a skip.
pub fn decide(
    row: usize,
    resolution: MatchResolution,
    record: InboundRecord,
    mode: ReconcileMode,
) -> Result<Decision, SkippedRecord> {
    match (resolution, mode) {
        (MatchResolution::NoMatch, ReconcileMode::Upsert) => Ok(Decision::Insert {
            row,
            id: generate_id(),
            record,
        }),
        (MatchResolution::NoMatch, ReconcileMode::UpdateOnly) => Err(SkippedRecord {
            row,
            identity: record.identity,
            reason: SkipReason::NoMatch,
        }),
        (MatchResolution::SingleMatch(id), _) => Ok(Decision::Update { row, id, record }),
        (MatchResolution::AmbiguousMatch(candidates), _) => Err(SkippedRecord {
            row,
            identity: record.identity,
            reason: SkipReason::AmbiguousIdentity { candidates },
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map};

    fn record() -> InboundRecord {
        InboundRecord::new(
            Identity::new(Some("A"), Some("a@x.com"), None),
            json!({"city": "LA"}).as_object().unwrap().clone(),
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        )
    }

    #[test]
    fn no_match_inserts_with_fresh_id() {
        let first = decide(0, MatchResolution::NoMatch, record(), ReconcileMode::Upsert).unwrap();
        let second = decide(1, MatchResolution::NoMatch, record(), ReconcileMode::Upsert).unwrap();

        assert!(first.is_insert());
        assert_eq!(first.id().len(), 32);
        assert!(first.id().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn insert_keeps_ingestion_time() {
        let decision = decide(0, MatchResolution::NoMatch, record(), ReconcileMode::Upsert).unwrap();

        match decision.into_write_op() {
            WriteOp::Upsert(entity) => {
                assert_eq!(entity.inserted_at, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
            }
            other => panic!("expected an upsert, got {other:?}"),
        }
    }

    #[test]
    fn single_match_updates_in_place() {
        let decision = decide(
            3,
            MatchResolution::SingleMatch("1".to_owned()),
            record(),
            ReconcileMode::Upsert,
        )
        .unwrap();

        assert_eq!(decision.row(), 3);
        assert_eq!(decision.id(), "1");
        assert_eq!(
            decision.into_write_op(),
            WriteOp::Merge {
                id: "1".to_owned(),
                identity: Identity::new(Some("A"), Some("a@x.com"), None),
                attributes: json!({"city": "LA"}).as_object().unwrap().clone(),
            }
        );
    }

    #[test]
    fn ambiguity_is_skipped() {
        let skipped = decide(
            2,
            MatchResolution::AmbiguousMatch(vec!["1".to_owned(), "2".to_owned()]),
            record(),
            ReconcileMode::Upsert,
        )
        .unwrap_err();

        assert_eq!(
            skipped.reason,
            SkipReason::AmbiguousIdentity {
                candidates: vec!["1".to_owned(), "2".to_owned()]
            }
        );
        assert_eq!(
            serde_json::to_value(&skipped).unwrap(),
            json!({
                "row": 2,
                "name": "A",
                "email": "a@x.com",
                "reason": "ambiguous_identity",
                "candidates": ["1", "2"],
            })
        );
    }

    #[test]
    fn update_only_skips_unmatched() {
        let skipped = decide(
            0,
            MatchResolution::NoMatch,
            InboundRecord::new(Identity::default(), Map::new(), Utc::now()),
            ReconcileMode::UpdateOnly,
        )
        .unwrap_err();

        assert_eq!(skipped.reason, SkipReason::NoMatch);
    }
}
