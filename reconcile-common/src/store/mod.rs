pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::matcher::MatchFilter;
use crate::record::{
    identity_text, Identity, StoredEntity, EMAIL_FIELD, ID_FIELD, INSERTED_AT_FIELD, NAME_FIELD,
    PHONE_FIELD,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection-level errors (network, TLS, authentication)
    #[error("store connection error: {0}")]
    Connection(String),

    /// Statement errors (SQL errors, constraint violations, injected faults)
    #[error("store query error: {0}")]
    Query(String),

    #[error("store connection pool exhausted")]
    PoolExhausted,

    #[error("store call timed out")]
    Timeout,

    #[error("no stored record with id {0}")]
    NotFound(String),
}

impl StoreError {
    /// Errors that say nothing about the data, only that the store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Connection(_) | StoreError::PoolExhausted | StoreError::Timeout
        )
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Timeout
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One operation of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert the entity, or overwrite the one already stored under the same id. Replaying
    /// it never creates a duplicate. The first `inserted_at` is kept on overwrite.
    Upsert(StoredEntity),
    /// Set the given fields on an existing entity. Fields not mentioned are left alone.
    /// Fails with `NotFound` when the id is unknown.
    Merge {
        id: String,
        identity: Identity,
        attributes: Map<String, Value>,
    },
}

impl WriteOp {
    pub fn id(&self) -> &str {
        match self {
            WriteOp::Upsert(entity) => &entity.id,
            WriteOp::Merge { id, .. } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Upsert(_) => "upsert",
            WriteOp::Merge { .. } => "merge",
        }
    }
}

/// Per-operation outcome of a bulk write, index-aligned with the submitted operations.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BulkWriteResult {
    pub outcomes: Vec<StoreResult<()>>,
}

impl BulkWriteResult {
    pub fn applied(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }
}

/// A single equality condition of a pass-through filter query.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Id(String),
    Identity {
        field: &'static str,
        value: Option<String>,
    },
    InsertedAt(DateTime<Utc>),
    /// A `null` value matches entities where the attribute is absent or null.
    Attribute { key: String, value: Value },
    /// A condition no entity can satisfy, e.g. a null id or an unparseable timestamp.
    Never,
}

/// Conjunction of equality conditions built from an arbitrary field/value mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityFilter {
    pub conditions: Vec<Condition>,
}

impl EntityFilter {
    pub fn from_fields(fields: &Map<String, Value>) -> Self {
        let conditions = fields
            .iter()
            .map(|(field, value)| match field.as_str() {
                ID_FIELD => match identity_text(value) {
                    Some(id) => Condition::Id(id),
                    None => Condition::Never,
                },
                NAME_FIELD => Condition::Identity {
                    field: NAME_FIELD,
                    value: identity_text(value),
                },
                EMAIL_FIELD => Condition::Identity {
                    field: EMAIL_FIELD,
                    value: identity_text(value),
                },
                PHONE_FIELD => Condition::Identity {
                    field: PHONE_FIELD,
                    value: identity_text(value),
                },
                INSERTED_AT_FIELD => value
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|ts| Condition::InsertedAt(ts.with_timezone(&Utc)))
                    .unwrap_or(Condition::Never),
                _ => Condition::Attribute {
                    key: field.clone(),
                    value: value.clone(),
                },
            })
            .collect();

        Self { conditions }
    }

    pub fn matches(&self, entity: &StoredEntity) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Id(id) => entity.id == *id,
            Condition::Identity { field, value } => entity.identity.get(field) == value.as_deref(),
            Condition::InsertedAt(ts) => entity.inserted_at == *ts,
            Condition::Attribute { key, value } => match entity.attributes.get(key) {
                Some(stored) => stored == value,
                None => value.is_null(),
            },
            Condition::Never => false,
        })
    }
}

/// The document store the engine reconciles against.
///
/// Implementations can use different backends while the engine stays unchanged. Only
/// the identity matcher (`find_matching`) and the batch committer (`bulk_write`) call
/// it during reconciliation; the remaining methods serve export, filter and health checks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Every entity satisfying the name+email or the email+phone predicate.
    async fn find_matching(&self, filter: &MatchFilter) -> StoreResult<Vec<StoredEntity>>;

    /// Apply `ops` in order. A failing operation never stops the ones after it.
    /// Operations not confirmed by `deadline` are reported as `Timeout`. Returns `Err`
    /// only when the store could not be reached at all, in which case nothing was applied.
    async fn bulk_write(&self, ops: &[WriteOp], deadline: Instant) -> StoreResult<BulkWriteResult>;

    async fn find_all(&self) -> StoreResult<Vec<StoredEntity>>;

    async fn find_by_fields(&self, filter: &EntityFilter) -> StoreResult<Vec<StoredEntity>>;

    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> StoredEntity {
        StoredEntity {
            id: "1".to_owned(),
            identity: Identity::new(Some("A"), Some("a@x.com"), Some("555")),
            attributes: json!({"city": "NYC", "age": 30}).as_object().unwrap().clone(),
            inserted_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    fn filter(fields: Value) -> EntityFilter {
        EntityFilter::from_fields(fields.as_object().unwrap())
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(filter(json!({})).matches(&entity()));
    }

    #[test]
    fn matches_identity_and_attributes() {
        assert!(filter(json!({"name": "A", "city": "NYC"})).matches(&entity()));
        assert!(filter(json!({"phone": 555})).matches(&entity()));
        assert!(filter(json!({"age": 30})).matches(&entity()));
        assert!(!filter(json!({"age": "30"})).matches(&entity()));
        assert!(!filter(json!({"city": "LA"})).matches(&entity()));
    }

    #[test]
    fn null_matches_absent_fields() {
        assert!(filter(json!({"country": null})).matches(&entity()));
        assert!(!filter(json!({"city": null})).matches(&entity()));
        assert!(!filter(json!({"email": null})).matches(&entity()));
    }

    #[test]
    fn bookkeeping_fields() {
        assert!(filter(json!({"id": "1"})).matches(&entity()));
        assert!(filter(json!({"inserted_at": "2024-05-01T10:00:00+00:00"})).matches(&entity()));
        assert!(!filter(json!({"inserted_at": "yesterday"})).matches(&entity()));
        assert!(!filter(json!({"id": null})).matches(&entity()));
    }

    #[test]
    fn unavailable_errors() {
        assert!(StoreError::Timeout.is_unavailable());
        assert!(StoreError::PoolExhausted.is_unavailable());
        assert!(!StoreError::NotFound("1".to_owned()).is_unavailable());
        assert!(!StoreError::Query("boom".to_owned()).is_unavailable());
    }
}
