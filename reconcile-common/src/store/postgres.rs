use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgQueryResult};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use tokio::time::{timeout_at, Instant};
use tracing::warn;

use super::{
    BulkWriteResult, Condition, DocumentStore, EntityFilter, StoreError, StoreResult, WriteOp,
};
use crate::matcher::MatchFilter;
use crate::metrics::timing_guard;
use crate::metrics_consts::STORE_QUERY_DURATION;
use crate::record::{Identity, StoredEntity};

const SELECT_RECORDS: &str = "SELECT id, name, email, phone, attributes, inserted_at FROM records";

/// Entities live in a single `records` table: identity fields as text columns,
/// everything else in a JSONB `attributes` column.
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, Clone, FromRow)]
struct RecordRow {
    id: String,
    name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    attributes: Value,
    inserted_at: DateTime<Utc>,
}

impl From<RecordRow> for StoredEntity {
    fn from(row: RecordRow) -> Self {
        let attributes = match row.attributes {
            Value::Object(map) => map,
            _ => Default::default(),
        };

        StoredEntity {
            id: row.id,
            identity: Identity {
                name: row.name,
                email: row.email,
                phone: row.phone,
            },
            attributes,
            inserted_at: row.inserted_at,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => StoreError::PoolExhausted,

            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => StoreError::Connection(err.to_string()),

            _ => StoreError::Query(err.to_string()),
        }
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;

        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Query(format!("failed to run migrations: {e}")))
    }

    async fn apply(conn: &mut PgConnection, op: &WriteOp) -> StoreResult<()> {
        let _timer = timing_guard(STORE_QUERY_DURATION).label("operation", op.kind());

        match op {
            WriteOp::Upsert(entity) => {
                sqlx::query(
                    r#"
                    INSERT INTO records (id, name, email, phone, attributes, inserted_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO UPDATE SET
                        name = EXCLUDED.name,
                        email = EXCLUDED.email,
                        phone = EXCLUDED.phone,
                        attributes = EXCLUDED.attributes
                    "#,
                )
                .bind(&entity.id)
                .bind(&entity.identity.name)
                .bind(&entity.identity.email)
                .bind(&entity.identity.phone)
                .bind(Json(&entity.attributes))
                .bind(entity.inserted_at)
                .execute(conn)
                .await?;

                Ok(())
            }
            WriteOp::Merge {
                id,
                identity,
                attributes,
            } => {
                let res = sqlx::query(
                    r#"
                    UPDATE records SET
                        name = COALESCE($2, name),
                        email = COALESCE($3, email),
                        phone = COALESCE($4, phone),
                        attributes = attributes || $5
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&identity.name)
                .bind(&identity.email)
                .bind(&identity.phone)
                .bind(Json(attributes))
                .execute(conn)
                .await?;

                throw_if_no_rows(res, id)
            }
        }
    }

    /// Apply the ops at `indexes` one statement at a time, in order.
    async fn apply_each(
        conn: &mut PgConnection,
        ops: &[WriteOp],
        indexes: &[usize],
        deadline: Instant,
        outcomes: &mut [StoreResult<()>],
    ) {
        for &index in indexes {
            outcomes[index] = if Instant::now() >= deadline {
                Err(StoreError::Timeout)
            } else {
                timeout_at(deadline, Self::apply(conn, &ops[index]))
                    .await
                    .unwrap_or(Err(StoreError::Timeout))
            };
        }
    }
}

/// The batch statements apply every upsert before every merge. That only equals applying
/// the ops in order when no id is upserted twice and no merge comes before an upsert of
/// the same id.
fn batchable(ops: &[WriteOp]) -> bool {
    let mut upserted = HashSet::new();
    let mut merged = HashSet::new();
    for op in ops {
        match op {
            WriteOp::Upsert(entity) => {
                if merged.contains(entity.id.as_str()) || !upserted.insert(entity.id.as_str()) {
                    return false;
                }
            }
            WriteOp::Merge { id, .. } => {
                merged.insert(id.as_str());
            }
        }
    }
    true
}

/// Column arrays for a single `INSERT ... SELECT FROM UNNEST` upsert.
#[derive(Default)]
struct UpsertBatch {
    indexes: Vec<usize>,
    ids: Vec<String>,
    names: Vec<Option<String>>,
    emails: Vec<Option<String>>,
    phones: Vec<Option<String>>,
    attributes: Vec<Json<Map<String, Value>>>,
    inserted_at: Vec<DateTime<Utc>>,
}

impl UpsertBatch {
    fn push(&mut self, index: usize, entity: &StoredEntity) {
        self.indexes.push(index);
        self.ids.push(entity.id.clone());
        self.names.push(entity.identity.name.clone());
        self.emails.push(entity.identity.email.clone());
        self.phones.push(entity.identity.phone.clone());
        self.attributes.push(Json(entity.attributes.clone()));
        self.inserted_at.push(entity.inserted_at);
    }

    async fn execute(&self, conn: &mut PgConnection) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO records (id, name, email, phone, attributes, inserted_at)
                (SELECT * FROM UNNEST(
                    $1::text[],
                    $2::text[],
                    $3::text[],
                    $4::text[],
                    $5::jsonb[],
                    $6::timestamptz[]))
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                attributes = EXCLUDED.attributes
            "#,
        )
        .bind(&self.ids)
        .bind(&self.names)
        .bind(&self.emails)
        .bind(&self.phones)
        .bind(&self.attributes)
        .bind(&self.inserted_at)
        .execute(conn)
        .await?;

        Ok(())
    }
}

/// Merges folded per id, in first-seen order. One `UPDATE` touches a row at most once,
/// so later merges of an id are layered onto the earlier ones here.
#[derive(Default)]
struct MergeBatch {
    positions: HashMap<String, usize>,
    ids: Vec<String>,
    indexes: Vec<Vec<usize>>,
    identities: Vec<Identity>,
    attributes: Vec<Map<String, Value>>,
}

impl MergeBatch {
    fn push(&mut self, index: usize, id: &str, identity: &Identity, attributes: &Map<String, Value>) {
        match self.positions.get(id) {
            Some(&at) => {
                self.indexes[at].push(index);
                self.identities[at].merge(identity);
                self.attributes[at].extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            None => {
                self.positions.insert(id.to_owned(), self.ids.len());
                self.ids.push(id.to_owned());
                self.indexes.push(vec![index]);
                self.identities.push(identity.clone());
                self.attributes.push(attributes.clone());
            }
        }
    }

    /// Ids of the rows that were found and updated.
    async fn execute(&self, conn: &mut PgConnection) -> StoreResult<HashSet<String>> {
        let names: Vec<Option<String>> = self.identities.iter().map(|i| i.name.clone()).collect();
        let emails: Vec<Option<String>> = self.identities.iter().map(|i| i.email.clone()).collect();
        let phones: Vec<Option<String>> = self.identities.iter().map(|i| i.phone.clone()).collect();
        let attributes: Vec<Json<&Map<String, Value>>> = self.attributes.iter().map(Json).collect();

        let updated = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE records AS r SET
                name = COALESCE(m.name, r.name),
                email = COALESCE(m.email, r.email),
                phone = COALESCE(m.phone, r.phone),
                attributes = r.attributes || m.attributes
            FROM UNNEST(
                $1::text[],
                $2::text[],
                $3::text[],
                $4::text[],
                $5::jsonb[]) AS m(id, name, email, phone, attributes)
            WHERE r.id = m.id
            RETURNING r.id
            "#,
        )
        .bind(&self.ids)
        .bind(&names)
        .bind(&emails)
        .bind(&phones)
        .bind(&attributes)
        .fetch_all(conn)
        .await?;

        Ok(updated.into_iter().collect())
    }
}

fn throw_if_no_rows(res: PgQueryResult, id: &str) -> StoreResult<()> {
    if res.rows_affected() == 0 {
        Err(StoreError::NotFound(id.to_owned()))
    } else {
        Ok(())
    }
}

fn push_condition(qb: &mut QueryBuilder<'_, Postgres>, condition: &Condition) {
    match condition {
        Condition::Id(id) => {
            qb.push(" AND id = ");
            qb.push_bind(id.clone());
        }
        // `field` is one of the fixed identity column names, never user input.
        Condition::Identity {
            field,
            value: Some(value),
        } => {
            qb.push(format!(" AND {field} = "));
            qb.push_bind(value.clone());
        }
        Condition::Identity { field, value: None } => {
            qb.push(format!(" AND {field} IS NULL"));
        }
        Condition::InsertedAt(ts) => {
            qb.push(" AND inserted_at = ");
            qb.push_bind(*ts);
        }
        Condition::Attribute { key, value } if value.is_null() => {
            qb.push(" AND COALESCE(attributes -> ");
            qb.push_bind(key.clone());
            qb.push(", 'null'::jsonb) = 'null'::jsonb");
        }
        Condition::Attribute { key, value } => {
            qb.push(" AND attributes -> ");
            qb.push_bind(key.clone());
            qb.push(" = ");
            qb.push_bind(Json(value.clone()));
        }
        Condition::Never => {
            qb.push(" AND FALSE");
        }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn find_matching(&self, filter: &MatchFilter) -> StoreResult<Vec<StoredEntity>> {
        let _timer = timing_guard(STORE_QUERY_DURATION).label("operation", "find_matching");

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            {SELECT_RECORDS}
            WHERE email = $1
              AND (($2::text IS NOT NULL AND name = $2) OR $3::text IS NULL OR phone = $3)
            ORDER BY inserted_at, id
            "#
        ))
        .bind(&filter.email)
        .bind(&filter.name)
        .bind(&filter.phone)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredEntity::from).collect())
    }

    async fn bulk_write(&self, ops: &[WriteOp], deadline: Instant) -> StoreResult<BulkWriteResult> {
        let mut conn = timeout_at(deadline, self.pool.acquire()).await??;
        let mut outcomes: Vec<StoreResult<()>> = vec![Ok(()); ops.len()];

        if !batchable(ops) {
            let every: Vec<usize> = (0..ops.len()).collect();
            Self::apply_each(&mut conn, ops, &every, deadline, &mut outcomes).await;
            return Ok(BulkWriteResult { outcomes });
        }

        let mut upserts = UpsertBatch::default();
        let mut merges = MergeBatch::default();
        for (index, op) in ops.iter().enumerate() {
            match op {
                WriteOp::Upsert(entity) => upserts.push(index, entity),
                WriteOp::Merge {
                    id,
                    identity,
                    attributes,
                } => merges.push(index, id, identity, attributes),
            }
        }

        if !upserts.indexes.is_empty() {
            let timer = timing_guard(STORE_QUERY_DURATION).label("operation", "bulk_upsert");
            let result = if Instant::now() >= deadline {
                None
            } else {
                timeout_at(deadline, upserts.execute(&mut conn)).await.ok()
            };
            match result {
                Some(Ok(())) => timer.fin(),
                Some(Err(err)) => {
                    timer.fin();
                    warn!(
                        error = %err,
                        ops = upserts.indexes.len(),
                        "batched upsert failed, retrying one by one"
                    );
                    Self::apply_each(&mut conn, ops, &upserts.indexes, deadline, &mut outcomes).await;
                }
                None => {
                    for &index in &upserts.indexes {
                        outcomes[index] = Err(StoreError::Timeout);
                    }
                }
            }
        }

        if !merges.ids.is_empty() {
            let timer = timing_guard(STORE_QUERY_DURATION).label("operation", "bulk_merge");
            let result = if Instant::now() >= deadline {
                None
            } else {
                timeout_at(deadline, merges.execute(&mut conn)).await.ok()
            };
            match result {
                Some(Ok(updated)) => {
                    timer.fin();
                    for (id, indexes) in merges.ids.iter().zip(&merges.indexes) {
                        if !updated.contains(id) {
                            for &index in indexes {
                                outcomes[index] = Err(StoreError::NotFound(id.clone()));
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    timer.fin();
                    let mut indexes: Vec<usize> = merges.indexes.concat();
                    indexes.sort_unstable();
                    warn!(
                        error = %err,
                        ops = indexes.len(),
                        "batched merge failed, retrying one by one"
                    );
                    Self::apply_each(&mut conn, ops, &indexes, deadline, &mut outcomes).await;
                }
                None => {
                    for &index in merges.indexes.iter().flatten() {
                        outcomes[index] = Err(StoreError::Timeout);
                    }
                }
            }
        }

        Ok(BulkWriteResult { outcomes })
    }

    async fn find_all(&self) -> StoreResult<Vec<StoredEntity>> {
        let _timer = timing_guard(STORE_QUERY_DURATION).label("operation", "find_all");

        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            "{SELECT_RECORDS} ORDER BY inserted_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(StoredEntity::from).collect())
    }

    async fn find_by_fields(&self, filter: &EntityFilter) -> StoreResult<Vec<StoredEntity>> {
        let _timer = timing_guard(STORE_QUERY_DURATION).label("operation", "find_by_fields");

        let mut qb = QueryBuilder::<Postgres>::new(SELECT_RECORDS);
        qb.push(" WHERE TRUE");
        for condition in &filter.conditions {
            push_condition(&mut qb, condition);
        }
        qb.push(" ORDER BY inserted_at, id");

        let rows = qb
            .build_query_as::<RecordRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(StoredEntity::from).collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
