use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout_at, Duration, Instant};

use super::{BulkWriteResult, DocumentStore, EntityFilter, StoreError, StoreResult, WriteOp};
use crate::matcher::MatchFilter;
use crate::record::StoredEntity;

#[derive(Debug, Clone, Default)]
struct Faults {
    unavailable: bool,
    failing_ids: HashSet<String>,
    latency: Option<Duration>,
}

/// An in-process store. Backs `STORE_BACKEND=memory` and the tests, with a few knobs
/// to inject the failures a remote store would produce.
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<BTreeMap<String, StoredEntity>>,
    faults: Mutex<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: Vec<StoredEntity>) -> Self {
        let entities = entities
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();

        Self {
            entities: RwLock::new(entities),
            faults: Mutex::default(),
        }
    }

    /// Every call fails with a connection error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults().unavailable = unavailable;
    }

    /// Writes touching `id` fail, the rest of a bulk write goes through.
    pub fn fail_writes_for(&self, id: &str) {
        self.faults().failing_ids.insert(id.to_owned());
    }

    /// Delay applied to every lookup and to every single write.
    pub fn set_latency(&self, latency: Duration) {
        self.faults().latency = Some(latency);
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<StoredEntity> {
        self.entities.read().await.get(id).cloned()
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        // The guarded state is plain data, a panic elsewhere cannot leave it half-written.
        self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> StoreResult<Faults> {
        let faults = self.faults().clone();
        if faults.unavailable {
            return Err(StoreError::Connection("memory store marked unavailable".to_owned()));
        }
        Ok(faults)
    }

    async fn apply(&self, op: &WriteOp, faults: &Faults) -> StoreResult<()> {
        if let Some(latency) = faults.latency {
            sleep(latency).await;
        }
        if faults.failing_ids.contains(op.id()) {
            return Err(StoreError::Query(format!("injected write failure for {}", op.id())));
        }

        let mut entities = self.entities.write().await;
        match op {
            WriteOp::Upsert(entity) => {
                let mut entity = entity.clone();
                if let Some(existing) = entities.get(&entity.id) {
                    entity.inserted_at = existing.inserted_at;
                }
                entities.insert(entity.id.clone(), entity);
            }
            WriteOp::Merge {
                id,
                identity,
                attributes,
            } => {
                let entity = entities
                    .get_mut(id)
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                entity.identity.merge(identity);
                entity
                    .attributes
                    .extend(attributes.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        Ok(())
    }

    async fn select<F>(&self, predicate: F) -> StoreResult<Vec<StoredEntity>>
    where
        F: Fn(&StoredEntity) -> bool,
    {
        let faults = self.snapshot()?;
        if let Some(latency) = faults.latency {
            sleep(latency).await;
        }

        let mut found: Vec<StoredEntity> = self
            .entities
            .read()
            .await
            .values()
            .filter(|entity| predicate(entity))
            .cloned()
            .collect();
        // Stable sort over id order, so ties on inserted_at stay ordered by id.
        found.sort_by_key(|entity| entity.inserted_at);

        Ok(found)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_matching(&self, filter: &MatchFilter) -> StoreResult<Vec<StoredEntity>> {
        self.select(|entity| filter.matches(&entity.identity)).await
    }

    async fn bulk_write(&self, ops: &[WriteOp], deadline: Instant) -> StoreResult<BulkWriteResult> {
        let faults = self.snapshot()?;

        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            if Instant::now() >= deadline {
                outcomes.push(Err(StoreError::Timeout));
                continue;
            }
            let outcome = timeout_at(deadline, self.apply(op, &faults))
                .await
                .unwrap_or(Err(StoreError::Timeout));
            outcomes.push(outcome);
        }

        Ok(BulkWriteResult { outcomes })
    }

    async fn find_all(&self) -> StoreResult<Vec<StoredEntity>> {
        self.select(|_| true).await
    }

    async fn find_by_fields(&self, filter: &EntityFilter) -> StoreResult<Vec<StoredEntity>> {
        self.select(|entity| filter.matches(entity)).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.snapshot().map(|_| ())
    }
}
