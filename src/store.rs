//! Pool store: the only shared mutable state of the pool.
//!
//! `PoolStore` is the contract the pool depends on. Every method is atomic with
//! respect to concurrent callers; `claim_one` is the single mutation path from
//! AVAILABLE to CLAIMED. `MemoryPoolStore` implements it with one mutex over
//! per-template FIFO queues, so a claim is a serialized queue pop.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::{GeneratedInstance, InstanceState, StudentId, TemplateId};
use crate::error::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store-wide counters feeding pool statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreTotals {
    /// Instances ever inserted (purged ones included).
    pub generated: u64,
    pub claimed: u64,
    pub available: u64,
    /// Sum of `generation_duration_ms` over every inserted instance.
    pub generation_ms_total: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TemplateTotals {
    pub available: u64,
    pub claimed: u64,
}

#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Store an instance as given (AVAILABLE stock, or an already-claimed on-demand instance).
    async fn insert(&self, instance: GeneratedInstance) -> StoreResult<()>;

    /// Atomically claim the oldest AVAILABLE instance of a template.
    async fn claim_one(
        &self,
        template_id: TemplateId,
        student_id: StudentId,
    ) -> StoreResult<Option<GeneratedInstance>>;

    async fn available_count(&self, template_id: TemplateId) -> StoreResult<usize>;

    async fn has_claimed_by_student(
        &self,
        template_id: TemplateId,
        student_id: StudentId,
    ) -> StoreResult<bool>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<GeneratedInstance>>;

    async fn totals(&self) -> StoreResult<StoreTotals>;

    async fn template_totals(&self, template_id: TemplateId) -> StoreResult<TemplateTotals>;

    /// Templates ordered by number of claimed instances, most claimed first.
    async fn most_demanded_templates(&self, limit: usize) -> StoreResult<Vec<TemplateId>>;

    /// Remove AVAILABLE instances generated before `cutoff`. CLAIMED instances are kept.
    async fn purge_stale_available(&self, cutoff: DateTime<Utc>) -> StoreResult<usize>;
}

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, GeneratedInstance>,
    /// AVAILABLE ids per template, ordered by `generated_at` (oldest first).
    available: HashMap<TemplateId, VecDeque<Uuid>>,
    claimed_per_template: HashMap<TemplateId, u64>,
    issued: HashSet<(TemplateId, StudentId)>,
    generated_total: u64,
    generation_ms_total: u64,
}

impl Inner {
    fn record_claim(&mut self, template_id: TemplateId, student: Option<StudentId>) {
        *self.claimed_per_template.entry(template_id).or_insert(0) += 1;
        if let Some(student) = student {
            self.issued.insert((template_id, student));
        }
    }
}

/// In-process `PoolStore`.
#[derive(Default)]
pub struct MemoryPoolStore {
    inner: Mutex<Inner>,
}

impl MemoryPoolStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolStore for MemoryPoolStore {
    #[instrument(level = "debug", skip(self, instance), fields(id = %instance.id, template_id = %instance.template_id, state = ?instance.state))]
    async fn insert(&self, instance: GeneratedInstance) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.instances.contains_key(&instance.id) {
            warn!(target: "pool", id = %instance.id, "Duplicate instance id ignored");
            return Ok(());
        }

        inner.generated_total += 1;
        inner.generation_ms_total += instance.generation_duration_ms;

        match instance.state {
            InstanceState::Available => {
                let template_id = instance.template_id;
                let generated_at = instance.generated_at;
                let id = instance.id;
                inner.instances.insert(id, instance);

                // Keep the queue ordered by generation time; appends are the common case.
                let Inner { instances, available, .. } = &mut *inner;
                let queue = available.entry(template_id).or_default();
                let pos = queue.partition_point(|other| {
                    instances
                        .get(other)
                        .map(|o| o.generated_at <= generated_at)
                        .unwrap_or(true)
                });
                queue.insert(pos, id);
            }
            InstanceState::Claimed => {
                inner.record_claim(instance.template_id, instance.claimed_by);
                inner.instances.insert(instance.id, instance);
            }
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(%template_id, %student_id))]
    async fn claim_one(
        &self,
        template_id: TemplateId,
        student_id: StudentId,
    ) -> StoreResult<Option<GeneratedInstance>> {
        let mut inner = self.inner.lock().await;
        let Inner { instances, available, claimed_per_template, issued, .. } = &mut *inner;

        let Some(queue) = available.get_mut(&template_id) else {
            return Ok(None);
        };

        while let Some(id) = queue.pop_front() {
            let Some(instance) = instances.get_mut(&id) else {
                continue;
            };
            if !instance.claim(student_id, Utc::now()) {
                continue;
            }
            let claimed = instance.clone();
            *claimed_per_template.entry(template_id).or_insert(0) += 1;
            issued.insert((template_id, student_id));
            debug!(target: "pool", id = %claimed.id, %template_id, %student_id, "Claimed pooled instance");
            return Ok(Some(claimed));
        }
        Ok(None)
    }

    async fn available_count(&self, template_id: TemplateId) -> StoreResult<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.available.get(&template_id).map(|q| q.len()).unwrap_or(0))
    }

    async fn has_claimed_by_student(
        &self,
        template_id: TemplateId,
        student_id: StudentId,
    ) -> StoreResult<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.issued.contains(&(template_id, student_id)))
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<GeneratedInstance>> {
        let inner = self.inner.lock().await;
        Ok(inner.instances.get(&id).cloned())
    }

    async fn totals(&self) -> StoreResult<StoreTotals> {
        let inner = self.inner.lock().await;
        Ok(StoreTotals {
            generated: inner.generated_total,
            claimed: inner.claimed_per_template.values().sum(),
            available: inner.available.values().map(|q| q.len() as u64).sum(),
            generation_ms_total: inner.generation_ms_total,
        })
    }

    async fn template_totals(&self, template_id: TemplateId) -> StoreResult<TemplateTotals> {
        let inner = self.inner.lock().await;
        Ok(TemplateTotals {
            available: inner.available.get(&template_id).map(|q| q.len() as u64).unwrap_or(0),
            claimed: inner.claimed_per_template.get(&template_id).copied().unwrap_or(0),
        })
    }

    async fn most_demanded_templates(&self, limit: usize) -> StoreResult<Vec<TemplateId>> {
        let inner = self.inner.lock().await;
        let mut ranked: Vec<(TemplateId, u64)> = inner
            .claimed_per_template
            .iter()
            .map(|(id, n)| (*id, *n))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(ranked.into_iter().take(limit).map(|(id, _)| id).collect())
    }

    #[instrument(level = "info", skip(self))]
    async fn purge_stale_available(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let mut inner = self.inner.lock().await;
        let Inner { instances, available, .. } = &mut *inner;

        let mut purged = 0;
        for queue in available.values_mut() {
            queue.retain(|id| {
                let stale = instances
                    .get(id)
                    .map(|i| i.is_available() && i.generated_at < cutoff)
                    .unwrap_or(true);
                if stale {
                    instances.remove(id);
                    purged += 1;
                }
                !stale
            });
        }
        available.retain(|_, q| !q.is_empty());
        Ok(purged)
    }
}
