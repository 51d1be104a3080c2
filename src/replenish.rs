//! Background replenishment with per-template single-flight.
//!
//! At most one replenishment batch runs per template at any time. Registration
//! is an atomic insert-if-absent on a `DashMap`; the marker is removed by a
//! drop guard owned by the batch task, so it is cleared on success, failure
//! and panic alike.
//!
//! ```text
//! maybe_replenish(T) ──► available < low water? ──► entry(T) vacant? ──► spawn batch
//!                                 │ no                    │ occupied
//!                                 ▼                       ▼
//!                             Sufficient            AlreadyInFlight
//! ```
//!
//! Batches never run on the caller's task. Generation calls from all batches
//! share one semaphore, bounding load on the authoring service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::TemplateCatalog;
use crate::config::PoolSettings;
use crate::domain::{ExerciseTemplate, TemplateId};
use crate::error::StoreError;
use crate::generator::Generator;
use crate::store::PoolStore;

/// Why a batch was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    LowWater,
    WarmUp,
    Manual,
}

/// In-flight marker: "a batch for this template is running".
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplenishmentTask {
    pub template_id: TemplateId,
    pub target_count: usize,
    pub started_at: DateTime<Utc>,
    pub trigger: Trigger,
}

/// Handle on a batch; resolves to the number of instances generated.
#[derive(Debug)]
pub struct BatchHandle {
    task: Option<JoinHandle<usize>>,
}

impl BatchHandle {
    fn skipped() -> Self {
        Self { task: None }
    }

    /// False when the request was folded into an already running batch or rejected.
    pub fn is_scheduled(&self) -> bool {
        self.task.is_some()
    }

    pub async fn join(self) -> usize {
        match self.task {
            Some(task) => task.await.unwrap_or_else(|e| {
                error!(target: "replenish", error = %e, "Replenishment batch task failed");
                0
            }),
            None => 0,
        }
    }
}

/// Outcome of a low-water check.
#[derive(Debug)]
pub enum ReplenishDecision {
    Scheduled { count: usize, handle: BatchHandle },
    AlreadyInFlight,
    Sufficient { available: usize },
    Disabled,
    UnknownTemplate,
    Inactive,
}

/// Result of a warm-up request.
#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpReport {
    pub scheduled: Vec<TemplateId>,
    /// Templates with a batch already in flight.
    pub already_in_flight: Vec<TemplateId>,
    /// Unknown or inactive templates.
    pub rejected: Vec<TemplateId>,
}

/// Removes the in-flight marker when the batch ends, however it ends.
struct InFlightGuard {
    in_flight: Arc<DashMap<TemplateId, ReplenishmentTask>>,
    template_id: TemplateId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.template_id);
        debug!(target: "replenish", template_id = %self.template_id, "In-flight marker cleared");
    }
}

pub struct ReplenishmentCoordinator {
    store: Arc<dyn PoolStore>,
    generator: Arc<Generator>,
    catalog: Arc<TemplateCatalog>,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashMap<TemplateId, ReplenishmentTask>>,
    batches_started: AtomicU64,
    batches_coalesced: AtomicU64,
}

impl ReplenishmentCoordinator {
    pub fn new(
        store: Arc<dyn PoolStore>,
        generator: Arc<Generator>,
        catalog: Arc<TemplateCatalog>,
        settings: PoolSettings,
        max_concurrent_calls: usize,
    ) -> Self {
        Self {
            store,
            generator,
            catalog,
            settings,
            permits: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            in_flight: Arc::new(DashMap::new()),
            batches_started: AtomicU64::new(0),
            batches_coalesced: AtomicU64::new(0),
        }
    }

    /// Schedule a background batch if the template is below its low-water mark
    /// and none is already running. Never generates inline.
    #[instrument(level = "debug", skip(self), fields(%template_id))]
    pub async fn maybe_replenish(&self, template_id: TemplateId) -> Result<ReplenishDecision, StoreError> {
        if !self.settings.enabled {
            return Ok(ReplenishDecision::Disabled);
        }
        let template = match self.catalog.get(template_id) {
            Some(t) if t.active => t,
            Some(_) => return Ok(ReplenishDecision::Inactive),
            None => return Ok(ReplenishDecision::UnknownTemplate),
        };
        // Cheap pre-check; the entry insert below is the real guard.
        if self.in_flight.contains_key(&template_id) {
            self.batches_coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(ReplenishDecision::AlreadyInFlight);
        }

        let available = self.store.available_count(template_id).await?;
        if available >= self.settings.low_water_mark {
            return Ok(ReplenishDecision::Sufficient { available });
        }
        let count = self
            .settings
            .batch_size
            .min(self.settings.max_per_template.saturating_sub(available));
        if count == 0 {
            return Ok(ReplenishDecision::Sufficient { available });
        }

        let handle = self.try_schedule(template, count, Trigger::LowWater);
        if handle.is_scheduled() {
            info!(target: "replenish", %template_id, available, count, "Low-water replenishment scheduled");
            Ok(ReplenishDecision::Scheduled { count, handle })
        } else {
            Ok(ReplenishDecision::AlreadyInFlight)
        }
    }

    /// Force one batch per template regardless of stock. Templates with a batch
    /// already running are skipped, not queued.
    #[instrument(level = "info", skip(self, template_ids), fields(templates = template_ids.len()))]
    pub fn warm_up(&self, template_ids: &[TemplateId]) -> WarmUpReport {
        let mut report = WarmUpReport::default();
        for &template_id in template_ids {
            let Some(template) = self.catalog.get(template_id).filter(|t| t.active) else {
                warn!(target: "replenish", %template_id, "Warm-up skipped: unknown or inactive template");
                report.rejected.push(template_id);
                continue;
            };
            if self
                .try_schedule(template, self.settings.batch_size, Trigger::WarmUp)
                .is_scheduled()
            {
                report.scheduled.push(template_id);
            } else {
                report.already_in_flight.push(template_id);
            }
        }
        info!(target: "replenish", scheduled = report.scheduled.len(), in_flight = report.already_in_flight.len(), rejected = report.rejected.len(), "Pool warm-up requested");
        report
    }

    /// Generate `count` instances in the background. Partial failure only
    /// lowers the resolved count.
    #[instrument(level = "info", skip(self), fields(%template_id, count = count))]
    pub fn generate_async(&self, template_id: TemplateId, count: usize) -> BatchHandle {
        match self.catalog.get(template_id) {
            Some(template) if template.active && count > 0 => {
                self.try_schedule(template, count, Trigger::Manual)
            }
            _ => {
                warn!(target: "replenish", %template_id, count, "Generation request rejected");
                BatchHandle::skipped()
            }
        }
    }

    pub fn is_in_flight(&self, template_id: TemplateId) -> bool {
        self.in_flight.contains_key(&template_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_tasks(&self) -> Vec<ReplenishmentTask> {
        self.in_flight.iter().map(|e| e.value().clone()).collect()
    }

    pub fn batches_started(&self) -> u64 {
        self.batches_started.load(Ordering::Relaxed)
    }

    pub fn batches_coalesced(&self) -> u64 {
        self.batches_coalesced.load(Ordering::Relaxed)
    }

    /// Register the in-flight marker and spawn the batch, or do nothing if one exists.
    fn try_schedule(&self, template: &ExerciseTemplate, count: usize, trigger: Trigger) -> BatchHandle {
        let template_id = template.id;
        let registered = match self.in_flight.entry(template_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ReplenishmentTask {
                    template_id,
                    target_count: count,
                    started_at: Utc::now(),
                    trigger,
                });
                true
            }
        };
        if !registered {
            self.batches_coalesced.fetch_add(1, Ordering::Relaxed);
            debug!(target: "replenish", %template_id, ?trigger, "Batch already in flight");
            return BatchHandle::skipped();
        }
        self.batches_started.fetch_add(1, Ordering::Relaxed);

        let guard = InFlightGuard { in_flight: self.in_flight.clone(), template_id };
        let batch = Batch {
            store: self.store.clone(),
            generator: self.generator.clone(),
            permits: self.permits.clone(),
            template: Arc::new(template.clone()),
            count,
            trigger,
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            batch.run().await
        });
        BatchHandle { task: Some(task) }
    }
}

struct Batch {
    store: Arc<dyn PoolStore>,
    generator: Arc<Generator>,
    permits: Arc<Semaphore>,
    template: Arc<ExerciseTemplate>,
    count: usize,
    trigger: Trigger,
}

impl Batch {
    #[instrument(level = "info", skip(self), fields(template_id = %self.template.id, count = self.count, trigger = ?self.trigger))]
    async fn run(self) -> usize {
        let started = std::time::Instant::now();
        let difficulty = self.template.difficulty;
        let mut calls = JoinSet::new();

        for _ in 0..self.count {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let generator = self.generator.clone();
            let store = self.store.clone();
            let template = self.template.clone();
            calls.spawn(async move {
                let _permit = permit;
                let instance = match generator.generate(&template, difficulty).await {
                    Ok(instance) => instance,
                    Err(e) => {
                        warn!(target: "replenish", template_id = %template.id, error = %e, "Pool generation failed");
                        return false;
                    }
                };
                match store.insert(instance).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(target: "replenish", template_id = %template.id, error = %e, "Could not store generated instance");
                        false
                    }
                }
            });
        }

        let mut generated = 0;
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(true) => generated += 1,
                Ok(false) => {}
                Err(e) => error!(target: "replenish", error = %e, "Generation task aborted"),
            }
        }

        info!(
            target: "replenish",
            template_id = %self.template.id,
            generated,
            requested = self.count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Replenishment batch finished"
        );
        generated
    }
}
