//! Pool service: hands out generated exercises, preferring pre-generated stock.
//!
//! The hot path claims from the store and only waits on the authoring service
//! when the pool is empty. Every issuance fires a low-water check on a spawned
//! task, so callers never wait on replenishment.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::TemplateCatalog;
use crate::config::{MaintenanceSettings, PoolConfig, PoolSettings};
use crate::domain::{Difficulty, GeneratedInstance, StudentId, TemplateId};
use crate::error::PoolError;
use crate::generator::Generator;
use crate::maintenance::{self, MaintenanceReport};
use crate::openai::GenerationClient;
use crate::replenish::{BatchHandle, ReplenishmentCoordinator, ReplenishmentTask, WarmUpReport};
use crate::store::PoolStore;

/// Where an issued exercise came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExerciseSource {
  Pool,
  Generated,
  Fallback,
}

#[derive(Clone, Debug)]
pub struct Issued {
  pub exercise: GeneratedInstance,
  pub source: ExerciseSource,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatistics {
  pub total_generated: u64,
  pub total_claimed: u64,
  pub available_in_pool: u64,
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub cache_hit_rate: f64,
  pub average_generation_time_ms: f64,
  pub failed_generations: u64,
  pub replenish_checks: u64,
  pub replenishment_batches: u64,
  /// Triggers folded into a batch that was already running.
  pub coalesced_triggers: u64,
  pub in_flight_batches: Vec<ReplenishmentTask>,
  pub model: String,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateStatistics {
  pub template_id: TemplateId,
  pub available: u64,
  pub claimed: u64,
  pub in_flight: bool,
}

pub struct PoolService {
  store: Arc<dyn PoolStore>,
  catalog: Arc<TemplateCatalog>,
  generator: Arc<Generator>,
  coordinator: Arc<ReplenishmentCoordinator>,
  settings: PoolSettings,
  maintenance: MaintenanceSettings,
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  replenish_checks: AtomicU64,
}

impl PoolService {
  pub fn new(
    store: Arc<dyn PoolStore>,
    catalog: Arc<TemplateCatalog>,
    client: Arc<dyn GenerationClient>,
    config: &PoolConfig,
  ) -> Self {
    let generator = Arc::new(Generator::new(client, config.generation.clone()));
    let coordinator = Arc::new(ReplenishmentCoordinator::new(
      store.clone(),
      generator.clone(),
      catalog.clone(),
      config.pool.clone(),
      config.generation.max_concurrent_calls,
    ));
    info!(
      target: "pool",
      enabled = config.pool.enabled,
      low_water_mark = config.pool.low_water_mark,
      batch_size = config.pool.batch_size,
      max_per_template = config.pool.max_per_template,
      model = %generator.model(),
      "Exercise pool ready"
    );
    Self {
      store,
      catalog,
      generator,
      coordinator,
      settings: config.pool.clone(),
      maintenance: config.maintenance.clone(),
      cache_hits: AtomicU64::new(0),
      cache_misses: AtomicU64::new(0),
      replenish_checks: AtomicU64::new(0),
    }
  }

  pub fn catalog(&self) -> &TemplateCatalog { &self.catalog }

  pub fn maintenance_settings(&self) -> &MaintenanceSettings { &self.maintenance }

  /// Next exercise for a student: pool first, on-demand generation on a miss.
  #[instrument(level = "info", skip(self), fields(%template_id, %difficulty, %student_id))]
  pub async fn next_exercise(
    &self,
    template_id: TemplateId,
    difficulty: Difficulty,
    student_id: StudentId,
  ) -> Result<Issued, PoolError> {
    // Rejected requests touch neither the stock nor the hit/miss counters.
    let template = match self.catalog.get(template_id) {
      Some(t) if t.active => t,
      Some(_) => return Err(PoolError::TemplateInactive(template_id)),
      None => return Err(PoolError::UnknownTemplate(template_id)),
    };

    // Best-effort: two concurrent requests from one student can both pass.
    if self.settings.unique_per_student
      && self.store.has_claimed_by_student(template_id, student_id).await?
    {
      return Err(PoolError::AlreadyIssued { template_id, student_id });
    }

    if self.settings.enabled {
      if let Some(exercise) = self.store.claim_one(template_id, student_id).await? {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        debug!(target: "pool", id = %exercise.id, "Served from pool");
        self.spawn_replenish(template_id);
        return Ok(Issued { exercise, source: ExerciseSource::Pool });
      }
    }

    self.cache_misses.fetch_add(1, Ordering::Relaxed);
    info!(target: "pool", "Pool empty; generating on demand");

    let generated = self.generator.generate(template, difficulty).await;
    // The pool is empty either way; ask for stock before reporting the outcome.
    self.spawn_replenish(template_id);
    let mut exercise = generated.map_err(|source| {
      warn!(target: "pool", error = %source, "On-demand generation failed");
      PoolError::ContentUnavailable { template_id, source }
    })?;

    exercise.claim(student_id, Utc::now());
    self.store.insert(exercise.clone()).await?;
    Ok(Issued { exercise, source: ExerciseSource::Generated })
  }

  pub async fn exercise(&self, id: Uuid) -> Result<Option<GeneratedInstance>, PoolError> {
    Ok(self.store.get(id).await?)
  }

  pub async fn available_count(&self, template_id: TemplateId) -> Result<usize, PoolError> {
    Ok(self.store.available_count(template_id).await?)
  }

  pub async fn has_available_exercises(&self, template_id: TemplateId) -> Result<bool, PoolError> {
    Ok(self.available_count(template_id).await? > 0)
  }

  pub fn warm_up_pool(&self, template_ids: &[TemplateId]) -> WarmUpReport {
    self.coordinator.warm_up(template_ids)
  }

  pub fn generate_exercises_async(&self, template_id: TemplateId, count: usize) -> BatchHandle {
    self.coordinator.generate_async(template_id, count)
  }

  #[instrument(level = "debug", skip(self))]
  pub async fn pool_statistics(&self) -> Result<PoolStatistics, PoolError> {
    let totals = self.store.totals().await?;
    let hits = self.cache_hits.load(Ordering::Relaxed);
    let misses = self.cache_misses.load(Ordering::Relaxed);
    let cache_hit_rate = if hits + misses == 0 { 0.0 } else { hits as f64 / (hits + misses) as f64 };
    let average_generation_time_ms = if totals.generated == 0 {
      0.0
    } else {
      totals.generation_ms_total as f64 / totals.generated as f64
    };

    Ok(PoolStatistics {
      total_generated: totals.generated,
      total_claimed: totals.claimed,
      available_in_pool: totals.available,
      cache_hits: hits,
      cache_misses: misses,
      cache_hit_rate,
      average_generation_time_ms,
      failed_generations: self.generator.stats().failed_generations,
      replenish_checks: self.replenish_checks.load(Ordering::Relaxed),
      replenishment_batches: self.coordinator.batches_started(),
      coalesced_triggers: self.coordinator.batches_coalesced(),
      in_flight_batches: self.coordinator.in_flight_tasks(),
      model: self.generator.model().to_string(),
    })
  }

  pub async fn template_statistics(&self, template_id: TemplateId) -> Result<TemplateStatistics, PoolError> {
    if self.catalog.get(template_id).is_none() {
      return Err(PoolError::UnknownTemplate(template_id));
    }
    let totals = self.store.template_totals(template_id).await?;
    Ok(TemplateStatistics {
      template_id,
      available: totals.available,
      claimed: totals.claimed,
      in_flight: self.coordinator.is_in_flight(template_id),
    })
  }

  pub async fn run_maintenance(&self) -> MaintenanceReport {
    maintenance::run_pass(self.store.as_ref(), &self.coordinator, &self.catalog, &self.maintenance).await
  }

  fn spawn_replenish(&self, template_id: TemplateId) {
    self.replenish_checks.fetch_add(1, Ordering::Relaxed);
    let coordinator = self.coordinator.clone();
    tokio::spawn(async move {
      match coordinator.maybe_replenish(template_id).await {
        Ok(decision) => debug!(target: "pool", %template_id, ?decision, "Replenishment check done"),
        Err(e) => warn!(target: "pool", %template_id, error = %e, "Replenishment check failed"),
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{ExerciseContent, ExerciseTemplate, InstanceState};
  use crate::error::{GenerationError, StoreError};
  use crate::store::{MemoryPoolStore, StoreResult, StoreTotals, TemplateTotals};
  use crate::testing::{template, StubClient};
  use async_trait::async_trait;
  use chrono::DateTime;
  use serde_json::json;
  use std::collections::HashSet;
  use std::time::{Duration, Instant};

  struct Fixture {
    client: Arc<StubClient>,
    store: Arc<MemoryPoolStore>,
    pool: Arc<PoolService>,
  }

  fn config(pool: PoolSettings, max_concurrent_calls: usize) -> PoolConfig {
    let mut config = PoolConfig::default();
    config.pool = pool;
    config.generation.max_retries = 0;
    config.generation.max_concurrent_calls = max_concurrent_calls;
    config
  }

  fn fixture(client: StubClient, config: PoolConfig) -> Fixture {
    let client = Arc::new(client);
    let store = Arc::new(MemoryPoolStore::new());
    let catalog = Arc::new(TemplateCatalog::from_sources(
      vec![template(5), template(7), template(9)],
      vec![ExerciseTemplate { active: false, ..template(11) }],
    ));
    let pool = Arc::new(PoolService::new(store.clone(), catalog, client.clone(), &config));
    Fixture { client, store, pool }
  }

  async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..400 {
      if done() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn test_empty_pool_generates_on_demand() {
    let f = fixture(
      StubClient::new().with_latency(Duration::from_millis(50)),
      config(PoolSettings::default(), 2),
    );

    let started = Instant::now();
    let issued = f.pool.next_exercise(TemplateId(5), Difficulty::Medium, StudentId(1)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(issued.source, ExerciseSource::Generated);
    assert_eq!(issued.exercise.claimed_by, Some(StudentId(1)));
    assert!(!issued.exercise.is_available());
    assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(500));

    let coordinator = f.pool.coordinator.clone();
    wait_for(|| coordinator.batches_started() == 1).await;
    let stats = f.pool.pool_statistics().await.unwrap();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 0);
    assert_eq!(stats.replenish_checks, 1);

    let stored = f.store.get(issued.exercise.id).await.unwrap().unwrap();
    assert_eq!(stored.claimed_by, Some(StudentId(1)));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_students_drain_stock_then_generate() {
    let pool_settings = PoolSettings { batch_size: 10, ..Default::default() };
    let f = fixture(StubClient::new().with_latency(Duration::from_millis(50)), config(pool_settings, 2));
    f.pool.generate_exercises_async(TemplateId(7), 3).join().await;
    let calls_before = f.client.calls();

    let mut students = Vec::new();
    for s in 1..=5 {
      let pool = f.pool.clone();
      students.push(tokio::spawn(async move {
        pool.next_exercise(TemplateId(7), Difficulty::Medium, StudentId(s)).await.unwrap()
      }));
    }
    let mut issued = Vec::new();
    for s in students {
      issued.push(s.await.unwrap());
    }

    let from_pool: Vec<_> = issued.iter().filter(|i| i.source == ExerciseSource::Pool).collect();
    let generated = issued.iter().filter(|i| i.source == ExerciseSource::Generated).count();
    assert_eq!(from_pool.len(), 3);
    assert_eq!(generated, 2);
    let ids: HashSet<_> = issued.iter().map(|i| i.exercise.id).collect();
    assert_eq!(ids.len(), 5);
    assert!(f.client.calls() >= calls_before + 2);

    // Five triggers, one batch: the batch outlives every later check.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = f.pool.pool_statistics().await.unwrap();
    assert_eq!(stats.replenish_checks, 5);
    assert_eq!(stats.replenishment_batches, 2); // manual seed batch + one low-water batch
    assert_eq!(stats.cache_hits, 3);
    assert_eq!(stats.cache_misses, 2);
    assert!((stats.cache_hit_rate - 0.6).abs() < 1e-9);
  }

  #[tokio::test]
  async fn test_warm_up_twice_executes_one_batch() {
    let pool_settings = PoolSettings { batch_size: 4, ..Default::default() };
    let f = fixture(StubClient::new().with_latency(Duration::from_millis(50)), config(pool_settings, 4));

    let first = f.pool.warm_up_pool(&[TemplateId(9)]);
    let second = f.pool.warm_up_pool(&[TemplateId(9)]);
    assert_eq!(first.scheduled, vec![TemplateId(9)]);
    assert_eq!(second.already_in_flight, vec![TemplateId(9)]);

    let coordinator = f.pool.coordinator.clone();
    wait_for(|| !coordinator.is_in_flight(TemplateId(9))).await;
    assert_eq!(f.client.calls(), 4);
    assert!(f.pool.has_available_exercises(TemplateId(9)).await.unwrap());
  }

  #[tokio::test]
  async fn test_generation_failure_is_content_unavailable() {
    let f = fixture(
      StubClient::new().always_failing(GenerationError::Transient("503".into())),
      config(PoolSettings::default(), 2),
    );
    let err = f.pool.next_exercise(TemplateId(5), Difficulty::Easy, StudentId(3)).await.unwrap_err();
    assert!(matches!(err, PoolError::ContentUnavailable { template_id: TemplateId(5), .. }));

    let coordinator = f.pool.coordinator.clone();
    wait_for(|| coordinator.batches_started() == 1 && coordinator.in_flight_count() == 0).await;
    let stats = f.pool.pool_statistics().await.unwrap();
    assert_eq!(stats.total_generated, 0);
    assert!(stats.failed_generations >= 1);
    assert_eq!(stats.average_generation_time_ms, 0.0);
  }

  #[tokio::test]
  async fn test_unknown_and_inactive_templates() {
    let f = fixture(StubClient::new(), config(PoolSettings::default(), 2));
    let unknown = f.pool.next_exercise(TemplateId(99), Difficulty::Easy, StudentId(1)).await.unwrap_err();
    assert!(matches!(unknown, PoolError::UnknownTemplate(TemplateId(99))));
    let inactive = f.pool.next_exercise(TemplateId(11), Difficulty::Easy, StudentId(1)).await.unwrap_err();
    assert!(matches!(inactive, PoolError::TemplateInactive(TemplateId(11))));
    assert!(matches!(f.pool.template_statistics(TemplateId(99)).await, Err(PoolError::UnknownTemplate(_))));
    assert_eq!(f.client.calls(), 0);
  }

  #[tokio::test]
  async fn test_rejected_requests_do_not_count_as_misses() {
    let f = fixture(StubClient::new(), config(PoolSettings::default(), 2));
    f.pool.generate_exercises_async(TemplateId(5), 1).join().await;
    f.pool.next_exercise(TemplateId(5), Difficulty::Medium, StudentId(1)).await.unwrap();
    for s in 2..=4 {
      assert!(f.pool.next_exercise(TemplateId(99), Difficulty::Medium, StudentId(s)).await.is_err());
    }
    assert!(f.pool.next_exercise(TemplateId(11), Difficulty::Medium, StudentId(5)).await.is_err());

    let stats = f.pool.pool_statistics().await.unwrap();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 0);
    assert_eq!(stats.cache_hit_rate, 1.0);
    assert_eq!(stats.replenish_checks, 1);
  }

  #[tokio::test]
  async fn test_inactive_template_keeps_its_stock() {
    let f = fixture(StubClient::new(), config(PoolSettings::default(), 2));
    let leftover = GeneratedInstance {
      id: Uuid::new_v4(),
      template_id: TemplateId(11),
      difficulty: Difficulty::Medium,
      content: ExerciseContent(json!({"question": "q", "correct_answer": "a"})),
      answer_hash: None,
      model: "stub-model".into(),
      generated_at: Utc::now(),
      generation_duration_ms: 5,
      state: InstanceState::Available,
      claimed_by: None,
      claimed_at: None,
    };
    f.store.insert(leftover).await.unwrap();

    let err = f.pool.next_exercise(TemplateId(11), Difficulty::Medium, StudentId(1)).await.unwrap_err();
    assert!(matches!(err, PoolError::TemplateInactive(TemplateId(11))));
    assert_eq!(f.pool.available_count(TemplateId(11)).await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_unique_per_student_blocks_repeats() {
    let pool_settings = PoolSettings { unique_per_student: true, ..Default::default() };
    let f = fixture(StubClient::new(), config(pool_settings, 2));

    f.pool.next_exercise(TemplateId(5), Difficulty::Medium, StudentId(8)).await.unwrap();
    let err = f.pool.next_exercise(TemplateId(5), Difficulty::Medium, StudentId(8)).await.unwrap_err();
    assert!(matches!(err, PoolError::AlreadyIssued { student_id: StudentId(8), .. }));
    assert!(f.pool.next_exercise(TemplateId(5), Difficulty::Medium, StudentId(9)).await.is_ok());
  }

  #[tokio::test]
  async fn test_disabled_pool_always_generates() {
    let pool_settings = PoolSettings { enabled: false, ..Default::default() };
    let f = fixture(StubClient::new(), config(pool_settings, 2));
    f.pool.generate_exercises_async(TemplateId(5), 2).join().await;

    let issued = f.pool.next_exercise(TemplateId(5), Difficulty::Hard, StudentId(1)).await.unwrap();
    assert_eq!(issued.source, ExerciseSource::Generated);
    assert_eq!(issued.exercise.difficulty, Difficulty::Hard);
    assert_eq!(f.pool.available_count(TemplateId(5)).await.unwrap(), 2);
  }

  #[tokio::test]
  async fn test_statistics_stay_consistent() {
    let pool_settings = PoolSettings { low_water_mark: 0, ..Default::default() };
    let f = fixture(StubClient::new(), config(pool_settings, 2));
    f.pool.generate_exercises_async(TemplateId(5), 4).join().await;

    for s in 1..=6 {
      f.pool.next_exercise(TemplateId(5), Difficulty::Medium, StudentId(s)).await.unwrap();
    }
    let stats = f.pool.pool_statistics().await.unwrap();
    assert_eq!(stats.total_generated, 6);
    assert_eq!(stats.total_claimed, 6);
    assert_eq!(stats.available_in_pool, 0);
    assert_eq!(stats.cache_hits + stats.cache_misses, 6);
    assert_eq!(stats.total_generated, stats.total_claimed + stats.available_in_pool);
    assert_eq!(stats.model, "stub-model");

    let per_template = f.pool.template_statistics(TemplateId(5)).await.unwrap();
    assert_eq!(per_template.claimed, 6);
    assert_eq!(per_template.available, 0);
  }

  struct FailingStore;

  #[async_trait]
  impl PoolStore for FailingStore {
    async fn insert(&self, _: GeneratedInstance) -> StoreResult<()> {
      Err(StoreError::Unavailable("db down".into()))
    }
    async fn claim_one(&self, _: TemplateId, _: StudentId) -> StoreResult<Option<GeneratedInstance>> {
      Err(StoreError::Unavailable("db down".into()))
    }
    async fn available_count(&self, _: TemplateId) -> StoreResult<usize> {
      Err(StoreError::Unavailable("db down".into()))
    }
    async fn has_claimed_by_student(&self, _: TemplateId, _: StudentId) -> StoreResult<bool> {
      Err(StoreError::Unavailable("db down".into()))
    }
    async fn get(&self, _: Uuid) -> StoreResult<Option<GeneratedInstance>> {
      Err(StoreError::Unavailable("db down".into()))
    }
    async fn totals(&self) -> StoreResult<StoreTotals> {
      Err(StoreError::Unavailable("db down".into()))
    }
    async fn template_totals(&self, _: TemplateId) -> StoreResult<TemplateTotals> {
      Err(StoreError::Unavailable("db down".into()))
    }
    async fn most_demanded_templates(&self, _: usize) -> StoreResult<Vec<TemplateId>> {
      Err(StoreError::Unavailable("db down".into()))
    }
    async fn purge_stale_available(&self, _: DateTime<Utc>) -> StoreResult<usize> {
      Err(StoreError::Unavailable("db down".into()))
    }
  }

  #[tokio::test]
  async fn test_store_outage_surfaces_as_store_unavailable() {
    let catalog = Arc::new(TemplateCatalog::from_sources(vec![template(5)], vec![]));
    let client = Arc::new(StubClient::new());
    let pool = PoolService::new(Arc::new(FailingStore), catalog, client.clone(), &PoolConfig::default());

    let err = pool.next_exercise(TemplateId(5), Difficulty::Easy, StudentId(1)).await.unwrap_err();
    assert!(matches!(err, PoolError::StoreUnavailable(_)));
    assert!(matches!(pool.pool_statistics().await, Err(PoolError::StoreUnavailable(_))));
    assert_eq!(client.calls(), 0);
  }
}
