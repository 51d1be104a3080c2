//! Generator: turns a template into one `GeneratedInstance`.
//!
//! Wraps a `GenerationClient` with a per-call timeout, bounded retries with
//! exponential backoff (plus jitter) for transient failures, and timing.
//! Persistence is the caller's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::GenerationSettings;
use crate::domain::{Difficulty, ExerciseTemplate, GeneratedInstance, InstanceState};
use crate::error::GenerationError;
use crate::openai::{GenerationClient, GenerationRequest};
use crate::util::{answer_hash, fill_template};

const JITTER_FACTOR: f64 = 0.3;

/// Snapshot of generator counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
  pub successes: u64,
  /// Every failed call, retried or not.
  pub failed_attempts: u64,
  /// Generations that gave up after exhausting retries (or failed permanently).
  pub failed_generations: u64,
}

pub struct Generator {
  client: Arc<dyn GenerationClient>,
  settings: GenerationSettings,
  successes: AtomicU64,
  failed_attempts: AtomicU64,
  failed_generations: AtomicU64,
}

impl Generator {
  pub fn new(client: Arc<dyn GenerationClient>, settings: GenerationSettings) -> Self {
    Self {
      client,
      settings,
      successes: AtomicU64::new(0),
      failed_attempts: AtomicU64::new(0),
      failed_generations: AtomicU64::new(0),
    }
  }

  pub fn model(&self) -> &str { self.client.model() }

  pub fn stats(&self) -> GeneratorStats {
    GeneratorStats {
      successes: self.successes.load(Ordering::Relaxed),
      failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
      failed_generations: self.failed_generations.load(Ordering::Relaxed),
    }
  }

  /// Produce one AVAILABLE instance for `template` at `difficulty`.
  #[instrument(level = "info", skip(self, template), fields(template_id = %template.id, %difficulty))]
  pub async fn generate(
    &self,
    template: &ExerciseTemplate,
    difficulty: Difficulty,
  ) -> Result<GeneratedInstance, GenerationError> {
    let prompt = fill_template(
      &template.prompt,
      &[("difficulty", difficulty.as_str()), ("topic", template.topic.as_str())],
    );
    if prompt.trim().is_empty() {
      self.failed_generations.fetch_add(1, Ordering::Relaxed);
      return Err(GenerationError::Permanent(format!("template {} has an empty prompt", template.id)));
    }
    let req = GenerationRequest { template_id: template.id, difficulty, prompt };
    let call_timeout = self.settings.call_timeout();

    let mut attempt: u32 = 0;
    loop {
      attempt += 1;
      let started = Instant::now();
      let outcome = match timeout(call_timeout, self.client.generate(&req)).await {
        Ok(r) => r,
        Err(_) => Err(GenerationError::Transient(format!("timed out after {}s", call_timeout.as_secs()))),
      };
      let elapsed = started.elapsed();

      match outcome {
        Ok(generated) => {
          self.successes.fetch_add(1, Ordering::Relaxed);
          let answer_hash = generated.content.correct_answer().map(|a| answer_hash(&a));
          let instance = GeneratedInstance {
            id: Uuid::new_v4(),
            template_id: template.id,
            difficulty,
            content: generated.content,
            answer_hash,
            model: generated.model,
            generated_at: Utc::now(),
            generation_duration_ms: elapsed.as_millis() as u64,
            state: InstanceState::Available,
            claimed_by: None,
            claimed_at: None,
          };
          info!(target: "generation", id = %instance.id, attempt, ?elapsed, "Exercise generated");
          return Ok(instance);
        }
        Err(e) => {
          self.failed_attempts.fetch_add(1, Ordering::Relaxed);
          if e.is_transient() && attempt <= self.settings.max_retries {
            let delay = self.backoff(attempt);
            warn!(target: "generation", attempt, ?elapsed, ?delay, error = %e, "Generation attempt failed; retrying");
            sleep(delay).await;
            continue;
          }
          self.failed_generations.fetch_add(1, Ordering::Relaxed);
          error!(target: "generation", attempt, ?elapsed, error = %e, "Generation failed");
          return Err(e);
        }
      }
    }
  }

  /// Delay before retry number `attempt` (1-based).
  fn backoff(&self, attempt: u32) -> Duration {
    let base = Duration::from_millis(self.settings.backoff_ms);
    let capped = base
      .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
      .min(Duration::from_millis(self.settings.max_backoff_ms));
    let jitter = rand::thread_rng().gen_range(0.0..JITTER_FACTOR);
    capped + capped.mul_f64(jitter)
  }
}
