//! Loading pool configuration (tuning knobs, prompts, template bank) from TOML.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! See `PoolConfig` for the expected schema.

use std::time::Duration;

use serde::Deserialize;
use tracing::{info, error};

use crate::domain::ExerciseTemplate;

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct PoolConfig {
  pub pool: PoolSettings,
  pub generation: GenerationSettings,
  pub maintenance: MaintenanceSettings,
  pub prompts: Prompts,
  /// Template bank. Entries with an id already used by a built-in seed replace it.
  pub templates: Vec<ExerciseTemplate>,
}

/// Pool sizing and issuance policy.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
  pub enabled: bool,
  /// Replenish a template when its AVAILABLE count drops below this.
  pub low_water_mark: usize,
  /// Instances generated per replenishment/warm-up batch.
  pub batch_size: usize,
  /// Low-water replenishment never fills a template above this.
  pub max_per_template: usize,
  /// Refuse a second instance of the same template to the same student.
  pub unique_per_student: bool,
}

impl Default for PoolSettings {
  fn default() -> Self {
    Self { enabled: true, low_water_mark: 5, batch_size: 10, max_per_template: 20, unique_per_student: false }
  }
}

/// Retry/timeout policy around the authoring service.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
  pub max_retries: u32,
  pub backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub call_timeout_secs: u64,
  /// Upper bound on concurrent calls across all background batches.
  pub max_concurrent_calls: usize,
  pub temperature: f32,
}

impl Default for GenerationSettings {
  fn default() -> Self {
    Self {
      max_retries: 2,
      backoff_ms: 250,
      max_backoff_ms: 2_000,
      call_timeout_secs: 30,
      max_concurrent_calls: 4,
      temperature: 0.9,
    }
  }
}

impl GenerationSettings {
  pub fn call_timeout(&self) -> Duration { Duration::from_secs(self.call_timeout_secs.max(1)) }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
  pub enabled: bool,
  pub interval_secs: u64,
  /// How many of the most-claimed templates each pass tops up.
  pub top_templates: usize,
  /// Purge AVAILABLE instances older than this. `0` disables cleanup.
  pub stale_after_days: Option<u32>,
}

impl Default for MaintenanceSettings {
  fn default() -> Self {
    Self { enabled: true, interval_secs: 7_200, top_templates: 10, stale_after_days: Some(30) }
  }
}

/// Prompts used by the generation client.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  pub exercise_system: String,
  /// Appended to every template prompt.
  pub exercise_user_suffix: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      exercise_system: "You are an expert teacher who writes practice exercises. Think step by step, make sure the question and answer agree, then respond with ONE JSON object.".into(),
      exercise_user_suffix: "Return JSON with fields: question (string), correct_answer, options (array of strings, the correct answer plus common mistakes), explanation (string), hints (array of strings). Difficulty: {difficulty}.".into(),
    }
  }
}

/// Attempt to load `PoolConfig` from POOL_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_pool_config_from_env() -> Option<PoolConfig> {
  let path = std::env::var("POOL_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match parse_pool_config(&s) {
      Ok(cfg) => {
        info!(target: "exercise_pool", %path, templates = cfg.templates.len(), "Loaded pool config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "exercise_pool", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "exercise_pool", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

pub fn parse_pool_config(s: &str) -> Result<PoolConfig, toml::de::Error> {
  toml::from_str::<PoolConfig>(s)
}
