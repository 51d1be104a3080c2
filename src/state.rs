//! Application state: the exercise pool and everything it is built from.
//!
//! This module owns:
//!   - the pool config (from TOML or defaults)
//!   - the template catalog (built-in seeds + config bank)
//!   - the generation client (OpenAI when configured, offline otherwise)
//!   - the in-memory pool store
//!
//! Without an API key the pool still serves whatever stock it has; misses fall
//! back to a static exercise at the HTTP layer.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::catalog::TemplateCatalog;
use crate::config::{load_pool_config_from_env, PoolConfig};
use crate::openai::{GenerationClient, OfflineClient, OpenAI};
use crate::pool::PoolService;
use crate::seeds::seed_templates;
use crate::store::MemoryPoolStore;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolService>,
}

impl AppState {
    /// Build state from env: load config, assemble the catalog, init OpenAI.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let config = load_pool_config_from_env().unwrap_or_default();
        let catalog = Arc::new(TemplateCatalog::from_sources(
            seed_templates(),
            config.templates.clone(),
        ));
        info!(target: "exercise_pool", templates = catalog.len(), active = catalog.active_ids().len(), bank = config.templates.len(), "Startup template inventory");

        let client: Arc<dyn GenerationClient> = match OpenAI::from_env(
            config.prompts.clone(),
            config.generation.temperature,
            config.generation.call_timeout(),
        ) {
            Some(oa) => {
                info!(target: "exercise_pool", base_url = %oa.base_url, model = %oa.model, "OpenAI enabled.");
                Arc::new(oa)
            }
            None => {
                warn!(target: "exercise_pool", "OpenAI disabled (no OPENAI_API_KEY). Pool misses will use the static fallback.");
                Arc::new(OfflineClient)
            }
        };

        Self::from_parts(&config, catalog, client)
    }

    pub fn from_parts(
        config: &PoolConfig,
        catalog: Arc<TemplateCatalog>,
        client: Arc<dyn GenerationClient>,
    ) -> Self {
        let store = Arc::new(MemoryPoolStore::new());
        Self {
            pool: Arc::new(PoolService::new(store, catalog, client, config)),
        }
    }
}
