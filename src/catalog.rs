//! Read-only catalog of exercise templates.

use std::collections::HashMap;

use tracing::info;

use crate::domain::{ExerciseTemplate, TemplateId};

#[derive(Clone, Debug, Default)]
pub struct TemplateCatalog {
    by_id: HashMap<TemplateId, ExerciseTemplate>,
}

impl TemplateCatalog {
    /// Built-in seeds first, then the config bank (bank entries win on id clashes).
    pub fn from_sources(seeds: Vec<ExerciseTemplate>, bank: Vec<ExerciseTemplate>) -> Self {
        let mut by_id = HashMap::new();
        for t in seeds.into_iter().chain(bank) {
            by_id.insert(t.id, t);
        }
        let active = by_id.values().filter(|t| t.active).count();
        info!(target: "exercise_pool", templates = by_id.len(), active, "Template catalog ready");
        Self { by_id }
    }

    pub fn get(&self, id: TemplateId) -> Option<&ExerciseTemplate> {
        self.by_id.get(&id)
    }

    /// Active template ids in ascending order.
    pub fn active_ids(&self) -> Vec<TemplateId> {
        let mut ids: Vec<_> = self.by_id.values().filter(|t| t.active).map(|t| t.id).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}
