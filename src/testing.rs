//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::domain::{Difficulty, ExerciseContent, ExerciseTemplate, TemplateId};
use crate::error::GenerationError;
use crate::openai::{GeneratedContent, GenerationClient, GenerationRequest};

/// Scripted authoring service: optional latency, a queue of failures to
/// return first, then success (or a permanent failure mode).
#[derive(Default)]
pub struct StubClient {
    latency: Duration,
    script: Mutex<VecDeque<GenerationError>>,
    always: Option<GenerationError>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn failing_first(self, errors: Vec<GenerationError>) -> Self {
        *self.script.lock().unwrap() = errors.into();
        self
    }

    pub fn always_failing(mut self, error: GenerationError) -> Self {
        self.always = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationClient for StubClient {
    async fn generate(&self, req: &GenerationRequest) -> Result<GeneratedContent, GenerationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(e) = &self.always {
            return Err(e.clone());
        }
        if let Some(e) = self.script.lock().unwrap().pop_front() {
            return Err(e);
        }
        Ok(GeneratedContent {
            content: ExerciseContent(json!({
                "question": format!("Q{n} for template {}", req.template_id),
                "correct_answer": format!("A{n}"),
            })),
            model: "stub-model".into(),
        })
    }

    fn model(&self) -> &str {
        "stub-model"
    }
}

pub fn template(id: u32) -> ExerciseTemplate {
    ExerciseTemplate {
        id: TemplateId(id),
        name: format!("Template {id}"),
        prompt: "Write a {difficulty} exercise about {topic}.".into(),
        topic: "fractions".into(),
        difficulty: Difficulty::Medium,
        active: true,
    }
}
