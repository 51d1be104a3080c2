//! Seed data: built-in templates and the static fallback exercise.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::domain::{
  Difficulty, ExerciseContent, ExerciseTemplate, GeneratedInstance, InstanceState, StudentId, TemplateId,
};

/// Minimal set of built-in templates that make the service usable without a config bank.
pub fn seed_templates() -> Vec<ExerciseTemplate> {
  vec![
    ExerciseTemplate {
      id: TemplateId(1),
      name: "Fraction addition".into(),
      prompt: "Write one {difficulty} exercise where the student adds two fractions in an everyday situation about {topic}. Use unlike denominators for MEDIUM and HARD.".into(),
      topic: "cooking".into(),
      difficulty: Difficulty::Easy,
      active: true,
    },
    ExerciseTemplate {
      id: TemplateId(2),
      name: "Linear equations".into(),
      prompt: "Write one {difficulty} exercise asking the student to solve a one-variable linear equation framed around {topic}.".into(),
      topic: "saving pocket money".into(),
      difficulty: Difficulty::Medium,
      active: true,
    },
    ExerciseTemplate {
      id: TemplateId(3),
      name: "Percentages".into(),
      prompt: "Write one {difficulty} word problem about percentages (discounts or growth) involving {topic}.".into(),
      topic: "a school fair".into(),
      difficulty: Difficulty::Hard,
      active: true,
    },
  ]
}

/// Last-resort exercise served by the HTTP layer when the pool is empty and
/// generation failed. Never stored in the pool.
pub fn fallback_exercise(template_id: TemplateId, difficulty: Difficulty, student: StudentId) -> GeneratedInstance {
  let now = Utc::now();
  GeneratedInstance {
    id: Uuid::new_v4(),
    template_id,
    difficulty,
    content: ExerciseContent(json!({
      "question": "What is 3/4 + 1/8?",
      "correct_answer": "7/8",
      "options": ["7/8", "4/12", "4/8", "1"],
      "explanation": "Rewrite 3/4 as 6/8, then 6/8 + 1/8 = 7/8.",
      "hints": ["Find a common denominator first."]
    })),
    answer_hash: Some(crate::util::answer_hash("7/8")),
    model: "static-fallback".into(),
    generated_at: now,
    generation_duration_ms: 0,
    state: InstanceState::Claimed,
    claimed_by: Some(student),
    claimed_at: Some(now),
  }
}
