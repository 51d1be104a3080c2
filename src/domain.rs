//! Domain models: templates, generated instances, difficulty bands and ids.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an exercise template (authoring blueprint).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TemplateId(pub u32);

impl fmt::Display for TemplateId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Identifier of a student the pool hands instances to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(pub u64);

impl fmt::Display for StudentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// Target difficulty band of a template or requested instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Difficulty {
  Easy,
  Medium,
  Hard,
}

impl Default for Difficulty {
  fn default() -> Self { Difficulty::Medium }
}

impl Difficulty {
  pub fn as_str(&self) -> &'static str {
    match self {
      Difficulty::Easy => "EASY",
      Difficulty::Medium => "MEDIUM",
      Difficulty::Hard => "HARD",
    }
  }
}

impl fmt::Display for Difficulty {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Difficulty {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "easy" => Ok(Difficulty::Easy),
      "medium" => Ok(Difficulty::Medium),
      "hard" => Ok(Difficulty::Hard),
      other => Err(format!("unknown difficulty '{other}'")),
    }
  }
}

impl<'de> Deserialize<'de> for Difficulty {
  fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Authoring blueprint. Read-only to the pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExerciseTemplate {
  pub id: TemplateId,
  pub name: String,
  /// Prompt text sent to the authoring service.
  /// Supports `{difficulty}` and `{topic}` placeholders.
  pub prompt: String,
  #[serde(default)] pub topic: String,
  #[serde(default)] pub difficulty: Difficulty,
  #[serde(default = "default_active")] pub active: bool,
}

fn default_active() -> bool { true }

/// Content returned by the authoring service. Opaque to the pool apart from
/// the two fields validated on arrival (`question`, `correct_answer`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExerciseContent(pub serde_json::Value);

impl ExerciseContent {
  pub fn question(&self) -> Option<&str> {
    self.0.get("question").and_then(|v| v.as_str())
  }

  /// The answer key rendered as text, whatever its JSON shape.
  pub fn correct_answer(&self) -> Option<String> {
    match self.0.get("correct_answer")? {
      serde_json::Value::Null => None,
      serde_json::Value::String(s) => Some(s.clone()),
      other => Some(other.to_string()),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
  Available,
  Claimed,
}

/// One concrete exercise produced from a template.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedInstance {
  pub id: Uuid,
  pub template_id: TemplateId,
  pub difficulty: Difficulty,
  pub content: ExerciseContent,
  /// SHA-256 (hex) of the answer key, when the content carries one.
  #[serde(default)] pub answer_hash: Option<String>,
  #[serde(default)] pub model: String,
  pub generated_at: DateTime<Utc>,
  pub generation_duration_ms: u64,
  pub state: InstanceState,
  #[serde(default)] pub claimed_by: Option<StudentId>,
  #[serde(default)] pub claimed_at: Option<DateTime<Utc>>,
}

impl GeneratedInstance {
  pub fn is_available(&self) -> bool { self.state == InstanceState::Available }

  /// Transition AVAILABLE -> CLAIMED. Returns false (and changes nothing) if
  /// the instance was already claimed.
  pub fn claim(&mut self, student: StudentId, at: DateTime<Utc>) -> bool {
    if self.state == InstanceState::Claimed {
      return false;
    }
    self.state = InstanceState::Claimed;
    self.claimed_by = Some(student);
    self.claimed_at = Some(at);
    true
  }
}
