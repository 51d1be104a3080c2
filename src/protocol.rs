//! Public protocol structs for the HTTP API (serde ready, camelCase on the wire).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};

use crate::domain::{Difficulty, GeneratedInstance, StudentId, TemplateId};
use crate::pool::ExerciseSource;

#[derive(Debug, Serialize)]
pub struct HealthOut {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextExerciseIn {
    pub student_id: StudentId,
    pub template_id: TemplateId,
    #[serde(default)]
    pub difficulty: Difficulty,
}

#[derive(Debug, Serialize)]
pub struct NextExerciseOut {
    pub exercise: GeneratedInstance,
    pub source: ExerciseSource,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityOut {
    pub template_id: TemplateId,
    pub available: usize,
    pub has_available: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpIn {
    pub template_ids: Vec<TemplateId>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateIn {
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateOut {
    pub template_id: TemplateId,
    pub generated: usize,
}

/// Error body for every non-2xx reply.
#[derive(Debug, Serialize)]
pub struct ErrorOut {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmUpOut {
    pub accepted: Vec<TemplateId>,
    pub already_in_flight: Vec<TemplateId>,
    pub rejected: Vec<TemplateId>,
}
