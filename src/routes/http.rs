//! HTTP endpoint handlers. These are thin wrappers that forward to the pool service.
//! Each handler is instrumented and logs ids and basic result info.

use std::sync::Arc;
use axum::{
  extract::{Path, State},
  http::StatusCode,
  response::{IntoResponse, Response},
  Json,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::TemplateId;
use crate::error::PoolError;
use crate::pool::ExerciseSource;
use crate::protocol::*;
use crate::seeds::fallback_exercise;
use crate::state::AppState;

/// Upper bound for one manual generation request.
const MAX_GENERATE_COUNT: usize = 100;

impl IntoResponse for PoolError {
  fn into_response(self) -> Response {
    let (status, code) = match &self {
      PoolError::UnknownTemplate(_) => (StatusCode::NOT_FOUND, "unknown_template"),
      PoolError::TemplateInactive(_) => (StatusCode::CONFLICT, "template_inactive"),
      PoolError::AlreadyIssued { .. } => (StatusCode::CONFLICT, "already_issued"),
      PoolError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
      PoolError::ContentUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "content_unavailable"),
    };
    if status.is_server_error() {
      error!(target: "exercise_pool", error = %self, "Request failed");
    }
    error_response(status, code, self.to_string())
  }
}

fn error_response(status: StatusCode, code: &str, message: String) -> Response {
  (status, Json(ErrorOut { error: code.to_string(), message })).into_response()
}

fn known_template(state: &AppState, template_id: TemplateId) -> Result<(), PoolError> {
  match state.pool.catalog().get(template_id) {
    Some(_) => Ok(()),
    None => Err(PoolError::UnknownTemplate(template_id)),
  }
}

#[instrument(level = "info")]
pub async fn http_health() -> impl IntoResponse { Json(HealthOut { ok: true }) }

#[instrument(level = "info", skip(state, body), fields(student_id = %body.student_id, template_id = %body.template_id, difficulty = %body.difficulty))]
pub async fn http_next_exercise(
  State(state): State<Arc<AppState>>,
  Json(body): Json<NextExerciseIn>,
) -> Result<Json<NextExerciseOut>, PoolError> {
  let issued = match state.pool.next_exercise(body.template_id, body.difficulty, body.student_id).await {
    Ok(issued) => NextExerciseOut { exercise: issued.exercise, source: issued.source },
    Err(PoolError::ContentUnavailable { template_id, source }) => {
      warn!(target: "exercise_pool", %template_id, error = %source, "Serving static fallback exercise");
      NextExerciseOut {
        exercise: fallback_exercise(template_id, body.difficulty, body.student_id),
        source: ExerciseSource::Fallback,
      }
    }
    Err(e) => return Err(e),
  };
  info!(target: "exercise_pool", id = %issued.exercise.id, source = ?issued.source, "HTTP exercise served");
  Ok(Json(issued))
}

#[instrument(level = "info", skip(state), fields(%id))]
pub async fn http_get_exercise(
  State(state): State<Arc<AppState>>,
  Path(id): Path<Uuid>,
) -> Result<Response, PoolError> {
  Ok(match state.pool.exercise(id).await? {
    Some(exercise) => Json(exercise).into_response(),
    None => error_response(StatusCode::NOT_FOUND, "unknown_exercise", format!("no exercise with id {id}")),
  })
}

#[instrument(level = "info", skip(state), fields(%template_id))]
pub async fn http_template_available(
  State(state): State<Arc<AppState>>,
  Path(template_id): Path<TemplateId>,
) -> Result<Json<AvailabilityOut>, PoolError> {
  known_template(&state, template_id)?;
  let has_available = state.pool.has_available_exercises(template_id).await?;
  let available = state.pool.available_count(template_id).await?;
  Ok(Json(AvailabilityOut { template_id, available, has_available }))
}

#[instrument(level = "info", skip(state), fields(%template_id))]
pub async fn http_template_stats(
  State(state): State<Arc<AppState>>,
  Path(template_id): Path<TemplateId>,
) -> Result<impl IntoResponse, PoolError> {
  Ok(Json(state.pool.template_statistics(template_id).await?))
}

#[instrument(level = "info", skip(state, body), fields(templates = body.template_ids.len()))]
pub async fn http_warm_up(
  State(state): State<Arc<AppState>>,
  Json(body): Json<WarmUpIn>,
) -> impl IntoResponse {
  let report = state.pool.warm_up_pool(&body.template_ids);
  (
    StatusCode::ACCEPTED,
    Json(WarmUpOut {
      accepted: report.scheduled,
      already_in_flight: report.already_in_flight,
      rejected: report.rejected,
    }),
  )
}

#[instrument(level = "info", skip(state, body), fields(%template_id, count = body.count))]
pub async fn http_generate(
  State(state): State<Arc<AppState>>,
  Path(template_id): Path<TemplateId>,
  Json(body): Json<GenerateIn>,
) -> Result<Response, PoolError> {
  known_template(&state, template_id)?;
  if body.count == 0 || body.count > MAX_GENERATE_COUNT {
    return Ok(error_response(
      StatusCode::BAD_REQUEST,
      "invalid_count",
      format!("count must be between 1 and {MAX_GENERATE_COUNT}"),
    ));
  }
  let generated = state.pool.generate_exercises_async(template_id, body.count).join().await;
  info!(target: "exercise_pool", %template_id, requested = body.count, generated, "HTTP generation finished");
  Ok(Json(GenerateOut { template_id, generated }).into_response())
}

#[instrument(level = "info", skip(state))]
pub async fn http_pool_stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, PoolError> {
  Ok(Json(state.pool.pool_statistics().await?))
}

#[instrument(level = "info", skip(state))]
pub async fn http_run_maintenance(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(state.pool.run_maintenance().await)
}
