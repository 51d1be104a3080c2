//! Error taxonomy of the exercise pool.
//!
//! Generation failures are split into transient (retried by the generator) and
//! permanent (never retried). Only the compound failure of "pool empty and
//! on-demand generation failed" reaches callers of `next_exercise`.

use thiserror::Error;

use crate::domain::{StudentId, TemplateId};

/// Failure of a single call to the authoring service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// Timeout, connection error, rate limit or 5xx. Worth retrying.
    #[error("transient generation failure: {0}")]
    Transient(String),

    /// Malformed template/prompt or unusable content. Retrying will not help.
    #[error("permanent generation failure: {0}")]
    Permanent(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerationError::Transient(_))
    }
}

/// Failure of the backing store itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("pool store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the pool service.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool had nothing for the template and on-demand generation failed.
    #[error("no exercise available for template {template_id}: {source}")]
    ContentUnavailable {
        template_id: TemplateId,
        #[source]
        source: GenerationError,
    },

    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error("unknown exercise template {0}")]
    UnknownTemplate(TemplateId),

    #[error("exercise template {0} is not active")]
    TemplateInactive(TemplateId),

    #[error("student {student_id} already received an exercise from template {template_id}")]
    AlreadyIssued {
        template_id: TemplateId,
        student_id: StudentId,
    },
}
