use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Failure taxonomy for the whole pipeline. The split that matters at
/// runtime is [`PipelineError::is_transient`]: transient failures are
/// retried by the job manager, everything else fails the job outright.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session id {id} matches {count} transcripts; pass a project filter to disambiguate")]
    AmbiguousSession { id: String, count: usize },

    #[error("session {id} could not be read: {source}")]
    SessionUnreadable {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("prompt needs ~{needed} tokens but the context budget is {budget}")]
    PromptTooLarge { needed: usize, budget: usize },

    #[error("inference backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("inference backend exceeded the {0}s deadline")]
    BackendTimeout(u64),

    #[error("inference backend error: {0}")]
    BackendError(String),

    #[error("unknown template: {0}")]
    TemplateNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {id} is {state}; only queued jobs can be cancelled")]
    InvalidTransition { id: Uuid, state: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Transient failures are worth another attempt against the same
    /// backend. A definitive backend answer, even an HTTP 5xx, is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::BackendUnreachable(_) | PipelineError::BackendTimeout(_)
        )
    }

    /// Stable machine-readable tag, recorded on failed jobs and used as
    /// a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SessionNotFound(_) => "session_not_found",
            PipelineError::AmbiguousSession { .. } => "ambiguous_session",
            PipelineError::SessionUnreadable { .. } => "session_unreadable",
            PipelineError::PromptTooLarge { .. } => "prompt_too_large",
            PipelineError::BackendUnreachable(_) => "backend_unreachable",
            PipelineError::BackendTimeout(_) => "backend_timeout",
            PipelineError::BackendError(_) => "backend_error",
            PipelineError::TemplateNotFound(_) => "template_not_found",
            PipelineError::JobNotFound(_) => "job_not_found",
            PipelineError::InvalidTransition { .. } => "invalid_transition",
            PipelineError::BadRequest(_) => "bad_request",
            PipelineError::Config(_) => "config",
            PipelineError::Storage(_) => "storage",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            PipelineError::SessionNotFound(_)
            | PipelineError::TemplateNotFound(_)
            | PipelineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::AmbiguousSession { .. } | PipelineError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::PromptTooLarge { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::BackendUnreachable(_) | PipelineError::BackendError(_) => {
                StatusCode::BAD_GATEWAY
            }
            PipelineError::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PipelineError::SessionUnreadable { .. }
            | PipelineError::Config(_)
            | PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
