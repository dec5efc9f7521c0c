use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::backend::{CompletionBackend, ModelInfo};
use crate::config::Config;
use crate::error::PipelineError;
use crate::jobs::{Job, JobFilter, JobManager, JobState, SubmitRequest};
use crate::sessions::{SessionFilter, SessionMeta, SessionStore};
use crate::{template, transcript};

#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
    pub sessions: SessionStore,
    pub backend: Arc<dyn CompletionBackend>,
    pub config: Config,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/jobs", post(submit_job).get(list_jobs))
        .route("/v1/jobs/:id", get(job_status))
        .route("/v1/jobs/:id/cancel", post(cancel_job))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/:id/transcript", get(session_transcript))
        .route("/v1/models", get(list_models))
        .route("/v1/config", get(show_config))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "debrief listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => {
            tracing::error!(%err, "failed to install shutdown handler");
            std::future::pending::<()>().await;
        }
    }
}

async fn submit_job(
    State(app): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Job>), PipelineError> {
    let job = app.manager.submit(req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn job_status(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, PipelineError> {
    Ok(Json(app.manager.status(id).await?))
}

async fn cancel_job(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, PipelineError> {
    Ok(Json(app.manager.cancel(id).await?))
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
    state: Option<String>,
    session: Option<String>,
    limit: Option<usize>,
}

/// Page size for the listing endpoints. Zero means unlimited in the
/// store filters, so it is treated the same as an absent parameter.
fn page_limit(requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => 20,
        Some(n) => n.min(200),
    }
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<Job>,
}

async fn list_jobs(
    State(app): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobsResponse>, PipelineError> {
    let state_filter = match &query.state {
        Some(raw) => Some(
            JobState::parse(raw)
                .ok_or_else(|| PipelineError::BadRequest(format!("unknown job state {raw:?}")))?,
        ),
        None => None,
    };
    let filter = JobFilter {
        state: state_filter,
        session: query.session,
        limit: page_limit(query.limit),
    };
    let jobs = app.manager.list(&filter).await?;
    Ok(Json(JobsResponse { jobs }))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    project: Option<String>,
    days: Option<i64>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionMeta>,
}

async fn list_sessions(
    State(app): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<SessionsResponse>, PipelineError> {
    let filter = SessionFilter {
        project: query.project,
        days: query.days.unwrap_or(30),
        limit: page_limit(query.limit),
    };
    let sessions = app.sessions.list(&filter)?;
    Ok(Json(SessionsResponse { sessions }))
}

#[derive(Debug, Deserialize)]
struct TranscriptQuery {
    project: Option<String>,
}

async fn session_transcript(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> Result<String, PipelineError> {
    let meta = app.sessions.resolve(&id, query.project.as_deref())?;
    let transcript = transcript::load(&meta.id, &meta.file_path)?;

    let mut rendered = transcript.to_markdown();
    let malformed = transcript.malformed_count();
    if malformed > 0 {
        rendered.push_str(&format!("\n> {malformed} malformed records omitted\n"));
    }
    Ok(rendered)
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

async fn list_models(
    State(app): State<AppState>,
) -> Result<Json<ModelsResponse>, PipelineError> {
    let models = app.backend.list_models().await?;
    Ok(Json(ModelsResponse { models }))
}

async fn show_config(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "config": app.config,
        "templates": template::names(),
    }))
}
