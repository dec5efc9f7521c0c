use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{CompletionBackend, ModelRequest};
use crate::config::{self, Config};
use crate::error::{PipelineError, Result};
use crate::sessions::SessionStore;
use crate::sink::ResultSink;
use crate::{prompt, template, transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<JobState> {
        match raw {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

/// One analysis job. `finished_at` is set exactly when the job reaches a
/// terminal state; `retries` counts re-queues after transient failures.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub session_id: String,
    pub project_path: Option<String>,
    pub template: String,
    pub model: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retries: u32,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub session: Option<String>,
    /// Zero means unlimited.
    pub limit: usize,
}

#[derive(Debug, Default)]
pub struct Recovery {
    /// Jobs found queued at startup, oldest first.
    pub requeued: Vec<Uuid>,
    /// Jobs found running at startup, failed as interrupted.
    pub interrupted: u64,
}

/// Persistence seam for job records. Transition methods are guarded: they
/// return `false` when the job was not in the expected source state, and
/// the caller treats that as losing the race, not as an error.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Job>>;
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>>;
    /// queued -> running
    async fn mark_running(&self, id: Uuid) -> Result<bool>;
    /// running -> queued, incrementing the retry count
    async fn requeue(&self, id: Uuid) -> Result<bool>;
    /// running -> succeeded
    async fn complete(&self, id: Uuid, result: &str) -> Result<bool>;
    /// running -> failed
    async fn fail(&self, id: Uuid, error: &str) -> Result<bool>;
    /// queued -> cancelled; anything else is an invalid transition
    async fn cancel(&self, id: Uuid) -> Result<Job>;
    async fn recover(&self) -> Result<Recovery>;
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

const JOB_COLUMNS: &str = "id, session_id, project_path, template, model, state, created_at, \
                           started_at, finished_at, result, error, retries";

#[derive(Clone)]
pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    pub async fn initialize(database_url: &str) -> anyhow::Result<Self> {
        if let Some(raw) = database_url.strip_prefix("sqlite:") {
            let raw = raw.strip_prefix("//").unwrap_or(raw);
            let path = Path::new(raw);
            if !raw.is_empty()
                && raw != ":memory:"
                && let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = database_url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(SqliteJobStore { pool })
    }
}

fn ts(t: DateTime<Utc>) -> String {
    // Fixed-width UTC so string order matches time order in SQL.
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id_raw: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id_raw)
        .map_err(|e| PipelineError::Storage(format!("job id {id_raw:?}: {e}")))?;

    let state_raw: String = row.try_get("state")?;
    let state = JobState::parse(&state_raw)
        .ok_or_else(|| PipelineError::Storage(format!("job {id}: unknown state {state_raw:?}")))?;

    let created_raw: String = row.try_get("created_at")?;
    let started_raw: Option<String> = row.try_get("started_at")?;
    let finished_raw: Option<String> = row.try_get("finished_at")?;

    Ok(Job {
        id,
        session_id: row.try_get("session_id")?,
        project_path: row.try_get("project_path")?,
        template: row.try_get("template")?,
        model: row.try_get("model")?,
        state,
        created_at: parse_ts(&created_raw).unwrap_or_else(Utc::now),
        started_at: started_raw.as_deref().and_then(parse_ts),
        finished_at: finished_raw.as_deref().and_then(parse_ts),
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        retries: row.try_get::<i64, _>("retries")? as u32,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, session_id, project_path, template, model, state, created_at, retries)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(job.id.to_string())
        .bind(&job.session_id)
        .bind(job.project_path.as_deref())
        .bind(&job.template)
        .bind(&job.model)
        .bind(job.state.as_str())
        .bind(ts(job.created_at))
        .bind(job.retries as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1"));
        if let Some(state) = filter.state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(session) = &filter.session {
            qb.push(" AND session_id = ").push_bind(session.as_str());
        }
        let limit = if filter.limit == 0 { -1 } else { filter.limit as i64 };
        qb.push(" ORDER BY created_at DESC, rowid DESC LIMIT ").push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn mark_running(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE jobs SET state = 'running', started_at = ?2 WHERE id = ?1 AND state = 'queued'",
        )
        .bind(id.to_string())
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn requeue(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE jobs SET state = 'queued', retries = retries + 1 WHERE id = ?1 AND state = 'running'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn complete(&self, id: Uuid, result: &str) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE jobs SET state = 'succeeded', result = ?2, finished_at = ?3 \
             WHERE id = ?1 AND state = 'running'",
        )
        .bind(id.to_string())
        .bind(result)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE jobs SET state = 'failed', error = ?2, finished_at = ?3 \
             WHERE id = ?1 AND state = 'running'",
        )
        .bind(id.to_string())
        .bind(error)
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn cancel(&self, id: Uuid) -> Result<Job> {
        let res = sqlx::query(
            "UPDATE jobs SET state = 'cancelled', finished_at = ?2 \
             WHERE id = ?1 AND state = 'queued'",
        )
        .bind(id.to_string())
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return match self.get(id).await? {
                None => Err(PipelineError::JobNotFound(id)),
                Some(job) => Err(PipelineError::InvalidTransition {
                    id,
                    state: job.state.as_str().to_string(),
                }),
            };
        }
        self.get(id).await?.ok_or(PipelineError::JobNotFound(id))
    }

    async fn recover(&self) -> Result<Recovery> {
        let interrupted = sqlx::query(
            "UPDATE jobs SET state = 'failed', error = ?1, finished_at = ?2 \
             WHERE state = 'running'",
        )
        .bind("interrupted: service restarted mid-run")
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?
        .rows_affected();

        let rows =
            sqlx::query("SELECT id FROM jobs WHERE state = 'queued' ORDER BY created_at ASC, rowid ASC")
                .fetch_all(&self.pool)
                .await?;
        let mut requeued = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row.try_get("id")?;
            let id = Uuid::parse_str(&raw)
                .map_err(|e| PipelineError::Storage(format!("job id {raw:?}: {e}")))?;
            requeued.push(id);
        }
        Ok(Recovery { requeued, interrupted })
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM jobs WHERE finished_at IS NOT NULL AND finished_at < ?1")
            .bind(ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub session_id: String,
    pub template: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

/// Owns the job lifecycle: validates submissions, keeps the durable
/// records, and drives execution through a single worker so at most one
/// job is ever running.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    backend: Arc<dyn CompletionBackend>,
    sink: Arc<dyn ResultSink>,
    sessions: SessionStore,
    config: Config,
    queue: mpsc::UnboundedSender<Uuid>,
}

impl JobManager {
    /// Recovers persisted state, purges expired records, and spawns the
    /// worker before accepting submissions.
    pub async fn start(
        store: Arc<dyn JobStore>,
        backend: Arc<dyn CompletionBackend>,
        sink: Arc<dyn ResultSink>,
        sessions: SessionStore,
        config: Config,
    ) -> Result<JobManager> {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            store,
            backend,
            sink,
            sessions,
            config,
            queue: tx,
        });

        let recovery = inner.store.recover().await?;
        if recovery.interrupted > 0 {
            tracing::warn!(
                count = recovery.interrupted,
                "failed jobs that were running at shutdown"
            );
        }
        if inner.config.retention_days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(inner.config.retention_days);
            let purged = inner.store.purge_finished_before(cutoff).await?;
            if purged > 0 {
                tracing::info!(purged, "purged expired job records");
            }
        }
        if !recovery.requeued.is_empty() {
            tracing::info!(count = recovery.requeued.len(), "re-armed queued jobs");
        }
        for id in &recovery.requeued {
            let _ = inner.queue.send(*id);
        }

        let worker = inner.clone();
        tokio::spawn(async move {
            worker.run(rx).await;
        });

        Ok(JobManager { inner })
    }

    /// Validates and enqueues a job. Session and template problems are
    /// reported here, synchronously, before any record is written.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Job> {
        let template = template::find(&req.template)?;
        let meta = self
            .inner
            .sessions
            .resolve(&req.session_id, req.project.as_deref())?;
        let model = config::effective_model(req.model.as_deref(), &self.inner.config);

        let job = Job {
            id: Uuid::new_v4(),
            session_id: meta.id.clone(),
            project_path: meta.project_path.clone(),
            template: template.name.to_string(),
            model,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            retries: 0,
        };
        self.inner.store.create(&job).await?;
        metrics::counter!("debrief_jobs_submitted_total", "template" => job.template.clone())
            .increment(1);
        tracing::info!(
            job = %job.id,
            session = %job.session_id,
            template = %job.template,
            model = %job.model,
            "job queued"
        );

        if self.inner.queue.send(job.id).is_err() {
            tracing::error!(job = %job.id, "worker is gone; job stays queued until restart");
        }
        Ok(job)
    }

    pub async fn status(&self, id: Uuid) -> Result<Job> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(PipelineError::JobNotFound(id))
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.inner.store.list(filter).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        let job = self.inner.store.cancel(id).await?;
        metrics::counter!("debrief_jobs_cancelled_total").increment(1);
        tracing::info!(job = %id, "job cancelled");
        Ok(job)
    }
}

impl Inner {
    /// Worker loop. One job leaves the channel at a time and the next is
    /// not taken until the current one settles, which is what serializes
    /// execution.
    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(id) = rx.recv().await {
            self.execute(id).await;
        }
    }

    async fn execute(&self, id: Uuid) {
        // Losing this race means the job was cancelled while queued.
        match self.store.mark_running(id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(job = %id, "skipping job no longer queued");
                return;
            }
            Err(err) => {
                tracing::error!(job = %id, %err, "could not claim job");
                return;
            }
        }

        let job = match self.store.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::error!(job = %id, "claimed job vanished");
                return;
            }
            Err(err) => {
                tracing::error!(job = %id, %err, "could not load claimed job");
                return;
            }
        };

        let started = Instant::now();
        match self.run_pipeline(&job).await {
            Ok(text) => match self.store.complete(id, &text).await {
                Ok(true) => {
                    metrics::counter!("debrief_jobs_succeeded_total").increment(1);
                    metrics::histogram!("debrief_job_seconds")
                        .record(started.elapsed().as_secs_f64());
                    tracing::info!(job = %id, template = %job.template, "job succeeded");
                    if let Err(err) = self.sink.publish(id, &job.template, &text).await {
                        tracing::warn!(
                            job = %id,
                            %err,
                            "result sink failed; job record still holds the result"
                        );
                    }
                }
                Ok(false) => tracing::error!(job = %id, "job left running state mid-flight"),
                Err(err) => tracing::error!(job = %id, %err, "could not record job success"),
            },
            Err(err) if err.is_transient() && job.retries < self.config.retry_limit => {
                self.schedule_retry(&job, &err).await;
            }
            Err(err) => {
                let record = format!("{}: {err}", err.kind());
                match self.store.fail(id, &record).await {
                    Ok(_) => {
                        metrics::counter!("debrief_jobs_failed_total", "kind" => err.kind())
                            .increment(1);
                        tracing::error!(job = %id, kind = err.kind(), %err, "job failed");
                    }
                    Err(store_err) => {
                        tracing::error!(job = %id, %store_err, "could not record job failure");
                    }
                }
            }
        }
    }

    async fn schedule_retry(&self, job: &Job, err: &PipelineError) {
        match self.store.requeue(job.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::error!(job = %job.id, "retry lost: job left running state");
                return;
            }
            Err(store_err) => {
                tracing::error!(job = %job.id, %store_err, "could not requeue job");
                return;
            }
        }
        metrics::counter!("debrief_jobs_retried_total").increment(1);

        let attempt = job.retries + 1;
        let delay = Duration::from_millis(self.config.retry_delay_ms.saturating_mul(attempt as u64));
        tracing::warn!(
            job = %job.id,
            kind = err.kind(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "transient failure; retrying"
        );

        let queue = self.queue.clone();
        let id = job.id;
        if delay.is_zero() {
            let _ = queue.send(id);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = queue.send(id);
            });
        }
    }

    /// One attempt: resolve, normalize, compose, call the backend. Every
    /// step reruns from scratch on retry; nothing is cached across
    /// attempts.
    async fn run_pipeline(&self, job: &Job) -> Result<String> {
        let meta = self
            .sessions
            .resolve(&job.session_id, job.project_path.as_deref())?;
        let transcript = transcript::load(&meta.id, &meta.file_path)?;
        let template = template::find(&job.template)?;

        let composed = prompt::compose(&transcript, template, self.config.context_budget)?;
        if composed.dropped_events > 0 {
            tracing::info!(
                job = %job.id,
                dropped = composed.dropped_events,
                "transcript truncated to fit the context budget"
            );
        }
        tracing::debug!(
            job = %job.id,
            events = transcript.events.len(),
            malformed = transcript.malformed_count(),
            est_tokens = transcript.estimated_tokens(),
            "prompt composed"
        );

        let response = self
            .backend
            .complete(ModelRequest {
                model: job.model.clone(),
                system: composed.system,
                prompt: composed.prompt,
                context_tokens: self.config.context_budget,
            })
            .await?;
        Ok(response.text)
    }
}
