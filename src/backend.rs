use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// One fully composed inference call. The prompt already contains the
/// transcript and instructions; nothing downstream edits it.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    /// Advertised context window, passed through as `num_ctx`.
    pub context_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub size_bytes: Option<u64>,
    pub modified_at: Option<String>,
}

/// Seam to the locally hosted model server. Implementations make exactly
/// one attempt per call; retry policy belongs to the job manager.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, req: ModelRequest) -> Result<ModelResponse>;
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

/// Client for an Ollama-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        OllamaBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn classify(&self, err: reqwest::Error) -> PipelineError {
        if err.is_timeout() {
            PipelineError::BackendTimeout(self.timeout.as_secs())
        } else if err.is_connect() {
            PipelineError::BackendUnreachable(err.to_string())
        } else {
            PipelineError::BackendError(err.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    num_ctx: usize,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    modified_at: Option<String>,
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    async fn complete(&self, req: ModelRequest) -> Result<ModelResponse> {
        let url = self.api_url("/api/generate");
        let requested_model = req.model.clone();
        let payload = GenerateRequest {
            model: req.model,
            prompt: req.prompt,
            system: (!req.system.is_empty()).then_some(req.system),
            stream: false,
            options: GenerateOptions {
                num_ctx: req.context_tokens,
            },
        };

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::BackendError(format!(
                "{status} from {url}: {}",
                snippet(&body)
            )));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                PipelineError::BackendTimeout(self.timeout.as_secs())
            } else {
                PipelineError::BackendError(format!("unparsable response body: {e}"))
            }
        })?;

        metrics::histogram!("debrief_backend_seconds").record(started.elapsed().as_secs_f64());
        Ok(ModelResponse {
            text: parsed.response,
            model: parsed.model.unwrap_or(requested_model),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.api_url("/api/tags");
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::BackendError(format!(
                "{status} from {url}: {}",
                snippet(&body)
            )));
        }

        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::BackendError(format!("unparsable response body: {e}")))?;

        Ok(parsed
            .models
            .into_iter()
            .map(|m| ModelInfo {
                name: m.name,
                size_bytes: m.size,
                modified_at: m.modified_at,
            })
            .collect())
    }
}

/// Error bodies can be arbitrarily large; keep enough to diagnose.
fn snippet(body: &str) -> String {
    const LIMIT: usize = 200;
    if body.len() <= LIMIT {
        body.to_string()
    } else {
        let cut = (0..=LIMIT).rev().find(|i| body.is_char_boundary(*i));
        format!("{}...", &body[..cut.unwrap_or(0)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    async fn spawn(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn request() -> ModelRequest {
        ModelRequest {
            model: "qwen2.5:72b".into(),
            system: "be brief".into(),
            prompt: "analyze this".into(),
            context_tokens: 4096,
        }
    }

    #[tokio::test]
    async fn complete_sends_a_non_streaming_generate_call() {
        let seen: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let state = seen.clone();
        let app = Router::new()
            .route(
                "/api/generate",
                post(
                    |State(seen): State<Arc<Mutex<Option<Value>>>>, Json(body): Json<Value>| async move {
                        *seen.lock().unwrap() = Some(body);
                        Json(json!({"response": "the analysis", "model": "qwen2.5:72b"}))
                    },
                ),
            )
            .with_state(state);
        let addr = spawn(app).await;

        let backend = OllamaBackend::new(&format!("http://{addr}"), Duration::from_secs(5));
        let response = backend.complete(request()).await.unwrap();

        assert_eq!(response.text, "the analysis");
        assert_eq!(response.model, "qwen2.5:72b");

        let body = seen.lock().unwrap().take().unwrap();
        assert_eq!(body["model"], "qwen2.5:72b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["options"]["num_ctx"], 4096);
        assert_eq!(body["prompt"], "analyze this");
    }

    #[tokio::test]
    async fn http_failure_is_a_definitive_backend_error() {
        let app = Router::new().route(
            "/api/generate",
            post(|| async {
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "model exploded",
                )
            }),
        );
        let addr = spawn(app).await;

        let backend = OllamaBackend::new(&format!("http://{addr}"), Duration::from_secs(5));
        let err = backend.complete(request()).await.unwrap_err();

        match &err {
            PipelineError::BackendError(msg) => assert!(msg.contains("model exploded")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn success_with_garbage_body_is_a_definitive_backend_error() {
        let app = Router::new().route("/api/generate", post(|| async { "not json at all" }));
        let addr = spawn(app).await;

        let backend = OllamaBackend::new(&format!("http://{addr}"), Duration::from_secs(5));
        let err = backend.complete(request()).await.unwrap_err();

        match &err {
            PipelineError::BackendError(msg) => assert!(msg.contains("unparsable")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let backend = OllamaBackend::new("http://127.0.0.1:1", Duration::from_secs(5));
        let err = backend.complete(request()).await.unwrap_err();

        assert!(matches!(err, PipelineError::BackendUnreachable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn slow_backend_times_out_transiently() {
        let app = Router::new().route(
            "/api/generate",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Json(json!({"response": "too late"}))
            }),
        );
        let addr = spawn(app).await;

        let backend = OllamaBackend::new(&format!("http://{addr}"), Duration::from_millis(50));
        let err = backend.complete(request()).await.unwrap_err();

        assert!(matches!(err, PipelineError::BackendTimeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn list_models_parses_the_tag_listing() {
        let app = Router::new().route(
            "/api/tags",
            get(|| async {
                Json(json!({
                    "models": [
                        {"name": "qwen2.5:72b", "size": 47_000_000_000u64, "modified_at": "2026-08-01T00:00:00Z"},
                        {"name": "llama3.1:8b"}
                    ]
                }))
            }),
        );
        let addr = spawn(app).await;

        let backend = OllamaBackend::new(&format!("http://{addr}"), Duration::from_secs(5));
        let models = backend.list_models().await.unwrap();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "qwen2.5:72b");
        assert_eq!(models[0].size_bytes, Some(47_000_000_000));
        assert_eq!(models[1].size_bytes, None);
    }

    #[test]
    fn snippets_respect_char_boundaries() {
        let long = "é".repeat(300);
        let cut = snippet(&long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 203);
    }
}
