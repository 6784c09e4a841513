use anyhow::Result;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use genapply_agent::{ConversationStore, GenerationError, GenerationOrchestrator, GenerationRequest};
use genapply_apply::{ApplyEngine, ApplyRequest};
use genapply_core::{AppConfig, CancellationToken, EventSink, ProgressEvent};
use genapply_extract::FileBlockParser;
use genapply_llm::ProviderRegistry;
use genapply_observe::Observer;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

mod sandbox;
mod sse;

pub use sandbox::{CommandOutput, CommandRunner, PlatformCommandRunner, SandboxError, SandboxSession};
pub use sse::{ChannelSink, event_stream};

/// Shared per-process context handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    cfg: Arc<AppConfig>,
    engine: Arc<ApplyEngine>,
    parser: Arc<FileBlockParser>,
    orchestrator: Arc<GenerationOrchestrator>,
    observer: Arc<Observer>,
    sandbox: SandboxSession,
}

impl AppState {
    pub fn new(
        workspace: PathBuf,
        cfg: AppConfig,
        registry: Arc<dyn ProviderRegistry>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let observer = Observer::new(&workspace, &cfg.observe)?;
        let conversations = Arc::new(ConversationStore::new(cfg.conversation.clone()));
        Ok(Self {
            engine: Arc::new(ApplyEngine::new(workspace.clone(), &cfg)),
            parser: Arc::new(FileBlockParser::new()),
            orchestrator: Arc::new(GenerationOrchestrator::new(&cfg, conversations, registry)),
            observer: Arc::new(observer),
            sandbox: SandboxSession::new(workspace, &cfg.sandbox, runner),
            cfg: Arc::new(cfg),
        })
    }

    fn start_request(&self, route: &str, detail: &str) -> Uuid {
        let request_id = Uuid::now_v7();
        tracing::info!(%request_id, route, detail, "request");
        if let Err(err) = self.observer.record_request(request_id, route, detail) {
            tracing::warn!(%request_id, error = %err, "observe log write failed");
        }
        request_id
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.cfg.server.max_body_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/api/apply-ai-code-stream", post(apply_code))
        .route("/api/generate-ai-code-stream", post(generate_code))
        .route("/api/run-command", post(run_command))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Validation problems are reported inside the stream, so this always
/// answers 200 with `text/event-stream`.
async fn apply_code(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = state.start_request("apply", &format!("{} bytes", body.len()));
    let (sink, rx) = ChannelSink::channel(Arc::clone(&state.observer), request_id);
    tokio::task::spawn_blocking(move || {
        let request = match ApplyRequest::from_json(&body, &state.parser) {
            Ok(request) => request,
            Err(err) => {
                state
                    .observer
                    .warn_log(request_id, &format!("apply request rejected: {err}"));
                sink.emit(ProgressEvent::error(err.to_string()));
                return;
            }
        };
        // A rejected batch has already been reported on the sink.
        let _ = state.engine.apply(&request, &sink, &CancellationToken::new());
    });
    event_stream(rx)
}

/// Only a missing or empty prompt is refused before the stream opens; any
/// other failure arrives as one `error` frame.
async fn generate_code(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match GenerationRequest::from_json(&body) {
        Ok(request) => request,
        Err(err @ GenerationError::EmptyPrompt) => {
            return json_error(StatusCode::BAD_REQUEST, &err.to_string());
        }
        Err(err) => {
            let request_id = state.start_request("generate", &format!("{} bytes", body.len()));
            state
                .observer
                .warn_log(request_id, &format!("generate request rejected: {err}"));
            let (sink, rx) = ChannelSink::channel(Arc::clone(&state.observer), request_id);
            sink.emit(ProgressEvent::error(err.to_string()));
            drop(sink);
            return event_stream(rx);
        }
    };
    let request_id = state.start_request("generate", &request.prompt);
    let (sink, rx) = ChannelSink::channel(Arc::clone(&state.observer), request_id);
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    tokio::task::spawn_blocking(move || {
        let outcome = state
            .orchestrator
            .run(&request, sink, &CancellationToken::new());
        tracing::info!(%request_id, state = ?outcome.state, "generation finished");
    });
    event_stream(rx)
}

#[derive(Debug, Deserialize)]
struct RunCommandBody {
    cmd: String,
    #[serde(default)]
    args: Vec<String>,
}

async fn run_command(State(state): State<AppState>, body: Bytes) -> Response {
    let body: RunCommandBody = match serde_json::from_slice(&body) {
        Ok(body) => body,
        Err(err) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("malformed request body: {err}"));
        }
    };
    state.start_request("run-command", &body.cmd);
    let sandbox = state.sandbox.clone();
    let result = tokio::task::spawn_blocking(move || sandbox.run(&body.cmd, &body.args)).await;
    match result {
        Ok(Ok(output)) => Json(json!({
            "success": output.success(),
            "stdout": output.stdout,
            "stderr": output.stderr,
            "exitCode": output.status,
            "timedOut": output.timed_out,
        }))
        .into_response(),
        Ok(Err(SandboxError::Inactive)) => json_error(StatusCode::BAD_REQUEST, "no active sandbox"),
        Ok(Err(SandboxError::NotAllowed(err))) => json_error(StatusCode::FORBIDDEN, &err.to_string()),
        Ok(Err(SandboxError::Failed(err))) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn json_error(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({"success": false, "error": error}))).into_response()
}
