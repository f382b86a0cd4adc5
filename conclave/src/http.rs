//! REST control plane — a thin axum layer over the orchestrator service.
//!
//! Handlers translate JSON to service calls and back; no orchestration
//! logic lives here. The listener binds to loopback unless configured
//! otherwise, and requests pass token auth (when enabled) and a
//! fixed-window per-client rate limit before reaching any handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ignore::WalkBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::service::{DecisionRequest, Orchestrator, ServiceError, TaskSpec};
use crate::stats::{compute_analytics, compute_stats};
use crate::task::TaskEvent;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<OrchestratorConfig>,
    limiter: Arc<Mutex<HashMap<(String, String), (Instant, u32)>>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, config: OrchestratorConfig) -> Self {
        Self {
            orchestrator,
            config: Arc::new(config),
            limiter: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Error envelope returned to REST callers.
struct ApiError(ServiceError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidState { .. } => StatusCode::CONFLICT,
            ServiceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        Self(e)
    }
}

/// Build the full route table.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/start", post(start_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/force-fail", post(force_fail))
        .route("/api/tasks/{id}/author-decision", post(author_decision))
        .route("/api/tasks/{id}/promote-round", post(promote_round))
        .route("/api/tasks/{id}/events", get(get_events))
        .route("/api/tasks/{id}/github-summary", get(github_summary))
        .route("/api/stats", get(stats))
        .route("/api/analytics", get(analytics))
        .route("/api/policy-templates", get(policy_templates))
        .route("/api/project-history", get(project_history))
        .route("/api/project-history/clear", post(clear_project_history))
        .route("/api/workspace-tree", get(workspace_tree))
        .route("/healthz", get(healthz))
        .layer(middleware::from_fn_with_state(state.clone(), guard_request))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(state: AppState) -> std::io::Result<()> {
    let addr = state.config.bind_addr;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control plane listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

/// Token auth + fixed-window rate limiting.
async fn guard_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.auth_token {
        let presented = request
            .headers()
            .get(state.config.auth_header.as_str())
            .and_then(|v| v.to_str().ok());
        if presented != Some(expected.as_str()) {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})))
                .into_response();
        }
    }

    let limit = state.config.rate_limit_per_minute;
    if limit > 0 {
        let client = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip().to_string())
            .unwrap_or_else(|| "local".to_string());
        let key = (client, request.uri().path().to_string());
        let mut windows = state.limiter.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let entry = windows.entry(key).or_insert((now, 0));
        if now.duration_since(entry.0).as_secs() >= 60 {
            *entry = (now, 0);
        }
        entry.1 += 1;
        if entry.1 > limit {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "rate limit exceeded"})),
            )
                .into_response();
        }
    }

    next.run(request).await
}

#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    #[serde(flatten)]
    spec: TaskSpec,
    #[serde(default)]
    auto_start: bool,
}

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<Value>, ApiError> {
    let task = state.orchestrator.create_task(request.spec)?;
    let task = if request.auto_start {
        state.orchestrator.start_task(&task.id, true).await?
    } else {
        task
    };
    Ok(Json(serde_json::to_value(&task).unwrap_or(Value::Null)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let tasks = state.orchestrator.list_tasks(query.limit)?;
    Ok(Json(json!({"tasks": tasks})))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state.orchestrator.get_task(&id)?;
    Ok(Json(json!({
        "task": task,
        "status": task.status,
        "last_gate_reason": task.last_gate_reason,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    background: bool,
}

async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<Value>, ApiError> {
    let background = body.map(|Json(b)| b.background).unwrap_or(false);
    let task = state.orchestrator.start_task(&id, background).await?;
    Ok(Json(json!({
        "status": task.status,
        "last_gate_reason": task.last_gate_reason,
    })))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state.orchestrator.cancel_task(&id)?;
    Ok(Json(json!({"status": task.status})))
}

#[derive(Debug, Deserialize)]
struct ForceFailRequest {
    reason: String,
}

async fn force_fail(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ForceFailRequest>,
) -> Result<Json<Value>, ApiError> {
    let task = state.orchestrator.force_fail(&id, &request.reason)?;
    Ok(Json(json!({
        "status": task.status,
        "last_gate_reason": task.last_gate_reason,
    })))
}

async fn author_decision(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<Value>, ApiError> {
    let task = state.orchestrator.submit_author_decision(&id, request).await?;
    Ok(Json(json!({"status": task.status})))
}

#[derive(Debug, Deserialize)]
struct PromoteRequest {
    round: u32,
    merge_target_path: String,
}

async fn promote_round(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PromoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .orchestrator
        .promote_round(&id, request.round, &request.merge_target_path)?;
    Ok(Json(json!({"status": task.status, "promoted_round": request.round})))
}

async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let events = state.orchestrator.get_events(&id)?;
    Ok(Json(json!({"events": events})))
}

async fn github_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state.orchestrator.get_task(&id)?;
    let events = state.orchestrator.get_events(&id)?;
    let summary = render_github_summary(&task.title, &task.status.to_string(), &events, &task);
    Ok(Json(json!({"markdown": summary})))
}

fn render_github_summary(
    title: &str,
    status: &str,
    events: &[TaskEvent],
    task: &crate::task::Task,
) -> String {
    let mut out = format!("## {}\n\n", title);
    out.push_str(&format!("- **status:** `{}`\n", status));
    if let Some(reason) = task.last_gate_reason {
        out.push_str(&format!("- **gate reason:** `{}`\n", reason));
    }
    out.push_str(&format!("- **rounds completed:** {}\n", task.rounds_completed));
    out.push_str(&format!(
        "- **participants:** author `{}`, reviewers {}\n",
        task.author,
        task.reviewers
            .iter()
            .map(|r| format!("`{}`", r))
            .collect::<Vec<_>>()
            .join(", ")
    ));
    out.push_str("\n### Timeline\n\n");
    for event in events.iter().rev().take(20).collect::<Vec<_>>().into_iter().rev() {
        out.push_str(&format!(
            "- `{}` {} {}\n",
            event.seq,
            event.kind,
            event
                .participant_id
                .as_ref()
                .map(|p| format!("({})", p))
                .unwrap_or_default()
        ));
    }
    out
}

async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tasks = state.orchestrator.list_tasks(usize::MAX)?;
    let mut events = Vec::new();
    for task in &tasks {
        events.extend(state.orchestrator.get_events(&task.id)?);
    }
    let snapshot = compute_stats(&tasks, &events, chrono::Duration::hours(24));
    Ok(Json(serde_json::to_value(&snapshot).unwrap_or(Value::Null)))
}

async fn analytics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let tasks = state.orchestrator.list_tasks(usize::MAX)?;
    let mut events = Vec::new();
    for task in &tasks {
        events.extend(state.orchestrator.get_events(&task.id)?);
    }
    let analytics = compute_analytics(&tasks, &events);
    Ok(Json(serde_json::to_value(&analytics).unwrap_or(Value::Null)))
}

#[derive(Debug, Default, Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: Option<String>,
}

async fn policy_templates(
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let root = query.path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    Ok(Json(workspace_profile(&root)))
}

/// Detect the workspace toolchain and recommend option presets for it.
fn workspace_profile(root: &FsPath) -> Value {
    let (kind, test_command, lint_command) = if root.join("Cargo.toml").is_file() {
        ("rust", "cargo test", "cargo clippy -- -D warnings")
    } else if root.join("package.json").is_file() {
        ("node", "npm test", "npm run lint")
    } else if root.join("pyproject.toml").is_file() || root.join("setup.py").is_file() {
        ("python", "pytest", "ruff check .")
    } else if root.join("go.mod").is_file() {
        ("go", "go test ./...", "go vet ./...")
    } else {
        ("generic", "", "")
    };

    json!({
        "workspace_kind": kind,
        "presets": [
            {
                "name": "review-gated",
                "options": {
                    "self_loop_mode": false,
                    "debate_mode": true,
                    "sandbox_mode": true,
                    "max_rounds": 3,
                    "test_command": test_command,
                    "lint_command": lint_command,
                }
            },
            {
                "name": "self-loop-fast",
                "options": {
                    "self_loop_mode": true,
                    "debate_mode": false,
                    "sandbox_mode": true,
                    "max_rounds": 1,
                    "test_command": test_command,
                    "lint_command": lint_command,
                }
            },
            {
                "name": "candidate-rounds",
                "options": {
                    "self_loop_mode": true,
                    "auto_merge": false,
                    "max_rounds": 5,
                    "test_command": test_command,
                    "lint_command": lint_command,
                }
            },
        ]
    })
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    project: Option<String>,
}

async fn project_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, ApiError> {
    let entries = state.orchestrator.query_history(query.project.as_deref())?;
    Ok(Json(json!({"entries": entries})))
}

async fn clear_project_history(
    State(state): State<AppState>,
    body: Option<Json<HistoryQuery>>,
) -> Result<Json<Value>, ApiError> {
    let project = body.and_then(|b| b.0.project);
    let removed = state.orchestrator.clear_history(project.as_deref())?;
    Ok(Json(json!({"removed": removed})))
}

const TREE_ENTRY_CAP: usize = 500;

async fn workspace_tree(
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let root = query
        .path
        .map(PathBuf::from)
        .ok_or_else(|| ServiceError::Validation("path query parameter required".into()))?;
    if !root.is_dir() {
        return Err(ServiceError::Validation(format!(
            "not a directory: {}",
            root.display()
        ))
        .into());
    }

    let mut entries = Vec::new();
    let walker = WalkBuilder::new(&root).hidden(true).git_ignore(true).build();
    for entry in walker.flatten() {
        if entries.len() >= TREE_ENTRY_CAP {
            break;
        }
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel = path.strip_prefix(&root).unwrap_or(path);
        entries.push(json!({
            "path": rel.to_string_lossy(),
            "dir": entry.file_type().map(|t| t.is_dir()).unwrap_or(false),
        }));
    }
    Ok(Json(json!({"root": root.display().to_string(), "entries": entries, "truncated": entries.len() >= TREE_ENTRY_CAP})))
}

async fn healthz() -> Json<Value> {
    Json(json!({"ok": true}))
}
