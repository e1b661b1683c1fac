// HTTP surface
// Router, middleware (auth, CORS, security headers), request validation, and
// the error taxonomy. Handlers are thin wrappers over the queue and store.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use cadence_core::{CadenceError, SmartRunPlan, SystemClock};
use cadence_runtime::{recover_interrupted_runs, QueueOutcome, Scheduler};
use cadence_types::{
    Link, Pipeline, PipelineSettings, QualityGate, RunMode, Schedule, Step, ValidationIssue,
};

use crate::{version_lt, AppState, PairingStatus};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Validation(Vec<ValidationIssue>),
    NotFound(String),
    Conflict { code: String, message: String },
    PreflightFailed(SmartRunPlan),
    Unauthorized,
    ServiceUnavailable { code: String, message: String },
    Internal(String),
}

impl From<CadenceError> for ApiError {
    fn from(err: CadenceError) -> Self {
        match err {
            CadenceError::Validation(issues) => ApiError::Validation(issues),
            CadenceError::NotFound(what) => ApiError::NotFound(what),
            CadenceError::Conflict { code, message } => ApiError::Conflict { code, message },
            CadenceError::Unauthorized => ApiError::Unauthorized,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(details) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Validation failed", "details": details})),
            )
                .into_response(),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("Not found: {what}")})),
            )
                .into_response(),
            ApiError::Conflict { code, message } => (
                StatusCode::CONFLICT,
                Json(json!({"error": message, "code": code})),
            )
                .into_response(),
            ApiError::PreflightFailed(plan) => (
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "Preflight failed",
                    "reason": "preflight_failed",
                    "failedChecks": plan.failed_checks(),
                })),
            )
                .into_response(),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Unauthorized"})),
            )
                .into_response(),
            ApiError::ServiceUnavailable { code, message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": message, "code": code})),
            )
                .into_response(),
            ApiError::Internal(detail) => {
                tracing::error!("internal error: {detail}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "Internal server error"})),
                )
                    .into_response()
            }
        }
    }
}

/// Deserialize a JSON body into a typed input, reporting serde failures in
/// the validation error shape.
fn parse_body<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|err| {
        ApiError::Validation(vec![ValidationIssue::new("body", err.to_string())])
    })
}

// ============================================================================
// Router & middleware
// ============================================================================

pub fn router(state: AppState) -> Router {
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/state", get(get_state))
        .route("/api/pipelines", get(list_pipelines).post(create_pipeline))
        .route(
            "/api/pipelines/{id}",
            get(get_pipeline)
                .put(update_pipeline)
                .delete(delete_pipeline),
        )
        .route("/api/pipelines/{id}/runs", post(launch_run))
        .route("/api/pipelines/{id}/smart-run-plan", post(smart_run_plan))
        .route("/api/pipelines/{id}/startup-check", post(startup_check))
        .route(
            "/api/pipelines/{id}/secure-inputs",
            post(upsert_secure_inputs).delete(delete_secure_inputs),
        )
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/runs/{id}/pause", post(pause_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route(
            "/api/runs/{id}/approvals/{approval_id}",
            post(resolve_approval),
        )
        .route("/api/pairing/sessions", post(create_pairing_session))
        .route(
            "/api/pairing/sessions/{id}/approve",
            post(approve_pairing_session),
        )
        .route(
            "/api/pairing/sessions/{id}/claim",
            post(claim_pairing_session),
        )
        // Later layers wrap earlier ones: auth runs innermost so CORS and the
        // security headers apply to its rejections too.
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .layer(cors)
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    response
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.config.dashboard_api_token.as_deref() else {
        return next.run(request).await;
    };
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    let path = request.uri().path();
    if path == "/api/health" || !path.starts_with("/api/") {
        return next.run(request).await;
    }
    match extract_request_token(request.headers()) {
        Some(provided) if tokens_match(&provided, expected) => next.run(request).await,
        _ => ApiError::Unauthorized.into_response(),
    }
}

fn tokens_match(provided: &str, expected: &str) -> bool {
    provided.len() == expected.len()
        && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-api-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let bearer = auth
        .trim()
        .strip_prefix("Bearer ")
        .or_else(|| auth.trim().strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

// ============================================================================
// Health & state
// ============================================================================

#[derive(Debug, Deserialize, Default)]
struct HealthQuery {
    #[serde(rename = "clientVersion")]
    client_version: Option<String>,
}

async fn health(
    State(state): State<AppState>,
    Query(query): Query<HealthQuery>,
    headers: HeaderMap,
) -> Json<Value> {
    let mut body = json!({
        "ok": true,
        "now": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(minimum) = state.config.minimum_desktop_version.as_deref() {
        let client_version = query.client_version.or_else(|| {
            headers
                .get("x-client-version")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });
        let update_required = client_version
            .as_deref()
            .map(|v| version_lt(v, minimum))
            .unwrap_or(false);
        body["client"] = json!({
            "minimumDesktopVersion": minimum,
            "clientVersion": client_version,
            "updateRequired": update_required,
            "message": if update_required {
                format!("This desktop build is older than {minimum}; please update.")
            } else {
                "up to date".to_string()
            },
        });
    }
    Json(body)
}

/// Sanitized snapshot: provider keys and MCP env/headers are masked.
async fn get_state(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store = state.store();
    let pipelines = store.list_pipelines().await;
    let runs = store.list_runs(Some(50)).await;
    let providers: Vec<_> = store
        .list_providers()
        .await
        .iter()
        .map(|p| p.masked())
        .collect();
    let mcp_servers: Vec<_> = store
        .list_mcp_servers()
        .await
        .iter()
        .map(|m| m.masked())
        .collect();
    let storage = store.storage_settings().await;
    Ok(Json(json!({
        "pipelines": pipelines,
        "runs": runs,
        "providers": providers,
        "mcpServers": mcp_servers,
        "storage": storage,
    })))
}

// ============================================================================
// Pipelines
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PipelineInput {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    settings: Option<PipelineSettings>,
    #[serde(default)]
    schedule: Option<Schedule>,
    #[serde(default)]
    quality_gates: Vec<QualityGate>,
}

impl PipelineInput {
    fn into_pipeline(self, existing: Option<&Pipeline>) -> Pipeline {
        let mut pipeline = match existing {
            Some(existing) => existing.clone(),
            None => Pipeline::new(self.name.clone()),
        };
        pipeline.name = self.name;
        pipeline.description = self.description;
        pipeline.steps = self.steps;
        pipeline.links = self.links;
        if let Some(settings) = self.settings {
            pipeline.settings = settings;
        }
        pipeline.schedule = self.schedule;
        pipeline.quality_gates = self.quality_gates;
        pipeline
    }
}

async fn list_pipelines(State(state): State<AppState>) -> Json<Vec<Pipeline>> {
    Json(state.store().list_pipelines().await)
}

async fn create_pipeline(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Pipeline>), ApiError> {
    let input: PipelineInput = parse_body(body)?;
    if input.name.trim().is_empty() {
        return Err(ApiError::Validation(vec![ValidationIssue::new(
            "name",
            "name must not be empty",
        )]));
    }
    let pipeline = state
        .store()
        .create_pipeline(input.into_pipeline(None))
        .await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Pipeline>, ApiError> {
    state
        .store()
        .get_pipeline(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("pipeline {id}")))
}

async fn update_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Pipeline>, ApiError> {
    let input: PipelineInput = parse_body(body)?;
    let existing = state
        .store()
        .get_pipeline(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("pipeline {id}")))?;
    let updated = state
        .store()
        .update_pipeline(input.into_pipeline(Some(&existing)))
        .await?;
    Ok(Json(updated))
}

/// Delete a pipeline, cancelling its active runs and cascading to secure
/// inputs and the scheduler marker.
async fn delete_pipeline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let store = state.store();
    if store.get_pipeline(&id).await.is_none() {
        return Err(ApiError::NotFound(format!("pipeline {id}")));
    }
    for run in store.list_runs(None).await {
        if run.pipeline_id == id && !run.status.is_terminal() {
            state
                .queue
                .cancel_run(&run.id, "pipeline_no_longer_exists")
                .await?;
        }
    }
    store.delete_pipeline(&id).await?;
    state.vault().delete(&id, None).await?;
    Ok(Json(json!({"deleted": true})))
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchRunInput {
    task: String,
    #[serde(default)]
    inputs: HashMap<String, String>,
    #[serde(default)]
    persist_sensitive_inputs: bool,
    #[serde(default)]
    run_mode: Option<RunMode>,
}

async fn launch_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let input: LaunchRunInput = parse_body(body)?;
    if input.task.trim().is_empty() {
        return Err(ApiError::Validation(vec![ValidationIssue::new(
            "task",
            "task must not be empty",
        )]));
    }
    let outcome = state
        .queue
        .queue_run(
            &id,
            input.task,
            input.inputs,
            input.persist_sensitive_inputs,
            input.run_mode.unwrap_or(RunMode::Smart),
        )
        .await?;
    match outcome {
        QueueOutcome::Launched(run) => Ok((StatusCode::ACCEPTED, Json(json!({"run": run})))),
        QueueOutcome::Rejected(plan) => Err(ApiError::PreflightFailed(plan)),
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SmartRunPlanInput {
    #[serde(default)]
    inputs: HashMap<String, String>,
    #[serde(default)]
    run_mode: Option<RunMode>,
}

async fn smart_run_plan(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<SmartRunPlan>, ApiError> {
    let input: SmartRunPlanInput = match body {
        Some(Json(value)) => parse_body(value)?,
        None => SmartRunPlanInput::default(),
    };
    let plan = state
        .queue
        .smart_run_plan(&id, &input.inputs, input.run_mode.unwrap_or(RunMode::Smart))
        .await?;
    Ok(Json(plan))
}

/// Deep credential probe for every provider the pipeline uses.
async fn startup_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let pipeline = state
        .store()
        .get_pipeline(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("pipeline {id}")))?;
    let mut provider_ids: Vec<String> =
        pipeline.steps.iter().map(|s| s.provider_id.clone()).collect();
    provider_ids.sort();
    provider_ids.dedup();

    let mut providers = Vec::new();
    for provider_id in provider_ids {
        match state.credentials().status(&provider_id, true).await {
            Ok(status) => providers.push(json!({
                "id": provider_id,
                "loggedIn": status.logged_in,
                "canUseApi": status.can_use_api,
                "canUseCli": status.can_use_cli,
            })),
            Err(_) => providers.push(json!({
                "id": provider_id,
                "loggedIn": false,
                "canUseApi": false,
                "canUseCli": false,
            })),
        }
    }
    Ok(Json(json!({"providers": providers})))
}

#[derive(Debug, Deserialize, Default)]
struct ListRunsQuery {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Json<Value> {
    let runs = state.store().list_runs(query.limit).await;
    Json(json!({"runs": runs}))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .store()
        .get_run(&id)
        .await
        .map(|run| Json(json!({"run": run})))
        .ok_or_else(|| ApiError::NotFound(format!("run {id}")))
}

async fn stop_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.queue.cancel_run(&id, "Stopped by user").await?;
    Ok(Json(json!({"run": run})))
}

async fn pause_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.queue.pause_run(&id).await?;
    Ok(Json(json!({"run": run})))
}

async fn resume_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state.queue.resume_run(&id).await?;
    Ok(Json(json!({"run": run})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Deserialize)]
struct ApprovalInput {
    decision: ApprovalDecision,
    #[serde(default)]
    note: Option<String>,
}

async fn resolve_approval(
    State(state): State<AppState>,
    Path((run_id, approval_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let input: ApprovalInput = parse_body(body)?;
    let approve = matches!(input.decision, ApprovalDecision::Approved);
    let run = state
        .queue
        .resolve_approval(&run_id, &approval_id, approve, input.note)
        .await?;
    Ok(Json(json!({"run": run})))
}

// ============================================================================
// Secure inputs
// ============================================================================

#[derive(Debug, Deserialize)]
struct SecureInputsInput {
    inputs: HashMap<String, String>,
}

async fn upsert_secure_inputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let input: SecureInputsInput = parse_body(body)?;
    if state.store().get_pipeline(&id).await.is_none() {
        return Err(ApiError::NotFound(format!("pipeline {id}")));
    }
    let keys = state.vault().upsert(&id, &input.inputs).await?;
    Ok(Json(json!({"keys": keys})))
}

#[derive(Debug, Deserialize, Default)]
struct DeleteSecureInputsInput {
    #[serde(default)]
    keys: Option<Vec<String>>,
}

async fn delete_secure_inputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, ApiError> {
    let input: DeleteSecureInputsInput = match body {
        Some(Json(value)) => parse_body(value)?,
        None => DeleteSecureInputsInput::default(),
    };
    state.vault().delete(&id, input.keys.as_deref()).await?;
    let keys = state.vault().keys(&id).await?;
    Ok(Json(json!({"keys": keys})))
}

// ============================================================================
// Pairing
// ============================================================================

async fn create_pairing_session(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.pairing.prune_expired().await;
    let session = state.pairing.create().await;
    Ok(Json(json!({
        "id": session.id,
        "code": session.code,
        "expiresAt": session.expires_at.to_rfc3339(),
    })))
}

async fn approve_pairing_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    if state.config.remote_mode {
        let Some(admin_token) = state.config.pairing_admin_token.as_deref() else {
            return Err(ApiError::ServiceUnavailable {
                code: "pairing_admin_token_missing".to_string(),
                message: "remote mode requires PAIRING_ADMIN_TOKEN".to_string(),
            });
        };
        let provided = headers
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !tokens_match(provided, admin_token) {
            return Err(ApiError::Unauthorized);
        }
    }
    let session = state
        .pairing
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("pairing session {id}")))?;
    if session.is_expired(chrono::Utc::now()) {
        return Err(ApiError::Conflict {
            code: "pairing_expired".to_string(),
            message: "pairing session expired".to_string(),
        });
    }
    let session = state
        .pairing
        .update(&id, |s| {
            if s.status == PairingStatus::Pending {
                s.status = PairingStatus::Approved;
            }
        })
        .await
        .ok_or_else(|| ApiError::NotFound(format!("pairing session {id}")))?;
    Ok(Json(json!({"id": session.id, "status": "approved"})))
}

#[derive(Debug, Deserialize)]
struct ClaimPairingInput {
    code: String,
}

async fn claim_pairing_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let input: ClaimPairingInput = parse_body(body)?;
    let session = state
        .pairing
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("pairing session {id}")))?;
    if session.is_expired(chrono::Utc::now()) {
        return Err(ApiError::Conflict {
            code: "pairing_expired".to_string(),
            message: "pairing session expired".to_string(),
        });
    }
    if session.status != PairingStatus::Approved {
        return Err(ApiError::Conflict {
            code: "pairing_not_approved".to_string(),
            message: "pairing session is not approved".to_string(),
        });
    }
    if !tokens_match(&input.code, &session.code) {
        return Err(ApiError::Unauthorized);
    }
    let claim_token = uuid::Uuid::new_v4().to_string();
    let token_for_session = claim_token.clone();
    let _ = state
        .pairing
        .update(&id, move |s| {
            s.status = PairingStatus::Claimed;
            s.claim_token = Some(token_for_session);
        })
        .await;
    Ok(Json(json!({"id": id, "token": claim_token})))
}

// ============================================================================
// Serve
// ============================================================================

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    // Bring interrupted runs back before accepting traffic.
    let requeued = recover_interrupted_runs(&state.queue).await?;
    if requeued > 0 {
        tracing::info!("recovered {requeued} interrupted run(s)");
    }

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        state.queue.clone(),
        Arc::new(SystemClock),
        state.config.catchup_window_minutes,
    ));
    let scheduler_task = scheduler.spawn(shutdown.clone());

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("cadence-server listening on http://{addr}");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await;

    shutdown.cancel();
    scheduler_task.abort();
    result?;
    Ok(())
}
