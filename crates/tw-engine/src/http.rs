//! JSON-over-HTTP control plane.
//!
//! Handlers that talk to the alert manager block on its reply channel, so they
//! run on the blocking pool. Errors leave as `{kind, message, details}`.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use tw_types::{
    AckState, ActivationRequest, AlertFilter, AlertError, Fill, IngestError, IsolationError,
    Priority, ReleaseRequest, RuleError, RulePatch, RuleSetSpec, Tick, TwError, TwResult,
};

use crate::engine::Engine;

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(prometheus_text))
        .route("/metrics/current", get(current_metrics))
        .route("/metrics/history", get(metrics_history))
        .route("/alerts", get(list_alerts))
        .route("/alerts/stats", get(alert_stats))
        .route("/alerts/{id}", get(get_alert))
        .route("/alerts/{id}/ack", post(ack_alert))
        .route("/alerts/{id}/resolve", post(resolve_alert))
        .route("/alerts/{id}/escalate", post(escalate_alert))
        .route("/isolations", get(list_isolations).post(activate_isolation))
        .route("/isolations/{id}", get(get_isolation).delete(force_release))
        .route("/isolations/{id}/release", post(request_release))
        .route("/rules", get(get_rules).put(put_rules))
        .route("/rules/{id}", axum::routing::patch(patch_rule))
        .route("/equity", put(put_equity))
        .route("/ingest/tick", post(ingest_tick))
        .route("/ingest/fill", post(ingest_fill))
        .with_state(AppState { engine })
}

// --- errors ---

/// Structured error body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    details: Value,
}

impl ApiError {
    pub fn bad_request(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind,
            message: message.into(),
            details: Value::Null,
        }
    }

    fn not_found(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<TwError> for ApiError {
    fn from(e: TwError) -> Self {
        let status = match &e {
            TwError::Ingest(IngestError::NotAccepting) => StatusCode::SERVICE_UNAVAILABLE,
            TwError::Ingest(_) | TwError::Config(_) | TwError::Serialization(_) => StatusCode::BAD_REQUEST,
            TwError::Rule(RuleError::NotFound { .. }) => StatusCode::NOT_FOUND,
            TwError::Rule(_) => StatusCode::BAD_REQUEST,
            TwError::Alert(AlertError::NotFound { .. }) => StatusCode::NOT_FOUND,
            TwError::Alert(AlertError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            TwError::Isolation(IsolationError::NotFound { .. }) => StatusCode::NOT_FOUND,
            TwError::Isolation(IsolationError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            TwError::Isolation(IsolationError::Unauthorized { .. }) => StatusCode::FORBIDDEN,
            TwError::Unsafe(_) | TwError::Journal(_) | TwError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let details = match &e {
            TwError::Rule(RuleError::Rejected { errors }) => json!({ "errors": errors }),
            _ => Value::Null,
        };
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
            details,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request("InvalidRequest", e.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(e: PathRejection) -> Self {
        Self::bad_request("InvalidRequest", e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::bad_request("InvalidRequest", e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(kind = self.kind, message = %self.message, "request failed");
        }
        let body = json!({
            "kind": self.kind,
            "message": self.message,
            "details": self.details,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Runs a call into the alert manager on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> TwResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::from(TwError::Internal(e.to_string())))?
        .map_err(ApiError::from)
}

// --- health ---

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(state): State<AppState>) -> Response {
    let status = state.engine.status();
    let code = if status.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

async fn prometheus_text(State(state): State<AppState>) -> Result<Response, ApiError> {
    let text = state.engine.counters().render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        text,
    )
        .into_response())
}

// --- metrics ---

async fn current_metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let latest = state
        .engine
        .current_metrics()
        .ok_or_else(|| ApiError::not_found("NoMetrics", "no metrics record yet"))?;
    Ok(Json(latest.as_ref().clone()).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    from_seq: Option<u64>,
    to_seq: Option<u64>,
}

async fn metrics_history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query?;
    let history = state.engine.history();
    let records = if q.from_seq.is_some() || q.to_seq.is_some() {
        history.seq_range(q.from_seq.unwrap_or(0), q.to_seq.unwrap_or(u64::MAX))
    } else {
        history.range(q.from, q.to)
    };
    let body: Vec<_> = records.iter().map(|m| m.as_ref()).collect();
    Ok(Json(body).into_response())
}

// --- alerts ---

#[derive(Debug, Default, Deserialize)]
struct AlertQuery {
    state: Option<String>,
}

fn parse_filter(state: Option<&str>) -> Result<AlertFilter, ApiError> {
    Ok(match state {
        None | Some("active") => AlertFilter::Active,
        Some("all") => AlertFilter::All,
        Some("new") => AlertFilter::State(AckState::New),
        Some("acked") => AlertFilter::State(AckState::Acked),
        Some("resolved") => AlertFilter::State(AckState::Resolved),
        Some(other) => {
            return Err(ApiError::bad_request(
                "InvalidRequest",
                format!("unknown alert state '{}'", other),
            ))
        }
    })
}

async fn list_alerts(
    State(state): State<AppState>,
    query: Result<Query<AlertQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query?;
    let filter = parse_filter(q.state.as_deref())?;
    let aim = state.engine.aim().clone();
    let alerts = blocking(move || aim.alerts(filter)).await?;
    Ok(Json(alerts).into_response())
}

async fn alert_stats(State(state): State<AppState>) -> Result<Response, ApiError> {
    let aim = state.engine.aim().clone();
    let stats = blocking(move || aim.stats()).await?;
    Ok(Json(stats).into_response())
}

async fn get_alert(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(alert_id) = id?;
    let aim = state.engine.aim().clone();
    let alert = blocking(move || aim.alert(alert_id))
        .await?
        .ok_or_else(|| TwError::from(AlertError::NotFound { alert_id }))?;
    Ok(Json(alert).into_response())
}

#[derive(Debug, Deserialize)]
struct AckBody {
    assignee: String,
}

async fn ack_alert(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<AckBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Path(alert_id) = id?;
    let Json(body) = body?;
    let aim = state.engine.aim().clone();
    let alert = blocking(move || aim.ack(alert_id, &body.assignee)).await?;
    Ok(Json(alert).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ResolveBody {
    notes: Option<String>,
}

async fn resolve_alert(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<ResolveBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Path(alert_id) = id?;
    let Json(body) = body?;
    let aim = state.engine.aim().clone();
    let alert = blocking(move || aim.resolve(alert_id, body.notes)).await?;
    Ok(Json(alert).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct EscalateBody {
    to: Option<Priority>,
}

async fn escalate_alert(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<EscalateBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Path(alert_id) = id?;
    let Json(body) = body?;
    let aim = state.engine.aim().clone();
    let alert = blocking(move || aim.escalate(alert_id, body.to)).await?;
    Ok(Json(alert).into_response())
}

// --- isolations ---

#[derive(Debug, Deserialize)]
struct IsolationQuery {
    #[serde(default = "active_only")]
    active: bool,
}

fn active_only() -> bool {
    true
}

async fn list_isolations(
    State(state): State<AppState>,
    query: Result<Query<IsolationQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(q) = query?;
    let aim = state.engine.aim().clone();
    let actions = blocking(move || aim.isolations(q.active)).await?;
    Ok(Json(actions).into_response())
}

async fn get_isolation(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(action_id) = id?;
    let aim = state.engine.aim().clone();
    let action = blocking(move || aim.isolation(action_id))
        .await?
        .ok_or_else(|| TwError::from(IsolationError::NotFound { action_id }))?;
    Ok(Json(action).into_response())
}

async fn activate_isolation(
    State(state): State<AppState>,
    body: Result<Json<ActivationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    info!(principal = %request.principal, target = %request.target, method = %request.method, "manual isolation requested");
    let aim = state.engine.aim().clone();
    let action = blocking(move || aim.activate(request)).await?;
    Ok(Json(action).into_response())
}

async fn request_release(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<ReleaseRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Path(action_id) = id?;
    let Json(request) = body?;
    let aim = state.engine.aim().clone();
    let action = blocking(move || aim.request_release(action_id, request)).await?;
    Ok(Json(action).into_response())
}

#[derive(Debug, Deserialize)]
struct PrincipalQuery {
    principal: String,
}

async fn force_release(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<PrincipalQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Path(action_id) = id?;
    let Query(q) = query?;
    let aim = state.engine.aim().clone();
    let action = blocking(move || aim.force_release(action_id, &q.principal)).await?;
    Ok(Json(action).into_response())
}

// --- rules ---

#[derive(Debug, Serialize)]
struct RulesView {
    version: u64,
    #[serde(flatten)]
    spec: RuleSetSpec,
}

#[derive(Debug, Serialize)]
struct Published {
    version: u64,
}

async fn get_rules(State(state): State<AppState>) -> Json<RulesView> {
    let (version, spec) = state.engine.rule_set();
    Json(RulesView { version, spec })
}

async fn put_rules(
    State(state): State<AppState>,
    body: Result<Json<RuleSetSpec>, JsonRejection>,
) -> ApiResult<Published> {
    let Json(spec) = body?;
    let version = state.engine.publish_rules(spec)?;
    Ok(Json(Published { version }))
}

async fn patch_rule(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    body: Result<Json<RulePatch>, JsonRejection>,
) -> ApiResult<Published> {
    let Path(rule_id) = id?;
    let Json(patch) = body?;
    let version = state.engine.patch_rule(&rule_id, &patch)?;
    Ok(Json(Published { version }))
}

// --- equity & ingress ---

#[derive(Debug, Deserialize)]
struct EquityBody {
    equity: f64,
}

async fn put_equity(
    State(state): State<AppState>,
    body: Result<Json<EquityBody>, JsonRejection>,
) -> ApiResult<Value> {
    let Json(body) = body?;
    state.engine.set_equity(body.equity)?;
    Ok(Json(json!({ "equity": body.equity })))
}

async fn ingest_tick(
    State(state): State<AppState>,
    body: Result<Json<Tick>, JsonRejection>,
) -> ApiResult<tw_types::Ack> {
    let Json(tick) = body?;
    Ok(Json(state.engine.ingest_tick(tick)?))
}

async fn ingest_fill(
    State(state): State<AppState>,
    body: Result<Json<Fill>, JsonRejection>,
) -> ApiResult<tw_types::Ack> {
    let Json(fill) = body?;
    Ok(Json(state.engine.ingest_fill(fill)?))
}
