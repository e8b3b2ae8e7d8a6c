//! The HTTP surface.
//!
//! Route table per the platform contract: chat, task inspection and
//! submission, model readiness, health, Prometheus metrics, the
//! subconscious SSE stream, and witness collapse. One guard middleware
//! applies, in order: the per-endpoint in-flight budget, per-subject rate
//! limiting, and capability verification (header transports; `/chat` also
//! accepts an in-body token and verifies it in the handler).

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use sos_capability::{token_from_bearer, CapabilityToken, VerifyError};
use sos_types::{CapabilityAction, SosError, TaskId, TaskState};

use crate::health::health_snapshot;
use crate::{ChatRequest, Engine, WitnessVote};

/// Header carrying a base64url-encoded capability token.
pub const CAPABILITY_HEADER: &str = "x-sos-capability";

/// Per-endpoint ceiling on concurrently executing requests.
pub const INFLIGHT_BUDGET: usize = 64;

//─────────────────────────────
//  Error mapping
//─────────────────────────────

/// HTTP-mapped failure.
#[derive(Debug)]
pub enum ApiError {
    /// A platform error kind.
    Sos(SosError),
    /// A capability verification failure (strict mode).
    Capability(VerifyError),
}

impl From<SosError> for ApiError {
    fn from(err: SosError) -> Self {
        Self::Sos(err)
    }
}

fn verify_reason(err: &VerifyError) -> &'static str {
    match err {
        VerifyError::MalformedToken(_) => "MalformedToken",
        VerifyError::InvalidSignature => "InvalidSignature",
        VerifyError::Expired => "Expired",
        VerifyError::UsesExhausted => "UsesExhausted",
        VerifyError::ActionMismatch => "ActionMismatch",
        VerifyError::ResourceMismatch => "ResourceMismatch",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Capability(err) => {
                let body = json!({
                    "error": err.to_string(),
                    "reason": verify_reason(&err),
                });
                (StatusCode::FORBIDDEN, Json(body)).into_response()
            }
            Self::Sos(err) => {
                let (status, body) = match &err {
                    SosError::Validation(msg) => {
                        (StatusCode::BAD_REQUEST, json!({ "error": msg }))
                    }
                    SosError::Authorization(msg) => {
                        (StatusCode::FORBIDDEN, json!({ "error": msg }))
                    }
                    SosError::RateLimited { retry_after_secs } => {
                        let body = json!({ "error": err.to_string() });
                        let mut response =
                            (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                        if let Ok(value) = retry_after_secs.to_string().parse() {
                            response.headers_mut().insert(header::RETRY_AFTER, value);
                        }
                        return response;
                    }
                    SosError::CircuitOpen(name) => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        json!({ "error": format!("dependency {name} unavailable") }),
                    ),
                    SosError::AllProvidersFailed { trail } => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        json!({
                            "error": "all language model providers are currently unavailable; please retry",
                            "detail": trail,
                        }),
                    ),
                    SosError::NotFound(what) => {
                        (StatusCode::NOT_FOUND, json!({ "error": what }))
                    }
                    SosError::InvalidTransition { state, action } => (
                        StatusCode::CONFLICT,
                        json!({ "error": format!("cannot {action} a {state} task") }),
                    ),
                    SosError::Internal(msg) => {
                        let trace_id = Uuid::new_v4().to_string();
                        error!(trace_id, error = msg, "internal error");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            json!({ "error": "internal error", "trace_id": trace_id }),
                        )
                    }
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

//─────────────────────────────
//  State and router
//─────────────────────────────

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    in_flight: Arc<DashMap<String, Arc<AtomicUsize>>>,
}

/// Build the engine router.
pub fn router(engine: Arc<Engine>) -> Router {
    let state = AppState {
        engine,
        in_flight: Arc::new(DashMap::new()),
    };
    Router::new()
        .route("/chat", post(chat))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/submit", post(submit_task))
        .route("/models", get(list_models))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/stream/subconscious", get(subconscious))
        .route("/witness", post(witness))
        .layer(middleware::from_fn_with_state(state.clone(), guard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

//─────────────────────────────
//  Guard middleware
//─────────────────────────────

/// What a route demands of a presented token.
struct RoutePolicy {
    action: CapabilityAction,
    resource: &'static str,
    /// `/chat` defers capability checks to its handler (body tokens).
    checked_in_handler: bool,
}

fn route_policy(method: &axum::http::Method, path: &str) -> Option<RoutePolicy> {
    use axum::http::Method;
    match (method, path) {
        (&Method::POST, "/chat") => Some(RoutePolicy {
            action: CapabilityAction::ToolExecute,
            resource: "engine:chat",
            checked_in_handler: true,
        }),
        (&Method::POST, "/witness") => Some(RoutePolicy {
            action: CapabilityAction::ToolExecute,
            resource: "engine:witness",
            checked_in_handler: false,
        }),
        (&Method::POST, _) if path.starts_with("/tasks/") => Some(RoutePolicy {
            action: CapabilityAction::ToolExecute,
            resource: "engine:tasks",
            checked_in_handler: false,
        }),
        (&Method::GET, "/tasks") => Some(RoutePolicy {
            action: CapabilityAction::LedgerRead,
            resource: "engine:tasks",
            checked_in_handler: false,
        }),
        (&Method::GET, _) if path.starts_with("/tasks/") => Some(RoutePolicy {
            action: CapabilityAction::LedgerRead,
            resource: "engine:tasks",
            checked_in_handler: false,
        }),
        (&Method::GET, "/models") => Some(RoutePolicy {
            action: CapabilityAction::ConfigRead,
            resource: "engine:models",
            checked_in_handler: false,
        }),
        // /health, /metrics, /stream/subconscious stay ungated.
        _ => None,
    }
}

fn header_token(headers: &HeaderMap) -> Result<Option<CapabilityToken>, VerifyError> {
    if let Some(value) = headers.get(CAPABILITY_HEADER) {
        let raw = value
            .to_str()
            .map_err(|_| VerifyError::MalformedToken("header is not ascii".into()))?;
        return sos_capability::decode_token(raw).map(Some);
    }
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        let raw = value
            .to_str()
            .map_err(|_| VerifyError::MalformedToken("header is not ascii".into()))?;
        return token_from_bearer(raw).map(Some);
    }
    Ok(None)
}

/// Apply strict-vs-log capability policy to an optional token.
fn enforce_capability(
    engine: &Engine,
    token: Result<Option<CapabilityToken>, VerifyError>,
    action: CapabilityAction,
    resource: &str,
) -> Result<Option<String>, ApiError> {
    let strict = engine.services().config.strict_capabilities;
    let outcome = match token {
        Ok(Some(token)) => {
            let subject = token.subject.as_str().to_owned();
            engine
                .services()
                .verifier
                .verify(&token, action, resource)
                .map(|()| Some(subject))
        }
        Ok(None) => Err(VerifyError::MalformedToken("missing capability token".into())),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(subject) => Ok(subject),
        Err(err) if strict => Err(ApiError::Capability(err)),
        Err(err) => {
            warn!(action = %action, resource, error = %err, "capability failure (strict mode off)");
            Ok(None)
        }
    }
}

async fn guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| path.clone());
    let metrics = state.engine.metrics().clone();

    // 1. Per-endpoint in-flight budget.
    let counter = state
        .in_flight
        .entry(route.clone())
        .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
        .clone();
    if counter.fetch_add(1, Ordering::SeqCst) >= INFLIGHT_BUDGET {
        counter.fetch_sub(1, Ordering::SeqCst);
        metrics.throttled.inc();
        return ApiError::Sos(SosError::RateLimited { retry_after_secs: 1 }).into_response();
    }

    // 2. Rate limit per (subject, action); 3. capability policy.
    let early = if let Some(policy) = route_policy(&method, &path) {
        let token = header_token(request.headers());
        let subject = match &token {
            Ok(Some(t)) => t.subject.as_str().to_owned(),
            _ => "anonymous".to_owned(),
        };
        let limited = state
            .engine
            .services()
            .limiter
            .check(&subject, policy.action.as_str())
            .err();
        if let Some(denied) = limited {
            metrics.throttled.inc();
            Some(ApiError::Sos(denied.into()).into_response())
        } else if !policy.checked_in_handler {
            enforce_capability(&state.engine, token, policy.action, policy.resource)
                .err()
                .map(IntoResponse::into_response)
        } else {
            None
        }
    } else {
        None
    };

    let started = std::time::Instant::now();
    let response = match early {
        Some(response) => response,
        None => {
            metrics.in_flight.inc();
            let response = next.run(request).await;
            metrics.in_flight.dec();
            response
        }
    };
    counter.fetch_sub(1, Ordering::SeqCst);

    let status_class = match response.status().as_u16() {
        200..=299 => "2xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    metrics
        .http_requests
        .with_label_values(&[route.as_str(), status_class])
        .inc();
    metrics
        .http_latency
        .with_label_values(&[route.as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}

//─────────────────────────────
//  Handlers
//─────────────────────────────

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    // Body token wins; header transports are the fallback.
    let token = match request.capability.clone() {
        Some(token) => Ok(Some(token)),
        None => header_token(&headers),
    };
    enforce_capability(
        &state.engine,
        token,
        CapabilityAction::ToolExecute,
        "engine:chat",
    )?;
    let outcome = state.engine.handle_chat(request).await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    state: Option<String>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TasksQuery>,
) -> Result<Response, ApiError> {
    let filter = query
        .state
        .map(|raw| raw.parse::<TaskState>())
        .transpose()?;
    let tasks = state.engine.services().store.list(filter).await?;
    Ok(Json(json!({ "tasks": tasks })).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id: TaskId = id.parse()?;
    let task = state.engine.services().store.get(id).await?;
    Ok(Json(task).into_response())
}

/// Body of `POST /tasks/{id}/submit`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitBody {
    /// Executor output.
    pub output: String,
    /// Model that produced it.
    pub model_used: String,
    /// Executor verdict.
    pub status: sos_types::ExecutionStatus,
    /// Submitting worker, for reputation bookkeeping.
    #[serde(default)]
    pub worker_id: Option<String>,
}

async fn submit_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SubmitBody>,
) -> Result<Response, ApiError> {
    let id: TaskId = id.parse()?;
    let services = state.engine.services().clone();
    let actor = body.worker_id.clone().unwrap_or_else(|| "worker".into());

    // Workers report results over HTTP only; a claimed task starts
    // implicitly at submission.
    let current = services.store.get(id).await?;
    if current.state == TaskState::Claimed {
        services.store.start(id, &actor).await?;
    }
    let result = sos_types::TaskResult {
        output: body.output,
        model_used: body.model_used,
        status: body.status,
    };
    let submitted = services.store.submit(id, &actor, result).await?;

    // v1 review policy: auto-approve successes, auto-reject failures.
    let task = match body.status {
        sos_types::ExecutionStatus::Success => {
            let task = services.store.approve(id, "engine").await?;
            if let Some(worker_id) = &body.worker_id {
                let earnings = submitted.bounty.unwrap_or(0);
                if let Err(e) = services.registry.record_completion(worker_id, earnings).await {
                    warn!(worker = worker_id, error = %e, "completion bookkeeping failed");
                }
            }
            task
        }
        sos_types::ExecutionStatus::Failure => {
            let task = services
                .store
                .reject(id, "engine", Some("executor reported failure"))
                .await?;
            if let Some(worker_id) = &body.worker_id {
                if let Err(e) = services.registry.record_failure(worker_id).await {
                    warn!(worker = worker_id, error = %e, "failure bookkeeping failed");
                }
            }
            task
        }
    };
    state.engine.metrics().submissions.inc();
    Ok(Json(task).into_response())
}

async fn list_models(State(state): State<AppState>) -> Response {
    let statuses = state.engine.services().models.statuses();
    Json(json!({ "models": statuses })).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let snapshot = health_snapshot(&state.engine).await;
    Json(snapshot).into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    let body = state.engine.metrics().render();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// One subconscious stream frame.
#[derive(Debug, Clone, Serialize)]
struct SubconsciousFrame {
    alpha_drift: f64,
    regime: String,
    is_dreaming: bool,
    pending_witness: usize,
}

async fn subconscious(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let engine = state.engine.clone();
    let stream = futures::stream::unfold(engine, |engine| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let arf = engine.arf_state().await;
        let frame = SubconsciousFrame {
            alpha_drift: arf.alpha_drift,
            regime: arf.regime,
            is_dreaming: engine.services().flags.is_dreaming(),
            pending_witness: engine.pending_witness_count(),
        };
        let event = Event::default()
            .json_data(&frame)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok(event), engine))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn witness(
    State(state): State<AppState>,
    Json(vote): Json<WitnessVote>,
) -> Result<Response, ApiError> {
    let collapsed = state.engine.witness(vote).await?;
    Ok(Json(json!({ "collapsed": collapsed, "status": "collapsed" })).into_response())
}
