//! End-to-end behaviour of the HTTP surface over an in-memory bundle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use sos_bus::MemoryBus;
use sos_capability::{encode_token, TokenIssuer, TokenVerifier};
use sos_engine::{router, Engine};
use sos_gateway::{
    ChunkStream, ModelAdapter, ModelRegistry, ModelRequest, ModelResponse, ProviderError,
    StreamChunk, TokenUsage,
};
use sos_registry::WorkerRegistry;
use sos_resilience::{BreakerConfig, BucketConfig, RateLimiter};
use sos_runtime::{ArtifactStore, RuntimeFlags, Services, SosConfig};
use sos_task_store::TaskStore;
use sos_types::{CapabilityAction, Subject};

struct StubAdapter;

#[async_trait]
impl ModelAdapter for StubAdapter {
    fn name(&self) -> &str {
        "stub"
    }
    fn model(&self) -> &str {
        "stub-model"
    }
    fn layer(&self) -> u8 {
        1
    }
    fn key_count(&self) -> usize {
        1
    }
    async fn generate(&self, request: &ModelRequest) -> Result<ModelResponse, ProviderError> {
        Ok(ModelResponse {
            content: format!("echo: {}", request.prompt()),
            usage: TokenUsage::default(),
            provider: "stub".into(),
            model: "stub-model".into(),
            duration_ms: 1,
        })
    }
    async fn generate_stream(&self, _request: &ModelRequest) -> Result<ChunkStream, ProviderError> {
        Ok(Box::pin(futures::stream::iter(vec![StreamChunk::Done {
            usage: None,
        }])))
    }
}

struct Harness {
    _dir: TempDir,
    engine: Arc<Engine>,
    issuer: TokenIssuer,
}

async fn harness(strict: bool, bucket: Option<BucketConfig>) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = SosConfig::for_home(dir.path().to_path_buf());
    config.strict_capabilities = strict;

    let issuer = TokenIssuer::generate(Subject::service("gatekeeper"));
    let verifier = Arc::new(TokenVerifier::new(issuer.verifying_key()));
    let services = Arc::new(Services {
        store: Arc::new(TaskStore::open(config.tasks_dir()).await.unwrap()),
        registry: Arc::new(
            WorkerRegistry::open(config.worker_registry_path())
                .await
                .unwrap(),
        ),
        bus: Arc::new(MemoryBus::default()),
        models: Arc::new(ModelRegistry::new(
            vec![Arc::new(StubAdapter)],
            BreakerConfig::default(),
        )),
        memory: None,
        issuer: Arc::new(TokenIssuer::generate(Subject::service("gatekeeper"))),
        verifier,
        limiter: Arc::new(RateLimiter::new(bucket.unwrap_or(BucketConfig {
            capacity: 1000.0,
            refill_rate: 1000.0,
            idle_timeout: Duration::from_secs(3600),
        }))),
        artifacts: Arc::new(ArtifactStore::open(config.artifacts_dir()).await.unwrap()),
        secrets: None,
        flags: Arc::new(RuntimeFlags::default()),
        config,
    });
    Harness {
        _dir: dir,
        engine: Engine::new(services),
        issuer,
    }
}

async fn call(engine: &Arc<Engine>, request: Request<Body>) -> (StatusCode, Value) {
    let response = router(engine.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn short_chat_answers_synchronously_with_omega() {
    let h = harness(false, None).await;
    let (status, body) = call(&h.engine, post_json("/chat", json!({"message": "hello"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "echo: hello");
    let omega = body["omega"].as_f64().unwrap();
    assert!(omega > 0.0 && omega <= 1.0);
    assert!(body["trace_id"].is_string());

    // No task was created.
    let (_, tasks) = call(&h.engine, get("/tasks")).await;
    assert_eq!(tasks["tasks"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn imperative_chat_spawns_a_pending_task() {
    let h = harness(false, None).await;
    let (status, body) = call(
        &h.engine,
        post_json(
            "/chat",
            json!({"message": "Build a Python script that lists files"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    let task_id = body["task_id"].as_str().unwrap().to_owned();

    let (status, task) = call(&h.engine, get(&format!("/tasks/{task_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["state"], "pending");
    assert_eq!(task["description"], "Build a Python script that lists files");
}

#[tokio::test]
async fn strict_mode_rejects_mismatched_action_with_reason() {
    let h = harness(true, None).await;
    let token = h
        .issuer
        .issue(
            Subject::agent("kasra"),
            CapabilityAction::MemoryRead,
            "engine:chat",
            BTreeMap::new(),
            chrono::Duration::minutes(5),
            None,
        )
        .unwrap();
    let (status, body) = call(
        &h.engine,
        post_json(
            "/chat",
            json!({"message": "hello", "capability": token}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "ActionMismatch");
}

#[tokio::test]
async fn strict_mode_requires_a_token_and_accepts_a_valid_one() {
    let h = harness(true, None).await;

    let (status, body) = call(&h.engine, post_json("/chat", json!({"message": "hello"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "MalformedToken");

    let token = h
        .issuer
        .issue(
            Subject::agent("kasra"),
            CapabilityAction::ToolExecute,
            "engine:chat",
            BTreeMap::new(),
            chrono::Duration::minutes(5),
            None,
        )
        .unwrap();
    let (status, body) = call(
        &h.engine,
        post_json("/chat", json!({"message": "hello", "capability": token})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "echo: hello");

    // Header transport works identically.
    let token = h
        .issuer
        .issue(
            Subject::agent("kasra"),
            CapabilityAction::LedgerRead,
            "engine:tasks",
            BTreeMap::new(),
            chrono::Duration::minutes(5),
            None,
        )
        .unwrap();
    let request = Request::builder()
        .uri("/tasks")
        .header("x-sos-capability", encode_token(&token).unwrap())
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&h.engine, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn lax_mode_logs_and_continues() {
    let h = harness(false, None).await;
    let (status, _) = call(&h.engine, get("/tasks")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn task_reads_are_pure_and_unknown_ids_404() {
    let h = harness(false, None).await;
    let (_, created) = call(
        &h.engine,
        post_json("/chat", json!({"message": "implement the widget"})),
    )
    .await;
    let task_id = created["task_id"].as_str().unwrap().to_owned();

    let (s1, first) = call(&h.engine, get(&format!("/tasks/{task_id}"))).await;
    let (s2, second) = call(&h.engine, get(&format!("/tasks/{task_id}"))).await;
    assert_eq!(s1, StatusCode::OK);
    assert_eq!(s2, StatusCode::OK);
    assert_eq!(first, second);

    let (status, _) = call(
        &h.engine,
        get("/tasks/00000000-0000-4000-8000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.engine, get("/tasks/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submit_completes_the_task_and_credits_the_worker() {
    let h = harness(false, None).await;
    let services = h.engine.services().clone();
    services.registry.register("w-1", "atlas").await.unwrap();

    let (_, created) = call(
        &h.engine,
        post_json("/chat", json!({"message": "refactor the scheduler"})),
    )
    .await;
    let task_id = created["task_id"].as_str().unwrap().to_owned();
    services
        .store
        .claim(task_id.parse().unwrap(), "w-1")
        .await
        .unwrap();

    let (status, task) = call(
        &h.engine,
        post_json(
            &format!("/tasks/{task_id}/submit"),
            json!({
                "output": "done, see diff",
                "model_used": "stub-model",
                "status": "success",
                "worker_id": "w-1",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["state"], "completed");
    assert!(task["result"]["output"].as_str().unwrap().contains("done"));

    let worker = services.registry.get("w-1").await.unwrap();
    assert_eq!(worker.tasks_completed, 1);

    // A second submit hits the state machine wall.
    let (status, _) = call(
        &h.engine,
        post_json(
            &format!("/tasks/{task_id}/submit"),
            json!({
                "output": "again",
                "model_used": "stub-model",
                "status": "success",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn failed_submission_rejects_and_records_failure() {
    let h = harness(false, None).await;
    let services = h.engine.services().clone();
    services.registry.register("w-2", "flaky").await.unwrap();

    let (_, created) = call(
        &h.engine,
        post_json("/chat", json!({"message": "deploy the service"})),
    )
    .await;
    let task_id = created["task_id"].as_str().unwrap().to_owned();
    services
        .store
        .claim(task_id.parse().unwrap(), "w-2")
        .await
        .unwrap();

    let (status, task) = call(
        &h.engine,
        post_json(
            &format!("/tasks/{task_id}/submit"),
            json!({
                "output": "could not finish",
                "model_used": "stub-model",
                "status": "failure",
                "worker_id": "w-2",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["state"], "rejected");
    assert_eq!(services.registry.get("w-2").await.unwrap().tasks_failed, 1);
}

#[tokio::test]
async fn models_health_and_metrics_respond() {
    let h = harness(false, None).await;

    let (status, models) = call(&h.engine, get("/models")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(models["models"][0]["name"], "stub");
    assert_eq!(models["models"][0]["breaker"], "closed");

    let (status, health) = call(&h.engine, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["service"], "sos-engine");
    assert_eq!(health["checks"]["database"], "ok");
    assert_eq!(health["checks"]["memory"], "not_configured");

    let response = router(h.engine.clone())
        .oneshot(get("/metrics"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("sos_http_requests_total"));
}

#[tokio::test]
async fn rate_limited_requests_get_retry_after() {
    let h = harness(
        false,
        Some(BucketConfig {
            capacity: 1.0,
            refill_rate: 0.1,
            idle_timeout: Duration::from_secs(3600),
        }),
    )
    .await;
    let app = router(h.engine.clone());

    let first = app.clone().oneshot(get("/tasks")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(get("/tasks")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn witness_collapses_pending_waves() {
    let h = harness(false, None).await;
    // A conversation-tagged chat opens a wave.
    let (_, _) = call(
        &h.engine,
        post_json(
            "/chat",
            json!({"message": "hello", "conversation_id": "conv-1"}),
        ),
    )
    .await;
    assert_eq!(h.engine.pending_witness_count(), 1);

    let (status, body) = call(
        &h.engine,
        post_json(
            "/witness",
            json!({"agent_id": "kasra", "conversation_id": "conv-1", "vote": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["collapsed"], 1);
    assert_eq!(h.engine.pending_witness_count(), 0);

    // Bad vote values are validation errors.
    let (status, _) = call(
        &h.engine,
        post_json(
            "/witness",
            json!({"agent_id": "kasra", "conversation_id": "conv-1", "vote": 0}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
