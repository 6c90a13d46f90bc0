//! JSON routes for generation jobs.
//!
//! Endpoints:
//! - `POST /generation-jobs`: create or reuse the active job
//! - `GET  /generation-jobs/{job_id}`: job snapshot
//! - `POST /generation-jobs/{job_id}/cancel`: request cooperative cancellation
//! - `POST /generation-jobs/{job_id}/input`: answer the agent's pending question
//! - `POST /generation-jobs/{job_id}/approval`: approve or reject plan generation
//! - `GET  /generation-jobs/{job_id}/events`: ordered job events after a cursor
//! - `GET|POST /internal/worker-cycle`: run one worker cycle (bearer token)
//!
//! The caller is identified by the trusted `x-user-id` header. Every error body is
//! `{"error": "..."}`.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, Request, State,
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

use gradplan_agent::{GenerationJobService, ServiceError, WorkerCycleRunner};
use gradplan_core::config::WorkerConfig;
use gradplan_core::domain::job::{JobId, UserId};
use gradplan_core::errors::InterfaceError;

const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct ApiState {
    service: Arc<GenerationJobService>,
    cycle: Arc<WorkerCycleRunner>,
    internal_token: Option<SecretString>,
}

impl ApiState {
    pub fn new(service: Arc<GenerationJobService>, worker: &WorkerConfig) -> Self {
        Self {
            cycle: Arc::new(WorkerCycleRunner::new(service.clone(), worker.clone())),
            internal_token: worker.internal_token.clone(),
            service,
        }
    }
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub conversation_id: String,
    #[serde(default)]
    pub input_payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub approved: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub after_id: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CycleQuery {
    pub limit: Option<u32>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "The requested generation job was not found.")
    }

    fn from_service(error: ServiceError) -> Self {
        let correlation_id = format!("req-{}", Uuid::new_v4().simple());
        let interface = error.into_interface(correlation_id);
        if matches!(
            interface,
            InterfaceError::ServiceUnavailable { .. } | InterfaceError::Internal { .. }
        ) {
            warn!(
                event_name = "api.request.failed",
                correlation_id = interface.correlation_id(),
                error = %interface,
                "request failed"
            );
        }
        Self::from(interface)
    }
}

impl From<InterfaceError> for ApiError {
    fn from(value: InterfaceError) -> Self {
        let user_message = value.user_message();
        match value {
            InterfaceError::BadRequest { message, .. } => Self::bad_request(message),
            InterfaceError::Conflict { message, .. } => Self::new(StatusCode::CONFLICT, message),
            InterfaceError::NotFound { .. } => Self::not_found(),
            InterfaceError::Unauthorized { .. } => Self::unauthorized(user_message),
            InterfaceError::ServiceUnavailable { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, user_message)
            }
            InterfaceError::Internal { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, user_message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    let internal = Router::new()
        .route("/internal/worker-cycle", get(worker_cycle).post(worker_cycle))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_internal_token));

    Router::new()
        .route("/generation-jobs", post(create_job))
        .route("/generation-jobs/{job_id}", get(get_job))
        .route("/generation-jobs/{job_id}/cancel", post(cancel_job))
        .route("/generation-jobs/{job_id}/input", post(submit_input))
        .route("/generation-jobs/{job_id}/approval", post(resolve_approval))
        .route("/generation-jobs/{job_id}/events", get(list_events))
        .merge(internal)
        .with_state(state)
}

fn caller(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| UserId(value.to_string()))
        .ok_or_else(|| ApiError::unauthorized("missing x-user-id header"))
}

async fn require_internal_token(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.internal_token.as_ref() else {
        return ApiError::unauthorized("internal endpoints are disabled: no token configured")
            .into_response();
    };

    let presented = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token_matches(token, expected) => next.run(request).await,
        Some(_) => ApiError::unauthorized("invalid internal token").into_response(),
        None => ApiError::unauthorized("missing or invalid Authorization header").into_response(),
    }
}

/// Compares in constant time so response timing does not leak how much of the token matched.
fn token_matches(presented: &str, expected: &SecretString) -> bool {
    presented.as_bytes().ct_eq(expected.expose_secret().as_bytes()).into()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn create_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let user_id = caller(&headers)?;
    let Json(body) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let input_payload = body.input_payload.unwrap_or_else(|| json!({}));

    let (job, reused) = state
        .service
        .create_or_reuse_job(&user_id.0, &body.conversation_id, input_payload)
        .await
        .map_err(ApiError::from_service)?;

    let status = if reused {
        StatusCode::OK
    } else {
        state.service.trigger_job(job.id.clone());
        StatusCode::ACCEPTED
    };
    info!(
        event_name = "api.generation_job.requested",
        job_id = %job.id,
        conversation_id = %job.conversation_id,
        reused,
        "generation job requested"
    );

    Ok((status, Json(json!({ "jobId": job.id, "reused": reused, "job": job })))
        .into_response())
}

async fn get_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = caller(&headers)?;
    let job = state
        .service
        .get_snapshot(&JobId(job_id), &user_id)
        .await
        .map_err(ApiError::from_service)?
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(job).into_response())
}

async fn cancel_job(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let user_id = caller(&headers)?;
    let job = state
        .service
        .request_cancel(&JobId(job_id), &user_id)
        .await
        .map_err(ApiError::from_service)?
        .ok_or_else(ApiError::not_found)?;

    // Jobs nobody is driving only observe the flag once a driver looks at them.
    if !job.status.is_terminal() {
        state.service.trigger_job(job.id.clone());
    }
    Ok(Json(job).into_response())
}

async fn submit_input(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    body: Result<Json<InputRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let user_id = caller(&headers)?;
    let Json(body) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let job = state
        .service
        .submit_input(&JobId(job_id), &user_id, &body.text)
        .await
        .map_err(ApiError::from_service)?;
    Ok(Json(job).into_response())
}

async fn resolve_approval(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    body: Result<Json<ApprovalRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let user_id = caller(&headers)?;
    let Json(body) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let job = state
        .service
        .resolve_approval(&JobId(job_id), &user_id, body.approved)
        .await
        .map_err(ApiError::from_service)?;
    Ok(Json(job).into_response())
}

async fn list_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let user_id = caller(&headers)?;
    let Query(query) = query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let events = state
        .service
        .list_events(&JobId(job_id), &user_id, query.after_id, query.limit)
        .await
        .map_err(ApiError::from_service)?;
    Ok(Json(json!({ "events": events })).into_response())
}

async fn worker_cycle(
    State(state): State<ApiState>,
    query: Result<Query<CycleQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let report = state.cycle.run_cycle(query.limit).await.map_err(ApiError::from_service)?;
    Ok(Json(report).into_response())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use secrecy::SecretString;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    use gradplan_agent::{
        GenerationJobService, ReasoningReply, RuntimeInit, ScriptedReasoningClient,
        ServiceDependencies, ServiceSettings, WorkerPool,
    };
    use gradplan_core::config::AppConfig;
    use gradplan_core::generation_engine::{GenerationEngine, GenerationEngineConfig};
    use gradplan_db::repositories::{
        InMemoryCatalogRepository, InMemoryConversationRepository, InMemoryJobRepository,
    };

    use super::{router, ApiState};

    const TOKEN: &str = "cycle-secret";

    struct TestApp {
        router: Router,
        service: Arc<GenerationJobService>,
        reasoning: Arc<ScriptedReasoningClient>,
    }

    fn app() -> TestApp {
        let reasoning = Arc::new(ScriptedReasoningClient::default());
        let service = GenerationJobService::new(
            ServiceDependencies {
                jobs: Arc::new(InMemoryJobRepository::default()),
                conversations: Arc::new(InMemoryConversationRepository::default()),
                catalog: Arc::new(InMemoryCatalogRepository::default()),
                reasoning: reasoning.clone(),
                runtime: Arc::new(RuntimeInit::default()),
            },
            GenerationEngine::with_config(GenerationEngineConfig {
                retry_base_delay_ms: 1,
                retry_max_delay_ms: 2,
                ..GenerationEngineConfig::default()
            }),
            ServiceSettings {
                reasoning_timeout: Duration::from_secs(1),
                tool_timeout: Duration::from_secs(1),
            },
            WorkerPool::new(2),
        )
        .expect("service");
        let service = Arc::new(service);

        let mut worker = AppConfig::default().worker;
        worker.internal_token = Some(TOKEN.to_string().into());
        let router = router(ApiState::new(service.clone(), &worker));
        TestApp { router, service, reasoning }
    }

    fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user-id", user);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }

    async fn create(app: &TestApp, conversation: &str) -> (StatusCode, Value) {
        let body = json!({"conversationId": conversation, "inputPayload": {"target_term": "2027"}});
        send(&app.router, request("POST", "/generation-jobs", Some("student-1"), Some(body)))
            .await
    }

    #[tokio::test]
    async fn create_returns_accepted_then_reuses_the_active_job() {
        let app = app();
        app.reasoning.push(ReasoningReply::Text("Which term?".to_string())).await;

        let (status, first) = create(&app, "conv-1").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(first["reused"], json!(false));
        assert_eq!(first["job"]["userId"], json!("student-1"));

        let (status, second) = create(&app, "conv-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["reused"], json!(true));
        assert_eq!(second["jobId"], first["jobId"]);

        app.service.pool().wait_idle().await;
    }

    #[tokio::test]
    async fn requests_without_caller_identity_are_unauthorized() {
        let app = app();
        let (status, body) = send(
            &app.router,
            request("POST", "/generation-jobs", None, Some(json!({"conversationId": "c"}))),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], json!("missing x-user-id header"));
    }

    #[tokio::test]
    async fn malformed_create_bodies_are_bad_requests() {
        let app = app();
        let (status, body) = send(
            &app.router,
            request(
                "POST",
                "/generation-jobs",
                Some("student-1"),
                Some(json!({"conversationId": "  "})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some_and(|message| message.contains("conversationId")));

        let (status, body) = send(
            &app.router,
            request("POST", "/generation-jobs", Some("student-1"), Some(json!({"wrong": 1}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn foreign_and_unknown_jobs_are_not_found() {
        let app = app();
        app.reasoning.push(ReasoningReply::Text("Which term?".to_string())).await;
        let (_, created) = create(&app, "conv-2").await;
        let job_id = created["jobId"].as_str().expect("job id").to_string();
        app.service.pool().wait_idle().await;

        let (status, body) = send(
            &app.router,
            request("GET", &format!("/generation-jobs/{job_id}"), Some("student-2"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], json!("The requested generation job was not found."));

        let (status, _) = send(
            &app.router,
            request("POST", "/generation-jobs/missing/cancel", Some("student-1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app.router,
            request("GET", &format!("/generation-jobs/{job_id}/events"), Some("student-2"), None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn input_flow_resumes_a_paused_job() {
        let app = app();
        app.reasoning.push(ReasoningReply::Text("Which term?".to_string())).await;
        let (_, created) = create(&app, "conv-3").await;
        let job_id = created["jobId"].as_str().expect("job id").to_string();
        app.service.pool().wait_idle().await;

        let (status, snapshot) = send(
            &app.router,
            request("GET", &format!("/generation-jobs/{job_id}"), Some("student-1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["status"], json!("awaiting_input"));
        assert_eq!(snapshot["currentStep"], json!("profile_check"));

        app.reasoning.push(ReasoningReply::Text("And which program?".to_string())).await;
        let (status, _) = send(
            &app.router,
            request(
                "POST",
                &format!("/generation-jobs/{job_id}/input"),
                Some("student-1"),
                Some(json!({"text": "Spring 2027"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        app.service.pool().wait_idle().await;

        let (_, snapshot) = send(
            &app.router,
            request("GET", &format!("/generation-jobs/{job_id}"), Some("student-1"), None),
        )
        .await;
        assert_eq!(snapshot["status"], json!("awaiting_input"));
        assert_eq!(snapshot["attempt"], json!(2));

        let (status, body) = send(
            &app.router,
            request(
                "POST",
                &format!("/generation-jobs/{job_id}/approval"),
                Some("student-1"),
                Some(json!({"approved": true})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("no approval is pending"));
    }

    #[tokio::test]
    async fn input_on_a_finished_job_conflicts() {
        let app = app();
        let (_, created) = create(&app, "conv-4").await;
        let job_id = created["jobId"].as_str().expect("job id").to_string();
        app.service.pool().wait_idle().await;

        let (status, body) = send(
            &app.router,
            request(
                "POST",
                &format!("/generation-jobs/{job_id}/input"),
                Some("student-1"),
                Some(json!({"text": "hello"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("job is failed, not awaiting input"));
    }

    #[tokio::test]
    async fn cancel_reaches_pending_job_and_events_are_listed() {
        let app = app();
        app.reasoning.push(ReasoningReply::Text("Which term?".to_string())).await;
        let (_, created) = create(&app, "conv-5").await;
        let job_id = created["jobId"].as_str().expect("job id").to_string();
        app.service.pool().wait_idle().await;

        let (status, snapshot) = send(
            &app.router,
            request("POST", &format!("/generation-jobs/{job_id}/cancel"), Some("student-1"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["cancelRequested"], json!(true));
        app.service.pool().wait_idle().await;

        let (status, body) = send(
            &app.router,
            request(
                "GET",
                &format!("/generation-jobs/{job_id}/events?limit=500"),
                Some("student-1"),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let kinds: Vec<&str> = body["events"]
            .as_array()
            .expect("events")
            .iter()
            .filter_map(|event| event["eventType"].as_str())
            .collect();
        assert_eq!(kinds.first(), Some(&"job_created"));
        assert_eq!(kinds.last(), Some(&"job_cancelled"));
        assert!(kinds.contains(&"cancel_requested"));
    }

    #[tokio::test]
    async fn worker_cycle_requires_the_internal_token() {
        let app = app();

        let (status, body) =
            send(&app.router, request("POST", "/internal/worker-cycle", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let wrong = Request::builder()
            .method("GET")
            .uri("/internal/worker-cycle")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .expect("request");
        let (status, _) = send(&app.router, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let authorized = Request::builder()
            .method("GET")
            .uri("/internal/worker-cycle?limit=5")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .expect("request");
        let (status, body) = send(&app.router, authorized).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"processed": 0, "recovered": 0}));
    }

    #[tokio::test]
    async fn near_miss_tokens_are_rejected() {
        let app = app();
        let near_misses =
            [format!("{TOKEN}x"), TOKEN[..TOKEN.len() - 1].to_string(), TOKEN.to_uppercase()];

        for token in near_misses {
            let request = Request::builder()
                .method("POST")
                .uri("/internal/worker-cycle")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .expect("request");
            let (status, body) = send(&app.router, request).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{token}");
            assert_eq!(body["error"], json!("invalid internal token"));
        }
    }

    #[test]
    fn token_comparison_requires_an_exact_match() {
        let expected = SecretString::from(TOKEN.to_string());
        assert!(super::token_matches(TOKEN, &expected));
        assert!(!super::token_matches("", &expected));
        assert!(!super::token_matches(&format!("{TOKEN} "), &expected));
    }
}
