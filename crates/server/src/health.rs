use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use gradplan_agent::GenerationJobService;
use gradplan_db::DbPool;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    service: Arc<GenerationJobService>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub tool_catalog: HealthCheck,
    pub drivers_in_flight: usize,
    pub checked_at: String,
}

pub fn router(db_pool: DbPool, service: Arc<GenerationJobService>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState { db_pool, service })
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let tool_catalog = match state.service.runtime().catalog_check() {
        Some(check) => HealthCheck {
            status: "ready",
            detail: format!("{} tools verified at {}", check.tools.len(), check.checked_at),
        },
        None => HealthCheck { status: "degraded", detail: "tool catalog not verified".to_string() },
    };
    let ready = database.status == "ready" && tool_catalog.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        tool_catalog,
        drivers_in_flight: state.service.pool().in_flight(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM generation_job");
    match count.fetch_one(pool).await {
        Ok(jobs) => {
            HealthCheck { status: "ready", detail: format!("{jobs} generation jobs stored") }
        }
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}
