use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::pool::Lifecycle;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub queue: QueueHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub status: Lifecycle,
    pub queue_depth: usize,
}

/// GET /health: database ping plus verification pool state.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();

    let database = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => ComponentHealth {
            status: "ok",
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Health check database ping failed");
            ComponentHealth {
                status: "error",
                latency_ms: None,
            }
        }
    };

    let lifecycle = state.pool.lifecycle();
    let healthy = database.status == "ok" && lifecycle == Lifecycle::Running;
    let status_code = if healthy {
        StatusCode::OK
    } else {
        tracing::warn!(database = database.status, queue = %lifecycle, "Health check degraded");
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        checks: HealthChecks {
            database,
            queue: QueueHealth {
                status: lifecycle,
                queue_depth: state.pool.queue_depth(),
            },
        },
    };

    (status_code, Json(response))
}
