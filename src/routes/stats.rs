use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::models::stats::StatsSnapshot;

/// GET /api/v1/queue/stats
pub async fn queue_stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    let stats = state.pool.stats();
    metrics::gauge!("face_queue_depth").set(stats.queue_depth as f64);
    Json(stats)
}
