use sqlx::PgPool;
use std::sync::Arc;

use crate::services::collaborators::SessionStore;
use crate::services::pool::DynamicWorkerPool;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub sessions: Arc<dyn SessionStore>,
    pub pool: Arc<DynamicWorkerPool>,
    /// Maximum distance between student and classroom, in meters.
    pub geofence_meters: f64,
}

impl AppState {
    pub fn new(
        db: PgPool,
        sessions: Arc<dyn SessionStore>,
        pool: Arc<DynamicWorkerPool>,
        geofence_meters: f64,
    ) -> Self {
        Self {
            db,
            sessions,
            pool,
            geofence_meters,
        }
    }
}
