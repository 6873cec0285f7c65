use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::services::encryption::EncryptionError;

pub mod sessions;

pub use sessions::PgSessionStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored credentials could not be decrypted: {0}")]
    Credentials(#[from] EncryptionError),

    #[error("Stored roster is malformed: {0}")]
    Roster(#[from] serde_json::Error),
}
