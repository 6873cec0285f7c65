use serde::Deserialize;
use std::time::Duration;

use crate::services::janitor::JanitorConfig;
use crate::services::pool::PoolConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Telegram bot token used for student replies
    pub student_bot_token: String,

    #[serde(default = "default_telegram_api_base")]
    pub telegram_api_base: String,

    /// Base URL of the external attendance API, e.g. "http://host:7002/api/v1"
    pub attendance_api_base_url: String,

    #[serde(default = "default_attendance_location")]
    pub attendance_location: String,

    /// Face comparison endpoint and bearer token
    pub face_api_url: String,
    pub face_api_token: String,

    /// ffmpeg binary used to pull a still frame out of each video
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Reference photo bucket (S3-compatible)
    pub s3_bucket: String,
    pub s3_endpoint: String,
    #[serde(default = "default_s3_region")]
    pub s3_region: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,

    /// AES-256-GCM key for stored teacher passwords (base64-encoded, 32 bytes)
    pub encryption_key: String,

    #[serde(default = "default_face_match_threshold")]
    pub face_match_threshold: f64,

    #[serde(default = "default_max_retries")]
    pub face_verification_max_retries: u32,

    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,

    #[serde(default = "default_min_workers")]
    pub queue_min_workers: usize,

    #[serde(default = "default_max_workers")]
    pub max_concurrent_face_verifications: usize,

    /// Seconds between pool resizes
    #[serde(default = "default_scale_cooldown")]
    pub queue_scale_cooldown: u64,

    #[serde(default = "default_submit_timeout_ms")]
    pub queue_submit_timeout_ms: u64,

    #[serde(default = "default_face_rate_limit")]
    pub face_rate_limit_per_second: usize,

    #[serde(default = "default_s3_rate_limit")]
    pub s3_rate_limit_per_second: usize,

    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,

    #[serde(default = "default_retry_ttl")]
    pub retry_ttl_secs: u64,

    #[serde(default = "default_completion_cap")]
    pub completion_ledger_cap: usize,

    #[serde(default = "default_shutdown_max_wait")]
    pub shutdown_max_wait_secs: u64,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Geofence radius around the session location
    #[serde(default = "default_distance_limit")]
    pub location_distance_limit_meters: f64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_attendance_location() -> String {
    "vijayawada".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_face_match_threshold() -> f64 {
    50.0
}

fn default_max_retries() -> u32 {
    1
}

fn default_queue_max_size() -> usize {
    1000
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    100
}

fn default_scale_cooldown() -> u64 {
    5
}

fn default_submit_timeout_ms() -> u64 {
    1000
}

fn default_face_rate_limit() -> usize {
    8
}

fn default_s3_rate_limit() -> usize {
    20
}

fn default_janitor_interval() -> u64 {
    300
}

fn default_retry_ttl() -> u64 {
    3600
}

fn default_completion_cap() -> usize {
    10_000
}

fn default_shutdown_max_wait() -> u64 {
    5
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_distance_limit() -> f64 {
    50.0
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject worker and queue bounds the pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_min_workers == 0 {
            return Err(ConfigError::Invalid(
                "QUEUE_MIN_WORKERS must be at least 1".into(),
            ));
        }
        if self.queue_min_workers > self.max_concurrent_face_verifications {
            return Err(ConfigError::Invalid(format!(
                "QUEUE_MIN_WORKERS ({}) exceeds MAX_CONCURRENT_FACE_VERIFICATIONS ({})",
                self.queue_min_workers, self.max_concurrent_face_verifications
            )));
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::Invalid("QUEUE_MAX_SIZE must be at least 1".into()));
        }
        if !(0.0..=100.0).contains(&self.face_match_threshold) {
            return Err(ConfigError::Invalid(
                "FACE_MATCH_THRESHOLD must be between 0 and 100".into(),
            ));
        }
        if self.face_rate_limit_per_second == 0 || self.s3_rate_limit_per_second == 0 {
            return Err(ConfigError::Invalid("rate limits must be at least 1/s".into()));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_workers: self.queue_min_workers,
            max_workers: self.max_concurrent_face_verifications,
            queue_capacity: self.queue_max_size,
            scale_cooldown: Duration::from_secs(self.queue_scale_cooldown),
            submit_timeout: Duration::from_millis(self.queue_submit_timeout_ms),
        }
    }

    pub fn janitor_config(&self) -> JanitorConfig {
        JanitorConfig {
            interval: Duration::from_secs(self.janitor_interval_secs.max(1)),
        }
    }

    pub fn retry_ttl(&self) -> Duration {
        Duration::from_secs(self.retry_ttl_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn shutdown_max_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_max_wait_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
