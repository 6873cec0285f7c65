//! Seams between the verification queue and the services it calls out to.
//!
//! The queue only ever sees these traits; the HTTP, S3 and Postgres
//! implementations live in their own modules and tests substitute mocks.

use async_trait::async_trait;

use crate::db::SessionStoreError;
use crate::models::job::{SessionSnapshot, TeacherCredentials};
use crate::models::outcome::VerificationOutcome;
use crate::services::attendance::AttendanceError;
use crate::services::telegram::NotifyError;

/// Remote face similarity service.
#[async_trait]
pub trait FaceComparisonClient: Send + Sync {
    /// Compare `media` against the stored reference photo of `student_id`.
    /// `batch` may list several comma-separated batches to search.
    ///
    /// Failures are reported as [`VerificationOutcome::ProviderError`].
    async fn compare(&self, student_id: &str, batch: &str, media: &[u8]) -> VerificationOutcome;
}

/// External attendance API.
#[async_trait]
pub trait AttendanceRecorder: Send + Sync {
    async fn mark_present(
        &self,
        student_id: &str,
        batch: &str,
        subject: &str,
        credentials: Option<&TeacherCredentials>,
    ) -> Result<(), AttendanceError>;
}

/// Best-effort chat delivery to a student.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError>;
}

/// Teacher-created sessions (OTP, roster, geofence, credentials).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Live session for `otp`, or `None` if unknown or expired.
    async fn find_session(&self, otp: &str) -> Result<Option<SessionSnapshot>, SessionStoreError>;

    /// Delete expired sessions, returning how many were removed.
    async fn cleanup_expired(&self) -> Result<u64, SessionStoreError>;
}
