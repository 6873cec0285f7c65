use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Mean Earth radius used by the geofence check, in meters.
const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Identity of one attendance attempt: a student inside one OTP session.
///
/// Retry and completion bookkeeping is keyed on this pair. It is a proper
/// composite key, so ids containing separators cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LedgerKey {
    pub student_id: String,
    pub otp: String,
}

impl LedgerKey {
    pub fn new(student_id: impl Into<String>, otp: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            otp: otp.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.student_id, self.otp)
    }
}

/// Classroom location captured when the teacher opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle (haversine) distance to `other`, in meters.
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let dlat = lat2 - lat1;
        let dlng = (other.lng - self.lng).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
    }
}

/// One roster line: who the student is and which batch they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    /// Batch as reported by the attendance API. May be missing, or a
    /// comma-separated list when the student sits in combined batches.
    #[serde(default, rename = "BatchNo")]
    pub batch: Option<String>,
}

/// Credentials the teacher registered for the downstream attendance API.
#[derive(Clone, PartialEq)]
pub struct TeacherCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for TeacherCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeacherCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Immutable snapshot of a teacher-created session, taken at submission time.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub otp: String,
    /// Session batch list as entered by the teacher, e.g. `"B1"` or `"B1, B2"`.
    pub batch_name: String,
    pub subject: String,
    pub students: HashMap<String, RosterEntry>,
    pub location: GeoPoint,
    pub credentials: Option<TeacherCredentials>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn roster_entry(&self, student_id: &str) -> Option<&RosterEntry> {
        self.students.get(student_id)
    }

    /// First batch of the session's batch list.
    pub fn first_batch(&self) -> &str {
        self.batch_name.split(',').next().unwrap_or("").trim()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// One student's submitted face-video attendance attempt.
pub struct VerificationJob {
    pub request_id: String,
    pub student_id: String,
    /// Raw video/image bytes, owned by the job until the worker consumes it.
    pub payload: Vec<u8>,
    pub batch_name: String,
    pub session: Arc<SessionSnapshot>,
    pub chat_user_id: i64,
    pub submitted_at: DateTime<Utc>,
    pub credentials: Option<TeacherCredentials>,
}

impl VerificationJob {
    /// Build a job from a session snapshot. Batch and credentials default to
    /// the session's own values.
    pub fn new(
        request_id: impl Into<String>,
        student_id: impl Into<String>,
        payload: Vec<u8>,
        session: Arc<SessionSnapshot>,
        chat_user_id: i64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            student_id: student_id.into(),
            payload,
            batch_name: session.batch_name.clone(),
            credentials: session.credentials.clone(),
            session,
            chat_user_id,
            submitted_at: Utc::now(),
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(&self.student_id, &self.session.otp)
    }
}

impl fmt::Debug for VerificationJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationJob")
            .field("request_id", &self.request_id)
            .field("student_id", &self.student_id)
            .field("payload_len", &self.payload.len())
            .field("batch_name", &self.batch_name)
            .field("otp", &self.session.otp)
            .field("chat_user_id", &self.chat_user_id)
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

/// Short correlation id shown to students, e.g. `"3f9a1c0e"`.
pub fn new_request_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
