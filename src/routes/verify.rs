use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use garde::Validate;
use std::sync::Arc;

use crate::app_state::AppState;
use crate::db::SessionStoreError;
use crate::models::job::{new_request_id, GeoPoint, SessionSnapshot, VerificationJob};
use crate::models::verification::{SubmitRequest, SubmitResponse};

/// Reasons a submission is turned away before it reaches the queue.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Malformed submission: {0}")]
    Malformed(String),

    #[error("Invalid submission: {0}")]
    Invalid(String),

    #[error("Session not found or expired")]
    SessionNotFound,

    #[error("Student {0} is not enrolled in this session")]
    NotEnrolled(String),

    #[error("Too far from the classroom ({distance_m:.0} m, limit {limit_m:.0} m)")]
    OutOfRange { distance_m: f64, limit_m: f64 },

    #[error("Verification queue is full, please try again")]
    QueueFull,

    #[error("Session lookup failed")]
    Store(#[from] SessionStoreError),
}

impl SubmitError {
    fn status(&self) -> StatusCode {
        match self {
            SubmitError::Malformed(_) => StatusCode::BAD_REQUEST,
            SubmitError::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SubmitError::SessionNotFound => StatusCode::NOT_FOUND,
            SubmitError::NotEnrolled(_) | SubmitError::OutOfRange { .. } => StatusCode::FORBIDDEN,
            SubmitError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        if let SubmitError::Store(e) = &self {
            tracing::error!(error = %e, "Session lookup failed");
        }
        let body = serde_json::json!({
            "success": false,
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}

/// POST /api/v1/verify: queue a face video for attendance verification.
pub async fn submit_verification(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), SubmitError> {
    let (request, video) = read_submission(multipart).await?;
    request
        .validate()
        .map_err(|report| SubmitError::Invalid(report.to_string()))?;

    let session = state
        .sessions
        .find_session(&request.otp)
        .await?
        .ok_or(SubmitError::SessionNotFound)?;

    check_admission(
        &session,
        &request.student_id,
        GeoPoint::new(request.latitude, request.longitude),
        state.geofence_meters,
        Utc::now(),
    )?;

    let request_id = new_request_id();
    let job = VerificationJob::new(
        request_id.clone(),
        request.student_id.clone(),
        video,
        Arc::new(session),
        request.chat_user_id,
    );

    if !state.pool.submit(job).await {
        return Err(SubmitError::QueueFull);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            request_id,
            status: "queued".to_string(),
            message: "Face verification queued, the result will be sent to your chat".to_string(),
        }),
    ))
}

async fn read_submission(mut multipart: Multipart) -> Result<(SubmitRequest, Vec<u8>), SubmitError> {
    let mut request = SubmitRequest::default();
    let mut video: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SubmitError::Malformed(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "video" {
            let data = field
                .bytes()
                .await
                .map_err(|e| SubmitError::Malformed(e.to_string()))?;
            video = Some(data.to_vec());
            continue;
        }

        let text = field
            .text()
            .await
            .map_err(|e| SubmitError::Malformed(e.to_string()))?;
        let text = text.trim();
        match name.as_str() {
            "student_id" => request.student_id = text.to_string(),
            "otp" => request.otp = text.to_string(),
            "chat_user_id" => request.chat_user_id = parse_field(&name, text)?,
            "latitude" => request.latitude = parse_coordinate(&name, text)?,
            "longitude" => request.longitude = parse_coordinate(&name, text)?,
            _ => {}
        }
    }

    let video = video
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SubmitError::Malformed("missing video".into()))?;
    Ok((request, video))
}

fn parse_field<T: std::str::FromStr>(name: &str, text: &str) -> Result<T, SubmitError> {
    text.parse()
        .map_err(|_| SubmitError::Malformed(format!("{name} is not a valid number")))
}

fn parse_coordinate(name: &str, text: &str) -> Result<f64, SubmitError> {
    let value: f64 = parse_field(name, text)?;
    if !value.is_finite() {
        return Err(SubmitError::Malformed(format!("{name} must be a finite number")));
    }
    Ok(value)
}

/// Session, roster and geofence checks a submission must pass.
pub fn check_admission(
    session: &SessionSnapshot,
    student_id: &str,
    location: GeoPoint,
    limit_m: f64,
    now: DateTime<Utc>,
) -> Result<(), SubmitError> {
    if session.is_expired(now) {
        return Err(SubmitError::SessionNotFound);
    }
    if session.roster_entry(student_id).is_none() {
        return Err(SubmitError::NotEnrolled(student_id.to_string()));
    }

    let distance_m = session.location.distance_meters(&location);
    let within = distance_m.is_finite() && distance_m <= limit_m;
    if !within {
        return Err(SubmitError::OutOfRange {
            distance_m,
            limit_m,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::RosterEntry;
    use chrono::Duration;
    use std::collections::HashMap;

    fn session() -> SessionSnapshot {
        let now = Utc::now();
        SessionSnapshot {
            otp: "123456".into(),
            batch_name: "B1".into(),
            subject: "Python".into(),
            students: HashMap::from([(
                "S1".to_string(),
                RosterEntry {
                    name: "Asha".into(),
                    batch: Some("B1".into()),
                },
            )]),
            location: GeoPoint::new(16.5062, 80.6480),
            credentials: None,
            created_at: now,
            expires_at: now + Duration::seconds(150),
        }
    }

    #[test]
    fn test_admits_enrolled_student_nearby() {
        let s = session();
        let here = GeoPoint::new(16.5063, 80.6480);
        assert!(check_admission(&s, "S1", here, 50.0, Utc::now()).is_ok());
    }

    #[test]
    fn test_rejects_unknown_student() {
        let s = session();
        let err = check_admission(&s, "S9", s.location, 50.0, Utc::now()).unwrap_err();
        assert!(matches!(err, SubmitError::NotEnrolled(_)));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_rejects_outside_geofence() {
        let s = session();
        let far = GeoPoint::new(16.5162, 80.6480);
        let err = check_admission(&s, "S1", far, 50.0, Utc::now()).unwrap_err();
        assert!(matches!(err, SubmitError::OutOfRange { .. }));
    }

    #[test]
    fn test_non_finite_location_is_never_admitted() {
        let s = session();
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let lat = check_admission(&s, "S1", GeoPoint::new(bad, 80.6480), 50.0, Utc::now());
            assert!(matches!(lat, Err(SubmitError::OutOfRange { .. })), "latitude {bad}");
            let lon = check_admission(&s, "S1", GeoPoint::new(16.5062, bad), 50.0, Utc::now());
            assert!(matches!(lon, Err(SubmitError::OutOfRange { .. })), "longitude {bad}");
        }
    }

    #[test]
    fn test_non_finite_coordinate_fields_are_malformed() {
        for text in ["NaN", "nan", "inf", "-inf", "infinity"] {
            let err = parse_coordinate("latitude", text).unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{text}");
        }
        assert_eq!(parse_coordinate("latitude", "16.5062").unwrap(), 16.5062);
    }

    #[test]
    fn test_expired_session_is_not_found() {
        let s = session();
        let later = s.expires_at + Duration::seconds(1);
        let err = check_admission(&s, "S1", s.location, 50.0, later).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_queue_full_maps_to_503() {
        assert_eq!(SubmitError::QueueFull.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
