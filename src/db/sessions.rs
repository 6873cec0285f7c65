use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::SessionStoreError;
use crate::models::job::{GeoPoint, RosterEntry, SessionSnapshot, TeacherCredentials};
use crate::services::collaborators::SessionStore;
use crate::services::encryption::EncryptionService;

/// Attendance sessions in Postgres. Teacher passwords are stored encrypted.
pub struct PgSessionStore {
    pool: PgPool,
    encryption: Arc<EncryptionService>,
}

impl PgSessionStore {
    pub fn new(pool: PgPool, encryption: Arc<EncryptionService>) -> Self {
        Self { pool, encryption }
    }

    /// Insert or replace the session for `session.otp`.
    pub async fn insert_session(&self, session: &SessionSnapshot) -> Result<(), SessionStoreError> {
        let (username, password) = match &session.credentials {
            Some(creds) => (
                Some(creds.username.as_str()),
                Some(self.encryption.encrypt_secret(&creds.password)?),
            ),
            None => (None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO attendance_sessions
                (otp, batch_name, subject, students, latitude, longitude,
                 teacher_username, teacher_password_enc, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (otp) DO UPDATE SET
                batch_name = EXCLUDED.batch_name,
                subject = EXCLUDED.subject,
                students = EXCLUDED.students,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                teacher_username = EXCLUDED.teacher_username,
                teacher_password_enc = EXCLUDED.teacher_password_enc,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&session.otp)
        .bind(&session.batch_name)
        .bind(&session.subject)
        .bind(Json(&session.students))
        .bind(session.location.lat)
        .bind(session.location.lng)
        .bind(username)
        .bind(password)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn find_session(&self, otp: &str) -> Result<Option<SessionSnapshot>, SessionStoreError> {
        let row = sqlx::query(
            r#"
            SELECT otp, batch_name, subject, students, latitude, longitude,
                   teacher_username, teacher_password_enc, created_at, expires_at
            FROM attendance_sessions
            WHERE otp = $1 AND expires_at > NOW()
            "#,
        )
        .bind(otp)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        let students: Json<HashMap<String, RosterEntry>> = r.try_get("students")?;
        let username: Option<String> = r.try_get("teacher_username")?;
        let password_enc: Option<String> = r.try_get("teacher_password_enc")?;

        let credentials = match (username, password_enc) {
            (Some(username), Some(sealed)) => Some(TeacherCredentials {
                username,
                password: self.encryption.decrypt_secret(&sealed)?,
            }),
            _ => None,
        };

        let created_at: DateTime<Utc> = r.try_get("created_at")?;
        let expires_at: DateTime<Utc> = r.try_get("expires_at")?;

        Ok(Some(SessionSnapshot {
            otp: r.try_get("otp")?,
            batch_name: r.try_get("batch_name")?,
            subject: r.try_get("subject")?,
            students: students.0,
            location: GeoPoint::new(r.try_get("latitude")?, r.try_get("longitude")?),
            credentials,
            created_at,
            expires_at,
        }))
    }

    async fn cleanup_expired(&self) -> Result<u64, SessionStoreError> {
        let result = sqlx::query("DELETE FROM attendance_sessions WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
