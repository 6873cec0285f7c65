use async_trait::async_trait;
use chrono::Local;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::models::job::TeacherCredentials;
use crate::services::collaborators::AttendanceRecorder;

/// Client for the external attendance API.
///
/// Marking a student present rewrites the whole day's sheet for a
/// batch/subject: the first mark of the day creates it with POST, later
/// marks PUT it back with earlier presents preserved.
pub struct AttendanceApiClient {
    http: Client,
    base_url: String,
    location: String,
}

#[derive(Debug, Deserialize)]
struct RosterResponse {
    #[serde(default)]
    students_data: Vec<RosterStudent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RosterStudent {
    student_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceSheet<'a> {
    subject: &'a str,
    batch: &'a str,
    datetime: String,
    location: &'a str,
    user_type: &'static str,
    students: Vec<StudentStatus>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct StudentStatus {
    student_id: String,
    status: u8,
}

impl AttendanceApiClient {
    pub fn new(base_url: &str, location: String, timeout: Duration) -> Result<Self, AttendanceError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            location,
        })
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        credentials: Option<&TeacherCredentials>,
    ) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{path}", self.base_url));
        match credentials {
            Some(creds) => builder.basic_auth(&creds.username, Some(&creds.password)),
            None => builder,
        }
    }

    /// Student ids enrolled in `batch` for `subject`.
    async fn roster(
        &self,
        batch: &str,
        subject: &str,
        credentials: Option<&TeacherCredentials>,
    ) -> Result<Vec<String>, AttendanceError> {
        let response = self
            .request(Method::POST, "/attend", credentials)
            .json(&serde_json::json!({
                "batches": batch,
                "subject": subject,
                "location": self.location,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejected(status.as_u16(), response.text().await.unwrap_or_default()));
        }

        let body: RosterResponse = response.json().await?;
        Ok(body
            .students_data
            .into_iter()
            .filter_map(|s| s.student_id)
            .collect())
    }

    /// Today's statuses for `batch`/`subject`, or `None` if no sheet exists yet.
    async fn existing_sheet(
        &self,
        batch: &str,
        subject: &str,
        date: &str,
        credentials: Option<&TeacherCredentials>,
    ) -> Result<Option<HashMap<String, i64>>, AttendanceError> {
        let response = self
            .request(Method::GET, "/getattends", credentials)
            .query(&[
                ("location", self.location.as_str()),
                ("subject", subject),
                ("batch", batch),
                ("userType", "Mentor"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::warn!(
                batch,
                subject,
                status = response.status().as_u16(),
                "Attendance lookup failed, treating sheet as new"
            );
            return Ok(None);
        }

        let body: Value = response.json().await?;
        Ok(parse_existing(&body, date, subject))
    }
}

#[async_trait]
impl AttendanceRecorder for AttendanceApiClient {
    async fn mark_present(
        &self,
        student_id: &str,
        batch: &str,
        subject: &str,
        credentials: Option<&TeacherCredentials>,
    ) -> Result<(), AttendanceError> {
        let roster = self.roster(batch, subject, credentials).await?;
        if roster.is_empty() {
            return Err(AttendanceError::EmptyRoster {
                batch: batch.to_string(),
                subject: subject.to_string(),
            });
        }

        let date = Local::now().format("%Y-%m-%d").to_string();
        let existing = self.existing_sheet(batch, subject, &date, credentials).await?;
        let method = if existing.is_some() { Method::PUT } else { Method::POST };
        let students = build_statuses(&roster, student_id, existing.as_ref());

        let sheet = AttendanceSheet {
            subject,
            batch,
            datetime: date,
            location: &self.location,
            user_type: "Mentor",
            students,
        };

        let response = self
            .request(method.clone(), "/attendance", credentials)
            .json(&sheet)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejected(status.as_u16(), response.text().await.unwrap_or_default()));
        }

        tracing::info!(student_id, batch, subject, method = %method, "Attendance sheet saved");
        Ok(())
    }
}

fn rejected(status: u16, body: String) -> AttendanceError {
    AttendanceError::Rejected {
        status,
        body: body.chars().take(200).collect(),
    }
}

/// Find the statuses recorded for `subject` on `date`.
///
/// The API nests day records under `data[]`, either as
/// `{"dates": {date: {subject: {...}}}}` or directly as `{date: {subject: {...}}}`.
fn parse_existing(body: &Value, date: &str, subject: &str) -> Option<HashMap<String, i64>> {
    let days = body.get("data")?.as_array()?;

    days.iter().find_map(|item| {
        let subjects = item
            .get("dates")
            .and_then(|dates| dates.get(date))
            .or_else(|| item.get(date))?;
        let record = subjects.get(subject)?;

        let statuses = record
            .get("students")
            .and_then(Value::as_array)
            .map(|students| {
                students
                    .iter()
                    .filter_map(|s| {
                        let id = s.get("studentId")?.as_str()?.to_string();
                        let status = s.get("status").and_then(Value::as_i64).unwrap_or(0);
                        Some((id, status))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(statuses)
    })
}

/// Everyone on the roster, present if they are `student_id` or were
/// already marked present today.
fn build_statuses(
    roster: &[String],
    student_id: &str,
    existing: Option<&HashMap<String, i64>>,
) -> Vec<StudentStatus> {
    roster
        .iter()
        .map(|sid| {
            let already = existing
                .and_then(|e| e.get(sid))
                .is_some_and(|status| *status == 1);
            StudentStatus {
                student_id: sid.clone(),
                status: u8::from(sid == student_id || already),
            }
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum AttendanceError {
    #[error("Attendance API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Attendance API rejected request with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("No students enrolled in {batch}/{subject}")]
    EmptyRoster { batch: String, subject: String },
}
