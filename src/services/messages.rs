use std::time::Duration;
use strum::IntoStaticStr;

/// How one verification job ended, from the student's point of view.
///
/// Every job produces exactly one disposition and exactly one chat message.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Disposition {
    /// Attendance for this student and session was recorded earlier.
    AlreadyCompleted,
    /// Another submission for the same key matched and is being recorded.
    InProgress,
    Recorded {
        confidence: f64,
        batch: String,
        subject: String,
        elapsed: Duration,
    },
    RecordingFailed {
        batch: String,
    },
    RetryAllowed {
        reason: RetryReason,
        remaining: u32,
    },
    RetriesExhausted {
        reason: RetryReason,
    },
    ReferenceMissing {
        batch: String,
    },
    ProviderFailed,
    ProcessingError,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryReason {
    NoFace,
    NotMatched { confidence: f64 },
}

impl Disposition {
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    /// True when attendance is (now or already) recorded for the key.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Recorded { .. } | Self::AlreadyCompleted)
    }

    /// Chat text for this disposition.
    pub fn render(&self, student_id: &str, request_id: &str) -> String {
        let body = match self {
            Self::AlreadyCompleted => format!(
                "ℹ️ Attendance for {student_id} is already marked for this session. No further action needed."
            ),
            Self::InProgress => format!(
                "⏳ Another submission for {student_id} in this session matched and is being recorded, so this video was not used. If no \"Attendance marked\" message arrives, please submit again."
            ),
            Self::Recorded {
                confidence,
                batch,
                subject,
                elapsed,
            } => format!(
                "✅ Attendance marked!\n\nStudent: {student_id}\nBatch: {batch}\nSubject: {subject}\nConfidence: {}%\nTime: {:.2}s",
                *confidence as i64,
                elapsed.as_secs_f64()
            ),
            Self::RecordingFailed { batch } => format!(
                "⚠️ Your face was verified, but attendance for {student_id} ({batch}) could not be recorded. Please inform your teacher."
            ),
            Self::RetryAllowed { reason, remaining } => {
                let attempts = if *remaining == 1 { "attempt" } else { "attempts" };
                format!(
                    "❌ {}\n\nPlease record a new video note. {remaining} {attempts} remaining.",
                    reason.describe()
                )
            }
            Self::RetriesExhausted { reason } => format!(
                "❌ {}\n\nMaximum attempts reached for {student_id}. Please contact your teacher.",
                reason.describe()
            ),
            Self::ReferenceMissing { batch } => format!(
                "❌ No reference photo found for {student_id} in batch {batch}. Please contact your teacher to upload one."
            ),
            Self::ProviderFailed => {
                "❌ Face verification is temporarily unavailable. Please try again later.".to_string()
            }
            Self::ProcessingError => {
                "❌ Something went wrong while processing your video. Please try again later.".to_string()
            }
        };
        format!("{body}\n\nProcess ID: {request_id}")
    }
}

impl RetryReason {
    fn describe(&self) -> String {
        match self {
            Self::NoFace => "No face detected in your video.".to_string(),
            Self::NotMatched { confidence } => format!(
                "Face did not match the stored photo (confidence {}%).",
                *confidence as i64
            ),
        }
    }
}
