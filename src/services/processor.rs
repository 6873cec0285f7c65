use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::models::job::{LedgerKey, SessionSnapshot, VerificationJob};
use crate::models::outcome::VerificationOutcome;
use crate::services::collaborators::{AttendanceRecorder, FaceComparisonClient, Notifier};
use crate::services::ledger::{Claim, CompletionLedger, RetryLedger};
use crate::services::messages::{Disposition, RetryReason};
use crate::services::rate_limiter::RateLimiter;

/// Remote services a job talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub face: Arc<dyn FaceComparisonClient>,
    pub recorder: Arc<dyn AttendanceRecorder>,
    pub notifier: Arc<dyn Notifier>,
}

/// Retry and completion ledgers, shared with the janitor and stats.
#[derive(Clone)]
pub struct Ledgers {
    pub retries: Arc<RetryLedger>,
    pub completions: Arc<CompletionLedger>,
}

impl Ledgers {
    pub fn new(retry_ttl: Duration, completion_cap: usize) -> Self {
        Self {
            retries: Arc::new(RetryLedger::new(retry_ttl)),
            completions: Arc::new(CompletionLedger::new(completion_cap)),
        }
    }
}

/// What happened to one job, for callers that want a result channel.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub request_id: String,
    pub key: LedgerKey,
    pub disposition: Disposition,
    pub elapsed: Duration,
}

/// Runs one verification job end to end: completion check, comparison,
/// retry or record decision, notification.
pub struct JobProcessor {
    collaborators: Collaborators,
    ledgers: Ledgers,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
}

impl JobProcessor {
    pub fn new(
        collaborators: Collaborators,
        ledgers: Ledgers,
        limiter: Arc<RateLimiter>,
        max_retries: u32,
    ) -> Self {
        Self {
            collaborators,
            ledgers,
            limiter,
            max_retries,
        }
    }

    pub fn ledgers(&self) -> &Ledgers {
        &self.ledgers
    }

    /// Process `job` and send the student exactly one message about it.
    ///
    /// Never fails: a panic while processing is contained here and reported
    /// as [`Disposition::ProcessingError`].
    pub async fn run(&self, job: VerificationJob) -> JobReport {
        let started = Instant::now();
        let request_id = job.request_id.clone();
        let student_id = job.student_id.clone();
        let chat_user_id = job.chat_user_id;
        let key = job.key();

        let disposition = match AssertUnwindSafe(self.process(job, started))
            .catch_unwind()
            .await
        {
            Ok(disposition) => disposition,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    request_id = %request_id,
                    student_id = %student_id,
                    panic = %reason,
                    "Verification job panicked"
                );
                Disposition::ProcessingError
            }
        };

        self.notify(chat_user_id, &student_id, &request_id, &disposition)
            .await;

        let elapsed = started.elapsed();
        metrics::histogram!("face_job_duration_seconds").record(elapsed.as_secs_f64());
        metrics::counter!("face_jobs_processed_total", "disposition" => disposition.kind())
            .increment(1);

        info!(
            request_id = %request_id,
            student_id = %student_id,
            disposition = disposition.kind(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Verification job finished"
        );

        JobReport {
            request_id,
            key,
            disposition,
            elapsed,
        }
    }

    async fn process(&self, mut job: VerificationJob, started: Instant) -> Disposition {
        let key = job.key();

        if self.ledgers.completions.is_completed(&key) {
            info!(request_id = %job.request_id, key = %key, "Attendance already marked, skipping comparison");
            return Disposition::AlreadyCompleted;
        }

        self.limiter.until_ready().await;

        let payload = std::mem::take(&mut job.payload);
        let compare_start = Instant::now();
        let outcome = self
            .collaborators
            .face
            .compare(&job.student_id, &job.batch_name, &payload)
            .await;
        drop(payload);

        debug!(
            request_id = %job.request_id,
            outcome = outcome.kind(),
            compare_ms = compare_start.elapsed().as_millis() as u64,
            "Face comparison returned"
        );

        match outcome {
            VerificationOutcome::Matched {
                confidence,
                found_in_batch,
            } => {
                self.record(&job, &key, confidence, found_in_batch.as_deref(), started)
                    .await
            }
            VerificationOutcome::NotMatched { confidence } => {
                self.consume_retry(&job, &key, RetryReason::NotMatched { confidence })
            }
            VerificationOutcome::NoFaceDetected => {
                self.consume_retry(&job, &key, RetryReason::NoFace)
            }
            VerificationOutcome::ReferenceImageMissing => {
                let batch = reference_batch(&job.session, &job.student_id);
                warn!(
                    request_id = %job.request_id,
                    student_id = %job.student_id,
                    batch = %batch,
                    "No reference photo for student"
                );
                Disposition::ReferenceMissing { batch }
            }
            VerificationOutcome::ProviderError { message } => {
                error!(
                    request_id = %job.request_id,
                    student_id = %job.student_id,
                    error = %message,
                    "Face comparison provider failed"
                );
                Disposition::ProviderFailed
            }
        }
    }

    async fn record(
        &self,
        job: &VerificationJob,
        key: &LedgerKey,
        confidence: f64,
        found_in_batch: Option<&str>,
        started: Instant,
    ) -> Disposition {
        // Only the reservation holder may call the recorder for this key.
        let reservation = match self.ledgers.completions.try_reserve(key) {
            Claim::Reserved(reservation) => reservation,
            Claim::AlreadyCompleted => return Disposition::AlreadyCompleted,
            Claim::InProgress => {
                info!(request_id = %job.request_id, key = %key, "Concurrent match already recording");
                return Disposition::InProgress;
            }
        };

        let batch = resolve_batch(&job.session, &job.student_id, found_in_batch);
        let subject = job.session.subject.clone();

        info!(
            request_id = %job.request_id,
            student_id = %job.student_id,
            batch = %batch,
            subject = %subject,
            confidence,
            "Face matched, recording attendance"
        );

        let result = self
            .collaborators
            .recorder
            .mark_present(&job.student_id, &batch, &subject, job.credentials.as_ref())
            .await;

        match result {
            Ok(()) => {
                reservation.commit();
                self.ledgers.retries.clear(key);
                Disposition::Recorded {
                    confidence,
                    batch,
                    subject,
                    elapsed: started.elapsed(),
                }
            }
            Err(e) => {
                error!(
                    request_id = %job.request_id,
                    student_id = %job.student_id,
                    batch = %batch,
                    error = %e,
                    "Attendance recording failed"
                );
                drop(reservation);
                Disposition::RecordingFailed { batch }
            }
        }
    }

    fn consume_retry(
        &self,
        job: &VerificationJob,
        key: &LedgerKey,
        reason: RetryReason,
    ) -> Disposition {
        let used = self.ledgers.retries.get_and_increment(key);

        if used < self.max_retries {
            let remaining = self.max_retries - used;
            info!(
                request_id = %job.request_id,
                key = %key,
                attempts_used = used + 1,
                remaining,
                "Verification failed, resubmission allowed"
            );
            Disposition::RetryAllowed { reason, remaining }
        } else {
            warn!(
                request_id = %job.request_id,
                key = %key,
                max_retries = self.max_retries,
                "Verification failed, retries exhausted"
            );
            Disposition::RetriesExhausted { reason }
        }
    }

    async fn notify(
        &self,
        chat_user_id: i64,
        student_id: &str,
        request_id: &str,
        disposition: &Disposition,
    ) {
        let text = disposition.render(student_id, request_id);
        if let Err(e) = self.collaborators.notifier.send(chat_user_id, &text).await {
            warn!(
                request_id = %request_id,
                chat_user_id,
                error = %e,
                "Failed to deliver notification"
            );
        }
    }
}

fn single_batch(batch: Option<&str>) -> Option<&str> {
    batch
        .map(str::trim)
        .filter(|b| !b.is_empty() && !b.contains(','))
}

/// Batch to record attendance under.
///
/// Prefers the roster's per-student batch. When that is missing or lists
/// combined batches, falls back to the batch the comparison matched in, and
/// finally to the first batch of the session.
pub fn resolve_batch(session: &SessionSnapshot, student_id: &str, found_in_batch: Option<&str>) -> String {
    let roster_batch = session
        .roster_entry(student_id)
        .and_then(|entry| entry.batch.as_deref());

    single_batch(roster_batch)
        .or_else(|| found_in_batch.map(str::trim).filter(|b| !b.is_empty()))
        .unwrap_or_else(|| session.first_batch())
        .to_string()
}

/// Batch to name when a student's reference photo is missing.
fn reference_batch(session: &SessionSnapshot, student_id: &str) -> String {
    let batch = session
        .roster_entry(student_id)
        .and_then(|entry| entry.batch.as_deref())
        .filter(|b| !b.trim().is_empty())
        .unwrap_or(session.batch_name.as_str());
    batch.split(',').next().unwrap_or("").trim().to_string()
}
