//! In-memory collaborators and builders for pool and janitor tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use face_attendance_queue::db::SessionStoreError;
use face_attendance_queue::models::job::{
    GeoPoint, RosterEntry, SessionSnapshot, TeacherCredentials, VerificationJob,
};
use face_attendance_queue::models::outcome::VerificationOutcome;
use face_attendance_queue::services::attendance::AttendanceError;
use face_attendance_queue::services::collaborators::{
    AttendanceRecorder, FaceComparisonClient, Notifier, SessionStore,
};
use face_attendance_queue::services::pool::{DynamicWorkerPool, PoolConfig};
use face_attendance_queue::services::processor::{Collaborators, JobProcessor, JobReport, Ledgers};
use face_attendance_queue::services::rate_limiter::RateLimiter;
use face_attendance_queue::services::telegram::NotifyError;

/// Open/closed latch that mocks wait on before answering.
#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn open() -> Self {
        let (tx, _) = watch::channel(true);
        Self { tx: Arc::new(tx) }
    }

    pub fn closed() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn release(&self) {
        self.tx.send_replace(true);
    }

    pub fn close(&self) {
        self.tx.send_replace(false);
    }

    pub async fn pass(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Face client answering from a script, then with a fallback outcome.
pub struct MockFace {
    script: Mutex<VecDeque<VerificationOutcome>>,
    fallback: VerificationOutcome,
    gate: Gate,
    delay: Duration,
    panic_on_call: bool,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockFace {
    pub fn always(outcome: VerificationOutcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: outcome,
            gate: Gate::open(),
            delay: Duration::ZERO,
            panic_on_call: false,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn scripted(outcomes: Vec<VerificationOutcome>, fallback: VerificationOutcome) -> Self {
        let face = Self::always(fallback);
        *face.script.lock().unwrap() = outcomes.into();
        face
    }

    pub fn panicking() -> Self {
        Self {
            panic_on_call: true,
            ..Self::always(VerificationOutcome::NoFaceDetected)
        }
    }

    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Comparisons currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most comparisons ever running at once since the last reset.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(self.in_flight(), Ordering::SeqCst);
    }
}

#[async_trait]
impl FaceComparisonClient for MockFace {
    async fn compare(&self, _student_id: &str, _batch: &str, _media: &[u8]) -> VerificationOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.gate.pass().await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.panic_on_call {
            panic!("face provider blew up");
        }
        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Attendance recorder that remembers every call.
pub struct MockRecorder {
    pub marked: Mutex<Vec<(String, String, String)>>,
    failures_left: AtomicUsize,
    delay: Duration,
}

impl MockRecorder {
    pub fn new() -> Self {
        Self {
            marked: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Reject the first `n` calls.
    pub fn failing_first(n: usize) -> Self {
        let recorder = Self::new();
        recorder.failures_left.store(n, Ordering::SeqCst);
        recorder
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.marked.lock().unwrap().len()
    }
}

#[async_trait]
impl AttendanceRecorder for MockRecorder {
    async fn mark_present(
        &self,
        student_id: &str,
        batch: &str,
        subject: &str,
        _credentials: Option<&TeacherCredentials>,
    ) -> Result<(), AttendanceError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.marked
            .lock()
            .unwrap()
            .push((student_id.to_string(), batch.to_string(), subject.to_string()));

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AttendanceError::Rejected {
                status: 500,
                body: "attendance API down".into(),
            });
        }
        Ok(())
    }
}

/// Notifier that collects messages; optionally fails every send.
pub struct MockNotifier {
    pub sent: Mutex<Vec<(i64, String)>>,
    fail: bool,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn messages(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        if self.fail {
            return Err(NotifyError::Api {
                description: "Forbidden: bot was blocked by the user".into(),
            });
        }
        Ok(())
    }
}

pub enum CleanupBehavior {
    Remove(u64),
    Fail,
    Panic,
}

/// Session store holding fixed sessions, whose cleanup step can succeed,
/// fail or panic.
pub struct MockSessionStore {
    behavior: CleanupBehavior,
    sessions: Mutex<HashMap<String, SessionSnapshot>>,
    pub cleanups: AtomicUsize,
}

impl MockSessionStore {
    pub fn new(behavior: CleanupBehavior) -> Self {
        Self {
            behavior,
            sessions: Mutex::new(HashMap::new()),
            cleanups: AtomicUsize::new(0),
        }
    }

    pub fn with_session(self, session: &SessionSnapshot) -> Self {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.otp.clone(), session.clone());
        self
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    async fn find_session(&self, otp: &str) -> Result<Option<SessionSnapshot>, SessionStoreError> {
        Ok(self.sessions.lock().unwrap().get(otp).cloned())
    }

    async fn cleanup_expired(&self) -> Result<u64, SessionStoreError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            CleanupBehavior::Remove(n) => Ok(n),
            CleanupBehavior::Fail => Err(SessionStoreError::Database(sqlx::Error::PoolTimedOut)),
            CleanupBehavior::Panic => panic!("session store unavailable"),
        }
    }
}

/// Live session with every listed student enrolled in `batch`.
pub fn session(otp: &str, batch: &str, students: &[&str]) -> Arc<SessionSnapshot> {
    let now = Utc::now();
    let roster = students
        .iter()
        .enumerate()
        .map(|(i, id)| {
            (
                id.to_string(),
                RosterEntry {
                    name: format!("Student {i}"),
                    batch: Some(batch.to_string()),
                },
            )
        })
        .collect::<HashMap<_, _>>();

    Arc::new(SessionSnapshot {
        otp: otp.to_string(),
        batch_name: batch.to_string(),
        subject: "Python".to_string(),
        students: roster,
        location: GeoPoint::new(16.5062, 80.6480),
        credentials: None,
        created_at: now,
        expires_at: now + ChronoDuration::seconds(150),
    })
}

pub fn job(request_id: &str, student_id: &str, session: &Arc<SessionSnapshot>) -> VerificationJob {
    VerificationJob::new(
        request_id,
        student_id,
        vec![0xAB; 64],
        session.clone(),
        1000,
    )
}

pub struct Harness {
    pub pool: Arc<DynamicWorkerPool>,
    pub reports: mpsc::UnboundedReceiver<JobReport>,
    pub ledgers: Ledgers,
}

impl Harness {
    /// Next finished job, failing the test after five seconds.
    pub async fn next_report(&mut self) -> JobReport {
        tokio::time::timeout(Duration::from_secs(5), self.reports.recv())
            .await
            .expect("timed out waiting for a job report")
            .expect("report channel closed")
    }

    pub async fn submit_and_wait(&mut self, job: VerificationJob) -> JobReport {
        assert!(self.pool.submit(job).await, "submission rejected");
        self.next_report().await
    }
}

pub fn pool_config(min_workers: usize, max_workers: usize, queue_capacity: usize) -> PoolConfig {
    PoolConfig {
        min_workers,
        max_workers,
        queue_capacity,
        scale_cooldown: Duration::from_secs(60),
        submit_timeout: Duration::from_millis(100),
    }
}

pub fn start_pool(
    config: PoolConfig,
    face: Arc<MockFace>,
    recorder: Arc<MockRecorder>,
    notifier: Arc<MockNotifier>,
    max_retries: u32,
) -> Harness {
    let ledgers = Ledgers::new(Duration::from_secs(3600), 10_000);
    let processor = JobProcessor::new(
        Collaborators {
            face,
            recorder,
            notifier,
        },
        ledgers.clone(),
        Arc::new(RateLimiter::per_second(1000)),
        max_retries,
    );
    let (tx, rx) = mpsc::unbounded_channel();
    Harness {
        pool: Arc::new(DynamicWorkerPool::start_with_reports(config, processor, tx)),
        reports: rx,
        ledgers,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached within five seconds");
}
