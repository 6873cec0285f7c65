//! Autoscaling worker pool for face-verification jobs.
//!
//! Jobs wait in a bounded FIFO channel. A single dispatcher task takes a free
//! worker slot, then the next job, and spawns the job onto its own task. Slots
//! are permits of one elastic semaphore: scaling up adds permits, scaling down
//! retires them (idle ones immediately, busy ones as their job finishes), so a
//! resize never drops or stalls a job.
//!
//! Lifecycle: `Running` -> `Draining` (`stop_accepting`) -> `Stopped`
//! (`shutdown`). There is no way back to `Running`.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use strum::Display;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, warn};

use crate::models::job::VerificationJob;
use crate::models::stats::StatsSnapshot;
use crate::services::autoscale::{Autoscaler, ScalePolicy};
use crate::services::processor::{JobProcessor, JobReport};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Sizing and backpressure settings for [`DynamicWorkerPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Jobs that may wait in the queue before `submit` starts rejecting.
    pub queue_capacity: usize,
    /// Minimum time between two resizes.
    pub scale_cooldown: Duration,
    /// How long `submit` waits for room in a full queue.
    pub submit_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 100,
            queue_capacity: 1000,
            scale_cooldown: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    fn normalized(mut self) -> Self {
        self.min_workers = self.min_workers.max(1);
        self.max_workers = self.max_workers.max(self.min_workers);
        self.queue_capacity = self.queue_capacity.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Lifecycle {
    Running,
    Draining,
    Stopped,
}

struct Shared {
    config: PoolConfig,
    processor: JobProcessor,
    sender: mpsc::Sender<VerificationJob>,
    accepting: AtomicBool,
    running: AtomicBool,
    active: AtomicUsize,
    total_processed: AtomicU64,
    resizes: AtomicU64,
    /// Worker-count lock. Resizes are decided and applied while holding it.
    scaler: Mutex<Autoscaler>,
    slots: Arc<Semaphore>,
    /// Busy permits to retire when their job finishes (pending shrink).
    retiring: AtomicUsize,
    stop: Notify,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
}

impl Shared {
    fn scaler(&self) -> MutexGuard<'_, Autoscaler> {
        self.scaler.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn resize(&self, from: usize, to: usize) {
        if to > from {
            let grow = to - from;
            // Cancel pending retirements before minting new permits.
            let pending = self
                .retiring
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    Some(n.saturating_sub(grow))
                })
                .unwrap_or(0);
            self.slots.add_permits(grow - pending.min(grow));
        } else {
            let shrink = from - to;
            let idle = self.slots.forget_permits(shrink);
            self.retiring.fetch_add(shrink - idle, Ordering::SeqCst);
        }
    }

    fn take_retirement(&self) -> bool {
        self.retiring
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop.notify_one();
        self.slots.close();
    }
}

/// One running job's hold on a worker slot.
struct WorkerSlot {
    shared: Arc<Shared>,
    permit: Option<OwnedSemaphorePermit>,
}

impl WorkerSlot {
    fn occupy(shared: Arc<Shared>, permit: OwnedSemaphorePermit) -> Self {
        let active = shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("face_pool_active").set(active as f64);
        Self {
            shared,
            permit: Some(permit),
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let active = self.shared.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("face_pool_active").set(active as f64);
        if let Some(permit) = self.permit.take() {
            if self.shared.take_retirement() {
                permit.forget();
            }
        }
    }
}

/// Bounded, autoscaling queue of verification jobs.
pub struct DynamicWorkerPool {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl DynamicWorkerPool {
    /// Create the pool and start its dispatcher. Must be called inside a
    /// Tokio runtime.
    pub fn start(config: PoolConfig, processor: JobProcessor) -> Self {
        Self::spawn(config, processor, None)
    }

    /// Like [`start`](Self::start), additionally sending a [`JobReport`] for
    /// every finished job to `reports`.
    pub fn start_with_reports(
        config: PoolConfig,
        processor: JobProcessor,
        reports: mpsc::UnboundedSender<JobReport>,
    ) -> Self {
        Self::spawn(config, processor, Some(reports))
    }

    fn spawn(
        config: PoolConfig,
        processor: JobProcessor,
        reports: Option<mpsc::UnboundedSender<JobReport>>,
    ) -> Self {
        let config = config.normalized();
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let scaler = Autoscaler::new(ScalePolicy {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            cooldown: config.scale_cooldown,
        });

        let shared = Arc::new(Shared {
            slots: Arc::new(Semaphore::new(config.min_workers)),
            config,
            processor,
            sender,
            accepting: AtomicBool::new(true),
            running: AtomicBool::new(true),
            active: AtomicUsize::new(0),
            total_processed: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
            scaler: Mutex::new(scaler),
            retiring: AtomicUsize::new(0),
            stop: Notify::new(),
            reports,
        });

        metrics::gauge!("face_pool_workers").set(shared.config.min_workers as f64);
        info!(
            workers = shared.config.min_workers,
            max_workers = shared.config.max_workers,
            queue_capacity = shared.config.queue_capacity,
            "Face verification pool started"
        );

        let handle = tokio::spawn(dispatch(shared.clone(), receiver));
        Self {
            shared,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    /// Queue a job. Returns `false` when the pool no longer accepts work or
    /// the queue stayed full for the configured submit timeout.
    pub async fn submit(&self, job: VerificationJob) -> bool {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            debug!(request_id = %job.request_id, "Pool is not accepting jobs");
            metrics::counter!("face_jobs_rejected_total", "reason" => "closed").increment(1);
            return false;
        }

        let request_id = job.request_id.clone();
        let student_id = job.student_id.clone();

        match self
            .shared
            .sender
            .send_timeout(job, self.shared.config.submit_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    request_id = %request_id,
                    student_id = %student_id,
                    capacity = self.shared.config.queue_capacity,
                    "Verification queue full, rejecting job"
                );
                metrics::counter!("face_jobs_rejected_total", "reason" => "full").increment(1);
                return false;
            }
            Err(SendTimeoutError::Closed(_)) => {
                warn!(request_id = %request_id, "Verification queue closed, rejecting job");
                metrics::counter!("face_jobs_rejected_total", "reason" => "closed").increment(1);
                return false;
            }
        }

        let depth = self.shared.queue_depth();
        metrics::counter!("face_jobs_submitted_total").increment(1);
        metrics::gauge!("face_queue_depth").set(depth as f64);
        self.autoscale(depth);

        info!(
            request_id = %request_id,
            student_id = %student_id,
            queue_depth = depth,
            "Verification job queued"
        );
        true
    }

    fn autoscale(&self, queue_depth: usize) {
        let mut scaler = self.shared.scaler();
        let from = scaler.current();
        let Some(to) = scaler.evaluate(queue_depth, Instant::now()) else {
            return;
        };

        self.shared.resize(from, to);
        self.shared.resizes.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("face_pool_resizes_total").increment(1);
        metrics::gauge!("face_pool_workers").set(to as f64);
        info!(
            from,
            to,
            queue_depth,
            active = self.shared.active.load(Ordering::SeqCst),
            "Scaled verification workers"
        );
    }

    /// Refuse all further submissions. Queued and running jobs carry on.
    pub fn stop_accepting(&self) {
        if self.shared.accepting.swap(false, Ordering::SeqCst) {
            info!(
                queue_depth = self.shared.queue_depth(),
                "Verification pool stopped accepting jobs"
            );
        }
    }

    /// Wait up to `max_wait` for the queue to empty, then stop dispatching.
    ///
    /// Jobs still queued at the deadline are abandoned; jobs already running
    /// are left to finish on their own. Returns the number abandoned.
    pub async fn shutdown(&self, max_wait: Duration) -> usize {
        self.stop_accepting();

        let deadline = Instant::now() + max_wait;
        loop {
            let depth = self.shared.queue_depth();
            if depth == 0 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    abandoned = depth,
                    max_wait_secs = max_wait.as_secs_f64(),
                    "Shutdown timeout reached, abandoning queued jobs"
                );
                break;
            }
            sleep(DRAIN_POLL_INTERVAL.min(deadline - now)).await;
        }

        let abandoned = self.shared.queue_depth();
        self.shared.halt();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if timeout(DISPATCHER_STOP_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        info!(
            abandoned,
            in_flight = self.shared.active.load(Ordering::SeqCst),
            total_processed = self.shared.total_processed.load(Ordering::SeqCst),
            "Face verification pool shut down"
        );
        abandoned
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if !self.shared.running.load(Ordering::SeqCst) {
            Lifecycle::Stopped
        } else if self.shared.accepting.load(Ordering::SeqCst) {
            Lifecycle::Running
        } else {
            Lifecycle::Draining
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue_depth()
    }

    /// Number of resizes applied since start.
    pub fn resize_count(&self) -> u64 {
        self.shared.resizes.load(Ordering::SeqCst)
    }

    /// Read-only snapshot for monitoring.
    pub fn stats(&self) -> StatsSnapshot {
        let ledgers = self.shared.processor.ledgers();
        StatsSnapshot {
            queue_depth: self.shared.queue_depth(),
            active_count: self.shared.active.load(Ordering::SeqCst),
            current_workers: self.shared.scaler().current(),
            total_processed: self.shared.total_processed.load(Ordering::SeqCst),
            max_workers: self.shared.config.max_workers,
            retry_ledger_size: ledgers.retries.len(),
            completion_ledger_size: ledgers.completions.len(),
        }
    }
}

impl Drop for DynamicWorkerPool {
    fn drop(&mut self) {
        self.shared.halt();
    }
}

async fn dispatch(shared: Arc<Shared>, mut receiver: mpsc::Receiver<VerificationJob>) {
    while shared.running.load(Ordering::SeqCst) {
        let permit = tokio::select! {
            permit = shared.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shared.stop.notified() => continue,
        };

        let job = tokio::select! {
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shared.stop.notified() => continue,
        };

        let slot = WorkerSlot::occupy(shared.clone(), permit);
        let worker = shared.clone();
        tokio::spawn(async move {
            let report = worker.processor.run(job).await;
            worker.total_processed.fetch_add(1, Ordering::SeqCst);
            drop(slot);
            if let Some(reports) = &worker.reports {
                let _ = reports.send(report);
            }
        });
    }
    debug!("Verification dispatcher stopped");
}
