use serde::Serialize;

/// Point-in-time view of the verification queue, polled by monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub queue_depth: usize,
    pub active_count: usize,
    pub current_workers: usize,
    pub total_processed: u64,
    pub max_workers: usize,
    pub retry_ledger_size: usize,
    pub completion_ledger_size: usize,
}
