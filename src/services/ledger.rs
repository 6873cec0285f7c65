//! In-memory bookkeeping of retries and completed attendance per
//! `(student_id, otp)`.
//!
//! Every operation is a short critical section on a mutex. None of them
//! fail: a poisoned lock is recovered, since the maps stay consistent after
//! every individual statement.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::job::LedgerKey;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone, Copy)]
struct RetryEntry {
    attempts_used: u32,
    last_update: Instant,
}

/// Retries consumed per key, forgotten after a period of inactivity.
pub struct RetryLedger {
    ttl: Duration,
    entries: Mutex<HashMap<LedgerKey, RetryEntry>>,
}

impl RetryLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically bump the counter for `key`, returning the value it had
    /// before the bump.
    pub fn get_and_increment(&self, key: &LedgerKey) -> u32 {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let entry = entries.entry(key.clone()).or_insert(RetryEntry {
            attempts_used: 0,
            last_update: now,
        });

        let before = entry.attempts_used;
        entry.attempts_used = before.saturating_add(1);
        entry.last_update = now;
        before
    }

    pub fn attempts(&self, key: &LedgerKey) -> u32 {
        lock(&self.entries)
            .get(key)
            .map(|e| e.attempts_used)
            .unwrap_or(0)
    }

    /// Drop the counter for `key`, e.g. once the attempt has succeeded.
    pub fn clear(&self, key: &LedgerKey) -> bool {
        lock(&self.entries).remove(key).is_some()
    }

    /// Remove entries idle for at least the ledger TTL as of `now`.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.last_update) < self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// A worker matched the face and is recording attendance right now.
    Reserved,
    Completed,
}

#[derive(Default)]
struct CompletionState {
    slots: HashMap<LedgerKey, Slot>,
    /// Completed keys, oldest first.
    order: VecDeque<LedgerKey>,
}

impl CompletionState {
    fn complete(&mut self, key: &LedgerKey) -> bool {
        match self.slots.insert(key.clone(), Slot::Completed) {
            Some(Slot::Completed) => false,
            _ => {
                self.order.push_back(key.clone());
                true
            }
        }
    }
}

/// Result of trying to become the one worker that records a key.
pub enum Claim<'a> {
    Reserved(CompletionReservation<'a>),
    AlreadyCompleted,
    InProgress,
}

/// Exclusive right to record attendance for one key.
///
/// Dropping it without [`commit`](Self::commit) releases the key so a later
/// submission can try again.
pub struct CompletionReservation<'a> {
    ledger: &'a CompletionLedger,
    key: LedgerKey,
    committed: bool,
}

impl CompletionReservation<'_> {
    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    pub fn commit(mut self) {
        lock(&self.ledger.state).complete(&self.key);
        self.committed = true;
    }
}

impl Drop for CompletionReservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = lock(&self.ledger.state);
        if state.slots.get(&self.key) == Some(&Slot::Reserved) {
            state.slots.remove(&self.key);
        }
    }
}

/// Write-once "attendance already recorded" markers, capped by count.
pub struct CompletionLedger {
    cap: usize,
    state: Mutex<CompletionState>,
}

impl CompletionLedger {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            state: Mutex::new(CompletionState::default()),
        }
    }

    pub fn is_completed(&self, key: &LedgerKey) -> bool {
        lock(&self.state).slots.get(key) == Some(&Slot::Completed)
    }

    /// Record `key` as completed. Returns `false` if it already was.
    pub fn mark_completed(&self, key: &LedgerKey) -> bool {
        lock(&self.state).complete(key)
    }

    /// Check-then-reserve in one critical section. At most one caller holds
    /// a reservation for a key at any time, and never for a completed key.
    pub fn try_reserve(&self, key: &LedgerKey) -> Claim<'_> {
        let mut state = lock(&self.state);
        let existing = state.slots.get(key).copied();
        match existing {
            Some(Slot::Completed) => Claim::AlreadyCompleted,
            Some(Slot::Reserved) => Claim::InProgress,
            None => {
                state.slots.insert(key.clone(), Slot::Reserved);
                Claim::Reserved(CompletionReservation {
                    ledger: self,
                    key: key.clone(),
                    committed: false,
                })
            }
        }
    }

    /// Evict the oldest completed keys beyond the cap. `_now` is accepted so
    /// the janitor can drive both ledgers the same way; eviction here is by
    /// count, not age.
    pub fn sweep(&self, _now: Instant) -> usize {
        let mut state = lock(&self.state);
        let mut removed = 0;
        while state.order.len() > self.cap {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            if state.slots.get(&oldest) == Some(&Slot::Completed) {
                state.slots.remove(&oldest);
                removed += 1;
            }
        }
        removed
    }

    /// Number of completed keys currently held.
    pub fn len(&self) -> usize {
        lock(&self.state).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
