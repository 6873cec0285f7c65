use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window limiter for calls to a remote provider.
///
/// At most `max_calls` calls are admitted within any `window`. Admission is
/// non-blocking; async callers use [`RateLimiter::until_ready`].
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn per_second(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(1))
    }

    /// Try to take a slot. Returns `false` when the window is saturated.
    pub fn acquire(&self) -> bool {
        self.acquire_at(Instant::now())
    }

    /// Time until a slot frees up; zero when one is available now.
    pub fn wait_time(&self) -> Duration {
        self.wait_time_at(Instant::now())
    }

    /// Wait until a slot is granted.
    pub async fn until_ready(&self) {
        while !self.acquire() {
            let wait = self.wait_time();
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            } else {
                tokio::task::yield_now().await;
            }
        }
    }

    fn acquire_at(&self, now: Instant) -> bool {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut calls, now, self.window);

        if calls.len() < self.max_calls {
            calls.push_back(now);
            true
        } else {
            false
        }
    }

    fn wait_time_at(&self, now: Instant) -> Duration {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        Self::evict(&mut calls, now, self.window);

        if calls.len() < self.max_calls {
            return Duration::ZERO;
        }
        match calls.front() {
            Some(oldest) => self.window.saturating_sub(now.saturating_duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }

    fn evict(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = calls.front() {
            if now.saturating_duration_since(*oldest) >= window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}
