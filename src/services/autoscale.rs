use tokio::time::{Duration, Instant};

/// Worker count bounds and the minimum spacing between resizes.
#[derive(Debug, Clone, Copy)]
pub struct ScalePolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub cooldown: Duration,
}

/// Worker count the pool should move to for the given backlog.
///
/// Grows when the backlog exceeds twice the workers, by at least two or a
/// quarter of the backlog. Shrinks by one when the backlog drops below a
/// third of the workers. Always stays within `[min, max]`.
pub fn target_workers(queue_depth: usize, current: usize, min: usize, max: usize) -> usize {
    if queue_depth > current * 2 && current < max {
        max.min(current + (queue_depth / 4).max(2))
    } else if queue_depth < current / 3 && current > min {
        min.max(current - 1)
    } else {
        current
    }
}

/// Mutable scaling state, kept under the pool's worker-count lock.
#[derive(Debug)]
pub struct Autoscaler {
    policy: ScalePolicy,
    current: usize,
    last_resize: Option<Instant>,
}

impl Autoscaler {
    pub fn new(policy: ScalePolicy) -> Self {
        Self {
            current: policy.min_workers,
            policy,
            last_resize: None,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Decide on a resize for the observed backlog. Returns the new worker
    /// count when one should be applied; at most once per cooldown window.
    pub fn evaluate(&mut self, queue_depth: usize, now: Instant) -> Option<usize> {
        if let Some(last) = self.last_resize {
            if now.saturating_duration_since(last) < self.policy.cooldown {
                return None;
            }
        }

        let target = target_workers(
            queue_depth,
            self.current,
            self.policy.min_workers,
            self.policy.max_workers,
        );
        if target == self.current {
            return None;
        }

        self.current = target;
        self.last_resize = Some(now);
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_up_by_at_least_two() {
        assert_eq!(target_workers(5, 2, 2, 100), 4);
    }

    #[test]
    fn test_scale_up_by_quarter_of_backlog() {
        assert_eq!(target_workers(100, 2, 2, 100), 27);
    }

    #[test]
    fn test_scale_up_capped_at_max() {
        assert_eq!(target_workers(1000, 10, 2, 20), 20);
        assert_eq!(target_workers(1000, 20, 2, 20), 20);
    }

    #[test]
    fn test_scale_down_one_at_a_time() {
        assert_eq!(target_workers(0, 12, 2, 100), 11);
        assert_eq!(target_workers(0, 2, 2, 100), 2);
    }

    #[test]
    fn test_steady_band_keeps_count() {
        // 4 is neither > 2*6 nor < 6/3.
        assert_eq!(target_workers(4, 6, 2, 100), 6);
    }

    #[test]
    fn test_cooldown_limits_resizes() {
        let mut scaler = Autoscaler::new(ScalePolicy {
            min_workers: 2,
            max_workers: 100,
            cooldown: Duration::from_secs(5),
        });
        let start = Instant::now();

        assert_eq!(scaler.evaluate(10, start), Some(4));
        for depth in 11..100 {
            assert_eq!(scaler.evaluate(depth, start + Duration::from_secs(1)), None);
        }
        assert_eq!(scaler.current(), 4);

        assert_eq!(
            scaler.evaluate(40, start + Duration::from_secs(5)),
            Some(14)
        );
    }
}
