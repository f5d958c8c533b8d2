use std::{
    sync::Arc,
    time::Duration,
};

use crate::{
    clock::Clock,
    ratelimit::{
        AdmissionVerdict,
        RateLimitKey,
        Remaining,
        WindowSnapshot,
    },
    store::{
        CounterOp,
        CounterStore,
        Expiry,
        StoreResult,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowConfig {
    pub window: Duration,
    pub max_requests: u64,
}

/// Counter per discrete window, `window_index = floor(now / window)`.
///
/// Windows are aligned to the Unix epoch and independent of each other: a
/// caller that spends its whole budget at the end of one window and again at
/// the start of the next is admitted up to `2 * max_requests` within a span
/// shorter than one window. This is the accepted cost of keeping a single
/// integer per key; use [`SlidingWindowLimiter`] where that burst matters.
///
/// [`SlidingWindowLimiter`]: crate::ratelimit::sliding_window::SlidingWindowLimiter
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    config: FixedWindowConfig,
}

impl FixedWindowLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        config: FixedWindowConfig,
    ) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.into(),
            config,
        }
    }

    fn window_ms(&self) -> u64 {
        (self.config.window.as_millis() as u64).max(1)
    }

    fn window_key(&self, key: &RateLimitKey, window_index: u64) -> String {
        format!(
            "{}:{}",
            key.storage_key(&self.key_prefix, &self.config.window.as_secs().to_string()),
            window_index
        )
    }

    fn expiry(&self) -> Expiry {
        Expiry::OnCreate(self.config.window)
    }

    pub async fn check_limit(
        &self,
        key: &RateLimitKey,
        requests_count: u64,
    ) -> StoreResult<AdmissionVerdict> {
        let now_ms = self.clock.now_ms();
        let window_ms = self.window_ms();
        let window_index = now_ms / window_ms;
        let reset_at_ms = (window_index + 1) * window_ms;

        let outcome = self
            .store
            .apply(
                &self.window_key(key, window_index),
                &CounterOp::BoundedIncrement {
                    limit: self.config.max_requests,
                    amount: requests_count,
                },
                now_ms,
                self.expiry(),
            )
            .await?;

        if outcome.admitted {
            let remaining = self.config.max_requests.saturating_sub(outcome.count());
            return Ok(AdmissionVerdict::admitted(
                Remaining::Limited(remaining),
                reset_at_ms,
            ));
        }

        tracing::debug!(
            subject_id = %key.subject_id(),
            endpoint = %key.endpoint(),
            window_index,
            count = outcome.count(),
            "fixed window rejected request"
        );
        let retry_after = (requests_count <= self.config.max_requests)
            .then(|| Duration::from_millis(reset_at_ms - now_ms));
        Ok(AdmissionVerdict::rejected(reset_at_ms, retry_after))
    }

    /// Returns units taken by an earlier admission. The window is identified
    /// by the `reset_at_ms` of that admission's verdict.
    pub async fn release(
        &self,
        key: &RateLimitKey,
        reset_at_ms: u64,
        amount: u64,
    ) -> StoreResult<()> {
        let window_index = (reset_at_ms / self.window_ms()).saturating_sub(1);
        self.store
            .apply(
                &self.window_key(key, window_index),
                &CounterOp::Release { amount },
                self.clock.now_ms(),
                self.expiry(),
            )
            .await?;
        Ok(())
    }

    pub async fn snapshot(&self, key: &RateLimitKey) -> StoreResult<WindowSnapshot> {
        let now_ms = self.clock.now_ms();
        let window_ms = self.window_ms();
        let window_index = now_ms / window_ms;
        let outcome = self
            .store
            .inspect(
                &self.window_key(key, window_index),
                &CounterOp::BoundedIncrement {
                    limit: self.config.max_requests,
                    amount: 0,
                },
                now_ms,
            )
            .await?;

        Ok(WindowSnapshot {
            used: outcome.count(),
            reset_at_ms: (window_index + 1) * window_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        ratelimit::AlgorithmKind,
        store::in_memory::InMemoryCounterStore,
    };

    // Aligned to both minute and hour boundaries.
    const T0: u64 = 1_800_000_000_000;

    fn limiter(window_secs: u64, max_requests: u64) -> (FixedWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = FixedWindowLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            clock.clone(),
            "test",
            FixedWindowConfig {
                window: Duration::from_secs(window_secs),
                max_requests,
            },
        );
        (limiter, clock)
    }

    fn key() -> RateLimitKey {
        RateLimitKey::new("subject", "/endpoint", AlgorithmKind::FixedWindow)
    }

    #[tokio::test]
    async fn counts_reset_at_window_boundary() {
        let (limiter, clock) = limiter(3_600, 100);

        for n in 1..=100u64 {
            clock.set(T0 + n * 1_000);
            let verdict = limiter.check_limit(&key(), 1).await.unwrap();
            assert!(verdict.allowed, "call {n} should be admitted");
            assert_eq!(verdict.remaining, Remaining::Limited(100 - n));
            assert_eq!(verdict.reset_at_ms, T0 + 3_600_000);
        }

        clock.set(T0 + 3_599_999);
        let verdict = limiter.check_limit(&key(), 1).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, Some(Duration::from_millis(1)));

        clock.set(T0 + 3_600_000);
        let verdict = limiter.check_limit(&key(), 1).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, Remaining::Limited(99));
        assert_eq!(verdict.reset_at_ms, T0 + 7_200_000);
    }

    #[tokio::test]
    async fn boundary_burst_is_bounded_by_twice_the_limit() {
        let (limiter, clock) = limiter(60, 5);

        clock.set(T0 + 59_000);
        assert!(limiter.check_limit(&key(), 5).await.unwrap().allowed);
        clock.set(T0 + 60_000);
        assert!(limiter.check_limit(&key(), 5).await.unwrap().allowed);
        assert!(!limiter.check_limit(&key(), 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn rejection_leaves_count_unchanged() {
        let (limiter, _) = limiter(60, 3);

        assert!(limiter.check_limit(&key(), 2).await.unwrap().allowed);
        let verdict = limiter.check_limit(&key(), 2).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(limiter.snapshot(&key()).await.unwrap().used, 2);
        assert!(limiter.check_limit(&key(), 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn release_targets_the_admitting_window() {
        let (limiter, clock) = limiter(60, 3);

        let verdict = limiter.check_limit(&key(), 2).await.unwrap();
        limiter.release(&key(), verdict.reset_at_ms, 1).await.unwrap();
        assert_eq!(limiter.snapshot(&key()).await.unwrap().used, 1);

        // Releasing into a window that has since closed does not touch the
        // current one.
        let verdict = limiter.check_limit(&key(), 1).await.unwrap();
        clock.advance(Duration::from_secs(60));
        assert!(limiter.check_limit(&key(), 3).await.unwrap().allowed);
        limiter.release(&key(), verdict.reset_at_ms, 2).await.unwrap();
        assert_eq!(limiter.snapshot(&key()).await.unwrap().used, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_never_exceed_the_window_budget() {
        const CALLS: u64 = 32;
        let (limiter, _) = limiter(60, CALLS - 1);
        let limiter = Arc::new(limiter);

        let handles = (0..CALLS)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_limit(&key(), 1).await.unwrap() })
            })
            .collect::<Vec<_>>();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, CALLS - 1);
        assert_eq!(limiter.snapshot(&key()).await.unwrap().used, CALLS - 1);
    }
}
