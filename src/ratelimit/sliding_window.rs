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
pub struct SlidingWindowConfig {
    pub window: Duration,
    pub max_requests: u64,
}

/// Exact rolling-window limiter. Keeps one log entry per admitted request,
/// so storage grows with `max_requests`.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    config: SlidingWindowConfig,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        config: SlidingWindowConfig,
    ) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.into(),
            config,
        }
    }

    fn window_ms(&self) -> u64 {
        self.config.window.as_millis() as u64
    }

    fn storage_key(&self, key: &RateLimitKey) -> String {
        key.storage_key(&self.key_prefix, &self.config.window.as_secs().to_string())
    }

    fn op(&self, count: u64) -> CounterOp {
        CounterOp::AppendLog {
            window_ms: self.window_ms(),
            max_entries: self.config.max_requests,
            count,
        }
    }

    pub async fn check_limit(
        &self,
        key: &RateLimitKey,
        requests_count: u64,
    ) -> StoreResult<AdmissionVerdict> {
        self.check_limit_at(key, requests_count, self.clock.now_ms())
            .await
    }

    /// Admission stamped with a caller-supplied time, so the caller can later
    /// hand the same `now_ms` to [`release`](Self::release).
    pub(crate) async fn check_limit_at(
        &self,
        key: &RateLimitKey,
        requests_count: u64,
        now_ms: u64,
    ) -> StoreResult<AdmissionVerdict> {
        let outcome = self
            .store
            .apply(
                &self.storage_key(key),
                &self.op(requests_count),
                now_ms,
                Expiry::Refresh(self.config.window),
            )
            .await?;

        let window_ms = self.window_ms();
        let reset_at_ms = outcome.oldest_ms.unwrap_or(now_ms) + window_ms;

        if outcome.admitted {
            let remaining = self.config.max_requests.saturating_sub(outcome.count());
            return Ok(AdmissionVerdict::admitted(
                Remaining::Limited(remaining),
                reset_at_ms,
            ));
        }

        // The oldest entry stops counting one millisecond after the window
        // passes it.
        let retry_after = (requests_count <= self.config.max_requests).then(|| {
            Duration::from_millis((reset_at_ms + 1).saturating_sub(now_ms))
        });

        tracing::debug!(
            subject_id = %key.subject_id(),
            endpoint = %key.endpoint(),
            live = outcome.count(),
            requested = requests_count,
            "sliding window rejected request"
        );
        Ok(AdmissionVerdict::rejected(reset_at_ms, retry_after))
    }

    /// Removes `count` entries logged by an admission at `at_ms`.
    pub async fn release(&self, key: &RateLimitKey, at_ms: u64, count: u64) -> StoreResult<()> {
        self.store
            .apply(
                &self.storage_key(key),
                &CounterOp::RemoveEntries {
                    window_ms: self.window_ms(),
                    at_ms,
                    count,
                },
                self.clock.now_ms(),
                Expiry::OnCreate(self.config.window),
            )
            .await?;
        Ok(())
    }

    pub async fn snapshot(&self, key: &RateLimitKey) -> StoreResult<WindowSnapshot> {
        let now_ms = self.clock.now_ms();
        let outcome = self
            .store
            .inspect(&self.storage_key(key), &self.op(0), now_ms)
            .await?;

        Ok(WindowSnapshot {
            used: outcome.count(),
            reset_at_ms: outcome.oldest_ms.unwrap_or(now_ms) + self.window_ms(),
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

    const T0: u64 = 1_800_000_000_000;

    fn limiter(window_secs: u64, max_requests: u64) -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = SlidingWindowLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            clock.clone(),
            "test",
            SlidingWindowConfig {
                window: Duration::from_secs(window_secs),
                max_requests,
            },
        );
        (limiter, clock)
    }

    fn key() -> RateLimitKey {
        RateLimitKey::new("subject", "/endpoint", AlgorithmKind::SlidingWindow)
    }

    #[tokio::test]
    async fn entries_expire_one_by_one() {
        let (limiter, clock) = limiter(60, 5);

        for n in 0..5 {
            let verdict = limiter.check_limit(&key(), 1).await.unwrap();
            assert!(verdict.allowed);
            assert_eq!(verdict.remaining, Remaining::Limited(4 - n));
        }

        clock.set(T0 + 30_000);
        let verdict = limiter.check_limit(&key(), 1).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.reset_at_ms, T0 + 60_000);
        assert_eq!(verdict.retry_after, Some(Duration::from_millis(30_001)));

        clock.set(T0 + 61_000);
        let verdict = limiter.check_limit(&key(), 1).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, Remaining::Limited(4));
        assert_eq!(verdict.reset_at_ms, T0 + 121_000);
    }

    #[tokio::test]
    async fn no_burst_across_window_edges() {
        let (limiter, clock) = limiter(10, 4);

        clock.set(T0 + 9_000);
        assert!(limiter.check_limit(&key(), 4).await.unwrap().allowed);

        // A fixed window would have reset at T0 + 10s.
        clock.set(T0 + 11_000);
        assert!(!limiter.check_limit(&key(), 1).await.unwrap().allowed);

        clock.set(T0 + 19_001);
        assert!(limiter.check_limit(&key(), 4).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn rejected_batch_inserts_nothing() {
        let (limiter, _) = limiter(60, 3);

        assert!(limiter.check_limit(&key(), 2).await.unwrap().allowed);
        assert!(!limiter.check_limit(&key(), 2).await.unwrap().allowed);

        let snapshot = limiter.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.used, 2);
        assert_eq!(snapshot.reset_at_ms, T0 + 60_000);
    }

    #[tokio::test]
    async fn release_removes_only_the_given_admission() {
        let (limiter, clock) = limiter(60, 3);

        assert!(limiter.check_limit(&key(), 1).await.unwrap().allowed);
        clock.advance(Duration::from_secs(5));
        assert!(limiter.check_limit(&key(), 2).await.unwrap().allowed);
        assert!(!limiter.check_limit(&key(), 1).await.unwrap().allowed);

        limiter.release(&key(), T0 + 5_000, 1).await.unwrap();
        let snapshot = limiter.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.used, 2);
        assert_eq!(snapshot.reset_at_ms, T0 + 60_000);

        // Nothing was logged at this time.
        limiter.release(&key(), T0 + 1_000, 1).await.unwrap();
        assert_eq!(limiter.snapshot(&key()).await.unwrap().used, 2);
        assert!(limiter.check_limit(&key(), 1).await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_never_overadmit() {
        let (limiter, _) = limiter(60, 31);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_limit(&key(), 1).await.unwrap().allowed })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 31);
        assert_eq!(limiter.snapshot(&key()).await.unwrap().used, 31);
    }

    #[tokio::test]
    async fn oversized_batch_has_no_retry_hint() {
        let (limiter, _) = limiter(60, 3);
        let verdict = limiter.check_limit(&key(), 4).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.retry_after, None);
    }
}
