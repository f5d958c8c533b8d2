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
    },
    store::{
        CounterOp,
        CounterStore,
        Expiry,
        StoreResult,
    },
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    pub capacity: u64,
    /// Tokens added per `refill_period`.
    pub refill_rate: f64,
    pub refill_period: Duration,
}

impl TokenBucketConfig {
    fn refill_per_ms(&self) -> f64 {
        self.refill_rate / self.refill_period.as_millis().max(1) as f64
    }

    fn millis_to_gain(&self, tokens: f64) -> u64 {
        let period_ms = self.refill_period.as_millis().max(1) as f64;
        (tokens.max(0.0) * period_ms / self.refill_rate).ceil() as u64
    }

    /// A bucket left alone for this long is full again, so dropping its state
    /// loses nothing.
    fn ttl(&self) -> Duration {
        let to_full = Duration::from_millis(self.millis_to_gain(self.capacity as f64));
        to_full.max(self.refill_period)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    pub tokens: u64,
    pub full_at_ms: u64,
}

/// Continuous-refill limiter for burst control.
pub struct TokenBucketLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    config: TokenBucketConfig,
}

impl TokenBucketLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        config: TokenBucketConfig,
    ) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.into(),
            config,
        }
    }

    fn storage_key(&self, key: &RateLimitKey) -> String {
        key.storage_key(&self.key_prefix, &self.config.refill_period.as_secs().to_string())
    }

    fn op(&self, requested: u64) -> CounterOp {
        CounterOp::TakeTokens {
            capacity: self.config.capacity as f64,
            refill_per_ms: self.config.refill_per_ms(),
            requested: requested as f64,
        }
    }

    pub async fn check_limit(
        &self,
        key: &RateLimitKey,
        tokens_requested: u64,
    ) -> StoreResult<AdmissionVerdict> {
        let now_ms = self.clock.now_ms();
        let outcome = self
            .store
            .apply(
                &self.storage_key(key),
                &self.op(tokens_requested),
                now_ms,
                Expiry::Refresh(self.config.ttl()),
            )
            .await?;

        let capacity = self.config.capacity as f64;
        let full_at_ms =
            now_ms.saturating_add(self.config.millis_to_gain(capacity - outcome.level));

        if outcome.admitted {
            return Ok(AdmissionVerdict::admitted(
                Remaining::Limited(outcome.level.floor() as u64),
                full_at_ms,
            ));
        }

        let retry_after = (tokens_requested <= self.config.capacity).then(|| {
            Duration::from_millis(
                self.config
                    .millis_to_gain(tokens_requested as f64 - outcome.level),
            )
        });

        tracing::debug!(
            subject_id = %key.subject_id(),
            endpoint = %key.endpoint(),
            tokens = outcome.level,
            requested = tokens_requested,
            "token bucket rejected request"
        );
        Ok(AdmissionVerdict::rejected(full_at_ms, retry_after))
    }

    /// Current token count without taking any.
    pub async fn snapshot(&self, key: &RateLimitKey) -> StoreResult<BucketSnapshot> {
        let now_ms = self.clock.now_ms();
        let outcome = self
            .store
            .inspect(&self.storage_key(key), &self.op(0), now_ms)
            .await?;

        Ok(BucketSnapshot {
            tokens: outcome.level.floor() as u64,
            full_at_ms: now_ms.saturating_add(
                self.config
                    .millis_to_gain(self.config.capacity as f64 - outcome.level),
            ),
        })
    }
}
