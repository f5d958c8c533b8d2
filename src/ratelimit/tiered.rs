use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serde::Serialize;

use crate::{
    clock::Clock,
    ratelimit::{
        AdmissionVerdict,
        AlgorithmKind,
        RateLimitKey,
        Remaining,
        WindowSnapshot,
        fixed_window::{
            FixedWindowConfig,
            FixedWindowLimiter,
        },
        sliding_window::{
            SlidingWindowConfig,
            SlidingWindowLimiter,
        },
        token_bucket::{
            TokenBucketConfig,
            TokenBucketLimiter,
        },
    },
    store::{
        CounterStore,
        StoreResult,
    },
};

const HOUR: Duration = Duration::from_secs(3_600);
const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Developer,
    Professional,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::Free,
        Tier::Developer,
        Tier::Professional,
        Tier::Enterprise,
    ];

    /// Position in [`Tier::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Developer => "developer",
            Self::Professional => "professional",
            Self::Enterprise => "enterprise",
        }
    }

    /// Lenient lookup used on the request path: anything unrecognised is
    /// served with free-tier limits.
    pub fn resolve(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| {
            tracing::debug!(tier = %raw, "unknown tier; applying free tier limits");
            Self::Free
        })
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "developer" => Ok(Self::Developer),
            "professional" => Ok(Self::Professional),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rates per tier. `None` means no limit at that granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TierLimits {
    pub requests_per_hour: Option<u64>,
    pub requests_per_minute: Option<u64>,
    pub burst_capacity: u64,
}

impl TierLimits {
    pub fn validate(&self) -> Result<(), String> {
        if self.burst_capacity == 0 {
            return Err("burst capacity must be greater than 0".to_string());
        }
        if self.requests_per_hour == Some(0) || self.requests_per_minute == Some(0) {
            return Err("rates must be greater than 0 or unlimited".to_string());
        }
        Ok(())
    }
}

/// Limits for every tier, indexed in [`Tier::ALL`] order.
#[derive(Debug, Clone, PartialEq)]
pub struct TierTable {
    limits: [TierLimits; 4],
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            limits: [
                TierLimits {
                    requests_per_hour: Some(100),
                    requests_per_minute: Some(20),
                    burst_capacity: 10,
                },
                TierLimits {
                    requests_per_hour: Some(1_000),
                    requests_per_minute: Some(60),
                    burst_capacity: 30,
                },
                TierLimits {
                    requests_per_hour: Some(10_000),
                    requests_per_minute: Some(300),
                    burst_capacity: 100,
                },
                TierLimits {
                    requests_per_hour: None,
                    requests_per_minute: None,
                    burst_capacity: 1_000,
                },
            ],
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> TierLimits {
        self.limits[tier.index()]
    }

    pub fn set(&mut self, tier: Tier, limits: TierLimits) {
        self.limits[tier.index()] = limits;
    }
}

/// Algorithm backing the hourly and per-minute stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowAlgorithm {
    #[default]
    Fixed,
    Sliding,
}

impl FromStr for WindowAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_window" => Ok(Self::Fixed),
            "sliding" | "sliding_window" => Ok(Self::Sliding),
            other => Err(format!("unsupported window algorithm: {other}")),
        }
    }
}

enum WindowStage {
    Fixed(FixedWindowLimiter),
    Sliding(SlidingWindowLimiter),
}

impl WindowStage {
    fn build(
        algorithm: WindowAlgorithm,
        store: &Arc<dyn CounterStore>,
        clock: &Arc<dyn Clock>,
        key_prefix: &str,
        window: Duration,
        max_requests: u64,
    ) -> Self {
        match algorithm {
            WindowAlgorithm::Fixed => Self::Fixed(FixedWindowLimiter::new(
                store.clone(),
                clock.clone(),
                key_prefix,
                FixedWindowConfig {
                    window,
                    max_requests,
                },
            )),
            WindowAlgorithm::Sliding => Self::Sliding(SlidingWindowLimiter::new(
                store.clone(),
                clock.clone(),
                key_prefix,
                SlidingWindowConfig {
                    window,
                    max_requests,
                },
            )),
        }
    }

    fn key(&self, subject_id: &str, endpoint: &str) -> RateLimitKey {
        let algorithm = match self {
            Self::Fixed(_) => AlgorithmKind::FixedWindow,
            Self::Sliding(_) => AlgorithmKind::SlidingWindow,
        };
        RateLimitKey::new(subject_id, endpoint, algorithm)
    }

    /// Takes one unit. Alongside the verdict comes the mark that
    /// [`release`](Self::release) needs to give it back: the window reset
    /// time for fixed stages, the log stamp for sliding ones.
    async fn check_limit(
        &self,
        key: &RateLimitKey,
        now_ms: u64,
    ) -> StoreResult<(AdmissionVerdict, u64)> {
        match self {
            Self::Fixed(limiter) => {
                let verdict = limiter.check_limit(key, 1).await?;
                let mark = verdict.reset_at_ms;
                Ok((verdict, mark))
            }
            Self::Sliding(limiter) => Ok((limiter.check_limit_at(key, 1, now_ms).await?, now_ms)),
        }
    }

    async fn release(&self, key: &RateLimitKey, mark: u64) -> StoreResult<()> {
        match self {
            Self::Fixed(limiter) => limiter.release(key, mark, 1).await,
            Self::Sliding(limiter) => limiter.release(key, mark, 1).await,
        }
    }

    async fn snapshot(&self, key: &RateLimitKey) -> StoreResult<WindowSnapshot> {
        match self {
            Self::Fixed(limiter) => limiter.snapshot(key).await,
            Self::Sliding(limiter) => limiter.snapshot(key).await,
        }
    }
}

struct TierStages {
    limits: TierLimits,
    hourly: Option<WindowStage>,
    per_minute: Option<WindowStage>,
    burst: Option<TokenBucketLimiter>,
}

impl TierStages {
    fn build(
        limits: TierLimits,
        algorithm: WindowAlgorithm,
        store: &Arc<dyn CounterStore>,
        clock: &Arc<dyn Clock>,
        key_prefix: &str,
    ) -> Self {
        let hourly = limits
            .requests_per_hour
            .map(|max| WindowStage::build(algorithm, store, clock, key_prefix, HOUR, max));
        let per_minute = limits
            .requests_per_minute
            .map(|max| WindowStage::build(algorithm, store, clock, key_prefix, MINUTE, max));
        // An unlimited per-minute rate refills the bucket instantly.
        let burst = limits.requests_per_minute.map(|per_minute| {
            TokenBucketLimiter::new(
                store.clone(),
                clock.clone(),
                key_prefix,
                TokenBucketConfig {
                    capacity: limits.burst_capacity,
                    refill_rate: per_minute as f64,
                    refill_period: MINUTE,
                },
            )
        });

        Self {
            limits,
            hourly,
            per_minute,
            burst,
        }
    }

    fn windows(&self) -> [(&'static str, Option<&WindowStage>); 2] {
        [
            ("hourly", self.hourly.as_ref()),
            ("per_minute", self.per_minute.as_ref()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierStatus {
    pub tier: Tier,
    pub limits: TierLimits,
    pub hourly: Option<WindowSnapshot>,
    pub per_minute: Option<WindowSnapshot>,
    pub burst_tokens: Option<u64>,
    pub burst_full_at_ms: Option<u64>,
}

/// Hourly, per-minute and burst limits composed into one admission
/// decision per request.
pub struct TieredRateLimiter {
    clock: Arc<dyn Clock>,
    tiers: [TierStages; 4],
}

impl TieredRateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key_prefix: &str,
        table: &TierTable,
        algorithm: WindowAlgorithm,
    ) -> Self {
        let tiers = Tier::ALL
            .map(|tier| TierStages::build(table.get(tier), algorithm, &store, &clock, key_prefix));

        Self { clock, tiers }
    }

    fn stages(&self, tier: Tier) -> &TierStages {
        &self.tiers[tier.index()]
    }

    /// Admission decision that never fails: a store error is logged and the
    /// request is let through with a degraded verdict.
    pub async fn check(&self, subject_id: &str, endpoint: &str, tier: Tier) -> AdmissionVerdict {
        match self.try_check(subject_id, endpoint, tier).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(
                    subject_id = %subject_id,
                    endpoint = %endpoint,
                    tier = %tier,
                    error = %err,
                    "degraded admission: counter store unavailable, failing open"
                );
                AdmissionVerdict::fail_open(self.clock.now_ms())
            }
        }
    }

    /// Runs hourly, per-minute and burst stages in order, stopping at the
    /// first rejection. Units taken by earlier stages of a rejected call are
    /// given back.
    pub async fn try_check(
        &self,
        subject_id: &str,
        endpoint: &str,
        tier: Tier,
    ) -> StoreResult<AdmissionVerdict> {
        let stages = self.stages(tier);
        let now_ms = self.clock.now_ms();
        let mut taken: Vec<(&WindowStage, RateLimitKey, u64)> = Vec::with_capacity(2);
        let mut remaining = Remaining::Unlimited;
        let mut reset_at_ms: Option<u64> = None;

        for (stage_name, stage) in stages.windows() {
            let Some(stage) = stage else {
                continue;
            };
            let key = stage.key(subject_id, endpoint);
            let (verdict, mark) = stage.check_limit(&key, now_ms).await?;
            if !verdict.allowed {
                self.give_back(&taken).await;
                tracing::debug!(
                    subject_id = %subject_id,
                    endpoint = %endpoint,
                    tier = %tier,
                    stage = stage_name,
                    "request rejected"
                );
                return Ok(verdict);
            }

            remaining = remaining.min(verdict.remaining);
            reset_at_ms = Some(reset_at_ms.map_or(verdict.reset_at_ms, |at| at.min(verdict.reset_at_ms)));
            taken.push((stage, key, mark));
        }

        if let Some(burst) = &stages.burst {
            let key = RateLimitKey::new(subject_id, endpoint, AlgorithmKind::TokenBucket);
            let verdict = burst.check_limit(&key, 1).await?;
            if !verdict.allowed {
                self.give_back(&taken).await;
                tracing::debug!(
                    subject_id = %subject_id,
                    endpoint = %endpoint,
                    tier = %tier,
                    stage = "burst",
                    "request rejected"
                );
                return Ok(verdict);
            }

            remaining = remaining.min(verdict.remaining);
            reset_at_ms = Some(reset_at_ms.map_or(verdict.reset_at_ms, |at| at.min(verdict.reset_at_ms)));
        }

        Ok(AdmissionVerdict::admitted(
            remaining,
            reset_at_ms.unwrap_or(now_ms),
        ))
    }

    async fn give_back(&self, taken: &[(&WindowStage, RateLimitKey, u64)]) {
        for (stage, key, mark) in taken {
            if let Err(err) = stage.release(key, *mark).await {
                tracing::warn!(
                    subject_id = %key.subject_id(),
                    endpoint = %key.endpoint(),
                    error = %err,
                    "failed to release units of a rejected request"
                );
            }
        }
    }

    /// Current usage of every stage, read without consuming anything.
    pub async fn status(
        &self,
        subject_id: &str,
        endpoint: &str,
        tier: Tier,
    ) -> StoreResult<TierStatus> {
        let stages = self.stages(tier);

        let mut windows = [None, None];
        for (slot, (_, stage)) in windows.iter_mut().zip(stages.windows()) {
            if let Some(stage) = stage {
                *slot = Some(stage.snapshot(&stage.key(subject_id, endpoint)).await?);
            }
        }
        let [hourly, per_minute] = windows;

        let burst = match &stages.burst {
            Some(burst) => Some(
                burst
                    .snapshot(&RateLimitKey::new(
                        subject_id,
                        endpoint,
                        AlgorithmKind::TokenBucket,
                    ))
                    .await?,
            ),
            None => None,
        };

        Ok(TierStatus {
            tier,
            limits: stages.limits,
            hourly,
            per_minute,
            burst_tokens: burst.map(|b| b.tokens),
            burst_full_at_ms: burst.map(|b| b.full_at_ms),
        })
    }
}
