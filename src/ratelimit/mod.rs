pub mod fixed_window;
pub mod sliding_window;
pub mod tiered;
pub mod token_bucket;

use std::{
    fmt,
    time::Duration,
};

use serde::{
    Serialize,
    Serializer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "tb",
            Self::SlidingWindow => "sw",
            Self::FixedWindow => "fw",
        }
    }
}

/// Identity of one piece of limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    subject_id: String,
    endpoint: String,
    algorithm: AlgorithmKind,
}

impl RateLimitKey {
    pub fn new(
        subject_id: impl Into<String>,
        endpoint: impl Into<String>,
        algorithm: AlgorithmKind,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            endpoint: endpoint.into(),
            algorithm,
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Store key for this identity; `scope` separates limiters of the same
    /// algorithm that run with different parameters.
    pub fn storage_key(&self, prefix: &str, scope: &str) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            prefix,
            self.algorithm.as_str(),
            scope,
            self.subject_id,
            self.endpoint
        )
    }
}

/// Remaining capacity reported to callers. `Unlimited` orders above every
/// finite value, so `min` picks the tightest constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Remaining {
    Limited(u64),
    Unlimited,
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for Remaining {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u64(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

/// Read-only view of a windowed counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub used: u64,
    pub reset_at_ms: u64,
}

/// Outcome of a single admission check. Built fresh per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub remaining: Remaining,
    pub reset_at_ms: u64,
    /// `None` on admission, and on rejections that can never succeed.
    pub retry_after: Option<Duration>,
    /// Set when the store could not be consulted and the request was let
    /// through.
    pub degraded: bool,
}

impl AdmissionVerdict {
    pub fn admitted(remaining: Remaining, reset_at_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at_ms,
            retry_after: None,
            degraded: false,
        }
    }

    pub fn rejected(reset_at_ms: u64, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            remaining: Remaining::Limited(0),
            reset_at_ms,
            retry_after,
            degraded: false,
        }
    }

    pub fn fail_open(now_ms: u64) -> Self {
        Self {
            allowed: true,
            remaining: Remaining::Unlimited,
            reset_at_ms: now_ms,
            retry_after: None,
            degraded: true,
        }
    }

    /// Whole seconds a client should wait, never below one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after
            .map(|d| d.as_millis().div_ceil(1_000).max(1) as u64)
    }
}
