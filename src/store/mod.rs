//! Shared counter store.
//!
//! Every limiter mutates its state through [`CounterStore::apply`], which
//! evaluates one [`CounterOp`] against the current value of a key and commits
//! the result as a single indivisible step. Backends differ only in how they
//! guarantee that atomicity: Redis runs a server-side script, the in-memory
//! store holds a per-key lock across the read and the write.

pub mod deadline;
pub mod in_memory;
pub mod redis_backend;

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store did not respond within {0:?}")]
    Timeout(Duration),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("malformed store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Read-modify-write operations a store can execute atomically.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterOp {
    /// Refill a token bucket for the elapsed time, then take `requested`
    /// tokens if that many are available.
    TakeTokens {
        capacity: f64,
        refill_per_ms: f64,
        requested: f64,
    },
    /// Append `count` timestamps to a log if the entries still inside the
    /// window leave room for them.
    AppendLog {
        window_ms: u64,
        max_entries: u64,
        count: u64,
    },
    /// Add `amount` to a counter unless that would exceed `limit`.
    BoundedIncrement { limit: u64, amount: u64 },
    /// Give back units taken by an earlier increment, saturating at zero.
    /// Never creates the key and keeps its TTL.
    Release { amount: u64 },
    /// Remove up to `count` log entries stamped `at_ms`. Never creates the
    /// key and keeps its TTL.
    RemoveEntries {
        window_ms: u64,
        at_ms: u64,
        count: u64,
    },
}

/// Persisted value of a key.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterState {
    Bucket { tokens: f64, last_refill_ms: u64 },
    Log(VecDeque<u64>),
    Count(u64),
    Fields(HashMap<String, u64>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpOutcome {
    pub admitted: bool,
    /// Post-operation level: tokens left in a bucket, live log entries, or
    /// the counter value.
    pub level: f64,
    /// Oldest live log entry.
    pub oldest_ms: Option<u64>,
    /// When the key expires, if it exists and carries a TTL.
    pub expires_at_ms: Option<u64>,
}

impl OpOutcome {
    pub fn count(&self) -> u64 {
        self.level.max(0.0) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// TTL restarts on every committed write.
    Refresh(Duration),
    /// TTL is set once, when the write creates the key.
    OnCreate(Duration),
}

impl Expiry {
    pub fn ttl(&self) -> Duration {
        match self {
            Self::Refresh(ttl) | Self::OnCreate(ttl) => *ttl,
        }
    }

    pub fn refreshes(&self) -> bool {
        matches!(self, Self::Refresh(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Transition {
    pub admitted: bool,
    pub level: f64,
    pub oldest_ms: Option<u64>,
    /// `None` leaves the stored value untouched.
    pub next: Option<CounterState>,
}

impl CounterOp {
    /// Pure transition function. State of a different shape than the
    /// operation expects is treated as absent.
    pub(crate) fn evaluate(&self, current: Option<&CounterState>, now_ms: u64) -> Transition {
        match self {
            Self::TakeTokens {
                capacity,
                refill_per_ms,
                requested,
            } => {
                let (tokens, last_refill_ms) = match current {
                    Some(CounterState::Bucket {
                        tokens,
                        last_refill_ms,
                    }) => (*tokens, *last_refill_ms),
                    _ => (*capacity, now_ms),
                };

                // A clock running behind the last writer credits nothing.
                let elapsed = now_ms.saturating_sub(last_refill_ms) as f64;
                let tokens = (tokens + elapsed * refill_per_ms).clamp(0.0, *capacity);

                if tokens >= *requested {
                    let left = tokens - requested;
                    Transition {
                        admitted: true,
                        level: left,
                        oldest_ms: None,
                        next: Some(CounterState::Bucket {
                            tokens: left,
                            last_refill_ms: now_ms.max(last_refill_ms),
                        }),
                    }
                } else {
                    Transition {
                        admitted: false,
                        level: tokens,
                        oldest_ms: None,
                        next: None,
                    }
                }
            }
            Self::AppendLog {
                window_ms,
                max_entries,
                count,
            } => {
                let floor = now_ms.saturating_sub(*window_ms);
                let mut live = match current {
                    Some(CounterState::Log(entries)) => entries
                        .iter()
                        .copied()
                        .filter(|ts| *ts >= floor)
                        .collect::<VecDeque<_>>(),
                    _ => VecDeque::new(),
                };

                if live.len() as u64 + count <= *max_entries {
                    for _ in 0..*count {
                        let at = live.partition_point(|ts| *ts <= now_ms);
                        live.insert(at, now_ms);
                    }
                    Transition {
                        admitted: true,
                        level: live.len() as f64,
                        oldest_ms: live.front().copied(),
                        next: (*count > 0).then_some(CounterState::Log(live)),
                    }
                } else {
                    Transition {
                        admitted: false,
                        level: live.len() as f64,
                        oldest_ms: live.front().copied(),
                        next: None,
                    }
                }
            }
            Self::BoundedIncrement { limit, amount } => {
                let value = match current {
                    Some(CounterState::Count(value)) => *value,
                    _ => 0,
                };
                let updated = value.saturating_add(*amount);

                if updated <= *limit {
                    Transition {
                        admitted: true,
                        level: updated as f64,
                        oldest_ms: None,
                        next: (*amount > 0).then_some(CounterState::Count(updated)),
                    }
                } else {
                    Transition {
                        admitted: false,
                        level: value as f64,
                        oldest_ms: None,
                        next: None,
                    }
                }
            }
            Self::Release { amount } => match current {
                Some(CounterState::Count(value)) if *value > 0 => {
                    let updated = value.saturating_sub(*amount);
                    Transition {
                        admitted: true,
                        level: updated as f64,
                        oldest_ms: None,
                        next: Some(CounterState::Count(updated)),
                    }
                }
                _ => Transition {
                    admitted: true,
                    level: 0.0,
                    oldest_ms: None,
                    next: None,
                },
            },
            Self::RemoveEntries {
                window_ms,
                at_ms,
                count,
            } => {
                let Some(CounterState::Log(entries)) = current else {
                    return Transition {
                        admitted: true,
                        level: 0.0,
                        oldest_ms: None,
                        next: None,
                    };
                };

                let floor = now_ms.saturating_sub(*window_ms);
                let mut removed = 0;
                let live = entries
                    .iter()
                    .copied()
                    .filter(|ts| *ts >= floor)
                    .filter(|ts| {
                        if *ts == *at_ms && removed < *count {
                            removed += 1;
                            false
                        } else {
                            true
                        }
                    })
                    .collect::<VecDeque<_>>();

                Transition {
                    admitted: true,
                    level: live.len() as f64,
                    oldest_ms: live.front().copied(),
                    next: (removed > 0).then_some(CounterState::Log(live)),
                }
            }
        }
    }
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Atomically evaluate `op` against `key` and commit the result.
    /// Rejected operations write nothing.
    async fn apply(
        &self,
        key: &str,
        op: &CounterOp,
        now_ms: u64,
        expiry: Expiry,
    ) -> StoreResult<OpOutcome>;

    /// Evaluate `op` against `key` without committing anything.
    async fn inspect(&self, key: &str, op: &CounterOp, now_ms: u64) -> StoreResult<OpOutcome>;

    /// Increment named integer fields of a hash and restart its TTL.
    async fn bump(
        &self,
        key: &str,
        increments: &[(String, u64)],
        now_ms: u64,
        ttl: Duration,
    ) -> StoreResult<()>;

    async fn read_fields(&self, key: &str, now_ms: u64) -> StoreResult<HashMap<String, u64>>;

    /// Remove keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_tokens_initializes_full_bucket() {
        let op = CounterOp::TakeTokens {
            capacity: 5.0,
            refill_per_ms: 0.001,
            requested: 1.0,
        };
        let t = op.evaluate(None, 1_000);
        assert!(t.admitted);
        assert_eq!(t.level, 4.0);
        assert_eq!(
            t.next,
            Some(CounterState::Bucket {
                tokens: 4.0,
                last_refill_ms: 1_000
            })
        );
    }

    #[test]
    fn take_tokens_clamps_backwards_clock() {
        let op = CounterOp::TakeTokens {
            capacity: 5.0,
            refill_per_ms: 1.0,
            requested: 1.0,
        };
        let state = CounterState::Bucket {
            tokens: 2.0,
            last_refill_ms: 10_000,
        };
        let t = op.evaluate(Some(&state), 9_000);
        assert!(t.admitted);
        assert_eq!(t.level, 1.0);
        assert_eq!(
            t.next,
            Some(CounterState::Bucket {
                tokens: 1.0,
                last_refill_ms: 10_000
            })
        );
    }

    #[test]
    fn rejected_operations_leave_state_untouched() {
        let bucket = CounterOp::TakeTokens {
            capacity: 1.0,
            refill_per_ms: 0.0,
            requested: 2.0,
        };
        assert_eq!(bucket.evaluate(None, 0).next, None);

        let log = CounterOp::AppendLog {
            window_ms: 1_000,
            max_entries: 1,
            count: 1,
        };
        let state = CounterState::Log(VecDeque::from([500]));
        let t = log.evaluate(Some(&state), 900);
        assert!(!t.admitted);
        assert_eq!(t.next, None);
        assert_eq!(t.oldest_ms, Some(500));

        let counter = CounterOp::BoundedIncrement {
            limit: 3,
            amount: 2,
        };
        let t = counter.evaluate(Some(&CounterState::Count(2)), 0);
        assert!(!t.admitted);
        assert_eq!(t.level, 2.0);
        assert_eq!(t.next, None);
    }

    #[test]
    fn append_log_drops_expired_entries() {
        let op = CounterOp::AppendLog {
            window_ms: 1_000,
            max_entries: 2,
            count: 1,
        };
        let state = CounterState::Log(VecDeque::from([100, 1_500]));
        let t = op.evaluate(Some(&state), 2_000);
        assert!(t.admitted);
        assert_eq!(t.level, 2.0);
        assert_eq!(t.oldest_ms, Some(1_500));
        assert_eq!(t.next, Some(CounterState::Log(VecDeque::from([1_500, 2_000]))));
    }

    #[test]
    fn release_saturates_and_never_creates() {
        let op = CounterOp::Release { amount: 5 };
        assert_eq!(op.evaluate(None, 0).next, None);
        assert_eq!(
            op.evaluate(Some(&CounterState::Count(3)), 0).next,
            Some(CounterState::Count(0))
        );
    }

    #[test]
    fn remove_entries_drops_only_matching_stamps() {
        let op = CounterOp::RemoveEntries {
            window_ms: 1_000,
            at_ms: 1_500,
            count: 2,
        };
        let state = CounterState::Log(VecDeque::from([1_200, 1_500, 1_500, 1_500, 1_800]));
        let t = op.evaluate(Some(&state), 2_000);
        assert!(t.admitted);
        assert_eq!(t.level, 3.0);
        assert_eq!(t.oldest_ms, Some(1_200));
        assert_eq!(
            t.next,
            Some(CounterState::Log(VecDeque::from([1_200, 1_500, 1_800])))
        );

        let untouched = CounterState::Log(VecDeque::from([1_200]));
        assert_eq!(op.evaluate(Some(&untouched), 2_000).next, None);
        assert_eq!(op.evaluate(None, 2_000).next, None);
    }

    #[test]
    fn mismatched_state_is_treated_as_absent() {
        let op = CounterOp::BoundedIncrement {
            limit: 10,
            amount: 1,
        };
        let t = op.evaluate(Some(&CounterState::Log(VecDeque::from([1]))), 0);
        assert_eq!(t.next, Some(CounterState::Count(1)));
    }
}
