use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;

use crate::{
    clock::Clock,
    store::{
        CounterOp,
        CounterStore,
        Expiry,
        StoreError,
    },
};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("amount must be greater than 0")]
    InvalidAmount,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaVerdict {
    pub allowed: bool,
    pub remaining: u64,
    pub total: u64,
    pub reset_at_ms: u64,
    pub degraded: bool,
}

/// Long-period consumption budgets per `(subject, resource)`.
///
/// A record is created by the first consumption of a period and expires one
/// period later, which is what resets it. The period does not align to
/// calendar months.
pub struct QuotaManager {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    totals: BTreeMap<String, u64>,
    period: Duration,
}

impl QuotaManager {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        totals: BTreeMap<String, u64>,
        period: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.into(),
            totals,
            period,
        }
    }

    fn record_key(&self, subject_id: &str, resource: &str) -> String {
        format!("{}:quota:{}:{}", self.key_prefix, subject_id, resource)
    }

    fn total(&self, resource: &str) -> Result<u64, QuotaError> {
        self.totals
            .get(resource)
            .copied()
            .ok_or_else(|| QuotaError::UnknownResource(resource.to_string()))
    }

    pub async fn check_and_consume(
        &self,
        subject_id: &str,
        resource: &str,
        amount: u64,
    ) -> Result<QuotaVerdict, QuotaError> {
        let total = self.total(resource)?;
        if amount == 0 {
            return Err(QuotaError::InvalidAmount);
        }

        let now_ms = self.clock.now_ms();
        let next_period_ms = now_ms.saturating_add(self.period.as_millis() as u64);

        let outcome = match self
            .store
            .apply(
                &self.record_key(subject_id, resource),
                &CounterOp::BoundedIncrement {
                    limit: total,
                    amount,
                },
                now_ms,
                Expiry::OnCreate(self.period),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    subject_id = %subject_id,
                    resource = %resource,
                    error = %err,
                    "degraded quota check: counter store unavailable, failing open"
                );
                return Ok(QuotaVerdict {
                    allowed: true,
                    remaining: total,
                    total,
                    reset_at_ms: next_period_ms,
                    degraded: true,
                });
            }
        };

        if !outcome.admitted {
            tracing::info!(
                subject_id = %subject_id,
                resource = %resource,
                consumed = outcome.count(),
                requested = amount,
                total,
                "quota exceeded"
            );
        }

        Ok(QuotaVerdict {
            allowed: outcome.admitted,
            remaining: total.saturating_sub(outcome.count()),
            total,
            reset_at_ms: outcome.expires_at_ms.unwrap_or(next_period_ms),
            degraded: false,
        })
    }

    /// Deletes the record of one resource, or of every configured resource
    /// when `resource` is `None`. Returns how many records existed.
    pub async fn reset(&self, subject_id: &str, resource: Option<&str>) -> Result<u64, QuotaError> {
        let keys = match resource {
            Some(resource) => {
                self.total(resource)?;
                vec![self.record_key(subject_id, resource)]
            }
            None => self
                .totals
                .keys()
                .map(|resource| self.record_key(subject_id, resource))
                .collect(),
        };

        let removed = self.store.delete(&keys).await?;
        tracing::info!(
            subject_id = %subject_id,
            resource = resource.unwrap_or("*"),
            removed,
            "quota reset"
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        store::{
            deadline::tests::stalled,
            in_memory::InMemoryCounterStore,
        },
    };

    const T0: u64 = 1_800_000_000_000;
    const DAY_MS: u64 = 86_400_000;

    fn manager_with(store: Arc<dyn CounterStore>) -> (QuotaManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let totals = BTreeMap::from([
            ("api_calls".to_string(), 10_000),
            ("storage_gb".to_string(), 100),
        ]);
        let manager = QuotaManager::new(
            store,
            clock.clone(),
            "test",
            totals,
            Duration::from_secs(30 * 86_400),
        );
        (manager, clock)
    }

    fn manager() -> (QuotaManager, Arc<ManualClock>) {
        manager_with(Arc::new(InMemoryCounterStore::new()))
    }

    #[tokio::test]
    async fn rejection_near_the_limit_consumes_nothing() {
        let (quota, _) = manager();

        let verdict = quota.check_and_consume("cust", "api_calls", 9_999).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 1);

        let verdict = quota.check_and_consume("cust", "api_calls", 2).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 1);
        assert_eq!(verdict.total, 10_000);

        let verdict = quota.check_and_consume("cust", "api_calls", 1).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 0);
    }

    #[tokio::test]
    async fn period_starts_at_first_consumption() {
        let (quota, clock) = manager();

        clock.advance(Duration::from_secs(3_600));
        let first = quota.check_and_consume("cust", "storage_gb", 60).await.unwrap();
        assert_eq!(first.reset_at_ms, T0 + 3_600_000 + 30 * DAY_MS);

        clock.advance(Duration::from_secs(86_400));
        let second = quota.check_and_consume("cust", "storage_gb", 60).await.unwrap();
        assert!(!second.allowed);
        assert_eq!(second.reset_at_ms, first.reset_at_ms);

        clock.set(first.reset_at_ms);
        let renewed = quota.check_and_consume("cust", "storage_gb", 60).await.unwrap();
        assert!(renewed.allowed);
        assert_eq!(renewed.remaining, 40);
        assert_eq!(renewed.reset_at_ms, first.reset_at_ms + 30 * DAY_MS);
    }

    #[tokio::test]
    async fn unknown_resource_and_zero_amount_are_rejected() {
        let (quota, _) = manager();

        let err = quota.check_and_consume("cust", "gpu_hours", 1).await.unwrap_err();
        assert!(matches!(err, QuotaError::UnknownResource(r) if r == "gpu_hours"));

        let err = quota.check_and_consume("cust", "api_calls", 0).await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidAmount));
    }

    #[tokio::test]
    async fn reset_clears_one_or_all_resources() {
        let (quota, _) = manager();

        quota.check_and_consume("cust", "api_calls", 10).await.unwrap();
        quota.check_and_consume("cust", "storage_gb", 10).await.unwrap();

        assert_eq!(quota.reset("cust", Some("api_calls")).await.unwrap(), 1);
        let verdict = quota.check_and_consume("cust", "api_calls", 1).await.unwrap();
        assert_eq!(verdict.remaining, 9_999);

        assert_eq!(quota.reset("cust", None).await.unwrap(), 2);
        let verdict = quota.check_and_consume("cust", "storage_gb", 1).await.unwrap();
        assert_eq!(verdict.remaining, 99);

        assert!(matches!(
            quota.reset("cust", Some("gpu_hours")).await,
            Err(QuotaError::UnknownResource(_))
        ));
    }

    #[tokio::test]
    async fn store_outage_fails_open_but_reset_surfaces_it() {
        let (quota, _) = manager_with(stalled(Duration::from_millis(20)));

        let verdict = quota.check_and_consume("cust", "api_calls", 5).await.unwrap();
        assert!(verdict.allowed);
        assert!(verdict.degraded);

        let err = quota.reset("cust", None).await.unwrap_err();
        assert!(matches!(err, QuotaError::Store(StoreError::Timeout(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_consumption_stops_at_the_total() {
        let (quota, _) = manager();
        let quota = Arc::new(quota);

        // 25 grants of 4 exhaust the 100 GB total exactly.
        let handles = (0..32)
            .map(|_| {
                let quota = quota.clone();
                tokio::spawn(async move {
                    quota.check_and_consume("cust", "storage_gb", 4).await.unwrap()
                })
            })
            .collect::<Vec<_>>();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 25);

        let verdict = quota.check_and_consume("cust", "storage_gb", 1).await.unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
    }
}
