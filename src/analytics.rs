//! Hourly admission rollups.
//!
//! Each `/check` bumps one hash per hour globally and one per subject. The
//! counters are independent of limiter state and are never consulted for
//! admission.

use std::{
    cmp::Reverse,
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;

use crate::{
    clock::Clock,
    ratelimit::tiered::Tier,
    store::{
        CounterStore,
        StoreError,
    },
};

const HOUR_MS: u64 = 3_600_000;
const DEFAULT_SPAN_MS: u64 = 24 * HOUR_MS;
const TOP_ENDPOINTS: usize = 10;

const TOTAL: &str = "total";
const BLOCKED: &str = "blocked";
const ENDPOINT_FIELD: &str = "endpoint:";
const TIER_FIELD: &str = "tier:";

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("start_time must not be after end_time")]
    InvalidRange,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionEvent<'a> {
    pub subject_id: &'a str,
    pub endpoint: &'a str,
    pub tier: Tier,
    pub allowed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
    pub subject_id: Option<String>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub requests: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub start_ms: u64,
    pub end_ms: u64,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub top_endpoints: Vec<EndpointUsage>,
    pub tier_distribution: BTreeMap<String, u64>,
}

pub struct AnalyticsAggregator {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    retention: Duration,
}

impl AnalyticsAggregator {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
        retention: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key_prefix: key_prefix.into(),
            retention,
        }
    }

    fn bucket_key(&self, hour: u64, subject_id: Option<&str>) -> String {
        match subject_id {
            Some(subject_id) => format!("{}:analytics:{}:subject:{}", self.key_prefix, hour, subject_id),
            None => format!("{}:analytics:{}", self.key_prefix, hour),
        }
    }

    /// Counts one admission decision. Failures are logged and dropped.
    pub async fn record(&self, event: AdmissionEvent<'_>) {
        let now_ms = self.clock.now_ms();
        let hour = now_ms / HOUR_MS;

        let mut increments = vec![
            (TOTAL.to_string(), 1),
            (format!("{ENDPOINT_FIELD}{}", event.endpoint), 1),
            (format!("{TIER_FIELD}{}", event.tier), 1),
        ];
        if !event.allowed {
            increments.push((BLOCKED.to_string(), 1));
        }

        for key in [
            self.bucket_key(hour, None),
            self.bucket_key(hour, Some(event.subject_id)),
        ] {
            if let Err(err) = self
                .store
                .bump(&key, &increments, now_ms, self.retention)
                .await
            {
                tracing::debug!(key = %key, error = %err, "failed to record admission analytics");
                return;
            }
        }
    }

    /// Sums the hour buckets overlapping `[start, end]`. Defaults to the
    /// last 24 hours; the range is clamped to the retention window.
    pub async fn usage(&self, query: &UsageQuery) -> Result<UsageReport, AnalyticsError> {
        let now_ms = self.clock.now_ms();
        let end_ms = query.end_ms.unwrap_or(now_ms);
        let start_ms = query
            .start_ms
            .unwrap_or_else(|| end_ms.saturating_sub(DEFAULT_SPAN_MS));
        if start_ms > end_ms {
            return Err(AnalyticsError::InvalidRange);
        }

        let oldest_ms = now_ms.saturating_sub(self.retention.as_millis() as u64);
        let from_hour = start_ms.max(oldest_ms) / HOUR_MS;
        let to_hour = end_ms.min(now_ms) / HOUR_MS;

        let mut total_requests = 0;
        let mut blocked_requests = 0;
        let mut endpoints: HashMap<String, u64> = HashMap::new();
        let mut tier_distribution = BTreeMap::new();

        for hour in from_hour..=to_hour {
            let key = self.bucket_key(hour, query.subject_id.as_deref());
            for (field, count) in self.store.read_fields(&key, now_ms).await? {
                if field == TOTAL {
                    total_requests += count;
                } else if field == BLOCKED {
                    blocked_requests += count;
                } else if let Some(endpoint) = field.strip_prefix(ENDPOINT_FIELD) {
                    *endpoints.entry(endpoint.to_string()).or_default() += count;
                } else if let Some(tier) = field.strip_prefix(TIER_FIELD) {
                    *tier_distribution.entry(tier.to_string()).or_default() += count;
                }
            }
        }

        let mut top_endpoints = endpoints
            .into_iter()
            .map(|(endpoint, requests)| EndpointUsage { endpoint, requests })
            .collect::<Vec<_>>();
        top_endpoints.sort_by(|a, b| {
            (Reverse(a.requests), &a.endpoint).cmp(&(Reverse(b.requests), &b.endpoint))
        });
        top_endpoints.truncate(TOP_ENDPOINTS);

        Ok(UsageReport {
            start_ms,
            end_ms,
            total_requests,
            blocked_requests,
            top_endpoints,
            tier_distribution,
        })
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

    fn aggregator() -> (AnalyticsAggregator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let aggregator = AnalyticsAggregator::new(
            Arc::new(InMemoryCounterStore::new()),
            clock.clone(),
            "test",
            Duration::from_secs(168 * 3_600),
        );
        (aggregator, clock)
    }

    fn event<'a>(subject_id: &'a str, endpoint: &'a str, tier: Tier, allowed: bool) -> AdmissionEvent<'a> {
        AdmissionEvent {
            subject_id,
            endpoint,
            tier,
            allowed,
        }
    }

    #[tokio::test]
    async fn rolls_up_totals_endpoints_and_tiers() {
        let (analytics, clock) = aggregator();

        analytics.record(event("a", "/items", Tier::Free, true)).await;
        analytics.record(event("a", "/items", Tier::Free, false)).await;
        clock.advance(Duration::from_secs(2 * 3_600));
        analytics.record(event("b", "/orders", Tier::Enterprise, true)).await;

        let report = analytics.usage(&UsageQuery::default()).await.unwrap();
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.blocked_requests, 1);
        assert_eq!(
            report.top_endpoints,
            vec![
                EndpointUsage {
                    endpoint: "/items".to_string(),
                    requests: 2
                },
                EndpointUsage {
                    endpoint: "/orders".to_string(),
                    requests: 1
                },
            ]
        );
        assert_eq!(report.tier_distribution.get("free"), Some(&2));
        assert_eq!(report.tier_distribution.get("enterprise"), Some(&1));

        let only_b = analytics
            .usage(&UsageQuery {
                subject_id: Some("b".to_string()),
                ..UsageQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(only_b.total_requests, 1);
        assert_eq!(only_b.blocked_requests, 0);
    }

    #[tokio::test]
    async fn explicit_range_selects_hour_buckets() {
        let (analytics, clock) = aggregator();

        analytics.record(event("a", "/items", Tier::Free, true)).await;
        clock.advance(Duration::from_secs(3 * 3_600));
        analytics.record(event("a", "/items", Tier::Free, true)).await;

        let report = analytics
            .usage(&UsageQuery {
                subject_id: None,
                start_ms: Some(T0 + 3_600_000),
                end_ms: None,
            })
            .await
            .unwrap();
        assert_eq!(report.total_requests, 1);
        assert_eq!(report.end_ms, T0 + 3 * 3_600_000);
    }

    #[tokio::test]
    async fn buckets_past_retention_are_not_counted() {
        let (analytics, clock) = aggregator();

        analytics.record(event("a", "/items", Tier::Free, true)).await;
        clock.advance(Duration::from_secs(200 * 3_600));

        let report = analytics
            .usage(&UsageQuery {
                subject_id: None,
                start_ms: Some(T0),
                end_ms: None,
            })
            .await
            .unwrap();
        assert_eq!(report.total_requests, 0);
    }

    #[tokio::test]
    async fn top_endpoints_are_capped() {
        let (analytics, _) = aggregator();

        for n in 0..12 {
            let endpoint = format!("/e{n:02}");
            for _ in 0..=n {
                analytics.record(event("a", &endpoint, Tier::Free, true)).await;
            }
        }

        let report = analytics.usage(&UsageQuery::default()).await.unwrap();
        assert_eq!(report.top_endpoints.len(), 10);
        assert_eq!(report.top_endpoints[0].endpoint, "/e11");
        assert_eq!(report.top_endpoints[0].requests, 12);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let (analytics, _) = aggregator();
        let err = analytics
            .usage(&UsageQuery {
                subject_id: None,
                start_ms: Some(T0),
                end_ms: Some(T0 - 1),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::InvalidRange));
    }

    #[tokio::test]
    async fn recording_against_an_unavailable_store_is_silent() {
        let analytics = AnalyticsAggregator::new(
            stalled(Duration::from_millis(20)),
            Arc::new(ManualClock::new(T0)),
            "test",
            Duration::from_secs(3_600),
        );
        analytics.record(event("a", "/items", Tier::Free, true)).await;
        assert!(matches!(
            analytics.usage(&UsageQuery::default()).await,
            Err(AnalyticsError::Store(_))
        ));
    }
}
