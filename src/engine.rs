use std::sync::Arc;

use anyhow::Context;

use crate::{
    analytics::AnalyticsAggregator,
    clock::{
        Clock,
        SystemClock,
    },
    config::{
        EngineConfig,
        StoreConfig,
    },
    quota::QuotaManager,
    ratelimit::tiered::TieredRateLimiter,
    store::{
        CounterStore,
        deadline::DeadlineStore,
        in_memory::InMemoryCounterStore,
        redis_backend::RedisCounterStore,
    },
};

/// Everything a request handler needs, built once at startup. All
/// components share one store handle.
pub struct Engine {
    pub store: Arc<dyn CounterStore>,
    pub limiter: TieredRateLimiter,
    pub quota: QuotaManager,
    pub analytics: AnalyticsAggregator,
}

impl Engine {
    pub async fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn CounterStore> = match &config.store {
            StoreConfig::InMemory => Arc::new(InMemoryCounterStore::new()),
            StoreConfig::Redis { url } => Arc::new(
                RedisCounterStore::connect(url)
                    .await
                    .context("failed to connect to redis")?,
            ),
        };

        tracing::info!(
            backend = store.name(),
            timeout_ms = config.backend_timeout.as_millis() as u64,
            algorithm = ?config.window_algorithm,
            "counter store ready"
        );

        Ok(Self::with_store(config, store, Arc::new(SystemClock)))
    }

    pub fn with_store(
        config: &EngineConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store: Arc<dyn CounterStore> =
            Arc::new(DeadlineStore::new(store, config.backend_timeout));

        let limiter = TieredRateLimiter::new(
            store.clone(),
            clock.clone(),
            &config.key_prefix,
            &config.tiers,
            config.window_algorithm,
        );
        let quota = QuotaManager::new(
            store.clone(),
            clock.clone(),
            config.key_prefix.clone(),
            config.quota.totals.clone(),
            config.quota.period,
        );
        let analytics = AnalyticsAggregator::new(
            store.clone(),
            clock,
            config.key_prefix.clone(),
            config.analytics_retention,
        );

        Self {
            store,
            limiter,
            quota,
            analytics,
        }
    }
}
