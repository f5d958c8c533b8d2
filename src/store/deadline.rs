use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::store::{
    CounterOp,
    CounterStore,
    Expiry,
    OpOutcome,
    StoreError,
    StoreResult,
};

/// Bounds every call to the wrapped store by a fixed timeout.
pub struct DeadlineStore {
    inner: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl DeadlineStore {
    pub fn new(inner: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = StoreResult<T>> + Send) -> StoreResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl CounterStore for DeadlineStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn apply(
        &self,
        key: &str,
        op: &CounterOp,
        now_ms: u64,
        expiry: Expiry,
    ) -> StoreResult<OpOutcome> {
        self.bounded(self.inner.apply(key, op, now_ms, expiry)).await
    }

    async fn inspect(&self, key: &str, op: &CounterOp, now_ms: u64) -> StoreResult<OpOutcome> {
        self.bounded(self.inner.inspect(key, op, now_ms)).await
    }

    async fn bump(
        &self,
        key: &str,
        increments: &[(String, u64)],
        now_ms: u64,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.bounded(self.inner.bump(key, increments, now_ms, ttl))
            .await
    }

    async fn read_fields(&self, key: &str, now_ms: u64) -> StoreResult<HashMap<String, u64>> {
        self.bounded(self.inner.read_fields(key, now_ms)).await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        self.bounded(self.inner.delete(keys)).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.bounded(self.inner.ping()).await
    }
}
