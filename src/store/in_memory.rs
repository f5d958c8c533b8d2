use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::store::{
    CounterOp,
    CounterState,
    CounterStore,
    Expiry,
    OpOutcome,
    StoreResult,
};

/// Writes between two purges of expired slots.
const PURGE_EVERY: u64 = 1_024;

/// Single-process store. Each key owns a mutex held across the read and the
/// write, which makes every operation atomic per key.
pub struct InMemoryCounterStore {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    writes: AtomicU64,
}

#[derive(Default)]
struct Slot {
    state: Option<CounterState>,
    expires_at_ms: Option<u64>,
}

impl Slot {
    fn live_state(&mut self, now_ms: u64) -> Option<&CounterState> {
        if self.is_expired(now_ms) {
            self.state = None;
            self.expires_at_ms = None;
        }
        self.state.as_ref()
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }

    fn commit(&mut self, next: CounterState, now_ms: u64, expiry: Expiry) {
        let created = self.state.is_none();
        self.state = Some(next);
        if expiry.refreshes() || created || self.expires_at_ms.is_none() {
            self.expires_at_ms = Some(now_ms + expiry.ttl().as_millis() as u64);
        }
    }

    fn outcome(&self, admitted: bool, level: f64, oldest_ms: Option<u64>) -> OpOutcome {
        OpOutcome {
            admitted,
            level,
            oldest_ms,
            expires_at_ms: self.state.as_ref().and(self.expires_at_ms),
        }
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    fn slot_for(&self, key: &str) -> Arc<Mutex<Slot>> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
            .clone()
    }

    fn existing_slot(&self, key: &str) -> Option<Arc<Mutex<Slot>>> {
        self.slots.get(key).map(|slot| slot.clone())
    }

    /// Drops slots that have expired. A slot still referenced by an in-flight
    /// operation is kept so that operation cannot commit into an orphan.
    fn purge_expired(&self, now_ms: u64) {
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(slot) => slot.state.is_some() && !slot.is_expired(now_ms),
                Err(_) => true,
            }
        });
        tracing::debug!(
            before,
            after = self.slots.len(),
            "purged expired in-memory counters"
        );
    }

    fn note_write(&self, now_ms: u64) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_EVERY == 0 {
            self.purge_expired(now_ms);
        }
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn apply(
        &self,
        key: &str,
        op: &CounterOp,
        now_ms: u64,
        expiry: Expiry,
    ) -> StoreResult<OpOutcome> {
        let outcome = {
            let slot = self.slot_for(key);
            let mut slot = slot.lock().await;
            let transition = op.evaluate(slot.live_state(now_ms), now_ms);
            if let Some(next) = transition.next {
                slot.commit(next, now_ms, expiry);
            }
            slot.outcome(transition.admitted, transition.level, transition.oldest_ms)
        };

        self.note_write(now_ms);
        Ok(outcome)
    }

    async fn inspect(&self, key: &str, op: &CounterOp, now_ms: u64) -> StoreResult<OpOutcome> {
        let Some(slot) = self.existing_slot(key) else {
            let transition = op.evaluate(None, now_ms);
            return Ok(Slot::default().outcome(
                transition.admitted,
                transition.level,
                transition.oldest_ms,
            ));
        };

        let mut slot = slot.lock().await;
        let transition = op.evaluate(slot.live_state(now_ms), now_ms);
        Ok(slot.outcome(transition.admitted, transition.level, transition.oldest_ms))
    }

    async fn bump(
        &self,
        key: &str,
        increments: &[(String, u64)],
        now_ms: u64,
        ttl: Duration,
    ) -> StoreResult<()> {
        {
            let slot = self.slot_for(key);
            let mut slot = slot.lock().await;
            let mut fields = match slot.live_state(now_ms) {
                Some(CounterState::Fields(fields)) => fields.clone(),
                _ => HashMap::new(),
            };
            for (field, by) in increments {
                *fields.entry(field.clone()).or_insert(0) += by;
            }
            slot.commit(CounterState::Fields(fields), now_ms, Expiry::Refresh(ttl));
        }

        self.note_write(now_ms);
        Ok(())
    }

    async fn read_fields(&self, key: &str, now_ms: u64) -> StoreResult<HashMap<String, u64>> {
        let Some(slot) = self.existing_slot(key) else {
            return Ok(HashMap::new());
        };
        let mut slot = slot.lock().await;
        match slot.live_state(now_ms) {
            Some(CounterState::Fields(fields)) => Ok(fields.clone()),
            _ => Ok(HashMap::new()),
        }
    }

    /// Clears each slot under its lock and leaves the emptied slot for the
    /// purge, so an operation that already resolved the slot commits into
    /// the live map.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let mut removed = 0;
        for key in keys {
            let Some(slot) = self.existing_slot(key) else {
                continue;
            };
            let mut slot = slot.lock().await;
            if slot.state.take().is_some() {
                removed += 1;
            }
            slot.expires_at_ms = None;
        }
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
