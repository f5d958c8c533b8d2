use std::time::{
    SystemTime,
    UNIX_EPOCH,
};

/// Wall-clock source for every time-dependent decision, in Unix milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use std::{
        sync::atomic::{
            AtomicU64,
            Ordering,
        },
        time::Duration,
    };

    use super::Clock;

    #[derive(Debug)]
    pub struct ManualClock {
        now_ms: AtomicU64,
    }

    impl ManualClock {
        pub fn new(now_ms: u64) -> Self {
            Self {
                now_ms: AtomicU64::new(now_ms),
            }
        }

        pub fn advance(&self, by: Duration) {
            self.now_ms
                .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }

        pub fn set(&self, now_ms: u64) {
            self.now_ms.store(now_ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }
}
