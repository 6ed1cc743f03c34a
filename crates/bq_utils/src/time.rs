use parking_lot::Mutex;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EpochMillis(u128);

impl EpochMillis {
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default(),
        )
    }

    pub fn as_millis(self) -> u128 {
        self.0
    }

    pub fn from_millis(millis: u128) -> Self {
        Self(millis)
    }
}

/// Source of monotonic time for liveness and claim-age decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock(Arc<Mutex<Instant>>);

impl Default for ManualClock {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }

    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock()
    }
}

#[cfg(test)]
mod test {
    use super::{Clock, ManualClock};
    use std::time::Duration;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let shared = clock.shared();
        let before = shared.now();
        clock.advance(Duration::from_secs(3));
        assert_eq!(shared.now() - before, Duration::from_secs(3));
    }
}
