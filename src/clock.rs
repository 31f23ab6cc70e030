//! Wall-clock source, injected so expiry logic stays deterministic under test.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::types::UnixTimestamp;

/// Source of the current Unix time.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimestamp;
}

/// Production clock backed by [`SystemTime`].
///
/// A pre-epoch system clock collapses to 0 rather than panicking; everything built
/// on top treats such credentials as expired.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimestamp {
        let secs = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        UnixTimestamp(secs)
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn at(seconds: u64) -> Arc<Self> {
        Arc::new(ManualClock(AtomicU64::new(seconds)))
    }

    pub fn advance(&self, seconds: u64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimestamp {
        UnixTimestamp(self.0.load(Ordering::SeqCst))
    }
}
