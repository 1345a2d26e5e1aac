use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio::sync::Mutex;

use crate::classifier::RedirectKind;

#[derive(Debug)]
struct Counts {
    appstore: u64,
    playstore: u64,
    last_reset: DateTime<Local>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub appstore: u64,
    pub playstore: u64,
    pub total: u64,
    pub last_reset: DateTime<Local>,
}

/// In-memory redirect counters shared by the listener, backfill and reporter.
/// Every operation takes the lock once, so the pair is never observed half-updated.
#[derive(Clone)]
pub struct CounterStore {
    inner: Arc<Mutex<Counts>>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Counts {
                appstore: 0,
                playstore: 0,
                last_reset: Local::now(),
            })),
        }
    }

    /// Count one redirect and return the new count for that store
    pub async fn increment(&self, kind: RedirectKind) -> u64 {
        let mut counts = self.inner.lock().await;
        let slot = match kind {
            RedirectKind::AppStore => &mut counts.appstore,
            RedirectKind::PlayStore => &mut counts.playstore,
        };
        *slot += 1;
        *slot
    }

    /// Replace both counts as a unit
    pub async fn reset(&self, appstore: u64, playstore: u64) {
        let mut counts = self.inner.lock().await;
        *counts = Counts {
            appstore,
            playstore,
            last_reset: Local::now(),
        };
    }

    pub async fn snapshot(&self) -> Snapshot {
        let counts = self.inner.lock().await;
        Snapshot {
            appstore: counts.appstore,
            playstore: counts.playstore,
            total: counts.appstore + counts.playstore,
            last_reset: counts.last_reset,
        }
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}
