use std::time::{Duration, Instant};

use crate::model::{Device, Snapshot};

/// Default freshness window for the last device list.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub devices: Vec<Device>,
    pub stored_at: Instant,
    pub fingerprint: String,
}

impl CacheEntry {
    pub fn snapshot(&self, cached: bool) -> Snapshot {
        Snapshot {
            devices: self.devices.clone(),
            fingerprint: self.fingerprint.clone(),
            cached,
        }
    }
}

/// Last successful device list, served without a round-trip while it is younger than `ttl`.
#[derive(Debug)]
pub struct ResponseCache {
    ttl: Duration,
    entry: Option<CacheEntry>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        ResponseCache { ttl, entry: None }
    }

    pub fn is_valid(&self, now: Instant) -> bool {
        self.entry.as_ref().map_or(false, |entry| {
            now.saturating_duration_since(entry.stored_at) < self.ttl
        })
    }

    /// Replace the cached list; the fingerprint is computed once, here.
    pub fn store(&mut self, devices: Vec<Device>, now: Instant) -> &CacheEntry {
        let Snapshot {
            devices,
            fingerprint,
            ..
        } = Snapshot::new(devices);
        self.entry.insert(CacheEntry {
            devices,
            stored_at: now,
            fingerprint,
        })
    }

    /// Last stored entry regardless of age.
    pub fn entry(&self) -> Option<&CacheEntry> {
        self.entry.as_ref()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }
}
