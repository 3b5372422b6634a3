//! Scheduling of device polls.
//!
//! The coordinator calls its [`DeviceSource`] once per tick and stretches the delay between
//! ticks while the fingerprint of the returned snapshot stays the same. Any change snaps the
//! delay back to the base interval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::api::{Error, MarstekApi};
use crate::model::{Device, Snapshot};

pub const MIN_SCAN_INTERVAL: u64 = 10;
pub const MAX_SCAN_INTERVAL: u64 = 3600;
pub const DEFAULT_SCAN_INTERVAL: u64 = 60;
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(300);

/// Unchanged ticks tolerated before the interval starts to grow.
const NO_CHANGE_THRESHOLD: u32 = 3;
const GROWTH_FACTOR: f64 = 1.5;
const MAX_GROWTH_EXPONENT: u32 = 64;

/// Where the coordinator gets its devices from.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn get_devices(&self) -> Result<Snapshot, Error>;

    /// Called whenever the base interval changes, so cached data never outlives a poll.
    async fn set_cache_ttl(&self, ttl: Duration);
}

#[async_trait]
impl DeviceSource for MarstekApi {
    async fn get_devices(&self) -> Result<Snapshot, Error> {
        MarstekApi::get_devices(self).await
    }

    async fn set_cache_ttl(&self, ttl: Duration) {
        MarstekApi::set_cache_ttl(self, ttl).await
    }
}

pub fn is_valid_scan_interval(seconds: u64) -> bool {
    (MIN_SCAN_INTERVAL..=MAX_SCAN_INTERVAL).contains(&seconds)
}

/// Polling delay after `no_change` consecutive unchanged ticks, within `[base, max(base, max)]`.
pub fn adaptive_interval(base: Duration, max: Duration, no_change: u32) -> Duration {
    let upper = max.max(base);
    if no_change <= NO_CHANGE_THRESHOLD {
        return base;
    }

    let exponent = (no_change - NO_CHANGE_THRESHOLD).min(MAX_GROWTH_EXPONENT);
    let seconds = base.as_secs_f64() * GROWTH_FACTOR.powi(exponent as i32);
    if !seconds.is_finite() {
        return upper;
    }
    Duration::from_secs_f64(seconds.min(upper.as_secs_f64())).max(base)
}

/// What the presentation layer gets to see.
#[derive(Debug, Clone)]
pub struct Status {
    pub devices: Vec<Device>,
    pub last_update_success: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<f64>,
    pub last_error: Option<Error>,
    pub interval: Duration,
    pub no_change_count: u32,
}

struct State {
    base_interval: Duration,
    interval: Duration,
    no_change_count: u32,
    last_fingerprint: Option<String>,
    devices: Vec<Device>,
    last_update_success: bool,
    last_success: Option<DateTime<Utc>>,
    last_latency_ms: Option<f64>,
    last_error: Option<Error>,
}

pub struct Coordinator<S> {
    source: S,
    max_interval: Duration,
    state: Mutex<State>,
}

impl<S: DeviceSource> Coordinator<S> {
    /// `scan_interval` outside `[10, 3600]` seconds is logged and replaced with the default.
    pub fn new(source: S, scan_interval: u64) -> Self {
        let scan_interval = if is_valid_scan_interval(scan_interval) {
            scan_interval
        } else {
            log::warn!(
                "Invalid scan interval {}, must be between {} and {} seconds; using {}",
                scan_interval,
                MIN_SCAN_INTERVAL,
                MAX_SCAN_INTERVAL,
                DEFAULT_SCAN_INTERVAL
            );
            DEFAULT_SCAN_INTERVAL
        };
        let base_interval = Duration::from_secs(scan_interval);

        Coordinator {
            source,
            max_interval: DEFAULT_MAX_INTERVAL,
            state: Mutex::new(State {
                base_interval,
                interval: base_interval,
                no_change_count: 0,
                last_fingerprint: None,
                devices: Vec::new(),
                last_update_success: false,
                last_success: None,
                last_latency_ms: None,
                last_error: None,
            }),
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Delay until the next tick.
    pub fn interval(&self) -> Duration {
        self.state().interval
    }

    pub fn base_interval(&self) -> Duration {
        self.state().base_interval
    }

    pub fn status(&self) -> Status {
        let state = self.state();
        Status {
            devices: state.devices.clone(),
            last_update_success: state.last_update_success,
            last_success: state.last_success,
            last_latency_ms: state.last_latency_ms,
            last_error: state.last_error.clone(),
            interval: state.interval,
            no_change_count: state.no_change_count,
        }
    }

    /// One poll. On failure the previous devices stay in place and the error is recorded as
    /// well as returned.
    pub async fn refresh(&self) -> Result<(), Error> {
        let start = Instant::now();
        let result = self.source.get_devices().await;
        let latency_ms = (start.elapsed().as_secs_f64() * 10_000.0).round() / 10.0;

        let mut state = self.state();
        match result {
            Ok(snapshot) => {
                log::debug!(
                    "Fetched {} devices in {:.1} ms{}",
                    snapshot.devices.len(),
                    latency_ms,
                    if snapshot.cached { " (cached)" } else { "" }
                );
                self.track_changes(&mut state, &snapshot.fingerprint);
                state.devices = snapshot.devices;
                state.last_latency_ms = Some(latency_ms);
                state.last_success = Some(Utc::now());
                state.last_update_success = true;
                state.last_error = None;
                Ok(())
            }
            Err(error) => {
                match error {
                    Error::Permission(_) => log::warn!("Permission error, will retry later: {}", error),
                    _ => log::error!("Update failed: {}", error),
                }
                state.last_update_success = false;
                state.last_error = Some(error.clone());
                Err(error)
            }
        }
    }

    fn track_changes(&self, state: &mut State, fingerprint: &str) {
        match state.last_fingerprint.as_deref() {
            Some(previous) if previous == fingerprint => {
                state.no_change_count = state.no_change_count.saturating_add(1);
            }
            Some(_) => {
                if state.no_change_count > 0 {
                    log::debug!(
                        "Data changed, reset to base interval: {} seconds",
                        state.base_interval.as_secs()
                    );
                }
                state.no_change_count = 0;
            }
            None => {}
        }
        state.last_fingerprint = Some(fingerprint.to_owned());

        let interval = adaptive_interval(state.base_interval, self.max_interval, state.no_change_count);
        if interval != state.interval {
            log::debug!(
                "Adaptive interval: {:.0} seconds (no changes: {})",
                interval.as_secs_f64(),
                state.no_change_count
            );
            state.interval = interval;
        }
    }

    /// Change the base interval. Values outside `[10, 3600]` seconds are logged and ignored.
    /// Returns whether the value was accepted.
    pub async fn update_scan_interval(&self, seconds: u64) -> bool {
        if !is_valid_scan_interval(seconds) {
            log::warn!(
                "Invalid scan interval {}, must be between {} and {} seconds",
                seconds,
                MIN_SCAN_INTERVAL,
                MAX_SCAN_INTERVAL
            );
            return false;
        }

        let base = Duration::from_secs(seconds);
        {
            let mut state = self.state();
            state.base_interval = base;
            state.interval = adaptive_interval(base, self.max_interval, state.no_change_count);
        }
        self.source.set_cache_ttl(base).await;
        log::info!("Scan interval updated to {} seconds", seconds);
        true
    }

    /// Poll forever. Dropping the future (or aborting its task) stops polling; the API client
    /// only commits state after complete responses.
    pub async fn run(&self) {
        let base = self.base_interval();
        self.source.set_cache_ttl(base).await;
        loop {
            /* failures are logged and recorded by `refresh` */
            let _ = self.refresh().await;
            tokio::time::sleep(self.interval()).await;
        }
    }
}
