//! Simulated point detectors.
//!
//! - [`sim_detector`]: monotone counter, software trigger
//! - [`sim_threaded_detector`]: busy flag polled by a threaded trigger

use mamba_core::{Device, DeviceBuilder, Kind, Signal, SoftTrigger, Status, ThreadedTrigger};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::mode::MockMode;

/// Configuration for [`sim_detector`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimDetectorConfig {
    /// Exposure time in seconds.
    pub exposure: f64,
    pub mode: MockMode,
}

fn increment(counter: &Signal) {
    let next = counter.get().as_i64().unwrap_or(0) + 1;
    counter.update(next);
}

/// Detector whose reading counts acquisitions: 1, 2, 3, …
///
/// Writing 1 to `acquire` starts an exposure; when it ends the counter is
/// incremented and `acquire` drops back to 0.
pub fn sim_detector(name: &str, cfg: SimDetectorConfig) -> Device {
    let device = DeviceBuilder::new(name)
        .readback("value", 0)
        .signal("acquire", 0, Kind::Omitted)
        .signal("acquire_time", cfg.exposure, Kind::Config)
        .trigger(Arc::new(SoftTrigger::new("acquire").with_counter("value")))
        .build();

    if let (Some(acquire), Some(counter), Some(acquire_time)) = (
        device.signal("acquire"),
        device.signal("value"),
        device.signal("acquire_time"),
    ) {
        let mode = cfg.mode;
        acquire.set_put_hook(Arc::new(move |s, v| {
            s.update(v.clone());
            if v.as_i64() != Some(1) {
                return Status::finished();
            }
            let exposure = acquire_time.get().as_f64().unwrap_or(0.0);
            match (mode.delay(exposure), tokio::runtime::Handle::try_current()) {
                (Some(delay), Ok(handle)) => {
                    let counter = counter.clone();
                    let s = s.clone();
                    handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        increment(&counter);
                        s.update(0);
                    });
                }
                _ => {
                    increment(&counter);
                    s.update(0);
                }
            }
            Status::finished()
        }));
    }
    device
}

/// Configuration for [`sim_threaded_detector`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimThreadedDetectorConfig {
    pub exposure: f64,
    /// Seconds the trigger waits for `busy` to clear.
    pub timeout: f64,
    pub poll_ms: u64,
    /// Never clear `busy`; exercises the trigger timeout.
    pub hang: bool,
}

impl Default for SimThreadedDetectorConfig {
    fn default() -> Self {
        Self {
            exposure: 0.01,
            timeout: 5.0,
            poll_ms: 5,
            hang: false,
        }
    }
}

/// Detector driven by a [`ThreadedTrigger`]: `acquire` raises `busy`, which
/// clears after the exposure. Writing 1 to `stop` clears `busy` without
/// producing a count.
pub fn sim_threaded_detector(name: &str, cfg: SimThreadedDetectorConfig) -> Device {
    let trigger = ThreadedTrigger::new("acquire", "busy", "stop")
        .with_poll(Duration::from_millis(cfg.poll_ms.max(1)))
        .with_timeout(Duration::from_secs_f64(cfg.timeout.max(0.0)));
    let device = DeviceBuilder::new(name)
        .readback("value", 0)
        .signal("acquire", 0, Kind::Omitted)
        .signal("busy", 0, Kind::Omitted)
        .signal("stop", 0, Kind::Omitted)
        .signal("acquire_time", cfg.exposure, Kind::Config)
        .trigger(Arc::new(trigger))
        .build();

    if let (Some(acquire), Some(busy), Some(stop), Some(counter), Some(acquire_time)) = (
        device.signal("acquire"),
        device.signal("busy"),
        device.signal("stop"),
        device.signal("value"),
        device.signal("acquire_time"),
    ) {
        let hang = cfg.hang;
        let acq_busy = busy.clone();
        acquire.set_put_hook(Arc::new(move |s, v| {
            s.update(v.clone());
            if v.as_i64() != Some(1) {
                return Status::finished();
            }
            acq_busy.update(1);
            if hang {
                return Status::finished();
            }
            let exposure = acquire_time.get().as_f64().unwrap_or(0.0).max(0.0);
            let busy = acq_busy.clone();
            let counter = counter.clone();
            let acquire = s.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        tokio::time::sleep(Duration::from_secs_f64(exposure)).await;
                        // A stop in the meantime already cleared busy.
                        if busy.get().as_i64() == Some(1) {
                            increment(&counter);
                            busy.update(0);
                        }
                        acquire.update(0);
                    });
                }
                Err(_) => {
                    increment(&counter);
                    busy.update(0);
                    acquire.update(0);
                }
            }
            Status::finished()
        }));

        stop.set_put_hook(Arc::new(move |s, v| {
            s.update(v.clone());
            if v.as_i64() == Some(1) {
                busy.update(0);
            }
            Status::finished()
        }));
    }
    device
}
