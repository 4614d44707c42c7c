//! Acquisition trigger strategies.
//!
//! A strategy decides how one acquisition of a detector starts and when it is
//! complete. It is attached to a device by [`crate::DeviceBuilder::trigger`]
//! and addresses the device's signals by dotted path, so the same strategy
//! works for any device that exposes the expected children.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::device::Device;
use crate::error::{ErrorKind, StatusError};
use crate::signal::Signal;
use crate::status::{Status, StatusState};
use crate::value::Value;

/// How a single acquisition is initiated and declared complete.
pub trait TriggerStrategy: Send + Sync {
    /// Begin one acquisition on `device`.
    fn trigger(&self, device: &Device) -> Status;

    /// Interrupt a running acquisition. Its status fails with
    /// [`ErrorKind::Abort`].
    fn stop(&self, device: &Device);
}

fn missing(device: &Device, path: &str) -> Status {
    Status::failed(StatusError::new(
        ErrorKind::Key,
        format!("{} has no signal '{}'", device.name(), path),
    ))
}

/// Propagate a failed write into the acquisition status.
fn forward_failure(write: &Status, status: &Status) {
    let status = status.clone();
    write.add_callback(move |state| {
        if let StatusState::Failed(e) = state {
            status.set_exception(e.clone());
        }
    });
}

// =============================================================================
// SoftTrigger
// =============================================================================

/// Software-gated trigger: write 1 to `acquire`; complete when `counter`
/// changes or `acquire` falls back from 1 to 0, whichever happens first.
pub struct SoftTrigger {
    acquire: String,
    counter: Option<String>,
    active: Mutex<Option<Status>>,
}

impl SoftTrigger {
    pub fn new(acquire: &str) -> Self {
        Self {
            acquire: acquire.to_string(),
            counter: None,
            active: Mutex::new(None),
        }
    }

    /// Also complete on a change of this counter signal.
    pub fn with_counter(mut self, counter: &str) -> Self {
        self.counter = Some(counter.to_string());
        self
    }
}

impl TriggerStrategy for SoftTrigger {
    fn trigger(&self, device: &Device) -> Status {
        let Some(acquire) = device.signal(&self.acquire) else {
            return missing(device, &self.acquire);
        };
        let counter = match &self.counter {
            Some(path) => match device.signal(path) {
                Some(sig) => Some(sig),
                None => return missing(device, path),
            },
            None => None,
        };

        let status = Status::new();
        let mut tokens: Vec<(Signal, u64)> = Vec::new();

        // Subscribe before writing so a synchronous completion is not missed.
        if let Some(counter) = counter {
            let initial = counter.get();
            let st = status.clone();
            let token = counter.subscribe(move |reading| {
                if reading.value != initial {
                    st.set_finished();
                }
            });
            tokens.push((counter, token));
        }

        let armed = Arc::new(AtomicBool::new(false));
        let st = status.clone();
        let token = acquire.subscribe(move |reading| match reading.value.as_i64() {
            Some(1) => armed.store(true, Ordering::SeqCst),
            Some(0) if armed.load(Ordering::SeqCst) => {
                st.set_finished();
            }
            _ => {}
        });
        tokens.push((acquire.clone(), token));

        status.add_callback(move |_| {
            for (sig, token) in tokens {
                sig.unsubscribe(token);
            }
        });

        *self.active.lock() = Some(status.clone());
        debug!(device = %device.name(), "soft trigger");
        forward_failure(&acquire.put(1), &status);
        status
    }

    fn stop(&self, device: &Device) {
        if let Some(status) = self.active.lock().take() {
            if status.set_exception(StatusError::new(ErrorKind::Abort, "acquisition stopped")) {
                if let Some(acquire) = device.signal(&self.acquire) {
                    acquire.put(0);
                }
            }
        }
    }
}

// =============================================================================
// ThreadedTrigger
// =============================================================================

/// Start an acquisition, then poll a busy flag in a background task until it
/// clears. If it does not clear within `timeout`, a stop command is written
/// and the status fails with a timeout.
pub struct ThreadedTrigger {
    acquire: String,
    busy: String,
    stop: String,
    poll: Duration,
    timeout: Duration,
    active: Mutex<Option<Status>>,
}

impl ThreadedTrigger {
    pub fn new(acquire: &str, busy: &str, stop: &str) -> Self {
        Self {
            acquire: acquire.to_string(),
            busy: busy.to_string(),
            stop: stop.to_string(),
            poll: Duration::from_millis(10),
            timeout: Duration::from_secs(10),
            active: Mutex::new(None),
        }
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn is_busy(value: &Value) -> bool {
    value.as_bool().unwrap_or(false)
}

impl TriggerStrategy for ThreadedTrigger {
    fn trigger(&self, device: &Device) -> Status {
        let (Some(acquire), Some(busy), Some(stop)) = (
            device.signal(&self.acquire),
            device.signal(&self.busy),
            device.signal(&self.stop),
        ) else {
            return missing(device, &format!("{}|{}|{}", self.acquire, self.busy, self.stop));
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                return Status::failed(StatusError::hardware(
                    "threaded trigger requires an async runtime",
                ))
            }
        };

        let status = Status::new();
        *self.active.lock() = Some(status.clone());
        forward_failure(&acquire.put(1), &status);

        let st = status.clone();
        let poll = self.poll;
        let timeout = self.timeout;
        let name = device.name().to_string();
        handle.spawn(async move {
            let deadline = Instant::now() + timeout;
            loop {
                if st.done() {
                    return;
                }
                if !is_busy(&busy.get()) {
                    st.set_finished();
                    return;
                }
                if Instant::now() >= deadline {
                    warn!(device = %name, ?timeout, "busy flag did not clear, stopping");
                    stop.put(1);
                    st.set_exception(StatusError::timeout(format!(
                        "{} still busy after {:?}",
                        name, timeout
                    )));
                    return;
                }
                tokio::time::sleep(poll).await;
            }
        });
        status
    }

    fn stop(&self, device: &Device) {
        if let Some(status) = self.active.lock().take() {
            if status.set_exception(StatusError::new(ErrorKind::Abort, "acquisition stopped")) {
                if let Some(stop) = device.signal(&self.stop) {
                    stop.put(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBuilder;
    use crate::signal::Kind;

    fn counting_detector(strategy: Arc<dyn TriggerStrategy>) -> Device {
        let det = DeviceBuilder::new("det")
            .readback("counter", 0)
            .signal("acquire", 0, Kind::Omitted)
            .trigger(strategy)
            .build();
        let counter = det.signal("counter").unwrap();
        det.signal("acquire").unwrap().set_put_hook(Arc::new(move |s, v| {
            s.update(v.clone());
            if v.as_i64() == Some(1) {
                let next = counter.get().as_i64().unwrap_or(0) + 1;
                counter.update(next);
            }
            Status::finished()
        }));
        det
    }

    #[test]
    fn soft_trigger_completes_on_counter_change() {
        let det = counting_detector(Arc::new(SoftTrigger::new("acquire").with_counter("counter")));
        let status = det.trigger();
        assert!(status.success());
        assert_eq!(det.signal("counter").unwrap().get(), Value::Int(1));
        // Subscriptions are released once the acquisition completes.
        assert_eq!(det.signal("counter").unwrap().subscriber_count(), 0);
        assert_eq!(det.signal("acquire").unwrap().subscriber_count(), 0);
    }

    #[test]
    fn soft_trigger_completes_on_acquire_falling_edge() {
        let det = DeviceBuilder::new("det")
            .signal("acquire", 0, Kind::Omitted)
            .trigger(Arc::new(SoftTrigger::new("acquire")))
            .build();
        let status = det.trigger();
        assert!(!status.done());
        det.signal("acquire").unwrap().update(0);
        assert!(status.success());
    }

    #[test]
    fn soft_trigger_reports_missing_signal() {
        let det = DeviceBuilder::new("det")
            .trigger(Arc::new(SoftTrigger::new("acquire")))
            .build();
        match det.trigger().state() {
            StatusState::Failed(e) => assert_eq!(e.kind, ErrorKind::Key),
            other => panic!("unexpected {:?}", other),
        }
    }

    fn busy_device(strategy: Arc<dyn TriggerStrategy>) -> Device {
        DeviceBuilder::new("tdet")
            .signal("acquire", 0, Kind::Omitted)
            .signal("busy", 0, Kind::Omitted)
            .signal("stop", 0, Kind::Omitted)
            .trigger(strategy)
            .build()
    }

    #[tokio::test]
    async fn threaded_trigger_waits_for_busy_to_clear() {
        let det = busy_device(Arc::new(
            ThreadedTrigger::new("acquire", "busy", "stop").with_poll(Duration::from_millis(1)),
        ));
        let busy = det.signal("busy").unwrap();
        busy.update(1);
        let status = det.trigger();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!status.done());
        busy.update(0);
        status.wait(Some(Duration::from_secs(1))).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn threaded_trigger_times_out_and_stops() {
        let det = busy_device(Arc::new(
            ThreadedTrigger::new("acquire", "busy", "stop")
                .with_poll(Duration::from_millis(10))
                .with_timeout(Duration::from_millis(100)),
        ));
        det.signal("busy").unwrap().update(1);
        let err = det.trigger().wait(None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert_eq!(det.signal("stop").unwrap().get(), Value::Int(1));
    }

    #[tokio::test]
    async fn stopping_fails_the_running_acquisition() {
        let det = busy_device(Arc::new(ThreadedTrigger::new("acquire", "busy", "stop")));
        det.signal("busy").unwrap().update(1);
        let status = det.trigger();
        det.stop().await.unwrap();
        let err = status.wait(None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Abort);
        assert_eq!(det.signal("stop").unwrap().get(), Value::Int(1));
    }
}
