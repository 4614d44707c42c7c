//! Per-topic coalescing of monitor documents.
//!
//! The first document of a topic opens a window of `monitor_periods[topic]`;
//! documents arriving while it is open are folded into it (later values win
//! key by key) and the result is delivered once when the window closes.
//! Consecutive deliveries of one topic are therefore at least one period
//! apart. Topics without a period pass straight through.
//!
//! ```text
//! push a ──┐         push b
//!          ├── window (p) ──────────┤ deliver a⊕b
//! ```

use mamba_core::MonitorDoc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

type Sink = Arc<dyn Fn(MonitorDoc) + Send + Sync>;

pub struct Throttle {
    periods: HashMap<String, Duration>,
    pending: Arc<Mutex<HashMap<String, MonitorDoc>>>,
    sink: Sink,
}

impl Throttle {
    pub fn new<F>(periods: HashMap<String, Duration>, sink: F) -> Self
    where
        F: Fn(MonitorDoc) + Send + Sync + 'static,
    {
        Self {
            periods,
            pending: Arc::new(Mutex::new(HashMap::new())),
            sink: Arc::new(sink),
        }
    }

    pub fn period(&self, topic: &str) -> Option<Duration> {
        self.periods.get(topic).copied().filter(|p| !p.is_zero())
    }

    /// Topics with an open window.
    pub fn open_windows(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn push(&self, doc: MonitorDoc) {
        let Some(period) = self.period(&doc.topic) else {
            (self.sink)(doc);
            return;
        };
        // Without a runtime there is no timer to close the window.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            (self.sink)(doc);
            return;
        };
        let topic = doc.topic.clone();
        {
            let mut pending = self.pending.lock();
            if let Some(open) = pending.get_mut(&topic) {
                trace!(topic = %topic, "coalesced");
                open.merge(doc);
                return;
            }
            pending.insert(topic.clone(), doc);
        }
        let pending = self.pending.clone();
        let sink = self.sink.clone();
        runtime.spawn(async move {
            tokio::time::sleep(period).await;
            let doc = pending.lock().remove(&topic);
            if let Some(doc) = doc {
                sink(doc);
            }
        });
    }
}
