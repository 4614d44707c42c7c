//! Signals: named value cells with ordered subscriptions.
//!
//! A [`Signal`] stores its current [`Reading`] in a `tokio::sync::watch`
//! channel so async code can await changes, and keeps an ordered list of
//! synchronous subscriber callbacks keyed by integer tokens. Timestamps never
//! move backwards.
//!
//! Writes go through [`Signal::put`], which returns a [`Status`]. Simulated
//! or real hardware can intercept writes with a put hook (e.g. an `acquire`
//! signal that starts an exposure); without a hook the value is stored and
//! the status is finished immediately.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::document::DataKey;
use crate::error::StatusError;
use crate::status::Status;
use crate::value::{now_secs, Reading, Value};

/// Controls which aggregate reads include a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Omitted,
    Normal,
    Config,
    Hinted,
}

impl Kind {
    /// Included in `read()` / `describe()`.
    pub fn is_read(&self) -> bool {
        matches!(self, Kind::Normal | Kind::Hinted)
    }

    /// Included in `read_configuration()` / `describe_configuration()`.
    pub fn is_config(&self) -> bool {
        matches!(self, Kind::Config)
    }
}

/// Subscriber callback invoked with every new reading.
pub type SignalCallback = Arc<dyn Fn(&Reading) + Send + Sync>;

/// Intercepts `put`. The hook owns the write: it must call
/// [`Signal::update`] for the value to become visible.
pub type PutHook = Arc<dyn Fn(&Signal, Value) -> Status + Send + Sync>;

struct SignalInner {
    name: String,
    kind: Kind,
    enum_strs: Option<Vec<String>>,
    external: Option<String>,
    reading: watch::Sender<Reading>,
    subscribers: Mutex<Vec<(u64, SignalCallback)>>,
    next_token: AtomicU64,
    put_hook: RwLock<Option<PutHook>>,
}

/// Shared handle to a value cell. Clones refer to the same signal.
#[derive(Clone)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("value", &self.get())
            .finish()
    }
}

impl Signal {
    pub fn new(name: impl Into<String>, initial: impl Into<Value>) -> Self {
        Self::build(name.into(), initial.into(), Kind::Normal, None)
    }

    pub fn with_kind(name: impl Into<String>, initial: impl Into<Value>, kind: Kind) -> Self {
        Self::build(name.into(), initial.into(), kind, None)
    }

    /// Enumeration signal holding an index into `labels`.
    pub fn enumeration(
        name: impl Into<String>,
        index: i64,
        labels: Vec<String>,
        kind: Kind,
    ) -> Self {
        Self::build(name.into(), Value::Int(index), kind, Some(labels))
    }

    /// Signal whose value is a reference to data stored elsewhere (an image
    /// frame id); `describe()` marks it with `external = tag`.
    pub fn external(name: impl Into<String>, initial: impl Into<Value>, tag: &str) -> Self {
        let mut sig = Self::build(name.into(), initial.into(), Kind::Normal, None);
        if let Some(inner) = Arc::get_mut(&mut sig.inner) {
            inner.external = Some(tag.to_string());
        }
        sig
    }

    fn build(name: String, initial: Value, kind: Kind, enum_strs: Option<Vec<String>>) -> Self {
        let (reading, _) = watch::channel(Reading {
            value: initial,
            timestamp: now_secs(),
        });
        Self {
            inner: Arc::new(SignalInner {
                name,
                kind,
                enum_strs,
                external: None,
                reading,
                subscribers: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
                put_hook: RwLock::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub fn enum_strs(&self) -> Option<&[String]> {
        self.inner.enum_strs.as_deref()
    }

    pub fn get(&self) -> Value {
        self.inner.reading.borrow().value.clone()
    }

    pub fn reading(&self) -> Reading {
        self.inner.reading.borrow().clone()
    }

    pub fn timestamp(&self) -> f64 {
        self.inner.reading.borrow().timestamp
    }

    /// Whether two handles refer to the same signal.
    pub fn same(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_put_hook(&self, hook: PutHook) {
        *self.inner.put_hook.write() = Some(hook);
    }

    /// Store a new value and notify subscribers in subscription order.
    pub fn update(&self, value: impl Into<Value>) -> Reading {
        let value = value.into();
        let mut stored = None;
        self.inner.reading.send_modify(|reading| {
            reading.timestamp = now_secs().max(reading.timestamp);
            reading.value = value;
            stored = Some(reading.clone());
        });
        let reading = stored.unwrap_or_else(|| self.reading());

        let callbacks: Vec<SignalCallback> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in callbacks {
            cb(&reading);
        }
        reading
    }

    /// Write a value. Completion is reported through the returned status.
    pub fn put(&self, value: impl Into<Value>) -> Status {
        let value = value.into();
        let hook = self.inner.put_hook.read().clone();
        match hook {
            Some(hook) => hook(self, value),
            None => {
                self.update(value);
                Status::finished()
            }
        }
    }

    /// Write a value and wait for the write to complete.
    pub async fn put_wait(
        &self,
        value: impl Into<Value>,
        timeout: Option<Duration>,
    ) -> Result<(), StatusError> {
        self.put(value).wait(timeout).await
    }

    /// Subscribe to value updates. The returned token releases the
    /// subscription via [`Signal::unsubscribe`].
    pub fn subscribe<F>(&self, cb: F) -> u64
    where
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((token, Arc::new(cb)));
        token
    }

    /// Returns `false` if the token was unknown.
    pub fn unsubscribe(&self, token: u64) -> bool {
        let mut subs = self.inner.subscribers.lock();
        let before = subs.len();
        subs.retain(|(t, _)| *t != token);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Receiver for async change notification.
    pub fn watch(&self) -> watch::Receiver<Reading> {
        self.inner.reading.subscribe()
    }

    pub fn describe(&self) -> DataKey {
        let reading = self.inner.reading.borrow();
        let mut key = DataKey::for_value(&reading.value, &format!("SIM:{}", self.inner.name));
        key.enum_strs = self.inner.enum_strs.clone();
        key.external = self.inner.external.clone();
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotone() {
        let sig = Signal::new("x", 0.0);
        let mut last = sig.timestamp();
        for i in 0..100 {
            let r = sig.update(i as f64);
            assert!(r.timestamp >= last);
            last = r.timestamp;
        }
    }

    #[test]
    fn subscribers_notified_in_order_and_released() {
        let sig = Signal::new("x", 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s1 = seen.clone();
        let t1 = sig.subscribe(move |r| s1.lock().push(("a", r.value.clone())));
        let s2 = seen.clone();
        let _t2 = sig.subscribe(move |r| s2.lock().push(("b", r.value.clone())));

        assert!(sig.put(1).done());
        assert!(sig.unsubscribe(t1));
        assert!(!sig.unsubscribe(t1));
        assert!(sig.put(2).done());

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("a", Value::Int(1)),
                ("b", Value::Int(1)),
                ("b", Value::Int(2))
            ]
        );
    }

    #[test]
    fn put_hook_owns_the_write() {
        let sig = Signal::new("limit", 0.0);
        sig.set_put_hook(Arc::new(|s, v| {
            let clamped = v.as_f64().unwrap_or_default().min(10.0);
            s.update(clamped);
            Status::finished()
        }));
        assert!(sig.put(50.0).success());
        assert_eq!(sig.get(), Value::Float(10.0));
    }

    #[test]
    fn describe_carries_enum_labels() {
        let sig = Signal::enumeration(
            "mode",
            1,
            vec!["single".into(), "multiple".into()],
            Kind::Config,
        );
        let key = sig.describe();
        assert_eq!(key.dtype, "integer");
        let strs = ["single".to_string(), "multiple".to_string()];
        assert_eq!(key.enum_strs.as_deref(), Some(&strs[..]));
    }
}
