//! Data router: fans run documents and monitor documents out to in-process
//! sinks and remote subscribers.
//!
//! ```text
//!                      ┌─────────────────────────────┐
//!  engine ── Document ─►           DataRouter         ├─► LocalCallbacks (file writer, …)
//!  plugins ─ Monitor ──► throttle ─►                  ├─► remote clients (by topic)
//!                      └─────────────────────────────┘
//! ```
//!
//! Remote clients match topics literally, by prefix (`monitor` matches
//! `monitor/position`), or with `*`, which never matches the reserved
//! `__`-prefixed topics. While a run is open, every event sent to remote
//! clients carries `__scan_length` and `__scan_step`.

use crate::protocol::Notification;
use crate::throttle::Throttle;
use mamba_core::{
    Device, DeviceRegistry, Document, EventDoc, LocalCallbacks, MambaError, MambaResult,
    MonitorDoc, Publisher, Signal, StartDoc, StopDoc, Value,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const SCAN_LENGTH: &str = "__scan_length";
pub const SCAN_STEP: &str = "__scan_step";
/// Topic of motor position monitors bound for the duration of a run.
pub const POSITION_TOPIC: &str = "monitor/position";

/// Does subscription `pattern` cover `topic`?
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if topic.starts_with("__") {
        return pattern == topic;
    }
    if pattern == "*" || pattern == topic {
        return true;
    }
    let prefix = pattern.trim_end_matches('/');
    !prefix.is_empty()
        && topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

struct Remote {
    patterns: BTreeSet<String>,
    tx: mpsc::UnboundedSender<Notification>,
}

struct ActiveRun {
    uid: String,
    length: Option<u64>,
    step: u64,
}

struct MonitorBinding {
    signal: Signal,
    token: u64,
}

/// Central fan-out point; share it as `Arc<DataRouter>`.
pub struct DataRouter {
    locals: RwLock<Vec<(String, Arc<dyn LocalCallbacks>)>>,
    remotes: Mutex<HashMap<String, Remote>>,
    run: Mutex<Option<ActiveRun>>,
    throttle: Throttle,
    monitors: Mutex<BTreeMap<(String, String), MonitorBinding>>,
    registry: Option<DeviceRegistry>,
    this: Weak<DataRouter>,
}

impl DataRouter {
    /// Router throttling monitor topics by `monitor_periods`. With a
    /// registry, motors named in a run's `motors`/`fly_motor` metadata get
    /// position monitors for the duration of the run.
    pub fn new(
        monitor_periods: HashMap<String, Duration>,
        registry: Option<DeviceRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<DataRouter>| {
            let weak = this.clone();
            let throttle = Throttle::new(monitor_periods, move |doc| {
                if let Some(router) = weak.upgrade() {
                    router.deliver_monitor(&doc);
                }
            });
            Self {
                locals: RwLock::new(Vec::new()),
                remotes: Mutex::new(HashMap::new()),
                run: Mutex::new(None),
                throttle,
                monitors: Mutex::new(BTreeMap::new()),
                registry,
                this: this.clone(),
            }
        })
    }

    // =========================================================================
    // Local sinks
    // =========================================================================

    pub fn register_local(
        &self,
        name: &str,
        callbacks: Arc<dyn LocalCallbacks>,
    ) -> MambaResult<()> {
        let mut locals = self.locals.write();
        if locals.iter().any(|(n, _)| n == name) {
            return Err(MambaError::Dup(format!("local sink '{}' already registered", name)));
        }
        info!(sink = %name, "local sink registered");
        locals.push((name.to_string(), callbacks));
        Ok(())
    }

    pub fn unregister_local(&self, name: &str) -> bool {
        let mut locals = self.locals.write();
        let before = locals.len();
        locals.retain(|(n, _)| n != name);
        locals.len() != before
    }

    fn each_local(&self, what: &str, f: impl Fn(&dyn LocalCallbacks) -> MambaResult<()>) {
        let locals = self.locals.read().clone();
        for (name, callbacks) in locals {
            if let Err(e) = f(callbacks.as_ref()) {
                warn!(sink = %name, doc = what, error = %e, "local sink failed");
            }
        }
    }

    // =========================================================================
    // Remote subscribers
    // =========================================================================

    /// Add a remote client; notifications for its subscriptions arrive on
    /// the returned channel.
    pub fn attach(&self, client: &str) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.remotes.lock().insert(
            client.to_string(),
            Remote {
                patterns: BTreeSet::new(),
                tx,
            },
        );
        if previous.is_some() {
            warn!(client = %client, "client re-attached, previous channel dropped");
        }
        rx
    }

    pub fn detach(&self, client: &str) {
        if self.remotes.lock().remove(client).is_some() {
            debug!(client = %client, "client detached");
        }
    }

    pub fn subscribe(&self, client: &str, topics: &[String]) -> MambaResult<()> {
        let mut remotes = self.remotes.lock();
        let remote = remotes
            .get_mut(client)
            .ok_or_else(|| MambaError::Key(format!("unknown client '{}'", client)))?;
        remote.patterns.extend(topics.iter().cloned());
        debug!(client = %client, topics = ?topics, "subscribed");
        Ok(())
    }

    pub fn subscribe_all(&self, client: &str) -> MambaResult<()> {
        self.subscribe(client, &["*".to_string()])
    }

    /// Drop the given patterns; an empty list drops every subscription.
    pub fn unsubscribe(&self, client: &str, topics: &[String]) -> MambaResult<()> {
        let mut remotes = self.remotes.lock();
        let remote = remotes
            .get_mut(client)
            .ok_or_else(|| MambaError::Key(format!("unknown client '{}'", client)))?;
        if topics.is_empty() {
            remote.patterns.clear();
        } else {
            for topic in topics {
                remote.patterns.remove(topic);
            }
        }
        Ok(())
    }

    pub fn clients(&self) -> Vec<String> {
        self.remotes.lock().keys().cloned().collect()
    }

    /// Send a notification to every matching remote client.
    pub fn publish(&self, notification: Notification) {
        let mut remotes = self.remotes.lock();
        let mut gone = Vec::new();
        for (client, remote) in remotes.iter() {
            if !remote
                .patterns
                .iter()
                .any(|p| topic_matches(p, &notification.topic))
            {
                continue;
            }
            if remote.tx.send(notification.clone()).is_err() {
                gone.push(client.clone());
            }
        }
        for client in gone {
            debug!(client = %client, "dropping closed client");
            remotes.remove(&client);
        }
    }

    fn publish_document(&self, doc: &Document) {
        match Notification::document(doc) {
            Ok(n) => self.publish(n),
            Err(e) => warn!(doc = doc.name(), error = %e, "document not broadcast"),
        }
    }

    // =========================================================================
    // Documents
    // =========================================================================

    pub fn push(&self, doc: &Document) {
        match doc {
            Document::Start(start) => self.on_start(start, doc),
            Document::Descriptor(desc) => {
                self.each_local("descriptor", |l| l.descriptor(desc));
                self.publish_document(doc);
            }
            Document::Event(event) => self.on_event(event),
            Document::Stop(stop) => self.on_stop(stop, doc),
        }
    }

    fn on_start(&self, start: &StartDoc, doc: &Document) {
        *self.run.lock() = Some(ActiveRun {
            uid: start.uid.clone(),
            length: start.num_points,
            step: 0,
        });
        self.each_local("start", |l| l.scan_start(start));
        self.bind_run_monitors(start);
        let mut n = Notification::new("scan/start")
            .with("run_uid", start.uid.as_str())
            .with("scan_id", start.scan_id)
            .with("plan_name", start.plan_name.as_str());
        if let Some(points) = start.num_points {
            n = n.with("num_points", points);
        }
        self.publish(n);
        self.publish_document(doc);
    }

    fn on_event(&self, event: &EventDoc) {
        self.each_local("event", |l| l.data_update(event));
        let mut annotated = event.clone();
        {
            let mut run = self.run.lock();
            if let Some(run) = run.as_mut().filter(|r| r.uid == event.run_uid) {
                run.step += 1;
                if let Some(length) = run.length {
                    annotated
                        .data
                        .insert(SCAN_LENGTH.to_string(), Value::Int(length as i64));
                }
                annotated
                    .data
                    .insert(SCAN_STEP.to_string(), Value::Int(run.step as i64));
            }
        }
        self.publish_document(&Document::Event(annotated));
    }

    fn on_stop(&self, stop: &StopDoc, doc: &Document) {
        self.each_local("stop", |l| l.scan_end(stop));
        self.release_monitors();
        {
            let mut run = self.run.lock();
            if run.as_ref().is_some_and(|r| r.uid == stop.run_uid) {
                *run = None;
            }
        }
        self.publish(
            Notification::new("scan/stop")
                .with("run_uid", stop.run_uid.as_str())
                .with("exit_status", stop.exit_status.to_string())
                .with("reason", stop.reason.as_str())
                .with("num_events", stop.total_events()),
        );
        self.publish_document(doc);
    }

    /// Step of the open run, for clients polling instead of subscribing.
    pub fn scan_step(&self) -> Option<(u64, Option<u64>)> {
        self.run.lock().as_ref().map(|r| (r.step, r.length))
    }

    // =========================================================================
    // Monitors
    // =========================================================================

    /// Throttled entry point for monitor documents.
    pub fn push_monitor(&self, doc: MonitorDoc) {
        self.throttle.push(doc);
    }

    fn deliver_monitor(&self, doc: &MonitorDoc) {
        self.each_local("monitor", |l| l.monitor(doc));
        self.publish(Notification::monitor(doc));
    }

    /// Push `signal` updates as `topic` monitors until unbound. The
    /// subscription holds the router weakly.
    pub fn bind_monitor(&self, device: &str, topic: &str, signal: &Signal) {
        let key = (device.to_string(), topic.to_string());
        let mut monitors = self.monitors.lock();
        if monitors.contains_key(&key) {
            return;
        }
        let router = self.this.clone();
        let name = signal.name().to_string();
        let owned_topic = topic.to_string();
        let token = signal.subscribe(move |reading| {
            if let Some(router) = router.upgrade() {
                router.push_monitor(MonitorDoc::new(&owned_topic).with_reading(&name, reading));
            }
        });
        debug!(device = %device, topic = %topic, "monitor bound");
        monitors.insert(
            key,
            MonitorBinding {
                signal: signal.clone(),
                token,
            },
        );
    }

    pub fn unbind_monitor(&self, device: &str, topic: &str) -> bool {
        let binding = self
            .monitors
            .lock()
            .remove(&(device.to_string(), topic.to_string()));
        match binding {
            Some(b) => b.signal.unsubscribe(b.token),
            None => false,
        }
    }

    /// Release every monitor subscription.
    pub fn release_monitors(&self) {
        let bindings = std::mem::take(&mut *self.monitors.lock());
        for ((device, topic), b) in bindings {
            if !b.signal.unsubscribe(b.token) {
                warn!(device = %device, topic = %topic, "monitor token already released");
            }
        }
    }

    /// Outstanding (device, topic) monitor bindings.
    pub fn monitor_bindings(&self) -> Vec<(String, String)> {
        self.monitors.lock().keys().cloned().collect()
    }

    fn bind_run_monitors(&self, start: &StartDoc) {
        let Some(registry) = &self.registry else {
            return;
        };
        let mut names: Vec<String> = start
            .md
            .get("motors")
            .and_then(|m| m.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        if let Some(fly) = start.md.get("fly_motor").and_then(|m| m.as_str()) {
            names.push(fly.to_string());
        }
        for name in names {
            let Some(signal) = registry.get(&name).as_ref().and_then(readback) else {
                debug!(motor = %name, "no readback to monitor");
                continue;
            };
            self.bind_monitor(&name, POSITION_TOPIC, &signal);
        }
    }
}

pub(crate) fn readback(device: &Device) -> Option<Signal> {
    device
        .signal("user_readback")
        .or_else(|| device.signal(device.name()))
}

impl Publisher for DataRouter {
    fn push_monitor(&self, doc: MonitorDoc) {
        DataRouter::push_monitor(self, doc);
    }

    fn push_document(&self, doc: &Document) {
        self.push(doc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_skips_reserved_topics() {
        assert!(topic_matches("*", "scan/start"));
        assert!(!topic_matches("*", "__scan_step"));
        assert!(topic_matches("__scan_step", "__scan_step"));
        assert!(topic_matches("monitor", "monitor/position"));
        assert!(topic_matches("monitor/", "monitor/image"));
        assert!(!topic_matches("monitor", "monitors/x"));
        assert!(!topic_matches("doc/event", "doc/stop"));
        assert!(!topic_matches("", "scan/start"));
    }

    #[test]
    fn unknown_clients_cannot_subscribe() {
        let router = DataRouter::new(HashMap::new(), None);
        assert!(router.subscribe("ghost", &["*".into()]).is_err());
        let _rx = router.attach("gui");
        router.subscribe_all("gui").unwrap();
        router.unsubscribe("gui", &[]).unwrap();
    }

    #[test]
    fn closed_clients_are_dropped() {
        let router = DataRouter::new(HashMap::new(), None);
        let rx = router.attach("gui");
        router.subscribe_all("gui").unwrap();
        drop(rx);
        router.publish(Notification::new("scan/progress"));
        assert!(router.clients().is_empty());
    }
}
