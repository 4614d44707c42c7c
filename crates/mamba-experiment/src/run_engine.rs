//! RunEngine - executes plans and emits documents.
//!
//! The engine pulls [`Msg`]s from a plan one at a time on a single task,
//! drives devices, and hands every document to the callback bundle in list
//! order. Control requests (pause, resume, abort) arrive through an
//! [`EngineHandle`] from other tasks.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   run()   ┌─────────┐  pause at checkpoint  ┌────────┐
//! │ Idle │──────────▶│ Running │──────────────────────▶│ Paused │
//! └──────┘           └────┬────┘◀──────resume()───────└───┬────┘
//!    ▲                    │ plan done / error / abort()    │ abort()
//!    │                    ▼                                ▼
//!    │               ┌─────────┐                    ┌──────────┐
//!    └───────────────│ Cleanup │◀───────────────────│ Aborting │
//!                    └─────────┘                    └──────────┘
//! ```
//!
//! Cleanup stops devices with operations in flight, runs the cleanups the
//! plan registered (newest first), unstages every device the run staged
//! (reverse order) and closes an open run with the matching `stop` document.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = RunEngine::new();
//! let handle = engine.handle();
//! tokio::spawn(async move {
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     handle.request_pause().ok();
//! });
//! let stop = engine.run(plan, &mut callbacks, Metadata::new()).await?;
//! ```

use mamba_core::{
    configure, now_secs, Component, DescriptorDoc, Device, Document, DocumentCallback, ErrorKind,
    EventDoc, ExitStatus, MambaError, MambaResult, Metadata, MonitorDoc, NullPublisher, Publisher,
    Reading, StartDoc, Status, StopDoc,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::plan::{Cleanup, Msg, Plan, RunMetadata};
use crate::plans::PRIMARY;

/// Bound on each wait inside a cleanup; aborts do not interrupt cleanups.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No plan running, ready to accept new plans
    Idle,
    /// Executing a plan
    Running,
    /// Paused at a checkpoint, can resume or abort
    Paused,
    /// Abort requested, waiting for the plan to reach a suspension point
    Aborting,
    /// Stopping devices, unstaging and closing the run
    Cleanup,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
            EngineState::Aborting => write!(f, "aborting"),
            EngineState::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// The most recent run failure, reported by the next `scan/*` request.
#[derive(Debug, Clone, PartialEq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub type_name: String,
    pub message: String,
}

struct EngineShared {
    state: watch::Sender<EngineState>,
    /// `Some(reason)` once an abort was requested for the current run.
    abort: watch::Sender<Option<String>>,
    pause_requested: AtomicBool,
    busy: AtomicBool,
    scan_id: AtomicU64,
    last_error: Mutex<Option<LastError>>,
    publisher: Arc<dyn Publisher>,
}

/// Control surface of a [`RunEngine`], cheap to clone into other tasks.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    /// Pause at the next checkpoint (immediately if one is pending).
    pub fn request_pause(&self) -> MambaResult<()> {
        match self.state() {
            EngineState::Running => {
                info!("pause requested");
                self.shared.pause_requested.store(true, Ordering::SeqCst);
                Ok(())
            }
            EngineState::Paused => Err(MambaError::Dup("engine is already paused".into())),
            other => Err(MambaError::Empty(format!("cannot pause: engine is {}", other))),
        }
    }

    /// Resume a paused run, or cancel a pause that has not taken effect.
    pub fn resume(&self) -> MambaResult<()> {
        match self.state() {
            EngineState::Paused => {
                info!("resuming from pause");
                self.shared.pause_requested.store(false, Ordering::SeqCst);
                self.shared.state.send_replace(EngineState::Running);
                Ok(())
            }
            EngineState::Running if self.shared.pause_requested.swap(false, Ordering::SeqCst) => {
                info!("pending pause cancelled");
                Ok(())
            }
            other => Err(MambaError::Dup(format!("cannot resume: engine is {}", other))),
        }
    }

    /// Abort the current run. Honored at the next suspension point or
    /// message.
    pub fn abort(&self, reason: &str) -> MambaResult<()> {
        match self.state() {
            EngineState::Running | EngineState::Paused => {
                info!(reason = %reason, "abort requested");
                self.shared.abort.send_replace(Some(reason.to_string()));
                self.shared.state.send_replace(EngineState::Aborting);
                Ok(())
            }
            EngineState::Aborting => Err(MambaError::Dup("abort already in progress".into())),
            other => Err(MambaError::Empty(format!("cannot abort: engine is {}", other))),
        }
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.shared.last_error.lock().clone()
    }

    /// Return and forget the most recent failure.
    pub fn take_last_error(&self) -> Option<LastError> {
        self.shared.last_error.lock().take()
    }

    /// Scan id of the most recently opened run.
    pub fn scan_id(&self) -> u64 {
        self.shared.scan_id.load(Ordering::SeqCst)
    }
}

/// One event stream of the open run.
struct Stream {
    descriptor_uid: String,
    keys: Vec<String>,
    seq_num: u64,
}

struct OpenRun {
    uid: String,
    streams: HashMap<String, Stream>,
    num_events: BTreeMap<String, u64>,
}

/// Readings collected between `create` and `save`.
struct Bundle {
    stream: String,
    readings: BTreeMap<String, Reading>,
    objects: Vec<Component>,
}

/// In-flight state of one `run()` call.
struct RunContext {
    md: Metadata,
    run: Option<OpenRun>,
    bundle: Option<Bundle>,
    groups: HashMap<String, Vec<Status>>,
    inflight: Vec<(Device, Status)>,
    staged: Vec<Device>,
    cleanups: Vec<Cleanup>,
    checkpoint_pending: bool,
    final_stop: Option<StopDoc>,
    last_time: f64,
}

impl RunContext {
    fn new(md: Metadata) -> Self {
        Self {
            md,
            run: None,
            bundle: None,
            groups: HashMap::new(),
            inflight: Vec::new(),
            staged: Vec::new(),
            cleanups: Vec::new(),
            checkpoint_pending: false,
            final_stop: None,
            last_time: 0.0,
        }
    }

    /// Document time, strictly increasing within the run.
    fn next_time(&mut self) -> f64 {
        let now = now_secs();
        self.last_time = if now > self.last_time {
            now
        } else {
            self.last_time + 1e-6
        };
        self.last_time
    }

    fn join(&mut self, group: Option<&str>, status: Status) {
        if let Some(group) = group {
            self.groups.entry(group.to_string()).or_default().push(status);
        }
    }

    fn open_run(&mut self) -> MambaResult<&mut OpenRun> {
        self.run
            .as_mut()
            .ok_or_else(|| MambaError::Protocol("no open run".into()))
    }
}

/// Executes plans. Clones share the same engine.
#[derive(Clone)]
pub struct RunEngine {
    shared: Arc<EngineShared>,
}

impl Default for RunEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunEngine {
    pub fn new() -> Self {
        Self::with_publisher(Arc::new(NullPublisher))
    }

    /// Engine that announces pause/resume/abort on `publisher`.
    pub fn with_publisher(publisher: Arc<dyn Publisher>) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let (abort, _) = watch::channel(None);
        Self {
            shared: Arc::new(EngineShared {
                state,
                abort,
                pause_requested: AtomicBool::new(false),
                busy: AtomicBool::new(false),
                scan_id: AtomicU64::new(0),
                last_error: Mutex::new(None),
                publisher,
            }),
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    fn set_state(&self, state: EngineState) {
        debug!(state = %state, "engine state");
        self.shared.state.send_replace(state);
    }

    /// Execute `plan`, handing every document to `callbacks`.
    ///
    /// Returns the `stop` document of the run the plan opened, `None` if it
    /// opened none. Failures while a run is open end that run with
    /// `stop{fail}` (or `stop{abort}`) and are reported through the returned
    /// document and [`EngineHandle::last_error`]; failures outside a run are
    /// returned as errors.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut plan: Plan,
        callbacks: &mut [Box<dyn DocumentCallback>],
        md: Metadata,
    ) -> MambaResult<Option<StopDoc>> {
        if self.shared.busy.swap(true, Ordering::SeqCst) {
            return Err(MambaError::Dup("engine is already running a plan".into()));
        }
        self.shared.abort.send_replace(None);
        self.shared.pause_requested.store(false, Ordering::SeqCst);
        self.set_state(EngineState::Running);

        let mut ctx = RunContext::new(md);
        let outcome = self.execute(&mut plan, &mut ctx, callbacks).await;
        let result = self.finish(ctx, callbacks, outcome).await;

        self.set_state(EngineState::Idle);
        self.shared.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn execute(
        &self,
        plan: &mut Plan,
        ctx: &mut RunContext,
        callbacks: &mut [Box<dyn DocumentCallback>],
    ) -> MambaResult<()> {
        loop {
            if let Some(reason) = self.abort_reason() {
                return Err(MambaError::Aborted(reason));
            }
            if ctx.checkpoint_pending && self.shared.pause_requested.load(Ordering::SeqCst) {
                self.pause_here().await?;
            }
            let Some(msg) = plan.next() else {
                return Ok(());
            };
            debug!(msg = ?msg, "executing");
            ctx.checkpoint_pending = match msg {
                Msg::Checkpoint => true,
                Msg::Pause | Msg::Null => ctx.checkpoint_pending,
                _ => false,
            };
            self.process(msg, ctx, callbacks).await?;
        }
    }

    fn abort_reason(&self) -> Option<String> {
        self.shared.abort.borrow().clone()
    }

    /// Run `fut` unless an abort arrives first.
    async fn interruptible<F: Future>(&self, fut: F) -> MambaResult<F::Output> {
        let mut abort = self.shared.abort.subscribe();
        tokio::select! {
            biased;
            reason = wait_abort(&mut abort) => Err(MambaError::Aborted(reason)),
            out = fut => Ok(out),
        }
    }

    async fn pause_here(&self) -> MambaResult<()> {
        self.set_state(EngineState::Paused);
        info!("paused at checkpoint");
        self.shared
            .publisher
            .push_monitor(MonitorDoc::new("scan/pause").with_value("paused", true));

        let mut state = self.shared.state.subscribe();
        let resumed = async {
            let _ = state.wait_for(|s| *s != EngineState::Paused).await;
        };
        self.interruptible(resumed).await?;

        self.shared.pause_requested.store(false, Ordering::SeqCst);
        info!("resumed");
        self.shared
            .publisher
            .push_monitor(MonitorDoc::new("scan/resume").with_value("paused", false));
        Ok(())
    }

    async fn process(
        &self,
        msg: Msg,
        ctx: &mut RunContext,
        callbacks: &mut [Box<dyn DocumentCallback>],
    ) -> MambaResult<()> {
        match msg {
            Msg::Set {
                target,
                value,
                group,
            } => {
                let status = match &target {
                    Component::Device(device) => {
                        let status = device.set(&value)?;
                        ctx.inflight.push((device.clone(), status.clone()));
                        status
                    }
                    Component::Signal(signal) => signal.put(value),
                };
                ctx.join(group.as_deref(), status);
            }
            Msg::Trigger { device, group } => {
                let status = device.trigger();
                ctx.inflight.push((device, status.clone()));
                ctx.join(Some(group.as_deref().unwrap_or(PRIMARY)), status);
            }
            Msg::Wait { group } => {
                let statuses = ctx.groups.remove(&group).unwrap_or_default();
                let joined = Status::all(statuses);
                self.interruptible(joined.wait(None)).await??;
                ctx.inflight.retain(|(_, status)| !status.done());
            }
            Msg::Sleep { seconds } => {
                let duration = Duration::from_secs_f64(seconds.max(0.0));
                self.interruptible(tokio::time::sleep(duration)).await?;
            }
            Msg::Create { name } => {
                ctx.open_run()?;
                if ctx.bundle.is_some() {
                    return Err(MambaError::Protocol(
                        "create while an event bundle is open".into(),
                    ));
                }
                ctx.bundle = Some(Bundle {
                    stream: name,
                    readings: BTreeMap::new(),
                    objects: Vec::new(),
                });
            }
            Msg::Read { target } => {
                let readings = target.read();
                if let Some(bundle) = ctx.bundle.as_mut() {
                    if !bundle.objects.iter().any(|o| o.name() == target.name()) {
                        bundle.readings.extend(readings);
                        bundle.objects.push(target);
                    }
                }
            }
            Msg::Save => {
                let bundle = ctx
                    .bundle
                    .take()
                    .ok_or_else(|| MambaError::Protocol("save without create".into()))?;
                if bundle.readings.is_empty() {
                    return Err(MambaError::Protocol(format!(
                        "save on stream '{}' without any read",
                        bundle.stream
                    )));
                }
                self.save(bundle, ctx, callbacks)?;
            }
            Msg::Complete { device, points } => {
                let flyer = device.flyer().ok_or_else(|| {
                    MambaError::Protocol(format!("device '{}' cannot be collected", device.name()))
                })?;
                self.interruptible(flyer.complete(points).wait(None)).await??;
            }
            Msg::Collect { device } => {
                let flyer = device.flyer().ok_or_else(|| {
                    MambaError::Protocol(format!("device '{}' cannot be collected", device.name()))
                })?;
                let rows = flyer.collect();
                debug!(device = %device.name(), rows = rows.len(), "collected");
                for row in rows {
                    self.emit_event(
                        PRIMARY,
                        row,
                        || describe_collected(&device),
                        ctx,
                        callbacks,
                    )?;
                }
            }
            Msg::Stage { device } => {
                if device.stage()? {
                    ctx.staged.push(device);
                }
            }
            Msg::Unstage { device } => {
                device.unstage()?;
                ctx.staged.retain(|d| !d.same(&device));
            }
            Msg::Configure {
                device,
                config,
                action,
            } => {
                let status = configure(&device, &config, action)?;
                self.interruptible(status.wait(None)).await??;
            }
            Msg::OpenRun(run_md) => self.open_run(run_md, ctx, callbacks)?,
            Msg::CloseRun {
                exit_status,
                reason,
            } => {
                let run = ctx
                    .run
                    .take()
                    .ok_or_else(|| MambaError::Protocol("close_run without open_run".into()))?;
                ctx.bundle = None;
                let stop = self.close_run(run, exit_status, &reason, ctx, callbacks)?;
                ctx.final_stop = Some(stop);
            }
            Msg::PushCleanup(cleanup) => ctx.cleanups.push(cleanup),
            Msg::PopCleanup => {
                let cleanup = ctx
                    .cleanups
                    .pop()
                    .ok_or_else(|| MambaError::Protocol("pop_cleanup without push".into()))?;
                for msg in cleanup.messages() {
                    self.cleanup_step(msg, ctx).await?;
                }
            }
            Msg::Pause => {
                self.shared.pause_requested.store(true, Ordering::SeqCst);
            }
            Msg::Checkpoint | Msg::Null => {}
        }
        Ok(())
    }

    /// Execute one cleanup message. Only messages that put devices back are
    /// accepted; waits are bounded but not interruptible.
    async fn cleanup_step(&self, msg: Msg, ctx: &mut RunContext) -> MambaResult<()> {
        debug!(msg = ?msg, "cleanup");
        match msg {
            Msg::Set {
                target,
                value,
                group,
            } => {
                let status = match &target {
                    Component::Device(device) => device.set(&value)?,
                    Component::Signal(signal) => signal.put(value),
                };
                ctx.join(group.as_deref(), status);
            }
            Msg::Wait { group } => {
                let statuses = ctx.groups.remove(&group).unwrap_or_default();
                Status::all(statuses).wait(Some(CLEANUP_TIMEOUT)).await?;
            }
            Msg::Configure {
                device,
                config,
                action,
            } => {
                configure(&device, &config, action)?
                    .wait(Some(CLEANUP_TIMEOUT))
                    .await?;
            }
            Msg::Sleep { seconds } => {
                tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
            }
            Msg::Null | Msg::Checkpoint => {}
            other => {
                return Err(MambaError::Protocol(format!(
                    "{} is not allowed in a cleanup",
                    other.command()
                )))
            }
        }
        Ok(())
    }

    fn open_run(
        &self,
        run_md: RunMetadata,
        ctx: &mut RunContext,
        callbacks: &mut [Box<dyn DocumentCallback>],
    ) -> MambaResult<()> {
        if ctx.run.is_some() {
            return Err(MambaError::Protocol("open_run while a run is open".into()));
        }
        let scan_id = self.shared.scan_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut start = StartDoc::new(scan_id, &run_md.plan_name);
        start.time = ctx.next_time();
        start.num_points = run_md.num_points;
        start.hints = run_md.hints;
        start.md = run_md.md;
        start.md.extend(ctx.md.clone());

        info!(run_uid = %start.uid, scan_id, plan = %start.plan_name, "run started");
        ctx.run = Some(OpenRun {
            uid: start.uid.clone(),
            streams: HashMap::new(),
            num_events: BTreeMap::new(),
        });
        dispatch(callbacks, &Document::Start(start))
    }

    fn close_run(
        &self,
        run: OpenRun,
        exit_status: ExitStatus,
        reason: &str,
        ctx: &mut RunContext,
        callbacks: &mut [Box<dyn DocumentCallback>],
    ) -> MambaResult<StopDoc> {
        let mut stop = StopDoc::new(&run.uid, exit_status, reason);
        stop.time = ctx.next_time();
        stop.num_events = run.num_events;
        info!(
            run_uid = %run.uid,
            exit_status = %exit_status,
            events = stop.total_events(),
            "run finished"
        );
        dispatch(callbacks, &Document::Stop(stop.clone()))?;
        Ok(stop)
    }

    fn save(
        &self,
        bundle: Bundle,
        ctx: &mut RunContext,
        callbacks: &mut [Box<dyn DocumentCallback>],
    ) -> MambaResult<()> {
        let objects = bundle.objects;
        self.emit_event(
            &bundle.stream,
            bundle.readings,
            || {
                let mut descriptor = DescriptorDoc::new("", "");
                for object in &objects {
                    let keys = object.describe();
                    descriptor
                        .object_keys
                        .insert(object.name().to_string(), keys.keys().cloned().collect());
                    descriptor.data_keys.extend(keys);
                    let config = object.read_configuration();
                    if !config.is_empty() {
                        descriptor
                            .configuration
                            .insert(object.name().to_string(), config);
                    }
                }
                descriptor
            },
            ctx,
            callbacks,
        )
    }

    /// Emit one event on `stream`, declaring the stream first if needed.
    fn emit_event<F>(
        &self,
        stream: &str,
        readings: BTreeMap<String, Reading>,
        describe: F,
        ctx: &mut RunContext,
        callbacks: &mut [Box<dyn DocumentCallback>],
    ) -> MambaResult<()>
    where
        F: FnOnce() -> DescriptorDoc,
    {
        let time = ctx.next_time();
        let run = ctx.open_run()?;
        let run_uid = run.uid.clone();

        if !run.streams.contains_key(stream) {
            let mut descriptor = describe();
            descriptor.run_uid = run_uid.clone();
            descriptor.name = stream.to_string();
            descriptor.time = time;
            run.streams.insert(
                stream.to_string(),
                Stream {
                    descriptor_uid: descriptor.uid.clone(),
                    keys: descriptor.data_keys.keys().cloned().collect(),
                    seq_num: 0,
                },
            );
            debug!(run_uid = %run_uid, stream, keys = descriptor.data_keys.len(), "descriptor");
            dispatch(callbacks, &Document::Descriptor(descriptor))?;
        }

        let time = ctx.next_time();
        let run = ctx.open_run()?;
        let Some(entry) = run.streams.get_mut(stream) else {
            return Err(MambaError::Protocol(format!("stream '{}' vanished", stream)));
        };
        if let Some(missing) = readings.keys().find(|k| !entry.keys.contains(k)) {
            return Err(MambaError::Protocol(format!(
                "stream '{}' was declared without key '{}'",
                stream, missing
            )));
        }
        entry.seq_num += 1;
        let mut event = EventDoc::new(&run_uid, &entry.descriptor_uid, entry.seq_num);
        event.time = time;
        for (key, reading) in readings {
            event = event.with_reading(&key, reading);
        }
        *run.num_events.entry(stream.to_string()).or_insert(0) += 1;
        dispatch(callbacks, &Document::Event(event))
    }

    async fn finish(
        &self,
        mut ctx: RunContext,
        callbacks: &mut [Box<dyn DocumentCallback>],
        outcome: MambaResult<()>,
    ) -> MambaResult<Option<StopDoc>> {
        self.set_state(EngineState::Cleanup);
        let (exit_status, reason, err) = match outcome {
            Ok(()) => (ExitStatus::Success, String::new(), None),
            Err(e) => {
                let exit = if e.kind() == ErrorKind::Abort {
                    ExitStatus::Abort
                } else {
                    ExitStatus::Fail
                };
                error!(error = %e, exit_status = %exit, "run terminated");
                (exit, e.to_string(), Some(e))
            }
        };

        if err.is_some() {
            let mut stopped: Vec<Device> = Vec::new();
            for (device, status) in ctx.inflight.drain(..) {
                if status.done() || stopped.iter().any(|d| d.same(&device)) {
                    continue;
                }
                info!(device = %device.name(), "stopping device");
                if let Err(e) = device.stop().await {
                    warn!(device = %device.name(), error = %e, "stop failed");
                }
                stopped.push(device);
            }
        }

        while let Some(cleanup) = ctx.cleanups.pop() {
            for msg in cleanup.messages() {
                if let Err(e) = self.cleanup_step(msg, &mut ctx).await {
                    warn!(error = %e, "cleanup step failed");
                }
            }
        }
        ctx.groups.clear();

        for device in ctx.staged.drain(..).rev() {
            if let Err(e) = device.unstage() {
                warn!(device = %device.name(), error = %e, "unstage failed during cleanup");
            }
        }

        if exit_status == ExitStatus::Abort {
            self.shared
                .publisher
                .push_monitor(MonitorDoc::new("scan/abort").with_value("reason", reason.clone()));
        }

        let closed = match ctx.run.take() {
            Some(run) => {
                if err.is_none() {
                    warn!(run_uid = %run.uid, "plan ended without close_run");
                }
                let stop = StopDoc::new(&run.uid, exit_status, &reason);
                match self.close_run(run, exit_status, &reason, &mut ctx, callbacks) {
                    Ok(stop) => Some(stop),
                    Err(e) => {
                        warn!(error = %e, "callback failed on stop");
                        Some(stop)
                    }
                }
            }
            None => None,
        };

        if let Some(e) = &err {
            *self.shared.last_error.lock() = Some(LastError {
                kind: e.kind(),
                type_name: e.type_name().to_string(),
                message: e.to_string(),
            });
        }

        match (closed, err) {
            (Some(stop), _) => Ok(Some(stop)),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(ctx.final_stop),
        }
    }
}

async fn wait_abort(rx: &mut watch::Receiver<Option<String>>) -> String {
    let reason = rx
        .wait_for(|reason| reason.is_some())
        .await
        .ok()
        .map(|reason| (*reason).clone().unwrap_or_default());
    match reason {
        Some(reason) => reason,
        // The sender lives as long as the engine.
        None => std::future::pending().await,
    }
}

fn describe_collected(device: &Device) -> DescriptorDoc {
    let mut descriptor = DescriptorDoc::new("", "");
    if let Some(flyer) = device.flyer() {
        let keys = flyer.describe_collect();
        descriptor
            .object_keys
            .insert(device.name().to_string(), keys.keys().cloned().collect());
        descriptor.data_keys = keys;
    }
    descriptor
}

/// Hand `doc` to every callback in order.
///
/// Any failure on `start` aborts the run; on other documents only
/// failures marked fatal end the run, the rest are logged.
fn dispatch(callbacks: &mut [Box<dyn DocumentCallback>], doc: &Document) -> MambaResult<()> {
    let mut first: Option<MambaError> = None;
    for cb in callbacks.iter_mut() {
        let Err(e) = cb.on_document(doc) else {
            continue;
        };
        match doc {
            Document::Start(_) => {
                error!(callback = %cb.name(), error = %e, "callback failed on start");
                if first.is_none() {
                    first = Some(MambaError::Aborted(format!(
                        "callback '{}' failed on start: {}",
                        cb.name(),
                        e
                    )));
                }
            }
            _ if e.is_fatal() => {
                error!(callback = %cb.name(), doc = doc.name(), error = %e, "callback failed");
                if first.is_none() {
                    first = Some(e);
                }
            }
            _ => {
                warn!(
                    callback = %cb.name(),
                    doc = doc.name(),
                    error = %e,
                    "callback error ignored"
                );
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
