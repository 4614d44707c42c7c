//! Plan messages and composition.
//!
//! A plan is a lazy iterator of [`Msg`]s. The run engine pulls one message at
//! a time, so a plan can compute later messages from device state observed
//! after earlier ones executed (the fly planner reads a captured velocity
//! back only after staging).
//!
//! Composition is iterator adaptation:
//!
//! ```rust,ignore
//! let plan = stage_wrapper(
//!     vec![det.clone(), motor.clone()],
//!     run_wrapper(RunMetadata::new("scan"), inner),
//! );
//! ```
//!
//! [`finalize_wrapper`] registers cleanup messages that run whether the
//! wrapped plan finishes, fails or is aborted, before anything is unstaged.

use mamba_core::{Component, Device, DeviceConfig, ExitStatus, Metadata, Value};
use std::fmt;
use std::sync::Arc;

/// A boxed plan, the unit the engine executes.
pub type Plan = Box<dyn Iterator<Item = Msg> + Send>;

/// What `open_run` puts into the `start` document.
#[derive(Debug, Clone, Default)]
pub struct RunMetadata {
    pub plan_name: String,
    pub num_points: Option<u64>,
    pub hints: Metadata,
    pub md: Metadata,
}

impl RunMetadata {
    pub fn new(plan_name: &str) -> Self {
        Self {
            plan_name: plan_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_points(mut self, num_points: u64) -> Self {
        self.num_points = Some(num_points);
        self
    }

    /// Attach the `simple` progress hint for loops of the given shape,
    /// outermost first.
    pub fn with_progress(mut self, shape: &[u64]) -> Self {
        let mut hint = vec![serde_json::Value::from("simple")];
        hint.extend(shape.iter().map(|n| serde_json::Value::from(*n)));
        self.hints
            .insert("progress".to_string(), serde_json::Value::Array(hint));
        self
    }

    pub fn with_md(mut self, key: &str, value: serde_json::Value) -> Self {
        self.md.insert(key.to_string(), value);
        self
    }
}

/// Messages produced on demand when a cleanup runs, so they can read
/// device state at that moment (values captured at stage time).
#[derive(Clone)]
pub struct Cleanup(Arc<dyn Fn() -> Vec<Msg> + Send + Sync>);

impl Cleanup {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Vec<Msg> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn messages(&self) -> Vec<Msg> {
        (self.0)()
    }
}

/// One instruction for the run engine.
#[derive(Clone)]
pub enum Msg {
    /// Move a device or write a signal. The status joins `group`.
    Set {
        target: Component,
        value: Value,
        group: Option<String>,
    },
    /// Start an acquisition. Joins `"primary"` unless a group is given.
    Trigger {
        device: Device,
        group: Option<String>,
    },
    /// Join every status in `group`; the first failure fails the run.
    Wait { group: String },
    /// Open an event bundle on the named stream.
    Create { name: String },
    /// Add the readings of `target` to the open bundle.
    Read { target: Component },
    /// Emit the open bundle as one event.
    Save,
    Stage { device: Device },
    Unstage { device: Device },
    Configure {
        device: Device,
        config: DeviceConfig,
        action: bool,
    },
    OpenRun(RunMetadata),
    CloseRun {
        exit_status: ExitStatus,
        reason: String,
    },
    /// Request a pause; honored at the next checkpoint.
    Pause,
    /// A point where the plan may be paused safely.
    Checkpoint,
    Null,
    /// Interruptible wait.
    Sleep { seconds: f64 },
    /// Wait until a flyer holds at least `points` captured rows.
    Complete { device: Device, points: usize },
    /// Drain a flyer's captured rows into events.
    Collect { device: Device },
    /// Register a cleanup. The engine runs every registered cleanup, newest
    /// first, when the plan ends early.
    PushCleanup(Cleanup),
    /// Run the newest registered cleanup now and drop it.
    PopCleanup,
}

impl Msg {
    pub fn set(target: impl Into<Component>, value: impl Into<Value>, group: &str) -> Self {
        Msg::Set {
            target: target.into(),
            value: value.into(),
            group: Some(group.to_string()),
        }
    }

    pub fn trigger(device: &Device) -> Self {
        Msg::Trigger {
            device: device.clone(),
            group: None,
        }
    }

    pub fn wait(group: &str) -> Self {
        Msg::Wait {
            group: group.to_string(),
        }
    }

    pub fn create(name: &str) -> Self {
        Msg::Create {
            name: name.to_string(),
        }
    }

    pub fn read(target: impl Into<Component>) -> Self {
        Msg::Read {
            target: target.into(),
        }
    }

    pub fn close_run() -> Self {
        Msg::CloseRun {
            exit_status: ExitStatus::Success,
            reason: String::new(),
        }
    }

    /// Command name as used in logs.
    pub fn command(&self) -> &'static str {
        match self {
            Msg::Set { .. } => "set",
            Msg::Trigger { .. } => "trigger",
            Msg::Wait { .. } => "wait",
            Msg::Create { .. } => "create",
            Msg::Read { .. } => "read",
            Msg::Save => "save",
            Msg::Stage { .. } => "stage",
            Msg::Unstage { .. } => "unstage",
            Msg::Configure { .. } => "configure",
            Msg::OpenRun(_) => "open_run",
            Msg::CloseRun { .. } => "close_run",
            Msg::Pause => "pause",
            Msg::Checkpoint => "checkpoint",
            Msg::Null => "null",
            Msg::Sleep { .. } => "sleep",
            Msg::Complete { .. } => "complete",
            Msg::Collect { .. } => "collect",
            Msg::PushCleanup(_) => "push_cleanup",
            Msg::PopCleanup => "pop_cleanup",
        }
    }

    /// Whether executing this message drives hardware.
    pub fn drives_devices(&self) -> bool {
        matches!(
            self,
            Msg::Set { .. }
                | Msg::Trigger { .. }
                | Msg::Stage { .. }
                | Msg::Unstage { .. }
                | Msg::Configure { .. }
                | Msg::Collect { .. }
                | Msg::PopCleanup
        )
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Msg::Set {
                target,
                value,
                group,
            } => write!(f, "set({}, {}, {:?})", target.name(), value, group),
            Msg::Trigger { device, group } => write!(f, "trigger({}, {:?})", device.name(), group),
            Msg::Wait { group } => write!(f, "wait({})", group),
            Msg::Create { name } => write!(f, "create({})", name),
            Msg::Read { target } => write!(f, "read({})", target.name()),
            Msg::Stage { device } => write!(f, "stage({})", device.name()),
            Msg::Unstage { device } => write!(f, "unstage({})", device.name()),
            Msg::Configure { device, action, .. } => {
                write!(f, "configure({}, action={})", device.name(), action)
            }
            Msg::OpenRun(md) => write!(f, "open_run({})", md.plan_name),
            Msg::CloseRun { exit_status, .. } => write!(f, "close_run({})", exit_status),
            Msg::Sleep { seconds } => write!(f, "sleep({})", seconds),
            Msg::Complete { device, points } => {
                write!(f, "complete({}, {})", device.name(), points)
            }
            Msg::Collect { device } => write!(f, "collect({})", device.name()),
            other => write!(f, "{}", other.command()),
        }
    }
}

/// Bracket `plan` with `open_run` / `close_run`.
pub fn run_wrapper(md: RunMetadata, plan: Plan) -> Plan {
    Box::new(
        std::iter::once(Msg::OpenRun(md))
            .chain(plan)
            .chain(std::iter::once(Msg::close_run())),
    )
}

/// Stage `devices` before `plan` and unstage them in reverse order after.
///
/// The engine unstages anything still staged when a run ends early, so the
/// trailing unstage messages only matter on the success path.
pub fn stage_wrapper(devices: Vec<Device>, plan: Plan) -> Plan {
    let mut unique: Vec<Device> = Vec::new();
    for device in devices {
        if !unique.iter().any(|d| d.same(&device)) {
            unique.push(device);
        }
    }
    let stage: Vec<Msg> = unique
        .iter()
        .map(|d| Msg::Stage { device: d.clone() })
        .collect();
    let unstage: Vec<Msg> = unique
        .iter()
        .rev()
        .map(|d| Msg::Unstage { device: d.clone() })
        .collect();
    Box::new(stage.into_iter().chain(plan).chain(unstage))
}

/// Run `cleanup` after `plan`, also when `plan` fails or is aborted.
pub fn finalize_wrapper(plan: Plan, cleanup: Cleanup) -> Plan {
    Box::new(
        std::iter::once(Msg::PushCleanup(cleanup))
            .chain(plan)
            .chain(std::iter::once(Msg::PopCleanup)),
    )
}

/// Concatenate plans.
pub fn chain(plans: Vec<Plan>) -> Plan {
    Box::new(plans.into_iter().flatten())
}

/// Plan from a fixed message list.
pub fn from_msgs(msgs: Vec<Msg>) -> Plan {
    Box::new(msgs.into_iter())
}
