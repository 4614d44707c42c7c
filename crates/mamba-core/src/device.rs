//! Composite devices.
//!
//! A [`Device`] is an ordered set of named components, each either a
//! [`Signal`] or a nested [`Device`]. Devices are described by a
//! [`DeviceBuilder`] and are immutable in shape once built: lookup goes
//! through a static name map, never through runtime type synthesis.
//!
//! # Staging
//!
//! `stage_sigs` maps dotted child paths to values asserted for the duration
//! of a run. `stage()` records the current value of each entry, writes the
//! target and then stages sub-devices; `unstage()` undoes it all in reverse
//! order. Both are idempotent. An entry set to [`StageTarget::Keep`] is
//! captured but neither written nor restored; code that changes it later is
//! responsible for restoring it from [`Device::captured`].
//!
//! ```rust,ignore
//! let det = DeviceBuilder::new("det")
//!     .with_signal("acquire_time", Signal::with_kind("det_acquire_time", 1.0, Kind::Config))
//!     .stage_sig("acquire_time", 0.1)
//!     .build();
//! det.stage()?;   // acquire_time = 0.1
//! det.unstage()?; // acquire_time = 1.0
//! ```

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::capabilities::{Flyer, FrameSource, Movable};
use crate::document::DataKey;
use crate::error::{MambaError, MambaResult, StatusError};
use crate::signal::{Kind, Signal};
use crate::status::{Status, StatusState};
use crate::trigger::TriggerStrategy;
use crate::value::{Reading, Value};

/// A child of a device.
#[derive(Clone, Debug)]
pub enum Component {
    Signal(Signal),
    Device(Device),
}

impl Component {
    pub fn name(&self) -> &str {
        match self {
            Component::Signal(s) => s.name(),
            Component::Device(d) => d.name(),
        }
    }

    pub fn read(&self) -> BTreeMap<String, Reading> {
        match self {
            Component::Signal(s) => BTreeMap::from([(s.name().to_string(), s.reading())]),
            Component::Device(d) => d.read(),
        }
    }

    pub fn describe(&self) -> BTreeMap<String, DataKey> {
        match self {
            Component::Signal(s) => BTreeMap::from([(s.name().to_string(), s.describe())]),
            Component::Device(d) => d.describe(),
        }
    }

    pub fn read_configuration(&self) -> BTreeMap<String, Reading> {
        match self {
            Component::Signal(s) if s.kind().is_config() => {
                BTreeMap::from([(s.name().to_string(), s.reading())])
            }
            Component::Signal(_) => BTreeMap::new(),
            Component::Device(d) => d.read_configuration(),
        }
    }

    pub fn describe_configuration(&self) -> BTreeMap<String, DataKey> {
        match self {
            Component::Signal(s) if s.kind().is_config() => {
                BTreeMap::from([(s.name().to_string(), s.describe())])
            }
            Component::Signal(_) => BTreeMap::new(),
            Component::Device(d) => d.describe_configuration(),
        }
    }

    /// Child names for a device, the signal's own name otherwise.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Component::Signal(s) => vec![s.name().to_string()],
            Component::Device(d) => d.component_names().iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn as_device(&self) -> Option<&Device> {
        match self {
            Component::Device(d) => Some(d),
            Component::Signal(_) => None,
        }
    }

    pub fn as_signal(&self) -> Option<&Signal> {
        match self {
            Component::Signal(s) => Some(s),
            Component::Device(_) => None,
        }
    }
}

impl From<Signal> for Component {
    fn from(s: Signal) -> Self {
        Component::Signal(s)
    }
}

impl From<Device> for Component {
    fn from(d: Device) -> Self {
        Component::Device(d)
    }
}

impl From<&Device> for Component {
    fn from(d: &Device) -> Self {
        Component::Device(d.clone())
    }
}

/// Target of a `stage_sigs` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum StageTarget {
    /// Capture the current value but do not write or restore it.
    Keep,
    Value(Value),
}

/// Sentinel for "capture, do not overwrite".
pub const STAGE_KEEP: StageTarget = StageTarget::Keep;

#[derive(Default)]
struct StagedState {
    restore: Vec<(Signal, Value)>,
    captured: Vec<(String, Value)>,
    children: Vec<Device>,
}

struct DeviceInner {
    name: String,
    components: Vec<(String, Component)>,
    lookup: HashMap<String, usize>,
    stage_sigs: RwLock<Vec<(String, StageTarget)>>,
    staged: Mutex<Option<StagedState>>,
    movable: Option<Arc<dyn Movable>>,
    trigger: Option<Arc<dyn TriggerStrategy>>,
    frames: Option<Arc<dyn FrameSource>>,
    flyer: Option<Arc<dyn Flyer>>,
}

/// Shared handle to a composite device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("components", &self.component_names())
            .field("staged", &self.is_staged())
            .finish()
    }
}

/// Declarative description of a device, instantiated by [`DeviceBuilder::build`].
pub struct DeviceBuilder {
    name: String,
    components: Vec<(String, Component)>,
    stage_sigs: Vec<(String, StageTarget)>,
    movable: Option<Arc<dyn Movable>>,
    trigger: Option<Arc<dyn TriggerStrategy>>,
    frames: Option<Arc<dyn FrameSource>>,
    flyer: Option<Arc<dyn Flyer>>,
}

impl DeviceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            stage_sigs: Vec::new(),
            movable: None,
            trigger: None,
            frames: None,
            flyer: None,
        }
    }

    /// Conventional full name of a child signal: `{device}_{attr}`.
    pub fn child_name(&self, attr: &str) -> String {
        format!("{}_{}", self.name, attr)
    }

    /// Add a signal named `{device}_{attr}`.
    pub fn signal(self, attr: &str, initial: impl Into<Value>, kind: Kind) -> Self {
        let sig = Signal::with_kind(self.child_name(attr), initial, kind);
        self.with_signal(attr, sig)
    }

    /// Add a hinted signal named like the device itself (a motor readback or
    /// a detector's primary value).
    pub fn readback(self, attr: &str, initial: impl Into<Value>) -> Self {
        let sig = Signal::with_kind(self.name.clone(), initial, Kind::Hinted);
        self.with_signal(attr, sig)
    }

    pub fn with_signal(mut self, attr: &str, signal: Signal) -> Self {
        self.components.push((attr.to_string(), Component::Signal(signal)));
        self
    }

    /// Add a sub-device named `{device}_{attr}` described by `describe`.
    pub fn device<F>(self, attr: &str, describe: F) -> Self
    where
        F: FnOnce(DeviceBuilder) -> DeviceBuilder,
    {
        let child = describe(DeviceBuilder::new(self.child_name(attr))).build();
        self.with_device(attr, child)
    }

    pub fn with_device(mut self, attr: &str, device: Device) -> Self {
        self.components.push((attr.to_string(), Component::Device(device)));
        self
    }

    pub fn stage_sig(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.stage_sigs
            .push((path.to_string(), StageTarget::Value(value.into())));
        self
    }

    pub fn stage_keep(mut self, path: &str) -> Self {
        self.stage_sigs.push((path.to_string(), STAGE_KEEP));
        self
    }

    pub fn movable(mut self, movable: Arc<dyn Movable>) -> Self {
        self.movable = Some(movable);
        self
    }

    pub fn trigger(mut self, trigger: Arc<dyn TriggerStrategy>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn frames(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn flyer(mut self, flyer: Arc<dyn Flyer>) -> Self {
        self.flyer = Some(flyer);
        self
    }

    pub fn build(self) -> Device {
        let lookup = self
            .components
            .iter()
            .enumerate()
            .map(|(i, (attr, _))| (attr.clone(), i))
            .collect();
        Device {
            inner: Arc::new(DeviceInner {
                name: self.name,
                components: self.components,
                lookup,
                stage_sigs: RwLock::new(self.stage_sigs),
                staged: Mutex::new(None),
                movable: self.movable,
                trigger: self.trigger,
                frames: self.frames,
                flyer: self.flyer,
            }),
        }
    }
}

impl Device {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether two handles refer to the same device.
    pub fn same(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Child attribute names in declaration order.
    pub fn component_names(&self) -> Vec<&str> {
        self.inner
            .components
            .iter()
            .map(|(attr, _)| attr.as_str())
            .collect()
    }

    pub fn component(&self, attr: &str) -> Option<&Component> {
        self.inner
            .lookup
            .get(attr)
            .map(|&i| &self.inner.components[i].1)
    }

    /// Resolve a dotted path such as `cam.acquire_time`.
    pub fn resolve(&self, path: &str) -> Option<Component> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.component(first)?.clone();
        for part in parts {
            current = current.as_device()?.component(part)?.clone();
        }
        Some(current)
    }

    pub fn signal(&self, path: &str) -> Option<Signal> {
        match self.resolve(path)? {
            Component::Signal(s) => Some(s),
            Component::Device(_) => None,
        }
    }

    /// Like [`Device::signal`] but reports a missing path as a key error.
    pub fn require_signal(&self, path: &str) -> MambaResult<Signal> {
        self.signal(path)
            .ok_or_else(|| MambaError::Key(format!("{}.{}", self.name(), path)))
    }

    pub fn sub_devices(&self) -> Vec<Device> {
        self.inner
            .components
            .iter()
            .filter_map(|(_, c)| c.as_device().cloned())
            .collect()
    }

    pub fn movable(&self) -> Option<Arc<dyn Movable>> {
        self.inner.movable.clone()
    }

    pub fn frames(&self) -> Option<Arc<dyn FrameSource>> {
        self.inner.frames.clone()
    }

    pub fn flyer(&self) -> Option<Arc<dyn Flyer>> {
        self.inner.flyer.clone()
    }

    pub fn has_trigger(&self) -> bool {
        self.inner.trigger.is_some()
    }

    // =========================================================================
    // Aggregate reads
    // =========================================================================

    pub fn read(&self) -> BTreeMap<String, Reading> {
        let mut out = BTreeMap::new();
        for (_, component) in &self.inner.components {
            match component {
                Component::Signal(s) if s.kind().is_read() => {
                    out.insert(s.name().to_string(), s.reading());
                }
                Component::Signal(_) => {}
                Component::Device(d) => out.extend(d.read()),
            }
        }
        out
    }

    pub fn describe(&self) -> BTreeMap<String, DataKey> {
        let mut out = BTreeMap::new();
        for (_, component) in &self.inner.components {
            match component {
                Component::Signal(s) if s.kind().is_read() => {
                    out.insert(s.name().to_string(), s.describe());
                }
                Component::Signal(_) => {}
                Component::Device(d) => out.extend(d.describe()),
            }
        }
        out
    }

    pub fn read_configuration(&self) -> BTreeMap<String, Reading> {
        let mut out = BTreeMap::new();
        for (_, component) in &self.inner.components {
            out.extend(component.read_configuration());
        }
        out
    }

    pub fn describe_configuration(&self) -> BTreeMap<String, DataKey> {
        let mut out = BTreeMap::new();
        for (_, component) in &self.inner.components {
            out.extend(component.describe_configuration());
        }
        out
    }

    /// Names of hinted signals, recursively.
    pub fn hints(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (_, component) in &self.inner.components {
            match component {
                Component::Signal(s) if s.kind() == Kind::Hinted => out.push(s.name().to_string()),
                Component::Signal(_) => {}
                Component::Device(d) => out.extend(d.hints()),
            }
        }
        out
    }

    // =========================================================================
    // Stage / unstage
    // =========================================================================

    pub fn stage_sigs(&self) -> Vec<(String, StageTarget)> {
        self.inner.stage_sigs.read().clone()
    }

    /// Insert or replace a stage entry, keeping the position of an existing
    /// entry. Takes effect at the next `stage()`.
    pub fn set_stage_sig(&self, path: &str, target: StageTarget) {
        let mut sigs = self.inner.stage_sigs.write();
        match sigs.iter_mut().find(|(p, _)| p == path) {
            Some(entry) => entry.1 = target,
            None => sigs.push((path.to_string(), target)),
        }
    }

    pub fn remove_stage_sig(&self, path: &str) -> bool {
        let mut sigs = self.inner.stage_sigs.write();
        let before = sigs.len();
        sigs.retain(|(p, _)| p != path);
        sigs.len() != before
    }

    pub fn is_staged(&self) -> bool {
        self.inner.staged.lock().is_some()
    }

    /// Value captured at stage time for a `STAGE_KEEP` entry.
    pub fn captured(&self, path: &str) -> Option<Value> {
        self.inner
            .staged
            .lock()
            .as_ref()?
            .captured
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
    }

    /// Returns `Ok(false)` when the device was already staged.
    pub fn stage(&self) -> MambaResult<bool> {
        if self.is_staged() {
            debug!(device = %self.name(), "already staged");
            return Ok(false);
        }

        let mut state = StagedState::default();
        for (path, target) in self.stage_sigs() {
            let sig = match self.require_signal(&path) {
                Ok(sig) => sig,
                Err(e) => {
                    Self::restore(state);
                    return Err(e);
                }
            };
            let original = sig.get();
            match target {
                StageTarget::Keep => state.captured.push((path, original)),
                StageTarget::Value(value) => {
                    state.restore.push((sig.clone(), original));
                    if let StatusState::Failed(e) = sig.put(value).state() {
                        warn!(
                            device = %self.name(),
                            path = %path,
                            error = %e,
                            "stage write failed"
                        );
                        Self::restore(state);
                        return Err(e.into());
                    }
                }
            }
        }

        for child in self.sub_devices() {
            match child.stage() {
                Ok(true) => state.children.push(child),
                Ok(false) => {}
                Err(e) => {
                    Self::restore(state);
                    return Err(e);
                }
            }
        }

        *self.inner.staged.lock() = Some(state);
        debug!(device = %self.name(), "staged");
        Ok(true)
    }

    /// Returns `Ok(false)` when the device was not staged.
    pub fn unstage(&self) -> MambaResult<bool> {
        let state = self.inner.staged.lock().take();
        match state {
            None => Ok(false),
            Some(state) => {
                let result = Self::restore(state);
                debug!(device = %self.name(), "unstaged");
                result.map(|_| true)
            }
        }
    }

    /// Undo a (possibly partial) stage in reverse order. Keeps going after a
    /// failure and reports the first one.
    fn restore(state: StagedState) -> MambaResult<()> {
        let mut first_err: Option<MambaError> = None;
        for child in state.children.iter().rev() {
            if let Err(e) = child.unstage() {
                warn!(device = %child.name(), error = %e, "unstage failed");
                first_err.get_or_insert(e);
            }
        }
        for (sig, value) in state.restore.into_iter().rev() {
            if let StatusState::Failed(e) = sig.put(value).state() {
                warn!(signal = %sig.name(), error = %e, "restore failed");
                first_err.get_or_insert(e.into());
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Actions
    // =========================================================================

    /// Move a movable device. The returned status completes when the motion
    /// does.
    pub fn set(&self, value: &Value) -> MambaResult<Status> {
        let movable = self
            .movable()
            .ok_or_else(|| {
                MambaError::Protocol(format!("device '{}' is not movable", self.name()))
            })?;
        let target = value.as_f64().ok_or_else(|| {
            MambaError::Syntax(format!("cannot move '{}' to {}", self.name(), value))
        })?;
        let name = self.name().to_string();
        Ok(Status::spawn(async move {
            movable
                .move_abs(target)
                .await
                .map_err(|e| StatusError::hardware(format!("{}: {}", name, e)))
        }))
    }

    /// Begin one acquisition. Devices without a trigger strategy are always
    /// ready.
    pub fn trigger(&self) -> Status {
        match &self.inner.trigger {
            Some(strategy) => strategy.trigger(self),
            None => Status::finished(),
        }
    }

    /// Halt motion and interrupt any running acquisition.
    pub async fn stop(&self) -> MambaResult<()> {
        if let Some(strategy) = &self.inner.trigger {
            strategy.stop(self);
        }
        if let Some(movable) = &self.inner.movable {
            movable
                .stop()
                .await
                .map_err(|e| MambaError::Hardware(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn detector() -> Device {
        DeviceBuilder::new("det")
            .readback("value", 0)
            .signal("acquire_time", 1.0, Kind::Config)
            .signal("gain", 2, Kind::Config)
            .signal("acquire", 0, Kind::Omitted)
            .device("cam", |b| {
                b.signal("image_mode", 0, Kind::Config)
                    .signal("array_counter", 0, Kind::Normal)
                    .stage_sig("image_mode", 1)
            })
            .stage_sig("acquire_time", 0.1)
            .stage_keep("gain")
            .build()
    }

    #[test]
    fn components_keep_declaration_order() {
        let det = detector();
        assert_eq!(
            det.component_names(),
            vec!["value", "acquire_time", "gain", "acquire", "cam"]
        );
        assert_eq!(
            det.signal("cam.image_mode").map(|s| s.name().to_string()),
            Some("det_cam_image_mode".to_string())
        );
        assert!(det.signal("cam").is_none());
        assert!(det.resolve("cam.missing").is_none());
    }

    #[test]
    fn describe_keys_match_read_keys() {
        let det = detector();
        let read: Vec<_> = det.read().into_keys().collect();
        let described: Vec<_> = det.describe().into_keys().collect();
        assert_eq!(read, described);
        assert_eq!(read, vec!["det", "det_cam_array_counter"]);

        let config: Vec<_> = det.read_configuration().into_keys().collect();
        let config_described: Vec<_> = det.describe_configuration().into_keys().collect();
        assert_eq!(config, config_described);
        assert!(config.contains(&"det_cam_image_mode".to_string()));
        assert!(!config.contains(&"det_acquire".to_string()));
        assert_eq!(det.hints(), vec!["det"]);
    }

    #[test]
    fn stage_writes_and_unstage_restores() {
        let det = detector();
        let acquire_time = det.signal("acquire_time").unwrap();
        let image_mode = det.signal("cam.image_mode").unwrap();

        assert!(det.stage().unwrap());
        assert_eq!(acquire_time.get(), Value::Float(0.1));
        assert_eq!(image_mode.get(), Value::Int(1));
        assert_eq!(det.captured("gain"), Some(Value::Int(2)));

        // Idempotent.
        assert!(!det.stage().unwrap());

        assert!(det.unstage().unwrap());
        assert!(!det.unstage().unwrap());
        assert_eq!(acquire_time.get(), Value::Float(1.0));
        assert_eq!(image_mode.get(), Value::Int(0));
        assert!(!det.is_staged());
    }

    #[test]
    fn keep_entries_are_not_restored() {
        let det = detector();
        let gain = det.signal("gain").unwrap();
        det.stage().unwrap();
        gain.put(5);
        det.unstage().unwrap();
        assert_eq!(gain.get(), Value::Int(5));
    }

    #[test]
    fn failed_stage_rolls_back() {
        let det = DeviceBuilder::new("bad")
            .signal("a", 0, Kind::Config)
            .stage_sig("a", 1)
            .stage_sig("missing", 1)
            .build();
        let err = det.stage().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Key);
        assert_eq!(det.signal("a").unwrap().get(), Value::Int(0));
        assert!(!det.is_staged());
    }

    #[test]
    fn set_on_plain_device_is_protocol_error() {
        let det = detector();
        assert!(matches!(
            det.set(&Value::Float(1.0)),
            Err(MambaError::Protocol(_))
        ));
    }
}
