//! Pre-flight checks and in-run checking callbacks.

use mamba_core::{
    DescriptorDoc, Device, DeviceRegistry, Document, DocumentCallback, EventDoc, MambaError,
    MambaResult, MonitorDoc, Publisher, Signal,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::fly::{FlyTrajectory, MotorProfile};

/// The file plugin of a detector, when it has one.
fn plugin_primed(device: &Device) -> Option<Signal> {
    device.signal("hdf.primed")
}

/// Fail with `UnprimedPlugin` if any detector's file plugin is not primed.
pub fn check_primed(detectors: &[Device]) -> MambaResult<()> {
    for det in detectors {
        if let Some(primed) = plugin_primed(det) {
            if primed.get().as_i64() != Some(1) {
                return Err(MambaError::UnprimedPlugin(format!(
                    "{}: file plugin needs a warm-up acquisition",
                    det.name()
                )));
            }
        }
    }
    Ok(())
}

/// Readback and encoder must agree within `tolerance` user units.
pub fn check_encoder(motor: &Device, profile: &MotorProfile, tolerance: f64) -> MambaResult<()> {
    let readback = motor
        .require_signal("user_readback")?
        .get()
        .as_f64()
        .unwrap_or(f64::NAN);
    let raw = motor
        .require_signal("encoder.raw")?
        .get()
        .as_f64()
        .unwrap_or(f64::NAN);
    let encoder = raw * profile.encoder_scale + profile.encoder_offset;
    let diff = (readback - encoder).abs();
    if diff.is_nan() || diff > tolerance {
        return Err(MambaError::Check(format!(
            "{}: readback {} disagrees with encoder {} (tolerance {})",
            motor.name(),
            readback,
            encoder,
            tolerance
        )));
    }
    Ok(())
}

/// The sweep must not run slower than `ratio` times the motor's base
/// velocity.
pub fn check_base_velocity(
    motor: &Device,
    traj: &FlyTrajectory,
    profile: &MotorProfile,
    ratio: f64,
) -> MambaResult<()> {
    let floor = ratio * profile.base_velocity;
    if traj.velocity < floor {
        return Err(MambaError::Check(format!(
            "{}: sweep velocity {:.6} is below {} x base velocity {}",
            motor.name(),
            traj.velocity,
            ratio,
            profile.base_velocity
        )));
    }
    Ok(())
}

/// Refuses to start a run while a file plugin is unprimed.
pub struct PluginWarmupCheck {
    detectors: Vec<Device>,
}

impl PluginWarmupCheck {
    pub fn new(detectors: Vec<Device>) -> Self {
        Self { detectors }
    }
}

impl DocumentCallback for PluginWarmupCheck {
    fn name(&self) -> &str {
        "warmup_check"
    }

    fn on_document(&mut self, doc: &Document) -> MambaResult<()> {
        match doc {
            Document::Start(_) => check_primed(&self.detectors),
            _ => Ok(()),
        }
    }
}

/// Compares a detector's hardware frame counter with the number of events
/// after every second event.
///
/// With `expected = base + seq_num` the counter must satisfy
/// `expected − tolerance ≤ counter ≤ expected`; anything else ends the run.
pub struct FrameCounterChecker {
    device: String,
    counter: Signal,
    tolerance: u64,
    base: Option<i64>,
}

impl FrameCounterChecker {
    /// Checker for the signal at `path` (e.g. `cam.array_counter`).
    pub fn new(device: &Device, path: &str, tolerance: u64) -> MambaResult<Self> {
        Ok(Self {
            device: device.name().to_string(),
            counter: device.require_signal(path)?,
            tolerance,
            base: None,
        })
    }

    fn count(&self) -> i64 {
        self.counter.get().as_i64().unwrap_or(0)
    }

    fn check(&self, event: &EventDoc) -> MambaResult<()> {
        let Some(base) = self.base else {
            return Ok(());
        };
        let expected = base + event.seq_num as i64;
        // Rows collected after a sweep carry the counter at capture time.
        let counter = event
            .data
            .get(self.counter.name())
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| self.count());
        let tolerance = self.tolerance as i64;
        if counter > expected || counter < expected - tolerance {
            return Err(MambaError::fatal(MambaError::Check(format!(
                "{}: frame counter {} after {} events, expected {}..={}",
                self.device,
                counter - base,
                event.seq_num,
                expected - tolerance - base,
                expected - base
            ))));
        }
        debug!(device = %self.device, counter, expected, "frame counter ok");
        Ok(())
    }
}

impl DocumentCallback for FrameCounterChecker {
    fn name(&self) -> &str {
        "frame_counter"
    }

    fn on_document(&mut self, doc: &Document) -> MambaResult<()> {
        match doc {
            Document::Start(_) => {
                self.base = Some(self.count());
                Ok(())
            }
            Document::Event(event) if event.seq_num % 2 == 0 => self.check(event),
            Document::Stop(_) => {
                self.base = None;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Resolves frame references in events and publishes the pixels as
/// `monitor/image`.
pub struct ImageFiller {
    registry: DeviceRegistry,
    publisher: Arc<dyn Publisher>,
    /// descriptor uid -> (data key -> device)
    frame_keys: BTreeMap<String, Vec<(String, Device)>>,
}

impl ImageFiller {
    pub fn new(registry: DeviceRegistry, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            registry,
            publisher,
            frame_keys: BTreeMap::new(),
        }
    }

    fn descriptor(&mut self, doc: &DescriptorDoc) {
        let mut keys = Vec::new();
        for (object, object_keys) in &doc.object_keys {
            let Some(device) = self.registry.get(object) else {
                continue;
            };
            if device.frames().is_none() {
                continue;
            }
            for key in object_keys {
                let external = doc.data_keys.get(key).and_then(|k| k.external.as_deref());
                if external.is_some() {
                    keys.push((key.clone(), device.clone()));
                }
            }
        }
        if !keys.is_empty() {
            self.frame_keys.insert(doc.uid.clone(), keys);
        }
    }

    fn event(&self, event: &EventDoc) {
        let Some(keys) = self.frame_keys.get(&event.descriptor_uid) else {
            return;
        };
        for (key, device) in keys {
            let (Some(frames), Some(id)) = (
                device.frames(),
                event.data.get(key).and_then(|v| v.as_i64()),
            ) else {
                continue;
            };
            match frames.frame(id as u64) {
                Some(frame) => {
                    let mut doc = MonitorDoc::new("monitor/image")
                        .with_value("device", device.name())
                        .with_value("key", key.as_str())
                        .with_value("frame", id)
                        .with_value("width", frame.width)
                        .with_value("height", frame.height)
                        .with_value("seq_num", event.seq_num as i64);
                    doc.payload = Some(frame.to_bytes());
                    self.publisher.push_monitor(doc);
                }
                None => warn!(device = %device.name(), frame = id, "frame no longer available"),
            }
        }
    }
}

impl DocumentCallback for ImageFiller {
    fn name(&self) -> &str {
        "image_filler"
    }

    fn on_document(&mut self, doc: &Document) -> MambaResult<()> {
        match doc {
            Document::Descriptor(d) => self.descriptor(d),
            Document::Event(e) => self.event(e),
            Document::Stop(_) => self.frame_keys.clear(),
            Document::Start(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mamba_core::{DeviceBuilder, ErrorKind, Kind, StartDoc};

    fn camera(primed: i64) -> Device {
        DeviceBuilder::new("cam1")
            .device("cam", |b| b.signal("array_counter", 0, Kind::Normal))
            .device("hdf", |b| b.signal("primed", primed, Kind::Omitted))
            .build()
    }

    #[test]
    fn unprimed_plugin_is_reported() {
        let err = check_primed(&[camera(0)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnprimedPlugin);
        assert!(check_primed(&[camera(1)]).is_ok());
        let mut check = PluginWarmupCheck::new(vec![camera(0)]);
        let start = Document::Start(StartDoc::new(1, "fly"));
        assert!(check.on_document(&start).is_err());
    }

    #[test]
    fn counter_must_track_events() {
        let cam = camera(1);
        let counter = cam.signal("cam.array_counter").unwrap();
        counter.update(10);
        let mut checker = FrameCounterChecker::new(&cam, "cam.array_counter", 1).unwrap();
        checker
            .on_document(&Document::Start(StartDoc::new(1, "fly")))
            .unwrap();

        let event = |seq| Document::Event(EventDoc::new("r", "d", seq));
        counter.update(11);
        checker.on_document(&event(1)).unwrap();
        // one frame behind is tolerated
        counter.update(11);
        checker.on_document(&event(2)).unwrap();
        counter.update(15);
        let err = checker.on_document(&event(4)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::Check);
        // odd events are not checked
        assert!(checker.on_document(&event(5)).is_ok());
    }

    #[test]
    fn base_velocity_guard() {
        let motor = DeviceBuilder::new("mx").build();
        let profile = MotorProfile {
            velocity: 1.0,
            acceleration: 0.1,
            base_velocity: 0.5,
            encoder_offset: 0.0,
            encoder_scale: 1.0,
        };
        let params = crate::fly::FlyParams {
            velocity: Some(0.2),
            ..crate::fly::FlyParams::new(0.0, 1.0, 10)
        };
        let traj = crate::fly::fly_trajectory(&params, &profile, false).unwrap();
        assert!(check_base_velocity(&motor, &traj, &profile, 1.0).is_err());
        assert!(check_base_velocity(&motor, &traj, &profile, 0.1).is_ok());
    }
}
