//! Configuration translator.
//!
//! Applies a mapping of dotted child paths to values onto a device. Older
//! user configurations address detector settings as `cam.<attr>` even on
//! devices without a `cam` child; that prefix is stripped so both spellings
//! reach the same signal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::device::Device;
use crate::error::{MambaError, MambaResult, StatusError};
use crate::status::{Status, StatusState};
use crate::value::Value;

/// Ordered mapping of dotted child path to target value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfig(pub BTreeMap<String, Value>);

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.0.insert(path.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Normalize a configuration path for `device`.
pub fn translate(device: &Device, path: &str) -> String {
    match path.strip_prefix("cam.") {
        Some(rest) if device.component("cam").is_none() => rest.to_string(),
        _ => path.to_string(),
    }
}

/// Apply `config` to `device`.
///
/// With `action = true` each value is a one-shot command and only the write
/// itself is awaited. Otherwise each write is followed by a readback, and a
/// mismatch fails the returned status. Unknown paths are rejected before
/// anything is written.
pub fn configure(device: &Device, config: &DeviceConfig, action: bool) -> MambaResult<Status> {
    let mut targets = Vec::with_capacity(config.0.len());
    for (path, value) in config.iter() {
        let translated = translate(device, path);
        let sig = device
            .signal(&translated)
            .ok_or_else(|| MambaError::Key(format!("{}.{}", device.name(), translated)))?;
        targets.push((sig, value.clone()));
    }

    let mut statuses = Vec::with_capacity(targets.len());
    for (sig, value) in targets {
        debug!(device = %device.name(), signal = %sig.name(), %value, action, "configure");
        let write = sig.put(value.clone());
        if action {
            statuses.push(write);
            continue;
        }
        let checked = Status::new();
        let st = checked.clone();
        write.add_callback(move |state| match state {
            StatusState::Failed(e) => {
                st.set_exception(e.clone());
            }
            _ => {
                let readback = sig.get();
                if readback.matches(&value) {
                    st.set_finished();
                } else {
                    st.set_exception(StatusError::hardware(format!(
                        "{} readback {} does not match {}",
                        sig.name(),
                        readback,
                        value
                    )));
                }
            }
        });
        statuses.push(checked);
    }
    Ok(Status::all(statuses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBuilder;
    use crate::signal::Kind;
    use std::sync::Arc;

    fn flat_detector() -> Device {
        DeviceBuilder::new("det")
            .signal("acquire_time", 1.0, Kind::Config)
            .signal("gain", 1, Kind::Config)
            .build()
    }

    #[test]
    fn cam_prefix_is_stripped_without_cam_child() {
        let det = flat_detector();
        assert_eq!(translate(&det, "cam.acquire_time"), "acquire_time");

        let cam_det = DeviceBuilder::new("cam_det")
            .device("cam", |b| b.signal("acquire_time", 1.0, Kind::Config))
            .build();
        assert_eq!(translate(&cam_det, "cam.acquire_time"), "cam.acquire_time");
    }

    #[test]
    fn readback_match_finishes() {
        let det = flat_detector();
        let cfg = DeviceConfig::new()
            .with("cam.acquire_time", 0.5)
            .with("gain", 4);
        let status = configure(&det, &cfg, false).unwrap();
        assert!(status.success());
        assert_eq!(det.signal("acquire_time").unwrap().get(), Value::Float(0.5));
    }

    #[test]
    fn readback_mismatch_fails() {
        let det = flat_detector();
        // Hardware that clamps the gain.
        det.signal("gain").unwrap().set_put_hook(Arc::new(|s, v| {
            s.update(v.as_i64().unwrap_or(0).min(2));
            Status::finished()
        }));
        let cfg = DeviceConfig::new().with("gain", 8);
        assert!(matches!(
            configure(&det, &cfg, false).unwrap().state(),
            StatusState::Failed(_)
        ));
        // As a one-shot action no readback comparison is made.
        assert!(configure(&det, &cfg, true).unwrap().success());
    }

    #[test]
    fn unknown_path_is_key_error() {
        let det = flat_detector();
        let cfg = DeviceConfig::new().with("nope", 1);
        assert!(matches!(configure(&det, &cfg, false), Err(MambaError::Key(_))));
    }
}
