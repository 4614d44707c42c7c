//! Simulated area detector with an image file plugin.

use mamba_core::{Device, DeviceBuilder, Frame, FrameSource, Kind, Signal, SoftTrigger, Status};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::pattern::generate_test_pattern;

/// Tag marking the camera's image key as a frame reference.
pub const FRAME_EXTERNAL: &str = "FRAME";

/// Configuration for [`SimCamera`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimCameraConfig {
    pub width: u32,
    pub height: u32,
    pub exposure: f64,
    /// Frames kept for [`FrameSource::frame`] lookups.
    pub history: usize,
}

impl Default for SimCameraConfig {
    fn default() -> Self {
        Self {
            width: 16,
            height: 16,
            exposure: 0.01,
            history: 64,
        }
    }
}

/// Simulated camera.
///
/// The `image` key of an event holds a frame id (`external = "FRAME"`); the
/// pixels are served through [`FrameSource`]. The `hdf` plugin must be
/// primed with [`SimCamera::warmup`] before it can take part in a fly scan.
pub struct SimCamera {
    name: String,
    width: u32,
    height: u32,
    history: usize,
    frames: Mutex<VecDeque<Frame>>,
    acquire: Signal,
    primed: Signal,
}

impl SimCamera {
    pub fn create(name: &str, cfg: SimCameraConfig) -> (Device, Arc<SimCamera>) {
        let builder = DeviceBuilder::new(name);
        let image = Signal::external(builder.child_name("image"), 0, FRAME_EXTERNAL);
        let cam_name = builder.child_name("cam");
        let acquire = Signal::with_kind(format!("{}_acquire", cam_name), 0, Kind::Omitted);
        let counter = Signal::with_kind(format!("{}_array_counter", cam_name), 0, Kind::Normal);
        let cam = DeviceBuilder::new(cam_name)
            .with_signal("acquire", acquire.clone())
            .signal("acquire_time", cfg.exposure, Kind::Config)
            .signal("image_mode", 0, Kind::Config)
            .signal("num_images", 1, Kind::Config)
            .signal("trigger_mode", 0, Kind::Config)
            .with_signal("array_counter", counter.clone())
            .stage_sig("image_mode", 1)
            .build();

        let hdf_name = builder.child_name("hdf");
        let primed = Signal::with_kind(format!("{}_primed", hdf_name), 0, Kind::Omitted);
        let hdf = DeviceBuilder::new(hdf_name)
            .signal("capture", 0, Kind::Omitted)
            .with_signal("primed", primed.clone())
            .signal("file_name", "", Kind::Config)
            .stage_sig("capture", 1)
            .build();

        let camera = Arc::new(SimCamera {
            name: name.to_string(),
            width: cfg.width.max(1),
            height: cfg.height.max(1),
            history: cfg.history.max(1),
            frames: Mutex::new(VecDeque::new()),
            acquire: acquire.clone(),
            primed,
        });

        let sink = Arc::downgrade(&camera);
        let frame_ref = image.clone();
        acquire.set_put_hook(Arc::new(move |s, v| {
            s.update(v.clone());
            if v.as_i64() == Some(1) {
                let id = counter.get().as_i64().unwrap_or(0) + 1;
                if let Some(camera) = sink.upgrade() {
                    camera.store(id as u64);
                }
                frame_ref.update(id);
                counter.update(id);
                s.update(0);
            }
            Status::finished()
        }));

        let device = builder
            .with_signal("image", image)
            .with_device("cam", cam)
            .with_device("hdf", hdf)
            .trigger(Arc::new(
                SoftTrigger::new("cam.acquire").with_counter("cam.array_counter"),
            ))
            .frames(camera.clone())
            .build();
        (device, camera)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prime the file plugin by acquiring one frame.
    pub fn warmup(&self) {
        self.acquire.put(1);
        self.primed.update(1);
        tracing::info!(camera = %self.name, "plugin primed");
    }

    pub fn is_primed(&self) -> bool {
        self.primed.get().as_i64() == Some(1)
    }

    fn store(&self, id: u64) {
        let frame = Frame {
            id,
            width: self.width,
            height: self.height,
            pixels: generate_test_pattern(self.width, self.height, id),
        };
        let mut frames = self.frames.lock();
        frames.push_back(frame);
        while frames.len() > self.history {
            frames.pop_front();
        }
    }
}

impl FrameSource for SimCamera {
    fn frame(&self, id: u64) -> Option<Frame> {
        self.frames.lock().iter().find(|f| f.id == id).cloned()
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use mamba_core::Value;

    #[test]
    fn trigger_produces_a_retrievable_frame() {
        let (dev, camera) = SimCamera::create("cam1", SimCameraConfig::default());
        assert!(dev.trigger().success());
        let reading = dev.read();
        assert_eq!(reading["cam1_image"].value, Value::Int(1));
        assert_eq!(reading["cam1_cam_array_counter"].value, Value::Int(1));
        assert_eq!(dev.describe()["cam1_image"].external.as_deref(), Some(FRAME_EXTERNAL));

        let frame = dev.frames().unwrap().frame(1).unwrap();
        assert_eq!(frame.pixels.len(), 16 * 16);
        assert!(camera.frame(2).is_none());
    }

    #[test]
    fn warmup_primes_the_plugin() {
        let (dev, camera) = SimCamera::create("cam1", SimCameraConfig::default());
        assert!(!camera.is_primed());
        camera.warmup();
        assert!(camera.is_primed());
        assert_eq!(dev.signal("cam.array_counter").unwrap().get(), Value::Int(1));
    }

    #[test]
    fn history_is_bounded() {
        let (dev, camera) = SimCamera::create(
            "cam1",
            SimCameraConfig {
                history: 2,
                ..Default::default()
            },
        );
        for _ in 0..4 {
            dev.trigger();
        }
        assert!(camera.frame(2).is_none());
        assert!(camera.frame(4).is_some());
    }
}
