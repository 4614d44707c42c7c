//! Simulated hardware for the mamba scan core.
//!
//! All simulations use async-safe timing (`tokio::time::sleep`) and run
//! without delay in [`MockMode::Instant`], the default.
//!
//! # Available Simulations
//!
//! - [`SimMotor`]: velocity-limited axis with an encoder and `stop()`
//! - [`sim_detector`]: monotone counter, software trigger
//! - [`sim_threaded_detector`]: busy flag, threaded trigger with timeout
//! - [`SimCamera`]: image frames, file plugin needing warm-up
//! - [`SimSequencer`]: position-compare sequencer with position capture
//!
//! Devices are usually created from configuration with [`build_devices`].

pub mod factory;
pub mod mode;
mod pattern;
pub mod sim_camera;
pub mod sim_detector;
pub mod sim_motor;
pub mod sim_sequencer;

pub use factory::{build_devices, DeviceSpec, SimDevices};
pub use mode::MockMode;
pub use pattern::generate_test_pattern;
pub use sim_camera::{SimCamera, SimCameraConfig, FRAME_EXTERNAL};
pub use sim_detector::{
    sim_detector, sim_threaded_detector, SimDetectorConfig, SimThreadedDetectorConfig,
};
pub use sim_motor::{SimMotor, SimMotorConfig};
pub use sim_sequencer::{encode_table, SimSequencer, SimSequencerConfig};
