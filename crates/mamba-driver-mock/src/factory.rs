//! Builds simulated devices from the `devices:` configuration section.
//!
//! ```yaml
//! devices:
//!   mx: { type: motor, velocity: 2.0 }
//!   det: { type: detector }
//!   cam1: { type: camera, width: 32, height: 32 }
//!   panda: { type: sequencer, posa: mx, outputs: [cam1] }
//! ```

use mamba_core::{DeviceRegistry, MambaError, MambaResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::sim_camera::{SimCamera, SimCameraConfig};
use crate::sim_detector::{
    sim_detector, sim_threaded_detector, SimDetectorConfig, SimThreadedDetectorConfig,
};
use crate::sim_motor::{SimMotor, SimMotorConfig};
use crate::sim_sequencer::{SimSequencer, SimSequencerConfig};

/// One entry of the `devices:` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceSpec {
    Motor(SimMotorConfig),
    Detector(SimDetectorConfig),
    ThreadedDetector(SimThreadedDetectorConfig),
    Camera(SimCameraConfig),
    Sequencer(SimSequencerConfig),
}

/// Handles to the simulations behind registered devices, for controls that
/// are not expressed as signals (camera warm-up, motor stop counts).
#[derive(Default, Clone)]
pub struct SimDevices {
    pub motors: BTreeMap<String, Arc<SimMotor>>,
    pub cameras: BTreeMap<String, Arc<SimCamera>>,
    pub sequencers: BTreeMap<String, Arc<SimSequencer>>,
}

/// Instantiate `specs` into `registry`. Sequencer wiring is resolved after
/// every device exists, so declaration order does not matter.
pub fn build_devices(
    specs: &BTreeMap<String, DeviceSpec>,
    registry: &DeviceRegistry,
) -> MambaResult<SimDevices> {
    let mut sims = SimDevices::default();
    let mut wiring = Vec::new();

    for (name, spec) in specs {
        let device = match spec {
            DeviceSpec::Motor(cfg) => {
                let (device, motor) = SimMotor::create(name, cfg.clone());
                sims.motors.insert(name.clone(), motor);
                device
            }
            DeviceSpec::Detector(cfg) => sim_detector(name, cfg.clone()),
            DeviceSpec::ThreadedDetector(cfg) => sim_threaded_detector(name, cfg.clone()),
            DeviceSpec::Camera(cfg) => {
                let (device, camera) = SimCamera::create(name, cfg.clone());
                sims.cameras.insert(name.clone(), camera);
                device
            }
            DeviceSpec::Sequencer(cfg) => {
                let (device, seq) = SimSequencer::create(name);
                sims.sequencers.insert(name.clone(), seq);
                wiring.push((name.clone(), cfg.clone()));
                device
            }
        };
        registry.register(device)?;
    }

    for (name, cfg) in wiring {
        let Some(seq) = sims.sequencers.get(&name) else {
            continue;
        };
        if let Some(posa) = &cfg.posa {
            let motor = sims.motors.get(posa).ok_or_else(|| {
                MambaError::Config(format!("{}: posa '{}' is not a motor", name, posa))
            })?;
            seq.bind_posa(motor.encoder_raw(), motor.readback());
        }
        for output in &cfg.outputs {
            seq.add_output(registry.get(output).ok_or_else(|| {
                MambaError::Config(format!("{}: unknown output '{}'", name, output))
            })?);
        }
        info!(sequencer = %name, posa = ?cfg.posa, outputs = ?cfg.outputs, "sequencer wired");
    }
    Ok(sims)
}
