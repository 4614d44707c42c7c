//! Simulated motor with an attached encoder.

use anyhow::{bail, Result};
use async_trait::async_trait;
use mamba_core::{Device, DeviceBuilder, Kind, Movable, Signal};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::sleep;

use crate::mode::{MockMode, MOTION_TICK};

/// Configuration for [`SimMotor`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimMotorConfig {
    pub initial_position: f64,
    /// Units per second.
    pub velocity: f64,
    /// Seconds to reach `velocity`.
    pub acceleration: f64,
    /// Lowest velocity the controller accepts.
    pub base_velocity: f64,
    pub encoder_offset: f64,
    /// User units per encoder count; negative for reversed polarity.
    pub encoder_scale: f64,
    /// Injected disagreement between readback and encoder, in user units.
    pub encoder_error: f64,
    pub mode: MockMode,
}

impl Default for SimMotorConfig {
    fn default() -> Self {
        Self {
            initial_position: 0.0,
            velocity: 1.0,
            acceleration: 0.1,
            base_velocity: 0.0,
            encoder_offset: 0.0,
            encoder_scale: 1e-4,
            encoder_error: 0.0,
            mode: MockMode::Instant,
        }
    }
}

/// Simulated motor.
///
/// Components of the built device:
///
/// | attr | kind | |
/// |---|---|---|
/// | `user_readback` | hinted | named like the motor |
/// | `user_setpoint` | normal | |
/// | `velocity`, `acceleration`, `base_velocity` | config | |
/// | `encoder.raw` | omitted | `(position − offset) / scale` |
/// | `encoder.offset`, `encoder.scale` | config | |
///
/// The velocity is captured on stage and left for the fly planner to
/// restore, since fly scans change it mid-run.
pub struct SimMotor {
    name: String,
    readback: Signal,
    setpoint: Signal,
    velocity: Signal,
    raw: Signal,
    offset: Signal,
    scale: Signal,
    encoder_error: f64,
    mode: MockMode,
    stop_requested: AtomicBool,
    stop_count: AtomicU32,
    moving: AtomicBool,
}

impl SimMotor {
    /// Build the motor and its device. The device owns the motor.
    pub fn create(name: &str, cfg: SimMotorConfig) -> (Device, Arc<SimMotor>) {
        let builder = DeviceBuilder::new(name);
        let readback = Signal::with_kind(name, cfg.initial_position, Kind::Hinted);
        let setpoint = Signal::with_kind(
            builder.child_name("user_setpoint"),
            cfg.initial_position,
            Kind::Normal,
        );
        let velocity =
            Signal::with_kind(builder.child_name("velocity"), cfg.velocity, Kind::Config);
        let acceleration = Signal::with_kind(
            builder.child_name("acceleration"),
            cfg.acceleration,
            Kind::Config,
        );
        let base_velocity = Signal::with_kind(
            builder.child_name("base_velocity"),
            cfg.base_velocity,
            Kind::Config,
        );

        let scale = if cfg.encoder_scale == 0.0 { 1.0 } else { cfg.encoder_scale };
        let encoder_name = builder.child_name("encoder");
        let raw = Signal::with_kind(
            format!("{}_raw", encoder_name),
            (cfg.initial_position + cfg.encoder_error - cfg.encoder_offset) / scale,
            Kind::Omitted,
        );
        let offset = Signal::with_kind(
            format!("{}_offset", encoder_name),
            cfg.encoder_offset,
            Kind::Config,
        );
        let scale_sig = Signal::with_kind(format!("{}_scale", encoder_name), scale, Kind::Config);

        let motor = Arc::new(SimMotor {
            name: name.to_string(),
            readback: readback.clone(),
            setpoint: setpoint.clone(),
            velocity: velocity.clone(),
            raw: raw.clone(),
            offset: offset.clone(),
            scale: scale_sig.clone(),
            encoder_error: cfg.encoder_error,
            mode: cfg.mode,
            stop_requested: AtomicBool::new(false),
            stop_count: AtomicU32::new(0),
            moving: AtomicBool::new(false),
        });

        let device = builder
            .with_signal("user_readback", readback)
            .with_signal("user_setpoint", setpoint)
            .with_signal("velocity", velocity)
            .with_signal("acceleration", acceleration)
            .with_signal("base_velocity", base_velocity)
            .with_device(
                "encoder",
                DeviceBuilder::new(encoder_name)
                    .with_signal("raw", raw)
                    .with_signal("offset", offset)
                    .with_signal("scale", scale_sig)
                    .build(),
            )
            .stage_keep("velocity")
            .movable(motor.clone())
            .build();
        (device, motor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of `stop()` calls received.
    pub fn stop_count(&self) -> u32 {
        self.stop_count.load(Ordering::SeqCst)
    }

    pub fn is_moving(&self) -> bool {
        self.moving.load(Ordering::SeqCst)
    }

    /// Encoder count signal, the position input of a sequencer.
    pub fn encoder_raw(&self) -> Signal {
        self.raw.clone()
    }

    pub fn readback(&self) -> Signal {
        self.readback.clone()
    }

    fn apply(&self, position: f64) {
        self.readback.update(position);
        let offset = self.offset.get().as_f64().unwrap_or(0.0);
        let scale = self.scale.get().as_f64().filter(|s| *s != 0.0).unwrap_or(1.0);
        self.raw.update((position + self.encoder_error - offset) / scale);
    }

    fn current(&self) -> f64 {
        self.readback.get().as_f64().unwrap_or(0.0)
    }
}

#[async_trait]
impl Movable for SimMotor {
    async fn move_abs(&self, target: f64) -> Result<()> {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.setpoint.update(target);

        let velocity = self.velocity.get().as_f64().unwrap_or(0.0);
        if self.mode == MockMode::Instant || velocity <= 0.0 {
            self.apply(target);
            return Ok(());
        }

        self.moving.store(true, Ordering::SeqCst);
        let step = velocity * MOTION_TICK.as_secs_f64();
        loop {
            if self.stop_requested.load(Ordering::SeqCst) {
                self.moving.store(false, Ordering::SeqCst);
                bail!("{} stopped at {}", self.name, self.current());
            }
            let position = self.current();
            let remaining = target - position;
            if remaining.abs() <= step {
                self.apply(target);
                break;
            }
            self.apply(position + step * remaining.signum());
            sleep(MOTION_TICK).await;
        }
        self.moving.store(false, Ordering::SeqCst);
        tracing::debug!(motor = %self.name, target, "move complete");
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.current())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(motor = %self.name, "stop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mamba_core::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn instant_move_updates_encoder() {
        let (dev, motor) = SimMotor::create(
            "mx",
            SimMotorConfig {
                encoder_offset: 1.0,
                encoder_scale: 0.5,
                ..Default::default()
            },
        );
        dev.set(&Value::Float(3.0))
            .unwrap()
            .wait(Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(motor.position().await.unwrap(), 3.0);
        assert_eq!(dev.signal("encoder.raw").unwrap().get(), Value::Float(4.0));
        assert_eq!(dev.hints(), vec!["mx"]);
    }

    #[tokio::test(start_paused = true)]
    async fn realistic_move_can_be_stopped() {
        let (dev, motor) = SimMotor::create(
            "my",
            SimMotorConfig {
                velocity: 1.0,
                mode: MockMode::Realistic,
                ..Default::default()
            },
        );
        let status = dev.set(&Value::Float(10.0)).unwrap();
        tokio::time::sleep(Duration::from_millis(105)).await;
        assert!(motor.is_moving());
        dev.stop().await.unwrap();
        assert!(status.wait(None).await.is_err());
        assert_eq!(motor.stop_count(), 1);
        let pos = motor.position().await.unwrap();
        assert!(pos > 0.0 && pos < 1.0, "stopped at {}", pos);
    }
}
