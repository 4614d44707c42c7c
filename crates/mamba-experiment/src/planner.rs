//! Scan orchestration.
//!
//! The [`Planner`] resolves device names, runs pre-flight checks, builds
//! the plan and hands it to the [`RunEngine`] together with the callback
//! bundle of its family:
//!
//! | family | callbacks |
//! |---|---|
//! | step, grid | router, progress |
//! | step with an image detector | image filler, router, progress |
//! | fly, fly grid | plugin warm-up check, router, progress, frame counter |
//!
//! A fly scan with an auxiliary detector additionally configures that
//! detector before the run and restores it afterwards. The restore and the
//! motor velocity restore run as a cleanup, so they also happen when the
//! scan fails or is aborted.

use mamba_core::{
    Device, DeviceConfig, DeviceRegistry, Document, DocumentCallback, MambaError, MambaResult,
    Metadata, Publisher, StopDoc,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

use crate::checks::{
    check_base_velocity, check_encoder, check_primed, FrameCounterChecker, ImageFiller,
    PluginWarmupCheck,
};
use crate::fly::{fly_trajectory, table_value, FlyParams, FlyTrajectory, MotorProfile};
use crate::frag::{FlyStep, Fragment, GridConfig, GridFragmenter};
use crate::plan::{
    chain, finalize_wrapper, from_msgs, run_wrapper, stage_wrapper, Cleanup, Msg, Plan,
    RunMetadata,
};
use crate::plan_store::{MotorRange, ScanPlan};
use crate::plans::{self, Axis, MOVE_GROUP};
use crate::run_engine::{EngineHandle, RunEngine};

/// Group joined by sequencer writes.
const SEQ_GROUP: &str = "seq";
/// Time the warm-up table is given to complete.
const WARMUP_SECS: f64 = 0.1;
/// Hardware frame counter checked on fly detectors.
const FRAME_COUNTER: &str = "cam.array_counter";

/// Pre-flight tolerances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preflight {
    /// Allowed readback/encoder disagreement, user units.
    pub encoder_tolerance: f64,
    /// Sweep velocity must be at least this multiple of the base velocity.
    pub base_velocity_ratio: f64,
    /// Frames the hardware counter may lag behind the event count.
    pub counter_tolerance: u64,
}

impl Default for Preflight {
    fn default() -> Self {
        Self {
            encoder_tolerance: 0.01,
            base_velocity_ratio: 1.0,
            counter_tolerance: 1,
        }
    }
}

/// Settings applied to an auxiliary detector around a fly scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxDetector {
    pub name: String,
    /// Applied before the run opens.
    #[serde(default)]
    pub setup: DeviceConfig,
    /// Applied after the run closes.
    #[serde(default)]
    pub restore: DeviceConfig,
}

/// Forwards every document to a [`Publisher`] (the data router).
pub struct PublishCallback(pub Arc<dyn Publisher>);

impl DocumentCallback for PublishCallback {
    fn name(&self) -> &str {
        "router"
    }

    fn on_document(&mut self, doc: &Document) -> MambaResult<()> {
        self.0.push_document(doc);
        Ok(())
    }
}

// =============================================================================
// Fly plan
// =============================================================================

/// Messages of a fly scan, generated one fragment at a time.
struct FlyPlan {
    motor: Device,
    outer: Vec<Device>,
    sequencer: Device,
    traj: FlyTrajectory,
    snake: bool,
    fragments: GridFragmenter,
    pending: VecDeque<Msg>,
    done: bool,
}

impl FlyPlan {
    fn seq_set(&self, attr: &str, value: impl Into<mamba_core::Value>) -> MambaResult<Msg> {
        Ok(Msg::set(self.sequencer.require_signal(attr)?, value, SEQ_GROUP))
    }

    fn velocity(&self, value: f64) -> MambaResult<Msg> {
        Ok(Msg::set(
            self.motor.require_signal("velocity")?,
            value,
            MOVE_GROUP,
        ))
    }

    fn move_outer(&mut self, outer: &[f64]) {
        for (motor, pos) in self.outer.iter().zip(outer) {
            self.pending.push_back(Msg::set(motor, *pos, MOVE_GROUP));
        }
    }

    fn expand(&mut self, frag: Fragment) -> MambaResult<()> {
        self.pending.push_back(Msg::Checkpoint);
        self.pending
            .push_back(self.seq_set("seq.table", table_value(&frag.table))?);
        self.pending
            .push_back(self.seq_set("seq.repeats", frag.args.passes as i64)?);
        self.pending.push_back(Msg::wait(SEQ_GROUP));

        if frag.args.warmup {
            self.pending.push_back(self.seq_set("seq.enable", 1)?);
            self.pending.push_back(Msg::wait(SEQ_GROUP));
            self.pending.push_back(Msg::Sleep {
                seconds: WARMUP_SECS,
            });
            self.pending.push_back(self.seq_set("seq.enable", 0)?);
            self.pending.push_back(Msg::wait(SEQ_GROUP));
            return Ok(());
        }

        let first = match frag.steps.first() {
            Some(FlyStep::Sweep { outer, reverse, .. }) => Some((outer.clone(), *reverse)),
            _ => None,
        };
        if let Some((outer, reverse)) = first {
            self.move_outer(&outer);
            // The run-up of a reversed line is the run-out of a forward one.
            self.pending
                .push_back(Msg::set(&self.motor, self.traj.sweep_end(!reverse), MOVE_GROUP));
            self.pending.push_back(Msg::wait(MOVE_GROUP));
        }
        self.pending.push_back(self.velocity(self.traj.velocity)?);
        self.pending.push_back(Msg::wait(MOVE_GROUP));
        self.pending.push_back(self.seq_set("seq.enable", 1)?);
        self.pending.push_back(Msg::wait(SEQ_GROUP));

        for step in frag.steps {
            match step {
                FlyStep::Sweep { reverse, .. } => {
                    self.pending
                        .push_back(Msg::set(&self.motor, self.traj.sweep_end(reverse), MOVE_GROUP));
                    self.pending.push_back(Msg::wait(MOVE_GROUP));
                    self.pending.push_back(Msg::Complete {
                        device: self.sequencer.clone(),
                        points: self.traj.num as usize,
                    });
                    self.pending.push_back(Msg::Collect {
                        device: self.sequencer.clone(),
                    });
                    self.pending.push_back(Msg::Checkpoint);
                }
                FlyStep::Turnaround { outer, .. } => {
                    self.move_outer(&outer);
                    if !self.snake {
                        self.pending
                            .push_back(Msg::set(&self.motor, self.traj.run_up(), MOVE_GROUP));
                    }
                    self.pending.push_back(Msg::wait(MOVE_GROUP));
                }
                FlyStep::Prepare => {}
            }
        }
        self.pending.push_back(self.seq_set("seq.enable", 0)?);
        self.pending.push_back(Msg::wait(SEQ_GROUP));
        Ok(())
    }
}

impl Iterator for FlyPlan {
    type Item = Msg;

    fn next(&mut self) -> Option<Msg> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Some(msg);
            }
            if self.done {
                return None;
            }
            let frag = self.fragments.next()?;
            if let Err(e) = self.expand(frag) {
                self.done = true;
                self.pending.clear();
                warn!(error = %e, "cannot expand fly fragment");
                return Some(Msg::CloseRun {
                    exit_status: mamba_core::ExitStatus::Fail,
                    reason: e.to_string(),
                });
            }
        }
    }
}

/// Put back the velocity captured when the motor was staged.
fn restore_velocity(motor: &Device) -> Vec<Msg> {
    match (motor.captured("velocity"), motor.signal("velocity")) {
        (Some(velocity), Some(signal)) => vec![
            Msg::Set {
                target: signal.into(),
                value: velocity,
                group: Some(MOVE_GROUP.to_string()),
            },
            Msg::wait(MOVE_GROUP),
        ],
        _ => Vec::new(),
    }
}

fn configure_msg(device: &Device, config: &DeviceConfig) -> Vec<Msg> {
    if config.is_empty() {
        return Vec::new();
    }
    vec![Msg::Configure {
        device: device.clone(),
        config: config.clone(),
        action: false,
    }]
}

// =============================================================================
// Planner
// =============================================================================

/// Entry point for every scan family.
#[derive(Clone)]
pub struct Planner {
    engine: RunEngine,
    registry: DeviceRegistry,
    publisher: Arc<dyn Publisher>,
    preflight: Preflight,
    sequencer: String,
    md: Metadata,
}

impl Planner {
    pub fn new(engine: RunEngine, registry: DeviceRegistry, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            engine,
            registry,
            publisher,
            preflight: Preflight::default(),
            sequencer: "panda".to_string(),
            md: Metadata::new(),
        }
    }

    pub fn with_preflight(mut self, preflight: Preflight) -> Self {
        self.preflight = preflight;
        self
    }

    /// Name of the sequencer device driving fly scans.
    pub fn with_sequencer(mut self, name: &str) -> Self {
        self.sequencer = name.to_string();
        self
    }

    /// Metadata added to every run.
    pub fn with_md(mut self, md: Metadata) -> Self {
        self.md = md;
        self
    }

    pub fn handle(&self) -> EngineHandle {
        self.engine.handle()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn devices(&self, names: &[String]) -> MambaResult<Vec<Device>> {
        names.iter().map(|n| self.registry.require(n)).collect()
    }

    fn axes(&self, ranges: &[MotorRange]) -> MambaResult<Vec<Axis>> {
        ranges
            .iter()
            .map(|r| {
                let motor = self.registry.require(&r.name)?;
                Ok(Axis::new(&motor, r.start, r.stop, r.point_num))
            })
            .collect()
    }

    fn step_callbacks(&self, detectors: &[Device]) -> Vec<Box<dyn DocumentCallback>> {
        let mut callbacks: Vec<Box<dyn DocumentCallback>> = Vec::new();
        if detectors.iter().any(|d| d.frames().is_some()) {
            callbacks.push(Box::new(ImageFiller::new(
                self.registry.clone(),
                self.publisher.clone(),
            )));
        }
        callbacks.push(Box::new(PublishCallback(self.publisher.clone())));
        callbacks.push(Box::new(crate::progress::ProgressReporter::new(
            self.publisher.clone(),
        )));
        callbacks
    }

    fn fly_callbacks(&self, detectors: &[Device]) -> MambaResult<Vec<Box<dyn DocumentCallback>>> {
        let mut callbacks: Vec<Box<dyn DocumentCallback>> = vec![
            Box::new(PluginWarmupCheck::new(detectors.to_vec())),
            Box::new(PublishCallback(self.publisher.clone())),
            Box::new(crate::progress::ProgressReporter::new(
                self.publisher.clone(),
            )),
        ];
        for det in detectors.iter().filter(|d| d.signal(FRAME_COUNTER).is_some()) {
            callbacks.push(Box::new(FrameCounterChecker::new(
                det,
                FRAME_COUNTER,
                self.preflight.counter_tolerance,
            )?));
        }
        Ok(callbacks)
    }

    /// Run an already built plan with the given callbacks.
    pub async fn execute(
        &self,
        plan: Plan,
        mut callbacks: Vec<Box<dyn DocumentCallback>>,
    ) -> MambaResult<Option<StopDoc>> {
        self.engine
            .run(plan, &mut callbacks, self.md.clone())
            .await
    }

    /// Move motors to absolute positions through the engine, outside any run.
    pub async fn mv(&self, moves: &[(String, f64)]) -> MambaResult<()> {
        let mut msgs = Vec::with_capacity(moves.len() + 1);
        for (name, position) in moves {
            let motor = self.registry.require(name)?;
            msgs.push(Msg::set(&motor, *position, MOVE_GROUP));
        }
        msgs.push(Msg::wait(MOVE_GROUP));
        self.execute(from_msgs(msgs), Vec::new()).await.map(|_| ())
    }

    pub async fn count(
        &self,
        detectors: &[String],
        num: u64,
        delay: f64,
    ) -> MambaResult<Option<StopDoc>> {
        let dets = self.devices(detectors)?;
        let callbacks = self.step_callbacks(&dets);
        self.execute(plans::count(dets, num, delay, Metadata::new()), callbacks)
            .await
    }

    pub async fn scan(
        &self,
        detectors: &[String],
        motor: &str,
        start: f64,
        stop: f64,
        num: u64,
    ) -> MambaResult<Option<StopDoc>> {
        let dets = self.devices(detectors)?;
        let motor = self.registry.require(motor)?;
        let callbacks = self.step_callbacks(&dets);
        let plan = plans::scan(dets, &motor, start, stop, num, Metadata::new());
        self.execute(plan, callbacks).await
    }

    /// Step grid over `axes`, slowest first.
    pub async fn grid(
        &self,
        detectors: &[String],
        axes: &[MotorRange],
        snake: bool,
    ) -> MambaResult<Option<StopDoc>> {
        let dets = self.devices(detectors)?;
        let axes = self.axes(axes)?;
        let callbacks = self.step_callbacks(&dets);
        self.execute(plans::grid(dets, axes, snake, Metadata::new()), callbacks)
            .await
    }

    /// Run a stored plan as a step grid.
    pub async fn run_plan(&self, plan: &ScanPlan) -> MambaResult<Option<StopDoc>> {
        if plan.motors.is_empty() {
            return Err(MambaError::Empty(format!("plan '{}' has no motors", plan.name)));
        }
        info!(plan = %plan.name, points = plan.num_points(), "running stored plan");
        self.grid(&plan.detectors, &plan.motors, plan.snake).await
    }

    /// Fly one line of `motor`.
    pub async fn fly(
        &self,
        detectors: &[String],
        motor: &str,
        params: &FlyParams,
        aux: Option<&AuxDetector>,
    ) -> MambaResult<Option<StopDoc>> {
        self.fly_grid(detectors, &[], motor, params, GridConfig::default(), aux)
            .await
    }

    /// Fly `motor` once per line of the step grid over `outer`.
    pub async fn fly_grid(
        &self,
        detectors: &[String],
        outer: &[MotorRange],
        motor: &str,
        params: &FlyParams,
        mut cfg: GridConfig,
        aux: Option<&AuxDetector>,
    ) -> MambaResult<Option<StopDoc>> {
        let dets = self.devices(detectors)?;
        let motor = self.registry.require(motor)?;
        let sequencer = self.registry.require(&self.sequencer)?;
        if sequencer.flyer().is_none() {
            return Err(MambaError::Config(format!(
                "'{}' is not a sequencer",
                self.sequencer
            )));
        }
        let outer_axes = self.axes(outer)?;
        let aux_device = aux.map(|a| self.registry.require(&a.name)).transpose()?;

        // Pre-flight.
        let profile = MotorProfile::read(&motor)?;
        check_encoder(&motor, &profile, self.preflight.encoder_tolerance)?;
        let traj = fly_trajectory(params, &profile, cfg.snake.fly())?;
        check_base_velocity(&motor, &traj, &profile, self.preflight.base_velocity_ratio)?;
        check_primed(&dets)?;

        let fragments = GridFragmenter::new(outer_axes.clone(), &traj, &mut cfg)?;
        let num_points = fragments.num_points();
        let shape = cfg.progress.clone().unwrap_or_else(|| vec![num_points]);
        let outer_names: Vec<&str> = outer_axes.iter().map(|a| a.motor.name()).collect();
        let det_names: Vec<&str> = dets.iter().map(|d| d.name()).collect();
        let plan_name = if outer_axes.is_empty() { "fly" } else { "fly_grid" };
        let run_md = RunMetadata::new(plan_name)
            .with_points(num_points)
            .with_progress(&shape)
            .with_md("motors", json!(outer_names))
            .with_md("fly_motor", json!(motor.name()))
            .with_md("detectors", json!(det_names))
            .with_md("velocity", json!(traj.velocity))
            .with_md("period", json!(traj.period));
        info!(
            motor = %motor.name(),
            lines = fragments.total_lines(),
            points = num_points,
            velocity = traj.velocity,
            "fly scan planned"
        );

        let fly = FlyPlan {
            motor: motor.clone(),
            outer: outer_axes.iter().map(|a| a.motor.clone()).collect(),
            sequencer: sequencer.clone(),
            traj,
            snake: cfg.snake.fly(),
            fragments,
            pending: VecDeque::new(),
            done: false,
        };

        let mut staged = vec![sequencer];
        staged.extend(outer_axes.iter().map(|a| a.motor.clone()));
        staged.push(motor.clone());
        staged.extend(dets.iter().cloned());

        let mut parts: Vec<Plan> = Vec::new();
        let mut aux_restore = Vec::new();
        if let (Some(aux), Some(device)) = (aux, aux_device.as_ref()) {
            parts.push(from_msgs(configure_msg(device, &aux.setup)));
            aux_restore = configure_msg(device, &aux.restore);
            staged.push(device.clone());
        }
        parts.push(run_wrapper(run_md, Box::new(fly)));
        let cleanup = Cleanup::new(move || {
            let mut msgs = restore_velocity(&motor);
            msgs.extend(aux_restore.iter().cloned());
            msgs
        });
        let plan = stage_wrapper(staged, finalize_wrapper(chain(parts), cleanup));

        let callbacks = self.fly_callbacks(&dets)?;
        self.execute(plan, callbacks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fly::FlyParams;
    use crate::frag::Div;

    fn fly_plan(snake: bool, lines: u64) -> Vec<Msg> {
        let motor = mamba_core::DeviceBuilder::new("mx")
            .readback("user_readback", 0.0)
            .signal("velocity", 1.0, mamba_core::Kind::Config)
            .build();
        let my = mamba_core::DeviceBuilder::new("my")
            .readback("user_readback", 0.0)
            .build();
        let sequencer = mamba_core::DeviceBuilder::new("panda")
            .device("seq", |b| {
                b.signal("table", mamba_core::Value::Array(Vec::new()), mamba_core::Kind::Config)
                    .signal("enable", 0, mamba_core::Kind::Omitted)
                    .signal("repeats", 1, mamba_core::Kind::Config)
            })
            .build();
        let profile = MotorProfile {
            velocity: 1.0,
            acceleration: 0.1,
            base_velocity: 0.0,
            encoder_offset: 0.0,
            encoder_scale: 1e-3,
        };
        let traj = fly_trajectory(&FlyParams::new(0.0, 1.0, 4), &profile, snake).unwrap();
        let mut cfg = GridConfig {
            div: Div::Lines(lines),
            snake: snake.into(),
            progress: None,
        };
        let fragments =
            GridFragmenter::new(vec![Axis::new(&my, 0.0, 1.0, lines)], &traj, &mut cfg).unwrap();
        FlyPlan {
            motor,
            outer: vec![my],
            sequencer,
            traj,
            snake,
            fragments,
            pending: VecDeque::new(),
            done: false,
        }
        .collect()
    }

    fn count(msgs: &[Msg], command: &str) -> usize {
        msgs.iter().filter(|m| m.command() == command).count()
    }

    #[test]
    fn one_collect_per_line() {
        let msgs = fly_plan(true, 3);
        assert_eq!(count(&msgs, "collect"), 3);
        assert_eq!(count(&msgs, "complete"), 3);
        // only the warm-up sleeps
        assert_eq!(count(&msgs, "sleep"), 1);
        assert!(msgs
            .iter()
            .all(|m| !matches!(m, Msg::CloseRun { .. })));
    }

    #[test]
    fn raster_lines_return_to_the_run_up() {
        let snake = fly_plan(true, 2);
        let raster = fly_plan(false, 2);
        let mx_moves = |msgs: &[Msg]| {
            msgs.iter()
                .filter(|m| matches!(m, Msg::Set { target, .. } if target.name() == "mx"))
                .count()
        };
        // run-up, two sweeps; raster adds a return between lines
        assert_eq!(mx_moves(&snake), 3);
        assert_eq!(mx_moves(&raster), 4);
    }

    #[test]
    fn preflight_defaults() {
        let p: Preflight = serde_json::from_str("{}").unwrap();
        assert_eq!(p, Preflight::default());
        let aux: AuxDetector = serde_json::from_str(r#"{"name": "det"}"#).unwrap();
        assert!(aux.setup.is_empty());
    }
}
