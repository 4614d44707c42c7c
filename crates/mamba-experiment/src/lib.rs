//! `mamba-experiment`
//!
//! Plans, the run engine executing them, and the scan families built on
//! top: step scans and grids, fly lines and fly grids driven by a
//! position-compare sequencer.
//!
//! ## Modules
//!
//! - [`plan`]: the [`Msg`] vocabulary and plan composition
//! - [`plans`]: `count`, `scan` and `grid`
//! - [`run_engine`]: executes plans, emits documents, pause/resume/abort
//! - [`fly`]: fly trajectory and sequencer tables
//! - [`frag`]: splits fly grids into sequencer fragments
//! - [`progress`]: progress and ETA reporting
//! - [`checks`]: pre-flight checks and checking callbacks
//! - [`planner`]: resolves names, picks callbacks, runs a family
//! - [`plan_store`]: scan plans saved as YAML files

pub mod checks;
pub mod fly;
pub mod frag;
pub mod plan;
pub mod plan_store;
pub mod planner;
pub mod plans;
pub mod progress;
pub mod run_engine;

pub use fly::{fly_trajectory, FlyParams, FlyTrajectory, MotorProfile};
pub use frag::{Div, GridConfig, GridFragmenter, Snake};
pub use plan::{chain, from_msgs, run_wrapper, stage_wrapper, Msg, Plan, RunMetadata};
pub use plan_store::{MotorRange, PlanStore, ScanPlan};
pub use planner::{AuxDetector, Planner, Preflight, PublishCallback};
pub use plans::{count, grid, scan, Axis, StepScan};
pub use progress::ProgressReporter;
pub use run_engine::{EngineHandle, EngineState, LastError, RunEngine};
