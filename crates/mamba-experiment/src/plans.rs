//! Step plans: count, 1-D scan and n-D grid.
//!
//! All three are the same state machine, [`StepScan`], over zero or more
//! axes. Each point runs:
//!
//! ```text
//! checkpoint → set(changed axes) → wait(move) → [sleep(settle)]
//!            → trigger(detectors) → wait(primary)
//!            → create(primary) → read(axes + detectors) → save
//! ```
//!
//! Axes are listed slowest first. With `snake`, every axis but the
//! outermost reverses direction on odd passes of its parent loop.

use mamba_core::{Device, Metadata};
use serde_json::json;
use std::collections::VecDeque;

use crate::plan::{run_wrapper, stage_wrapper, Msg, Plan, RunMetadata};

/// Group joined by motor moves.
pub const MOVE_GROUP: &str = "move";
/// Group joined by detector triggers.
pub const PRIMARY: &str = "primary";

/// One scanned axis: `num` evenly spaced points from `start` to `stop`.
#[derive(Debug, Clone)]
pub struct Axis {
    pub motor: Device,
    pub start: f64,
    pub stop: f64,
    pub num: u64,
}

impl Axis {
    pub fn new(motor: &Device, start: f64, stop: f64, num: u64) -> Self {
        Self {
            motor: motor.clone(),
            start,
            stop,
            num,
        }
    }

    pub fn position(&self, idx: u64) -> f64 {
        if self.num <= 1 {
            return self.start;
        }
        self.start + (self.stop - self.start) * idx as f64 / (self.num - 1) as f64
    }
}

/// Current phase of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepScanStep {
    Checkpoint,
    MoveAxes,
    WaitMove,
    Settle,
    TriggerDetectors,
    WaitTrigger,
    Create,
    Read { idx: usize },
    Save,
}

/// Point-by-point scan over `axes` (possibly none).
pub struct StepScan {
    axes: Vec<Axis>,
    detectors: Vec<Device>,
    /// Axes and detectors read at each point, without duplicates.
    readables: Vec<Device>,
    snake: bool,
    num_points: u64,
    settle: f64,
    point: u64,
    last_indices: Option<Vec<u64>>,
    step: StepScanStep,
    pending: VecDeque<Msg>,
}

impl StepScan {
    pub fn new(axes: Vec<Axis>, detectors: Vec<Device>, snake: bool) -> Self {
        let num_points = axes.iter().map(|a| a.num).product();
        let mut readables: Vec<Device> = Vec::new();
        for dev in axes.iter().map(|a| &a.motor).chain(detectors.iter()) {
            if !readables.iter().any(|d| d.same(dev)) {
                readables.push(dev.clone());
            }
        }
        Self {
            axes,
            detectors,
            readables,
            snake,
            num_points,
            settle: 0.0,
            point: 0,
            last_indices: None,
            step: StepScanStep::Checkpoint,
            pending: VecDeque::new(),
        }
    }

    /// Repeat the detector sequence `num` times without moving anything.
    pub fn count(detectors: Vec<Device>, num: u64) -> Self {
        let mut scan = Self::new(Vec::new(), detectors, false);
        scan.num_points = num;
        scan
    }

    /// Sleep between moving and triggering.
    pub fn with_settle(mut self, seconds: f64) -> Self {
        self.settle = seconds.max(0.0);
        self
    }

    pub fn num_points(&self) -> u64 {
        self.num_points
    }

    /// Loop shape, outermost first.
    pub fn shape(&self) -> Vec<u64> {
        if self.axes.is_empty() {
            vec![self.num_points]
        } else {
            self.axes.iter().map(|a| a.num).collect()
        }
    }

    pub fn devices(&self) -> Vec<Device> {
        self.readables.clone()
    }

    /// Per-axis indices of linear point `i`.
    pub fn indices(&self, i: u64) -> Vec<u64> {
        let mut indices = vec![0; self.axes.len()];
        let mut span = self.num_points.max(1);
        for (j, axis) in self.axes.iter().enumerate() {
            let n = axis.num.max(1);
            let parent = i / span;
            span /= n;
            let mut idx = (i / span) % n;
            if self.snake && j > 0 && parent % 2 == 1 {
                idx = n - 1 - idx;
            }
            indices[j] = idx;
        }
        indices
    }

    fn move_msgs(&mut self) -> Vec<Msg> {
        let indices = self.indices(self.point);
        let msgs = self
            .axes
            .iter()
            .enumerate()
            .filter(|(j, _)| {
                self.last_indices
                    .as_ref()
                    .map_or(true, |last| last[*j] != indices[*j])
            })
            .map(|(j, axis)| Msg::set(&axis.motor, axis.position(indices[j]), MOVE_GROUP))
            .collect();
        self.last_indices = Some(indices);
        msgs
    }
}

impl Iterator for StepScan {
    type Item = Msg;

    fn next(&mut self) -> Option<Msg> {
        if let Some(msg) = self.pending.pop_front() {
            return Some(msg);
        }
        if self.point >= self.num_points {
            return None;
        }

        let msg = match self.step {
            StepScanStep::Checkpoint => {
                self.step = StepScanStep::MoveAxes;
                Msg::Checkpoint
            }
            StepScanStep::MoveAxes => {
                let moves = self.move_msgs();
                self.step = if moves.is_empty() {
                    StepScanStep::Settle
                } else {
                    StepScanStep::WaitMove
                };
                self.pending.extend(moves);
                return self.next();
            }
            StepScanStep::WaitMove => {
                self.step = StepScanStep::Settle;
                Msg::wait(MOVE_GROUP)
            }
            StepScanStep::Settle => {
                self.step = StepScanStep::TriggerDetectors;
                if self.settle > 0.0 && (!self.axes.is_empty() || self.point > 0) {
                    Msg::Sleep {
                        seconds: self.settle,
                    }
                } else {
                    return self.next();
                }
            }
            StepScanStep::TriggerDetectors => {
                self.step = if self.detectors.is_empty() {
                    StepScanStep::Create
                } else {
                    StepScanStep::WaitTrigger
                };
                let triggers = self.detectors.iter().map(Msg::trigger).collect::<Vec<_>>();
                self.pending.extend(triggers);
                return self.next();
            }
            StepScanStep::WaitTrigger => {
                self.step = StepScanStep::Create;
                Msg::wait(PRIMARY)
            }
            StepScanStep::Create => {
                self.step = StepScanStep::Read { idx: 0 };
                Msg::create(PRIMARY)
            }
            StepScanStep::Read { idx } => {
                if let Some(dev) = self.readables.get(idx) {
                    self.step = StepScanStep::Read { idx: idx + 1 };
                    Msg::read(dev)
                } else {
                    self.step = StepScanStep::Save;
                    return self.next();
                }
            }
            StepScanStep::Save => {
                self.point += 1;
                self.step = StepScanStep::Checkpoint;
                Msg::Save
            }
        };
        Some(msg)
    }
}

fn wrap(name: &str, scan: StepScan, md: Metadata) -> Plan {
    let motors: Vec<&str> = scan.axes.iter().map(|a| a.motor.name()).collect();
    let detectors: Vec<&str> = scan.detectors.iter().map(|d| d.name()).collect();
    let mut run_md = RunMetadata::new(name)
        .with_points(scan.num_points())
        .with_progress(&scan.shape())
        .with_md("motors", json!(motors))
        .with_md("detectors", json!(detectors));
    run_md.md.extend(md);
    let devices = scan.devices();
    stage_wrapper(devices, run_wrapper(run_md, Box::new(scan)))
}

/// `num` readings of `detectors`, `delay` seconds apart.
pub fn count(detectors: Vec<Device>, num: u64, delay: f64, md: Metadata) -> Plan {
    wrap(
        "count",
        StepScan::count(detectors, num).with_settle(delay),
        md,
    )
}

/// 1-D step scan of `motor`.
pub fn scan(
    detectors: Vec<Device>,
    motor: &Device,
    start: f64,
    stop: f64,
    num: u64,
    md: Metadata,
) -> Plan {
    wrap(
        "scan",
        StepScan::new(vec![Axis::new(motor, start, stop, num)], detectors, false),
        md,
    )
}

/// n-D step grid. `axes` are listed slowest first.
pub fn grid(detectors: Vec<Device>, axes: Vec<Axis>, snake: bool, md: Metadata) -> Plan {
    wrap("grid", StepScan::new(axes, detectors, snake), md)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mamba_core::{DeviceBuilder, Kind};

    fn motor(name: &str) -> Device {
        DeviceBuilder::new(name).readback("user_readback", 0.0).build()
    }

    fn det() -> Device {
        DeviceBuilder::new("d").signal("value", 0, Kind::Hinted).build()
    }

    fn set_targets(plan: impl Iterator<Item = Msg>, name: &str) -> Vec<f64> {
        plan.filter_map(|m| match m {
            Msg::Set { target, value, .. } if target.name() == name => value.as_f64(),
            _ => None,
        })
        .collect()
    }

    #[test]
    fn linear_scan_positions() {
        let mx = motor("mx");
        let plan = StepScan::new(vec![Axis::new(&mx, 0.0, 1.0, 5)], vec![det()], false);
        assert_eq!(plan.num_points(), 5);
        assert_eq!(set_targets(plan, "mx"), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn snake_reverses_inner_axis_on_odd_rows() {
        let mx = motor("mx");
        let my = motor("my");
        let axes = vec![Axis::new(&my, 0.0, 2.0, 2), Axis::new(&mx, 0.0, 1.0, 3)];
        let snake = StepScan::new(axes.clone(), vec![det()], true);
        // mx does not move between the last point of a row and the first of the next.
        assert_eq!(set_targets(snake, "mx"), vec![0.0, 0.5, 1.0, 0.5, 0.0]);

        let raster = StepScan::new(axes, vec![det()], false);
        let idx: Vec<Vec<u64>> = (0..6).map(|i| raster.indices(i)).collect();
        assert_eq!(idx[3], vec![1, 0]);
        assert_eq!(set_targets(raster, "my"), vec![0.0, 2.0]);
    }

    #[test]
    fn point_sequence_matches_the_template() {
        let d = det();
        let mut plan = StepScan::new(vec![Axis::new(&motor("mx"), 0.0, 1.0, 2)], vec![d], false)
            .with_settle(0.1);
        let mut commands = Vec::new();
        while let Some(cmd) = plan.next() {
            commands.push(cmd.command());
        }
        assert_eq!(
            &commands[..10],
            &[
                "checkpoint",
                "set",
                "wait",
                "sleep",
                "trigger",
                "wait",
                "create",
                "read",
                "read",
                "save"
            ]
        );
        assert_eq!(commands.len(), 20);
    }

    #[test]
    fn count_reads_detectors_only() {
        let plan = count(vec![det()], 3, 0.0, Metadata::new());
        let msgs: Vec<Msg> = plan.collect();
        let saves = msgs.iter().filter(|m| matches!(m, Msg::Save)).count();
        assert_eq!(saves, 3);
        let open = msgs.iter().find_map(|m| match m {
            Msg::OpenRun(md) => Some(md.clone()),
            _ => None,
        });
        let open = open.unwrap();
        assert_eq!(open.num_points, Some(3));
        assert_eq!(open.hints["progress"], json!(["simple", 3]));
        assert!(!msgs.iter().any(|m| matches!(m, Msg::Set { .. })));
    }

    #[test]
    fn grid_records_motors_in_metadata() {
        let mx = motor("mx");
        let my = motor("my");
        let mut md = Metadata::new();
        md.insert("sample".into(), json!("Si"));
        let plan = grid(
            vec![det()],
            vec![Axis::new(&my, 0.0, 2.0, 2), Axis::new(&mx, 0.0, 1.0, 3)],
            true,
            md,
        );
        let open = plan
            .filter_map(|m| match m {
                Msg::OpenRun(md) => Some(md),
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(open.md["motors"], json!(["my", "mx"]));
        assert_eq!(open.md["sample"], json!("Si"));
        assert_eq!(open.hints["progress"], json!(["simple", 2, 3]));
        assert_eq!(open.num_points, Some(6));
    }
}
