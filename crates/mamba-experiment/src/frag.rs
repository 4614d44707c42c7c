//! Grid fragmenter for fly grids.
//!
//! A fly grid sweeps the inner (fly) axis once per line while the outer
//! axes step. Sequencer tables are uploaded per fragment of consecutive
//! lines; each fragment runs its table `passes` times.
//!
//! The first fragment is a warm-up that runs the disable table with no
//! points so the capture block is primed. When the fly axis snakes, the
//! table of a fragment that starts on an odd line is the reverse table.
//! A snaking outer axis reverses its steps on odd passes of its parent
//! loop; the slowest axis has no parent and never reverses.

use mamba_core::{MambaError, MambaResult, SeqTable};
use serde::{Deserialize, Serialize};

use crate::fly::FlyTrajectory;
use crate::plans::Axis;

/// Fragment size: a number of lines, or `(s, p)` meaning `s` steps of outer
/// axis `p` (0 = slowest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Div {
    Lines(u64),
    Steps(u64, usize),
}

impl Default for Div {
    fn default() -> Self {
        Div::Lines(1)
    }
}

/// Which axes of a fly grid snake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Snake {
    /// Every axis, or none.
    All(bool),
    /// One flag per axis: outer axes slowest first, then the fly axis.
    Axes(Vec<bool>),
}

impl Default for Snake {
    fn default() -> Self {
        Snake::All(false)
    }
}

impl From<bool> for Snake {
    fn from(all: bool) -> Self {
        Snake::All(all)
    }
}

impl Snake {
    /// Whether the fly axis reverses on odd lines.
    pub fn fly(&self) -> bool {
        match self {
            Snake::All(all) => *all,
            Snake::Axes(flags) => flags.last().copied().unwrap_or(false),
        }
    }

    /// Flags for a grid of `axes` axes, fly axis included.
    pub fn flags(&self, axes: usize) -> MambaResult<Vec<bool>> {
        match self {
            Snake::All(all) => Ok(vec![*all; axes]),
            Snake::Axes(flags) if flags.len() == axes => Ok(flags.clone()),
            Snake::Axes(flags) => Err(MambaError::Syntax(format!(
                "snake lists {} axes, grid has {}",
                flags.len(),
                axes
            ))),
        }
    }
}

/// Grid options. The fragmenter writes the loop shape into `progress`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default)]
    pub div: Div,
    #[serde(default)]
    pub snake: Snake,
    /// Loop shape for the `simple` progress hint, outermost first.
    #[serde(skip)]
    pub progress: Option<Vec<u64>>,
}

/// What one fragment covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentArgs {
    pub num_points: u64,
    pub first_line: u64,
    pub lines: u64,
    /// Times the table is run.
    pub passes: u64,
    pub reverse: bool,
    pub warmup: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlyStep {
    /// Run the uploaded table once without moving.
    Prepare,
    /// Sweep one line.
    Sweep {
        line: u64,
        reverse: bool,
        outer: Vec<f64>,
    },
    /// Step the outer axes to `line` and bring the fly axis to its run-up.
    Turnaround {
        line: u64,
        reverse: bool,
        outer: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub table: SeqTable,
    pub args: FragmentArgs,
    pub steps: Vec<FlyStep>,
}

/// Iterator over the fragments of a fly grid.
pub struct GridFragmenter {
    outer: Vec<Axis>,
    forward: SeqTable,
    reverse: SeqTable,
    points_per_line: u64,
    snake: bool,
    outer_snake: Vec<bool>,
    size: u64,
    total_lines: u64,
    next_line: u64,
    warmed: bool,
}

impl GridFragmenter {
    /// Fragment a grid of `outer` axes (slowest first) around `traj`.
    pub fn new(outer: Vec<Axis>, traj: &FlyTrajectory, cfg: &mut GridConfig) -> MambaResult<Self> {
        if let Some(axis) = outer.iter().find(|a| a.num == 0) {
            return Err(MambaError::Syntax(format!(
                "outer axis '{}' has no points",
                axis.motor.name()
            )));
        }
        let k = outer.len();
        let size = match cfg.div {
            Div::Lines(s) => s,
            Div::Steps(s, p) if p < k => {
                s * outer[p + 1..].iter().map(|a| a.num).product::<u64>()
            }
            Div::Steps(_, p) => {
                return Err(MambaError::Syntax(format!(
                    "div pivot {} is not an outer axis (have {})",
                    p, k
                )))
            }
        };
        if size == 0 {
            return Err(MambaError::Syntax("fragment size must be positive".into()));
        }
        let total_lines = outer.iter().map(|a| a.num).product::<u64>();
        let mut outer_snake = cfg.snake.flags(k + 1)?;
        let snake = outer_snake.pop().unwrap_or(false);

        let mut shape: Vec<u64> = outer.iter().map(|a| a.num).collect();
        shape.push(traj.num);
        cfg.progress = Some(shape);

        Ok(Self {
            outer,
            forward: traj.forward.clone(),
            reverse: traj.reverse.clone(),
            points_per_line: traj.num,
            snake,
            outer_snake,
            size,
            total_lines,
            next_line: 0,
            warmed: false,
        })
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }

    pub fn num_points(&self) -> u64 {
        self.total_lines * self.points_per_line
    }

    fn reversed(&self, line: u64) -> bool {
        self.snake && line % 2 == 1
    }

    /// Outer axis positions of `line`, slowest axis first.
    pub fn outer_positions(&self, line: u64) -> Vec<f64> {
        let mut span = self.total_lines;
        self.outer
            .iter()
            .zip(&self.outer_snake)
            .map(|(axis, snake)| {
                let parent = line / span;
                span /= axis.num;
                let mut idx = (line / span) % axis.num;
                if *snake && parent % 2 == 1 {
                    idx = axis.num - 1 - idx;
                }
                axis.position(idx)
            })
            .collect()
    }
}

impl Iterator for GridFragmenter {
    type Item = Fragment;

    fn next(&mut self) -> Option<Fragment> {
        if !self.warmed {
            self.warmed = true;
            return Some(Fragment {
                table: SeqTable::disable(),
                args: FragmentArgs {
                    num_points: 0,
                    first_line: 0,
                    lines: 0,
                    passes: 1,
                    reverse: false,
                    warmup: true,
                },
                steps: vec![FlyStep::Prepare],
            });
        }
        if self.next_line >= self.total_lines {
            return None;
        }

        let first = self.next_line;
        let end = (first + self.size).min(self.total_lines);
        let lines = end - first;
        let last_fragment = end == self.total_lines;
        let reverse = self.reversed(first);

        let mut steps = Vec::with_capacity(2 * lines as usize);
        for line in first..end {
            steps.push(FlyStep::Sweep {
                line,
                reverse: self.reversed(line),
                outer: self.outer_positions(line),
            });
            if line + 1 < self.total_lines {
                steps.push(FlyStep::Turnaround {
                    line: line + 1,
                    reverse: self.reversed(line + 1),
                    outer: self.outer_positions(line + 1),
                });
            }
        }
        debug_assert!(!last_fragment || steps.len() as u64 == 2 * lines - 1);

        let (table, passes) = if self.snake {
            let table = if reverse { &self.reverse } else { &self.forward };
            (table.clone(), lines.div_ceil(2))
        } else {
            (self.forward.clone(), lines)
        };

        self.next_line = end;
        Some(Fragment {
            table,
            args: FragmentArgs {
                num_points: lines * self.points_per_line,
                first_line: first,
                lines,
                passes,
                reverse,
                warmup: false,
            },
            steps,
        })
    }
}
