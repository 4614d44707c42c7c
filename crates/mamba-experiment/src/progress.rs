//! Progress and ETA reporter.
//!
//! Reads `hints.progress = ["simple", n_k, …, n_0]` from `start` (outermost
//! loop first). Event `i` (0-based) is charged to the deepest loop that
//! wrapped on it: the largest `j` with `i mod gap_j == 0`, where `gap_j` is
//! the product of the loop sizes inside loop `j`. Each depth keeps the time
//! spent and the events charged to it, so slow outer moves are projected
//! separately from fast inner points:
//!
//! ```text
//! remain = Σ visited  elapsed_j / hits_j · (steps_j − hits_j)
//!        + mean · Σ unvisited steps_j
//! ```
//!
//! Each event publishes `scan/progress {fraction, eta}`.

use mamba_core::{
    now_secs, Document, DocumentCallback, MambaResult, MonitorDoc, Publisher, StartDoc,
};
use std::sync::Arc;
use tracing::debug;

/// Per-depth bookkeeping for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressState {
    /// Events belonging to each depth, innermost first.
    steps: Vec<u64>,
    /// Events per wrap of each depth, innermost first.
    gaps: Vec<u64>,
    hits: Vec<u64>,
    elapsed: Vec<f64>,
    total: u64,
    seen: u64,
    last_time: f64,
    fraction: f64,
}

impl ProgressState {
    /// Parse a `simple` hint. Returns `None` for anything else.
    pub fn from_hint(hint: &serde_json::Value, start_time: f64) -> Option<Self> {
        let items = hint.as_array()?;
        if items.first()?.as_str()? != "simple" {
            return None;
        }
        // Outermost first in the hint; innermost first here.
        let shape: Vec<u64> = items[1..]
            .iter()
            .rev()
            .map(|n| n.as_u64().filter(|n| *n > 0))
            .collect::<Option<_>>()?;
        if shape.is_empty() {
            return None;
        }
        let total: u64 = shape.iter().product();
        let mut gaps = Vec::with_capacity(shape.len());
        let mut gap = 1;
        for n in &shape {
            gaps.push(gap);
            gap *= n;
        }
        let depth = shape.len();
        let steps = (0..depth)
            .map(|j| {
                let here = total / gaps[j];
                if j + 1 < depth {
                    here - total / gaps[j + 1]
                } else {
                    here
                }
            })
            .collect();
        Some(Self {
            steps,
            gaps,
            hits: vec![0; depth],
            elapsed: vec![0.0; depth],
            total,
            seen: 0,
            last_time: start_time,
            fraction: 0.0,
        })
    }

    /// Depth charged with 0-based event `i`.
    pub fn depth(&self, i: u64) -> usize {
        self.gaps
            .iter()
            .rposition(|gap| i % gap == 0)
            .unwrap_or(0)
    }

    /// Account for one event at `time`; returns `(fraction, remaining secs)`.
    pub fn update(&mut self, time: f64) -> (f64, f64) {
        let depth = self.depth(self.seen);
        self.hits[depth] += 1;
        self.elapsed[depth] += (time - self.last_time).max(0.0);
        self.last_time = time;
        self.seen += 1;

        let fraction = (self.seen as f64 / self.total as f64).min(1.0);
        self.fraction = self.fraction.max(fraction);
        (self.fraction, self.remaining())
    }

    pub fn remaining(&self) -> f64 {
        let total_hits: u64 = self.hits.iter().sum();
        let total_elapsed: f64 = self.elapsed.iter().sum();
        let mean = if total_hits > 0 {
            total_elapsed / total_hits as f64
        } else {
            0.0
        };
        let mut remain = 0.0;
        for j in 0..self.steps.len() {
            let left = self.steps[j].saturating_sub(self.hits[j]) as f64;
            if self.hits[j] > 0 {
                remain += self.elapsed[j] / self.hits[j] as f64 * left;
            } else {
                remain += mean * left;
            }
        }
        remain
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }
}

/// Callback publishing `scan/progress` for runs carrying a progress hint.
pub struct ProgressReporter {
    publisher: Arc<dyn Publisher>,
    state: Option<ProgressState>,
}

impl ProgressReporter {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher,
            state: None,
        }
    }

    fn start(&mut self, doc: &StartDoc) {
        self.state = doc
            .hints
            .get("progress")
            .and_then(|hint| ProgressState::from_hint(hint, doc.time));
        if self.state.is_none() {
            debug!(run_uid = %doc.uid, "no usable progress hint");
        }
    }
}

impl DocumentCallback for ProgressReporter {
    fn name(&self) -> &str {
        "progress"
    }

    fn on_document(&mut self, doc: &Document) -> MambaResult<()> {
        match doc {
            Document::Start(start) => self.start(start),
            Document::Event(event) => {
                if let Some(state) = self.state.as_mut() {
                    let (fraction, remain) = state.update(event.time);
                    self.publisher.push_monitor(
                        MonitorDoc::new("scan/progress")
                            .with_value("fraction", fraction)
                            .with_value("eta", now_secs() + remain)
                            .with_value("remain", remain),
                    );
                }
            }
            Document::Stop(_) => self.state = None,
            Document::Descriptor(_) => {}
        }
        Ok(())
    }
}
