//! Simulated position-compare sequencer with position capture.
//!
//! Writing a packed table to `seq.table` and 1 to `seq.enable` runs the
//! table in a background task:
//!
//! ```text
//! for pass in 0..seq.repeats:
//!     for row in table:
//!         wait until POSA satisfies row.trigger
//!         repeat row.repeats times:
//!             if out1.A: capture POSA + pulse every wired detector
//!             sleep (time1 + time2) ticks
//! ```
//!
//! Captured points are handed to the run engine through [`Flyer::collect`];
//! `pcap.pending` counts the rows not collected yet. Completing a table at
//! least once sets `pcap.primed`.

use mamba_core::{
    DataKey, Device, DeviceBuilder, Flyer, Kind, Reading, SeqTable, SeqTrigger, Signal, Status,
    Value, SEQ_CLOCK_HZ,
};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for [`SimSequencer`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimSequencerConfig {
    /// Motor whose encoder is wired to POSA.
    pub posa: Option<String>,
    /// Detectors pulsed by output A.
    pub outputs: Vec<String>,
}

/// Position input: the encoder count compared against table rows and the
/// user readback recorded on capture.
#[derive(Clone)]
struct PositionInput {
    raw: Signal,
    readback: Signal,
}

pub struct SimSequencer {
    name: String,
    table: Signal,
    repeats: Signal,
    active: Signal,
    primed: Signal,
    pending: Signal,
    posa: RwLock<Option<PositionInput>>,
    outputs: RwLock<Vec<Device>>,
    captured: Mutex<Vec<BTreeMap<String, Reading>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SimSequencer {
    pub fn create(name: &str) -> (Device, Arc<SimSequencer>) {
        let builder = DeviceBuilder::new(name);
        let seq_name = builder.child_name("seq");
        let pcap_name = builder.child_name("pcap");

        let table = Signal::with_kind(
            format!("{}_table", seq_name),
            Value::Array(Vec::new()),
            Kind::Config,
        );
        let enable = Signal::with_kind(format!("{}_enable", seq_name), 0, Kind::Omitted);
        let repeats = Signal::with_kind(format!("{}_repeats", seq_name), 1, Kind::Config);
        let active = Signal::with_kind(format!("{}_active", seq_name), 0, Kind::Omitted);
        let primed = Signal::with_kind(format!("{}_primed", pcap_name), 0, Kind::Omitted);
        let pending = Signal::with_kind(format!("{}_pending", pcap_name), 0, Kind::Omitted);

        let seq = Arc::new(SimSequencer {
            name: name.to_string(),
            table: table.clone(),
            repeats: repeats.clone(),
            active: active.clone(),
            primed: primed.clone(),
            pending: pending.clone(),
            posa: RwLock::new(None),
            outputs: RwLock::new(Vec::new()),
            captured: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });

        let weak: Weak<SimSequencer> = Arc::downgrade(&seq);
        enable.set_put_hook(Arc::new(move |s, v| {
            s.update(v.clone());
            match weak.upgrade() {
                Some(seq) if v.as_i64() == Some(1) => seq.start(),
                Some(seq) => {
                    seq.halt();
                    Status::finished()
                }
                None => Status::finished(),
            }
        }));

        let device = builder
            .device("seq", |b| {
                b.with_signal("table", table)
                    .with_signal("enable", enable)
                    .with_signal("repeats", repeats)
                    .with_signal("active", active)
                    .stage_sig("enable", 0)
            })
            .device("pcap", |b| {
                b.with_signal("primed", primed)
                    .with_signal("pending", pending)
            })
            .flyer(seq.clone())
            .build();
        (device, seq)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire a motor encoder to POSA.
    pub fn bind_posa(&self, raw: Signal, readback: Signal) {
        *self.posa.write() = Some(PositionInput { raw, readback });
    }

    /// Pulse `detector` on every capture.
    pub fn add_output(&self, detector: Device) {
        self.outputs.write().push(detector);
    }

    pub fn is_active(&self) -> bool {
        self.active.get().as_i64() == Some(1)
    }

    pub fn is_primed(&self) -> bool {
        self.primed.get().as_i64() == Some(1)
    }

    /// The table currently uploaded.
    pub fn table(&self) -> SeqTable {
        decode_table(&self.table.get()).unwrap_or_default()
    }

    fn start(self: Arc<Self>) -> Status {
        let table = match decode_table(&self.table.get()) {
            Some(table) if !table.is_empty() => table,
            _ => {
                return Status::failed(mamba_core::StatusError::hardware(format!(
                    "{}: no valid table uploaded",
                    self.name
                )))
            }
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                return Status::failed(mamba_core::StatusError::hardware(
                    "sequencer requires an async runtime",
                ))
            }
        };
        let passes = self.repeats.get().as_i64().unwrap_or(1).max(1) as u64;
        self.halt();
        self.active.update(1);
        debug!(sequencer = %self.name, rows = table.len(), passes, "enabled");

        let seq = self.clone();
        let task = handle.spawn(async move {
            for _ in 0..passes {
                for row in &table.rows {
                    seq.wait_trigger(row.trigger, row.position).await;
                    let period = f64::from(row.time1) + f64::from(row.time2);
                    for _ in 0..row.repeats {
                        if row.out1[0] {
                            seq.capture();
                        }
                        tokio::time::sleep(Duration::from_secs_f64(period / SEQ_CLOCK_HZ)).await;
                    }
                }
            }
            seq.primed.update(1);
            seq.active.update(0);
            debug!(sequencer = %seq.name, "table complete");
        });
        *self.task.lock() = Some(task);
        Status::finished()
    }

    fn halt(&self) {
        if let Some(task) = self.task.lock().take() {
            if !task.is_finished() {
                task.abort();
                debug!(sequencer = %self.name, "disabled while running");
            }
        }
        self.active.update(0);
    }

    async fn wait_trigger(&self, trigger: SeqTrigger, position: i32) {
        if trigger == SeqTrigger::Immediate {
            return;
        }
        let Some(input) = self.posa.read().clone() else {
            warn!(sequencer = %self.name, "POSA not wired, treating compare as immediate");
            return;
        };
        let target = f64::from(position);
        let mut rx = input.raw.watch();
        loop {
            let raw = rx.borrow_and_update().value.as_f64().unwrap_or(0.0);
            let hit = match trigger {
                SeqTrigger::PosAGte => raw >= target,
                SeqTrigger::PosALte => raw <= target,
                SeqTrigger::Immediate => true,
            };
            if hit || rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn capture(&self) {
        let mut row = BTreeMap::new();
        if let Some(input) = self.posa.read().as_ref() {
            row.insert(self.posa_key(), input.readback.reading());
        }
        for det in self.outputs.read().iter() {
            det.trigger();
            row.extend(det.read());
        }
        let mut captured = self.captured.lock();
        captured.push(row);
        self.pending.update(captured.len() as i64);
    }

    fn posa_key(&self) -> String {
        format!("{}_posa", self.name)
    }
}

fn decode_table(value: &Value) -> Option<SeqTable> {
    match value {
        Value::Array(words) => {
            let words: Vec<u32> = words.iter().map(|w| *w as u32).collect();
            SeqTable::unpack(&words).ok()
        }
        _ => None,
    }
}

/// Table as stored in `seq.table`.
pub fn encode_table(table: &SeqTable) -> Value {
    Value::Array(table.pack().into_iter().map(f64::from).collect())
}

impl Flyer for SimSequencer {
    fn describe_collect(&self) -> BTreeMap<String, DataKey> {
        let mut keys = BTreeMap::new();
        if let Some(input) = self.posa.read().as_ref() {
            keys.insert(self.posa_key(), input.readback.describe());
        }
        for det in self.outputs.read().iter() {
            keys.extend(det.describe());
        }
        keys
    }

    fn collect(&self) -> Vec<BTreeMap<String, Reading>> {
        let mut captured = self.captured.lock();
        self.pending.update(0);
        std::mem::take(&mut *captured)
    }

    fn complete(&self, points: usize) -> Status {
        let mut rx = self.pending.watch();
        let name = self.name.clone();
        Status::spawn(async move {
            loop {
                let pending = rx.borrow_and_update().value.as_i64().unwrap_or(0);
                if pending >= points as i64 {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(mamba_core::StatusError::hardware(format!(
                        "{}: capture stopped with {} of {} points",
                        name, pending, points
                    )));
                }
            }
        })
    }
}
