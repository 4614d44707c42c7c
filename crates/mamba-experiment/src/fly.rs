//! Fly trajectory generator.
//!
//! A fly line sweeps the motor at constant velocity while the sequencer
//! gates detectors from encoder position compares. For a sweep from `lo` to
//! `hi` the forward table is:
//!
//! | row | trigger        | position      | repeats | gate |
//! |-----|----------------|---------------|---------|------|
//! | 0   | POSA >= lo     | lo            | num     | high |
//! | 1   | POSA >= run-out| hi + pad/2    | 1       | low  |
//! | 2   | POSA <= hi     | hi            | num     | high |
//! | 3   | POSA <= run-up | lo − pad/2    | 1       | low  |
//!
//! Rows 0-1 acquire one line forward, rows 2-3 the next line backward. The
//! reverse table is the same construction with `lo` and `hi` exchanged.
//! Without an outer snake only rows `[0, 3]` are used, so every line runs
//! forward and the motor returns to the run-up between lines.
//!
//! Comparators flip when `lo > hi` and again when the encoder scale is
//! negative, since positions are compared in raw encoder counts
//! `(u − offset) / scale`.

use mamba_core::{
    Device, MambaError, MambaResult, SeqRow, SeqTable, SeqTrigger, Value, SEQ_CLOCK_HZ,
};
use serde::{Deserialize, Serialize};

/// Minimum run-up, in seconds of travel, added on both sides of a sweep.
pub const MIN_PAD_SECS: f64 = 0.5;

/// Arguments of a fly line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlyParams {
    pub lo: f64,
    pub hi: f64,
    /// Points per line.
    pub num: u64,
    /// Fraction of each period the gate is high.
    #[serde(default = "default_duty")]
    pub duty: f64,
    /// Seconds per point. Exclusive with `velocity`.
    #[serde(default)]
    pub period: Option<f64>,
    /// Sweep velocity in user units per second. Exclusive with `period`.
    #[serde(default)]
    pub velocity: Option<f64>,
    /// Run-up distance in user units.
    #[serde(default)]
    pub pad: Option<f64>,
}

fn default_duty() -> f64 {
    0.5
}

impl FlyParams {
    pub fn new(lo: f64, hi: f64, num: u64) -> Self {
        Self {
            lo,
            hi,
            num,
            duty: default_duty(),
            period: None,
            velocity: None,
            pad: None,
        }
    }
}

/// Motor parameters the trajectory depends on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorProfile {
    pub velocity: f64,
    /// Acceleration time in seconds.
    pub acceleration: f64,
    pub base_velocity: f64,
    pub encoder_offset: f64,
    pub encoder_scale: f64,
}

impl MotorProfile {
    /// Read the profile from a motor device.
    pub fn read(motor: &Device) -> MambaResult<Self> {
        let number = |path: &str| -> MambaResult<f64> {
            motor.require_signal(path)?.get().as_f64().ok_or_else(|| {
                MambaError::Hardware(format!("{}.{} is not numeric", motor.name(), path))
            })
        };
        Ok(Self {
            velocity: number("velocity")?,
            acceleration: number("acceleration")?,
            base_velocity: number("base_velocity")?,
            encoder_offset: number("encoder.offset")?,
            encoder_scale: number("encoder.scale")?,
        })
    }

    /// Raw encoder count of user position `u`.
    pub fn to_raw(&self, u: f64) -> MambaResult<i32> {
        let raw = ((u - self.encoder_offset) / self.encoder_scale).round();
        if !raw.is_finite() || raw < f64::from(i32::MIN) || raw > f64::from(i32::MAX) {
            return Err(invalid(format!("position {} is out of encoder range", u)));
        }
        Ok(raw as i32)
    }
}

/// A validated fly line and its sequencer tables.
#[derive(Debug, Clone, PartialEq)]
pub struct FlyTrajectory {
    pub lo: f64,
    pub hi: f64,
    pub num: u64,
    pub velocity: f64,
    pub period: f64,
    /// Signed run-up: negative when sweeping from high to low.
    pub pad: f64,
    pub time1: u32,
    pub time2: u32,
    /// User positions of the forward table rows.
    pub positions: [f64; 4],
    pub forward: SeqTable,
    pub reverse: SeqTable,
}

impl FlyTrajectory {
    /// Where a forward line starts accelerating.
    pub fn run_up(&self) -> f64 {
        self.lo - self.pad / 2.0
    }

    /// Where a forward line has decelerated.
    pub fn run_out(&self) -> f64 {
        self.hi + self.pad / 2.0
    }

    /// Motor target that completes a line in the given direction.
    pub fn sweep_end(&self, reverse: bool) -> f64 {
        if reverse {
            self.run_up()
        } else {
            self.run_out()
        }
    }

    pub fn table(&self, reverse: bool) -> &SeqTable {
        if reverse {
            &self.reverse
        } else {
            &self.forward
        }
    }

    /// Seconds of gated acquisition per line.
    pub fn line_time(&self) -> f64 {
        self.period * self.num as f64
    }
}

fn invalid(msg: impl Into<String>) -> MambaError {
    MambaError::Syntax(format!("invalid fly trajectory: {}", msg.into()))
}

fn ticks(seconds: f64, what: &str) -> MambaResult<u32> {
    let ticks = (seconds * SEQ_CLOCK_HZ).round();
    if ticks.is_nan() || ticks < 1.0 {
        return Err(invalid(format!("{} is below one clock tick", what)));
    }
    if ticks > f64::from(u32::MAX) {
        return Err(invalid(format!("{} overflows the sequencer clock", what)));
    }
    Ok(ticks as u32)
}

/// Compute the trajectory of one fly line.
///
/// `snake` selects the 4-row tables (forward and backward lines alternate);
/// otherwise each table holds rows `[0, 3]`.
pub fn fly_trajectory(
    params: &FlyParams,
    profile: &MotorProfile,
    snake: bool,
) -> MambaResult<FlyTrajectory> {
    let FlyParams {
        lo, hi, num, duty, ..
    } = *params;
    if params.period.is_some() && params.velocity.is_some() {
        return Err(invalid("give at most one of period and velocity"));
    }
    if lo == hi {
        return Err(invalid("lo == hi leaves the velocity undefined"));
    }
    if num == 0 {
        return Err(invalid("num must be positive"));
    }
    if num > u64::from(u16::MAX) {
        return Err(invalid(format!("num {} exceeds {}", num, u16::MAX)));
    }
    if !(0.0..=1.0).contains(&duty) {
        return Err(invalid(format!("duty {} is outside [0, 1]", duty)));
    }
    if profile.encoder_scale == 0.0 {
        return Err(invalid("encoder scale is zero"));
    }

    let span = (hi - lo).abs();
    let points = num as f64 + duty - 1.0;
    let (velocity, period) = match params.period {
        Some(period) => (span / points / period, period),
        None => {
            let velocity = params.velocity.unwrap_or(profile.velocity);
            (velocity, span / points / velocity)
        }
    };
    if !(period > 0.0 && period.is_finite()) {
        return Err(invalid(format!("period {} must be positive", period)));
    }
    if !(velocity > 0.0 && velocity.is_finite()) {
        return Err(invalid(format!("velocity {} must be positive", velocity)));
    }
    let pad = params
        .pad
        .unwrap_or_else(|| MIN_PAD_SECS.max(2.0 * profile.acceleration) * velocity);
    if pad.is_nan() || pad <= 0.0 {
        return Err(invalid(format!("pad {} must be positive", pad)));
    }

    let time1 = ticks(duty * period, "gate-high time")?;
    let time2 = ticks((1.0 - duty) * period, "gate-low time")?;
    let pad = if lo > hi { -pad } else { pad };

    let forward = line_table(lo, hi, pad, num as u16, time1, time2, profile)?;
    let reverse = line_table(hi, lo, -pad, num as u16, time1, time2, profile)?;
    let (forward, reverse) = if snake {
        (forward, reverse)
    } else {
        (forward.select(&[0, 3]), reverse.select(&[0, 3]))
    };

    Ok(FlyTrajectory {
        lo,
        hi,
        num,
        velocity,
        period,
        pad,
        time1,
        time2,
        positions: [lo, hi + pad / 2.0, hi, lo - pad / 2.0],
        forward,
        reverse,
    })
}

fn line_table(
    lo: f64,
    hi: f64,
    pad: f64,
    num: u16,
    time1: u32,
    time2: u32,
    profile: &MotorProfile,
) -> MambaResult<SeqTable> {
    let (mut up, mut down) = (SeqTrigger::PosAGte, SeqTrigger::PosALte);
    if lo > hi {
        (up, down) = (up.flipped(), down.flipped());
    }
    if profile.encoder_scale < 0.0 {
        (up, down) = (up.flipped(), down.flipped());
    }
    let gate = [true, false, false, false, false, false];
    let idle = [false; 6];
    let row = |trigger, position: f64, repeats, out1| -> MambaResult<SeqRow> {
        Ok(SeqRow {
            trigger,
            position: profile.to_raw(position)?,
            time1,
            time2,
            repeats,
            out1,
            out2: idle,
        })
    };
    Ok(SeqTable::new(vec![
        row(up, lo, num, gate)?,
        row(up, hi + pad / 2.0, 1, idle)?,
        row(down, hi, num, gate)?,
        row(down, lo - pad / 2.0, 1, idle)?,
    ]))
}

/// Sequencer table value as uploaded to `seq.table`.
pub fn table_value(table: &SeqTable) -> Value {
    Value::Array(table.pack().into_iter().map(f64::from).collect())
}
