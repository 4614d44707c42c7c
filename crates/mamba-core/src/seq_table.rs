//! Hardware sequencer table.
//!
//! Each row is uploaded as four 32-bit words:
//!
//! ```text
//! word 0: repeats[15:0] | trigger[19:16] | out1 A..F [25:20] | out2 A..F [31:26]
//! word 1: position (two's complement)
//! word 2: time1 (ticks)
//! word 3: time2 (ticks)
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{MambaError, MambaResult};

/// Sequencer clock: ticks per second.
pub const SEQ_CLOCK_HZ: f64 = 125e6;

/// Rows a single sequencer upload can hold.
pub const SEQ_MAX_ROWS: usize = 4096;

/// Row trigger condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeqTrigger {
    Immediate = 0,
    /// POSA >= POSITION
    PosAGte = 7,
    /// POSA <= POSITION
    PosALte = 8,
}

impl SeqTrigger {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(SeqTrigger::Immediate),
            7 => Some(SeqTrigger::PosAGte),
            8 => Some(SeqTrigger::PosALte),
            _ => None,
        }
    }

    /// The opposite position comparator; `Immediate` is unchanged.
    pub fn flipped(self) -> Self {
        match self {
            SeqTrigger::PosAGte => SeqTrigger::PosALte,
            SeqTrigger::PosALte => SeqTrigger::PosAGte,
            SeqTrigger::Immediate => SeqTrigger::Immediate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeqRow {
    pub trigger: SeqTrigger,
    /// Raw encoder units.
    pub position: i32,
    pub time1: u32,
    pub time2: u32,
    pub repeats: u16,
    /// Outputs A..F during phase 1.
    pub out1: [bool; 6],
    /// Outputs A..F during phase 2.
    pub out2: [bool; 6],
}

impl SeqRow {
    pub fn immediate(time1: u32, time2: u32) -> Self {
        Self {
            trigger: SeqTrigger::Immediate,
            position: 0,
            time1,
            time2,
            repeats: 1,
            out1: [false; 6],
            out2: [false; 6],
        }
    }
}

fn pack_bits(bits: &[bool; 6]) -> u32 {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (i, b)| acc | (u32::from(*b) << i))
}

fn unpack_bits(word: u32) -> [bool; 6] {
    let mut out = [false; 6];
    for (i, bit) in out.iter_mut().enumerate() {
        *bit = (word >> i) & 1 == 1;
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeqTable {
    pub rows: Vec<SeqRow>,
}

impl SeqTable {
    pub fn new(rows: Vec<SeqRow>) -> Self {
        Self { rows }
    }

    /// A table that does nothing: one immediate row with every output low.
    pub fn disable() -> Self {
        Self::new(vec![SeqRow::immediate(1, 1)])
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keep only the rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self::new(
            indices
                .iter()
                .filter_map(|&i| self.rows.get(i).cloned())
                .collect(),
        )
    }

    pub fn concat(mut self, other: &SeqTable) -> Self {
        self.rows.extend(other.rows.iter().cloned());
        self
    }

    pub fn pack(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.rows.len() * 4);
        for row in &self.rows {
            words.push(
                u32::from(row.repeats)
                    | ((row.trigger as u32) << 16)
                    | (pack_bits(&row.out1) << 20)
                    | (pack_bits(&row.out2) << 26),
            );
            words.push(row.position as u32);
            words.push(row.time1);
            words.push(row.time2);
        }
        words
    }

    pub fn unpack(words: &[u32]) -> MambaResult<Self> {
        if words.len() % 4 != 0 {
            return Err(MambaError::Syntax(format!(
                "sequencer table length {} is not a multiple of 4",
                words.len()
            )));
        }
        let mut rows = Vec::with_capacity(words.len() / 4);
        for chunk in words.chunks_exact(4) {
            let head = chunk[0];
            let code = (head >> 16) & 0xF;
            let trigger = SeqTrigger::from_code(code)
                .ok_or_else(|| MambaError::Syntax(format!("unknown trigger code {}", code)))?;
            rows.push(SeqRow {
                trigger,
                position: chunk[1] as i32,
                time1: chunk[2],
                time2: chunk[3],
                repeats: (head & 0xFFFF) as u16,
                out1: unpack_bits((head >> 20) & 0x3F),
                out2: unpack_bits((head >> 26) & 0x3F),
            });
        }
        Ok(Self { rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_identity() {
        let table = SeqTable::new(vec![
            SeqRow {
                trigger: SeqTrigger::PosAGte,
                position: -2500,
                time1: 1_000_000,
                time2: 250_000,
                repeats: 100,
                out1: [true, false, false, false, false, false],
                out2: [false; 6],
            },
            SeqRow {
                trigger: SeqTrigger::PosALte,
                position: 102_500,
                time1: 1,
                time2: 1,
                repeats: 1,
                out1: [false, true, false, false, false, true],
                out2: [true; 6],
            },
        ]);
        let words = table.pack();
        assert_eq!(words.len(), 8);
        assert_eq!(words[0] & 0xFFFF, 100);
        assert_eq!((words[0] >> 16) & 0xF, 7);
        assert_eq!((words[0] >> 20) & 1, 1);
        assert_eq!(SeqTable::unpack(&words).unwrap(), table);
    }

    #[test]
    fn unpack_rejects_ragged_input() {
        assert!(SeqTable::unpack(&[1, 2, 3]).is_err());
        assert!(SeqTable::unpack(&[3 << 16, 0, 1, 1]).is_err());
    }

    #[test]
    fn disable_table_is_one_idle_row() {
        let table = SeqTable::disable();
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows[0].trigger, SeqTrigger::Immediate);
        assert!(table.rows[0].out1.iter().all(|b| !b));
    }
}
