//! Hierarchical data file contract.
//!
//! A file holds sections (`scan`, `scan/data`, …) and, inside each section,
//! datasets of one element type. Axis 0 indexes rows; the remaining axes are
//! fixed. A dataset declared with `max_shape[0] = None` grows one row at a
//! time when [`DataFile::append_data`] writes past its current size.
//!
//! ```text
//! add_dataset("scan/data", "mx", F64, [1], [None])   shape (1,)
//! append_data(.., 0.0)                               shape (1,)  rows 1
//! append_data(.., 0.5)                               shape (2,)  rows 2
//! ```

use mamba_core::{MambaError, MambaResult, Value};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F64,
    I32,
    Utf8,
}

impl DType {
    /// Element type for a document data key dtype (`number`, `integer`,
    /// `boolean`, `string`, `array`). Arrays are rows of f64.
    pub fn for_data_key(dtype: &str) -> Self {
        match dtype {
            "integer" | "boolean" => DType::I32,
            "string" => DType::Utf8,
            _ => DType::F64,
        }
    }
}

/// Elements of one dataset, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum Elements {
    F64(Vec<f64>),
    I32(Vec<i32>),
    Utf8(Vec<String>),
}

impl Elements {
    pub fn empty(dtype: DType) -> Self {
        match dtype {
            DType::F64 => Elements::F64(Vec::new()),
            DType::I32 => Elements::I32(Vec::new()),
            DType::Utf8 => Elements::Utf8(Vec::new()),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Elements::F64(_) => DType::F64,
            Elements::I32(_) => DType::I32,
            Elements::Utf8(_) => DType::Utf8,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Elements::F64(v) => v.len(),
            Elements::I32(v) => v.len(),
            Elements::Utf8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pad with default elements up to `len`.
    pub fn resize(&mut self, len: usize) {
        match self {
            Elements::F64(v) => v.resize(len, 0.0),
            Elements::I32(v) => v.resize(len, 0),
            Elements::Utf8(v) => v.resize(len, String::new()),
        }
    }

    /// Overwrite `row` with already converted cells.
    fn write_row(&mut self, row: usize, cells: RowCells) -> MambaResult<()> {
        match (self, cells) {
            (Elements::F64(v), RowCells::F64(cells)) => {
                let start = row * cells.len();
                v[start..start + cells.len()].copy_from_slice(&cells);
            }
            (Elements::I32(v), RowCells::I32(i)) => v[row] = i,
            (Elements::Utf8(v), RowCells::Utf8(text)) => v[row] = text,
            (elements, _) => {
                return Err(MambaError::Syntax(format!(
                    "row does not match {:?} elements",
                    elements.dtype()
                )))
            }
        }
        Ok(())
    }

    /// Row `row` as a value: scalars for one-element rows, arrays otherwise.
    pub fn row(&self, row: usize, row_len: usize) -> Option<Value> {
        let start = row * row_len;
        match self {
            Elements::F64(v) if row_len == 1 => v.get(start).map(|x| Value::Float(*x)),
            Elements::F64(v) => v.get(start..start + row_len).map(|r| Value::Array(r.to_vec())),
            Elements::I32(v) => v.get(start).map(|i| Value::Int(i64::from(*i))),
            Elements::Utf8(v) => v.get(start).map(|s| Value::Str(s.clone())),
        }
    }
}

/// One row converted to a dataset's element type.
pub(crate) enum RowCells {
    F64(Vec<f64>),
    I32(i32),
    Utf8(String),
}

impl RowCells {
    /// Convert `value` into a row of `row_len` elements of `dtype`, before
    /// anything about the dataset changes.
    pub(crate) fn convert(dtype: DType, row_len: usize, value: &Value) -> MambaResult<Self> {
        match dtype {
            DType::F64 => {
                let cells = f64_cells(value)?;
                check_row_len(cells.len(), row_len)?;
                Ok(RowCells::F64(cells))
            }
            DType::I32 => {
                check_row_len(1, row_len)?;
                value
                    .as_i64()
                    .and_then(|i| i32::try_from(i).ok())
                    .map(RowCells::I32)
                    .ok_or_else(|| mismatch(value, "i32"))
            }
            DType::Utf8 => {
                check_row_len(1, row_len)?;
                Ok(RowCells::Utf8(match value {
                    Value::Str(s) => s.clone(),
                    other => other.to_string(),
                }))
            }
        }
    }
}

fn f64_cells(value: &Value) -> MambaResult<Vec<f64>> {
    match value {
        Value::Array(a) => Ok(a.clone()),
        other => other
            .as_f64()
            .map(|x| vec![x])
            .ok_or_else(|| mismatch(other, "f64")),
    }
}

fn check_row_len(got: usize, want: usize) -> MambaResult<()> {
    if got == want {
        Ok(())
    } else {
        Err(MambaError::Syntax(format!(
            "row has {} elements, dataset rows have {}",
            got, want
        )))
    }
}

fn mismatch(value: &Value, dtype: &str) -> MambaError {
    MambaError::Syntax(format!("cannot store {} as {}", value, dtype))
}

/// One dataset: shape, growth limit, rows written so far, elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub shape: Vec<usize>,
    pub max_shape: Vec<Option<usize>>,
    /// Rows filled by `append_data`.
    pub rows: usize,
    pub elements: Elements,
}

impl Dataset {
    pub fn new(
        dtype: DType,
        initial_shape: &[usize],
        max_shape: &[Option<usize>],
    ) -> MambaResult<Self> {
        validate_shape(initial_shape, max_shape)?;
        let mut elements = Elements::empty(dtype);
        elements.resize(initial_shape.iter().product());
        Ok(Self {
            shape: initial_shape.to_vec(),
            max_shape: max_shape.to_vec(),
            rows: 0,
            elements,
        })
    }

    pub fn dtype(&self) -> DType {
        self.elements.dtype()
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.shape[1..].iter().product()
    }

    pub fn growable(&self) -> bool {
        self.max_shape.first().is_some_and(|m| m.is_none())
    }

    /// Write the next row, growing axis 0 by exactly one row when the
    /// preallocated rows are used up. A rejected row leaves the dataset as
    /// it was.
    pub fn append(&mut self, value: &Value) -> MambaResult<()> {
        let cells = RowCells::convert(self.dtype(), self.row_len(), value)?;
        if self.rows >= self.shape[0] {
            match self.max_shape[0] {
                Some(max) if self.rows >= max => {
                    return Err(MambaError::Syntax(format!(
                        "dataset is full at {} rows",
                        max
                    )))
                }
                _ => {}
            }
            self.shape[0] = self.rows + 1;
            self.elements.resize(self.shape.iter().product());
        }
        self.elements.write_row(self.rows, cells)?;
        self.rows += 1;
        Ok(())
    }

    pub fn row(&self, row: usize) -> Option<Value> {
        if row >= self.shape[0] {
            return None;
        }
        self.elements.row(row, self.row_len())
    }

    /// Every row up to the current size of axis 0.
    pub fn values(&self) -> Vec<Value> {
        (0..self.shape[0]).filter_map(|r| self.row(r)).collect()
    }
}

pub(crate) fn validate_shape(shape: &[usize], max_shape: &[Option<usize>]) -> MambaResult<()> {
    if shape.is_empty() {
        return Err(MambaError::Syntax("dataset needs at least one axis".into()));
    }
    if shape.len() != max_shape.len() {
        return Err(MambaError::Syntax(format!(
            "shape {:?} and max shape {:?} differ in rank",
            shape, max_shape
        )));
    }
    for (axis, (dim, max)) in shape.iter().zip(max_shape).enumerate() {
        match max {
            None if axis > 0 => {
                return Err(MambaError::Syntax(format!(
                    "only axis 0 may grow, axis {} is unlimited",
                    axis
                )))
            }
            Some(max) if dim > max => {
                return Err(MambaError::Syntax(format!(
                    "axis {} size {} exceeds its maximum {}",
                    axis, dim, max
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Append-only hierarchical file.
pub trait DataFile: Send {
    fn path(&self) -> &Path;

    /// Create a section; parents must exist.
    fn add_section(&mut self, path: &str) -> MambaResult<()>;

    fn add_dataset(
        &mut self,
        section: &str,
        name: &str,
        dtype: DType,
        initial_shape: &[usize],
        max_shape: &[Option<usize>],
    ) -> MambaResult<()>;

    /// Create a fixed-size dataset holding `data`, one row per value.
    fn write_dataset(
        &mut self,
        section: &str,
        name: &str,
        dtype: DType,
        data: &[Value],
    ) -> MambaResult<()>;

    fn append_data(&mut self, section: &str, name: &str, value: &Value) -> MambaResult<()>;

    /// Current shape of a dataset.
    fn shape(&self, section: &str, name: &str) -> Option<Vec<usize>>;

    /// Make written rows visible to readers.
    fn flush(&mut self) -> MambaResult<()>;

    /// Flush and release the file. Calling it again does nothing.
    fn close_file(&mut self) -> MambaResult<()>;

    fn is_closed(&self) -> bool;
}

// =============================================================================
// Single writer per path
// =============================================================================

static OPEN_FILES: Lazy<Mutex<BTreeSet<PathBuf>>> = Lazy::new(|| Mutex::new(BTreeSet::new()));

/// Exclusive claim on a file path, released on drop.
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    pub fn acquire(path: &Path) -> MambaResult<Self> {
        let path = normalize(path);
        let mut open = OPEN_FILES.lock();
        if !open.insert(path.clone()) {
            return Err(MambaError::Dup(format!(
                "{} is already open for writing",
                path.display()
            )));
        }
        Ok(Self { path })
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        OPEN_FILES.lock().remove(&self.path);
    }
}

fn normalize(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_grow_one_row_at_a_time() {
        let mut ds = Dataset::new(DType::F64, &[2], &[None]).unwrap();
        ds.append(&Value::Float(1.0)).unwrap();
        ds.append(&Value::Float(2.0)).unwrap();
        assert_eq!(ds.shape, vec![2]);
        ds.append(&Value::Int(3)).unwrap();
        assert_eq!(ds.shape, vec![3]);
        assert_eq!(
            ds.values(),
            vec![Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]
        );
    }

    #[test]
    fn fixed_datasets_refuse_to_grow() {
        let mut ds = Dataset::new(DType::I32, &[1], &[Some(1)]).unwrap();
        ds.append(&Value::Int(7)).unwrap();
        assert!(ds.append(&Value::Int(8)).is_err());
        assert_eq!(ds.values(), vec![Value::Int(7)]);
    }

    #[test]
    fn rows_must_match_the_trailing_shape() {
        let mut ds = Dataset::new(DType::F64, &[0, 3], &[None, Some(3)]).unwrap();
        assert!(ds.append(&Value::Array(vec![1.0, 2.0])).is_err());
        let mut ints = Dataset::new(DType::I32, &[0], &[None]).unwrap();
        assert!(ints.append(&Value::Int(i64::MAX)).is_err());
        assert!(ints.append(&Value::Str("x".into())).is_err());
    }

    #[test]
    fn rejected_rows_leave_the_shape_alone() {
        let mut ds = Dataset::new(DType::F64, &[1, 3], &[None, Some(3)]).unwrap();
        ds.append(&Value::Array(vec![1.0, 2.0, 3.0])).unwrap();
        assert!(ds.append(&Value::Float(9.0)).is_err());
        assert_eq!(ds.shape, vec![1, 3]);
        assert_eq!(ds.rows, 1);
        assert_eq!(ds.values(), vec![Value::Array(vec![1.0, 2.0, 3.0])]);

        let mut ints = Dataset::new(DType::I32, &[0], &[None]).unwrap();
        ints.append(&Value::Int(4)).unwrap();
        assert!(ints.append(&Value::Int(i64::MAX)).is_err());
        assert_eq!(ints.shape, vec![1]);
        ints.append(&Value::Int(5)).unwrap();
        assert_eq!(ints.values(), vec![Value::Int(4), Value::Int(5)]);
    }

    #[test]
    fn shapes_are_validated() {
        assert!(Dataset::new(DType::F64, &[], &[]).is_err());
        assert!(Dataset::new(DType::F64, &[1, 2], &[None, None]).is_err());
        assert!(Dataset::new(DType::F64, &[4], &[Some(2)]).is_err());
        assert!(Dataset::new(DType::F64, &[1], &[None, None]).is_err());
    }

    #[test]
    fn one_writer_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        let lock = WriterLock::acquire(&path).unwrap();
        assert!(WriterLock::acquire(&path).is_err());
        drop(lock);
        assert!(WriterLock::acquire(&path).is_ok());
    }
}
