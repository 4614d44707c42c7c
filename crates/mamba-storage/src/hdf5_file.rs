//! HDF5 [`DataFile`] (requires the `storage_hdf5` feature).
//!
//! Sections map to groups, datasets are chunked with an unlimited first
//! axis when growable. Rows have at most one trailing axis; image frames
//! stay external to the scan file.

use crate::data_file::{validate_shape, DType, DataFile, RowCells, WriterLock};
use hdf5::types::VarLenUnicode;
use hdf5::{Extent, File, SimpleExtents};
use mamba_core::{MambaError, MambaResult, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CHUNK_ROWS: usize = 1024;

fn h5(e: hdf5::Error) -> MambaError {
    MambaError::Io(std::io::Error::other(e.to_string()))
}

/// A row converted for `write_slice`.
enum H5Row {
    F64(Vec<f64>),
    I32(i32),
    Utf8(VarLenUnicode),
}

impl H5Row {
    fn convert(layout: &Layout, value: &Value) -> MambaResult<Self> {
        let row_len = layout.shape[1..].iter().product();
        Ok(match RowCells::convert(layout.dtype, row_len, value)? {
            RowCells::F64(cells) => H5Row::F64(cells),
            RowCells::I32(i) => H5Row::I32(i),
            RowCells::Utf8(text) => H5Row::Utf8(
                text.parse::<VarLenUnicode>()
                    .map_err(|e| MambaError::Syntax(e.to_string()))?,
            ),
        })
    }
}

struct Layout {
    dtype: DType,
    shape: Vec<usize>,
    max_shape: Vec<Option<usize>>,
    rows: usize,
}

pub struct Hdf5File {
    path: PathBuf,
    file: Option<File>,
    layouts: HashMap<String, Layout>,
    _lock: Option<WriterLock>,
}

impl Hdf5File {
    pub fn create(path: impl AsRef<Path>) -> MambaResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = WriterLock::acquire(&path)?;
        let file = File::create(&path).map_err(h5)?;
        debug!(path = %path.display(), "created HDF5 data file");
        Ok(Self {
            path,
            file: Some(file),
            layouts: HashMap::new(),
            _lock: Some(lock),
        })
    }

    fn file(&self) -> MambaResult<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| MambaError::Protocol(format!("{} is closed", self.path.display())))
    }

    fn dataset(&self, section: &str, name: &str) -> MambaResult<hdf5::Dataset> {
        self.file()?
            .group(section)
            .and_then(|g| g.dataset(name))
            .map_err(|_| MambaError::Key(format!("no dataset {}/{}", section, name)))
    }

    fn write_row(ds: &hdf5::Dataset, rank: usize, row: usize, cells: H5Row) -> MambaResult<()> {
        match cells {
            H5Row::F64(cells) if rank == 1 => ds.write_slice(cells.as_slice(), row..row + 1),
            H5Row::F64(cells) => ds.write_slice(cells.as_slice(), (row, ..)),
            H5Row::I32(i) => ds.write_slice(&[i][..], row..row + 1),
            H5Row::Utf8(text) => ds.write_slice(&[text][..], row..row + 1),
        }
        .map_err(h5)
    }
}

impl DataFile for Hdf5File {
    fn path(&self) -> &Path {
        &self.path
    }

    fn add_section(&mut self, path: &str) -> MambaResult<()> {
        let file = self.file()?;
        if file.link_exists(path) {
            return Err(MambaError::Dup(format!("section {}", path)));
        }
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !file.link_exists(parent) {
                return Err(MambaError::Key(format!("no section {}", parent)));
            }
        }
        file.create_group(path).map_err(h5)?;
        Ok(())
    }

    fn add_dataset(
        &mut self,
        section: &str,
        name: &str,
        dtype: DType,
        initial_shape: &[usize],
        max_shape: &[Option<usize>],
    ) -> MambaResult<()> {
        validate_shape(initial_shape, max_shape)?;
        if initial_shape.len() > 2 {
            return Err(MambaError::Syntax(format!(
                "{}/{} has rank {}, rows may have one axis at most",
                section,
                name,
                initial_shape.len()
            )));
        }
        let key = format!("{}/{}", section, name);
        if self.layouts.contains_key(&key) {
            return Err(MambaError::Dup(key));
        }
        let group = self
            .file()?
            .group(section)
            .map_err(|_| MambaError::Key(format!("no section {}", section)))?;
        let extents: Vec<Extent> = initial_shape
            .iter()
            .zip(max_shape)
            .map(|(dim, max)| Extent::new(*dim, *max))
            .collect();
        let shape = SimpleExtents::from(extents);
        let mut chunk: Vec<usize> = initial_shape.iter().map(|d| (*d).max(1)).collect();
        chunk[0] = match max_shape[0] {
            None => CHUNK_ROWS,
            Some(max) => max.clamp(1, CHUNK_ROWS),
        };
        match dtype {
            DType::F64 => group
                .new_dataset::<f64>()
                .chunk(chunk)
                .shape(shape)
                .create(name)
                .map_err(h5)?,
            DType::I32 => group
                .new_dataset::<i32>()
                .chunk(chunk)
                .shape(shape)
                .create(name)
                .map_err(h5)?,
            DType::Utf8 => group
                .new_dataset::<VarLenUnicode>()
                .chunk(chunk)
                .shape(shape)
                .create(name)
                .map_err(h5)?,
        };
        self.layouts.insert(
            key,
            Layout {
                dtype,
                shape: initial_shape.to_vec(),
                max_shape: max_shape.to_vec(),
                rows: 0,
            },
        );
        Ok(())
    }

    fn write_dataset(
        &mut self,
        section: &str,
        name: &str,
        dtype: DType,
        data: &[Value],
    ) -> MambaResult<()> {
        let mut shape = vec![data.len()];
        if let Some(Value::Array(first)) = data.first() {
            shape.push(first.len());
        }
        let max: Vec<Option<usize>> = shape.iter().map(|d| Some(*d)).collect();
        self.add_dataset(section, name, dtype, &shape, &max)?;
        for value in data {
            self.append_data(section, name, value)?;
        }
        Ok(())
    }

    fn append_data(&mut self, section: &str, name: &str, value: &Value) -> MambaResult<()> {
        let ds = self.dataset(section, name)?;
        let key = format!("{}/{}", section, name);
        let layout = self
            .layouts
            .get_mut(&key)
            .ok_or_else(|| MambaError::Key(format!("no dataset {}", key)))?;
        let row = layout.rows;
        let cells = H5Row::convert(layout, value)?;
        let previous = layout.shape.clone();
        if row >= layout.shape[0] {
            if let Some(max) = layout.max_shape[0] {
                if row >= max {
                    return Err(MambaError::Syntax(format!("{} is full at {} rows", key, max)));
                }
            }
            let mut grown = layout.shape.clone();
            grown[0] = row + 1;
            ds.resize(grown.clone()).map_err(h5)?;
            layout.shape = grown;
        }
        if let Err(e) = Self::write_row(&ds, layout.shape.len(), row, cells) {
            if previous != layout.shape && ds.resize(previous.clone()).is_ok() {
                layout.shape = previous;
            }
            return Err(e);
        }
        layout.rows += 1;
        Ok(())
    }

    fn shape(&self, section: &str, name: &str) -> Option<Vec<usize>> {
        self.layouts
            .get(&format!("{}/{}", section, name))
            .map(|l| l.shape.clone())
    }

    fn flush(&mut self) -> MambaResult<()> {
        self.file()?.flush().map_err(h5)
    }

    fn close_file(&mut self) -> MambaResult<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let result = file.flush().map_err(h5).and_then(|_| file.close().map_err(h5));
        self._lock = None;
        debug!(path = %self.path.display(), "closed HDF5 data file");
        result
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

impl Drop for Hdf5File {
    fn drop(&mut self) {
        if let Err(e) = self.close_file() {
            warn!(path = %self.path.display(), error = %e, "failed to close data file");
        }
    }
}
