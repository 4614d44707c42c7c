//! JSON-backed [`DataFile`] used when HDF5 support is not compiled in.
//!
//! The whole tree lives in memory and is written to disk on every
//! [`flush`](DataFile::flush) through a temporary file and a rename, so a
//! reader never sees a half-written file.

use crate::data_file::{DType, DataFile, Dataset, WriterLock};
use mamba_core::{MambaError, MambaResult, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk layout: section path → dataset name → dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NativeTree {
    pub sections: BTreeMap<String, BTreeMap<String, Dataset>>,
}

impl NativeTree {
    pub fn dataset(&self, section: &str, name: &str) -> Option<&Dataset> {
        self.sections.get(section).and_then(|s| s.get(name))
    }
}

pub struct NativeFile {
    path: PathBuf,
    tree: NativeTree,
    dirty: bool,
    lock: Option<WriterLock>,
}

impl NativeFile {
    /// Create (or truncate) a file at `path`.
    pub fn create(path: impl AsRef<Path>) -> MambaResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = WriterLock::acquire(&path)?;
        let mut file = Self {
            path,
            tree: NativeTree::default(),
            dirty: true,
            lock: Some(lock),
        };
        file.flush()?;
        debug!(path = %file.path.display(), "created native data file");
        Ok(file)
    }

    /// Read a file written by [`NativeFile`].
    pub fn load(path: impl AsRef<Path>) -> MambaResult<NativeTree> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn tree(&self) -> &NativeTree {
        &self.tree
    }

    fn section_mut(&mut self, section: &str) -> MambaResult<&mut BTreeMap<String, Dataset>> {
        self.tree
            .sections
            .get_mut(section)
            .ok_or_else(|| MambaError::Key(format!("no section {}", section)))
    }

    fn ensure_open(&self) -> MambaResult<()> {
        if self.lock.is_none() {
            return Err(MambaError::Protocol(format!(
                "{} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn insert(&mut self, section: &str, name: &str, dataset: Dataset) -> MambaResult<()> {
        let datasets = self.section_mut(section)?;
        if datasets.contains_key(name) {
            return Err(MambaError::Dup(format!("{}/{}", section, name)));
        }
        datasets.insert(name.to_string(), dataset);
        self.dirty = true;
        Ok(())
    }
}

impl DataFile for NativeFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn add_section(&mut self, path: &str) -> MambaResult<()> {
        self.ensure_open()?;
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !self.tree.sections.contains_key(parent) {
                return Err(MambaError::Key(format!("no section {}", parent)));
            }
        }
        if self.tree.sections.contains_key(path) {
            return Err(MambaError::Dup(format!("section {}", path)));
        }
        self.tree.sections.insert(path.to_string(), BTreeMap::new());
        self.dirty = true;
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
        self.ensure_open()?;
        let dataset = Dataset::new(dtype, initial_shape, max_shape)?;
        self.insert(section, name, dataset)
    }

    fn write_dataset(
        &mut self,
        section: &str,
        name: &str,
        dtype: DType,
        data: &[Value],
    ) -> MambaResult<()> {
        self.ensure_open()?;
        let mut shape = vec![data.len()];
        if let Some(Value::Array(first)) = data.first() {
            shape.push(first.len());
        }
        let max: Vec<Option<usize>> = shape.iter().map(|d| Some(*d)).collect();
        let mut dataset = Dataset::new(dtype, &shape, &max)?;
        for value in data {
            dataset.append(value)?;
        }
        self.insert(section, name, dataset)
    }

    fn append_data(&mut self, section: &str, name: &str, value: &Value) -> MambaResult<()> {
        self.ensure_open()?;
        let dataset = self
            .section_mut(section)?
            .get_mut(name)
            .ok_or_else(|| MambaError::Key(format!("no dataset {}/{}", section, name)))?;
        dataset.append(value)?;
        self.dirty = true;
        Ok(())
    }

    fn shape(&self, section: &str, name: &str) -> Option<Vec<usize>> {
        self.tree.dataset(section, name).map(|d| d.shape.clone())
    }

    fn flush(&mut self) -> MambaResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&self.tree)?)?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }

    fn close_file(&mut self) -> MambaResult<()> {
        if self.lock.is_none() {
            return Ok(());
        }
        let flushed = self.flush();
        self.lock = None;
        debug!(path = %self.path.display(), "closed native data file");
        flushed
    }

    fn is_closed(&self) -> bool {
        self.lock.is_none()
    }
}

impl Drop for NativeFile {
    fn drop(&mut self) {
        if let Err(e) = self.close_file() {
            warn!(path = %self.path.display(), error = %e, "failed to close data file");
        }
    }
}
