//! Scan file writer.
//!
//! Registered with the data router as a [`LocalCallbacks`] sink, it writes
//! one file per run:
//!
//! ```text
//! scan/
//! ├── start/          run metadata, one UTF-8 dataset per field
//! ├── data/           primary stream, one growable dataset per data key
//! ├── <stream>/       other streams
//! ├── config/<dev>/   device configuration at descriptor time
//! └── stop/           exit status, reason, event counts
//! ```
//!
//! Keys with an `external` reference (camera frames) are not copied into the
//! scan file. The file is closed at `scan_end` whatever the exit status.

use crate::data_file::{DType, DataFile};
use crate::native::NativeFile;
use mamba_core::{
    DescriptorDoc, EventDoc, LocalCallbacks, MambaError, MambaResult, StartDoc, StopDoc, Value,
};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w*)\}").expect("Invalid filename placeholder regex"));

const PRIMARY: &str = "primary";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// JSON tree, always available.
    #[default]
    Native,
    /// HDF5, needs the `storage_hdf5` feature.
    Hdf5,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Native => "json",
            FileFormat::Hdf5 => "h5",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileWriterConfig {
    pub dir: PathBuf,
    pub prefix: String,
    /// Placeholders: `{prefix}`, `{scan_id}`, `{session}`.
    pub name_pattern: String,
    pub format: FileFormat,
    /// Flush after this many events; 0 flushes only at the end of the run.
    pub flush_every: usize,
}

impl Default for FileWriterConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data"),
            prefix: "scan".to_string(),
            name_pattern: "{prefix}_{scan_id}".to_string(),
            format: FileFormat::Native,
            flush_every: 10,
        }
    }
}

/// Per-process session id, `YYYYmmdd_HHMMSS` local time.
pub fn new_session_id() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Substitute `{prefix}`, `{scan_id}` and `{session}` in `pattern`.
pub fn expand_name(
    pattern: &str,
    prefix: &str,
    scan_id: u64,
    session: &str,
) -> MambaResult<String> {
    let mut unknown = None;
    let name = PLACEHOLDER.replace_all(pattern, |caps: &regex::Captures<'_>| match &caps[1] {
        "prefix" => prefix.to_string(),
        "scan_id" => scan_id.to_string(),
        "session" => session.to_string(),
        other => {
            unknown.get_or_insert_with(|| other.to_string());
            String::new()
        }
    });
    if let Some(other) = unknown {
        return Err(MambaError::Syntax(format!(
            "unknown placeholder {{{}}} in file name pattern {:?}",
            other, pattern
        )));
    }
    if name.is_empty() || name.contains(['/', '\\']) {
        return Err(MambaError::Syntax(format!(
            "file name pattern {:?} expands to invalid name {:?}",
            pattern, name
        )));
    }
    Ok(name.into_owned())
}

/// Open a data file of the given format.
pub fn create_file(format: FileFormat, path: &Path) -> MambaResult<Box<dyn DataFile>> {
    match format {
        FileFormat::Native => Ok(Box::new(NativeFile::create(path)?)),
        #[cfg(feature = "storage_hdf5")]
        FileFormat::Hdf5 => Ok(Box::new(crate::hdf5_file::Hdf5File::create(path)?)),
        #[cfg(not(feature = "storage_hdf5"))]
        FileFormat::Hdf5 => Err(MambaError::Config(
            "HDF5 output requested but mamba-storage was built without storage_hdf5".into(),
        )),
    }
}

struct Stream {
    section: String,
    keys: Vec<String>,
}

struct OpenRun {
    run_uid: String,
    file: Box<dyn DataFile>,
    streams: HashMap<String, Stream>,
    configured: BTreeSet<String>,
    events: usize,
}

/// Writes each run into its own data file.
pub struct FileWriter {
    config: FileWriterConfig,
    session: String,
    run: Mutex<Option<OpenRun>>,
    last_path: Mutex<Option<PathBuf>>,
}

impl FileWriter {
    pub fn new(config: FileWriterConfig) -> MambaResult<Self> {
        Self::with_session(config, &new_session_id())
    }

    pub fn with_session(config: FileWriterConfig, session: &str) -> MambaResult<Self> {
        expand_name(&config.name_pattern, &config.prefix, 0, session)?;
        Ok(Self {
            config,
            session: session.to_string(),
            run: Mutex::new(None),
            last_path: Mutex::new(None),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Path of the file of the current or most recent run.
    pub fn last_path(&self) -> Option<PathBuf> {
        self.last_path.lock().clone()
    }

    pub fn path_for(&self, scan_id: u64) -> MambaResult<PathBuf> {
        let name = expand_name(
            &self.config.name_pattern,
            &self.config.prefix,
            scan_id,
            &self.session,
        )?;
        Ok(self
            .config
            .dir
            .join(format!("{}.{}", name, self.config.format.extension())))
    }

    fn open(&self, doc: &StartDoc) -> MambaResult<OpenRun> {
        fs::create_dir_all(&self.config.dir)?;
        let path = self.path_for(doc.scan_id)?;
        let mut file = create_file(self.config.format, &path)?;
        file.add_section("scan")?;
        file.add_section("scan/data")?;
        file.add_section("scan/config")?;
        file.add_section("scan/start")?;
        let text = |s: &str| vec![Value::Str(s.to_string())];
        file.write_dataset("scan/start", "uid", DType::Utf8, &text(&doc.uid))?;
        file.write_dataset("scan/start", "plan_name", DType::Utf8, &text(&doc.plan_name))?;
        file.write_dataset("scan/start", "time", DType::F64, &[Value::Float(doc.time)])?;
        file.write_dataset(
            "scan/start",
            "scan_id",
            DType::I32,
            &[Value::Int(i64::try_from(doc.scan_id).unwrap_or(i64::MAX))],
        )?;
        if let Some(n) = doc.num_points {
            let n = i64::try_from(n).unwrap_or(i64::MAX);
            file.write_dataset("scan/start", "num_points", DType::I32, &[Value::Int(n)])?;
        }
        for (key, value) in doc.md.iter().chain(doc.hints.iter()) {
            if file.shape("scan/start", key).is_some() {
                continue;
            }
            file.write_dataset("scan/start", key, DType::Utf8, &text(&value.to_string()))?;
        }
        *self.last_path.lock() = Some(path.clone());
        info!(path = %path.display(), scan_id = doc.scan_id, "opened scan file");
        Ok(OpenRun {
            run_uid: doc.uid.clone(),
            file,
            streams: HashMap::new(),
            configured: BTreeSet::new(),
            events: 0,
        })
    }
}

fn add_stream(run: &mut OpenRun, doc: &DescriptorDoc) -> MambaResult<()> {
    let section = if doc.name == PRIMARY {
        "scan/data".to_string()
    } else {
        let section = format!("scan/{}", doc.name);
        run.file.add_section(&section)?;
        section
    };
    let mut keys = Vec::new();
    for (key, data_key) in &doc.data_keys {
        if data_key.external.is_some() {
            continue;
        }
        let mut shape = vec![1];
        shape.extend(&data_key.shape);
        let mut max: Vec<Option<usize>> = shape.iter().map(|d| Some(*d)).collect();
        max[0] = None;
        run.file.add_dataset(
            &section,
            key,
            DType::for_data_key(&data_key.dtype),
            &shape,
            &max,
        )?;
        keys.push(key.clone());
    }
    for (device, readings) in &doc.configuration {
        if !run.configured.insert(device.clone()) {
            continue;
        }
        let section = format!("scan/config/{}", device);
        run.file.add_section(&section)?;
        for (key, reading) in readings {
            let dtype = DType::for_data_key(reading.value.dtype());
            run.file
                .write_dataset(&section, key, dtype, std::slice::from_ref(&reading.value))?;
        }
    }
    debug!(stream = %doc.name, keys = keys.len(), "scan file stream");
    run.streams.insert(doc.uid.clone(), Stream { section, keys });
    Ok(())
}

fn write_stop(run: &mut OpenRun, doc: &StopDoc) -> MambaResult<()> {
    run.file.add_section("scan/stop")?;
    let text = |s: String| vec![Value::Str(s)];
    let exit_status = text(doc.exit_status.to_string());
    run.file
        .write_dataset("scan/stop", "exit_status", DType::Utf8, &exit_status)?;
    run.file
        .write_dataset("scan/stop", "reason", DType::Utf8, &text(doc.reason.clone()))?;
    run.file
        .write_dataset("scan/stop", "time", DType::F64, &[Value::Float(doc.time)])?;
    for (stream, n) in &doc.num_events {
        run.file.write_dataset(
            "scan/stop",
            &format!("num_events_{}", stream),
            DType::I32,
            &[Value::Int(i64::try_from(*n).unwrap_or(i64::MAX))],
        )?;
    }
    Ok(())
}

impl LocalCallbacks for FileWriter {
    fn scan_start(&self, doc: &StartDoc) -> MambaResult<()> {
        let mut run = self.run.lock();
        if let Some(mut stale) = run.take() {
            warn!(run_uid = %stale.run_uid, "previous scan file left open, closing");
            if let Err(e) = stale.file.close_file() {
                warn!(error = %e, "failed to close previous scan file");
            }
        }
        *run = Some(self.open(doc)?);
        Ok(())
    }

    fn descriptor(&self, doc: &DescriptorDoc) -> MambaResult<()> {
        let mut guard = self.run.lock();
        match guard.as_mut() {
            Some(run) if run.run_uid == doc.run_uid => add_stream(run, doc),
            _ => Ok(()),
        }
    }

    fn data_update(&self, doc: &EventDoc) -> MambaResult<()> {
        let mut guard = self.run.lock();
        let Some(run) = guard.as_mut() else {
            return Ok(());
        };
        let Some(stream) = run.streams.get(&doc.descriptor_uid) else {
            return Err(MambaError::Key(format!(
                "event {} references unknown descriptor {}",
                doc.seq_num, doc.descriptor_uid
            )));
        };
        for key in &stream.keys {
            let value = doc
                .data
                .get(key)
                .ok_or_else(|| MambaError::Key(format!("event {} lacks {}", doc.seq_num, key)))?;
            run.file.append_data(&stream.section, key, value)?;
        }
        run.events += 1;
        if self.config.flush_every > 0 && run.events % self.config.flush_every == 0 {
            run.file.flush()?;
        }
        Ok(())
    }

    fn scan_end(&self, doc: &StopDoc) -> MambaResult<()> {
        let Some(mut run) = self.run.lock().take() else {
            return Ok(());
        };
        let written = write_stop(&mut run, doc);
        let closed = run.file.close_file();
        info!(
            path = %run.file.path().display(),
            exit_status = %doc.exit_status,
            events = run.events,
            "closed scan file"
        );
        written.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_placeholders() {
        assert_eq!(
            expand_name("{prefix}_{scan_id}", "scan", 12, "s").unwrap(),
            "scan_12"
        );
        assert_eq!(
            expand_name("{session}-{scan_id}-{scan_id}", "p", 3, "20260101_101010").unwrap(),
            "20260101_101010-3-3"
        );
        assert_eq!(expand_name("plain", "p", 3, "s").unwrap(), "plain");
    }

    #[test]
    fn rejects_bad_patterns() {
        assert!(expand_name("{prefix}_{run}", "p", 1, "s").is_err());
        assert!(expand_name("{}", "p", 1, "s").is_err());
        assert!(expand_name("a/{scan_id}", "p", 1, "s").is_err());
        assert!(FileWriter::new(FileWriterConfig {
            name_pattern: "{nope}".into(),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn session_ids_are_timestamps() {
        let id = new_session_id();
        assert_eq!(id.len(), 15);
        assert_eq!(&id[8..9], "_");
    }
}
