//! Document model for scan data.
//!
//! Every run produces exactly one `start`, one or more `descriptor`s, any
//! number of `event`s and exactly one `stop`:
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── DescriptorDoc (1+, one per event stream)
//!    │       │
//!    │       └── EventDoc (N, seq_num 1..=N per stream)
//!    │
//! StopDoc (1)
//! ```
//!
//! Out-of-band measurements (motor positions, detector images, lifecycle
//! notifications) travel as [`MonitorDoc`]s and never belong to a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::value::{now_secs, Reading, Value};

/// Generate a new unique document ID.
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Free-form JSON mapping merged into `start`.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Document types produced by the run engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    Start(StartDoc),
    Descriptor(DescriptorDoc),
    Event(EventDoc),
    Stop(StopDoc),
}

impl Document {
    /// Document name as used in callbacks and `doc/<name>` topics.
    pub fn name(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::Stop(_) => "stop",
        }
    }

    pub fn uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.uid,
            Document::Event(d) => &d.uid,
            Document::Stop(d) => &d.uid,
        }
    }

    /// The run this document belongs to.
    pub fn run_uid(&self) -> &str {
        match self {
            Document::Start(d) => &d.uid,
            Document::Descriptor(d) => &d.run_uid,
            Document::Event(d) => &d.run_uid,
            Document::Stop(d) => &d.run_uid,
        }
    }

    pub fn time(&self) -> f64 {
        match self {
            Document::Start(d) => d.time,
            Document::Descriptor(d) => d.time,
            Document::Event(d) => d.time,
            Document::Stop(d) => d.time,
        }
    }
}

/// Emitted at `open_run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    pub scan_id: u64,
    pub time: f64,
    pub plan_name: String,
    /// Declared number of events, when the plan knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_points: Option<u64>,
    /// Visualization and progress hints, e.g. `progress: ["simple", 2, 3]`.
    #[serde(default)]
    pub hints: Metadata,
    #[serde(default)]
    pub md: Metadata,
}

impl StartDoc {
    pub fn new(scan_id: u64, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            scan_id,
            time: now_secs(),
            plan_name: plan_name.to_string(),
            num_points: None,
            hints: Metadata::new(),
            md: Metadata::new(),
        }
    }

    pub fn with_hint(mut self, key: &str, value: serde_json::Value) -> Self {
        self.hints.insert(key.to_string(), value);
        self
    }
}

/// Schema for one field of an event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// "number", "integer", "boolean", "string" or "array"
    pub dtype: String,
    pub shape: Vec<usize>,
    pub source: String,
    /// Set when the event carries a reference instead of the data itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_strs: Option<Vec<String>>,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            shape: Vec::new(),
            source: source.to_string(),
            external: None,
            enum_strs: None,
        }
    }

    /// Create an array data key
    pub fn array(source: &str, shape: Vec<usize>) -> Self {
        Self {
            dtype: "array".to_string(),
            shape,
            ..Self::scalar(source)
        }
    }

    pub fn for_value(value: &Value, source: &str) -> Self {
        Self {
            dtype: value.dtype().to_string(),
            shape: value.shape(),
            ..Self::scalar(source)
        }
    }

    pub fn with_external(mut self, external: &str) -> Self {
        self.external = Some(external.to_string());
        self
    }
}

/// Declares the fields of an event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDoc {
    pub uid: String,
    pub run_uid: String,
    /// Stream name (e.g. "primary")
    pub name: String,
    pub time: f64,
    pub data_keys: BTreeMap<String, DataKey>,
    /// Device name -> the data keys it contributed.
    #[serde(default)]
    pub object_keys: BTreeMap<String, Vec<String>>,
    /// Device name -> configuration readings at descriptor creation time.
    #[serde(default)]
    pub configuration: BTreeMap<String, BTreeMap<String, Reading>>,
}

impl DescriptorDoc {
    pub fn new(run_uid: &str, name: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: name.to_string(),
            time: now_secs(),
            data_keys: BTreeMap::new(),
            object_keys: BTreeMap::new(),
            configuration: BTreeMap::new(),
        }
    }
}

/// One measurement point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDoc {
    pub uid: String,
    pub run_uid: String,
    pub descriptor_uid: String,
    /// 1-based, gap-free within a descriptor stream
    pub seq_num: u64,
    pub time: f64,
    pub data: BTreeMap<String, Value>,
    pub timestamps: BTreeMap<String, f64>,
}

impl EventDoc {
    pub fn new(run_uid: &str, descriptor_uid: &str, seq_num: u64) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time: now_secs(),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    pub fn with_reading(mut self, field: &str, reading: Reading) -> Self {
        self.timestamps.insert(field.to_string(), reading.timestamp);
        self.data.insert(field.to_string(), reading.value);
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    Abort,
    Fail,
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "success"),
            ExitStatus::Abort => write!(f, "abort"),
            ExitStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Emitted at `close_run` or when the run terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopDoc {
    pub uid: String,
    pub run_uid: String,
    pub time: f64,
    pub exit_status: ExitStatus,
    /// Reason for abort/failure
    pub reason: String,
    /// Events emitted per stream name.
    pub num_events: BTreeMap<String, u64>,
}

impl StopDoc {
    pub fn new(run_uid: &str, exit_status: ExitStatus, reason: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            time: now_secs(),
            exit_status,
            reason: reason.to_string(),
            num_events: BTreeMap::new(),
        }
    }

    pub fn success(run_uid: &str) -> Self {
        Self::new(run_uid, ExitStatus::Success, "")
    }

    pub fn abort(run_uid: &str, reason: &str) -> Self {
        Self::new(run_uid, ExitStatus::Abort, reason)
    }

    pub fn fail(run_uid: &str, reason: &str) -> Self {
        Self::new(run_uid, ExitStatus::Fail, reason)
    }

    pub fn total_events(&self) -> u64 {
        self.num_events.values().sum()
    }
}

/// Out-of-band measurement or notification.
///
/// Topics: `monitor/position`, `monitor/image`,
/// `scan/{start,stop,pause,resume,progress}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorDoc {
    pub topic: String,
    pub data: BTreeMap<String, Value>,
    pub timestamps: BTreeMap<String, f64>,
    /// Raw binary payload (image frames); base64-encoded on the wire.
    #[serde(skip)]
    pub payload: Option<Vec<u8>>,
}

impl MonitorDoc {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            payload: None,
        }
    }

    pub fn with_value(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.timestamps.insert(key.to_string(), now_secs());
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_reading(mut self, key: &str, reading: &Reading) -> Self {
        self.timestamps.insert(key.to_string(), reading.timestamp);
        self.data.insert(key.to_string(), reading.value.clone());
        self
    }

    /// Fold a later document for the same topic into this one: fields are
    /// merged key by key, later values win.
    pub fn merge(&mut self, later: MonitorDoc) {
        self.data.extend(later.data);
        self.timestamps.extend(later.timestamps);
        if later.payload.is_some() {
            self.payload = later.payload;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_is_tagged_by_type() {
        let doc = Document::Stop(StopDoc::abort("run-1", "user"));
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["type"], "stop");
        assert_eq!(json["exit_status"], "abort");
        let back: Document = serde_json::from_value(json).unwrap();
        assert_eq!(back.name(), "stop");
        assert_eq!(back.run_uid(), "run-1");
    }

    #[test]
    fn monitor_merge_keeps_latest_values() {
        let mut first = MonitorDoc::new("monitor/position")
            .with_value("mx", 1.0)
            .with_value("my", 2.0);
        first.merge(MonitorDoc::new("monitor/position").with_value("mx", 3.0));
        assert_eq!(first.data["mx"], Value::Float(3.0));
        assert_eq!(first.data["my"], Value::Float(2.0));
    }

    #[test]
    fn external_data_key() {
        let key = DataKey::array("SIM:cam1", vec![4, 4]).with_external("FRAME");
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["external"], "FRAME");
        assert!(DataKey::scalar("x").external.is_none());
    }
}
