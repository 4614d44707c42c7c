//! `mamba-core`
//!
//! Building blocks of the mamba scan core: value cells ([`Signal`]),
//! completion handles ([`Status`]), composite devices ([`Device`]) with their
//! trigger strategies, and the document model produced by a run.
//!
//! ## Key Types
//!
//! - [`Signal`]: named value with monotone timestamps and ordered subscribers
//! - [`Status`]: `pending → finished | failed`, awaitable with a timeout
//! - [`Device`]: ordered components, `stage_sigs`, aggregate reads
//! - [`TriggerStrategy`]: [`SoftTrigger`] and [`ThreadedTrigger`]
//! - [`Document`]: `start`, `descriptor`, `event`, `stop`
//! - [`MambaError`]: error type with the wire-level [`ErrorKind`] taxonomy
//!
//! ## Example
//!
//! ```rust,no_run
//! use mamba_core::{DeviceBuilder, Kind};
//!
//! let det = DeviceBuilder::new("det")
//!     .readback("value", 0)
//!     .signal("acquire_time", 0.1, Kind::Config)
//!     .stage_sig("acquire_time", 0.5)
//!     .build();
//! assert_eq!(det.describe().len(), det.read().len());
//! ```

pub mod capabilities;
pub mod configure;
pub mod device;
pub mod document;
pub mod error;
pub mod publish;
pub mod registry;
pub mod seq_table;
pub mod signal;
pub mod status;
pub mod trigger;
pub mod value;

pub use capabilities::{Flyer, Frame, FrameSource, Movable};
pub use configure::{configure, translate, DeviceConfig};
pub use device::{Component, Device, DeviceBuilder, StageTarget, STAGE_KEEP};
pub use document::{
    new_uid, DataKey, DescriptorDoc, Document, EventDoc, ExitStatus, Metadata, MonitorDoc,
    StartDoc, StopDoc,
};
pub use error::{ErrorKind, MambaError, MambaResult, StatusError};
pub use publish::{DocumentCallback, FnCallback, LocalCallbacks, NullPublisher, Publisher};
pub use registry::DeviceRegistry;
pub use seq_table::{SeqRow, SeqTable, SeqTrigger, SEQ_CLOCK_HZ, SEQ_MAX_ROWS};
pub use signal::{Kind, Signal};
pub use status::{Status, StatusState};
pub use trigger::{SoftTrigger, ThreadedTrigger, TriggerStrategy};
pub use value::{now_secs, Reading, Value};
