//! Capability traits attached to devices.
//!
//! Devices are composites of signals; behavior that cannot be expressed as a
//! signal write (moving an axis, serving image frames) is provided through
//! these traits and registered on the device by its builder.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::document::DataKey;
use crate::status::Status;
use crate::value::Reading;

/// Capability: Motion Control
///
/// Devices that can move to positions (stages, rotation mounts, motors).
#[async_trait]
pub trait Movable: Send + Sync {
    /// Move to absolute position in user units and return when the motion
    /// completes or is stopped.
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Current user position.
    async fn position(&self) -> Result<f64>;

    /// Halt motion in progress. A pending `move_abs` returns an error.
    async fn stop(&self) -> Result<()>;
}

/// One detector image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl Frame {
    /// Little-endian pixel bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }

    pub fn as_f64(&self) -> Vec<f64> {
        self.pixels.iter().map(|p| f64::from(*p)).collect()
    }
}

/// Capability: Frame Retrieval
///
/// Image detectors put a frame reference in their event data and serve the
/// pixels on request.
pub trait FrameSource: Send + Sync {
    /// Look up a frame by the id carried in event data.
    fn frame(&self, id: u64) -> Option<Frame>;

    /// (width, height)
    fn resolution(&self) -> (u32, u32);
}

/// Capability: Buffered Acquisition
///
/// Devices that record points autonomously during a hardware-timed sweep
/// and hand them over afterwards. Each collected row becomes one event.
pub trait Flyer: Send + Sync {
    /// Data keys of the rows returned by [`Flyer::collect`].
    fn describe_collect(&self) -> BTreeMap<String, DataKey>;

    /// Drain the rows captured since the last call, oldest first.
    fn collect(&self) -> Vec<BTreeMap<String, Reading>>;

    /// Status finishing once at least `points` rows wait to be collected.
    fn complete(&self, points: usize) -> Status {
        let _ = points;
        Status::finished()
    }
}
