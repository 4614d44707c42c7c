//! Seams between document producers and consumers.
//!
//! * [`DocumentCallback`]: a subscriber in the run engine's callback bundle.
//!   Callbacks run synchronously on the engine task, in bundle order.
//! * [`Publisher`]: where out-of-band monitor documents go (the data router
//!   in a running system).
//! * [`LocalCallbacks`]: an in-process sink registered with the data router.

use crate::document::{DescriptorDoc, Document, EventDoc, MonitorDoc, StartDoc, StopDoc};
use crate::error::MambaResult;

/// Subscriber receiving every document of a run.
///
/// Errors returned while handling `descriptor`, `event` or `stop` are logged
/// and dropped unless wrapped with [`crate::MambaError::fatal`]. Any error
/// while handling `start` aborts the run.
pub trait DocumentCallback: Send {
    fn name(&self) -> &str;

    fn on_document(&mut self, doc: &Document) -> MambaResult<()>;
}

/// Wraps a closure as a [`DocumentCallback`].
pub struct FnCallback<F> {
    name: String,
    f: F,
}

impl<F> FnCallback<F>
where
    F: FnMut(&Document) -> MambaResult<()> + Send,
{
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }

    pub fn boxed(name: &str, f: F) -> Box<dyn DocumentCallback>
    where
        F: 'static,
    {
        Box::new(Self::new(name, f))
    }
}

impl<F> DocumentCallback for FnCallback<F>
where
    F: FnMut(&Document) -> MambaResult<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_document(&mut self, doc: &Document) -> MambaResult<()> {
        (self.f)(doc)
    }
}

/// Destination for monitor documents and notifications.
pub trait Publisher: Send + Sync {
    fn push_monitor(&self, doc: MonitorDoc);

    fn push_document(&self, doc: &Document);
}

/// Publisher that drops everything; used when nothing listens.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn push_monitor(&self, _doc: MonitorDoc) {}

    fn push_document(&self, _doc: &Document) {}
}

/// In-process sink registered with the data router.
pub trait LocalCallbacks: Send + Sync {
    fn scan_start(&self, doc: &StartDoc) -> MambaResult<()>;

    fn descriptor(&self, _doc: &DescriptorDoc) -> MambaResult<()> {
        Ok(())
    }

    fn data_update(&self, doc: &EventDoc) -> MambaResult<()>;

    fn scan_end(&self, doc: &StopDoc) -> MambaResult<()>;

    fn monitor(&self, _doc: &MonitorDoc) -> MambaResult<()> {
        Ok(())
    }
}
