//! Completion handles for asynchronous device work.
//!
//! A [`Status`] starts `Pending` and transitions at most once to either
//! `Finished` or `Failed`. The state lives in a `tokio::sync::watch` channel
//! so any number of tasks can await it, while completion callbacks are kept
//! in a `parking_lot` mutex and drained exactly once.
//!
//! ```rust,ignore
//! let status = motor.set(Value::from(1.0))?;
//! status.add_callback(|state| tracing::debug!(?state, "move done"));
//! status.wait(Some(Duration::from_secs(5))).await?;
//! ```

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

use crate::error::{ErrorKind, StatusError};

/// Lifecycle of a [`Status`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatusState {
    Pending,
    Finished,
    Failed(StatusError),
}

impl StatusState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusState::Pending)
    }
}

type StatusCallback = Box<dyn FnOnce(&StatusState) + Send>;

struct StatusInner {
    state: watch::Sender<StatusState>,
    callbacks: Mutex<Vec<StatusCallback>>,
}

/// Shared completion handle. Clones observe the same state.
#[derive(Clone)]
pub struct Status {
    inner: Arc<StatusInner>,
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status").field("state", &self.state()).finish()
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

impl Status {
    /// A new pending status.
    pub fn new() -> Self {
        let (state, _) = watch::channel(StatusState::Pending);
        Self {
            inner: Arc::new(StatusInner {
                state,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A status that is already finished.
    pub fn finished() -> Self {
        let status = Self::new();
        status.set_finished();
        status
    }

    /// A status that has already failed.
    pub fn failed(err: StatusError) -> Self {
        let status = Self::new();
        status.set_exception(err);
        status
    }

    /// Drive `fut` on the current tokio runtime and resolve the status with
    /// its outcome. Fails immediately when called outside a runtime.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<(), StatusError>> + Send + 'static,
    {
        let status = Self::new();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let st = status.clone();
                handle.spawn(async move {
                    match fut.await {
                        Ok(()) => st.set_finished(),
                        Err(e) => st.set_exception(e),
                    };
                });
            }
            Err(_) => {
                status.set_exception(StatusError::new(
                    ErrorKind::Hardware,
                    "no async runtime available",
                ));
            }
        }
        status
    }

    /// A status that finishes once every status in `statuses` finishes, or
    /// fails with the first failure observed.
    pub fn all(statuses: Vec<Status>) -> Self {
        let combined = Self::new();
        if statuses.is_empty() {
            combined.set_finished();
            return combined;
        }
        let remaining = Arc::new(AtomicUsize::new(statuses.len()));
        for status in statuses {
            let combined = combined.clone();
            let remaining = remaining.clone();
            status.add_callback(move |state| match state {
                StatusState::Failed(e) => {
                    combined.set_exception(e.clone());
                }
                _ => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        combined.set_finished();
                    }
                }
            });
        }
        combined
    }

    pub fn state(&self) -> StatusState {
        self.inner.state.borrow().clone()
    }

    pub fn done(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn success(&self) -> bool {
        matches!(self.state(), StatusState::Finished)
    }

    /// Mark finished. Returns `false` if the status was already terminal.
    pub fn set_finished(&self) -> bool {
        self.transition(StatusState::Finished)
    }

    /// Mark failed. Returns `false` if the status was already terminal.
    pub fn set_exception(&self, err: StatusError) -> bool {
        self.transition(StatusState::Failed(err))
    }

    fn transition(&self, next: StatusState) -> bool {
        let mut callbacks = self.inner.callbacks.lock();
        let changed = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next.clone();
                true
            }
        });
        if !changed {
            return false;
        }
        let pending = std::mem::take(&mut *callbacks);
        drop(callbacks);
        for cb in pending {
            cb(&next);
        }
        true
    }

    /// Register `cb` to run exactly once when the status completes. Runs
    /// immediately if the status is already terminal.
    pub fn add_callback<F>(&self, cb: F)
    where
        F: FnOnce(&StatusState) + Send + 'static,
    {
        let mut callbacks = self.inner.callbacks.lock();
        let state = self.inner.state.borrow().clone();
        if state.is_terminal() {
            drop(callbacks);
            cb(&state);
        } else {
            callbacks.push(Box::new(cb));
        }
    }

    /// Wait for completion. A timeout marks the status failed with
    /// [`ErrorKind::Timeout`] and returns that failure.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), StatusError> {
        let mut rx = self.inner.state.subscribe();
        let join = async move {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    StatusState::Finished => return Ok(()),
                    StatusState::Failed(e) => return Err(e),
                    StatusState::Pending => {}
                }
                if rx.changed().await.is_err() {
                    return Err(StatusError::hardware("status dropped while pending"));
                }
            }
        };

        match timeout {
            None => join.await,
            Some(limit) => match tokio::time::timeout(limit, join).await {
                Ok(result) => result,
                Err(_) => {
                    let err = StatusError::timeout(format!("status not done after {:?}", limit));
                    if !self.set_exception(err.clone()) {
                        warn!("status completed while its wait timed out");
                        return match self.state() {
                            StatusState::Failed(e) => Err(e),
                            _ => Ok(()),
                        };
                    }
                    Err(err)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn terminal_transition_happens_once() {
        let status = Status::new();
        assert!(status.set_finished());
        assert!(!status.set_exception(StatusError::hardware("late")));
        assert!(status.success());
    }

    #[test]
    fn callback_fires_exactly_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let status = Status::new();
        let h = hits.clone();
        status.add_callback(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        status.set_finished();
        status.set_finished();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Added after completion: fires immediately.
        let h = hits.clone();
        status.add_callback(move |state| {
            assert_eq!(*state, StatusState::Finished);
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_reports_failure() {
        let status = Status::new();
        let st = status.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            st.set_exception(StatusError::hardware("limit switch"));
        });
        let err = status.wait(None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Hardware);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_fails_status() {
        let status = Status::new();
        let err = status
            .wait(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(matches!(status.state(), StatusState::Failed(_)));
    }

    #[tokio::test]
    async fn all_joins_and_propagates_first_failure() {
        let a = Status::new();
        let b = Status::new();
        let both = Status::all(vec![a.clone(), b.clone()]);
        a.set_finished();
        assert!(!both.done());
        b.set_finished();
        assert!(both.wait(None).await.is_ok());

        let c = Status::new();
        let d = Status::finished();
        let either = Status::all(vec![c.clone(), d]);
        c.set_exception(StatusError::hardware("stall"));
        assert!(either.wait(None).await.is_err());
    }

    #[tokio::test]
    async fn spawn_resolves_from_future() {
        let status = Status::spawn(async { Ok(()) });
        status.wait(Some(Duration::from_secs(1))).await.unwrap();
        let status = Status::spawn(async { Err(StatusError::hardware("nope")) });
        assert!(status.wait(None).await.is_err());
    }

    #[test]
    fn finished_status_resolves_outside_a_runtime() {
        assert!(tokio_test::block_on(Status::finished().wait(None)).is_ok());
        let status = Status::new();
        status.set_exception(StatusError::hardware("jammed"));
        let err = tokio_test::block_on(status.wait(None)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Hardware);
    }
}
