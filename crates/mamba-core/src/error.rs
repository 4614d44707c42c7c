//! Error types shared by every mamba crate.
//!
//! `MambaError` is the primary error enum. Each variant maps onto an
//! [`ErrorKind`], which is the short string carried in the `err` field of a
//! control-plane reply and recorded by the run engine as the latest failure.
//!
//! ## Error Hierarchy
//!
//! - **Request errors** (`Syntax`, `Key`, `Deny`, `Dup`, `Empty`): caused by
//!   the caller; the request can be corrected and retried.
//! - **Run errors** (`Protocol`, `Aborted`, `Status`, `UnprimedPlugin`,
//!   `Check`): terminate the active run and end up in the `stop` document.
//! - **Environment errors** (`Config`, `Io`, `Json`, `Hardware`): surfaced at
//!   startup or while talking to devices and files.
//!
//! [`StatusError`] is the clonable failure carried by a [`crate::Status`];
//! it converts into `MambaError::Status` with `?`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the mamba error type.
pub type MambaResult<T> = std::result::Result<T, MambaError>;

/// Error taxonomy used on the wire and by the run engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request.
    Syntax,
    /// Unknown device or field.
    Key,
    /// Unauthorized.
    Deny,
    /// Lifecycle precondition (already logged in / out).
    Dup,
    /// No data for the request.
    Empty,
    /// Unhandled failure inside a handler.
    Exc,
    /// A threaded trigger or status wait exceeded its window.
    Timeout,
    /// A detector plugin was not warmed up before a fly scan.
    UnprimedPlugin,
    /// The run was aborted.
    Abort,
    /// The plan violated the message protocol.
    Protocol,
    /// A device reported a failure.
    Hardware,
    /// Invalid configuration.
    Config,
    /// A pre-flight or in-flight consistency check failed.
    Check,
}

impl ErrorKind {
    /// Wire representation of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Key => "key",
            ErrorKind::Deny => "deny",
            ErrorKind::Dup => "dup",
            ErrorKind::Empty => "empty",
            ErrorKind::Exc => "exc",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::UnprimedPlugin => "UnprimedPlugin",
            ErrorKind::Abort => "abort",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Hardware => "hardware",
            ErrorKind::Config => "config",
            ErrorKind::Check => "check",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure carried by a completed [`crate::Status`].
///
/// Statuses are cloned freely between the engine, device tasks and
/// callbacks, so the error must be `Clone` and cannot wrap arbitrary
/// sources.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StatusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn hardware(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Hardware, message)
    }
}

/// Primary error type for mamba.
#[derive(Error, Debug)]
pub enum MambaError {
    /// Malformed request or unknown verb.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Unknown device path, component or field.
    #[error("unknown key: {0}")]
    Key(String),

    /// The caller is not authorized.
    #[error("permission denied: {0}")]
    Deny(String),

    /// A lifecycle precondition was already satisfied (logging in twice).
    #[error("{0}")]
    Dup(String),

    /// The request matched nothing.
    #[error("no data: {0}")]
    Empty(String),

    /// A plan emitted messages in an order the engine cannot execute,
    /// e.g. `save` without any `read` since `create`.
    #[error("plan protocol violation: {0}")]
    Protocol(String),

    /// The run was aborted by request.
    #[error("run aborted: {0}")]
    Aborted(String),

    /// An asynchronous device operation failed.
    #[error(transparent)]
    Status(#[from] StatusError),

    /// A fly-scan detector plugin has not been primed.
    ///
    /// **Recovery Strategy**: issue `warmup()` on the plugin and retry.
    #[error("detector plugin not primed: {0}")]
    UnprimedPlugin(String),

    /// A pre-flight or in-flight consistency check failed.
    #[error("check failed: {0}")]
    Check(String),

    /// Device-level failure outside of a status handle.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// Configuration parsed but failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wraps an error a callback wants to propagate into the run instead of
    /// having it logged and demoted.
    #[error("{0}")]
    Fatal(Box<MambaError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Anything else; reported as `exc` on the wire.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MambaError {
    /// Marks `err` as one that must terminate the run when raised from a
    /// document callback.
    pub fn fatal(err: MambaError) -> Self {
        match err {
            MambaError::Fatal(_) => err,
            other => MambaError::Fatal(Box::new(other)),
        }
    }

    /// Whether a callback raised this error explicitly.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MambaError::Fatal(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MambaError::Syntax(_) | MambaError::Json(_) => ErrorKind::Syntax,
            MambaError::Key(_) => ErrorKind::Key,
            MambaError::Deny(_) => ErrorKind::Deny,
            MambaError::Dup(_) => ErrorKind::Dup,
            MambaError::Empty(_) => ErrorKind::Empty,
            MambaError::Protocol(_) => ErrorKind::Protocol,
            MambaError::Aborted(_) => ErrorKind::Abort,
            MambaError::Status(e) => e.kind,
            MambaError::UnprimedPlugin(_) => ErrorKind::UnprimedPlugin,
            MambaError::Check(_) => ErrorKind::Check,
            MambaError::Hardware(_) => ErrorKind::Hardware,
            MambaError::Config(_) => ErrorKind::Config,
            MambaError::Fatal(inner) => inner.kind(),
            MambaError::Io(_) | MambaError::Other(_) => ErrorKind::Exc,
        }
    }

    /// Short type name reported alongside `exc` replies.
    pub fn type_name(&self) -> &'static str {
        match self {
            MambaError::Syntax(_) => "SyntaxError",
            MambaError::Key(_) => "KeyError",
            MambaError::Deny(_) => "PermissionError",
            MambaError::Dup(_) => "DuplicateError",
            MambaError::Empty(_) => "EmptyError",
            MambaError::Protocol(_) => "ProtocolError",
            MambaError::Aborted(_) => "RunAborted",
            MambaError::Status(e) if e.kind == ErrorKind::Timeout => "TimeoutError",
            MambaError::Status(_) => "StatusError",
            MambaError::UnprimedPlugin(_) => "UnprimedPlugin",
            MambaError::Check(_) => "CheckError",
            MambaError::Hardware(_) => "HardwareError",
            MambaError::Config(_) => "ConfigError",
            MambaError::Fatal(inner) => inner.type_name(),
            MambaError::Io(_) => "IoError",
            MambaError::Json(_) => "JsonError",
            MambaError::Other(_) => "Exception",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_converts_with_kind() {
        let err: MambaError = StatusError::timeout("busy flag never cleared").into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.type_name(), "TimeoutError");
    }

    #[test]
    fn fatal_wrapping_is_idempotent() {
        let err = MambaError::fatal(MambaError::fatal(MambaError::Check("counter".into())));
        assert!(err.is_fatal());
        assert_eq!(err.kind(), ErrorKind::Check);
        match err {
            MambaError::Fatal(inner) => assert!(!inner.is_fatal()),
            _ => panic!("expected fatal"),
        }
    }

    #[test]
    fn wire_names() {
        assert_eq!(ErrorKind::UnprimedPlugin.to_string(), "UnprimedPlugin");
        assert_eq!(ErrorKind::Syntax.as_str(), "syntax");
        let json = serde_json::to_string(&ErrorKind::Dup).unwrap();
        assert_eq!(json, "\"dup\"");
    }
}
