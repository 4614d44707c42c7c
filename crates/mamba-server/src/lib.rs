//! `mamba-server`
//!
//! Everything between the run engine and the outside world.
//!
//! ```text
//!   lport     shell stdin relay ──► ShellHandle (Rhai thread)
//!   lport+1   request/reply ──────► ControlService ──► SystemContext
//!   lport+2   broadcast ◄────────── DataRouter ◄────── RunEngine, plugins
//! ```
//!
//! - [`DataRouter`]: document fan-out, topic subscriptions, monitor throttling
//! - [`ControlService`]: `cmd`, `dev/*`, `scan/*`, `plans/*` and addon verbs
//! - [`ShellHandle`]: interactive shell with the scan bindings
//! - [`SystemContext`]: the per-session wiring

pub mod addons;
pub mod broadcast;
pub mod context;
pub mod protocol;
pub mod router;
pub mod service;
pub mod shell;
pub mod throttle;

pub use addons::{
    Addon, AddonDescriptor, AddonEnv, AddonFactory, AddonRegistry, Addons, Session,
};
pub use broadcast::serve_broadcast;
pub use context::SystemContext;
pub use protocol::{JsonCodec, Notification, Reply, Request, MAX_FRAME};
pub use router::{topic_matches, DataRouter, POSITION_TOPIC, SCAN_LENGTH, SCAN_STEP};
pub use service::{run_backend, serve_control, BackendAddrs, ControlService};
pub use shell::{serve_stdin_relay, ShellHandle};
pub use throttle::Throttle;
