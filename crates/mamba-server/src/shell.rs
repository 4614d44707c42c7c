//! Interactive shell: a Rhai engine on its own OS thread, bound to one
//! [`SystemContext`].
//!
//! | binding | effect |
//! |---|---|
//! | `mv("mx", 1.5)` | absolute move, returns when the motor settles |
//! | `rd("det.cam")` | `#{key: value}` of a device, sub-device or signal |
//! | `count(["det"], 5)` | repeated reads |
//! | `scan(["det"], "mx", 0, 1, 11)` | 1-D step scan |
//! | `grid(["det"], [#{name, start, stop, point_num}, …], snake)` | step grid, slowest axis first |
//! | `fly(["det"], "mx", #{lo, hi, num, period})` | one fly line |
//! | `fly_grid(["det"], axes, "mx", #{…}, snake)` | one fly line per outer point; `snake` is a bool or one bool per axis |
//! | `pause()`, `resume()`, `abort(reason)`, `state()` | engine control |
//! | `plans()`, `run_plan(name)` | stored plans |
//!
//! Scans evaluate to `#{uid, exit_status, reason, num_events}`. The value
//! of each successful cell is kept as JSON and reported by `cmd`.
//!
//! Bindings block the shell thread on the session runtime; the engine
//! itself runs as a runtime task so control requests from the service
//! reach it while a cell is busy.

use crate::context::SystemContext;
use futures::{SinkExt, StreamExt};
use mamba_core::{MambaError, MambaResult, StopDoc};
use mamba_experiment::{FlyParams, GridConfig, MotorRange};
use parking_lot::Mutex;
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{Dynamic, Engine, EvalAltResult, Position, Scope};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as Json};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

struct Job {
    line: String,
    reply: oneshot::Sender<MambaResult<Json>>,
}

/// Submits cells to the shell thread. Clones share the thread, which exits
/// once the last handle is dropped.
#[derive(Clone)]
pub struct ShellHandle {
    jobs: std_mpsc::Sender<Job>,
    last: Arc<Mutex<Option<Json>>>,
}

impl ShellHandle {
    /// Start the shell thread. `init` is evaluated before the first cell;
    /// a failing init script is logged and otherwise ignored.
    pub fn spawn(
        ctx: Arc<SystemContext>,
        runtime: Handle,
        init: Option<PathBuf>,
    ) -> MambaResult<Self> {
        let (jobs, rx) = std_mpsc::channel::<Job>();
        let last = Arc::new(Mutex::new(None));
        let hook = last.clone();
        std::thread::Builder::new()
            .name("mamba-shell".into())
            .spawn(move || {
                let mut shell = Shell::new(ctx, runtime);
                if let Some(path) = init {
                    shell.load_init(&path);
                }
                for job in rx {
                    let result = shell.eval(&job.line);
                    if let Ok(value) = &result {
                        *hook.lock() = Some(value.clone());
                    }
                    let _ = job.reply.send(result);
                }
                debug!("shell thread exiting");
            })?;
        Ok(Self { jobs, last })
    }

    /// Queue a cell without waiting for it.
    pub fn queue(&self, line: &str) -> MambaResult<oneshot::Receiver<MambaResult<Json>>> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job {
                line: line.to_string(),
                reply,
            })
            .map_err(|_| MambaError::Protocol("shell thread has exited".into()))?;
        Ok(rx)
    }

    /// Evaluate a cell and wait for its value.
    pub async fn submit(&self, line: &str) -> MambaResult<Json> {
        self.queue(line)?
            .await
            .map_err(|_| MambaError::Protocol("shell dropped the cell".into()))?
    }

    /// Value of the most recent successful cell.
    pub fn last_result(&self) -> Option<Json> {
        self.last.lock().clone()
    }
}

// =============================================================================
// Shell thread
// =============================================================================

struct Shell {
    engine: Engine,
    scope: Scope<'static>,
    failure: Arc<Mutex<Option<MambaError>>>,
}

impl Shell {
    fn new(ctx: Arc<SystemContext>, runtime: Handle) -> Self {
        let failure = Arc::new(Mutex::new(None));
        let mut engine = Engine::new();
        engine.on_print(|text| info!(target: "mamba::shell", "{}", text));
        register_bindings(
            &mut engine,
            Bindings {
                ctx,
                runtime,
                failure: failure.clone(),
            },
        );
        Self {
            engine,
            scope: Scope::new(),
            failure,
        }
    }

    fn eval(&mut self, line: &str) -> MambaResult<Json> {
        self.failure.lock().take();
        match self.engine.eval_with_scope::<Dynamic>(&mut self.scope, line) {
            Ok(value) => Ok(to_json(&value)),
            // A binding that failed left the typed error behind.
            Err(err) => Err(self
                .failure
                .lock()
                .take()
                .unwrap_or_else(|| script_error(&err))),
        }
    }

    fn load_init(&mut self, path: &Path) {
        let script = match std::fs::read_to_string(path) {
            Ok(script) => script,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read init script");
                return;
            }
        };
        match self.eval(&script) {
            Ok(_) => info!(path = %path.display(), "init script loaded"),
            Err(e) => warn!(path = %path.display(), error = %e, "init script failed"),
        }
    }
}

fn to_json(value: &Dynamic) -> Json {
    from_dynamic::<Json>(value).unwrap_or_else(|_| Json::String(value.to_string()))
}

/// Errors raised by the script itself rather than by a binding.
fn script_error(err: &EvalAltResult) -> MambaError {
    match err {
        EvalAltResult::ErrorParsing(kind, pos) => {
            MambaError::Syntax(format!("{} ({})", kind, pos))
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => script_error(inner),
        EvalAltResult::ErrorFunctionNotFound(signature, _) => {
            MambaError::Syntax(format!("unknown function {}", signature))
        }
        EvalAltResult::ErrorVariableNotFound(name, _) => {
            MambaError::Key(format!("unknown variable {}", name))
        }
        other => MambaError::Other(anyhow::anyhow!("{}", other)),
    }
}

fn summary(stop: Option<StopDoc>) -> Json {
    match stop {
        Some(stop) => json!({
            "uid": stop.run_uid,
            "exit_status": stop.exit_status.to_string(),
            "reason": stop.reason,
            "num_events": stop.num_events,
        }),
        None => Json::Null,
    }
}

// =============================================================================
// Bindings
// =============================================================================

#[derive(Clone)]
struct Bindings {
    ctx: Arc<SystemContext>,
    runtime: Handle,
    failure: Arc<Mutex<Option<MambaError>>>,
}

impl Bindings {
    fn fail(&self, err: MambaError) -> Box<EvalAltResult> {
        let text = err.to_string();
        *self.failure.lock() = Some(err);
        Box::new(EvalAltResult::ErrorRuntime(text.into(), Position::NONE))
    }

    fn check<T>(&self, result: MambaResult<T>) -> RhaiResult<T> {
        result.map_err(|e| self.fail(e))
    }

    /// Run `fut` as a runtime task and block the shell thread on it.
    fn block<F, T>(&self, fut: F) -> RhaiResult<T>
    where
        F: Future<Output = MambaResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        match self.runtime.block_on(self.runtime.spawn(fut)) {
            Ok(result) => self.check(result),
            Err(join) => Err(self.fail(MambaError::Other(anyhow::anyhow!(
                "shell task failed: {}",
                join
            )))),
        }
    }

    fn arg<T: DeserializeOwned>(&self, what: &str, value: &Dynamic) -> RhaiResult<T> {
        from_dynamic(value).map_err(|e| self.fail(MambaError::Syntax(format!("{}: {}", what, e))))
    }

    fn ret(&self, value: Json) -> RhaiResult<Dynamic> {
        to_dynamic(value)
    }
}

fn register_bindings(engine: &mut Engine, b: Bindings) {
    // ---- motion and reads ----

    let s = b.clone();
    engine.register_fn("mv", move |motor: &str, position: Dynamic| -> RhaiResult<()> {
        let position: f64 = s.arg("position", &position)?;
        let planner = s.ctx.planner.clone();
        let moves = vec![(motor.to_string(), position)];
        s.block(async move { planner.mv(&moves).await })
    });

    let s = b.clone();
    engine.register_fn("rd", move |path: &str| -> RhaiResult<Dynamic> {
        let component = s.check(s.ctx.registry.resolve(path))?;
        let values: serde_json::Map<String, Json> = component
            .read()
            .into_iter()
            .map(|(key, reading)| (key, reading.value.to_json()))
            .collect();
        s.ret(Json::Object(values))
    });

    engine.register_fn("sleep", |seconds: f64| {
        std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
    });

    // ---- step scans ----

    let s = b.clone();
    engine.register_fn("count", move |dets: Dynamic, num: Dynamic| -> RhaiResult<Dynamic> {
        let dets: Vec<String> = s.arg("detectors", &dets)?;
        let num: u64 = s.arg("num", &num)?;
        let planner = s.ctx.planner.clone();
        let stop = s.block(async move { planner.count(&dets, num, 0.0).await })?;
        s.ret(summary(stop))
    });

    let s = b.clone();
    engine.register_fn(
        "scan",
        move |dets: Dynamic,
              motor: &str,
              start: Dynamic,
              stop: Dynamic,
              num: Dynamic|
              -> RhaiResult<Dynamic> {
            let dets: Vec<String> = s.arg("detectors", &dets)?;
            let start: f64 = s.arg("start", &start)?;
            let end: f64 = s.arg("stop", &stop)?;
            let num: u64 = s.arg("num", &num)?;
            let motor = motor.to_string();
            let planner = s.ctx.planner.clone();
            let stop = s.block(async move { planner.scan(&dets, &motor, start, end, num).await })?;
            s.ret(summary(stop))
        },
    );

    let s = b.clone();
    engine.register_fn(
        "grid",
        move |dets: Dynamic, axes: Dynamic, snake: bool| -> RhaiResult<Dynamic> {
            let dets: Vec<String> = s.arg("detectors", &dets)?;
            let axes: Vec<MotorRange> = s.arg("axes", &axes)?;
            let planner = s.ctx.planner.clone();
            let stop = s.block(async move { planner.grid(&dets, &axes, snake).await })?;
            s.ret(summary(stop))
        },
    );

    // ---- fly scans ----

    let s = b.clone();
    engine.register_fn(
        "fly",
        move |dets: Dynamic, motor: &str, params: Dynamic| -> RhaiResult<Dynamic> {
            let dets: Vec<String> = s.arg("detectors", &dets)?;
            let params: FlyParams = s.arg("fly parameters", &params)?;
            let motor = motor.to_string();
            let planner = s.ctx.planner.clone();
            let stop = s.block(async move { planner.fly(&dets, &motor, &params, None).await })?;
            s.ret(summary(stop))
        },
    );

    let s = b.clone();
    engine.register_fn(
        "fly_grid",
        move |dets: Dynamic,
              outer: Dynamic,
              motor: &str,
              params: Dynamic,
              snake: Dynamic|
              -> RhaiResult<Dynamic> {
            let dets: Vec<String> = s.arg("detectors", &dets)?;
            let outer: Vec<MotorRange> = s.arg("axes", &outer)?;
            let params: FlyParams = s.arg("fly parameters", &params)?;
            let cfg = GridConfig {
                snake: s.arg("snake", &snake)?,
                ..GridConfig::default()
            };
            let motor = motor.to_string();
            let planner = s.ctx.planner.clone();
            let stop = s.block(async move {
                planner
                    .fly_grid(&dets, &outer, &motor, &params, cfg, None)
                    .await
            })?;
            s.ret(summary(stop))
        },
    );

    // ---- engine control ----

    let s = b.clone();
    engine.register_fn("pause", move || -> RhaiResult<()> {
        s.check(s.ctx.engine().request_pause())
    });

    let s = b.clone();
    engine.register_fn("resume", move || -> RhaiResult<()> {
        s.check(s.ctx.engine().resume())
    });

    let s = b.clone();
    engine.register_fn("abort", move |reason: &str| -> RhaiResult<()> {
        s.check(s.ctx.engine().abort(reason))
    });

    let s = b.clone();
    engine.register_fn("abort", move || -> RhaiResult<()> {
        s.check(s.ctx.engine().abort("aborted from the shell"))
    });

    let s = b.clone();
    engine.register_fn("state", move || -> String { s.ctx.engine().state().to_string() });

    // ---- stored plans ----

    let s = b.clone();
    engine.register_fn("plans", move || -> RhaiResult<Dynamic> {
        let names = s.check(s.ctx.plans.list())?;
        s.ret(json!(names))
    });

    let s = b;
    engine.register_fn("run_plan", move |name: &str| -> RhaiResult<Dynamic> {
        let plan = s.check(s.ctx.plans.get_plan(name))?;
        let planner = s.ctx.planner.clone();
        let stop = s.block(async move { planner.run_plan(&plan).await })?;
        s.ret(summary(stop))
    });
}

// =============================================================================
// stdin relay
// =============================================================================

/// Line-oriented relay on `lport`: every received line is one cell, answered
/// with its JSON value or `error <kind>: <description>`.
pub async fn serve_stdin_relay(listener: TcpListener, shell: ShellHandle) -> MambaResult<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        info!(peer = %peer, "shell relay client connected");
        let shell = shell.clone();
        tokio::spawn(async move {
            let mut lines = Framed::new(socket, LinesCodec::new());
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "relay read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let answer = match shell.submit(&line).await {
                    Ok(value) => value.to_string(),
                    Err(e) => format!("error {}: {}", e.kind().as_str(), e),
                };
                if lines.send(answer).await.is_err() {
                    break;
                }
            }
            debug!(peer = %peer, "shell relay client left");
        });
    }
}
