//! Request/reply control service.
//!
//! | request | reply `ret` |
//! |---|---|
//! | `cmd {cmd, wait?=true, go?=false, tag?}` | the cell value, or `{tag}` with `go` |
//! | `dev/read {path}` … `dev/keys {path}` | readings, data keys or key list |
//! | `scan/pause`, `scan/resume`, `scan/abort {reason?}`, `scan/state` | `{state, scan_id}` |
//! | `plans/list`, `plans/get {name}`, `plans/set {name, plan}`, `plans/remove {name}` | |
//! | `addons/client` | client addon descriptors |
//! | `<addon verb>/<op>` | addon specific |
//!
//! With `go`, the cell runs in the background and its reply is broadcast on
//! `cmd/<tag>`. A `scan/*` reply carries the latest run failure (kind in
//! `err`, message in `desc`) once, even when the request itself succeeded.

use crate::addons::{AddonDescriptor, Addons, Session};
use crate::broadcast::serve_broadcast;
use crate::context::SystemContext;
use crate::protocol::{JsonCodec, Notification, Reply, Request};
use crate::shell::{serve_stdin_relay, ShellHandle};
use futures::{SinkExt, StreamExt};
use mamba_core::{ErrorKind, MambaError, MambaResult};
use mamba_experiment::ScanPlan;
use serde_json::{json, Value as Json};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct ControlService {
    ctx: Arc<SystemContext>,
    shell: Option<ShellHandle>,
    addons: Addons,
    client_addons: Vec<AddonDescriptor>,
}

impl ControlService {
    pub fn new(ctx: Arc<SystemContext>, shell: Option<ShellHandle>) -> Self {
        Self {
            ctx,
            shell,
            addons: Addons::default(),
            client_addons: Vec::new(),
        }
    }

    pub fn with_addons(mut self, addons: Addons) -> Self {
        self.addons = addons;
        self
    }

    /// Descriptors handed to clients by `addons/client`.
    pub fn with_client_addons(mut self, descs: Vec<AddonDescriptor>) -> Self {
        self.client_addons = descs;
        self
    }

    pub fn context(&self) -> &Arc<SystemContext> {
        &self.ctx
    }

    /// Answer one request. Never fails; errors become error replies.
    pub async fn handle(&self, req: &Request, session: &mut Session) -> Reply {
        let result = match self.addons.authorize(req, session) {
            Ok(()) => self.dispatch(req, session).await,
            Err(e) => Err(e),
        };
        result.unwrap_or_else(|e| {
            debug!(session = %session.id, typ = %req.typ, error = %e, "request failed");
            Reply::error(&e)
        })
    }

    async fn dispatch(&self, req: &Request, session: &mut Session) -> MambaResult<Reply> {
        match req.verb_op() {
            ("cmd", None) => self.cmd(req).await.map(Reply::ok),
            ("dev", Some(op)) => self.dev(op, req).map(Reply::ok),
            ("scan", Some(op)) => self.scan(op, req),
            ("plans", Some(op)) => self.plans(op, req).map(Reply::ok),
            ("addons", Some("client")) => {
                let descs: Vec<String> = self.client_addons.iter().map(|d| d.to_string()).collect();
                Ok(Reply::ok(json!(descs)))
            }
            (verb, op) => match self.addons.find(verb) {
                Some(addon) => addon.handle(op, req, session).map(Reply::ok),
                None => Err(MambaError::Syntax(format!("unknown request {}", req.typ))),
            },
        }
    }

    async fn cmd(&self, req: &Request) -> MambaResult<Json> {
        let shell = self
            .shell
            .as_ref()
            .ok_or_else(|| MambaError::Empty("no shell attached".into()))?;
        let line = req.str_arg("cmd")?;
        let wait = req.opt_bool("wait", true)?;
        if req.opt_bool("go", false)? {
            let tag = req
                .opt_str("tag")?
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let rx = shell.queue(line)?;
            let router = self.ctx.router.clone();
            let topic = format!("cmd/{}", tag);
            tokio::spawn(async move {
                let result = rx
                    .await
                    .unwrap_or_else(|_| Err(MambaError::Protocol("shell dropped the cell".into())));
                let reply = Reply::from_result(result);
                let mut note = Notification::new(&topic).with("err", reply.err);
                if let Some(desc) = reply.desc {
                    note = note.with("desc", desc);
                }
                if let Some(ret) = reply.ret {
                    note = note.with("ret", ret);
                }
                router.publish(note);
            });
            return Ok(json!({ "tag": tag }));
        }
        if wait {
            shell.submit(line).await
        } else {
            shell.queue(line)?;
            Ok(Json::Null)
        }
    }

    fn dev(&self, op: &str, req: &Request) -> MambaResult<Json> {
        let path = req.str_arg("path")?;
        let component = self.ctx.registry.resolve(path)?;
        let value = match op {
            "read" => serde_json::to_value(component.read())?,
            "describe" => serde_json::to_value(component.describe())?,
            "read_configuration" => serde_json::to_value(component.read_configuration())?,
            "describe_configuration" => serde_json::to_value(component.describe_configuration())?,
            "keys" => json!(component.keys()),
            _ => return Err(MambaError::Syntax(format!("unknown request {}", req.typ))),
        };
        Ok(value)
    }

    fn scan(&self, op: &str, req: &Request) -> MambaResult<Reply> {
        let engine = self.ctx.engine();
        match op {
            "pause" => engine.request_pause()?,
            "resume" => engine.resume()?,
            "abort" => engine.abort(req.opt_str("reason")?.unwrap_or("abort requested"))?,
            "state" => {}
            _ => return Err(MambaError::Syntax(format!("unknown request {}", req.typ))),
        }
        let state = json!({
            "state": engine.state().to_string(),
            "scan_id": engine.scan_id(),
        });
        Ok(match engine.take_last_error() {
            Some(last) => {
                let desc = if last.kind == ErrorKind::Exc {
                    format!("{}: {}", last.type_name, last.message)
                } else {
                    last.message
                };
                Reply {
                    err: Some(last.kind.as_str().to_string()),
                    desc: Some(desc),
                    ret: Some(state),
                }
            }
            None => Reply::ok(state),
        })
    }

    fn plans(&self, op: &str, req: &Request) -> MambaResult<Json> {
        let store = &self.ctx.plans;
        match op {
            "list" => Ok(json!(store.list()?)),
            "get" => Ok(serde_json::to_value(store.get_plan(req.str_arg("name")?)?)?),
            "set" => {
                let name = req.str_arg("name")?;
                let plan: ScanPlan = serde_json::from_value(
                    req.args
                        .get("plan")
                        .cloned()
                        .ok_or_else(|| MambaError::Syntax(format!("{}: missing 'plan'", req.typ)))?,
                )
                .map_err(|e| MambaError::Syntax(format!("{}: {}", req.typ, e)))?;
                store.set_plan(name, &plan)?;
                Ok(Json::Null)
            }
            "remove" => {
                store.remove(req.str_arg("name")?)?;
                Ok(Json::Null)
            }
            _ => Err(MambaError::Syntax(format!("unknown request {}", req.typ))),
        }
    }
}

// =============================================================================
// TCP front end
// =============================================================================

/// Accept loop of the request/reply port.
pub async fn serve_control(listener: TcpListener, service: Arc<ControlService>) -> MambaResult<()> {
    info!(addr = ?listener.local_addr().ok(), "control service listening");
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, addr, service).await {
                        warn!(peer = %addr, error = %e, "control client error");
                    }
                });
            }
            Err(e) => error!(error = %e, "accept failed"),
        }
    }
}

/// A malformed frame is answered with a `syntax` reply and ends the
/// connection.
async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    service: Arc<ControlService>,
) -> MambaResult<()> {
    let mut session = Session::new(Uuid::new_v4().to_string());
    info!(peer = %addr, session = %session.id, "control client connected");
    let mut framed = Framed::new(socket, JsonCodec::<Json, Reply>::new());
    while let Some(frame) = framed.next().await {
        let reply = match frame {
            Ok(value) => match Request::from_json(value) {
                Ok(req) => service.handle(&req, &mut session).await,
                Err(e) => Reply::error(&e),
            },
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                framed
                    .send(Reply::error(&MambaError::Syntax(e.to_string())))
                    .await?;
                break;
            }
            Err(e) => return Err(e.into()),
        };
        framed.send(reply).await?;
    }
    info!(peer = %addr, session = %session.id, "control client disconnected");
    Ok(())
}

/// Listener addresses of one backend: stdin relay on `lport`, control on
/// `lport + 1`, broadcast on `lport + 2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAddrs {
    pub relay: String,
    pub control: String,
    pub broadcast: String,
}

impl BackendAddrs {
    pub fn new(bind: &str, lport: u16) -> MambaResult<Self> {
        let port = |offset: u16| {
            lport
                .checked_add(offset)
                .ok_or_else(|| MambaError::Config(format!("lport {} leaves no room", lport)))
        };
        Ok(Self {
            relay: format!("{}:{}", bind, lport),
            control: format!("{}:{}", bind, port(1)?),
            broadcast: format!("{}:{}", bind, port(2)?),
        })
    }
}

/// Bind all listeners, then serve until one of them fails.
pub async fn run_backend(addrs: &BackendAddrs, service: Arc<ControlService>) -> MambaResult<()> {
    let router = service.context().router.clone();
    let control = TcpListener::bind(&addrs.control).await?;
    let broadcast = TcpListener::bind(&addrs.broadcast).await?;
    let relay = match &service.shell {
        Some(shell) => Some((TcpListener::bind(&addrs.relay).await?, shell.clone())),
        None => None,
    };
    info!(
        control = %addrs.control,
        broadcast = %addrs.broadcast,
        relay = relay.is_some(),
        "backend up"
    );
    let relay = async move {
        match relay {
            Some((listener, shell)) => serve_stdin_relay(listener, shell).await,
            None => std::future::pending().await,
        }
    };
    tokio::try_join!(
        serve_control(control, service),
        serve_broadcast(broadcast, router),
        relay,
    )?;
    Ok(())
}
