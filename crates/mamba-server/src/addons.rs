//! Server addons: extra request verbs configured as `module:function(arg)`.
//!
//! Addons are resolved through an [`AddonRegistry`] of known factories; an
//! unknown descriptor is a configuration error at startup.
//!
//! | descriptor | verbs |
//! |---|---|
//! | `auth:users(<yaml>)` | `auth/login {user, password}`, `auth/logout` |
//! | `meta:store(<json>)` | `meta/get {key?}`, `meta/set {key, value}` |
//! | `attitude:motors(<m1,m2,…>)` | `attitude/get` |
//!
//! While `auth` is loaded, every other verb requires a logged-in session.

use crate::protocol::Request;
use crate::router::readback;
use mamba_core::{DeviceRegistry, MambaError, MambaResult};
use parking_lot::Mutex;
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// `module:function(argument)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonDescriptor {
    pub module: String,
    pub factory: String,
    pub argument: String,
}

impl FromStr for AddonDescriptor {
    type Err = MambaError;

    fn from_str(s: &str) -> MambaResult<Self> {
        let bad = || MambaError::Config(format!("bad addon descriptor '{}'", s));
        let (module, rest) = s.trim().split_once(':').ok_or_else(bad)?;
        let (factory, rest) = rest.split_once('(').ok_or_else(bad)?;
        let argument = rest.strip_suffix(')').ok_or_else(bad)?;
        let ident = |x: &str| !x.is_empty() && x.chars().all(|c| c.is_alphanumeric() || c == '_');
        if !ident(module) || !ident(factory) {
            return Err(bad());
        }
        Ok(Self {
            module: module.to_string(),
            factory: factory.to_string(),
            argument: argument.trim().to_string(),
        })
    }
}

impl fmt::Display for AddonDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}({})", self.module, self.factory, self.argument)
    }
}

/// Connection state visible to addons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub user: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: None,
        }
    }
}

pub trait Addon: Send + Sync {
    /// Request verb served by this addon.
    fn verb(&self) -> &str;

    fn handle(&self, op: Option<&str>, req: &Request, session: &mut Session) -> MambaResult<Json>;

    /// Gate applied to every request before dispatch.
    fn authorize(&self, _req: &Request, _session: &Session) -> MambaResult<()> {
        Ok(())
    }
}

/// What a factory may need besides its argument.
pub struct AddonEnv {
    pub registry: DeviceRegistry,
}

pub type AddonFactory = fn(&str, &AddonEnv) -> anyhow::Result<Box<dyn Addon>>;

/// Known `module:function` factories.
pub struct AddonRegistry {
    factories: BTreeMap<(String, String), AddonFactory>,
}

impl AddonRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("auth", "users", |arg, _| Ok(Box::new(AuthAddon::load(arg)?)));
        registry.register("meta", "store", |arg, _| Ok(Box::new(MetaAddon::load(arg)?)));
        registry.register("attitude", "motors", |arg, env| {
            Ok(Box::new(AttitudeAddon::new(arg, env.registry.clone())?))
        });
        registry
    }

    pub fn register(&mut self, module: &str, factory: &str, f: AddonFactory) {
        self.factories
            .insert((module.to_string(), factory.to_string()), f);
    }

    pub fn build(&self, desc: &AddonDescriptor, env: &AddonEnv) -> MambaResult<Box<dyn Addon>> {
        let factory = self
            .factories
            .get(&(desc.module.clone(), desc.factory.clone()))
            .ok_or_else(|| MambaError::Config(format!("unknown addon {}", desc)))?;
        factory(&desc.argument, env).map_err(|e| MambaError::Config(format!("{}: {:#}", desc, e)))
    }
}

/// The loaded addons of one service.
#[derive(Default)]
pub struct Addons {
    items: Vec<Box<dyn Addon>>,
}

impl Addons {
    pub fn load(
        descs: &[AddonDescriptor],
        registry: &AddonRegistry,
        env: &AddonEnv,
    ) -> MambaResult<Self> {
        let mut items: Vec<Box<dyn Addon>> = Vec::with_capacity(descs.len());
        for desc in descs {
            let addon = registry.build(desc, env)?;
            if items.iter().any(|a| a.verb() == addon.verb()) {
                return Err(MambaError::Config(format!(
                    "verb '{}' is served twice",
                    addon.verb()
                )));
            }
            info!(addon = %desc, verb = addon.verb(), "addon loaded");
            items.push(addon);
        }
        Ok(Self { items })
    }

    pub fn push(&mut self, addon: Box<dyn Addon>) {
        self.items.push(addon);
    }

    pub fn find(&self, verb: &str) -> Option<&dyn Addon> {
        self.items.iter().find(|a| a.verb() == verb).map(|a| a.as_ref())
    }

    pub fn authorize(&self, req: &Request, session: &Session) -> MambaResult<()> {
        self.items.iter().try_for_each(|a| a.authorize(req, session))
    }

    pub fn verbs(&self) -> Vec<&str> {
        self.items.iter().map(|a| a.verb()).collect()
    }
}

// =============================================================================
// auth:users
// =============================================================================

/// Users and passwords from a YAML mapping.
pub struct AuthAddon {
    users: BTreeMap<String, String>,
}

impl AuthAddon {
    pub fn new(users: BTreeMap<String, String>) -> Self {
        Self { users }
    }

    pub fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(serde_yaml::from_str(&text)?))
    }
}

impl Addon for AuthAddon {
    fn verb(&self) -> &str {
        "auth"
    }

    fn handle(&self, op: Option<&str>, req: &Request, session: &mut Session) -> MambaResult<Json> {
        match op {
            Some("login") => {
                if let Some(user) = &session.user {
                    return Err(MambaError::Dup(format!("already logged in as {}", user)));
                }
                let user = req.str_arg("user")?;
                let password = req.str_arg("password")?;
                if self.users.get(user).map(String::as_str) != Some(password) {
                    warn!(session = %session.id, user, "login refused");
                    return Err(MambaError::Deny(format!("bad credentials for {}", user)));
                }
                info!(session = %session.id, user, "logged in");
                session.user = Some(user.to_string());
                Ok(Json::Null)
            }
            Some("logout") => match session.user.take() {
                Some(user) => {
                    info!(session = %session.id, user = %user, "logged out");
                    Ok(Json::Null)
                }
                None => Err(MambaError::Dup("not logged in".into())),
            },
            _ => Err(MambaError::Syntax(format!("unknown request {}", req.typ))),
        }
    }

    fn authorize(&self, req: &Request, session: &Session) -> MambaResult<()> {
        if req.verb_op().0 == "auth" || session.user.is_some() {
            Ok(())
        } else {
            Err(MambaError::Deny(format!("{} requires login", req.typ)))
        }
    }
}

// =============================================================================
// meta:store
// =============================================================================

/// Key/value metadata persisted as a JSON object.
pub struct MetaAddon {
    path: PathBuf,
    values: Mutex<Map<String, Json>>,
}

impl MetaAddon {
    /// A missing file starts an empty store.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let path = PathBuf::from(path);
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &Map<String, Json>) -> MambaResult<()> {
        let text = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

impl Addon for MetaAddon {
    fn verb(&self) -> &str {
        "meta"
    }

    fn handle(&self, op: Option<&str>, req: &Request, _session: &mut Session) -> MambaResult<Json> {
        match op {
            Some("get") => {
                let values = self.values.lock();
                match req.opt_str("key")? {
                    None => Ok(Json::Object(values.clone())),
                    Some(key) => values
                        .get(key)
                        .cloned()
                        .ok_or_else(|| MambaError::Empty(format!("no metadata '{}'", key))),
                }
            }
            Some("set") => {
                let key = req.str_arg("key")?;
                let value = req.args.get("value").cloned().unwrap_or(Json::Null);
                let mut values = self.values.lock();
                values.insert(key.to_string(), value);
                self.persist(&values)?;
                Ok(Json::Null)
            }
            _ => Err(MambaError::Syntax(format!("unknown request {}", req.typ))),
        }
    }
}

// =============================================================================
// attitude:motors
// =============================================================================

/// Reports the positions of a fixed list of motors.
pub struct AttitudeAddon {
    motors: Vec<String>,
    registry: DeviceRegistry,
}

impl AttitudeAddon {
    pub fn new(list: &str, registry: DeviceRegistry) -> anyhow::Result<Self> {
        let motors: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect();
        anyhow::ensure!(!motors.is_empty(), "no motors given");
        Ok(Self { motors, registry })
    }
}

impl Addon for AttitudeAddon {
    fn verb(&self) -> &str {
        "attitude"
    }

    fn handle(&self, op: Option<&str>, req: &Request, _session: &mut Session) -> MambaResult<Json> {
        if op != Some("get") {
            return Err(MambaError::Syntax(format!("unknown request {}", req.typ)));
        }
        let mut out = Map::new();
        for name in &self.motors {
            let motor = self.registry.require(name)?;
            let signal = readback(&motor)
                .ok_or_else(|| MambaError::Key(format!("{} has no readback", name)))?;
            out.insert(name.clone(), signal.get().to_json());
        }
        Ok(Json::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_parse() {
        let d: AddonDescriptor = "auth:users(/etc/mamba/users.yaml)".parse().unwrap();
        assert_eq!(d.module, "auth");
        assert_eq!(d.factory, "users");
        assert_eq!(d.argument, "/etc/mamba/users.yaml");
        assert_eq!(d.to_string(), "auth:users(/etc/mamba/users.yaml)");
        assert!("auth:users".parse::<AddonDescriptor>().is_err());
        assert!("auth(users)".parse::<AddonDescriptor>().is_err());
        assert!(":x()".parse::<AddonDescriptor>().is_err());
    }

    #[test]
    fn login_lifecycle() {
        let users = BTreeMap::from([("ada".to_string(), "pw".to_string())]);
        let auth = AuthAddon::new(users);
        let mut session = Session::new("s1");
        let read = Request::new("dev/read").with("path", "mx");
        assert_eq!(auth.authorize(&read, &session).unwrap_err().kind().as_str(), "deny");

        let bad = Request::new("auth/login").with("user", "ada").with("password", "no");
        let err = auth.handle(Some("login"), &bad, &mut session).unwrap_err();
        assert_eq!(err.kind().as_str(), "deny");

        let good = Request::new("auth/login").with("user", "ada").with("password", "pw");
        auth.handle(Some("login"), &good, &mut session).unwrap();
        assert!(auth.authorize(&read, &session).is_ok());
        let err = auth.handle(Some("login"), &good, &mut session).unwrap_err();
        assert_eq!(err.kind().as_str(), "dup");

        let out = Request::new("auth/logout");
        auth.handle(Some("logout"), &out, &mut session).unwrap();
        let err = auth.handle(Some("logout"), &out, &mut session).unwrap_err();
        assert_eq!(err.kind().as_str(), "dup");
    }

    #[test]
    fn meta_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let path_str = path.to_str().unwrap();
        let meta = MetaAddon::load(path_str).unwrap();
        let mut session = Session::new("s1");

        let get = Request::new("meta/get").with("key", "sample");
        let err = meta.handle(Some("get"), &get, &mut session).unwrap_err();
        assert_eq!(err.kind().as_str(), "empty");

        let set = Request::new("meta/set").with("key", "sample").with("value", "Si");
        meta.handle(Some("set"), &set, &mut session).unwrap();
        let again = MetaAddon::load(path_str).unwrap();
        assert_eq!(again.handle(Some("get"), &get, &mut session).unwrap(), Json::from("Si"));
    }

    #[test]
    fn unknown_factories_are_config_errors() {
        let env = AddonEnv {
            registry: DeviceRegistry::new(),
        };
        let desc: AddonDescriptor = "nope:thing(x)".parse().unwrap();
        let err = AddonRegistry::builtin().build(&desc, &env).err().unwrap();
        assert!(matches!(err, MambaError::Config(_)));
        let desc: AddonDescriptor = "attitude:motors()".parse().unwrap();
        assert!(AddonRegistry::builtin().build(&desc, &env).is_err());
    }
}
