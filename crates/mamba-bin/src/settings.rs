//! Configuration using Figment
//!
//! Settings are loaded from:
//! 1. the YAML file given with `--config` (default `~/.mamba/config.yaml`)
//! 2. environment variables prefixed with `MAMBA_`, nested with `__`
//!    (`MAMBA_BACKEND__LPORT=6000`)
//!
//! ```yaml
//! backend:
//!   lport: 5678
//!   saddons: ["auth:users(/etc/mamba/users.yaml)"]
//!   init: ~/.mamba/init.rhai
//! scan:
//!   plans: ~/.mamba/plans
//! files:
//!   dir: /data
//!   prefix: bl
//!   name_pattern: "{prefix}_{session}_{scan_id}"
//! monitor_periods:
//!   monitor/position: 0.1
//! devices:
//!   mx: { type: motor }
//!   det: { type: detector }
//! ```

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use mamba_driver_mock::DeviceSpec;
use mamba_experiment::Preflight;
use mamba_server::AddonDescriptor;
use mamba_storage::FileWriterConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendSettings,
    pub scan: ScanSettings,
    pub files: FileWriterConfig,
    pub logging: LoggingSettings,
    pub network: NetworkSettings,
    /// Simulated devices by name.
    pub devices: BTreeMap<String, DeviceSpec>,
    /// Throttle period per monitor topic, in seconds.
    pub monitor_periods: HashMap<String, f64>,
    pub preflight: Preflight,
    /// Device used as the fly-scan sequencer.
    pub sequencer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Shell relay port; control and broadcast use the next two.
    pub lport: u16,
    /// Server addons, `module:function(arg)`.
    pub saddons: Vec<String>,
    /// Client addons, handed out by `addons/client`.
    pub caddons: Vec<String>,
    /// Shell script run before the first cell.
    pub init: Option<PathBuf>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            lport: 5678,
            saddons: Vec::new(),
            caddons: Vec::new(),
            init: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub plans: PathBuf,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            plans: PathBuf::from("plans"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
    /// Additional JSON log file.
    pub logfile: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            logfile: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Address clients are told to connect to.
    pub host_address: String,
    pub bind_address: String,
    pub protocol: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            host_address: "127.0.0.1".to_string(),
            bind_address: "127.0.0.1".to_string(),
            protocol: "tcp".to_string(),
        }
    }
}

/// `~/.mamba/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mamba").join("config.yaml"))
}

/// Expand a leading `~/`.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl Settings {
    /// Load `path` (which may be absent) and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        let mut settings: Settings = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("MAMBA_").split("__"))
            .extract()?;
        settings.resolve_paths();
        Ok(settings)
    }

    fn resolve_paths(&mut self) {
        self.scan.plans = expand_home(&self.scan.plans);
        self.files.dir = expand_home(&self.files.dir);
        self.backend.init = self.backend.init.as_deref().map(expand_home);
        self.logging.logfile = self.logging.logfile.as_deref().map(expand_home);
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.backend.lport == 0 || self.backend.lport > u16::MAX - 2 {
            return Err(format!(
                "Invalid backend.lport {}. Must leave room for lport+2",
                self.backend.lport
            ));
        }

        if self.network.protocol != "tcp" {
            return Err(format!(
                "Invalid network.protocol '{}'. Only tcp is supported",
                self.network.protocol
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        for (topic, period) in &self.monitor_periods {
            if !period.is_finite() || *period < 0.0 {
                return Err(format!("Invalid monitor period {} for '{}'", period, topic));
            }
        }

        self.server_addons()?;
        self.client_addons()?;

        if let Some(seq) = &self.sequencer {
            if !self.devices.contains_key(seq) {
                return Err(format!("Sequencer '{}' is not a configured device", seq));
            }
        }

        Ok(())
    }

    pub fn server_addons(&self) -> Result<Vec<AddonDescriptor>, String> {
        parse_addons(&self.backend.saddons)
    }

    pub fn client_addons(&self) -> Result<Vec<AddonDescriptor>, String> {
        parse_addons(&self.backend.caddons)
    }

    pub fn monitor_periods(&self) -> HashMap<String, Duration> {
        self.monitor_periods
            .iter()
            .map(|(topic, secs)| (topic.clone(), Duration::from_secs_f64(secs.max(0.0))))
            .collect()
    }
}

fn parse_addons(descs: &[String]) -> Result<Vec<AddonDescriptor>, String> {
    descs
        .iter()
        .map(|d| d.parse::<AddonDescriptor>().map_err(|e| e.to_string()))
        .collect()
}
