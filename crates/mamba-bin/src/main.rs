//! `mamba` server entry point.
//!
//! Loads the configuration, builds the simulated devices and the session,
//! then serves the shell relay, control and broadcast ports while reading
//! shell cells from stdin.
//!
//! ```bash
//! mamba --config ~/.mamba/config.yaml --log-level debug
//! ```
//!
//! Exit codes: 0 on a clean shutdown, 1 for configuration errors, 2 for
//! runtime failures.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod logging;
mod settings;

use anyhow::{Context, Result};
use clap::Parser;
use logging::TracingConfig;
use mamba_core::DeviceRegistry;
use mamba_driver_mock::build_devices;
use mamba_experiment::PlanStore;
use mamba_server::{
    run_backend, AddonEnv, AddonRegistry, Addons, BackendAddrs, ControlService, DataRouter,
    ShellHandle, SystemContext,
};
use mamba_storage::FileWriter;
use serde_json::Value as Json;
use settings::{default_config_path, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mamba")]
#[command(about = "Scan execution and data routing server", long_about = None)]
struct Cli {
    /// Configuration file [default: ~/.mamba/config.yaml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides logging.level
    #[arg(long)]
    log_level: Option<String>,

    /// Serve the network ports only; do not read cells from stdin
    #[arg(long)]
    no_stdin: bool,
}

struct System {
    ctx: Arc<SystemContext>,
    service: Arc<ControlService>,
    shell: ShellHandle,
    addrs: BackendAddrs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("mamba: configuration error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let tracing = TracingConfig::from_settings(&settings.logging)
        .and_then(|config| logging::init(&config));
    if let Err(e) = tracing {
        eprintln!("mamba: configuration error: {}", e);
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "cannot start the runtime");
            return ExitCode::from(2);
        }
    };

    let system = match setup(&settings, runtime.handle()) {
        Ok(system) => system,
        Err(e) => {
            error!(error = %format!("{:#}", e), "configuration error");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(serve(system, !cli.no_stdin)) {
        Ok(()) => {
            info!("mamba stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "mamba failed");
            ExitCode::from(2)
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let path = match &cli.config {
        Some(path) => {
            anyhow::ensure!(path.exists(), "{} does not exist", path.display());
            path.clone()
        }
        None => default_config_path().context("cannot locate the home directory")?,
    };
    let mut settings = Settings::load_from(&path)
        .with_context(|| format!("cannot load {}", path.display()))?;
    if let Some(level) = &cli.log_level {
        settings.logging.level = level.clone();
    }
    settings.validate().map_err(anyhow::Error::msg)?;
    Ok(settings)
}

fn setup(settings: &Settings, runtime: &Handle) -> Result<System> {
    let registry = DeviceRegistry::new();
    let sims = build_devices(&settings.devices, &registry).context("cannot build devices")?;
    info!(
        devices = registry.len(),
        motors = sims.motors.len(),
        cameras = sims.cameras.len(),
        sequencers = sims.sequencers.len(),
        "devices ready"
    );

    let router = DataRouter::new(settings.monitor_periods(), Some(registry.clone()));
    let plans = PlanStore::new(&settings.scan.plans);
    let mut ctx = SystemContext::new(registry.clone(), router, plans)
        .with_preflight(settings.preflight.clone());
    if let Some(sequencer) = &settings.sequencer {
        ctx = ctx.with_sequencer(sequencer);
    }
    let writer = FileWriter::new(settings.files.clone()).context("bad files section")?;
    info!(dir = %settings.files.dir.display(), session = %writer.session(), "file writer ready");
    let ctx = Arc::new(ctx.with_file_writer(Arc::new(writer))?);

    let shell = ShellHandle::spawn(ctx.clone(), runtime.clone(), settings.backend.init.clone())?;

    let env = AddonEnv { registry };
    let server_addons = settings.server_addons().map_err(anyhow::Error::msg)?;
    let addons = Addons::load(&server_addons, &AddonRegistry::builtin(), &env)?;
    let service = ControlService::new(ctx.clone(), Some(shell.clone()))
        .with_addons(addons)
        .with_client_addons(settings.client_addons().map_err(anyhow::Error::msg)?);

    let addrs = BackendAddrs::new(&settings.network.bind_address, settings.backend.lport)?;
    info!(
        host = %settings.network.host_address,
        lport = settings.backend.lport,
        "clients connect to host:lport+1 (control) and host:lport+2 (broadcast)"
    );
    Ok(System {
        ctx,
        service: Arc::new(service),
        shell,
        addrs,
    })
}

async fn serve(system: System, stdin: bool) -> Result<()> {
    let System {
        ctx,
        service,
        shell,
        addrs,
    } = system;
    let backend = tokio::spawn(async move { run_backend(&addrs, service).await });
    let cells = async {
        if stdin {
            stdin_cells(&shell).await
        } else {
            std::future::pending().await
        }
    };

    tokio::select! {
        joined = backend => {
            joined.context("backend task panicked")??;
        }
        result = cells => {
            result?;
            info!("stdin closed");
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupted");
        }
    }

    let engine = ctx.engine();
    if engine.abort("server shutting down").is_ok() {
        warn!("aborted the running scan");
    }
    Ok(())
}

/// One cell per line; values go to stdout, errors to stderr.
async fn stdin_cells(shell: &ShellHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match shell.submit(&line).await {
            Ok(Json::Null) => {}
            Ok(value) => println!("{}", value),
            Err(e) => eprintln!("{}: {}", e.kind(), e),
        }
    }
    Ok(())
}
