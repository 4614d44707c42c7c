//! Per-session wiring of the subsystems.

use crate::router::DataRouter;
use mamba_core::{DeviceRegistry, MambaResult};
use mamba_experiment::{EngineHandle, PlanStore, Planner, Preflight, RunEngine};
use mamba_storage::FileWriter;
use std::sync::Arc;

/// Everything a session shares: devices, the router, the planner driving
/// the run engine, and the plan store. One context per shell session;
/// dropping it tears the session down.
pub struct SystemContext {
    pub registry: DeviceRegistry,
    pub router: Arc<DataRouter>,
    pub planner: Planner,
    pub plans: PlanStore,
    file_writer: Option<Arc<FileWriter>>,
}

impl SystemContext {
    /// Build a context whose run engine publishes through `router`.
    pub fn new(registry: DeviceRegistry, router: Arc<DataRouter>, plans: PlanStore) -> Self {
        let engine = RunEngine::with_publisher(router.clone());
        let planner = Planner::new(engine, registry.clone(), router.clone());
        Self {
            registry,
            router,
            planner,
            plans,
            file_writer: None,
        }
    }

    pub fn with_preflight(mut self, preflight: Preflight) -> Self {
        self.planner = self.planner.clone().with_preflight(preflight);
        self
    }

    pub fn with_sequencer(mut self, name: &str) -> Self {
        self.planner = self.planner.clone().with_sequencer(name);
        self
    }

    /// Register `writer` with the router so every run lands in a file.
    pub fn with_file_writer(mut self, writer: Arc<FileWriter>) -> MambaResult<Self> {
        self.router.register_local("file_writer", writer.clone())?;
        self.file_writer = Some(writer);
        Ok(self)
    }

    pub fn engine(&self) -> EngineHandle {
        self.planner.handle()
    }

    pub fn file_writer(&self) -> Option<&Arc<FileWriter>> {
        self.file_writer.as_ref()
    }
}

impl Drop for SystemContext {
    fn drop(&mut self) {
        self.router.release_monitors();
        if self.file_writer.is_some() {
            self.router.unregister_local("file_writer");
        }
    }
}
