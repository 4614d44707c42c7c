//! Name → device lookup shared by the engine, the control plane and the
//! shell.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::device::{Component, Device};
use crate::error::{MambaError, MambaResult};

/// Registry of top-level devices. Clones share the same table.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<BTreeMap<String, Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device under its own name.
    pub fn register(&self, device: Device) -> MambaResult<()> {
        let mut devices = self.devices.write();
        let name = device.name().to_string();
        if devices.contains_key(&name) {
            return Err(MambaError::Dup(format!("device '{}' already registered", name)));
        }
        info!(device = %name, "registered device");
        devices.insert(name, device);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Device> {
        self.devices.read().get(name).cloned()
    }

    pub fn require(&self, name: &str) -> MambaResult<Device> {
        self.get(name)
            .ok_or_else(|| MambaError::Key(name.to_string()))
    }

    /// Resolve `device[.child...]`.
    pub fn resolve(&self, path: &str) -> MambaResult<Component> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let device = self.require(head)?;
        match rest {
            None => Ok(Component::Device(device)),
            Some(rest) => device
                .resolve(rest)
                .ok_or_else(|| MambaError::Key(path.to_string())),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.read().keys().cloned().collect()
    }

    pub fn devices(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceBuilder;
    use crate::signal::Kind;

    #[test]
    fn dotted_resolution() {
        let registry = DeviceRegistry::new();
        registry
            .register(
                DeviceBuilder::new("det")
                    .device("cam", |b| b.signal("acquire_time", 1.0, Kind::Config))
                    .build(),
            )
            .unwrap();

        assert!(matches!(registry.resolve("det"), Ok(Component::Device(_))));
        assert!(matches!(
            registry.resolve("det.cam.acquire_time"),
            Ok(Component::Signal(_))
        ));
        assert!(matches!(registry.resolve("det.cam.nope"), Err(MambaError::Key(_))));
        assert!(matches!(registry.resolve("nope"), Err(MambaError::Key(_))));
    }

    #[test]
    fn duplicate_names_rejected() {
        let registry = DeviceRegistry::new();
        registry.register(DeviceBuilder::new("m1").build()).unwrap();
        assert!(matches!(
            registry.register(DeviceBuilder::new("m1").build()),
            Err(MambaError::Dup(_))
        ));
        assert_eq!(registry.names(), vec!["m1"]);
    }
}
