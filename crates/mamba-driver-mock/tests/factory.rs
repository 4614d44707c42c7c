use mamba_core::{Component, DeviceRegistry, Flyer, MambaError};
use mamba_driver_mock::{build_devices, DeviceSpec};
use std::collections::BTreeMap;

fn specs(yaml: &str) -> BTreeMap<String, DeviceSpec> {
    serde_yaml::from_str(yaml).unwrap()
}

#[test]
fn builds_and_wires_from_yaml() {
    let registry = DeviceRegistry::new();
    let sims = build_devices(
        &specs(
            r#"
panda: { type: sequencer, posa: mx, outputs: [cam1] }
mx: { type: motor, velocity: 2.0, encoder_scale: -0.001 }
det: { type: detector }
tdet: { type: threaded_detector, exposure: 0.0 }
cam1: { type: camera, width: 8, height: 8 }
"#,
        ),
        &registry,
    )
    .unwrap();

    assert_eq!(registry.names(), vec!["cam1", "det", "mx", "panda", "tdet"]);
    assert!(sims.motors.contains_key("mx"));
    assert!(sims.cameras.contains_key("cam1"));

    let panda = registry.get("panda").unwrap();
    let keys = panda.flyer().unwrap().describe_collect();
    assert!(keys.contains_key("panda_posa"));
    assert!(keys.contains_key("cam1_image"));

    assert!(matches!(
        registry.resolve("mx.encoder.scale"),
        Ok(Component::Signal(_))
    ));
}

#[test]
fn bad_wiring_is_a_config_error() {
    let registry = DeviceRegistry::new();
    let err = build_devices(
        &specs("panda: { type: sequencer, posa: det }\ndet: { type: detector }\n"),
        &registry,
    )
    .err()
    .unwrap();
    assert!(matches!(err, MambaError::Config(_)));
}
