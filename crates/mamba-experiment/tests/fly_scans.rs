//! Fly scans with a simulated sequencer gating a camera.

use mamba_core::{
    Device, DeviceConfig, DeviceRegistry, Document, ErrorKind, EventDoc, ExitStatus, MonitorDoc,
    Publisher, Value,
};
use mamba_driver_mock::{
    SimCamera, SimCameraConfig, SimMotor, SimMotorConfig, SimSequencer,
};
use mamba_experiment::{AuxDetector, Div, FlyParams, GridConfig, MotorRange, Planner, RunEngine};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Recorder {
    docs: Mutex<Vec<Document>>,
    monitors: Mutex<Vec<MonitorDoc>>,
}

impl Recorder {
    fn events(&self) -> Vec<EventDoc> {
        self.docs
            .lock()
            .iter()
            .filter_map(|d| match d {
                Document::Event(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Publisher for Recorder {
    fn push_monitor(&self, doc: MonitorDoc) {
        self.monitors.lock().push(doc);
    }

    fn push_document(&self, doc: &Document) {
        self.docs.lock().push(doc.clone());
    }
}

struct Beamline {
    registry: DeviceRegistry,
    mx: Device,
    camera: Arc<SimCamera>,
    sequencer: Arc<SimSequencer>,
    rec: Arc<Recorder>,
    planner: Planner,
}

fn beamline(motor: SimMotorConfig) -> Beamline {
    let registry = DeviceRegistry::new();
    let (mx, sim_mx) = SimMotor::create("mx", motor);
    let (my, _) = SimMotor::create("my", SimMotorConfig::default());
    let (cam, camera) = SimCamera::create("cam1", SimCameraConfig::default());
    let (panda, sequencer) = SimSequencer::create("panda");
    sequencer.bind_posa(sim_mx.encoder_raw(), sim_mx.readback());
    sequencer.add_output(cam.clone());
    for device in [mx.clone(), my, cam, panda] {
        registry.register(device).unwrap();
    }
    let rec = Arc::new(Recorder::default());
    let planner = Planner::new(
        RunEngine::with_publisher(rec.clone()),
        registry.clone(),
        rec.clone(),
    );
    Beamline {
        registry,
        mx,
        camera,
        sequencer,
        rec,
        planner,
    }
}

fn motor_config() -> SimMotorConfig {
    SimMotorConfig {
        velocity: 2.0,
        encoder_scale: 1e-3,
        ..Default::default()
    }
}

fn params() -> FlyParams {
    FlyParams {
        period: Some(0.01),
        ..FlyParams::new(0.0, 1.0, 5)
    }
}

fn counters(events: &[EventDoc]) -> Vec<i64> {
    events
        .iter()
        .map(|e| e.data["cam1_cam_array_counter"].as_i64().unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn fly_line_collects_every_gate() {
    let bl = beamline(motor_config());
    bl.camera.warmup();

    let stop = bl
        .planner
        .fly(&["cam1".to_string()], "mx", &params(), None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Success, "{}", stop.reason);
    let events = bl.rec.events();
    assert_eq!(events.len(), 5);
    // warm-up frame is 1
    assert_eq!(counters(&events), vec![2, 3, 4, 5, 6]);
    assert!(events.iter().all(|e| e.data.contains_key("panda_posa")));
    assert!(bl.sequencer.is_primed());
    assert!(!bl.sequencer.is_active());
    // velocity restored after the sweep changed it
    assert_eq!(bl.mx.signal("velocity").unwrap().get(), Value::Float(2.0));

    let start = bl.rec.docs.lock().iter().find_map(|d| match d {
        Document::Start(s) => Some(s.clone()),
        _ => None,
    });
    let start = start.unwrap();
    assert_eq!(start.plan_name, "fly");
    assert_eq!(start.num_points, Some(5));
    assert_eq!(start.hints["progress"], serde_json::json!(["simple", 5]));
}

#[tokio::test(start_paused = true)]
async fn snake_fly_grid_alternates_tables() {
    let bl = beamline(motor_config());
    bl.camera.warmup();
    let outer = vec![MotorRange {
        name: "my".into(),
        start: 0.0,
        stop: 1.0,
        point_num: 2,
    }];
    let cfg = GridConfig {
        div: Div::Lines(1),
        snake: true.into(),
        progress: None,
    };

    let stop = bl
        .planner
        .fly_grid(&["cam1".to_string()], &outer, "mx", &params(), cfg, None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Success, "{}", stop.reason);
    let events = bl.rec.events();
    assert_eq!(events.len(), 10);
    let seq: Vec<u64> = events.iter().map(|e| e.seq_num).collect();
    assert_eq!(seq, (1..=10).collect::<Vec<_>>());
    assert_eq!(counters(&events), (2..=11).collect::<Vec<_>>());
    let my = bl.registry.require("my").unwrap();
    assert_eq!(my.signal("user_readback").unwrap().get(), Value::Float(1.0));
}

#[tokio::test(start_paused = true)]
async fn unprimed_camera_is_refused() {
    let bl = beamline(motor_config());
    let err = bl
        .planner
        .fly(&["cam1".to_string()], "mx", &params(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnprimedPlugin);
    assert!(bl.rec.docs.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn encoder_disagreement_is_refused() {
    let bl = beamline(SimMotorConfig {
        encoder_error: 0.5,
        ..motor_config()
    });
    bl.camera.warmup();
    let err = bl
        .planner
        .fly(&["cam1".to_string()], "mx", &params(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Check);
}

#[tokio::test(start_paused = true)]
async fn aux_detector_is_configured_and_restored() {
    let bl = beamline(motor_config());
    bl.camera.warmup();
    let trigger_mode = bl
        .registry
        .require("cam1")
        .unwrap()
        .signal("cam.trigger_mode")
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        trigger_mode.subscribe(move |r| seen.lock().push(r.value.clone()));
    }
    let aux = AuxDetector {
        name: "cam1".into(),
        setup: DeviceConfig::new().with("cam.trigger_mode", 1),
        restore: DeviceConfig::new().with("cam.trigger_mode", 0),
    };

    let stop = bl
        .planner
        .fly(&["cam1".to_string()], "mx", &params(), Some(&aux))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Success, "{}", stop.reason);
    assert_eq!(trigger_mode.get(), Value::Int(0));
    assert!(seen.lock().contains(&Value::Int(1)));
}

#[tokio::test(start_paused = true)]
async fn abort_mid_sweep_restores_velocity_and_aux_settings() {
    let bl = beamline(motor_config());
    bl.camera.warmup();
    let trigger_mode = bl
        .registry
        .require("cam1")
        .unwrap()
        .signal("cam.trigger_mode")
        .unwrap();
    let aux = AuxDetector {
        name: "cam1".into(),
        setup: DeviceConfig::new().with("cam.trigger_mode", 1),
        restore: DeviceConfig::new().with("cam.trigger_mode", 0),
    };
    let params = FlyParams {
        period: Some(0.2),
        ..FlyParams::new(0.0, 1.0, 5)
    };

    let velocity = bl.mx.signal("velocity").unwrap();
    let handle = bl.planner.handle();
    let aborter = {
        let velocity = velocity.clone();
        tokio::spawn(async move {
            while velocity.get() == Value::Float(2.0) {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            handle.abort("operator").unwrap();
        })
    };

    let stop = bl
        .planner
        .fly(&["cam1".to_string()], "mx", &params, Some(&aux))
        .await
        .unwrap()
        .unwrap();
    aborter.await.unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Abort);
    assert_eq!(velocity.get(), Value::Float(2.0));
    assert_eq!(trigger_mode.get(), Value::Int(0));
    assert!(!bl.mx.is_staged());
}
