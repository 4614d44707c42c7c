//! Step scans against simulated hardware.

use mamba_core::{
    Device, DeviceRegistry, Document, DocumentCallback, EventDoc, ExitStatus, FnCallback,
    Metadata, MonitorDoc, Publisher, Value,
};
use mamba_driver_mock::{
    sim_detector, MockMode, SimCamera, SimCameraConfig, SimDetectorConfig, SimMotor,
    SimMotorConfig,
};
use mamba_experiment::{plans, Axis, EngineState, MotorRange, Planner, RunEngine};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

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

    fn topics(&self) -> Vec<String> {
        self.monitors.lock().iter().map(|m| m.topic.clone()).collect()
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

fn recording(rec: Arc<Recorder>) -> Box<dyn DocumentCallback> {
    FnCallback::boxed("recorder", move |doc: &Document| {
        rec.push_document(doc);
        Ok(())
    })
}

fn motor(name: &str, mode: MockMode) -> (Device, Arc<SimMotor>) {
    SimMotor::create(
        name,
        SimMotorConfig {
            mode,
            ..Default::default()
        },
    )
}

fn floats(events: &[EventDoc], key: &str) -> Vec<f64> {
    events
        .iter()
        .map(|e| e.data[key].as_f64().unwrap())
        .collect()
}

#[tokio::test]
async fn snake_grid_through_the_planner() {
    let registry = DeviceRegistry::new();
    let (mx, _) = motor("mx", MockMode::Instant);
    let (my, _) = motor("my", MockMode::Instant);
    registry.register(mx).unwrap();
    registry.register(my).unwrap();
    registry
        .register(sim_detector("det", SimDetectorConfig::default()))
        .unwrap();

    let rec = Arc::new(Recorder::default());
    let planner = Planner::new(RunEngine::with_publisher(rec.clone()), registry, rec.clone());
    let axes = vec![
        MotorRange {
            name: "my".into(),
            start: 0.0,
            stop: 2.0,
            point_num: 2,
        },
        MotorRange {
            name: "mx".into(),
            start: 0.0,
            stop: 1.0,
            point_num: 3,
        },
    ];
    let stop = planner
        .grid(&["det".to_string()], &axes, true)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Success);
    assert_eq!(stop.total_events(), 6);
    let events = rec.events();
    assert_eq!(floats(&events, "det"), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(floats(&events, "mx"), vec![0.0, 0.5, 1.0, 1.0, 0.5, 0.0]);
    assert_eq!(floats(&events, "my"), vec![0.0, 0.0, 0.0, 2.0, 2.0, 2.0]);
    let seq: Vec<u64> = events.iter().map(|e| e.seq_num).collect();
    assert_eq!(seq, vec![1, 2, 3, 4, 5, 6]);

    let progress: Vec<f64> = rec
        .monitors
        .lock()
        .iter()
        .filter(|m| m.topic == "scan/progress")
        .map(|m| m.data["fraction"].as_f64().unwrap())
        .collect();
    assert_eq!(progress.len(), 6);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(planner.handle().scan_id(), 1);
}

#[tokio::test]
async fn pause_at_event_three_then_resume() {
    let (mx, _) = motor("mx", MockMode::Instant);
    let det = sim_detector("det", SimDetectorConfig::default());
    let rec = Arc::new(Recorder::default());
    let engine = RunEngine::with_publisher(rec.clone());
    let handle = engine.handle();

    let pauser = {
        let handle = handle.clone();
        FnCallback::boxed("pauser", move |doc: &Document| {
            if let Document::Event(e) = doc {
                if e.seq_num == 3 {
                    handle.request_pause()?;
                }
            }
            Ok(())
        })
    };
    let resumer = {
        let handle = handle.clone();
        let mut state = handle.subscribe_state();
        tokio::spawn(async move {
            state
                .wait_for(|s| *s == EngineState::Paused)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.resume().unwrap();
        })
    };

    let mut callbacks = vec![recording(rec.clone()), pauser];
    let plan = plans::scan(vec![det], &mx, 0.0, 1.0, 6, Metadata::new());
    let stop = engine
        .run(plan, &mut callbacks, Metadata::new())
        .await
        .unwrap()
        .unwrap();
    resumer.await.unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Success);
    let seq: Vec<u64> = rec.events().iter().map(|e| e.seq_num).collect();
    assert_eq!(seq, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(rec.topics(), vec!["scan/pause", "scan/resume"]);
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn abort_during_a_move_stops_the_motor() {
    let (mx, sim) = motor("mx", MockMode::Realistic);
    let (cam, _camera) = SimCamera::create("cam1", SimCameraConfig::default());
    let image_mode = cam.signal("cam.image_mode").unwrap();
    let rec = Arc::new(Recorder::default());
    let engine = RunEngine::with_publisher(rec.clone());
    let handle = engine.handle();

    let aborter = {
        let sim = sim.clone();
        tokio::spawn(async move {
            while !sim.is_moving() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            handle.abort("operator").unwrap();
        })
    };

    let mut callbacks = vec![recording(rec.clone())];
    let plan = plans::scan(vec![cam.clone()], &mx, 5.0, 10.0, 2, Metadata::new());
    let stop = engine
        .run(plan, &mut callbacks, Metadata::new())
        .await
        .unwrap()
        .unwrap();
    aborter.await.unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Abort);
    assert!(sim.stop_count() >= 1);
    assert!(!mx.is_staged());
    assert!(!cam.is_staged());
    assert_eq!(image_mode.get(), Value::Int(0));
    assert!(rec.topics().contains(&"scan/abort".to_string()));
    assert!(rec.events().is_empty());
    assert_eq!(
        engine.handle().last_error().unwrap().kind,
        mamba_core::ErrorKind::Abort
    );
    assert!(logs_contain("run terminated"));
}

#[tokio::test]
async fn abort_while_paused() {
    let (mx, _) = motor("mx", MockMode::Instant);
    let det = sim_detector("det", SimDetectorConfig::default());
    let rec = Arc::new(Recorder::default());
    let engine = RunEngine::with_publisher(rec.clone());
    let handle = engine.handle();

    let pauser = {
        let handle = handle.clone();
        FnCallback::boxed("pauser", move |doc: &Document| {
            if matches!(doc, Document::Event(e) if e.seq_num == 1) {
                handle.request_pause()?;
            }
            Ok(())
        })
    };
    let aborter = {
        let mut state = handle.subscribe_state();
        tokio::spawn(async move {
            state
                .wait_for(|s| *s == EngineState::Paused)
                .await
                .unwrap();
            handle.abort("give up").unwrap();
        })
    };

    let mut callbacks = vec![recording(rec.clone()), pauser];
    let grid = plans::grid(
        vec![det],
        vec![Axis::new(&mx, 0.0, 1.0, 4)],
        false,
        Metadata::new(),
    );
    let stop = engine
        .run(grid, &mut callbacks, Metadata::new())
        .await
        .unwrap()
        .unwrap();
    aborter.await.unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Abort);
    assert!(stop.reason.contains("give up"));
    assert_eq!(rec.events().len(), 1);
    assert_eq!(rec.topics(), vec!["scan/pause", "scan/abort"]);
    assert!(!mx.is_staged());
}

#[tokio::test]
async fn image_step_scan_fills_frames() {
    let registry = DeviceRegistry::new();
    let (mx, _) = motor("mx", MockMode::Instant);
    let (cam, _camera) = SimCamera::create("cam1", SimCameraConfig::default());
    registry.register(mx).unwrap();
    registry.register(cam).unwrap();

    let rec = Arc::new(Recorder::default());
    let planner = Planner::new(RunEngine::with_publisher(rec.clone()), registry, rec.clone());
    let stop = planner
        .scan(&["cam1".to_string()], "mx", 0.0, 1.0, 3)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(stop.exit_status, ExitStatus::Success);
    let images: Vec<MonitorDoc> = rec
        .monitors
        .lock()
        .iter()
        .filter(|m| m.topic == "monitor/image")
        .cloned()
        .collect();
    assert_eq!(images.len(), 3);
    assert_eq!(images[2].data["frame"], Value::Int(3));
    assert_eq!(images[0].payload.as_ref().unwrap().len(), 16 * 16 * 2);
}

#[tokio::test]
async fn unknown_devices_are_rejected_before_running() {
    let rec = Arc::new(Recorder::default());
    let planner = Planner::new(
        RunEngine::with_publisher(rec.clone()),
        DeviceRegistry::new(),
        rec.clone(),
    );
    let err = planner.count(&["nope".to_string()], 1, 0.0).await.unwrap_err();
    assert_eq!(err.kind(), mamba_core::ErrorKind::Key);
    assert!(rec.docs.lock().is_empty());
}
