//! Data router fan-out, run annotations, monitor throttling and release.

use mamba_core::{
    DeviceRegistry, Document, EventDoc, LocalCallbacks, MambaError, MambaResult, MonitorDoc,
    StartDoc, StopDoc, Value,
};
use mamba_driver_mock::{MockMode, SimMotor, SimMotorConfig};
use mamba_server::{DataRouter, Notification, POSITION_TOPIC, SCAN_LENGTH, SCAN_STEP};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing_test::traced_test;

fn drain(rx: &mut UnboundedReceiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

fn run_docs(num_points: u64, events: u64) -> Vec<Document> {
    let mut start = StartDoc::new(7, "scan");
    start.num_points = Some(num_points);
    let uid = start.uid.clone();
    let mut docs = vec![Document::Start(start)];
    for seq in 1..=events {
        let mut event = EventDoc::new(&uid, "desc-1", seq);
        event.data.insert("det".into(), Value::Float(seq as f64));
        docs.push(Document::Event(event));
    }
    docs.push(Document::Stop(StopDoc::success(&uid)));
    docs
}

#[derive(Default)]
struct Counting {
    starts: Mutex<usize>,
    events: Mutex<Vec<EventDoc>>,
    stops: Mutex<usize>,
}

impl LocalCallbacks for Counting {
    fn scan_start(&self, _doc: &StartDoc) -> MambaResult<()> {
        *self.starts.lock() += 1;
        Ok(())
    }

    fn data_update(&self, doc: &EventDoc) -> MambaResult<()> {
        self.events.lock().push(doc.clone());
        Ok(())
    }

    fn scan_end(&self, _doc: &StopDoc) -> MambaResult<()> {
        *self.stops.lock() += 1;
        Err(MambaError::Hardware("sink is grumpy".into()))
    }
}

#[test]
fn remote_events_carry_scan_length_and_step() {
    let router = DataRouter::new(HashMap::new(), None);
    let mut rx = router.attach("gui");
    router
        .subscribe("gui", &["doc/event".to_string(), "scan".to_string()])
        .unwrap();

    for doc in run_docs(3, 3) {
        router.push(&doc);
    }

    let notes = drain(&mut rx);
    let topics: Vec<&str> = notes.iter().map(|n| n.topic.as_str()).collect();
    assert_eq!(
        topics,
        vec!["scan/start", "doc/event", "doc/event", "doc/event", "scan/stop"]
    );
    let steps: Vec<(Value, Value)> = notes
        .iter()
        .filter(|n| n.topic == "doc/event")
        .map(|n| match n.decode_document().unwrap() {
            Document::Event(e) => (e.data[SCAN_LENGTH].clone(), e.data[SCAN_STEP].clone()),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            (Value::Int(3), Value::Int(1)),
            (Value::Int(3), Value::Int(2)),
            (Value::Int(3), Value::Int(3)),
        ]
    );
    let stop = notes.last().unwrap();
    assert_eq!(stop.body["exit_status"], "success");
    assert!(router.scan_step().is_none());
}

#[test]
#[traced_test]
fn local_sinks_see_unannotated_events_and_failures_are_contained() {
    let router = DataRouter::new(HashMap::new(), None);
    let sink = Arc::new(Counting::default());
    router.register_local("counter", sink.clone()).unwrap();
    assert!(matches!(
        router.register_local("counter", sink.clone()),
        Err(MambaError::Dup(_))
    ));

    for doc in run_docs(2, 2) {
        router.push(&doc);
    }

    assert_eq!(*sink.starts.lock(), 1);
    assert_eq!(*sink.stops.lock(), 1);
    let events = sink.events.lock();
    assert_eq!(events.len(), 2);
    assert!(!events[0].data.contains_key(SCAN_STEP));
    assert!(logs_contain("local sink failed"));
    assert!(router.unregister_local("counter"));
}

#[test]
fn wildcard_subscribers_skip_reserved_topics() {
    let router = DataRouter::new(HashMap::new(), None);
    let mut all = router.attach("all");
    router.subscribe_all("all").unwrap();
    let mut reserved = router.attach("reserved");
    router.subscribe("reserved", &["__debug".to_string()]).unwrap();

    router.publish(Notification::new("__debug").with("x", 1));
    router.publish(Notification::new("scan/progress").with("fraction", 0.5));

    let topics: Vec<String> = drain(&mut all).into_iter().map(|n| n.topic).collect();
    assert_eq!(topics, vec!["scan/progress"]);
    let topics: Vec<String> = drain(&mut reserved).into_iter().map(|n| n.topic).collect();
    assert_eq!(topics, vec!["__debug"]);
}

#[tokio::test(start_paused = true)]
async fn position_monitors_coalesce_within_a_period() {
    let periods = HashMap::from([(POSITION_TOPIC.to_string(), Duration::from_millis(100))]);
    let router = DataRouter::new(periods, None);
    let mut rx = router.attach("gui");
    router.subscribe("gui", &["monitor".to_string()]).unwrap();

    let opened = Instant::now();
    router.push_monitor(MonitorDoc::new(POSITION_TOPIC).with_value("mx", 1.0));
    tokio::time::advance(Duration::from_millis(10)).await;
    router.push_monitor(MonitorDoc::new(POSITION_TOPIC).with_value("mx", 2.0));
    router.push_monitor(MonitorDoc::new("monitor/other").with_value("t", 5.0));
    let early = drain(&mut rx);
    assert_eq!(early.len(), 1);
    assert_eq!(early[0].topic, "monitor/other");

    let note = rx.recv().await.unwrap();
    assert!(Instant::now() - opened >= Duration::from_millis(100));
    assert_eq!(note.topic, POSITION_TOPIC);
    assert_eq!(note.body["mx"], 2.0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn run_motors_are_monitored_until_stop() {
    let registry = DeviceRegistry::new();
    let (mx, sim) = SimMotor::create(
        "mx",
        SimMotorConfig {
            mode: MockMode::Instant,
            ..Default::default()
        },
    );
    registry.register(mx.clone()).unwrap();
    let readback = mx.signal("user_readback").unwrap();
    let baseline = readback.subscriber_count();

    let router = DataRouter::new(HashMap::new(), Some(registry));
    let mut rx = router.attach("gui");
    router.subscribe("gui", &[POSITION_TOPIC.to_string()]).unwrap();

    let mut start = StartDoc::new(1, "scan");
    start.md.insert("motors".into(), serde_json::json!(["mx"]));
    let uid = start.uid.clone();
    router.push(&Document::Start(start));
    assert_eq!(router.monitor_bindings(), vec![("mx".to_string(), POSITION_TOPIC.to_string())]);
    assert_eq!(readback.subscriber_count(), baseline + 1);

    readback.update(0.25);
    let note = rx.recv().await.unwrap();
    assert_eq!(note.body["mx"], 0.25);

    router.push(&Document::Stop(StopDoc::success(&uid)));
    assert!(router.monitor_bindings().is_empty());
    assert_eq!(readback.subscriber_count(), baseline);
    drop(sim);
}
