//! Stage/unstage round trips across nested devices.

use mamba_core::{DeviceBuilder, Kind, Status, StatusState, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn camera() -> mamba_core::Device {
    DeviceBuilder::new("cam1")
        .device("cam", |b| {
            b.signal("acquire_time", 1.0, Kind::Config)
                .signal("image_mode", 0, Kind::Config)
                .signal("num_images", 1, Kind::Config)
                .stage_sig("image_mode", 1)
                .stage_sig("num_images", 100)
        })
        .device("hdf", |b| {
            b.signal("capture", 0, Kind::Omitted)
                .signal("file_name", "", Kind::Config)
                .stage_sig("capture", 1)
        })
        .stage_sig("cam.acquire_time", 0.05)
        .build()
}

#[test]
fn post_run_values_equal_pre_stage_values() {
    let cam = camera();
    let paths = [
        "cam.acquire_time",
        "cam.image_mode",
        "cam.num_images",
        "hdf.capture",
        "hdf.file_name",
    ];
    let before: Vec<Value> = paths
        .iter()
        .map(|p| cam.signal(p).unwrap().get())
        .collect();

    for _ in 0..3 {
        assert!(cam.stage().unwrap());
        assert_eq!(cam.signal("hdf.capture").unwrap().get(), Value::Int(1));
        assert_eq!(cam.signal("cam.num_images").unwrap().get(), Value::Int(100));
        assert!(cam.unstage().unwrap());
    }

    let after: Vec<Value> = paths
        .iter()
        .map(|p| cam.signal(p).unwrap().get())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn restore_happens_in_reverse_order() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let dev = DeviceBuilder::new("d")
        .signal("a", 0, Kind::Config)
        .signal("b", 0, Kind::Config)
        .stage_sig("a", 1)
        .stage_sig("b", 2)
        .build();
    for name in ["a", "b"] {
        let log = log.clone();
        dev.signal(name)
            .unwrap()
            .subscribe(move |r| log.lock().push((name, r.value.clone())));
    }
    dev.stage().unwrap();
    dev.unstage().unwrap();
    assert_eq!(
        *log.lock(),
        vec![
            ("a", Value::Int(1)),
            ("b", Value::Int(2)),
            ("b", Value::Int(0)),
            ("a", Value::Int(0)),
        ]
    );
}

#[tokio::test]
async fn callbacks_fire_once_under_racing_producers() {
    let hits = Arc::new(AtomicU32::new(0));
    let status = Status::new();
    let h = hits.clone();
    status.add_callback(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });

    let mut tasks = Vec::new();
    for i in 0..8 {
        let st = status.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                st.set_finished();
            } else {
                st.set_exception(mamba_core::StatusError::hardware("racing"));
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(!matches!(status.state(), StatusState::Pending));
}
