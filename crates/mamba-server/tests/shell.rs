//! Shell bindings against simulated hardware.

use mamba_core::{DeviceRegistry, MambaError};
use mamba_driver_mock::{sim_detector, MockMode, SimDetectorConfig, SimMotor, SimMotorConfig};
use mamba_experiment::PlanStore;
use mamba_server::{ControlService, DataRouter, Request, Session, ShellHandle, SystemContext};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;

fn shell(plans: &Path, init: Option<PathBuf>) -> (Arc<SystemContext>, ShellHandle) {
    let registry = DeviceRegistry::new();
    for name in ["mx", "my"] {
        let (motor, _) = SimMotor::create(
            name,
            SimMotorConfig {
                mode: MockMode::Instant,
                ..Default::default()
            },
        );
        registry.register(motor).unwrap();
    }
    registry
        .register(sim_detector("det", SimDetectorConfig::default()))
        .unwrap();
    let router = DataRouter::new(HashMap::new(), Some(registry.clone()));
    let ctx = Arc::new(SystemContext::new(registry, router, PlanStore::new(plans)));
    let shell = ShellHandle::spawn(ctx.clone(), Handle::current(), init).unwrap();
    (ctx, shell)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cells_keep_their_scope() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, shell) = shell(dir.path(), None);
    assert_eq!(shell.submit("let x = 40;").await.unwrap(), json!(null));
    assert_eq!(shell.submit("x + 2").await.unwrap(), json!(42));
    assert_eq!(shell.last_result(), Some(json!(42)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn move_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, shell) = shell(dir.path(), None);
    let value = shell.submit(r#"mv("mx", 1.5); rd("mx")"#).await.unwrap();
    assert_eq!(value["mx"], json!(1.5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scans_return_a_summary() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, shell) = shell(dir.path(), None);
    let summary = shell
        .submit(r#"scan(["det"], "mx", 0, 1, 3)"#)
        .await
        .unwrap();
    assert_eq!(summary["exit_status"], "success");
    assert_eq!(summary["num_events"]["primary"], 3);

    let grid = shell
        .submit(
            r#"grid(["det"], [#{name: "my", start: 0, stop: 1, point_num: 2},
                              #{name: "mx", start: 0, stop: 1, point_num: 2}], true)"#,
        )
        .await
        .unwrap();
    assert_eq!(grid["num_events"]["primary"], 4);
    assert_eq!(ctx.engine().scan_id(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binding_errors_keep_their_kind() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, shell) = shell(dir.path(), None);
    let err = shell.submit(r#"rd("nope")"#).await.unwrap_err();
    assert!(matches!(err, MambaError::Key(_)), "{:?}", err);
    let err = shell.submit("let = ;").await.unwrap_err();
    assert!(matches!(err, MambaError::Syntax(_)), "{:?}", err);
    let err = shell.submit("teleport()").await.unwrap_err();
    assert!(matches!(err, MambaError::Syntax(_)), "{:?}", err);
    let err = shell.submit("pause()").await.unwrap_err();
    assert!(matches!(err, MambaError::Empty(_)), "{:?}", err);
    let err = shell.submit(r#"mv("mx", "far")"#).await.unwrap_err();
    assert!(matches!(err, MambaError::Syntax(_)), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn init_script_runs_first() {
    let dir = tempfile::tempdir().unwrap();
    let init = dir.path().join("init.rhai");
    std::fs::write(&init, "let base = 10; mv(\"my\", 0.5);").unwrap();
    let (ctx, shell) = shell(dir.path(), Some(init));
    assert_eq!(shell.submit("base * 3").await.unwrap(), json!(30));
    let my = ctx.registry.require("my").unwrap();
    assert_eq!(my.signal("user_readback").unwrap().get().as_f64(), Some(0.5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cmd_requests_go_through_the_shell() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, shell) = shell(dir.path(), None);
    let service = ControlService::new(ctx.clone(), Some(shell));
    let mut session = Session::new("t");

    let reply = service
        .handle(&Request::new("cmd").with("cmd", "6 * 7"), &mut session)
        .await;
    assert_eq!(reply.ret, Some(json!(42)));

    let mut rx = ctx.router.attach("gui");
    ctx.router.subscribe("gui", &["cmd".to_string()]).unwrap();
    let reply = service
        .handle(
            &Request::new("cmd")
                .with("cmd", r#"rd("nope")"#)
                .with("go", true)
                .with("tag", "t1"),
            &mut session,
        )
        .await;
    assert_eq!(reply.ret, Some(json!({"tag": "t1"})));
    let note = rx.recv().await.unwrap();
    assert_eq!(note.topic, "cmd/t1");
    assert_eq!(note.body["err"], "key");
}
