//! Integration tests for the process backend and the CLI.
//!
//! These tests spawn the real `cellrun` binary, both as a worker process
//! behind a cell controller and as a command-line tool.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cellrun::{
    CancelAck, CellController, CellStatus, EngineBackend, LineStream, ProcessEngineFactory,
    RunAck, RunnerSettings,
};
use tempfile::TempDir;
use tokio::time::timeout;

const BIN: &str = env!("CARGO_BIN_EXE_cellrun");

fn process_settings() -> RunnerSettings {
    RunnerSettings {
        backend: EngineBackend::Process,
        worker_program: Some(BIN.into()),
        ..Default::default()
    }
}

fn process_cell(id: &str, text: &str) -> CellController {
    let factory = Arc::new(ProcessEngineFactory::new(BIN.into()));
    CellController::spawn(id, text, factory, process_settings())
}

async fn run_to_end(cell: &CellController) -> cellrun::CellExecutionState {
    assert!(matches!(cell.run().await.unwrap(), RunAck::Started { .. }));
    timeout(Duration::from_secs(20), cell.wait_until_settled())
        .await
        .expect("cell did not settle")
        .unwrap()
}

#[tokio::test]
async fn test_process_backend_hello() {
    let cell = process_cell("hello", "print('hello')");
    assert!(!cell.immediate_cancellation_available());
    assert!(cell.cancellation_caveat().is_some());

    let state = run_to_end(&cell).await;
    assert_eq!(state.status, CellStatus::Complete);
    assert_eq!(state.text_of(LineStream::Stdout), "hello\n");
    cell.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_process_backend_runtime_error() {
    let cell = process_cell("error", "print('before')\n1/0\nprint('after')");
    let state = run_to_end(&cell).await;
    assert_eq!(state.status, CellStatus::Failed);
    assert_eq!(state.text_of(LineStream::Stdout), "before\n");
    assert!(state.text_of(LineStream::Stderr).contains("ZeroDivisionError"));
    assert!(state
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("ZeroDivisionError")));
    cell.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_process_backend_keeps_globals_between_runs() {
    let cell = process_cell("globals", "x = 20");
    assert_eq!(run_to_end(&cell).await.status, CellStatus::Complete);

    cell.set_text("print(x + 1)");
    let state = run_to_end(&cell).await;
    assert_eq!(state.status, CellStatus::Complete);
    assert_eq!(state.text_of(LineStream::Stdout), "21\n");
    cell.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_process_backend_hard_cancel_of_native_spin() {
    let cell = process_cell("spin", "x = 1\nprint('spinning')\nspin(60)");
    assert!(matches!(cell.run().await.unwrap(), RunAck::Started { .. }));

    // wait until the worker is inside the native call
    let mut rx = cell.subscribe();
    timeout(
        Duration::from_secs(20),
        rx.wait_for(|s| s.text_of(LineStream::Stdout).contains("spinning")),
    )
    .await
    .expect("no output from worker")
    .unwrap();

    let started = Instant::now();
    assert_eq!(cell.cancel().await.unwrap(), CancelAck::Hard);
    let state = timeout(Duration::from_secs(5), cell.wait_until_settled())
        .await
        .expect("hard cancel did not settle")
        .unwrap();
    assert_eq!(state.status, CellStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));

    // the restarted engine starts from empty globals
    cell.set_text("print(x)");
    let state = run_to_end(&cell).await;
    assert_eq!(state.status, CellStatus::Failed);
    assert!(state.text_of(LineStream::Stderr).contains("NameError"));
    cell.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_process_backend_output_larger_than_a_frame() {
    // 70 MB of output in total, past the 64 MiB frame limit
    let cell = process_cell("flood", "for i in range(7): print('x' * 10000000)");
    assert!(matches!(cell.run().await.unwrap(), RunAck::Started { .. }));
    let state = timeout(Duration::from_secs(120), cell.wait_until_settled())
        .await
        .expect("cell stayed running")
        .unwrap();
    assert_eq!(state.status, CellStatus::Complete);
    let stdout = state.text_of(LineStream::Stdout);
    assert_eq!(stdout.len(), 7 * 10_000_001);
    assert!(stdout.bytes().all(|b| b == b'x' || b == b'\n'));

    // the worker is still usable afterwards
    cell.set_text("print('after')");
    let state = run_to_end(&cell).await;
    assert_eq!(state.text_of(LineStream::Stdout), "after\n");
    cell.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_process_backend_cancel_when_idle() {
    let cell = process_cell("idle", "print(1)");
    assert_eq!(cell.cancel().await.unwrap(), CancelAck::NotRunning);
    cell.shutdown().await.unwrap();
}

#[test]
fn test_cli_runs_script() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("script.py");
    std::fs::write(
        &script,
        "print('first')\n# %%\nfor i in range(3):\n    print(i)\n",
    )
    .unwrap();

    let output = Command::new(BIN)
        .arg("run")
        .arg(&script)
        .arg("--settings")
        .arg(dir.path().join("missing.json"))
        .arg("--log-level")
        .arg("warn")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "first\n0\n1\n2\n");
}

#[test]
fn test_cli_failing_script_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let script = dir.path().join("bad.py");
    std::fs::write(&script, "print('ok')\n# %%\nundefined_name\n# %%\nprint('never')\n").unwrap();

    let output = Command::new(BIN)
        .args(["run", "--backend", "process", "--log-level", "warn"])
        .arg(&script)
        .arg("--settings")
        .arg(dir.path().join("missing.json"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "ok\n");
    assert!(String::from_utf8_lossy(&output.stderr).contains("NameError"));
}

#[test]
fn test_cli_settings_schema() {
    let output = Command::new(BIN)
        .args(["settings", "--schema"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let schema: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(schema["properties"]["backend"].is_object());
    assert!(schema["properties"]["shared_interrupt"].is_object());
}
