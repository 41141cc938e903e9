//! Engine loop shared by both backends.
//!
//! [`serve`] drives one [`ExecutionEngine`] from a command queue and reports
//! events back. The thread backend runs it on a dedicated thread; the
//! process backend runs it inside `cellrun worker`, bridged to stdio frames
//! by [`run_stdio_worker`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cellrun_protocol::{recv_json_frame, send_json_frame, WorkerCommand, WorkerEvent};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::engine::ExecutionEngine;
use crate::error::CellError;

/// Interpreter recursion is bounded by the parser, but deep expressions
/// still want more than the default 2 MiB.
const ENGINE_STACK_SIZE: usize = 16 * 1024 * 1024;

/// How long a closing worker waits for queued events to reach stdout.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run commands until the command queue closes, the event receiver goes
/// away, or `teardown` is set.
pub fn serve(
    commands: std_mpsc::Receiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    teardown: Arc<AtomicBool>,
) {
    let mut engine = ExecutionEngine::new(teardown.clone());

    while let Ok(command) = commands.recv() {
        if teardown.load(Ordering::SeqCst) {
            break;
        }

        let delivered = match command {
            WorkerCommand::Init { startup_code } => {
                let event = match engine.initialize(startup_code.as_deref()) {
                    Ok(()) => WorkerEvent::InitComplete,
                    Err(e) => {
                        warn!("[worker] initialization failed: {}", e);
                        let message = match e {
                            CellError::Initialization(cause) => cause,
                            other => other.to_string(),
                        };
                        WorkerEvent::Error { message, id: None }
                    }
                };
                events.send(event).is_ok()
            }
            WorkerCommand::Execute { id, source_text } => {
                debug!("[worker] executing request {}", id);
                let outcome = engine.execute(id.clone(), &source_text, &mut |chunk| {
                    let _ = events.send(chunk.into());
                });
                let event: WorkerEvent = match outcome {
                    Ok(result) => result.into(),
                    Err(e) => WorkerEvent::Error {
                        message: e.to_string(),
                        id: Some(id),
                    },
                };
                events.send(event).is_ok()
            }
            WorkerCommand::SetInterruptBuffer { buffer } => {
                engine.set_interrupt_buffer(buffer);
                true
            }
        };

        if !delivered {
            debug!("[worker] event receiver dropped");
            break;
        }
    }

    info!("[worker] engine loop exiting");
}

/// Start [`serve`] on a named thread sized for the interpreter.
pub fn spawn_engine_thread(
    name: String,
    commands: std_mpsc::Receiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    teardown: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(name)
        .stack_size(ENGINE_STACK_SIZE)
        .spawn(move || serve(commands, events, teardown))
}

/// Body of `cellrun worker`: an engine fed by frames on stdin, answering
/// with frames on stdout.
pub async fn run_stdio_worker() -> anyhow::Result<()> {
    let (command_tx, command_rx) = std_mpsc::channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let teardown = Arc::new(AtomicBool::new(false));

    let reader_events = event_tx.clone();
    // Detached: a native call can hold the engine thread past our exit.
    spawn_engine_thread(
        "cellrun-engine".to_string(),
        command_rx,
        event_tx,
        teardown.clone(),
    )?;

    let mut writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = event_rx.recv().await {
            if let Err(e) = send_json_frame(&mut stdout, &event).await {
                error!("[worker] failed to write event frame: {}", e);
                // Best effort: tell the controller why before going away
                let notice = WorkerEvent::Error {
                    message: format!("worker could not report an event: {}", e),
                    id: None,
                };
                let _ = send_json_frame(&mut stdout, &notice).await;
                return false;
            }
        }
        true
    });

    let mut stdin = tokio::io::stdin();
    let mut writer_outcome = None;
    loop {
        tokio::select! {
            frame = recv_json_frame::<_, WorkerCommand>(&mut stdin) => match frame {
                Ok(Some(command)) => {
                    if command_tx.send(command).is_err() {
                        warn!("[worker] engine thread is gone");
                        break;
                    }
                }
                Ok(None) => {
                    info!("[worker] stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!("[worker] malformed command frame: {}", e);
                    let _ = reader_events.send(WorkerEvent::Error {
                        message: format!("malformed command frame: {}", e),
                        id: None,
                    });
                    break;
                }
            },
            // The writer only ends early when stdout is unusable
            outcome = &mut writer => {
                writer_outcome = Some(outcome);
                break;
            }
        }
    }

    teardown.store(true, Ordering::SeqCst);
    drop(command_tx);
    drop(reader_events);
    let outcome = match writer_outcome {
        Some(outcome) => outcome,
        None => match tokio::time::timeout(DRAIN_TIMEOUT, writer).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!("[worker] engine still busy at exit");
                return Ok(());
            }
        },
    };
    if !outcome? {
        anyhow::bail!("event stream to the controller failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrun_protocol::{ExecutionStatus, InterruptBuffer, RequestId};

    fn start() -> (
        std_mpsc::Sender<WorkerCommand>,
        mpsc::UnboundedReceiver<WorkerEvent>,
        Arc<AtomicBool>,
    ) {
        let (command_tx, command_rx) = std_mpsc::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let teardown = Arc::new(AtomicBool::new(false));
        spawn_engine_thread("test-engine".into(), command_rx, event_tx, teardown.clone()).unwrap();
        (command_tx, event_rx, teardown)
    }

    #[tokio::test]
    async fn test_init_then_execute() {
        let (commands, mut events, _) = start();
        commands
            .send(WorkerCommand::Init { startup_code: None })
            .unwrap();
        assert_eq!(events.recv().await, Some(WorkerEvent::InitComplete));

        commands
            .send(WorkerCommand::Execute {
                id: RequestId::from("r1"),
                source_text: "print('hi')".into(),
            })
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(WorkerEvent::Output {
                stream: cellrun_protocol::Stream::Stdout,
                text: "hi\n".into()
            })
        );
        let Some(WorkerEvent::Result { result }) = events.recv().await else {
            panic!("expected a result");
        };
        assert_eq!(result.id, RequestId::from("r1"));
        assert_eq!(result.status, ExecutionStatus::Ok);
    }

    #[tokio::test]
    async fn test_execute_before_init_is_rejected_with_id() {
        let (commands, mut events, _) = start();
        commands
            .send(WorkerCommand::Execute {
                id: RequestId::from("early"),
                source_text: "print(1)".into(),
            })
            .unwrap();
        let Some(WorkerEvent::Error { id, .. }) = events.recv().await else {
            panic!("expected an error");
        };
        assert_eq!(id, Some(RequestId::from("early")));
    }

    #[tokio::test]
    async fn test_failed_startup_poisons() {
        let (commands, mut events, _) = start();
        commands
            .send(WorkerCommand::Init {
                startup_code: Some("raise RuntimeError('boom')".into()),
            })
            .unwrap();
        let Some(WorkerEvent::Error { id, message }) = events.recv().await else {
            panic!("expected an error");
        };
        assert!(id.is_none());
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn test_interrupt_buffer_stops_loop() {
        let (commands, mut events, _) = start();
        let buffer = InterruptBuffer::new();
        commands
            .send(WorkerCommand::Init { startup_code: None })
            .unwrap();
        assert_eq!(events.recv().await, Some(WorkerEvent::InitComplete));
        commands
            .send(WorkerCommand::SetInterruptBuffer {
                buffer: buffer.clone(),
            })
            .unwrap();
        commands
            .send(WorkerCommand::Execute {
                id: RequestId::new(),
                source_text: "print('A'); loop_forever()".into(),
            })
            .unwrap();

        assert!(matches!(
            events.recv().await,
            Some(WorkerEvent::Output { .. })
        ));
        buffer.trigger();
        let Some(WorkerEvent::Result { result }) = events.recv().await else {
            panic!("expected a result");
        };
        assert_eq!(result.status, ExecutionStatus::Interrupted);
        assert_eq!(result.stdout, "A\n");
    }

    #[tokio::test]
    async fn test_teardown_ends_loop() {
        let (commands, mut events, teardown) = start();
        commands
            .send(WorkerCommand::Init { startup_code: None })
            .unwrap();
        assert_eq!(events.recv().await, Some(WorkerEvent::InitComplete));
        commands
            .send(WorkerCommand::Execute {
                id: RequestId::new(),
                source_text: "loop_forever()".into(),
            })
            .unwrap();
        teardown.store(true, Ordering::SeqCst);
        drop(commands);

        // the interrupted result may or may not make it out; then the channel closes
        while let Some(event) = events.recv().await {
            assert!(matches!(event, WorkerEvent::Result { .. }));
        }
    }
}
