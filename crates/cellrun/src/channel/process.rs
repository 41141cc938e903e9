//! Process backend: each engine is a `cellrun worker` child process that
//! speaks length-prefixed JSON frames over its stdin and stdout.

use std::path::PathBuf;
use std::process::Stdio;

use cellrun_protocol::{recv_json_frame, send_json_frame, WorkerCommand, WorkerEvent};
use log::{debug, error, info, warn};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ChannelError, EngineFactory, ExecutionChannel, WorkerTransport};
use crate::settings::EngineBackend;

pub struct ProcessEngineFactory {
    program: PathBuf,
}

impl ProcessEngineFactory {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn spawn(&self, label: &str) -> Result<ExecutionChannel, ChannelError> {
        let mut child = Command::new(&self.program)
            .arg("worker")
            .arg("--log-level")
            .arg(log::max_level().to_string().to_lowercase())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            "[channel] started worker process {:?} for {}",
            child.id(),
            label
        );

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("worker stdin was not captured"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("worker stdout was not captured"))?;

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<WorkerCommand>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let writer_label = label.to_string();
        // Weak, so the event channel still closes when the reader stops
        let writer_events = event_tx.downgrade();
        let writer = tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                if let Err(e) = send_json_frame(&mut stdin, &command).await {
                    warn!("[channel] {} failed to send command: {}", writer_label, e);
                    // The worker never sees the command, so nothing else
                    // would settle whoever is waiting on it.
                    if let Some(events) = writer_events.upgrade() {
                        let _ = events.send(WorkerEvent::Error {
                            message: format!("failed to send command to worker: {}", e),
                            id: None,
                        });
                    }
                    break;
                }
            }
        });

        let reader_label = label.to_string();
        let reader = tokio::spawn(async move {
            loop {
                match recv_json_frame::<_, WorkerEvent>(&mut stdout).await {
                    Ok(Some(event)) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("[channel] {} worker closed stdout", reader_label);
                        break;
                    }
                    Err(e) => {
                        error!("[channel] {} malformed frame: {}", reader_label, e);
                        let _ = event_tx.send(WorkerEvent::Error {
                            message: format!("malformed frame from worker: {}", e),
                            id: None,
                        });
                        break;
                    }
                }
            }
        });

        let transport = ProcessTransport {
            child,
            commands: Some(command_tx),
            writer: Some(writer),
            reader: Some(reader),
        };
        Ok(ExecutionChannel::new(
            label.to_string(),
            Box::new(transport),
            event_rx,
            false,
        ))
    }

    fn supports_shared_interrupt(&self) -> bool {
        false
    }

    fn backend(&self) -> EngineBackend {
        EngineBackend::Process
    }
}

struct ProcessTransport {
    child: Child,
    commands: Option<mpsc::UnboundedSender<WorkerCommand>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerTransport for ProcessTransport {
    fn send(&mut self, command: WorkerCommand) -> Result<(), ChannelError> {
        if matches!(command, WorkerCommand::SetInterruptBuffer { .. }) {
            return Err(ChannelError::Unsupported("shared interrupt buffer"));
        }
        let commands = self.commands.as_ref().ok_or(ChannelError::Closed)?;
        commands.send(command).map_err(|_| ChannelError::Closed)
    }

    fn terminate(&mut self) {
        self.commands = None;
        if let Err(e) = self.child.start_kill() {
            debug!("[channel] worker already exited: {}", e);
        }
        if let Some(task) = self.writer.take() {
            task.abort();
        }
        if let Some(task) = self.reader.take() {
            task.abort();
        }
    }
}
