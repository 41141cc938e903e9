//! Thread backend: each engine runs on its own OS thread in this process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

use cellrun_protocol::WorkerCommand;
use log::info;
use tokio::sync::mpsc;

use super::{ChannelError, EngineFactory, ExecutionChannel, WorkerTransport};
use crate::settings::EngineBackend;
use crate::worker::spawn_engine_thread;

pub struct ThreadEngineFactory;

impl EngineFactory for ThreadEngineFactory {
    fn spawn(&self, label: &str) -> Result<ExecutionChannel, ChannelError> {
        let (command_tx, command_rx) = std_mpsc::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let teardown = Arc::new(AtomicBool::new(false));

        spawn_engine_thread(
            format!("cellrun-engine-{}", label),
            command_rx,
            event_tx,
            teardown.clone(),
        )?;
        info!("[channel] started engine thread for {}", label);

        let transport = ThreadTransport {
            commands: Some(command_tx),
            teardown,
        };
        Ok(ExecutionChannel::new(
            label.to_string(),
            Box::new(transport),
            event_rx,
            true,
        ))
    }

    fn supports_shared_interrupt(&self) -> bool {
        true
    }

    fn backend(&self) -> EngineBackend {
        EngineBackend::Thread
    }
}

struct ThreadTransport {
    commands: Option<std_mpsc::Sender<WorkerCommand>>,
    teardown: Arc<AtomicBool>,
}

impl WorkerTransport for ThreadTransport {
    fn send(&mut self, command: WorkerCommand) -> Result<(), ChannelError> {
        let commands = self.commands.as_ref().ok_or(ChannelError::Closed)?;
        commands.send(command).map_err(|_| ChannelError::Closed)
    }

    /// The thread is detached, not joined: it notices the flag at its next
    /// checkpoint. A native call keeps it alive until the call returns.
    fn terminate(&mut self) {
        self.teardown.store(true, Ordering::SeqCst);
        self.commands = None;
    }
}
