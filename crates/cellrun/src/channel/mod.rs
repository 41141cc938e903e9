//! Execution channel: the message boundary between a cell controller and
//! its engine.
//!
//! A channel is created by an [`EngineFactory`], initialized once, and then
//! carries at most one `execute` at a time. It tracks its own lifecycle so
//! that callers can tell a channel that is still booting from one that has
//! failed and must be replaced.

mod process;
mod thread;

use std::sync::Arc;

use cellrun_protocol::{ExecutionRequest, FrameError, InterruptBuffer, WorkerCommand, WorkerEvent};
use log::{debug, warn};
use tokio::sync::mpsc;

pub use process::ProcessEngineFactory;
pub use thread::ThreadEngineFactory;

use crate::settings::{EngineBackend, RunnerSettings};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("engine is not ready")]
    EngineNotReady,

    #[error("channel is poisoned")]
    Poisoned,

    #[error("channel is closed")]
    Closed,

    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),

    #[error("failed to start engine: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Spawned, `init` not yet sent
    Created,
    /// `init` sent, waiting for `init-complete`
    Initializing,
    /// Accepting `execute`
    Ready,
    /// Received an error without a request id; must be discarded
    Poisoned,
    /// Torn down by the controller
    Terminated,
}

/// The sending half of a channel, implemented per backend.
pub(crate) trait WorkerTransport: Send {
    fn send(&mut self, command: WorkerCommand) -> Result<(), ChannelError>;

    fn terminate(&mut self);
}

pub struct ExecutionChannel {
    label: String,
    transport: Box<dyn WorkerTransport>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    state: ChannelState,
    shared_interrupt: bool,
}

impl ExecutionChannel {
    pub(crate) fn new(
        label: String,
        transport: Box<dyn WorkerTransport>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        shared_interrupt: bool,
    ) -> Self {
        Self {
            label,
            transport,
            events,
            state: ChannelState::Created,
            shared_interrupt,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready
    }

    /// Whether this channel can be reused for another run.
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state,
            ChannelState::Created | ChannelState::Initializing | ChannelState::Ready
        )
    }

    pub fn init(&mut self, startup_code: Option<String>) -> Result<(), ChannelError> {
        if self.state != ChannelState::Created {
            return Err(self.unavailable());
        }
        self.transport.send(WorkerCommand::Init { startup_code })?;
        self.state = ChannelState::Initializing;
        debug!("[channel] {} initializing", self.label);
        Ok(())
    }

    /// Rejected locally with [`ChannelError::EngineNotReady`] until
    /// `init-complete` has been received.
    pub fn execute(&mut self, request: ExecutionRequest) -> Result<(), ChannelError> {
        if self.state != ChannelState::Ready {
            return Err(self.unavailable());
        }
        self.transport.send(request.into())
    }

    pub fn set_interrupt_buffer(&mut self, buffer: InterruptBuffer) -> Result<(), ChannelError> {
        if !self.shared_interrupt {
            return Err(ChannelError::Unsupported("shared interrupt buffer"));
        }
        if self.state != ChannelState::Ready {
            return Err(self.unavailable());
        }
        self.transport
            .send(WorkerCommand::SetInterruptBuffer { buffer })
    }

    /// Next event from the engine, updating the channel state as a side
    /// effect. `None` once the engine side is gone. Cancel safe.
    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        let event = self.events.recv().await;
        match &event {
            Some(WorkerEvent::InitComplete) if self.state == ChannelState::Initializing => {
                self.state = ChannelState::Ready;
                debug!("[channel] {} ready", self.label);
            }
            Some(WorkerEvent::Error { id: None, message }) => {
                warn!("[channel] {} poisoned: {}", self.label, message);
                self.state = ChannelState::Poisoned;
            }
            None if self.state != ChannelState::Terminated => {
                warn!("[channel] {} closed by engine", self.label);
                self.state = ChannelState::Poisoned;
            }
            _ => {}
        }
        event
    }

    /// Tear the engine down. Idempotent.
    pub fn terminate(&mut self) {
        if self.state == ChannelState::Terminated {
            return;
        }
        self.transport.terminate();
        self.events.close();
        self.state = ChannelState::Terminated;
        debug!("[channel] {} terminated", self.label);
    }

    fn unavailable(&self) -> ChannelError {
        match self.state {
            ChannelState::Poisoned => ChannelError::Poisoned,
            ChannelState::Terminated => ChannelError::Closed,
            _ => ChannelError::EngineNotReady,
        }
    }
}

impl Drop for ExecutionChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Creates isolated engines for cells.
pub trait EngineFactory: Send + Sync {
    fn spawn(&self, label: &str) -> Result<ExecutionChannel, ChannelError>;

    /// Whether spawned engines share memory with the controller, so that a
    /// shared interrupt buffer can reach them.
    fn supports_shared_interrupt(&self) -> bool;

    fn backend(&self) -> EngineBackend;
}

/// Build the factory the settings ask for.
pub fn factory_for(settings: &RunnerSettings) -> Result<Arc<dyn EngineFactory>, ChannelError> {
    Ok(match settings.backend {
        EngineBackend::Thread => Arc::new(ThreadEngineFactory),
        EngineBackend::Process => {
            let program = match &settings.worker_program {
                Some(path) => path.clone(),
                None => std::env::current_exe()?,
            };
            Arc::new(ProcessEngineFactory::new(program))
        }
    })
}

/// One live engine session owned by a controller.
pub struct EngineHandle {
    /// Increments each time a controller replaces its engine; used in logs.
    pub generation: u64,
    pub channel: ExecutionChannel,
}
