//! Cancellation coordinator.
//!
//! Decides, per cancel request, between a soft interrupt (write SIGINT into
//! the shared buffer and let the engine raise `KeyboardInterrupt` at its next
//! checkpoint) and a hard restart (terminate the channel and discard the
//! engine, losing its globals).

use cellrun_protocol::InterruptBuffer;
use log::{debug, warn};
use serde::Serialize;

use crate::channel::{EngineFactory, ExecutionChannel};
use crate::settings::RunnerSettings;

/// How a cancel request is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelStrategy {
    /// Interrupt signalled; the engine will report an interrupted result.
    Soft,
    /// Engine must be torn down by the caller.
    Hard,
}

const HARD_CANCEL_CAVEAT: &str =
    "Stopping a cell restarts its engine; variables defined in that cell's session are lost.";

pub struct CancellationCoordinator {
    available: bool,
    buffer: Option<InterruptBuffer>,
}

impl CancellationCoordinator {
    /// Soft cancellation is available only when the backend shares memory
    /// with the controller and the setting allows it.
    pub fn new(backend_supports_shared_interrupt: bool, shared_interrupt_enabled: bool) -> Self {
        Self {
            available: backend_supports_shared_interrupt && shared_interrupt_enabled,
            buffer: None,
        }
    }

    pub fn for_backend(factory: &dyn EngineFactory, settings: &RunnerSettings) -> Self {
        Self::new(factory.supports_shared_interrupt(), settings.shared_interrupt)
    }

    pub fn immediate_cancellation_available(&self) -> bool {
        self.available
    }

    /// Text the UI can show next to a stop button when cancelling is lossy.
    pub fn cancellation_caveat(&self) -> Option<&'static str> {
        if self.available {
            None
        } else {
            Some(HARD_CANCEL_CAVEAT)
        }
    }

    /// Register a fresh buffer with an engine that just reported ready.
    pub fn on_engine_ready(&mut self, channel: &mut ExecutionChannel) {
        self.buffer = None;
        if !self.available {
            return;
        }
        let buffer = InterruptBuffer::new();
        match channel.set_interrupt_buffer(buffer.clone()) {
            Ok(()) => {
                debug!("[cancel] interrupt buffer registered");
                self.buffer = Some(buffer);
            }
            Err(e) => warn!("[cancel] could not register interrupt buffer: {}", e),
        }
    }

    /// Forget the buffer of an engine that was torn down.
    pub fn on_engine_discarded(&mut self) {
        self.buffer = None;
    }

    /// Drop any interrupt left over from a previous run.
    pub fn prepare_run(&self) {
        if let Some(buffer) = &self.buffer {
            buffer.clear();
        }
    }

    /// Signal a soft interrupt if possible; otherwise ask for a hard cancel.
    pub fn cancel(&self) -> CancelStrategy {
        match &self.buffer {
            Some(buffer) => {
                buffer.trigger();
                CancelStrategy::Soft
            }
            None => CancelStrategy::Hard,
        }
    }
}
