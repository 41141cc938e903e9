//! Error taxonomy for cell execution.

use crate::channel::ChannelError;

/// Why a cell run did not complete normally.
///
/// These end up as the `last_error` of a cell; a runtime exception is a
/// normal result with status `error` and is never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("engine failed to initialize: {0}")]
    Initialization(String),

    #[error("engine is not ready")]
    EngineNotReady,

    #[error("{0}")]
    RuntimeExecution(String),

    #[error("execution interrupted")]
    Interrupted,

    #[error("execution channel failed: {0}")]
    ChannelFailure(String),
}

impl From<ChannelError> for CellError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::EngineNotReady => CellError::EngineNotReady,
            other => CellError::ChannelFailure(other.to_string()),
        }
    }
}

/// Errors from talking to a cell controller.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("cell controller has shut down")]
    Stopped,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ControllerError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ControllerError::Stopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ControllerError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ControllerError::Stopped
    }
}
