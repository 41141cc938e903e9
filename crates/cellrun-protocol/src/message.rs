//! Execution Channel message types.

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::interrupt::InterruptBuffer;

/// Trailing notice attached to the stderr of an interrupted run.
pub const INTERRUPT_MARKER: &str = "Execution interrupted by user";

/// Opaque correlation token tying output and results to one `execute`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Output stream a chunk was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// An incremental slice of captured output, delivered before the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OutputChunk {
    pub stream: Stream,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: Stream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: Stream::Stderr,
            text: text.into(),
        }
    }
}

/// A unit of work submitted to an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub id: RequestId,
    pub source_text: String,
}

impl ExecutionRequest {
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            source_text: source_text.into(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum ExecutionStatus {
    Ok,
    Error,
    Interrupted,
}

/// Terminal message for a request. Carries the full text of both streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ExecutionResult {
    pub id: RequestId,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Messages sent from the controller side to an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerCommand {
    /// Boot the interpreter session, optionally running startup code.
    Init {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        startup_code: Option<String>,
    },

    /// Run source text in the session's global namespace.
    Execute { id: RequestId, source_text: String },

    /// Register the shared interrupt signal. Only meaningful for engines
    /// that share memory with the controller, so it never crosses a frame.
    #[serde(skip)]
    SetInterruptBuffer { buffer: InterruptBuffer },
}

impl From<ExecutionRequest> for WorkerCommand {
    fn from(request: ExecutionRequest) -> Self {
        WorkerCommand::Execute {
            id: request.id,
            source_text: request.source_text,
        }
    }
}

/// Messages sent from an engine back to its controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerEvent {
    /// The interpreter session is ready for `execute`.
    InitComplete,

    /// Something went wrong. Without an `id` the channel is poisoned.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
    },

    /// Streamed output for the request in flight.
    Output { stream: Stream, text: String },

    /// Terminal result for a request.
    Result {
        #[serde(flatten)]
        result: ExecutionResult,
    },
}

impl From<OutputChunk> for WorkerEvent {
    fn from(chunk: OutputChunk) -> Self {
        WorkerEvent::Output {
            stream: chunk.stream,
            text: chunk.text,
        }
    }
}

impl From<ExecutionResult> for WorkerEvent {
    fn from(result: ExecutionResult) -> Self {
        WorkerEvent::Result { result }
    }
}
