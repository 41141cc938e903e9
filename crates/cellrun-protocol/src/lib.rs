//! Shared message types for cell execution engines.
//!
//! This crate defines the protocol spoken across the Execution Channel, the
//! boundary between a cell controller on the UI side and the engine that
//! hosts an interpreter session on its own thread or process.
//!
//! # Features
//!
//! - Tagged command/event unions (`{"type": "..."}`) for both directions
//! - Output chunks and terminal execution results
//! - A shared interrupt buffer for cooperative cancellation
//! - Length-prefixed JSON framing for process-hosted engines

mod framing;
mod interrupt;
mod message;

pub use framing::{recv_json_frame, send_json_frame, FrameError, MAX_FRAME_SIZE};
pub use interrupt::{InterruptBuffer, SIGINT};
pub use message::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, OutputChunk, RequestId, Stream,
    WorkerCommand, WorkerEvent, INTERRUPT_MARKER,
};
