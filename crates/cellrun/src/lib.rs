//! cellrun - isolated, cancellable execution of notebook code cells.
//!
//! Every cell owns a controller and, once it first runs, a dedicated
//! execution engine reached through an execution channel. Engines run
//! either on a thread in this process, where a shared interrupt buffer
//! allows soft cancellation, or in a `cellrun worker` child process, where
//! cancelling always restarts the engine.

pub mod cancellation;
pub mod channel;
pub mod controller;
pub mod engine;
pub mod error;
pub mod notebook;
pub mod settings;
pub mod worker;

pub use channel::{factory_for, EngineFactory, ProcessEngineFactory, ThreadEngineFactory};
pub use controller::{
    CancelAck, CellController, CellExecutionState, CellSnapshot, CellStatus, LineStream,
    OutputLine, RunAck,
};
pub use error::{CellError, ControllerError};
pub use notebook::{Notebook, NotebookError, ToolCall};
pub use settings::{EngineBackend, RunnerSettings};

/// Split a script into cells at `# %%` marker lines. Blank cells are dropped.
pub fn split_cells(script: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    for line in script.split_inclusive('\n') {
        if line.trim_start().starts_with("# %%") {
            cells.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(line);
    }
    cells.push(current);
    cells
        .into_iter()
        .filter(|cell| !cell.trim().is_empty())
        .collect()
}
