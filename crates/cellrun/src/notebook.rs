//! Notebook store: the ordered set of code cells and the tool surface that
//! an assistant (or any other caller) drives them through.

use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::cancellation::CancellationCoordinator;
use crate::channel::{factory_for, ChannelError, EngineFactory};
use crate::controller::{CancelAck, CellController, CellSnapshot, RunAck};
use crate::error::ControllerError;
use crate::settings::RunnerSettings;

#[derive(Debug, thiserror::Error)]
pub enum NotebookError {
    #[error("no cell with id '{0}'")]
    UnknownCell(String),

    #[error("a cell with id '{0}' already exists")]
    DuplicateCell(String),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// A tool invocation, as issued by an assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "snake_case")]
pub enum ToolCall {
    /// All cells with their text, status and output
    ListCells,
    /// Replace a cell's text
    UpdateCell { id: String, text: String },
    /// Append a new code cell; it starts `idle`
    CreateCodeCell { text: String },
    /// Run a cell and wait for it to settle
    ExecuteCell { id: String },
}

pub struct Notebook {
    settings: RunnerSettings,
    factory: Arc<dyn EngineFactory>,
    cells: Vec<CellController>,
}

impl Notebook {
    /// Must be called within a tokio runtime.
    pub fn new(settings: RunnerSettings) -> Result<Self, NotebookError> {
        let factory = factory_for(&settings)?;
        Ok(Self::with_factory(settings, factory))
    }

    pub fn with_factory(settings: RunnerSettings, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            settings,
            factory,
            cells: Vec::new(),
        }
    }

    pub fn register_cell(
        &mut self,
        id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), NotebookError> {
        let id = id.into();
        if self.cell(&id).is_some() {
            return Err(NotebookError::DuplicateCell(id));
        }
        info!("[notebook] registering cell {}", id);
        let controller =
            CellController::spawn(id, text, self.factory.clone(), self.settings.clone());
        self.cells.push(controller);
        Ok(())
    }

    /// Append a cell with a fresh id and return the id.
    pub fn create_code_cell(&mut self, text: impl Into<String>) -> Result<String, NotebookError> {
        let id = Uuid::new_v4().to_string();
        self.register_cell(id.clone(), text)?;
        Ok(id)
    }

    pub fn cell(&self, id: &str) -> Option<&CellController> {
        self.cells.iter().find(|cell| cell.id() == id)
    }

    fn require(&self, id: &str) -> Result<&CellController, NotebookError> {
        self.cell(id)
            .ok_or_else(|| NotebookError::UnknownCell(id.to_string()))
    }

    pub async fn run(&self, id: &str) -> Result<RunAck, NotebookError> {
        Ok(self.require(id)?.run().await?)
    }

    pub async fn cancel(&self, id: &str) -> Result<CancelAck, NotebookError> {
        Ok(self.require(id)?.cancel().await?)
    }

    pub fn set_text(&self, id: &str, text: impl Into<String>) -> Result<(), NotebookError> {
        self.require(id)?.set_text(text);
        Ok(())
    }

    /// Remove a cell, tearing down its engine even mid-run.
    pub async fn delete_cell(&mut self, id: &str) -> Result<(), NotebookError> {
        let index = self
            .cells
            .iter()
            .position(|cell| cell.id() == id)
            .ok_or_else(|| NotebookError::UnknownCell(id.to_string()))?;
        let cell = self.cells.remove(index);
        info!("[notebook] deleting cell {}", id);
        cell.shutdown().await?;
        Ok(())
    }

    pub fn snapshot(&self, id: &str) -> Result<CellSnapshot, NotebookError> {
        Ok(self.require(id)?.snapshot())
    }

    pub fn list_cells(&self) -> Vec<CellSnapshot> {
        self.cells.iter().map(CellController::snapshot).collect()
    }

    /// Run a cell and wait until it reaches a terminal state.
    pub async fn execute_cell(&self, id: &str) -> Result<CellSnapshot, NotebookError> {
        let cell = self.require(id)?;
        cell.run().await?;
        cell.wait_until_settled().await?;
        Ok(cell.snapshot())
    }

    /// Whether cells registered from now on can be interrupted in place.
    pub fn immediate_cancellation_available(&self) -> bool {
        CancellationCoordinator::for_backend(self.factory.as_ref(), &self.settings)
            .immediate_cancellation_available()
    }

    /// Carry out a tool call and return its JSON response.
    pub async fn invoke(&mut self, call: ToolCall) -> Result<Value, NotebookError> {
        match call {
            ToolCall::ListCells => Ok(json!({ "cells": self.list_cells() })),
            ToolCall::UpdateCell { id, text } => {
                self.set_text(&id, text)?;
                Ok(json!({ "id": id, "updated": true }))
            }
            ToolCall::CreateCodeCell { text } => {
                let id = self.create_code_cell(text)?;
                Ok(serde_json::to_value(self.snapshot(&id)?).unwrap_or(Value::Null))
            }
            ToolCall::ExecuteCell { id } => {
                let snapshot = self.execute_cell(&id).await?;
                Ok(serde_json::to_value(snapshot).unwrap_or(Value::Null))
            }
        }
    }

    /// Shut down every cell.
    pub async fn shutdown(self) {
        for cell in &self.cells {
            let _ = cell.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::CellStatus;

    fn notebook() -> Notebook {
        Notebook::new(RunnerSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let mut nb = notebook();
        nb.register_cell("a", "print(1)").unwrap();
        nb.register_cell("b", "print(2)").unwrap();
        let cells = nb.list_cells();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].id, "a");
        assert_eq!(cells[1].text, "print(2)");
        assert!(cells.iter().all(|c| c.status == CellStatus::Idle));
    }

    #[tokio::test]
    async fn test_duplicate_cell_is_rejected() {
        let mut nb = notebook();
        nb.register_cell("a", "").unwrap();
        assert!(matches!(
            nb.register_cell("a", ""),
            Err(NotebookError::DuplicateCell(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_cell() {
        let nb = notebook();
        assert!(matches!(
            nb.run("missing").await,
            Err(NotebookError::UnknownCell(_))
        ));
    }

    #[tokio::test]
    async fn test_tool_calls_end_to_end() {
        let mut nb = notebook();

        let call: ToolCall =
            serde_json::from_str(r#"{"tool":"create_code_cell","text":"print(6 * 7)"}"#).unwrap();
        let created = nb.invoke(call).await.unwrap();
        assert_eq!(created["status"], "idle");
        let id = created["id"].as_str().unwrap().to_string();

        let executed = nb
            .invoke(ToolCall::ExecuteCell { id: id.clone() })
            .await
            .unwrap();
        assert_eq!(executed["status"], "complete");
        assert_eq!(executed["output"][0]["text"], "42\n");

        nb.invoke(ToolCall::UpdateCell {
            id: id.clone(),
            text: "1/0".into(),
        })
        .await
        .unwrap();
        let listed = nb.invoke(ToolCall::ListCells).await.unwrap();
        assert_eq!(listed["cells"][0]["text"], "1/0");
        // updating text leaves the last run's status alone
        assert_eq!(listed["cells"][0]["status"], "complete");

        let executed = nb.invoke(ToolCall::ExecuteCell { id }).await.unwrap();
        assert_eq!(executed["status"], "failed");
    }

    #[tokio::test]
    async fn test_delete_running_cell() {
        let mut nb = notebook();
        nb.register_cell("spinner", "loop_forever()").unwrap();
        nb.run("spinner").await.unwrap();
        nb.delete_cell("spinner").await.unwrap();
        assert!(nb.list_cells().is_empty());
        assert!(nb.cell("spinner").is_none());
    }

    #[tokio::test]
    async fn test_cancellation_capability_matches_cells() {
        let mut nb = notebook();
        nb.register_cell("a", "").unwrap();
        assert!(nb.immediate_cancellation_available());
        assert_eq!(
            nb.immediate_cancellation_available(),
            nb.cell("a").unwrap().immediate_cancellation_available()
        );

        let mut nb = Notebook::new(RunnerSettings {
            shared_interrupt: false,
            ..Default::default()
        })
        .unwrap();
        nb.register_cell("b", "").unwrap();
        assert!(!nb.immediate_cancellation_available());
        assert!(!nb.cell("b").unwrap().immediate_cancellation_available());
    }

    #[test]
    fn test_tool_call_wire_format() {
        let json = serde_json::to_value(ToolCall::UpdateCell {
            id: "c1".into(),
            text: "x = 1".into(),
        })
        .unwrap();
        assert_eq!(json["tool"], "update_cell");
        assert_eq!(json["id"], "c1");
        let parsed: ToolCall = serde_json::from_str(r#"{"tool":"list_cells"}"#).unwrap();
        assert_eq!(parsed, ToolCall::ListCells);
    }
}
