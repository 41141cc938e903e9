//! Per-cell controller.
//!
//! Each cell gets an actor task that owns its engine and its execution
//! state, plus a [`CellController`] handle. Every operation on the handle is
//! a message send; state is published through a `watch` channel so readers
//! never block the actor.
//!
//! Status transitions:
//!
//! ```text
//! Idle/Complete/Failed/Cancelled --run--> Running
//! Running --result ok--> Complete
//! Running --result error--> Failed
//! Running --cancel (soft)--> Stopping --interrupted result--> Cancelled
//! Running --cancel (hard)--> Cancelled
//! ```

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use cellrun_protocol::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, RequestId, Stream, WorkerEvent,
    INTERRUPT_MARKER,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use ts_rs::TS;

use crate::cancellation::{CancelStrategy, CancellationCoordinator};
use crate::channel::{EngineFactory, EngineHandle};
use crate::error::{CellError, ControllerError};
use crate::settings::RunnerSettings;

/// Execution status of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum CellStatus {
    Idle,
    Running,
    Stopping,
    Complete,
    Failed,
    Cancelled,
}

impl CellStatus {
    /// A run is in flight.
    pub fn is_active(self) -> bool {
        matches!(self, CellStatus::Running | CellStatus::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CellStatus::Complete | CellStatus::Failed | CellStatus::Cancelled
        )
    }
}

/// Where an output line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum LineStream {
    Stdout,
    Stderr,
    /// Notices generated by the runner, not by the program
    System,
}

impl From<Stream> for LineStream {
    fn from(stream: Stream) -> Self {
        match stream {
            Stream::Stdout => LineStream::Stdout,
            Stream::Stderr => LineStream::Stderr,
        }
    }
}

/// One line of output, including its trailing newline when it has one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OutputLine {
    pub stream: LineStream,
    pub text: String,
}

/// Execution state of a cell, published after every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CellExecutionState {
    pub status: CellStatus,
    pub output_lines: Vec<OutputLine>,
    pub current_request_id: Option<RequestId>,
    pub last_error: Option<String>,
}

impl Default for CellExecutionState {
    fn default() -> Self {
        Self {
            status: CellStatus::Idle,
            output_lines: Vec::new(),
            current_request_id: None,
            last_error: None,
        }
    }
}

impl CellExecutionState {
    /// Concatenated text of every line from one stream.
    pub fn text_of(&self, stream: LineStream) -> String {
        self.output_lines
            .iter()
            .filter(|line| line.stream == stream)
            .map(|line| line.text.as_str())
            .collect()
    }

    /// Append text, continuing the last line when it is an unfinished line
    /// of the same stream.
    fn append(&mut self, stream: LineStream, text: &str) {
        let mut rest = text;
        if let Some(last) = self.output_lines.last_mut() {
            if last.stream == stream && !last.text.ends_with('\n') {
                let split = rest.find('\n').map_or(rest.len(), |i| i + 1);
                last.text.push_str(&rest[..split]);
                rest = &rest[split..];
            }
        }
        for piece in rest.split_inclusive('\n') {
            self.output_lines.push(OutputLine {
                stream,
                text: piece.to_string(),
            });
        }
    }

    /// Notices always start on a fresh line.
    fn push_system(&mut self, text: &str) {
        let mut text = text.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.output_lines.push(OutputLine {
            stream: LineStream::System,
            text,
        });
    }
}

/// What a reader sees of a cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CellSnapshot {
    pub id: String,
    pub text: String,
    pub status: CellStatus,
    pub output: Vec<OutputLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Reply to `run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunAck {
    Started { request_id: RequestId },
    AlreadyRunning,
}

/// Reply to `cancel`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// Interrupt signalled; the cell is `Stopping`
    Soft,
    /// Engine torn down; the cell is `Cancelled`
    Hard,
    /// Nothing to cancel
    NotRunning,
}

enum ControllerCommand {
    Run { reply: oneshot::Sender<RunAck> },
    Cancel { reply: oneshot::Sender<CancelAck> },
    WarmUp,
    Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    /// Engine must report `init-complete` by then
    Init,
    /// A soft cancel escalates to a restart
    Escalate,
}

/// Handle to a cell's controller. Dropping it tears the engine down.
pub struct CellController {
    id: String,
    commands: mpsc::UnboundedSender<ControllerCommand>,
    state: watch::Receiver<CellExecutionState>,
    text: Arc<StdMutex<String>>,
    immediate_cancellation_available: bool,
    cancellation_caveat: Option<&'static str>,
}

impl CellController {
    /// Start the controller task for one cell. Must be called within a
    /// tokio runtime.
    pub fn spawn(
        id: impl Into<String>,
        text: impl Into<String>,
        factory: Arc<dyn EngineFactory>,
        settings: RunnerSettings,
    ) -> Self {
        let id = id.into();
        let text = Arc::new(StdMutex::new(text.into()));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CellExecutionState::default());
        let coordinator = CancellationCoordinator::for_backend(factory.as_ref(), &settings);
        let immediate_cancellation_available = coordinator.immediate_cancellation_available();
        let cancellation_caveat = coordinator.cancellation_caveat();

        if settings.eager_init {
            let _ = command_tx.send(ControllerCommand::WarmUp);
        }

        let actor = CellActor {
            id: id.clone(),
            factory,
            settings,
            coordinator,
            engine: None,
            generation: 0,
            queued: None,
            seen_stdout: String::new(),
            seen_stderr: String::new(),
            deadline: None,
            state: state_tx,
            text: text.clone(),
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            id,
            commands: command_tx,
            state: state_rx,
            text,
            immediate_cancellation_available,
            cancellation_caveat,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start a run of the current text. A no-op while a run is in flight.
    pub async fn run(&self) -> Result<RunAck, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(ControllerCommand::Run { reply })?;
        Ok(rx.await?)
    }

    /// Cancel the run in flight. A no-op when nothing is running.
    pub async fn cancel(&self) -> Result<CancelAck, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(ControllerCommand::Cancel { reply })?;
        Ok(rx.await?)
    }

    /// Replace the cell's source. Never affects a run in flight.
    pub fn set_text(&self, text: impl Into<String>) {
        *self.text.lock().unwrap() = text.into();
    }

    pub fn text(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().status.is_active()
    }

    pub fn state(&self) -> CellExecutionState {
        self.state.borrow().clone()
    }

    pub fn snapshot(&self) -> CellSnapshot {
        let state = self.state.borrow();
        CellSnapshot {
            id: self.id.clone(),
            text: self.text(),
            status: state.status,
            output: state.output_lines.clone(),
            last_error: state.last_error.clone(),
        }
    }

    /// Watch every state change.
    pub fn subscribe(&self) -> watch::Receiver<CellExecutionState> {
        self.state.clone()
    }

    /// Wait until no run is in flight and return the state at that point.
    pub async fn wait_until_settled(&self) -> Result<CellExecutionState, ControllerError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|state| !state.status.is_active())
            .await
            .map_err(|_| ControllerError::Stopped)?;
        Ok((*state).clone())
    }

    /// Boot the engine ahead of the first run.
    pub fn warm_up(&self) -> Result<(), ControllerError> {
        self.commands.send(ControllerCommand::WarmUp)?;
        Ok(())
    }

    /// Stop the controller, tearing down its engine. A run in flight ends
    /// `Cancelled`.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(ControllerCommand::Shutdown { reply })?;
        Ok(rx.await?)
    }

    pub fn immediate_cancellation_available(&self) -> bool {
        self.immediate_cancellation_available
    }

    pub fn cancellation_caveat(&self) -> Option<&'static str> {
        self.cancellation_caveat
    }
}

struct CellActor {
    id: String,
    factory: Arc<dyn EngineFactory>,
    settings: RunnerSettings,
    coordinator: CancellationCoordinator,
    engine: Option<EngineHandle>,
    generation: u64,
    /// Request accepted while the engine was still initializing
    queued: Option<ExecutionRequest>,
    /// Text received as chunks for the current request, for reconciliation
    seen_stdout: String,
    seen_stderr: String,
    deadline: Option<(Instant, Deadline)>,
    state: watch::Sender<CellExecutionState>,
    text: Arc<StdMutex<String>>,
}

async fn next_event(engine: &mut Option<EngineHandle>) -> Option<WorkerEvent> {
    match engine {
        Some(handle) => handle.channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline_reached(deadline: Option<(Instant, Deadline)>) -> Deadline {
    match deadline {
        Some((at, kind)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

impl CellActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ControllerCommand>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ControllerCommand::Run { reply }) => {
                        let _ = reply.send(self.start_run());
                    }
                    Some(ControllerCommand::Cancel { reply }) => {
                        let _ = reply.send(self.cancel());
                    }
                    Some(ControllerCommand::WarmUp) => self.warm_up(),
                    Some(ControllerCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        debug!("[cell] {} handle dropped", self.id);
                        self.shutdown();
                        return;
                    }
                },
                event = next_event(&mut self.engine) => match event {
                    Some(event) => self.handle_event(event),
                    None => self.engine_failed(CellError::ChannelFailure(
                        "engine exited unexpectedly".to_string(),
                    )),
                },
                kind = deadline_reached(deadline) => self.deadline_fired(kind),
            }
        }
    }

    fn status(&self) -> CellStatus {
        self.state.borrow().status
    }

    fn start_run(&mut self) -> RunAck {
        if self.status().is_active() {
            debug!("[cell] {} run ignored, already running", self.id);
            return RunAck::AlreadyRunning;
        }

        let source = self.text.lock().unwrap().clone();
        let request = ExecutionRequest::new(source);
        let request_id = request.id.clone();
        info!("[cell] {} run {}", self.id, request_id);

        self.seen_stdout.clear();
        self.seen_stderr.clear();
        self.state.send_modify(|state| {
            state.status = CellStatus::Running;
            state.output_lines.clear();
            state.current_request_id = Some(request_id.clone());
            state.last_error = None;
        });

        if let Err(e) = self.ensure_engine() {
            self.finish(CellStatus::Failed, Some(e));
            return RunAck::Started { request_id };
        }

        if self.engine_ready() {
            self.dispatch(request);
        } else {
            debug!("[cell] {} engine not ready, queueing {}", self.id, request_id);
            self.queued = Some(request);
        }
        RunAck::Started { request_id }
    }

    fn engine_ready(&self) -> bool {
        self.engine
            .as_ref()
            .is_some_and(|engine| engine.channel.is_ready())
    }

    /// Spawn and initialize an engine unless a usable one exists.
    fn ensure_engine(&mut self) -> Result<(), CellError> {
        if let Some(engine) = &self.engine {
            if engine.channel.is_usable() {
                return Ok(());
            }
            self.discard_engine();
        }

        self.generation += 1;
        let label = format!("{}-{}", self.id, self.generation);
        info!(
            "[cell] {} starting {} engine (generation {})",
            self.id,
            self.factory.backend(),
            self.generation
        );
        let mut channel = self
            .factory
            .spawn(&label)
            .map_err(|e| CellError::Initialization(e.to_string()))?;
        channel
            .init(self.settings.startup_code.clone())
            .map_err(|e| CellError::Initialization(e.to_string()))?;

        self.engine = Some(EngineHandle {
            generation: self.generation,
            channel,
        });
        self.deadline = Some((
            Instant::now() + Duration::from_millis(self.settings.init_timeout_ms),
            Deadline::Init,
        ));
        Ok(())
    }

    fn dispatch(&mut self, request: ExecutionRequest) {
        self.coordinator.prepare_run();
        let Some(engine) = self.engine.as_mut() else {
            self.finish(CellStatus::Failed, Some(CellError::EngineNotReady));
            return;
        };
        if let Err(e) = engine.channel.execute(request) {
            self.engine_failed(e.into());
        }
    }

    fn warm_up(&mut self) {
        if let Err(e) = self.ensure_engine() {
            warn!("[cell] {} warm-up failed: {}", self.id, e);
            self.state.send_modify(|state| {
                state.last_error = Some(e.to_string());
            });
        }
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::InitComplete => {
                if matches!(self.deadline, Some((_, Deadline::Init))) {
                    self.deadline = None;
                }
                if let Some(engine) = self.engine.as_mut() {
                    info!(
                        "[cell] {} engine generation {} ready",
                        self.id, engine.generation
                    );
                    self.coordinator.on_engine_ready(&mut engine.channel);
                }
                if let Some(request) = self.queued.take() {
                    self.dispatch(request);
                }
            }
            WorkerEvent::Error { message, id: None } => {
                let initializing = matches!(self.deadline, Some((_, Deadline::Init)));
                let error = if initializing {
                    CellError::Initialization(message)
                } else {
                    CellError::ChannelFailure(message)
                };
                self.engine_failed(error);
            }
            WorkerEvent::Error {
                message,
                id: Some(id),
            } => {
                if !self.is_current(&id) {
                    debug!("[cell] {} ignoring error for stale request {}", self.id, id);
                    return;
                }
                self.finish(CellStatus::Failed, Some(CellError::ChannelFailure(message)));
            }
            WorkerEvent::Output { stream, text } => {
                if !self.status().is_active() {
                    debug!("[cell] {} dropping output with no run in flight", self.id);
                    return;
                }
                match stream {
                    Stream::Stdout => self.seen_stdout.push_str(&text),
                    Stream::Stderr => self.seen_stderr.push_str(&text),
                }
                self.state
                    .send_modify(|state| state.append(stream.into(), &text));
            }
            WorkerEvent::Result { result } => {
                if !self.is_current(&result.id) {
                    debug!(
                        "[cell] {} ignoring result for stale request {}",
                        self.id, result.id
                    );
                    return;
                }
                self.apply_result(result);
            }
        }
    }

    fn is_current(&self, id: &RequestId) -> bool {
        self.state.borrow().current_request_id.as_ref() == Some(id)
    }

    /// Finalize from a result, first appending any text that never arrived
    /// as a chunk.
    fn apply_result(&mut self, result: ExecutionResult) {
        let marker = format!("{}\n", INTERRUPT_MARKER);
        let mut stderr = result.stderr.as_str();
        if result.status == ExecutionStatus::Interrupted {
            stderr = stderr.strip_suffix(marker.as_str()).unwrap_or(stderr);
        }
        let missing_stdout = unseen_suffix(&self.seen_stdout, &result.stdout);
        let missing_stderr = unseen_suffix(&self.seen_stderr, stderr);
        if !missing_stdout.is_empty() || !missing_stderr.is_empty() {
            debug!("[cell] {} reconciling output from result", self.id);
            self.state.send_modify(|state| {
                state.append(LineStream::Stdout, missing_stdout);
                state.append(LineStream::Stderr, missing_stderr);
            });
        }

        match result.status {
            ExecutionStatus::Ok => self.finish(CellStatus::Complete, None),
            ExecutionStatus::Error => {
                let summary = stderr
                    .lines()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .unwrap_or("error")
                    .to_string();
                self.finish(CellStatus::Failed, Some(CellError::RuntimeExecution(summary)));
            }
            ExecutionStatus::Interrupted => {
                self.state.send_modify(|state| state.push_system(&marker));
                self.finish(CellStatus::Cancelled, Some(CellError::Interrupted));
            }
        }
    }

    fn cancel(&mut self) -> CancelAck {
        match self.status() {
            CellStatus::Running => {}
            // Asking again means the interrupt was not enough
            CellStatus::Stopping => {
                debug!("[cell] {} still stopping, escalating", self.id);
                self.hard_cancel();
                return CancelAck::Hard;
            }
            _ => return CancelAck::NotRunning,
        }

        let strategy = if self.queued.is_some() {
            CancelStrategy::Hard
        } else {
            self.coordinator.cancel()
        };
        match strategy {
            CancelStrategy::Soft => {
                info!("[cell] {} soft cancel", self.id);
                self.state
                    .send_modify(|state| state.status = CellStatus::Stopping);
                if let Some(ms) = self.settings.escalate_after_ms {
                    self.deadline = Some((
                        Instant::now() + Duration::from_millis(ms),
                        Deadline::Escalate,
                    ));
                }
                CancelAck::Soft
            }
            CancelStrategy::Hard => {
                self.hard_cancel();
                CancelAck::Hard
            }
        }
    }

    fn hard_cancel(&mut self) {
        info!("[cell] {} hard cancel, restarting engine", self.id);
        self.discard_engine();
        self.state
            .send_modify(|state| state.push_system(INTERRUPT_MARKER));
        self.finish(CellStatus::Cancelled, Some(CellError::Interrupted));
    }

    fn deadline_fired(&mut self, kind: Deadline) {
        self.deadline = None;
        match kind {
            Deadline::Init => {
                let error = CellError::Initialization(format!(
                    "engine did not become ready within {} ms",
                    self.settings.init_timeout_ms
                ));
                self.engine_failed(error);
            }
            Deadline::Escalate => {
                if self.status() == CellStatus::Stopping {
                    warn!("[cell] {} soft cancel unanswered, escalating", self.id);
                    self.hard_cancel();
                }
            }
        }
    }

    /// The engine can no longer be trusted: drop it and settle the run.
    fn engine_failed(&mut self, error: CellError) {
        warn!("[cell] {} engine failed: {}", self.id, error);
        self.discard_engine();
        match self.status() {
            CellStatus::Stopping => {
                self.state
                    .send_modify(|state| state.push_system(INTERRUPT_MARKER));
                self.finish(CellStatus::Cancelled, Some(CellError::Interrupted));
            }
            CellStatus::Running => self.finish(CellStatus::Failed, Some(error)),
            _ => {
                self.state.send_modify(|state| {
                    state.push_system(&error.to_string());
                    state.last_error = Some(error.to_string());
                });
            }
        }
    }

    fn discard_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            debug!(
                "[cell] {} discarding engine generation {}",
                self.id, engine.generation
            );
            engine.channel.terminate();
        }
        self.coordinator.on_engine_discarded();
        self.queued = None;
        if matches!(self.deadline, Some((_, Deadline::Init))) {
            self.deadline = None;
        }
    }

    /// Settle the current run. Initialization and channel failures also get
    /// a `system` line so they show up in the output.
    fn finish(&mut self, status: CellStatus, error: Option<CellError>) {
        if matches!(self.deadline, Some((_, Deadline::Escalate))) {
            self.deadline = None;
        }
        self.queued = None;
        let notice = match &error {
            Some(
                e @ (CellError::Initialization(_)
                | CellError::ChannelFailure(_)
                | CellError::EngineNotReady),
            ) => Some(e.to_string()),
            _ => None,
        };
        info!("[cell] {} finished: {:?}", self.id, status);
        self.state.send_modify(|state| {
            if let Some(notice) = &notice {
                state.push_system(notice);
            }
            state.status = status;
            state.current_request_id = None;
            state.last_error = error.map(|e| e.to_string());
        });
    }

    fn shutdown(&mut self) {
        let was_active = self.status().is_active();
        self.discard_engine();
        if was_active {
            self.state
                .send_modify(|state| state.push_system(INTERRUPT_MARKER));
            self.finish(CellStatus::Cancelled, Some(CellError::Interrupted));
        }
        info!("[cell] {} controller stopped", self.id);
    }
}

/// The part of `full` not already covered by `seen`.
///
/// A result's text stops growing at the engine's result limit, so a `full`
/// that is a prefix of `seen` has nothing missing.
fn unseen_suffix<'a>(seen: &str, full: &'a str) -> &'a str {
    match full.strip_prefix(seen) {
        Some(rest) => rest,
        None if seen.starts_with(full) => "",
        None => {
            warn!("[cell] streamed output diverged from result");
            ""
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ThreadEngineFactory;

    fn thread_cell(text: &str) -> CellController {
        CellController::spawn(
            "cell",
            text,
            Arc::new(ThreadEngineFactory),
            RunnerSettings::default(),
        )
    }

    async fn run_to_end(cell: &CellController) -> CellExecutionState {
        assert!(matches!(cell.run().await.unwrap(), RunAck::Started { .. }));
        cell.wait_until_settled().await.unwrap()
    }

    #[test]
    fn test_append_splits_lines_and_continues_partial_ones() {
        let mut state = CellExecutionState::default();
        state.append(LineStream::Stdout, "a\nb");
        state.append(LineStream::Stdout, "c\nd\n");
        state.append(LineStream::Stderr, "e");
        state.append(LineStream::Stdout, "f\n");
        let texts: Vec<&str> = state.output_lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["a\n", "bc\n", "d\n", "e", "f\n"]);
        assert_eq!(state.text_of(LineStream::Stdout), "a\nbc\nd\nf\n");
    }

    #[test]
    fn test_unseen_suffix() {
        assert_eq!(unseen_suffix("ab", "abcd"), "cd");
        assert_eq!(unseen_suffix("", "x"), "x");
        assert_eq!(unseen_suffix("zz", "abc"), "");
        // a capped result is a prefix of what streamed
        assert_eq!(unseen_suffix("abcdef", "abc"), "");
    }

    #[tokio::test]
    async fn test_print_hello_completes() {
        let cell = thread_cell("print(\"hello\")");
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Complete);
        assert_eq!(state.text_of(LineStream::Stdout), "hello\n");
        assert_eq!(state.text_of(LineStream::Stderr), "");
        assert!(state.last_error.is_none());
        assert!(state.current_request_id.is_none());
    }

    #[tokio::test]
    async fn test_division_by_zero_fails() {
        let cell = thread_cell("1/0");
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Failed);
        assert_eq!(state.text_of(LineStream::Stdout), "");
        assert!(state
            .text_of(LineStream::Stderr)
            .contains("ZeroDivisionError"));
        assert_eq!(
            state.last_error.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let cell = thread_cell("print(1)");
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::NotRunning);
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::NotRunning);
        assert_eq!(cell.state().status, CellStatus::Idle);
    }

    #[tokio::test]
    async fn test_soft_cancel_of_loop_forever() {
        let cell = thread_cell("print(\"A\"); loop_forever()");
        cell.run().await.unwrap();

        let mut rx = cell.subscribe();
        rx.wait_for(|s| s.text_of(LineStream::Stdout) == "A\n")
            .await
            .unwrap();
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::Soft);

        let state = cell.wait_until_settled().await.unwrap();
        assert_eq!(state.status, CellStatus::Cancelled);
        assert_eq!(
            state.output_lines,
            vec![
                OutputLine {
                    stream: LineStream::Stdout,
                    text: "A\n".into()
                },
                OutputLine {
                    stream: LineStream::System,
                    text: format!("{}\n", INTERRUPT_MARKER)
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_soft_cancel_keeps_globals() {
        let cell = thread_cell("x = 7");
        run_to_end(&cell).await;

        cell.set_text("while True: pass");
        cell.run().await.unwrap();
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::Soft);
        assert_eq!(
            cell.wait_until_settled().await.unwrap().status,
            CellStatus::Cancelled
        );

        cell.set_text("print(x)");
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Complete);
        assert_eq!(state.text_of(LineStream::Stdout), "7\n");
    }

    #[tokio::test]
    async fn test_hard_cancel_when_shared_interrupt_disabled() {
        let settings = RunnerSettings {
            shared_interrupt: false,
            ..Default::default()
        };
        let cell = CellController::spawn(
            "cell",
            "x = 1\nwhile True: pass",
            Arc::new(ThreadEngineFactory),
            settings,
        );
        assert!(!cell.immediate_cancellation_available());
        assert!(cell.cancellation_caveat().is_some());

        cell.run().await.unwrap();
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::Hard);
        assert_eq!(cell.state().status, CellStatus::Cancelled);

        // globals were lost with the engine
        cell.set_text("print(x)");
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Failed);
        assert!(state.text_of(LineStream::Stderr).contains("NameError"));
    }

    #[tokio::test]
    async fn test_run_while_running_is_rejected() {
        let cell = thread_cell("loop_forever()");
        assert!(matches!(cell.run().await.unwrap(), RunAck::Started { .. }));
        assert_eq!(cell.run().await.unwrap(), RunAck::AlreadyRunning);
        assert!(cell.is_running());
        cell.cancel().await.unwrap();
        cell.wait_until_settled().await.unwrap();
        assert!(!cell.is_running());
    }

    #[tokio::test]
    async fn test_sequential_runs_are_independent() {
        let cell = thread_cell("");
        for i in 0..3 {
            cell.set_text(format!("print({})", i));
            let state = run_to_end(&cell).await;
            assert_eq!(state.status, CellStatus::Complete);
            assert_eq!(state.text_of(LineStream::Stdout), format!("{}\n", i));
        }
    }

    #[tokio::test]
    async fn test_set_text_does_not_change_status() {
        let cell = thread_cell("print(1)");
        run_to_end(&cell).await;
        cell.set_text("print(2)");
        assert_eq!(cell.text(), "print(2)");
        assert_eq!(cell.state().status, CellStatus::Complete);
    }

    #[tokio::test]
    async fn test_startup_failure_surfaces_and_recovers() {
        let settings = RunnerSettings {
            startup_code: Some("raise ValueError('no config')".into()),
            ..Default::default()
        };
        let cell = CellController::spawn(
            "cell",
            "print(1)",
            Arc::new(ThreadEngineFactory),
            settings,
        );
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Failed);
        let error = state.last_error.unwrap();
        assert!(error.contains("initialize"), "{}", error);
        assert!(error.contains("no config"), "{}", error);
        assert_eq!(state.output_lines[0].stream, LineStream::System);

        // a later run builds a fresh engine and fails the same way
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Failed);
    }

    #[tokio::test]
    async fn test_escalation_after_unanswered_soft_cancel() {
        let settings = RunnerSettings {
            escalate_after_ms: Some(100),
            ..Default::default()
        };
        let cell = CellController::spawn(
            "cell",
            "spin(30)",
            Arc::new(ThreadEngineFactory),
            settings,
        );
        cell.run().await.unwrap();
        // let the engine enter the native call before interrupting
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::Soft);

        let started = std::time::Instant::now();
        let state = cell.wait_until_settled().await.unwrap();
        assert_eq!(state.status, CellStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_second_cancel_while_stopping_escalates() {
        let cell = thread_cell("x = 1\nspin(30)");
        cell.run().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::Soft);
        assert_eq!(cell.state().status, CellStatus::Stopping);

        let started = std::time::Instant::now();
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::Hard);
        let state = cell.state();
        assert_eq!(state.status, CellStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        let markers = state
            .output_lines
            .iter()
            .filter(|line| line.stream == LineStream::System)
            .count();
        assert_eq!(markers, 1);
        assert_eq!(cell.cancel().await.unwrap(), CancelAck::NotRunning);

        // the engine was replaced
        cell.set_text("print(x)");
        let state = run_to_end(&cell).await;
        assert!(state.text_of(LineStream::Stderr).contains("NameError"));
    }

    #[tokio::test]
    async fn test_interleaved_streams_keep_their_order() {
        let cell = thread_cell(
            "import sys\nprint('a')\nprint('b', file=sys.stderr)\nprint('c')\nprint('d', file=sys.stderr)",
        );
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Complete);
        let lines: Vec<(LineStream, &str)> = state
            .output_lines
            .iter()
            .map(|line| (line.stream, line.text.as_str()))
            .collect();
        assert_eq!(
            lines,
            vec![
                (LineStream::Stdout, "a\n"),
                (LineStream::Stderr, "b\n"),
                (LineStream::Stdout, "c\n"),
                (LineStream::Stderr, "d\n"),
            ]
        );
    }

    #[tokio::test]
    async fn test_deeply_nested_source_fails_without_crashing() {
        let cell = thread_cell("");
        for source in [
            format!("print({}True)", "not ".repeat(100_000)),
            format!("print(1{})", "**1".repeat(100_000)),
        ] {
            cell.set_text(source);
            let state = run_to_end(&cell).await;
            assert_eq!(state.status, CellStatus::Failed);
            assert!(state.text_of(LineStream::Stderr).contains("SyntaxError"));
        }

        cell.set_text(format!("print(1{})", "+1".repeat(100_000)));
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Complete);
        assert_eq!(state.text_of(LineStream::Stdout), "100001\n");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_cell() {
        let cell = thread_cell("loop_forever()");
        let mut rx = cell.subscribe();
        cell.run().await.unwrap();
        cell.shutdown().await.unwrap();
        assert_eq!(rx.borrow_and_update().status, CellStatus::Cancelled);
        assert!(matches!(cell.run().await, Err(ControllerError::Stopped)));
    }

    #[tokio::test]
    async fn test_eager_init_warms_engine() {
        let settings = RunnerSettings {
            eager_init: true,
            ..Default::default()
        };
        let cell = CellController::spawn(
            "cell",
            "print('warm')",
            Arc::new(ThreadEngineFactory),
            settings,
        );
        let state = run_to_end(&cell).await;
        assert_eq!(state.status, CellStatus::Complete);
        assert_eq!(state.text_of(LineStream::Stdout), "warm\n");
    }

    #[tokio::test]
    async fn test_snapshot_serializes_for_readers() {
        let cell = thread_cell("print('x')");
        run_to_end(&cell).await;
        let json = serde_json::to_value(cell.snapshot()).unwrap();
        assert_eq!(json["id"], "cell");
        assert_eq!(json["status"], "complete");
        assert_eq!(json["output"][0]["stream"], "stdout");
        assert_eq!(json["output"][0]["text"], "x\n");
    }
}
