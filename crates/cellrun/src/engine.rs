//! Execution engine: one interpreter session plus output capture.
//!
//! The engine is synchronous. It runs on whatever thread hosts it (a
//! dedicated thread for the thread backend, the worker process's engine
//! thread for the process backend) and reports streamed output through a
//! caller-supplied sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cellrun_protocol::{
    ExecutionResult, ExecutionStatus, InterruptBuffer, OutputChunk, RequestId, Stream,
    INTERRUPT_MARKER,
};
use log::{debug, info};
use minipy::{Exception, Host, Interpreter, OutputStream};

use crate::error::CellError;

/// Largest text carried by one output chunk; longer writes are split.
pub const CHUNK_LIMIT: usize = 1024 * 1024;

/// Each stream's text in a result stops growing at this size. Chunks still
/// carry everything, so a result frame stays far below the frame limit.
pub const RESULT_TEXT_LIMIT: usize = 4 * 1024 * 1024;

pub struct ExecutionEngine {
    interpreter: Option<Interpreter>,
    interrupt: Option<InterruptBuffer>,
    teardown: Arc<AtomicBool>,
}

impl ExecutionEngine {
    /// `teardown` is checked at every checkpoint; once set, running code
    /// stops as if interrupted.
    pub fn new(teardown: Arc<AtomicBool>) -> Self {
        Self {
            interpreter: None,
            interrupt: None,
            teardown,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.interpreter.is_some()
    }

    /// Boot a fresh interpreter session and run the optional startup code.
    pub fn initialize(&mut self, startup_code: Option<&str>) -> Result<(), CellError> {
        let mut interpreter = Interpreter::new();
        if let Some(code) = startup_code {
            let mut discard = |chunk: OutputChunk| {
                debug!("[engine] startup {}: {:?}", chunk.stream, chunk.text);
            };
            let mut host = CaptureHost::new(&mut discard, self.interrupt.as_ref(), &self.teardown);
            interpreter
                .run(code, &mut host)
                .map_err(|e| CellError::Initialization(format!("startup code raised {}", e)))?;
        }
        self.interpreter = Some(interpreter);
        info!("[engine] interpreter session ready");
        Ok(())
    }

    pub fn set_interrupt_buffer(&mut self, buffer: InterruptBuffer) {
        self.interrupt = Some(buffer);
    }

    /// Run `source` in the session's globals.
    ///
    /// Output is streamed through `sink` as it is produced; the returned
    /// result carries the text of both streams up to [`RESULT_TEXT_LIMIT`].
    pub fn execute(
        &mut self,
        id: RequestId,
        source: &str,
        sink: &mut dyn FnMut(OutputChunk),
    ) -> Result<ExecutionResult, CellError> {
        let interpreter = self.interpreter.as_mut().ok_or(CellError::EngineNotReady)?;
        let mut host = CaptureHost::new(sink, self.interrupt.as_ref(), &self.teardown);

        let status = match interpreter.run(source, &mut host) {
            Ok(()) => ExecutionStatus::Ok,
            Err(e) if e.is_interrupt() => ExecutionStatus::Interrupted,
            Err(e) => {
                host.write(OutputStream::Stderr, &e.format_traceback());
                ExecutionStatus::Error
            }
        };
        host.flush();

        let CaptureHost {
            stdout, mut stderr, ..
        } = host;
        if status == ExecutionStatus::Interrupted {
            stderr.push_str(INTERRUPT_MARKER);
            stderr.push('\n');
        }
        debug!("[engine] request {} finished: {:?}", id, status);

        Ok(ExecutionResult {
            id,
            status,
            stdout,
            stderr,
        })
    }
}

/// Collects a run's output, coalescing consecutive writes to one stream
/// into a single pending chunk that is flushed at each checkpoint.
struct CaptureHost<'a> {
    stdout: String,
    stderr: String,
    pending: Option<OutputChunk>,
    sink: &'a mut dyn FnMut(OutputChunk),
    interrupt: Option<&'a InterruptBuffer>,
    teardown: &'a AtomicBool,
}

impl<'a> CaptureHost<'a> {
    fn new(
        sink: &'a mut dyn FnMut(OutputChunk),
        interrupt: Option<&'a InterruptBuffer>,
        teardown: &'a AtomicBool,
    ) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            pending: None,
            sink,
            interrupt,
            teardown,
        }
    }

    fn flush(&mut self) {
        if let Some(chunk) = self.pending.take() {
            (self.sink)(chunk);
        }
    }
}

impl Host for CaptureHost<'_> {
    fn write(&mut self, stream: OutputStream, text: &str) {
        if text.is_empty() {
            return;
        }
        let stream = match stream {
            OutputStream::Stdout => Stream::Stdout,
            OutputStream::Stderr => Stream::Stderr,
        };
        match stream {
            Stream::Stdout => push_capped(&mut self.stdout, text, RESULT_TEXT_LIMIT),
            Stream::Stderr => push_capped(&mut self.stderr, text, RESULT_TEXT_LIMIT),
        }
        if !matches!(&self.pending, Some(chunk) if chunk.stream == stream) {
            self.flush();
        }

        let mut rest = text;
        loop {
            let pending = self.pending.get_or_insert_with(|| OutputChunk {
                stream,
                text: String::new(),
            });
            let room = CHUNK_LIMIT.saturating_sub(pending.text.len());
            if rest.len() <= room {
                pending.text.push_str(rest);
                return;
            }
            let cut = floor_char_boundary(rest, room);
            pending.text.push_str(&rest[..cut]);
            rest = &rest[cut..];
            self.flush();
        }
    }

    fn checkpoint(&mut self) -> Result<(), Exception> {
        self.flush();
        if self.teardown.load(Ordering::SeqCst) {
            return Err(Exception::interrupt());
        }
        if self.interrupt.is_some_and(InterruptBuffer::take) {
            return Err(Exception::interrupt());
        }
        Ok(())
    }
}

/// Append as much of `text` as fits within `limit` bytes.
fn push_capped(buf: &mut String, text: &str, limit: usize) {
    let room = limit.saturating_sub(buf.len());
    buf.push_str(&text[..floor_char_boundary(text, room)]);
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ExecutionEngine {
        let mut engine = ExecutionEngine::new(Arc::new(AtomicBool::new(false)));
        engine.initialize(None).unwrap();
        engine
    }

    fn run(engine: &mut ExecutionEngine, source: &str) -> (ExecutionResult, Vec<OutputChunk>) {
        let mut chunks = Vec::new();
        let result = engine
            .execute(RequestId::new(), source, &mut |c| chunks.push(c))
            .unwrap();
        (result, chunks)
    }

    #[test]
    fn test_print_hello() {
        let (result, chunks) = run(&mut engine(), "print(\"hello\")");
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert_eq!(chunks, vec![OutputChunk::stdout("hello\n")]);
    }

    #[test]
    fn test_error_has_traceback_and_keeps_stdout() {
        let (result, chunks) = run(&mut engine(), "print('before')\n1/0");
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.stdout, "before\n");
        assert!(result.stderr.starts_with("Traceback (most recent call last):"));
        assert!(result
            .stderr
            .contains("ZeroDivisionError: division by zero"));
        let streamed: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(streamed, format!("{}{}", result.stdout, result.stderr));
    }

    #[test]
    fn test_chunks_follow_statements_and_streams() {
        let source = "import sys\nprint('a')\nprint('b', end='')\nprint('!', file=sys.stderr)\nprint('c')";
        let (_, chunks) = run(&mut engine(), source);
        assert_eq!(
            chunks,
            vec![
                OutputChunk::stdout("a\n"),
                OutputChunk::stdout("b"),
                OutputChunk::stderr("!\n"),
                OutputChunk::stdout("c\n"),
            ]
        );
    }

    #[test]
    fn test_same_statement_writes_coalesce() {
        let (_, chunks) = run(&mut engine(), "for i in range(3): print(i, end=' ')");
        // each loop iteration is a checkpoint, so each print is its own chunk
        assert_eq!(chunks.len(), 3);
        let (_, chunks) = run(&mut engine(), "import sys\nsys.stdout.write('x') + sys.stdout.write('y')");
        assert_eq!(chunks, vec![OutputChunk::stdout("xy")]);
    }

    #[test]
    fn test_interrupt_appends_marker_without_streaming_it() {
        let mut engine = engine();
        let buffer = InterruptBuffer::new();
        engine.set_interrupt_buffer(buffer.clone());
        buffer.trigger();

        let (result, chunks) = run(&mut engine, "while True: pass");
        assert_eq!(result.status, ExecutionStatus::Interrupted);
        assert_eq!(result.stderr, format!("{}\n", INTERRUPT_MARKER));
        assert!(chunks.is_empty());
        assert!(!buffer.is_set());
    }

    #[test]
    fn test_large_writes_are_split_into_bounded_chunks() {
        let (result, chunks) = run(&mut engine(), "print('x' * 2500000)");
        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.text.len() <= CHUNK_LIMIT));
        let streamed: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(streamed.len(), 2_500_001);
        assert!(streamed.ends_with("x\n"));
    }

    #[test]
    fn test_result_text_is_capped_but_chunks_are_not() {
        let source = format!("print('y' * {})", RESULT_TEXT_LIMIT + 10);
        let (result, chunks) = run(&mut engine(), &source);
        assert_eq!(result.stdout.len(), RESULT_TEXT_LIMIT);
        let streamed: usize = chunks.iter().map(|c| c.text.len()).sum();
        assert_eq!(streamed, RESULT_TEXT_LIMIT + 11);
    }

    #[test]
    fn test_splitting_respects_char_boundaries() {
        let mut buf = String::from("ab");
        push_capped(&mut buf, "\u{e9}\u{e9}", 5);
        assert_eq!(buf, "ab\u{e9}");
        assert_eq!(floor_char_boundary("\u{1f600}x", 3), 0);
        assert_eq!(floor_char_boundary("abc", 10), 3);
    }

    #[test]
    fn test_globals_persist_and_buffers_reset() {
        let mut engine = engine();
        let (first, _) = run(&mut engine, "x = 2\nprint(x)");
        let (second, _) = run(&mut engine, "print(x * 21)");
        assert_eq!(first.stdout, "2\n");
        assert_eq!(second.stdout, "42\n");
    }

    #[test]
    fn test_teardown_stops_at_next_checkpoint() {
        let teardown = Arc::new(AtomicBool::new(false));
        let mut engine = ExecutionEngine::new(teardown.clone());
        engine.initialize(None).unwrap();
        teardown.store(true, Ordering::SeqCst);
        let (result, _) = run(&mut engine, "loop_forever()");
        assert_eq!(result.status, ExecutionStatus::Interrupted);
    }

    #[test]
    fn test_startup_code_failure() {
        let mut engine = ExecutionEngine::new(Arc::new(AtomicBool::new(false)));
        let err = engine.initialize(Some("import numpy")).unwrap_err();
        assert!(matches!(err, CellError::Initialization(msg) if msg.contains("ModuleNotFoundError")));
        assert!(!engine.is_initialized());
    }

    #[test]
    fn test_startup_code_defines_globals() {
        let mut engine = ExecutionEngine::new(Arc::new(AtomicBool::new(false)));
        engine.initialize(Some("greeting = 'hi'")).unwrap();
        let (result, _) = run(&mut engine, "print(greeting)");
        assert_eq!(result.stdout, "hi\n");
    }

    #[test]
    fn test_execute_before_initialize() {
        let mut engine = ExecutionEngine::new(Arc::new(AtomicBool::new(false)));
        let err = engine
            .execute(RequestId::new(), "print(1)", &mut |_| {})
            .unwrap_err();
        assert_eq!(err, CellError::EngineNotReady);
    }
}
