//! cellrun CLI entry point.
//!
//! `cellrun run` executes a script cell by cell; `cellrun worker` is the
//! engine process spawned by the process backend and is not meant to be
//! started by hand.

use std::path::{Path, PathBuf};

use anyhow::Context;
use cellrun::settings::{load_settings, settings_path, settings_schema};
use cellrun::{
    split_cells, CellStatus, EngineBackend, LineStream, Notebook, OutputLine, RunnerSettings,
};
use clap::{Parser, Subcommand};
use log::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cellrun")]
#[command(about = "Run notebook code cells in isolated, cancellable engines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a script, one cell per `# %%` section
    Run {
        /// Script to execute
        file: PathBuf,

        /// Engine backend (thread or process)
        #[arg(long)]
        backend: Option<EngineBackend>,

        /// Restart the engine on cancel instead of interrupting it
        #[arg(long)]
        no_shared_interrupt: bool,

        /// Settings file (default: the user config directory)
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Show the effective settings
    Settings {
        /// Print the JSON Schema of the settings file instead
        #[arg(long)]
        schema: bool,

        /// Settings file (default: the user config directory)
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Serve one execution engine over stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr, which keeps a worker's stdout free for frames
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Run {
            file,
            backend,
            no_shared_interrupt,
            settings,
        } => {
            let mut runner_settings = load_settings(&settings.unwrap_or_else(settings_path));
            if let Some(backend) = backend {
                runner_settings.backend = backend;
            }
            if no_shared_interrupt {
                runner_settings.shared_interrupt = false;
            }
            let ok = run_script(&file, runner_settings).await?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Settings { schema, settings } => {
            if schema {
                println!("{}", settings_schema()?);
            } else {
                let path = settings.unwrap_or_else(settings_path);
                let current = load_settings(&path);
                println!("# {}", path.display());
                println!("{}", serde_json::to_string_pretty(&current)?);
            }
            Ok(())
        }
        Commands::Worker => {
            let result = cellrun::worker::run_stdio_worker().await;
            if let Err(e) = &result {
                log::error!("[worker] {:#}", e);
            }
            // The runtime would otherwise wait on the blocking stdin read
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
    }
}

/// Run every cell of the script in order, stopping at the first cell that
/// does not complete. Ctrl-C cancels the cell in flight.
async fn run_script(file: &Path, settings: RunnerSettings) -> anyhow::Result<bool> {
    let script = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let cells = split_cells(&script);
    info!(
        "Running {} cell(s) from {} on the {} backend",
        cells.len(),
        file.display(),
        settings.backend
    );

    let mut notebook = Notebook::new(settings)?;
    if !notebook.immediate_cancellation_available() {
        info!("Cancelling a cell restarts its engine");
    }

    let mut ok = true;
    for (index, text) in cells.into_iter().enumerate() {
        let id = format!("cell-{}", index + 1);
        notebook.register_cell(id.clone(), text)?;
        notebook.run(&id).await?;

        let cell = notebook.cell(&id).context("cell disappeared")?;
        let mut rx = cell.subscribe();
        let mut printer = OutputPrinter::default();
        let status = loop {
            // Copy out what is new so the state is not borrowed while printing
            let (fresh, status) = {
                let state = rx.borrow_and_update();
                (printer.take_new(&state.output_lines), state.status)
            };
            print_output(fresh);
            if !status.is_active() {
                break status;
            }
            tokio::select! {
                changed = rx.changed() => changed.context("cell controller stopped")?,
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    warn!("Interrupt received, cancelling {}", id);
                    cell.cancel().await?;
                }
            }
        };
        eprintln!("[{}] {:?}", id, status);

        if status != CellStatus::Complete {
            ok = false;
            break;
        }
    }

    notebook.shutdown().await;
    Ok(ok)
}

/// Tracks how much of a cell's output has been printed. Only the last line
/// can still grow, so everything before it is printed once.
#[derive(Debug, Default)]
struct OutputPrinter {
    line: usize,
    offset: usize,
}

impl OutputPrinter {
    fn take_new(&mut self, lines: &[OutputLine]) -> Vec<(LineStream, String)> {
        let mut fresh = Vec::new();
        while let Some(line) = lines.get(self.line) {
            let text = line.text.get(self.offset..).unwrap_or_default();
            if !text.is_empty() {
                fresh.push((line.stream, text.to_string()));
            }
            if line.text.ends_with('\n') || self.line + 1 < lines.len() {
                self.line += 1;
                self.offset = 0;
            } else {
                self.offset = line.text.len();
                break;
            }
        }
        fresh
    }
}

fn print_output(fresh: Vec<(LineStream, String)>) {
    use std::io::Write;

    for (stream, text) in fresh {
        match stream {
            LineStream::Stdout => print!("{}", text),
            LineStream::Stderr | LineStream::System => eprint!("{}", text),
        }
    }
    let _ = std::io::stdout().flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(stream: LineStream, text: &str) -> OutputLine {
        OutputLine {
            stream,
            text: text.into(),
        }
    }

    #[test]
    fn test_printer_emits_only_new_text() {
        let mut printer = OutputPrinter::default();
        let mut lines = vec![line(LineStream::Stdout, "a\n"), line(LineStream::Stdout, "b")];
        assert_eq!(
            printer.take_new(&lines),
            vec![
                (LineStream::Stdout, "a\n".to_string()),
                (LineStream::Stdout, "b".to_string())
            ]
        );
        assert!(printer.take_new(&lines).is_empty());

        // the partial line grows, then a line from another stream follows
        lines[1].text.push_str("c\n");
        lines.push(line(LineStream::Stderr, "oops\n"));
        assert_eq!(
            printer.take_new(&lines),
            vec![
                (LineStream::Stdout, "c\n".to_string()),
                (LineStream::Stderr, "oops\n".to_string())
            ]
        );
    }

    #[test]
    fn test_printer_moves_past_unfinished_lines() {
        let mut printer = OutputPrinter::default();
        let lines = vec![line(LineStream::Stdout, "x"), line(LineStream::Stderr, "y")];
        assert_eq!(printer.take_new(&lines).len(), 2);
        assert!(printer.take_new(&lines).is_empty());
    }
}
