// CLI module - demo front end for the daemonizer

mod output;
pub mod report;

use crate::config::{DaemonSettings, FileMode, FileSpec};
use crate::daemon::{make_daemon, stage, DaemonStage, Daemonized};
use crate::error::{DaemonError, Result};
use clap::{Parser, Subcommand};
use report::DaemonReport;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// How long the daemon waits for its own captured output
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// staged-daemon - detach a program into the background by re-executing it
#[derive(Parser)]
#[command(name = "staged-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detach into the background and run the demo daemon
    Start {
        /// Hand the daemon's stdout/stderr back to it as pipes
        #[arg(long)]
        capture: bool,

        /// Redirect stdout and stderr to this file
        #[arg(long)]
        stdout: Option<PathBuf>,

        /// Keep this file open in the daemon (repeatable)
        #[arg(short, long = "keep")]
        keep: Vec<PathBuf>,

        /// Load daemonization settings from a TOML or JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Program name the later stages run under
        #[arg(short, long)]
        name: Option<String>,

        /// Append one line per stage to this file
        #[arg(long)]
        trace: Option<PathBuf>,

        /// Write a JSON report from the daemon to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print which daemonization stage this process is in
    Stage,
}

impl Cli {
    /// Run the CLI application
    pub fn run() -> Result<()> {
        init_logging();
        let cli = Cli::parse();
        cli.execute()
    }

    fn execute(self) -> Result<()> {
        match self.command {
            Commands::Start {
                capture,
                stdout,
                keep,
                config,
                name,
                trace,
                report,
            } => {
                let mut settings = match config {
                    Some(path) => DaemonSettings::from_file(&path)?,
                    None => DaemonSettings::default(),
                };
                settings.capture_output |= capture;
                if stdout.is_some() {
                    settings.stdout = stdout;
                }
                if name.is_some() {
                    settings.program_name = name;
                }
                settings.files.extend(keep.into_iter().map(|path| FileSpec {
                    path,
                    mode: FileMode::Append,
                }));
                settings.validate()?;

                start(settings, trace, report)
            }

            Commands::Stage => {
                output::print_stage(stage());
                Ok(())
            }
        }
    }
}

/// Install the stderr subscriber, filtered by `RUST_LOG`
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn start(settings: DaemonSettings, trace: Option<PathBuf>, report: Option<PathBuf>) -> Result<()> {
    let program = settings
        .program_name
        .clone()
        .unwrap_or_else(|| "staged-daemon".to_string());

    if let Some(ref path) = trace {
        output::append_trace(path, "stage", stage())?;
    }

    let config = settings.into_config(stage())?.on_exit(move |exiting| {
        if let Some(ref path) = trace {
            output::append_trace(path, "exit", exiting)?;
        }
        if exiting == DaemonStage::Parent {
            output::print_launched(&program);
        }
        Ok(())
    });

    let daemonized = make_daemon(config)?;
    run_daemon(daemonized, report.as_deref())
}

/// The daemon's own work: read back captured output and write the report.
fn run_daemon(daemonized: Daemonized, report_path: Option<&Path>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let Daemonized {
        stdout,
        stderr,
        files,
    } = daemonized;

    let mut report = DaemonReport::collect(stage(), &files);

    if let (Some(stdout_pipe), Some(stderr_pipe)) = (stdout, stderr) {
        println!("captured stdout");
        std::io::stdout().flush()?;
        eprintln!("captured stderr");

        report.captured_stdout = Some(runtime.block_on(read_captured_line(stdout_pipe))?);
        report.captured_stderr = Some(runtime.block_on(read_captured_line(stderr_pipe))?);
    }

    if let Some(path) = report_path {
        report.write(path)?;
    }
    tracing::info!(pid = report.pid, "Daemon finished");
    Ok(())
}

async fn read_captured_line(pipe: File) -> Result<String> {
    let mut reader = BufReader::new(tokio::fs::File::from_std(pipe));
    let mut line = String::new();
    tokio::time::timeout(CAPTURE_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| DaemonError::Other("Timed out reading captured output".to_string()))??;
    Ok(line.trim_end().to_string())
}
