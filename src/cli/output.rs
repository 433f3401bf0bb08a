// Output formatting and display for CLI

use crate::daemon::DaemonStage;
use crate::error::{DaemonError, Result};
use colored::*;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Print the launch confirmation from the launching process
pub fn print_launched(program: &str) {
    println!("{}", "✓ Daemon launched".green().bold());
    println!("  {}: {}", "Program".bold(), program.cyan());
}

/// Print the current stage
pub fn print_stage(stage: DaemonStage) {
    println!("{} {}", "Stage:".bold(), format_stage_colored(stage));
}

/// Format a stage with color coding
fn format_stage_colored(stage: DaemonStage) -> String {
    match stage {
        DaemonStage::Parent => stage.to_string().blue().to_string(),
        DaemonStage::Child => stage.to_string().yellow().to_string(),
        DaemonStage::Daemon => stage.to_string().green().to_string(),
        DaemonStage::Unknown => stage.to_string().red().bold().to_string(),
    }
}

/// The line a stage leaves in the trace file, e.g. `stage 1` or `exit 0`
pub fn trace_line(event: &str, stage: DaemonStage) -> String {
    match stage.index() {
        Some(index) => format!("{} {}", event, index),
        None => format!("{} unknown", event),
    }
}

/// Append an event line to the trace file
pub fn append_trace(path: &Path, event: &str, stage: DaemonStage) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            DaemonError::Other(format!(
                "Failed to open trace file {}: {}",
                path.display(),
                e
            ))
        })?;
    writeln!(file, "{}", trace_line(event, stage))?;
    Ok(())
}
