// State report written by the demo daemon once it is running

use crate::daemon::{DaemonStage, NamedFile};
use crate::error::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Prefix shared by every variable the daemonizer writes
pub const DAEMON_VAR_PREFIX: &str = "__DAEMON_";

/// One preserved descriptor as the daemon sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotReport {
    pub fd: i32,
    /// Name recorded by the launching process
    pub name: PathBuf,
    /// What the descriptor actually points at, when the OS can tell
    pub path: Option<PathBuf>,
}

/// Snapshot of the daemon right after `make_daemon` returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonReport {
    pub stage: String,
    pub pid: u32,
    pub session_id: i32,
    pub working_dir: Option<PathBuf>,
    /// Daemonizer variables still present in the environment
    pub leftover_vars: BTreeMap<String, String>,
    pub files: Vec<SlotReport>,
    pub captured_stdout: Option<String>,
    pub captured_stderr: Option<String>,
}

impl DaemonReport {
    pub fn collect(stage: DaemonStage, files: &[NamedFile]) -> Self {
        let session_id = nix::unistd::getsid(None)
            .map(|pid| pid.as_raw())
            .unwrap_or(-1);

        let leftover_vars = std::env::vars_os()
            .filter(|(key, _)| key.as_bytes().starts_with(DAEMON_VAR_PREFIX.as_bytes()))
            .map(|(key, value)| {
                (
                    key.to_string_lossy().into_owned(),
                    value.to_string_lossy().into_owned(),
                )
            })
            .collect();

        let files = files
            .iter()
            .map(|named| {
                let fd = named.as_raw_fd();
                SlotReport {
                    fd,
                    name: named.name.clone(),
                    path: std::fs::read_link(format!("/proc/self/fd/{}", fd)).ok(),
                }
            })
            .collect();

        Self {
            stage: stage.to_string(),
            pid: std::process::id(),
            session_id,
            working_dir: std::env::current_dir().ok(),
            leftover_vars,
            files,
            captured_stdout: None,
            captured_stderr: None,
        }
    }

    /// Write the report as JSON. The file appears in one piece.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DaemonError::Other(format!("Failed to serialize report: {}", e)))?;
        let partial = path.with_extension("partial");
        std::fs::write(&partial, json)?;
        std::fs::rename(&partial, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| DaemonError::Other(format!("Failed to parse report: {}", e)))
    }
}
