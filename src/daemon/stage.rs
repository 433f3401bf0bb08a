// Stage codec: which hop of the daemonization ladder this process is on

use super::env;
use crate::error::Result;
use sha1::{Digest, Sha1};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::OnceLock;

/// Variable carrying the stage tag and the pre-daemonization value
pub const STAGE_VAR: &str = "__DAEMON_STAGE";

/// Where the calling process is in the daemonization ladder. See [`stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonStage {
    /// Original process
    Parent,
    /// `make_daemon` called once: first child, session leader
    Child,
    /// `make_daemon` run twice: final daemon
    Daemon,
    /// Anything the ladder never produces
    Unknown,
}

impl DaemonStage {
    /// Map a decoded stage number to its named stage.
    pub fn from_index(index: u32) -> Self {
        match index {
            0 => DaemonStage::Parent,
            1 => DaemonStage::Child,
            2 => DaemonStage::Daemon,
            _ => DaemonStage::Unknown,
        }
    }

    pub fn index(self) -> Option<u32> {
        match self {
            DaemonStage::Parent => Some(0),
            DaemonStage::Child => Some(1),
            DaemonStage::Daemon => Some(2),
            DaemonStage::Unknown => None,
        }
    }
}

impl fmt::Display for DaemonStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonStage::Parent => "parent",
            DaemonStage::Child => "first child",
            DaemonStage::Daemon => "daemon",
            DaemonStage::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

static CURRENT_STAGE: OnceLock<DaemonStage> = OnceLock::new();

/// Report the stage of the calling process.
///
/// Computed from the environment on first use and cached for the life of
/// the process, so the daemon keeps answering [`DaemonStage::Daemon`] after
/// `make_daemon` has restored the environment.
pub fn stage() -> DaemonStage {
    *CURRENT_STAGE.get_or_init(|| DaemonStage::from_index(StageCodec::default().read().0))
}

/// Record the stage once it is known. The first value wins.
pub(crate) fn cache_stage(stage: DaemonStage) {
    let _ = CURRENT_STAGE.set(stage);
}

/// Reads and writes the stage variable.
///
/// The value has the shape `<stage>/<nonce>/<sha1>:<original>`. The digest
/// covers `<stage>/<nonce>/` and is only there to recognise our own values;
/// anything that fails the check is treated as a foreign original.
#[derive(Debug, Clone)]
pub struct StageCodec {
    var: String,
}

impl Default for StageCodec {
    fn default() -> Self {
        Self::with_var(STAGE_VAR)
    }
}

impl StageCodec {
    /// Use a variable other than [`STAGE_VAR`].
    pub fn with_var(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }

    /// Current stage and the value the variable had before we touched it.
    ///
    /// Never fails: a missing or foreign value means stage 0.
    pub fn read(&self) -> (u32, OsString) {
        let (stage, original) = decode(&env::get_var(&self.var));
        tracing::debug!(var = %self.var, stage, "Decoded daemon stage");
        (stage, original)
    }

    /// Tag the environment with `stage + 1`, keeping `original` chained behind it.
    pub fn write_next(&self, stage: u32, original: &OsStr) -> Result<()> {
        let nonce = chrono::Utc::now().timestamp_subsec_nanos();
        env::set_var(&self.var, &encode(stage.saturating_add(1), nonce, original))
    }

    /// Put the variable back to its pre-daemonization value.
    pub fn restore(&self, original: &OsStr) -> Result<()> {
        env::restore_var(&self.var, original)
    }
}

fn tag_digest(prefix: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(prefix.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build a stage value for `stage` with the given nonce.
pub fn encode(stage: u32, nonce: u32, original: &OsStr) -> OsString {
    let prefix = format!("{}/{:09}/", stage, nonce);
    let mut value = format!("{}{}:", prefix, tag_digest(&prefix)).into_bytes();
    value.extend_from_slice(original.as_bytes());
    OsString::from_vec(value)
}

/// Split a stage value into the stage number and the chained original.
pub fn decode(value: &OsStr) -> (u32, OsString) {
    let bytes = value.as_bytes();
    let (tag, original) = match bytes.iter().position(|&b| b == b':') {
        Some(sep) => (&bytes[..sep], &bytes[sep + 1..]),
        None => (bytes, &[][..]),
    };

    let foreign = || (0, value.to_os_string());

    let Ok(tag) = std::str::from_utf8(tag) else {
        return foreign();
    };
    let mut parts = tag.splitn(3, '/');
    let (Some(stage), Some(nonce), Some(check)) = (parts.next(), parts.next(), parts.next())
    else {
        return foreign();
    };

    if check != tag_digest(&format!("{}/{}/", stage, nonce)) {
        return foreign();
    }
    match stage.parse::<u32>() {
        Ok(stage) => (stage, OsString::from_vec(original.to_vec())),
        Err(_) => foreign(),
    }
}
