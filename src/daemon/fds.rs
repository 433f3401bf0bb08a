// Descriptor registry: names of files kept open across re-exec

use super::env;
use crate::error::{DaemonError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Prefix of the per-descriptor variables, followed by the descriptor number
pub const FD_VAR_PREFIX: &str = "__DAEMON_FD_";

/// An open file together with the name it was opened under
#[derive(Debug)]
pub struct NamedFile {
    pub name: PathBuf,
    pub file: File,
}

impl NamedFile {
    pub fn new<P: Into<PathBuf>>(name: P, file: File) -> Self {
        Self {
            name: name.into(),
            file,
        }
    }

    /// Open `path` with `options` and remember the path as the name.
    pub fn open_with<P: AsRef<Path>>(path: P, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = options.open(path)?;
        Ok(Self::new(path, file))
    }

    /// Open `path` for appending, creating it if needed.
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, OpenOptions::new().create(true).append(true))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Records per-slot file names in the environment.
///
/// Each value is `<hex name>:<previous value>`, so nested saves chain the
/// same way the stage variable does and [`FdRegistry::unwind`] can pop them.
#[derive(Debug, Clone)]
pub struct FdRegistry {
    prefix: String,
}

impl Default for FdRegistry {
    fn default() -> Self {
        Self::with_prefix(FD_VAR_PREFIX)
    }
}

impl FdRegistry {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Variable name for descriptor `fd`
    pub fn var(&self, fd: RawFd) -> String {
        format!("{}{}", self.prefix, fd)
    }

    pub fn save(&self, fd: RawFd, name: &Path) -> Result<()> {
        let var = self.var(fd);
        let value = encode_link(name, &env::get_var(&var));
        env::set_var(&var, &value)?;
        tracing::debug!(fd, name = %name.display(), "Saved descriptor slot");
        Ok(())
    }

    /// Name recorded for `fd`. A malformed value is an integrity error.
    pub fn load(&self, fd: RawFd) -> Result<PathBuf> {
        let var = self.var(fd);
        decode_link(&env::get_var(&var))
            .map(|(name, _)| name)
            .map_err(|reason| DaemonError::CorruptVariable { var, reason })
    }

    /// Drop the newest link, leaving whatever the variable held before.
    pub fn unwind(&self, fd: RawFd) -> Result<()> {
        let var = self.var(fd);
        match decode_link(&env::get_var(&var)) {
            Ok((_, previous)) => {
                tracing::debug!(fd, "Unwound descriptor slot");
                env::restore_var(&var, &previous)
            }
            Err(reason) => Err(DaemonError::CorruptVariable { var, reason }),
        }
    }
}

/// Chain `name` in front of `previous`.
pub fn encode_link(name: &Path, previous: &OsStr) -> OsString {
    let mut value = hex::encode(name.as_os_str().as_bytes()).into_bytes();
    value.push(b':');
    value.extend_from_slice(previous.as_bytes());
    OsString::from_vec(value)
}

/// Split a slot value into the recorded name and the previous value.
pub fn decode_link(value: &OsStr) -> std::result::Result<(PathBuf, OsString), String> {
    let bytes = value.as_bytes();
    let sep = bytes
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| "missing ':' separator".to_string())?;
    let name = hex::decode(&bytes[..sep]).map_err(|e| format!("invalid hex name: {}", e))?;
    Ok((
        PathBuf::from(OsString::from_vec(name)),
        OsString::from_vec(bytes[sep + 1..].to_vec()),
    ))
}

/// Take ownership of a descriptor inherited from the previous stage.
///
/// The descriptor is marked close-on-exec so that only the next descriptor
/// table decides what the following stage sees.
pub fn inherit(fd: RawFd) -> Result<File> {
    fcntl(fd, FcntlArg::F_GETFD).map_err(|e| DaemonError::syscall("fcntl(F_GETFD)", e))?;
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| DaemonError::syscall("fcntl(F_SETFD)", e))?;
    // SAFETY: the descriptor is open and nothing else in this process owns it
    Ok(unsafe { File::from_raw_fd(fd) })
}
