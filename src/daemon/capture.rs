// Output capture: pipes that become the daemon's stdout and stderr

use crate::error::{DaemonError, Result};
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

/// One pipe per stream. The write ends go to descriptors 1 and 2 of the
/// next process image; the read ends go to the two slots right after the
/// caller's files.
#[derive(Debug)]
pub struct CapturePipes {
    pub stdout_read: File,
    pub stdout_write: File,
    pub stderr_read: File,
    pub stderr_write: File,
}

impl CapturePipes {
    pub fn new() -> Result<Self> {
        let (stdout_read, stdout_write) = pipe()?;
        let (stderr_read, stderr_write) = pipe()?;
        Ok(Self {
            stdout_read,
            stdout_write,
            stderr_read,
            stderr_write,
        })
    }
}

fn pipe() -> Result<(File, File)> {
    let (read, write) = nix::unistd::pipe().map_err(|e| DaemonError::syscall("pipe", e))?;
    for end in [&read, &write] {
        fcntl(end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| DaemonError::syscall("fcntl(F_SETFD)", e))?;
    }
    Ok((File::from(read), File::from(write)))
}

/// Descriptors the read ends occupy when `file_count` slots (stdio included)
/// precede them.
pub fn reserved_slots(file_count: usize) -> (RawFd, RawFd) {
    let first = file_count as RawFd;
    (first, first + 1)
}
