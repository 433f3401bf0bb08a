// Relauncher: start the next stage from the same executable

use super::stage::{DaemonStage, StageCodec};
use crate::config::ExitHook;
use crate::error::{DaemonError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::{dup2, setsid};
use std::convert::Infallible;
use std::ffi::{OsStr, OsString};
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

/// The descriptors the next process image starts with. Entry `n` becomes
/// descriptor `n` in the child.
#[derive(Debug)]
pub struct DescriptorTable<'a> {
    fds: Vec<BorrowedFd<'a>>,
}

impl<'a> DescriptorTable<'a> {
    /// Start a table with descriptors 0, 1 and 2.
    pub fn with_stdio(stdin: BorrowedFd<'a>, stdout: BorrowedFd<'a>, stderr: BorrowedFd<'a>) -> Self {
        Self {
            fds: vec![stdin, stdout, stderr],
        }
    }

    /// Append a descriptor and return the number it gets in the child.
    pub fn push(&mut self, fd: BorrowedFd<'a>) -> RawFd {
        self.fds.push(fd);
        (self.fds.len() - 1) as RawFd
    }

    /// Number of descriptors the child starts with
    pub(crate) fn len(&self) -> usize {
        self.fds.len()
    }

    /// Occupy every free descriptor below the table's end with a
    /// close-on-exec placeholder.
    ///
    /// `Command::spawn` opens its exec-error pipe before forking. Left free,
    /// a low descriptor could take that pipe and the `dup2` loop would
    /// overwrite it, hiding a failed exec.
    fn fill_holes(&self) -> Result<Vec<OwnedFd>> {
        let filler = self.fds[0].as_raw_fd();
        let mut placeholders = Vec::new();
        for fd in 0..self.len() as RawFd {
            match fcntl(fd, FcntlArg::F_GETFD) {
                Ok(_) => continue,
                Err(Errno::EBADF) => {}
                Err(e) => return Err(DaemonError::syscall("fcntl(F_GETFD)", e)),
            }
            let dup = fcntl(filler, FcntlArg::F_DUPFD_CLOEXEC(fd))
                .map_err(|e| DaemonError::syscall("fcntl(F_DUPFD_CLOEXEC)", e))?;
            // SAFETY: fcntl just returned this descriptor to us
            placeholders.push(unsafe { OwnedFd::from_raw_fd(dup) });
        }
        Ok(placeholders)
    }

    /// Duplicate every entry above the table's range, close-on-exec.
    ///
    /// The child then moves them into place with `dup2` without one entry
    /// clobbering the source of another.
    fn duplicate_above(&self) -> Result<Vec<OwnedFd>> {
        let floor = self.len() as RawFd;
        self.fds
            .iter()
            .map(|fd| {
                let dup = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(floor))
                    .map_err(|e| DaemonError::syscall("fcntl(F_DUPFD_CLOEXEC)", e))?;
                // SAFETY: fcntl just returned this descriptor to us
                Ok(unsafe { OwnedFd::from_raw_fd(dup) })
            })
            .collect()
    }
}

/// Absolute path of the running binary
pub fn current_executable() -> Result<PathBuf> {
    let path = std::env::current_exe().map_err(|e| DaemonError::Executable(e.to_string()))?;
    if path.as_os_str().is_empty() {
        return Err(DaemonError::Executable("empty path".to_string()));
    }
    Ok(path)
}

/// Start `executable` with exactly the descriptors in `table`.
///
/// The child inherits the working directory and the full current
/// environment. With `new_session` it becomes a session leader detached
/// from the controlling terminal.
pub fn spawn_image(
    executable: &Path,
    arg0: &OsStr,
    args: &[OsString],
    table: &DescriptorTable<'_>,
    new_session: bool,
) -> Result<Child> {
    let placeholders = table.fill_holes()?;
    let sources = table.duplicate_above()?;
    let raw: Vec<RawFd> = sources.iter().map(|fd| fd.as_raw_fd()).collect();

    let mut command = Command::new(executable);
    command.arg0(arg0).args(args);
    if let Ok(dir) = std::env::current_dir() {
        command.current_dir(dir);
    }

    // SAFETY: only setsid and dup2 run between fork and exec
    unsafe {
        command.pre_exec(move || {
            if new_session {
                setsid()?;
            }
            for (slot, &source) in raw.iter().enumerate() {
                dup2(source, slot as RawFd)?;
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|source| DaemonError::SpawnError {
        program: executable.display().to_string(),
        source,
    })?;
    drop(sources);
    drop(placeholders);
    Ok(child)
}

/// Advance to the next stage and replace this process with it.
///
/// Only returns on failure. After the child is started, the exit hook runs
/// and the process exits with status 0.
pub fn relaunch(
    stage: u32,
    codec: &StageCodec,
    original: &OsStr,
    program_name: Option<&OsStr>,
    on_exit: Option<ExitHook>,
    table: &DescriptorTable<'_>,
) -> Result<Infallible> {
    let executable = current_executable()?;

    codec.write_next(stage, original)?;

    let mut argv = std::env::args_os();
    let inherited_arg0 = argv.next();
    let args: Vec<OsString> = argv.collect();
    let arg0 = program_name
        .map(OsStr::to_os_string)
        .or(inherited_arg0)
        .unwrap_or_else(|| executable.clone().into_os_string());

    let child = spawn_image(&executable, &arg0, &args, table, stage == 0)?;
    tracing::info!(
        stage,
        pid = child.id(),
        executable = %executable.display(),
        "Relaunched into next daemon stage"
    );
    // fire and forget: the child is never waited on
    drop(child);

    if let Some(hook) = on_exit {
        hook(DaemonStage::from_index(stage))
            .map_err(|e| DaemonError::ExitHook(e.to_string()))?;
    }
    std::process::exit(0);
}
