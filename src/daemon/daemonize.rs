// Daemonization by re-executing the current binary
//
// Parent (0) -> Child (1) -> Daemon (2). Each hop starts a fresh image of
// the same executable and exits; the stage and the preserved descriptors
// travel through the environment and the descriptor table.

use super::capture::{reserved_slots, CapturePipes};
use super::fds::{self, FdRegistry, NamedFile};
use super::relaunch::{relaunch, DescriptorTable};
use super::stage::{cache_stage, DaemonStage, StageCodec};
use crate::config::{DaemonConfig, ExitHook, FileSlot};
use crate::error::{DaemonError, Result};
use nix::sys::stat::{umask, Mode};
use std::convert::Infallible;
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsFd, RawFd};

/// First descriptor used for caller files
const FIRST_FILE_FD: RawFd = 3;

/// What the final daemon gets back from [`make_daemon`]
#[derive(Debug)]
pub struct Daemonized {
    /// Read end of the daemon's stdout, when capturing
    pub stdout: Option<File>,
    /// Read end of the daemon's stderr, when capturing
    pub stderr: Option<File>,
    /// The preserved files, in the order they were declared
    pub files: Vec<NamedFile>,
}

/// Turn the calling process into a detached daemon.
///
/// Must be called early, before any threads are started, with the same
/// number of file slots on every invocation. The launching process and the
/// first child never return on success: they start the next stage and exit.
/// Only the final daemon gets `Ok`.
///
/// Errors in the launching process are returned after the environment is
/// put back. Errors in later stages end the process with status 1, as does
/// a corrupted daemon variable at any stage.
pub fn make_daemon(config: DaemonConfig) -> Result<Daemonized> {
    let codec = StageCodec::default();
    let registry = FdRegistry::default();
    let (stage, original) = codec.read();

    let DaemonConfig {
        program_name,
        capture_output,
        files,
        stdout,
        on_exit,
    } = config;
    let launch = Launch {
        codec: &codec,
        registry: &registry,
        original: &original,
        program_name: program_name.as_deref(),
    };

    let outcome = match stage {
        0 => launch
            .parent(&files, stdout.as_ref(), on_exit)
            .map(|never| match never {}),
        1 => launch
            .child(files.len(), capture_output, on_exit)
            .map(|never| match never {}),
        _ => launch.daemon(stage, files.len(), capture_output),
    };

    outcome.or_else(|err| fail(stage, err))
}

fn fail(stage: u32, err: DaemonError) -> Result<Daemonized> {
    if stage > 0 || err.is_integrity() {
        tracing::error!(stage, error = %err, "Daemonization failed");
        eprintln!("daemonize: {}", err);
        std::process::exit(1);
    }
    Err(err)
}

struct Launch<'a> {
    codec: &'a StageCodec,
    registry: &'a FdRegistry,
    original: &'a OsStr,
    program_name: Option<&'a OsStr>,
}

impl Launch<'_> {
    /// Stage 0: detach into a new session with stdio on /dev/null or the
    /// redirect target.
    fn parent(
        &self,
        files: &[FileSlot],
        redirect: Option<&File>,
        on_exit: Option<ExitHook>,
    ) -> Result<Infallible> {
        let mut saved = Vec::with_capacity(files.len());
        let err = match self.relaunch_parent(files, redirect, on_exit, &mut saved) {
            Ok(never) => match never {},
            Err(err) => err,
        };

        // nothing has been handed over yet, so put the environment back
        for fd in saved.into_iter().rev() {
            if let Err(unwind_err) = self.registry.unwind(fd) {
                tracing::warn!(fd, error = %unwind_err, "Failed to unwind descriptor slot");
            }
        }
        if let Err(restore_err) = self.codec.restore(self.original) {
            tracing::warn!(error = %restore_err, "Failed to restore daemon stage variable");
        }
        Err(err)
    }

    fn relaunch_parent(
        &self,
        files: &[FileSlot],
        redirect: Option<&File>,
        on_exit: Option<ExitHook>,
        saved: &mut Vec<RawFd>,
    ) -> Result<Infallible> {
        let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
        let output = redirect.unwrap_or(&null);

        let mut table = DescriptorTable::with_stdio(null.as_fd(), output.as_fd(), output.as_fd());
        for (index, slot) in files.iter().enumerate() {
            let FileSlot::Open(named) = slot else {
                return Err(DaemonError::MissingFile(index));
            };
            let fd = table.push(named.file.as_fd());
            self.registry.save(fd, &named.name)?;
            saved.push(fd);
        }

        relaunch(0, self.codec, self.original, self.program_name, on_exit, &table)
    }

    /// Stage 1: keep stdio as inherited, pass the files on, and add the
    /// capture pipes for the final hop.
    fn child(
        &self,
        file_count: usize,
        capture_output: bool,
        on_exit: Option<ExitHook>,
    ) -> Result<Infallible> {
        let files = self.inherit_files(file_count)?;
        let pipes = if capture_output {
            Some(CapturePipes::new()?)
        } else {
            None
        };

        let stdin = io::stdin();
        let stdout = io::stdout();
        let stderr = io::stderr();
        let (out, err) = match &pipes {
            Some(pipes) => (pipes.stdout_write.as_fd(), pipes.stderr_write.as_fd()),
            None => (stdout.as_fd(), stderr.as_fd()),
        };

        let mut table = DescriptorTable::with_stdio(stdin.as_fd(), out, err);
        for named in &files {
            table.push(named.file.as_fd());
        }
        if let Some(pipes) = &pipes {
            table.push(pipes.stdout_read.as_fd());
            table.push(pipes.stderr_read.as_fd());
        }

        relaunch(1, self.codec, self.original, self.program_name, on_exit, &table)
    }

    /// Stage 2: the daemon itself. Undo every trace in the environment and
    /// hand back the files and capture streams.
    fn daemon(&self, stage: u32, file_count: usize, capture_output: bool) -> Result<Daemonized> {
        umask(Mode::empty());
        self.codec.restore(self.original)?;

        let files = self.inherit_files(file_count)?;
        for fd in (FIRST_FILE_FD..).take(file_count) {
            self.registry.unwind(fd)?;
        }
        cache_stage(DaemonStage::from_index(stage));

        let (stdout, stderr) = if capture_output {
            let (stdout_fd, stderr_fd) = reserved_slots(FIRST_FILE_FD as usize + file_count);
            (Some(fds::inherit(stdout_fd)?), Some(fds::inherit(stderr_fd)?))
        } else {
            (None, None)
        };

        tracing::debug!(pid = std::process::id(), files = files.len(), "Daemon ready");
        Ok(Daemonized {
            stdout,
            stderr,
            files,
        })
    }

    fn inherit_files(&self, file_count: usize) -> Result<Vec<NamedFile>> {
        (FIRST_FILE_FD..)
            .take(file_count)
            .map(|fd| {
                let name = self.registry.load(fd)?;
                Ok(NamedFile::new(name, fds::inherit(fd)?))
            })
            .collect()
    }
}
