// Daemon module - staged re-exec daemonization

pub mod capture;
pub mod daemonize;
pub mod env;
pub mod fds;
pub mod relaunch;
pub mod stage;

pub use daemonize::{make_daemon, Daemonized};
pub use fds::{FdRegistry, NamedFile, FD_VAR_PREFIX};
pub use stage::{stage, DaemonStage, StageCodec, STAGE_VAR};
