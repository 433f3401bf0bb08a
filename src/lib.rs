// Library exports for the staged re-exec daemonizer

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;

pub use config::{DaemonConfig, DaemonSettings, FileSlot};
pub use daemon::{make_daemon, stage, DaemonStage, Daemonized, NamedFile};
pub use error::{DaemonError, Result};
