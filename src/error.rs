use thiserror::Error;

/// Main error type for the staged daemonizer
#[derive(Debug, Error)]
pub enum DaemonError {
    // Launch errors
    #[error("Can't determine full path to executable: {0}")]
    Executable(String),

    #[error("Can't create process {program}: {source}")]
    SpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("File slot {0} has no open file in the launching process")]
    MissingFile(usize),

    #[error("Exit hook failed: {0}")]
    ExitHook(String),

    // Environment errors
    #[error("Can't set {var}: {reason}")]
    EnvError { var: String, reason: String },

    #[error("Bad daemon variable {var}: {reason}")]
    CorruptVariable { var: String, reason: String },

    // System errors
    #[error("System call '{call}' failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: nix::Error,
    },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl DaemonError {
    /// Wrap a failed system call.
    pub fn syscall(call: &'static str, source: nix::Error) -> Self {
        DaemonError::Syscall { call, source }
    }

    /// Whether the error means the re-exec chain itself is broken.
    ///
    /// These are fatal at every stage, including the launching one.
    pub fn is_integrity(&self) -> bool {
        matches!(self, DaemonError::CorruptVariable { .. })
    }
}

/// Result type alias for daemonization operations
pub type Result<T> = std::result::Result<T, DaemonError>;
