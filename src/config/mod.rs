use crate::daemon::fds::NamedFile;
use crate::daemon::stage::DaemonStage;
use crate::error::{DaemonError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Hook run in stages 0 and 1 right before the process exits
pub type ExitHook = Box<dyn FnOnce(DaemonStage) -> Result<()>>;

/// A descriptor slot the daemon keeps open, starting at descriptor 3.
#[derive(Debug)]
pub enum FileSlot {
    /// A file opened by the launching process
    Open(NamedFile),
    /// Placeholder for a slot already handed down by an earlier stage
    Inherited,
}

impl FileSlot {
    /// Open the file only in the launching process.
    pub fn for_stage<F>(stage: DaemonStage, open: F) -> Result<Self>
    where
        F: FnOnce() -> Result<NamedFile>,
    {
        if stage == DaemonStage::Parent {
            Ok(FileSlot::Open(open()?))
        } else {
            Ok(FileSlot::Inherited)
        }
    }
}

/// Options for `make_daemon`
#[derive(Default)]
pub struct DaemonConfig {
    /// The child's argv[0]; copied from the parent if unset
    pub program_name: Option<OsString>,

    /// Whether the daemon's stdout/stderr are handed back as pipes
    pub capture_output: bool,

    /// Files to keep open in the daemon, in descriptor order
    pub files: Vec<FileSlot>,

    /// Redirect target for stdout and stderr, /dev/null otherwise
    pub stdout: Option<File>,

    pub on_exit: Option<ExitHook>,
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("program_name", &self.program_name)
            .field("capture_output", &self.capture_output)
            .field("files", &self.files)
            .field("stdout", &self.stdout)
            .field("on_exit", &self.on_exit.as_ref().map(|_| "FnOnce"))
            .finish()
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program_name<S: Into<OsString>>(mut self, name: S) -> Self {
        self.program_name = Some(name.into());
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    /// Keep an open file in the daemon.
    pub fn keep_file(mut self, file: NamedFile) -> Self {
        self.files.push(FileSlot::Open(file));
        self
    }

    pub fn file_slot(mut self, slot: FileSlot) -> Self {
        self.files.push(slot);
        self
    }

    pub fn stdout(mut self, file: File) -> Self {
        self.stdout = Some(file);
        self
    }

    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(DaemonStage) -> Result<()> + 'static,
    {
        self.on_exit = Some(Box::new(hook));
        self
    }
}

/// How a preserved file is opened by the launching process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    Read,
    #[default]
    Append,
    Truncate,
}

impl FileMode {
    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            FileMode::Read => options.read(true),
            FileMode::Append => options.create(true).append(true),
            FileMode::Truncate => options.create(true).write(true).truncate(true),
        };
        options
    }
}

/// A preserved file as written in a settings file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: PathBuf,

    #[serde(default)]
    pub mode: FileMode,
}

/// Daemonization settings loadable from a TOML or JSON file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default)]
    pub program_name: Option<String>,

    #[serde(default)]
    pub capture_output: bool,

    /// File receiving both stdout and stderr
    #[serde(default)]
    pub stdout: Option<PathBuf>,

    #[serde(default)]
    pub files: Vec<FileSpec>,
}

impl DaemonSettings {
    /// Load settings from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DaemonError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut settings: DaemonSettings = match extension {
            "toml" => toml::from_str(&contents)
                .map_err(|e| DaemonError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| DaemonError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?,
            _ => {
                return Err(DaemonError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        settings.expand_env_vars();
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if let Some(ref name) = self.program_name {
            if name.is_empty() {
                return Err(DaemonError::ConfigError(
                    "program_name must not be empty".to_string(),
                ));
            }
        }

        if let Some(ref stdout) = self.stdout {
            if stdout.as_os_str().is_empty() {
                return Err(DaemonError::ConfigError(
                    "stdout path must not be empty".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for spec in &self.files {
            if spec.path.as_os_str().is_empty() {
                return Err(DaemonError::ConfigError(
                    "file path must not be empty".to_string(),
                ));
            }
            if !seen.insert(&spec.path) {
                return Err(DaemonError::ConfigError(format!(
                    "File listed twice: {}",
                    spec.path.display()
                )));
            }
        }

        Ok(())
    }

    /// Turn the settings into a `DaemonConfig` for `stage`.
    ///
    /// Files are opened only by the launching process; later stages declare
    /// inherited slots in the same order.
    pub fn into_config(self, stage: DaemonStage) -> Result<DaemonConfig> {
        let mut config = DaemonConfig::new().capture_output(self.capture_output);
        if let Some(name) = self.program_name {
            config = config.program_name(name);
        }

        for spec in &self.files {
            let slot = FileSlot::for_stage(stage, || {
                NamedFile::open_with(&spec.path, &spec.mode.options())
            })?;
            config = config.file_slot(slot);
        }

        if stage == DaemonStage::Parent {
            if let Some(ref path) = self.stdout {
                config = config.stdout(FileMode::Append.options().open(path)?);
            }
        }

        Ok(config)
    }

    /// Expand environment variables in paths
    fn expand_env_vars(&mut self) {
        if let Some(ref stdout) = self.stdout {
            self.stdout = Some(expand_env_in_path(stdout));
        }
        for spec in &mut self.files {
            spec.path = expand_env_in_path(&spec.path);
        }
    }
}

/// Expand `${VAR}` and `$VAR` references in a string
fn expand_env_in_string(s: &str) -> String {
    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    // longest names first so $HOME does not eat the front of $HOMEDIR
    vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut result = s.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("${{{}}}", key), &value);
        result = result.replace(&format!("${}", key), &value);
    }
    result
}

/// Non-UTF-8 paths are kept byte for byte, unexpanded.
fn expand_env_in_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(path_str) => PathBuf::from(expand_env_in_string(path_str)),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_builder_collects_slots() {
        let dir = TempDir::new().unwrap();
        let file = NamedFile::append(dir.path().join("a.log")).unwrap();

        let config = DaemonConfig::new()
            .program_name("worker")
            .capture_output(true)
            .keep_file(file)
            .file_slot(FileSlot::Inherited)
            .on_exit(|_| Ok(()));

        assert_eq!(config.program_name, Some(OsString::from("worker")));
        assert!(config.capture_output);
        assert_eq!(config.files.len(), 2);
        assert!(matches!(config.files[0], FileSlot::Open(_)));
        assert!(matches!(config.files[1], FileSlot::Inherited));
        assert!(format!("{:?}", config).contains("FnOnce"));
    }

    #[test]
    fn test_for_stage_opens_only_in_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("only-parent.log");

        let slot = FileSlot::for_stage(DaemonStage::Child, || NamedFile::append(&path)).unwrap();
        assert!(matches!(slot, FileSlot::Inherited));
        assert!(!path.exists());

        let slot = FileSlot::for_stage(DaemonStage::Parent, || NamedFile::append(&path)).unwrap();
        match slot {
            FileSlot::Open(named) => assert_eq!(named.name, path),
            FileSlot::Inherited => panic!("Expected an open slot"),
        }
        assert!(path.exists());
    }

    #[test]
    fn test_parse_toml_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(
            &path,
            r#"
            program_name = "mountd"
            capture_output = true
            stdout = "/tmp/mountd.out"

            [[files]]
            path = "/tmp/a.log"

            [[files]]
            path = "/tmp/b.log"
            mode = "truncate"
            "#,
        )
        .unwrap();

        let settings = DaemonSettings::from_file(&path).unwrap();
        assert_eq!(settings.program_name.as_deref(), Some("mountd"));
        assert!(settings.capture_output);
        assert_eq!(settings.stdout, Some(PathBuf::from("/tmp/mountd.out")));
        assert_eq!(settings.files.len(), 2);
        assert_eq!(settings.files[0].mode, FileMode::Append);
        assert_eq!(settings.files[1].mode, FileMode::Truncate);
    }

    #[test]
    fn test_parse_json_settings_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.json");
        fs::write(&path, r#"{ "files": [ { "path": "/tmp/x", "mode": "read" } ] }"#).unwrap();

        let settings = DaemonSettings::from_file(&path).unwrap();
        assert_eq!(settings.program_name, None);
        assert!(!settings.capture_output);
        assert_eq!(settings.files[0].mode, FileMode::Read);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.yaml");
        fs::write(&path, "capture_output: true").unwrap();

        match DaemonSettings::from_file(&path) {
            Err(DaemonError::InvalidConfig(msg)) => assert!(msg.contains("Unsupported")),
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_duplicates_and_empty_paths() {
        let duplicate = DaemonSettings {
            files: vec![
                FileSpec {
                    path: PathBuf::from("/tmp/same"),
                    mode: FileMode::Append,
                },
                FileSpec {
                    path: PathBuf::from("/tmp/same"),
                    mode: FileMode::Read,
                },
            ],
            ..Default::default()
        };
        assert!(duplicate.validate().is_err());

        let empty = DaemonSettings {
            files: vec![FileSpec {
                path: PathBuf::new(),
                mode: FileMode::Append,
            }],
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_expand_env_in_paths() {
        std::env::set_var("STAGED_DAEMON_TEST_LOGDIR", "/var/log/staged");
        std::env::set_var("STAGED_DAEMON_TEST_LOGDIR_EXTRA", "/wrong");

        assert_eq!(
            expand_env_in_path(Path::new("${STAGED_DAEMON_TEST_LOGDIR}/a.log")),
            PathBuf::from("/var/log/staged/a.log")
        );
        assert_eq!(
            expand_env_in_string("$STAGED_DAEMON_TEST_LOGDIR_EXTRA/b"),
            "/wrong/b"
        );
    }

    #[test]
    fn test_non_utf8_path_kept_verbatim() {
        use std::os::unix::ffi::OsStringExt;

        std::env::set_var("STAGED_DAEMON_TEST_RAW", "/expanded");
        let raw = PathBuf::from(OsString::from_vec(
            b"$STAGED_DAEMON_TEST_RAW/log-\xff.txt".to_vec(),
        ));
        assert_eq!(expand_env_in_path(&raw), raw);
    }

    #[test]
    fn test_into_config_opens_files_in_parent() {
        let dir = TempDir::new().unwrap();
        let settings = DaemonSettings {
            program_name: Some("svc".to_string()),
            capture_output: false,
            stdout: Some(dir.path().join("out.log")),
            files: vec![FileSpec {
                path: dir.path().join("kept.log"),
                mode: FileMode::Truncate,
            }],
        };

        let config = settings.clone().into_config(DaemonStage::Parent).unwrap();
        assert!(config.stdout.is_some());
        assert!(matches!(config.files[0], FileSlot::Open(_)));
        assert!(dir.path().join("kept.log").exists());

        let config = settings.into_config(DaemonStage::Daemon).unwrap();
        assert!(config.stdout.is_none());
        assert!(matches!(config.files[0], FileSlot::Inherited));
    }
}
