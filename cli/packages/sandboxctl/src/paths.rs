use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::cli::CliError;

/// Name of the per-project file binding a directory to a sandbox.
pub const PROJECT_FILE: &str = ".sandboxctl";

/// Well-known locations of everything `sandboxctl` keeps on disk for one
/// machine profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    home: PathBuf,
}

impl Paths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    /// `$SANDBOXCTL_HOME`, else `~/.sandboxctl`.
    pub fn from_env() -> Self {
        if let Ok(dir) = std::env::var("SANDBOXCTL_HOME") {
            if !dir.trim().is_empty() {
                return Self::new(dir);
            }
        }
        let home = dirs::home_dir()
            .map(|dir| dir.join(".sandboxctl"))
            .unwrap_or_else(|| PathBuf::from(".").join(".sandboxctl"));
        Self::new(home)
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn runtime_file(&self) -> PathBuf {
        self.home.join("runtime.toml")
    }

    pub fn remotes_file(&self) -> PathBuf {
        self.home.join("remotes.toml")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.home.join("sandboxes")
    }

    pub fn distros_dir(&self) -> PathBuf {
        self.home.join("distributions")
    }

    pub fn sandbox_home(&self, name: &str) -> PathBuf {
        self.sandboxes_dir().join(name).join("home")
    }

    pub fn sandbox_log_path(&self, name: &str) -> PathBuf {
        self.sandboxes_dir().join(name).join("logs").join("server.log")
    }
}

/// Replaces `path` with `contents` without exposing a partially written file:
/// the data goes to a temp file in the same directory which is then renamed.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CliError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| CliError::Io(err.error))?;
    Ok(())
}
