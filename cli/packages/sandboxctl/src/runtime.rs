//! The runtime record: which sandbox this machine profile is running and
//! which session cookie to reuse for API calls.
//!
//! Independent invocations share the record only through its file, so every
//! write replaces the whole file atomically. The record is an advisory cache;
//! callers re-check liveness with [`RuntimeStateStore::verify_liveness`]
//! instead of trusting `running`/`pid` blindly.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::CliError;
use crate::paths::write_atomic;
use crate::process::is_process_running;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeRecord {
    /// Name of the sandbox believed to be running, empty for none.
    pub running: String,
    /// Process to signal to stop `running`, 0 for none.
    #[serde(rename = "PID")]
    pub pid: u32,
    /// Cached `JSESSIONID` for the active remote, empty for none.
    #[serde(rename = "sessionID")]
    pub session_id: String,
}

impl RuntimeRecord {
    pub fn clear_running(&mut self) {
        self.running.clear();
        self.pid = 0;
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStateStore {
    path: PathBuf,
}

impl RuntimeStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing file is created empty and an unreadable one is
    /// treated as empty.
    pub fn read(&self) -> RuntimeRecord {
        match fs::read_to_string(&self.path) {
            Ok(text) => match toml_edit::de::from_str::<RuntimeRecord>(&text) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "runtime record is corrupt; treating it as empty"
                    );
                    RuntimeRecord::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let record = RuntimeRecord::default();
                if let Err(err) = self.write(&record) {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "failed to create runtime record"
                    );
                }
                record
            }
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to read runtime record; treating it as empty"
                );
                RuntimeRecord::default()
            }
        }
    }

    pub fn write(&self, record: &RuntimeRecord) -> Result<(), CliError> {
        let text = toml_edit::ser::to_string(record)?;
        write_atomic(&self.path, text.as_bytes())
    }

    /// True only when `record` names a sandbox whose process is alive. A stale
    /// record is cleared both in `record` and on disk.
    pub fn verify_liveness(&self, record: &mut RuntimeRecord) -> bool {
        if record.running.is_empty() {
            return false;
        }
        if is_process_running(record.pid) {
            return true;
        }

        tracing::info!(
            sandbox = %record.running,
            pid = record.pid,
            "clearing stale runtime record"
        );
        record.clear_running();
        let mut persisted = self.read();
        persisted.clear_running();
        if let Err(err) = self.write(&persisted) {
            tracing::warn!(error = %err, "failed to persist cleared runtime record");
        }
        false
    }

    pub fn set_running(&self, name: &str, pid: u32) -> Result<(), CliError> {
        let mut record = self.read();
        record.running = name.to_string();
        record.pid = pid;
        self.write(&record)
    }

    pub fn clear_running(&self) -> Result<(), CliError> {
        let mut record = self.read();
        record.clear_running();
        self.write(&record)
    }

    /// Clears the running sandbox only while the record still points at
    /// `pid`, so a newer sandbox started elsewhere is left alone.
    pub fn clear_running_if(&self, pid: u32) -> Result<bool, CliError> {
        let mut record = self.read();
        if record.pid != pid {
            return Ok(false);
        }
        record.clear_running();
        self.write(&record)?;
        Ok(true)
    }

    pub fn session_id(&self) -> Option<String> {
        let record = self.read();
        if record.session_id.is_empty() {
            None
        } else {
            Some(record.session_id)
        }
    }

    /// Returns true when the stored value changed.
    pub fn set_session(&self, session_id: &str) -> Result<bool, CliError> {
        let mut record = self.read();
        if record.session_id == session_id {
            return Ok(false);
        }
        record.session_id = session_id.to_string();
        self.write(&record)?;
        Ok(true)
    }

    /// Returns true when a session was cached.
    pub fn clear_session(&self) -> Result<bool, CliError> {
        self.set_session("")
    }
}
