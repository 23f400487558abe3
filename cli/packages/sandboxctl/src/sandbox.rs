use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cli::CliError;
use crate::paths::write_atomic;
use crate::prompt::{prompt_until_valid, Prompter};

const SANDBOX_FILE: &str = "sandbox.toml";
const CREATE_NEW_OPTION: &str = "<Create new sandbox>";

/// A named local server instance and the distribution it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub name: String,
    pub distro: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SandboxFile {
    distro: String,
}

#[derive(Debug, Clone)]
pub struct SandboxRegistry {
    dir: PathBuf,
}

impl SandboxRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn sandbox_file(&self, name: &str) -> PathBuf {
        self.dir.join(name).join(SANDBOX_FILE)
    }

    /// Every directory holding a `sandbox.toml`, sorted by name.
    pub fn list(&self) -> Result<Vec<Sandbox>, CliError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut sandboxes = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match self.load(&name) {
                Ok(Some(sandbox)) => sandboxes.push(sandbox),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(sandbox = %name, error = %err, "skipping unreadable sandbox");
                }
            }
        }
        sandboxes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sandboxes)
    }

    pub fn load(&self, name: &str) -> Result<Option<Sandbox>, CliError> {
        if !is_valid_name(name) {
            return Ok(None);
        }
        let text = match fs::read_to_string(self.sandbox_file(name)) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let file: SandboxFile = toml_edit::de::from_str(&text)?;
        Ok(Some(Sandbox {
            name: name.to_string(),
            distro: file.distro,
        }))
    }

    pub fn create(&self, name: &str, distro: &str) -> Result<Sandbox, CliError> {
        if !is_valid_name(name) {
            return Err(CliError::Config(format!(
                "Sandbox name '{name}' can only contain letters, digits, '-' and '_'"
            )));
        }
        if distro.trim().is_empty() {
            return Err(CliError::Config("Distro version can not be empty".to_string()));
        }
        if self.sandbox_file(name).exists() {
            return Err(CliError::Config(format!("Sandbox '{name}' already exists")));
        }

        let file = SandboxFile {
            distro: distro.trim().to_string(),
        };
        let text = toml_edit::ser::to_string(&file)?;
        write_atomic(&self.sandbox_file(name), text.as_bytes())?;
        tracing::info!(sandbox = name, distro = %file.distro, "created sandbox");
        Ok(Sandbox {
            name: name.to_string(),
            distro: file.distro,
        })
    }

    /// Lets the user pick an existing sandbox or create one. With no
    /// sandboxes at all, `create_message` asks whether to create the first.
    pub fn ensure_sandbox(
        &self,
        prompter: &dyn Prompter,
        create_message: &str,
        select_message: &str,
    ) -> Result<Sandbox, CliError> {
        let sandboxes = self.list()?;
        if sandboxes.is_empty() {
            if !prompter.confirm(create_message, true)? {
                return Err(CliError::Aborted("No sandbox selected.".to_string()));
            }
            return self.create_interactive(prompter);
        }

        let mut options: Vec<String> = sandboxes
            .iter()
            .map(|sandbox| sandbox.name.clone())
            .collect();
        options.push(CREATE_NEW_OPTION.to_string());
        let choice = prompter.select(select_message, &options)?;
        if choice == CREATE_NEW_OPTION {
            return self.create_interactive(prompter);
        }
        sandboxes
            .into_iter()
            .find(|sandbox| sandbox.name == choice)
            .ok_or(CliError::SandboxNotFound(choice))
    }

    fn create_interactive(&self, prompter: &dyn Prompter) -> Result<Sandbox, CliError> {
        let name = prompt_until_valid(prompter, "", |value, attempt| {
            if value.is_empty() {
                Some(if attempt == 0 {
                    "Sandbox name: ".to_string()
                } else {
                    "Sandbox name can not be empty: ".to_string()
                })
            } else if !is_valid_name(value) {
                Some(format!(
                    "Sandbox name '{value}' can only contain letters, digits, '-' and '_': "
                ))
            } else if self.sandbox_file(value).exists() {
                Some(format!("Sandbox '{value}' already exists, choose another name: "))
            } else {
                None
            }
        })?;
        let distro = prompt_until_valid(prompter, "", |value, attempt| {
            if !value.trim().is_empty() {
                None
            } else if attempt == 0 {
                Some("Distro version: ".to_string())
            } else {
                Some("Distro version can not be empty: ".to_string())
            }
        })?;
        self.create(&name, &distro)
    }
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}
