use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cli::CliError;
use crate::paths::write_atomic;

/// Built-in remote pointing at the local management port.
pub const LOCAL_REMOTE: &str = "local";
const LOCAL_REMOTE_URL: &str = "http://localhost:4848";

pub const REMOTE_URL_ENV: &str = "SANDBOXCTL_REMOTE_URL";
pub const REMOTE_USER_ENV: &str = "SANDBOXCTL_REMOTE_USER";
pub const REMOTE_PASS_ENV: &str = "SANDBOXCTL_REMOTE_PASS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: Url,
    pub user: String,
    pub pass: String,
}

impl Remote {
    pub fn local() -> Result<Self, CliError> {
        Ok(Self {
            name: LOCAL_REMOTE.to_string(),
            url: parse_remote_url(LOCAL_REMOTE_URL)?,
            user: String::new(),
            pass: String::new(),
        })
    }

    /// `user:pass` when either half is set.
    pub fn credentials(&self) -> Option<String> {
        if self.user.is_empty() && self.pass.is_empty() {
            None
        } else {
            Some(format!("{}:{}", self.user, self.pass))
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RemotesFile {
    #[serde(default)]
    active: String,
    #[serde(default)]
    remotes: BTreeMap<String, RemoteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteEntry {
    url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pass: String,
}

impl RemoteEntry {
    fn to_remote(&self, name: &str) -> Result<Remote, CliError> {
        Ok(Remote {
            name: name.to_string(),
            url: parse_remote_url(&self.url)?,
            user: self.user.clone(),
            pass: self.pass.clone(),
        })
    }
}

fn parse_remote_url(value: &str) -> Result<Url, CliError> {
    let url = Url::parse(value).map_err(|_| CliError::InvalidUrl(value.to_string()))?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(CliError::InvalidUrl(value.to_string()));
    }
    Ok(url)
}

/// Named remotes in `remotes.toml`, plus the built-in `local` one.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    path: PathBuf,
}

impl RemoteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RemotesFile, CliError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(toml_edit::de::from_str(&text)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(RemotesFile::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, file: &RemotesFile) -> Result<(), CliError> {
        let text = toml_edit::ser::to_string_pretty(file)?;
        write_atomic(&self.path, text.as_bytes())
    }

    /// `local` first, then the stored remotes by name.
    pub fn list(&self) -> Result<Vec<Remote>, CliError> {
        let file = self.load()?;
        let mut remotes = vec![Remote::local()?];
        for (name, entry) in &file.remotes {
            remotes.push(entry.to_remote(name)?);
        }
        Ok(remotes)
    }

    pub fn get(&self, name: &str) -> Result<Option<Remote>, CliError> {
        if name == LOCAL_REMOTE {
            return Remote::local().map(Some);
        }
        let file = self.load()?;
        file.remotes
            .get(name)
            .map(|entry| entry.to_remote(name))
            .transpose()
    }

    /// Name of the active remote; an unset or dangling selection is `local`.
    pub fn active_name(&self) -> Result<String, CliError> {
        let file = self.load()?;
        if file.active.is_empty() || !file.remotes.contains_key(&file.active) {
            return Ok(LOCAL_REMOTE.to_string());
        }
        Ok(file.active)
    }

    /// The active remote with `SANDBOXCTL_REMOTE_*` overrides applied.
    pub fn active(&self) -> Result<Remote, CliError> {
        self.active_with(|key| std::env::var(key).ok())
    }

    pub fn active_with<F>(&self, lookup: F) -> Result<Remote, CliError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let name = self.active_name()?;
        let mut remote = match self.get(&name)? {
            Some(remote) => remote,
            None => Remote::local()?,
        };
        if let Some(url) = lookup(REMOTE_URL_ENV).filter(|value| !value.is_empty()) {
            remote.url = parse_remote_url(&url)?;
        }
        if let Some(user) = lookup(REMOTE_USER_ENV) {
            remote.user = user;
        }
        if let Some(pass) = lookup(REMOTE_PASS_ENV) {
            remote.pass = pass;
        }
        Ok(remote)
    }

    pub fn add(&self, name: &str, url: &str, user: &str, pass: &str) -> Result<Remote, CliError> {
        validate_remote_name(name)?;
        let mut file = self.load()?;
        if name == LOCAL_REMOTE || file.remotes.contains_key(name) {
            return Err(CliError::Config(format!("Remote '{name}' already exists")));
        }
        let parsed = parse_remote_url(url)?;
        let entry = RemoteEntry {
            url: parsed.to_string(),
            user: user.to_string(),
            pass: pass.to_string(),
        };
        let remote = entry.to_remote(name)?;
        file.remotes.insert(name.to_string(), entry);
        self.save(&file)?;
        tracing::info!(remote = name, url = %remote.url, "added remote");
        Ok(remote)
    }

    /// Returns true when the removed remote was the active one; the active
    /// selection then falls back to `local`.
    pub fn remove(&self, name: &str) -> Result<bool, CliError> {
        if name == LOCAL_REMOTE {
            return Err(CliError::Config(format!(
                "Remote '{LOCAL_REMOTE}' can not be removed"
            )));
        }
        let mut file = self.load()?;
        if file.remotes.remove(name).is_none() {
            return Err(CliError::Config(format!("Remote '{name}' does not exist")));
        }
        let was_active = file.active == name;
        if was_active {
            file.active.clear();
        }
        self.save(&file)?;
        Ok(was_active)
    }

    /// Returns true when the active remote changed.
    pub fn set_active(&self, name: &str) -> Result<bool, CliError> {
        let mut file = self.load()?;
        if name != LOCAL_REMOTE && !file.remotes.contains_key(name) {
            return Err(CliError::Config(format!("Remote '{name}' does not exist")));
        }
        let current = if file.active.is_empty() || !file.remotes.contains_key(&file.active) {
            LOCAL_REMOTE
        } else {
            file.active.as_str()
        };
        if current == name {
            return Ok(false);
        }
        file.active = if name == LOCAL_REMOTE {
            String::new()
        } else {
            name.to_string()
        };
        self.save(&file)?;
        Ok(true)
    }
}

fn validate_remote_name(name: &str) -> Result<(), CliError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(CliError::Config(format!(
            "Remote name '{name}' can only contain letters, digits, '-' and '_'"
        )))
    }
}
