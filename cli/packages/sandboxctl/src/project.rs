use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use toml_edit::{value, DocumentMut};

use crate::cli::CliError;
use crate::paths::{write_atomic, PROJECT_FILE};

/// Settings a project directory keeps in its `.sandboxctl` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectData {
    pub sandbox: String,
}

pub fn project_file(project_dir: &Path) -> PathBuf {
    project_dir.join(PROJECT_FILE)
}

/// `None` when the directory has no project file or it names no sandbox.
pub fn read_project_data(project_dir: &Path) -> Result<Option<ProjectData>, CliError> {
    let text = match fs::read_to_string(project_file(project_dir)) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let document: DocumentMut = text.parse()?;
    let sandbox = document
        .get("sandbox")
        .and_then(|item| item.as_str())
        .unwrap_or_default()
        .trim();
    if sandbox.is_empty() {
        return Ok(None);
    }
    Ok(Some(ProjectData {
        sandbox: sandbox.to_string(),
    }))
}

/// Updates the `sandbox` key, keeping any other content of the file.
pub fn write_project_data(project_dir: &Path, data: &ProjectData) -> Result<(), CliError> {
    let path = project_file(project_dir);
    let mut document = match fs::read_to_string(&path) {
        Ok(text) => text.parse::<DocumentMut>()?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => DocumentMut::new(),
        Err(err) => return Err(err.into()),
    };
    document["sandbox"] = value(data.sandbox.as_str());
    write_atomic(&path, document.to_string().as_bytes())
}
