use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use thiserror::Error;
use url::Url;

const DEFAULT_DISTRO_BASE_URL: &str = "https://repo.enonic.com/public/com/enonic/xp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Macos,
    Windows,
}

impl Platform {
    pub fn detect() -> Result<Self, DistroError> {
        match std::env::consts::OS {
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::Macos),
            "windows" => Ok(Self::Windows),
            os => Err(DistroError::UnsupportedPlatform { os: os.to_string() }),
        }
    }

    fn os_key(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "mac",
            Platform::Windows => "windows",
        }
    }

    fn archive_extension(self) -> &'static str {
        match self {
            Platform::Windows => "zip",
            Platform::Linux | Platform::Macos => "tar.gz",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.os_key())
    }
}

#[derive(Debug, Error)]
pub enum DistroError {
    #[error("unsupported platform {os}")]
    UnsupportedPlatform { os: String },
    #[error("invalid distribution version '{0}'")]
    InvalidVersion(String),
    #[error("download failed: {url} ({status})")]
    DownloadFailed { url: Url, status: reqwest::StatusCode },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("extract failed: {0}")]
    ExtractFailed(String),
}

/// Keeps unpacked server distributions under a single directory, one
/// subdirectory per version.
#[derive(Debug, Clone)]
pub struct DistroManager {
    distros_dir: PathBuf,
    platform: Platform,
    base_url: Url,
}

impl DistroManager {
    pub fn new(distros_dir: impl Into<PathBuf>) -> Result<Self, DistroError> {
        Ok(Self {
            distros_dir: distros_dir.into(),
            platform: Platform::detect()?,
            base_url: base_url_from_env()?,
        })
    }

    pub fn with_platform(distros_dir: impl Into<PathBuf>, platform: Platform, base_url: Url) -> Self {
        Self {
            distros_dir: distros_dir.into(),
            platform,
            base_url,
        }
    }

    pub fn distros_dir(&self) -> &Path {
        &self.distros_dir
    }

    pub fn distro_name(&self, version: &str) -> String {
        format!("enonic-xp-{}-sdk-{}", self.platform.os_key(), version)
    }

    pub fn distro_dir(&self, version: &str) -> PathBuf {
        self.distros_dir.join(self.distro_name(version))
    }

    pub fn is_installed(&self, version: &str) -> bool {
        self.distro_dir(version).is_dir()
    }

    pub fn archive_url(&self, version: &str) -> Result<Url, DistroError> {
        let name = self.distro_name(version);
        let base = self.base_url.as_str().trim_end_matches('/');
        let url = format!(
            "{base}/enonic-xp-{}-sdk/{version}/{name}.{}",
            self.platform.os_key(),
            self.platform.archive_extension()
        );
        Ok(Url::parse(&url)?)
    }

    /// Versions that are already unpacked locally.
    pub fn list_installed(&self) -> Result<Vec<String>, DistroError> {
        let prefix = format!("enonic-xp-{}-sdk-", self.platform.os_key());
        let mut versions = Vec::new();
        let entries = match fs::read_dir(&self.distros_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(versions),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(&prefix))
            {
                versions.push(version.to_string());
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Returns the unpacked distribution directory, downloading it first when
    /// it is not present yet.
    pub fn ensure_distro_exists(&self, version: &str) -> Result<PathBuf, DistroError> {
        validate_version(version)?;
        let destination = self.distro_dir(version);
        if destination.is_dir() {
            return Ok(destination);
        }

        let url = self.archive_url(version)?;
        eprintln!("Downloading distribution {}...", self.distro_name(version));
        tracing::info!(url = %url, "downloading distribution");
        let bytes = download_bytes(&url)?;

        fs::create_dir_all(&self.distros_dir)?;
        let staging = tempfile::tempdir_in(&self.distros_dir)?;
        unpack_archive(&bytes, &url, staging.path())?;
        let root = single_root(staging.path())?;

        if let Err(err) = fs::rename(&root, &destination) {
            // Another invocation may have finished the same download first.
            if !destination.is_dir() {
                return Err(err.into());
            }
        }
        tracing::info!(path = %destination.display(), "distribution unpacked");
        Ok(destination)
    }
}

fn base_url_from_env() -> Result<Url, DistroError> {
    match std::env::var("SANDBOXCTL_DISTRO_URL") {
        Ok(url) => Ok(Url::parse(url.trim())?),
        Err(_) => Ok(Url::parse(DEFAULT_DISTRO_BASE_URL)?),
    }
}

fn validate_version(version: &str) -> Result<(), DistroError> {
    let valid = !version.is_empty()
        && version
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
        && version != "."
        && version != "..";
    if valid {
        Ok(())
    } else {
        Err(DistroError::InvalidVersion(version.to_string()))
    }
}

fn download_bytes(url: &Url) -> Result<Vec<u8>, DistroError> {
    let client = Client::builder().build()?;
    let mut response = client.get(url.clone()).send()?;
    if !response.status().is_success() {
        return Err(DistroError::DownloadFailed {
            url: url.clone(),
            status: response.status(),
        });
    }
    let mut bytes = Vec::new();
    response.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn unpack_archive(bytes: &[u8], url: &Url, destination: &Path) -> Result<(), DistroError> {
    let path = url.path().to_ascii_lowercase();
    if path.ends_with(".zip") {
        let reader = io::Cursor::new(bytes.to_vec());
        let mut archive = zip::ZipArchive::new(reader)
            .map_err(|err| DistroError::ExtractFailed(err.to_string()))?;
        for idx in 0..archive.len() {
            let mut file = archive
                .by_index(idx)
                .map_err(|err| DistroError::ExtractFailed(err.to_string()))?;
            let Some(name) = file.enclosed_name().map(|p| p.to_path_buf()) else {
                continue;
            };
            let out_path = destination.join(name);
            if file.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = fs::File::create(&out_path)?;
            io::copy(&mut file, &mut out)?;
            #[cfg(unix)]
            if let Some(mode) = file.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode))?;
            }
        }
        return Ok(());
    }

    if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
        let cursor = io::Cursor::new(bytes.to_vec());
        let mut archive = tar::Archive::new(GzDecoder::new(cursor));
        archive.unpack(destination)?;
        return Ok(());
    }

    Err(DistroError::ExtractFailed(format!(
        "unsupported archive format: {}",
        url
    )))
}

/// Archives usually wrap everything in one top-level directory; use it as the
/// distribution root when present.
fn single_root(staging: &Path) -> Result<PathBuf, DistroError> {
    let mut entries = fs::read_dir(staging)?.collect::<Result<Vec<_>, _>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        return Ok(entries.remove(0).path());
    }
    if entries.is_empty() {
        return Err(DistroError::ExtractFailed("archive is empty".to_string()));
    }
    // Flat archive: move the staging contents into a directory of their own.
    let root = staging.join(".root");
    fs::create_dir(&root)?;
    for entry in entries {
        fs::rename(entry.path(), root.join(entry.file_name()))?;
    }
    Ok(root)
}
