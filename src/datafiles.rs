/// The release sidecar: a `.rose.{uuid}.toml` file inside each release directory that carries the
/// persistent release-level state (stable id, added-at, new flag). The sidecar is the source of
/// truth for release identity; the cache only mirrors it.
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RoseExpectedError};

pub static DATAFILE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\.rose\.([^.]+)\.toml$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDataFile {
    pub release: StoredReleaseData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReleaseData {
    /// Must equal the uuid in the sidecar's filename.
    pub id: String,
    #[serde(default = "default_added_at")]
    pub added_at: String,
    #[serde(default = "default_new")]
    pub new: bool,
}

fn default_new() -> bool {
    true
}

fn default_added_at() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

impl StoredDataFile {
    pub fn new(id: String) -> StoredDataFile {
        StoredDataFile {
            release: StoredReleaseData { id, added_at: default_added_at(), new: default_new() },
        }
    }
}

pub fn datafile_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!(".rose.{id}.toml"))
}

/// Match a directory entry name against the sidecar pattern, returning the embedded uuid.
pub fn datafile_id_from_name(name: &str) -> Option<String> {
    DATAFILE_REGEX.captures(name).map(|m| m[1].to_string())
}

/// Read a sidecar, healing missing or malformed contents in place: the uuid always comes from the
/// filename, and absent fields get defaults written back so old sidecars pick up newer keys. A
/// sidecar whose stored id contradicts its filename is an error; the caller skips the release.
pub fn read_datafile(path: &Path) -> Result<StoredDataFile> {
    let filename_id = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(datafile_id_from_name)
        .ok_or_else(|| RoseExpectedError::FileNotFound { path: path.to_path_buf() })?;

    let contents = fs::read_to_string(path)
        .map_err(|_| RoseExpectedError::FileNotFound { path: path.to_path_buf() })?;

    // Tolerate legacy sidecars that omit the [release] table or individual keys.
    let parsed: toml::Table = contents.parse().unwrap_or_default();
    let release = parsed.get("release").and_then(|v| v.as_table());
    let stored_id = release.and_then(|r| r.get("id")).and_then(|v| v.as_str()).map(|s| s.to_string());
    if let Some(stored_id) = &stored_id {
        if *stored_id != filename_id {
            return Err(RoseExpectedError::DatafileIdMismatch {
                path: path.to_path_buf(),
                datafile_id: stored_id.clone(),
                filename_id,
            }
            .into());
        }
    }

    let datafile = StoredDataFile {
        release: StoredReleaseData {
            id: filename_id,
            added_at: release
                .and_then(|r| r.get("added_at"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(default_added_at),
            new: release.and_then(|r| r.get("new")).and_then(|v| v.as_bool()).unwrap_or_else(default_new),
        },
    };

    // Write the resolved data back if it differs, upgrading sidecars to newer default values.
    let resolved = toml::to_string(&datafile)?;
    if resolved != contents {
        warn!("Healing sidecar {} with resolved values", path.display());
        fs::write(path, resolved)?;
    }

    Ok(datafile)
}

pub fn write_datafile(path: &Path, datafile: &StoredDataFile) -> Result<()> {
    fs::write(path, toml::to_string(datafile)?)?;
    Ok(())
}
