use std::path::PathBuf;
use thiserror::Error;

/// Faults that indicate a programming error or an environment failure. These abort the current
/// cycle and are logged with full context.
#[derive(Error, Debug)]
pub enum RoseError {
    #[error("Rose error: {0}")]
    Generic(String),
    #[error(transparent)]
    Expected(#[from] RoseExpectedError),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Template error: {0}")]
    Template(#[from] tera::Error),
    #[error("Unknown artist role in database: {role}")]
    UnknownArtistRole { role: String },
    #[error("Cache update error: {0}")]
    CacheUpdate(String),
}

/// These errors are printed without a traceback.
#[derive(Error, Debug, Clone)]
pub enum RoseExpectedError {
    #[error("{0}")]
    Generic(String),
    #[error("Missing key in configuration file: {key}")]
    MissingConfigKey { key: String },
    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),
    #[error("Unsupported filetype: {extension}")]
    UnsupportedFiletype { extension: String },
    #[error("Unsupported tag value: {0}")]
    UnsupportedTagValue(String),
    #[error("Failed to open audio file {path}: {message}")]
    CorruptAudioFile { path: PathBuf, message: String },
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },
    #[error("Release directory {path} has multiple .rose.{{uuid}}.toml files")]
    DuplicateDatafile { path: PathBuf },
    #[error("Datafile id {datafile_id} does not match filename uuid {filename_id} in {path}")]
    DatafileIdMismatch {
        path: PathBuf,
        datafile_id: String,
        filename_id: String,
    },
    #[error("Malformed manifest file {path}: {message}")]
    MalformedManifest { path: PathBuf, message: String },
    #[error("Could not find a free filename for {name} within 999 collision suffixes")]
    RenameCollision { name: String },
    #[error("Release does not exist: {id}")]
    ReleaseDoesNotExist { id: String },
    #[error("Track does not exist: {id}")]
    TrackDoesNotExist { id: String },
}

pub type Result<T> = std::result::Result<T, RoseError>;
