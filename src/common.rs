/// The common module is our grab bag of shared toys: the artist data model, the closed release
/// type and artist role enumerations, filesystem name sanitization, and small collection helpers.
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::config::Config;
use crate::error::{Result, RoseError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artist {
    pub name: String,
    #[serde(default)]
    pub alias: bool,
}

impl Artist {
    pub fn new(name: &str) -> Artist {
        Artist { name: name.to_string(), alias: false }
    }

    pub fn aliased(name: &str) -> Artist {
        Artist { name: name.to_string(), alias: true }
    }
}

/// The closed set of artist roles. The database stores the string form; reading an unknown role
/// back is an unexpected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtistRole {
    Main,
    Guest,
    Remixer,
    Producer,
    Composer,
    DjMixer,
}

impl ArtistRole {
    pub const ALL: [ArtistRole; 6] = [
        ArtistRole::Main,
        ArtistRole::Guest,
        ArtistRole::Remixer,
        ArtistRole::Producer,
        ArtistRole::Composer,
        ArtistRole::DjMixer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArtistRole::Main => "main",
            ArtistRole::Guest => "guest",
            ArtistRole::Remixer => "remixer",
            ArtistRole::Producer => "producer",
            ArtistRole::Composer => "composer",
            ArtistRole::DjMixer => "djmixer",
        }
    }

    pub fn from_str(role: &str) -> Result<ArtistRole> {
        match role {
            "main" => Ok(ArtistRole::Main),
            "guest" => Ok(ArtistRole::Guest),
            "remixer" => Ok(ArtistRole::Remixer),
            "producer" => Ok(ArtistRole::Producer),
            "composer" => Ok(ArtistRole::Composer),
            "djmixer" => Ok(ArtistRole::DjMixer),
            _ => Err(RoseError::UnknownArtistRole { role: role.to_string() }),
        }
    }
}

impl fmt::Display for ArtistRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtistMapping {
    #[serde(default)]
    pub main: Vec<Artist>,
    #[serde(default)]
    pub guest: Vec<Artist>,
    #[serde(default)]
    pub remixer: Vec<Artist>,
    #[serde(default)]
    pub producer: Vec<Artist>,
    #[serde(default)]
    pub composer: Vec<Artist>,
    #[serde(default)]
    pub djmixer: Vec<Artist>,
}

impl ArtistMapping {
    pub fn role(&self, role: ArtistRole) -> &Vec<Artist> {
        match role {
            ArtistRole::Main => &self.main,
            ArtistRole::Guest => &self.guest,
            ArtistRole::Remixer => &self.remixer,
            ArtistRole::Producer => &self.producer,
            ArtistRole::Composer => &self.composer,
            ArtistRole::DjMixer => &self.djmixer,
        }
    }

    pub fn role_mut(&mut self, role: ArtistRole) -> &mut Vec<Artist> {
        match role {
            ArtistRole::Main => &mut self.main,
            ArtistRole::Guest => &mut self.guest,
            ArtistRole::Remixer => &mut self.remixer,
            ArtistRole::Producer => &mut self.producer,
            ArtistRole::Composer => &mut self.composer,
            ArtistRole::DjMixer => &mut self.djmixer,
        }
    }

    pub fn items(&self) -> impl Iterator<Item = (ArtistRole, &Vec<Artist>)> {
        ArtistRole::ALL.iter().map(move |r| (*r, self.role(*r)))
    }

    pub fn all(&self) -> Vec<Artist> {
        uniq(self.items().flat_map(|(_, artists)| artists.iter().cloned()).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.items().all(|(_, artists)| artists.is_empty())
    }
}

/// The closed set of release types. Parsing is total: unrecognized inputs become `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseType {
    Album,
    Single,
    Ep,
    Compilation,
    Soundtrack,
    Live,
    Remix,
    DjMix,
    Mixtape,
    Other,
    Unknown,
}

impl ReleaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseType::Album => "album",
            ReleaseType::Single => "single",
            ReleaseType::Ep => "ep",
            ReleaseType::Compilation => "compilation",
            ReleaseType::Soundtrack => "soundtrack",
            ReleaseType::Live => "live",
            ReleaseType::Remix => "remix",
            ReleaseType::DjMix => "djmix",
            ReleaseType::Mixtape => "mixtape",
            ReleaseType::Other => "other",
            ReleaseType::Unknown => "unknown",
        }
    }

    pub fn from_str(value: &str) -> ReleaseType {
        match value.to_lowercase().as_str() {
            "album" => ReleaseType::Album,
            "single" => ReleaseType::Single,
            "ep" => ReleaseType::Ep,
            "compilation" => ReleaseType::Compilation,
            "soundtrack" => ReleaseType::Soundtrack,
            "live" => ReleaseType::Live,
            "remix" => ReleaseType::Remix,
            "djmix" => ReleaseType::DjMix,
            "mixtape" => ReleaseType::Mixtape,
            "other" => ReleaseType::Other,
            _ => ReleaseType::Unknown,
        }
    }
}

impl Default for ReleaseType {
    fn default() -> ReleaseType {
        ReleaseType::Unknown
    }
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn flatten<T>(xxs: Vec<Vec<T>>) -> Vec<T> {
    xxs.into_iter().flatten().collect()
}

pub fn uniq<T: Clone + Eq + Hash>(xs: Vec<T>) -> Vec<T> {
    let mut rv = Vec::with_capacity(xs.len());
    let mut seen = HashSet::new();
    for x in xs {
        if seen.insert(x.clone()) {
            rv.push(x);
        }
    }
    rv
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Mint a time-ordered identifier, so that natural insertion order correlates with added-at.
pub fn mint_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Truncate a string to at most `max_bytes` of UTF-8, never splitting a code point.
pub(crate) fn truncate_to_bytes(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = 0;
    for (idx, ch) in s.char_indices() {
        if idx + ch.len_utf8() > max_bytes {
            break;
        }
        end = idx + ch.len_utf8();
    }
    &s[..end]
}

fn sanitize_chars(name: &str) -> String {
    // The name is normalized to NFD first; the byte budget is measured against that form.
    let name: String = name.nfd().collect();
    let name: String = name.chars().map(|c| if c == '/' || c == '\0' || c == '\\' { '_' } else { c }).collect();
    let name = name.trim();
    if name == "." || name == ".." {
        return "_".to_string();
    }
    let name = name.trim_matches(|c: char| c.is_whitespace() || c == '.');
    if name.is_empty() {
        return "_".to_string();
    }
    name.to_string()
}

/// Sanitize a directory name into a filesystem-legal form, bounded by the configured byte budget.
pub fn sanitize_dirname(c: &Config, name: &str, enforce_maxlen: bool) -> String {
    let name = sanitize_chars(name);
    if !enforce_maxlen {
        return name;
    }
    truncate_to_bytes(&name, c.max_filename_bytes).trim_end().to_string()
}

/// Sanitize a file name. Unlike [`sanitize_dirname`], the extension is respected: it is preserved
/// and counted against the byte budget. Extensions longer than 6 bytes are not treated as
/// extensions.
pub fn sanitize_filename(c: &Config, name: &str, enforce_maxlen: bool) -> String {
    let name = sanitize_chars(name);
    if !enforce_maxlen {
        return name;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if name.len() - pos <= 6 => name.split_at(pos),
        _ => (name.as_str(), ""),
    };
    let budget = c.max_filename_bytes.saturating_sub(ext.len());
    let stem = truncate_to_bytes(stem, budget).trim_end();
    format!("{stem}{ext}")
}

/// Unicode-normalize strings before comparison; there can be comparison failures when a library is
/// ported across operating systems otherwise.
pub fn compare_strs(a: &str, b: &str) -> bool {
    a.nfc().collect::<String>() == b.nfc().collect::<String>()
}

pub fn initialize_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}
