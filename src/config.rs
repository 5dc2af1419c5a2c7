/// Configuration loading. The cache consumes a small, read-only slice of the overall
/// configuration surface; it is loaded once at startup and passed by reference afterwards.
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, RoseExpectedError};
use crate::templates::{PathTemplate, PathTemplateConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub music_source_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Size of the scanner worker pool.
    pub max_proc: usize,
    pub ignore_release_directories: Vec<String>,
    pub rename_source_files: bool,
    pub max_filename_bytes: usize,
    pub cover_art_stems: Vec<String>,
    pub valid_art_exts: Vec<String>,
    pub write_parent_genres: bool,
    /// Artist -> aliases of that artist.
    pub artist_aliases_map: HashMap<String, Vec<String>>,
    /// Alias -> artists this is an alias of.
    pub artist_aliases_parents_map: HashMap<String, Vec<String>>,
    pub path_templates: PathTemplateConfig,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    music_source_dir: Option<String>,
    cache_dir: Option<String>,
    max_proc: Option<usize>,
    #[serde(default)]
    ignore_release_directories: Vec<String>,
    #[serde(default)]
    rename_source_files: bool,
    max_filename_bytes: Option<usize>,
    cover_art_stems: Option<Vec<String>>,
    valid_art_exts: Option<Vec<String>>,
    #[serde(default)]
    write_parent_genres: bool,
    #[serde(default)]
    artist_aliases: Vec<ArtistAliasEntry>,
    path_templates: Option<PathTemplatesFile>,
}

#[derive(Debug, Deserialize)]
struct ArtistAliasEntry {
    artist: String,
    aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PathTemplatesFile {
    release: Option<String>,
    track: Option<String>,
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| RoseExpectedError::InvalidConfig("cannot determine the configuration directory".to_string()))?;
    Ok(base.join("rose").join("config.toml"))
}

fn default_cache_dir() -> Result<PathBuf> {
    // dirs resolves XDG_CACHE_HOME on Linux and the platform cache directory elsewhere.
    let base = dirs::cache_dir()
        .ok_or_else(|| RoseExpectedError::InvalidConfig("cannot determine the cache directory".to_string()))?;
    Ok(base.join("rose"))
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

impl Config {
    pub fn parse(config_path_override: Option<&Path>) -> Result<Config> {
        let cfgpath = match config_path_override {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        let contents = fs::read_to_string(&cfgpath)
            .map_err(|_| RoseExpectedError::FileNotFound { path: cfgpath.clone() })?;
        let data: ConfigFile = toml::from_str(&contents).map_err(|e| {
            RoseExpectedError::InvalidConfig(format!("failed to decode {}: {e}", cfgpath.display()))
        })?;
        Config::from_file(&cfgpath, data)
    }

    fn from_file(cfgpath: &Path, data: ConfigFile) -> Result<Config> {
        let music_source_dir = data
            .music_source_dir
            .as_deref()
            .map(expand_path)
            .ok_or_else(|| RoseExpectedError::MissingConfigKey {
                key: format!("music_source_dir (in {})", cfgpath.display()),
            })?;

        let cache_dir = match data.cache_dir.as_deref() {
            Some(raw) => expand_path(raw),
            None => default_cache_dir()?,
        };
        fs::create_dir_all(&cache_dir)?;

        let max_proc = match data.max_proc {
            Some(0) => {
                return Err(RoseExpectedError::InvalidConfig(
                    "max_proc must be a positive integer".to_string(),
                )
                .into())
            }
            Some(n) => n,
            None => (num_cpus::get() / 2).max(1),
        };

        let mut artist_aliases_map: HashMap<String, Vec<String>> = HashMap::new();
        let mut artist_aliases_parents_map: HashMap<String, Vec<String>> = HashMap::new();
        for entry in &data.artist_aliases {
            artist_aliases_map.insert(entry.artist.clone(), entry.aliases.clone());
            for alias in &entry.aliases {
                artist_aliases_parents_map.entry(alias.clone()).or_default().push(entry.artist.clone());
            }
        }
        validate_aliases_acyclic(&artist_aliases_map)?;

        let default_templates = PathTemplateConfig::with_defaults();
        let path_templates = match data.path_templates {
            Some(pt) => PathTemplateConfig {
                release: pt.release.map(PathTemplate::new).unwrap_or(default_templates.release),
                track: pt.track.map(PathTemplate::new).unwrap_or(default_templates.track),
            },
            None => default_templates,
        };

        Ok(Config {
            music_source_dir,
            cache_dir,
            max_proc,
            ignore_release_directories: data.ignore_release_directories,
            rename_source_files: data.rename_source_files,
            max_filename_bytes: data.max_filename_bytes.unwrap_or(180),
            cover_art_stems: data
                .cover_art_stems
                .unwrap_or_else(|| ["folder", "cover", "art", "front"].map(String::from).to_vec()),
            valid_art_exts: data
                .valid_art_exts
                .unwrap_or_else(|| ["jpg", "jpeg", "png"].map(String::from).to_vec()),
            write_parent_genres: data.write_parent_genres,
            artist_aliases_map,
            artist_aliases_parents_map,
            path_templates,
        })
    }

    pub fn cache_database_path(&self) -> PathBuf {
        self.cache_dir.join("cache.sqlite3")
    }

    /// The set of filenames recognized as release cover art, lowercased.
    pub fn valid_cover_arts(&self) -> Vec<String> {
        let mut rval = Vec::new();
        for stem in &self.cover_art_stems {
            for ext in &self.valid_art_exts {
                rval.push(format!("{}.{}", stem.to_lowercase(), ext.to_lowercase()));
            }
        }
        rval
    }
}

/// Cyclic aliasing would make alias resolution diverge at read time; reject it at load.
fn validate_aliases_acyclic(aliases: &HashMap<String, Vec<String>>) -> Result<()> {
    for start in aliases.keys() {
        let mut stack = vec![start.clone()];
        let mut visited = std::collections::HashSet::new();
        while let Some(cur) = stack.pop() {
            if !visited.insert(cur.clone()) {
                continue;
            }
            for alias in aliases.get(&cur).map(|v| v.as_slice()).unwrap_or(&[]) {
                if alias == start {
                    return Err(RoseExpectedError::InvalidConfig(format!(
                        "cyclic artist alias configuration involving {start}"
                    ))
                    .into());
                }
                stack.push(alias.clone());
            }
        }
    }
    Ok(())
}
