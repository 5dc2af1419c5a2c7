/// The cache module encapsulates the read cache and exposes handles for working with it. The
/// SQLite database is considered part of the cache, so this module encapsulates the database too:
/// the connection policy, the schema bootstrap, the advisory locks that synchronize writers, and
/// the query surface that non-cache components consume.
///
/// The cache is never the authoritative store. It can be deleted and rebuilt from the source tree
/// at any time: entity identity lives in release sidecars and embedded audio tags, and everything
/// else here is derived state.
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};

use crate::audiotags::RoseDate;
use crate::common::{sha256_hex, uniq, Artist, ArtistMapping, ArtistRole, ReleaseType, VERSION};
use crate::config::Config;
use crate::error::{Result, RoseExpectedError};
use crate::genre_hierarchy::{transitive_child_genres, transitive_parent_genres};
use crate::templates::artistsfmt;

pub(crate) const CACHE_SCHEMA: &str = include_str!("cache.sql");

/// Delimiter for stringly-encoded arrays returned from SQL queries.
pub(crate) const SQL_ARRAY_DELIMITER: &str = " ¬ ";

/// Character-token delimiter for the full text search index.
pub const FTS_DELIMITER: char = '☆';

/// Name of the advisory lock scope guarding a full cache update cycle.
pub const CACHE_UPDATE_LOCK: &str = "cache-update";

pub fn release_lock_name(release_id: &str) -> String {
    format!("release-{release_id}")
}

pub fn collage_lock_name(collage_name: &str) -> String {
    format!("collage-{collage_name}")
}

pub fn playlist_lock_name(playlist_name: &str) -> String {
    format!("playlist-{playlist_name}")
}

/// Open a connection with the cache's pragma set. Every connection in the crate goes through
/// here; readers rely on WAL for consistency with the single writer.
pub fn connect(c: &Config) -> Result<Connection> {
    let conn = Connection::open(c.cache_database_path())?;
    conn.busy_timeout(Duration::from_secs(15))?;
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -20000;
        PRAGMA temp_store = MEMORY;
        ",
    )?;
    let flags =
        rusqlite::functions::FunctionFlags::SQLITE_UTF8 | rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC;
    conn.create_scalar_function("process_string_for_fts", 1, flags, |ctx| {
        let s: Option<String> = ctx.get(0)?;
        Ok(process_string_for_fts(s.as_deref().unwrap_or("")))
    })?;
    // Takes a " ¬ "-packed genre list, enriches it with transitive parent genres, and tokenizes
    // the union for the FTS index.
    conn.create_scalar_function("process_genres_for_fts", 1, flags, |ctx| {
        let s: Option<String> = ctx.get(0)?;
        let genres: Vec<String> = split_sql_array(s.as_deref().unwrap_or(""))
            .into_iter()
            .filter(|g| !g.is_empty())
            .collect();
        let mut all = genres.clone();
        for g in &genres {
            all.extend(transitive_parent_genres(g));
        }
        Ok(process_string_for_fts(&uniq(all).join(" ")))
    })?;
    Ok(conn)
}

/// Interleave every character with the FTS delimiter, making each character its own token so that
/// substring search becomes a phrase query over character tokens.
pub fn process_string_for_fts(x: &str) -> String {
    let mut out = String::with_capacity(x.len() * 2);
    for (i, ch) in x.chars().enumerate() {
        if i > 0 {
            out.push(FTS_DELIMITER);
        }
        out.push(ch);
    }
    out
}

/// "Migrate" the database. If the schema on disk, the cache-relevant configuration, or the crate
/// version does not match what the database was built with, nuke the database and recreate it
/// from scratch. We can do this because the database is just a read cache.
pub fn maybe_invalidate_cache_database(c: &Config) -> Result<()> {
    let schema_hash = sha256_hex(CACHE_SCHEMA.as_bytes());
    let config_hash_fields = serde_json::json!({
        "music_source_dir": c.music_source_dir.to_string_lossy(),
        "cache_dir": c.cache_dir.to_string_lossy(),
        "cover_art_stems": c.cover_art_stems,
        "valid_art_exts": c.valid_art_exts,
        "ignore_release_directories": c.ignore_release_directories,
    });
    let config_hash = sha256_hex(serde_json::to_string(&config_hash_fields)?.as_bytes());

    {
        let conn = connect(c)?;
        let has_table: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT * FROM sqlite_master
                WHERE type = 'table' AND name = '_schema_hash'
            )",
            [],
            |row| row.get(0),
        )?;
        if has_table {
            let row: Option<(String, String, String)> = conn
                .query_row("SELECT schema_hash, config_hash, version FROM _schema_hash", [], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .optional()?;
            if let Some((db_schema_hash, db_config_hash, db_version)) = row {
                if db_schema_hash == schema_hash && db_config_hash == config_hash && db_version == VERSION {
                    return Ok(());
                }
            }
        }
    }

    info!("Cache schema, config, or version changed: recreating the cache database");
    let db_path = c.cache_database_path();
    if db_path.exists() {
        fs::remove_file(&db_path)?;
    }
    let conn = connect(c)?;
    conn.execute_batch(CACHE_SCHEMA)?;
    conn.execute_batch(
        "
        CREATE TABLE _schema_hash (
            schema_hash TEXT
          , config_hash TEXT
          , version TEXT
          , PRIMARY KEY (schema_hash, config_hash, version)
        )
        ",
    )?;
    conn.execute(
        "INSERT INTO _schema_hash (schema_hash, config_hash, version) VALUES (?1, ?2, ?3)",
        params![schema_hash, config_hash, VERSION],
    )?;
    Ok(())
}

/// An advisory lock held in the `locks` table. Released on drop. The lease carries an explicit
/// expiry: a holder that exceeds `valid_until` loses mutual exclusion and must not commit.
pub struct Lock<'a> {
    config: &'a Config,
    name: String,
    pub valid_until: f64,
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        debug!("Releasing lock {}", self.name);
        if let Ok(conn) = connect(self.config) {
            let _ = conn.execute("DELETE FROM locks WHERE name = ?1", params![self.name]);
        }
    }
}

impl Lock<'_> {
    pub fn expired(&self) -> bool {
        unix_now() > self.valid_until
    }
}

fn unix_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Acquire an advisory lock, sleeping through other holders' leases. Stale leases beyond their
/// `valid_until` are considered free.
pub fn lock<'a>(c: &'a Config, name: &str, timeout_secs: f64) -> Result<Lock<'a>> {
    loop {
        let conn = connect(c)?;
        let max_valid_until: Option<f64> = conn
            .query_row("SELECT MAX(valid_until) FROM locks WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?
            .flatten();

        if let Some(valid_until) = max_valid_until {
            let now = unix_now();
            if valid_until > now {
                let sleep = Duration::from_secs_f64((valid_until - now).max(0.0));
                debug!("Failed to acquire lock for {name}: sleeping for {sleep:?}");
                std::thread::sleep(sleep);
                continue;
            }
            // Stale lease: clear it so the insert below can succeed.
            conn.execute("DELETE FROM locks WHERE name = ?1", params![name])?;
        }

        let valid_until = unix_now() + timeout_secs;
        match conn.execute("INSERT INTO locks (name, valid_until) VALUES (?1, ?2)", params![name, valid_until]) {
            Ok(_) => {
                debug!("Acquired lock for {name} until {valid_until}");
                return Ok(Lock { config: c, name: name.to_string(), valid_until });
            }
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
                debug!("Failed to acquire lock for {name}, trying again");
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Release {
    pub id: String,
    pub source_path: PathBuf,
    pub cover_image_path: Option<PathBuf>,
    /// RFC3339 timestamp.
    pub added_at: String,
    pub datafile_mtime: String,
    pub releasetitle: String,
    pub releasetype: ReleaseType,
    pub releasedate: Option<RoseDate>,
    pub originaldate: Option<RoseDate>,
    pub compositiondate: Option<RoseDate>,
    pub edition: Option<String>,
    pub catalognumber: Option<String>,
    pub new: bool,
    pub disctotal: i32,
    pub genres: Vec<String>,
    pub parent_genres: Vec<String>,
    pub secondary_genres: Vec<String>,
    pub parent_secondary_genres: Vec<String>,
    pub descriptors: Vec<String>,
    pub labels: Vec<String>,
    pub releaseartists: ArtistMapping,
    pub metahash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: String,
    pub source_path: PathBuf,
    pub source_mtime: String,
    pub virtual_filename: String,
    pub tracktitle: String,
    pub tracknumber: String,
    pub tracktotal: i32,
    pub discnumber: String,
    pub formatted_position: String,
    pub duration_seconds: i32,
    pub trackartists: ArtistMapping,
    pub metahash: String,
    #[serde(skip)]
    pub release: Arc<Release>,
}

#[derive(Debug, Clone)]
pub struct Collage {
    pub name: String,
    pub source_mtime: String,
}

#[derive(Debug, Clone)]
pub struct Playlist {
    pub name: String,
    pub source_mtime: String,
    pub cover_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenreEntry {
    pub genre: String,
    pub only_new_releases: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEntry {
    pub label: String,
    pub only_new_releases: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub descriptor: String,
    pub only_new_releases: bool,
}

/// Split a stringly-encoded array from the database by the sentinel delimiter.
pub(crate) fn split_sql_array(xs: &str) -> Vec<String> {
    if xs.is_empty() {
        Vec::new()
    } else {
        xs.split(SQL_ARRAY_DELIMITER).map(|s| s.to_string()).collect()
    }
}

pub(crate) fn parent_genres_of(genres: &[String]) -> Vec<String> {
    let mut rval: Vec<String> = genres
        .iter()
        .flat_map(|g| transitive_parent_genres(g))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    rval.sort();
    rval
}

/// Unpack the zipped `names`/`roles` array columns into an artist mapping, expanding configured
/// aliases when requested. The alias flag is derived here, at read time; it is never stored.
pub(crate) fn unpack_artists(c: &Config, names: &str, roles: &str, aliases: bool) -> Result<ArtistMapping> {
    let mut mapping = ArtistMapping::default();
    let mut seen: HashSet<(String, ArtistRole)> = HashSet::new();
    for (name, role) in split_sql_array(names).into_iter().zip(split_sql_array(roles)) {
        let role = ArtistRole::from_str(&role)?;
        if !seen.insert((name.clone(), role)) {
            continue;
        }
        mapping.role_mut(role).push(Artist::new(&name));
        if !aliases {
            continue;
        }
        // Pull in all immediate and transitive artist aliases.
        let mut unvisited: Vec<String> = vec![name];
        while let Some(cur) = unvisited.pop() {
            for parent in c.artist_aliases_parents_map.get(&cur).map(|v| v.as_slice()).unwrap_or(&[]) {
                if seen.insert((parent.clone(), role)) {
                    mapping.role_mut(role).push(Artist::aliased(parent));
                    unvisited.push(parent.clone());
                }
            }
        }
    }
    Ok(mapping)
}

/// All names an artist filter should match: the artist plus its transitive aliases.
fn all_artist_aliases(c: &Config, artist: &str) -> Vec<String> {
    let mut aliases = Vec::new();
    let mut unvisited = vec![artist.to_string()];
    while let Some(cur) = unvisited.pop() {
        if aliases.contains(&cur) {
            continue;
        }
        if let Some(children) = c.artist_aliases_map.get(&cur) {
            unvisited.extend(children.iter().cloned());
        }
        aliases.push(cur);
    }
    aliases
}

/// Hash the semantically-meaningful content of an entity, so that rebuild equivalence is
/// checkable and change records can be deduplicated.
pub(crate) fn compute_metahash<T: Serialize>(entity: &T) -> String {
    sha256_hex(serde_json::to_string(entity).unwrap_or_default().as_bytes())
}

pub(crate) fn cached_release_from_view(c: &Config, row: &Row, aliases: bool) -> Result<Release> {
    let genres = split_sql_array(&row.get::<_, String>("genres")?);
    let secondary_genres = split_sql_array(&row.get::<_, String>("secondary_genres")?);
    Ok(Release {
        id: row.get("id")?,
        source_path: PathBuf::from(row.get::<_, String>("source_path")?),
        cover_image_path: row.get::<_, Option<String>>("cover_image_path")?.map(PathBuf::from),
        added_at: row.get("added_at")?,
        datafile_mtime: row.get("datafile_mtime")?,
        releasetitle: row.get("releasetitle")?,
        releasetype: ReleaseType::from_str(&row.get::<_, String>("releasetype")?),
        releasedate: RoseDate::parse(row.get::<_, Option<String>>("releasedate")?.as_deref()),
        originaldate: RoseDate::parse(row.get::<_, Option<String>>("originaldate")?.as_deref()),
        compositiondate: RoseDate::parse(row.get::<_, Option<String>>("compositiondate")?.as_deref()),
        edition: row.get("edition")?,
        catalognumber: row.get("catalognumber")?,
        new: row.get("new")?,
        disctotal: row.get("disctotal")?,
        parent_genres: parent_genres_of(&genres),
        parent_secondary_genres: parent_genres_of(&secondary_genres),
        genres,
        secondary_genres,
        descriptors: split_sql_array(&row.get::<_, String>("descriptors")?),
        labels: split_sql_array(&row.get::<_, String>("labels")?),
        releaseartists: unpack_artists(
            c,
            &row.get::<_, String>("releaseartist_names")?,
            &row.get::<_, String>("releaseartist_roles")?,
            aliases,
        )?,
        metahash: row.get("metahash")?,
    })
}

pub(crate) fn cached_track_from_view(c: &Config, row: &Row, release: Arc<Release>, aliases: bool) -> Result<Track> {
    Ok(Track {
        id: row.get("id")?,
        source_path: PathBuf::from(row.get::<_, String>("source_path")?),
        source_mtime: row.get("source_mtime")?,
        virtual_filename: row.get("virtual_filename")?,
        tracktitle: row.get("tracktitle")?,
        tracknumber: row.get("tracknumber")?,
        tracktotal: row.get("tracktotal")?,
        discnumber: row.get("discnumber")?,
        formatted_position: row.get("formatted_position")?,
        duration_seconds: row.get("duration_seconds")?,
        trackartists: unpack_artists(
            c,
            &row.get::<_, String>("trackartist_names")?,
            &row.get::<_, String>("trackartist_roles")?,
            aliases,
        )?,
        metahash: row.get("metahash")?,
        release,
    })
}

// Read API. All reads go through the `releases_view`/`tracks_view` views; in-memory projections
// are assembled by join at read time, never by pointer graph.

/// Structural release predicate. This is not a rules-DSL matcher.
#[derive(Debug, Clone, Default)]
pub struct ReleaseFilter {
    pub artist: Option<String>,
    pub genre: Option<String>,
    pub label: Option<String>,
    pub descriptor: Option<String>,
    pub release_type: Option<ReleaseType>,
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
    pub new: Option<bool>,
    pub title_substring: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackFilter {
    pub artist: Option<String>,
    pub genre: Option<String>,
    pub label: Option<String>,
    pub descriptor: Option<String>,
    pub new: Option<bool>,
    pub title_substring: Option<String>,
}

fn escape_like(needle: &str) -> String {
    needle.replace('\\', r"\\").replace('%', r"\%").replace('_', r"\_")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn push_release_filter(
    c: &Config,
    filter: &ReleaseFilter,
    query: &mut String,
    args: &mut Vec<Box<dyn rusqlite::ToSql>>,
) {
    if let Some(artist) = &filter.artist {
        let artists = all_artist_aliases(c, artist);
        query.push_str(&format!(
            " AND EXISTS (
                SELECT * FROM releases_artists ra
                WHERE ra.release_id = rv.id AND ra.artist IN ({})
            )",
            placeholders(artists.len())
        ));
        args.extend(artists.into_iter().map(|a| Box::new(a) as Box<dyn rusqlite::ToSql>));
    }
    if let Some(genre) = &filter.genre {
        let mut genres = vec![genre.clone()];
        genres.extend(transitive_child_genres(genre));
        let ph = placeholders(genres.len());
        query.push_str(&format!(
            " AND (
                EXISTS (SELECT * FROM releases_genres WHERE release_id = rv.id AND genre IN ({ph}))
                OR EXISTS (SELECT * FROM releases_secondary_genres WHERE release_id = rv.id AND genre IN ({ph}))
            )"
        ));
        for _ in 0..2 {
            args.extend(genres.iter().cloned().map(|g| Box::new(g) as Box<dyn rusqlite::ToSql>));
        }
    }
    if let Some(label) = &filter.label {
        query.push_str(" AND EXISTS (SELECT * FROM releases_labels WHERE release_id = rv.id AND label = ?)");
        args.push(Box::new(label.clone()));
    }
    if let Some(descriptor) = &filter.descriptor {
        query.push_str(" AND EXISTS (SELECT * FROM releases_descriptors WHERE release_id = rv.id AND descriptor = ?)");
        args.push(Box::new(descriptor.clone()));
    }
    if let Some(rt) = filter.release_type {
        query.push_str(" AND rv.releasetype = ?");
        args.push(Box::new(rt.as_str().to_string()));
    }
    if let Some(year_min) = filter.year_min {
        query.push_str(" AND CAST(SUBSTR(rv.releasedate, 1, 4) AS INTEGER) >= ?");
        args.push(Box::new(year_min));
    }
    if let Some(year_max) = filter.year_max {
        query.push_str(" AND CAST(SUBSTR(rv.releasedate, 1, 4) AS INTEGER) <= ?");
        args.push(Box::new(year_max));
    }
    if let Some(new) = filter.new {
        query.push_str(" AND rv.new = ?");
        args.push(Box::new(new));
    }
    if let Some(needle) = &filter.title_substring {
        query.push_str(r" AND rv.releasetitle LIKE '%' || ? || '%' ESCAPE '\'");
        args.push(Box::new(escape_like(needle)));
    }
}

pub fn get_release(c: &Config, release_id: &str) -> Result<Option<Release>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare("SELECT * FROM releases_view WHERE id = ?1")?;
    let mut rows = stmt.query_and_then(params![release_id], |row| cached_release_from_view(c, row, true))?;
    rows.next().transpose()
}

pub fn list_releases(c: &Config, filter: Option<&ReleaseFilter>) -> Result<Vec<Release>> {
    let conn = connect(c)?;
    let mut query = "SELECT * FROM releases_view rv WHERE 1=1".to_string();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(filter) = filter {
        push_release_filter(c, filter, &mut query, &mut args);
    }
    query.push_str(" ORDER BY rv.source_path");
    let mut stmt = conn.prepare(&query)?;
    let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let rows = stmt.query_and_then(&params[..], |row| cached_release_from_view(c, row, true))?;
    rows.collect()
}

pub fn get_track(c: &Config, track_id: &str) -> Result<Option<Track>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare("SELECT * FROM tracks_view WHERE id = ?1")?;
    let release_id: Option<String> =
        stmt.query_row(params![track_id], |row| row.get("release_id")).optional()?;
    let Some(release_id) = release_id else { return Ok(None) };
    let release = get_release(c, &release_id)?.ok_or_else(|| RoseExpectedError::ReleaseDoesNotExist {
        id: release_id.clone(),
    })?;
    let release = Arc::new(release);
    let mut rows =
        stmt.query_and_then(params![track_id], |row| cached_track_from_view(c, row, release.clone(), true))?;
    rows.next().transpose()
}

pub fn get_tracks_of_release(c: &Config, release: &Release) -> Result<Vec<Track>> {
    let conn = connect(c)?;
    let release = Arc::new(release.clone());
    let mut stmt = conn.prepare(
        "SELECT * FROM tracks_view WHERE release_id = ?1 ORDER BY formatted_position, source_path",
    )?;
    let rows = stmt.query_and_then(params![release.id], |row| cached_track_from_view(c, row, release.clone(), true))?;
    rows.collect()
}

pub fn list_tracks(c: &Config, filter: Option<&TrackFilter>) -> Result<Vec<Track>> {
    let conn = connect(c)?;
    let mut query = "SELECT tv.* FROM tracks_view tv JOIN releases_view rv ON rv.id = tv.release_id WHERE 1=1".to_string();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(filter) = filter {
        if let Some(artist) = &filter.artist {
            let artists = all_artist_aliases(c, artist);
            let ph = placeholders(artists.len());
            query.push_str(&format!(
                " AND (
                    EXISTS (SELECT * FROM tracks_artists ta WHERE ta.track_id = tv.id AND ta.artist IN ({ph}))
                    OR EXISTS (SELECT * FROM releases_artists ra WHERE ra.release_id = tv.release_id AND ra.artist IN ({ph}))
                )"
            ));
            for _ in 0..2 {
                args.extend(artists.iter().cloned().map(|a| Box::new(a) as Box<dyn rusqlite::ToSql>));
            }
        }
        if let Some(genre) = &filter.genre {
            let mut genres = vec![genre.clone()];
            genres.extend(transitive_child_genres(genre));
            let ph = placeholders(genres.len());
            query.push_str(&format!(
                " AND (
                    EXISTS (SELECT * FROM releases_genres WHERE release_id = tv.release_id AND genre IN ({ph}))
                    OR EXISTS (SELECT * FROM releases_secondary_genres WHERE release_id = tv.release_id AND genre IN ({ph}))
                )"
            ));
            for _ in 0..2 {
                args.extend(genres.iter().cloned().map(|g| Box::new(g) as Box<dyn rusqlite::ToSql>));
            }
        }
        if let Some(label) = &filter.label {
            query.push_str(" AND EXISTS (SELECT * FROM releases_labels WHERE release_id = tv.release_id AND label = ?)");
            args.push(Box::new(label.clone()));
        }
        if let Some(descriptor) = &filter.descriptor {
            query.push_str(
                " AND EXISTS (SELECT * FROM releases_descriptors WHERE release_id = tv.release_id AND descriptor = ?)",
            );
            args.push(Box::new(descriptor.clone()));
        }
        if let Some(new) = filter.new {
            query.push_str(" AND rv.new = ?");
            args.push(Box::new(new));
        }
        if let Some(needle) = &filter.title_substring {
            query.push_str(r" AND tv.tracktitle LIKE '%' || ? || '%' ESCAPE '\'");
            args.push(Box::new(escape_like(needle)));
        }
    }
    query.push_str(" ORDER BY tv.source_path");

    struct TrackRow {
        release_id: String,
        track_id: String,
    }
    let mut stmt = conn.prepare(&query)?;
    let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let trackrows: Vec<TrackRow> = stmt
        .query_map(&params[..], |row| {
            Ok(TrackRow { release_id: row.get("release_id")?, track_id: row.get("id")? })
        })?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    // Assemble the release projections once, then join the tracks onto them.
    let release_ids: Vec<String> = trackrows.iter().map(|r| r.release_id.clone()).collect();
    let mut releases_map = std::collections::HashMap::new();
    if !release_ids.is_empty() {
        let sql = format!("SELECT * FROM releases_view WHERE id IN ({})", placeholders(release_ids.len()));
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = release_ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_and_then(&params[..], |row| cached_release_from_view(c, row, true))?;
        for release in rows {
            let release = release?;
            releases_map.insert(release.id.clone(), Arc::new(release));
        }
    }

    let mut rval = Vec::with_capacity(trackrows.len());
    let mut stmt = conn.prepare("SELECT * FROM tracks_view WHERE id = ?1")?;
    for tr in trackrows {
        let Some(release) = releases_map.get(&tr.release_id) else { continue };
        let mut rows =
            stmt.query_and_then(params![tr.track_id], |row| cached_track_from_view(c, row, release.clone(), true))?;
        if let Some(track) = rows.next().transpose()? {
            rval.push(track);
        }
    }
    Ok(rval)
}

pub fn list_collages(c: &Config) -> Result<Vec<Collage>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare("SELECT name, source_mtime FROM collages ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(Collage { name: row.get(0)?, source_mtime: row.get(1)? })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn get_collage(c: &Config, collage_name: &str) -> Result<Option<Collage>> {
    let conn = connect(c)?;
    Ok(conn
        .query_row("SELECT name, source_mtime FROM collages WHERE name = ?1", params![collage_name], |row| {
            Ok(Collage { name: row.get(0)?, source_mtime: row.get(1)? })
        })
        .optional()?)
}

/// The releases of a collage, in manifest order, excluding missing members.
pub fn list_releases_by_collage(c: &Config, collage_name: &str) -> Result<Vec<Release>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare(
        "
        SELECT rv.*
        FROM releases_view rv
        JOIN collages_releases cr ON cr.release_id = rv.id
        WHERE cr.collage_name = ?1 AND NOT cr.missing
        ORDER BY cr.position ASC
        ",
    )?;
    let rows = stmt.query_and_then(params![collage_name], |row| cached_release_from_view(c, row, true))?;
    rows.collect()
}

pub fn list_playlists(c: &Config) -> Result<Vec<Playlist>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare("SELECT name, source_mtime, cover_path FROM playlists ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(Playlist {
            name: row.get(0)?,
            source_mtime: row.get(1)?,
            cover_path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn get_playlist(c: &Config, playlist_name: &str) -> Result<Option<Playlist>> {
    let conn = connect(c)?;
    Ok(conn
        .query_row(
            "SELECT name, source_mtime, cover_path FROM playlists WHERE name = ?1",
            params![playlist_name],
            |row| {
                Ok(Playlist {
                    name: row.get(0)?,
                    source_mtime: row.get(1)?,
                    cover_path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
                })
            },
        )
        .optional()?)
}

/// The tracks of a playlist, in manifest order, excluding missing members.
pub fn list_tracks_by_playlist(c: &Config, playlist_name: &str) -> Result<Vec<Track>> {
    let conn = connect(c)?;
    struct MemberRow {
        track_id: String,
        release_id: String,
    }
    let mut stmt = conn.prepare(
        "
        SELECT tv.id, tv.release_id
        FROM tracks_view tv
        JOIN playlists_tracks pt ON pt.track_id = tv.id
        WHERE pt.playlist_name = ?1 AND NOT pt.missing
        ORDER BY pt.position ASC
        ",
    )?;
    let members: Vec<MemberRow> = stmt
        .query_map(params![playlist_name], |row| {
            Ok(MemberRow { track_id: row.get(0)?, release_id: row.get(1)? })
        })?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    let mut rval = Vec::with_capacity(members.len());
    let mut stmt = conn.prepare("SELECT * FROM tracks_view WHERE id = ?1")?;
    let mut releases_cache: std::collections::HashMap<String, Arc<Release>> = std::collections::HashMap::new();
    for member in members {
        let release = match releases_cache.get(&member.release_id) {
            Some(r) => r.clone(),
            None => {
                let release = Arc::new(get_release(c, &member.release_id)?.ok_or_else(|| {
                    RoseExpectedError::ReleaseDoesNotExist { id: member.release_id.clone() }
                })?);
                releases_cache.insert(member.release_id.clone(), release.clone());
                release
            }
        };
        let mut rows =
            stmt.query_and_then(params![member.track_id], |row| cached_track_from_view(c, row, release.clone(), true))?;
        if let Some(track) = rows.next().transpose()? {
            rval.push(track);
        }
    }
    Ok(rval)
}

pub fn list_artists(c: &Config) -> Result<Vec<String>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT artist FROM (
            SELECT artist FROM releases_artists
            UNION SELECT artist FROM tracks_artists
        ) ORDER BY artist",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn artist_exists(c: &Config, artist: &str) -> Result<bool> {
    let artists = all_artist_aliases(c, artist);
    let conn = connect(c)?;
    let sql = format!(
        "SELECT EXISTS(
            SELECT * FROM releases_artists WHERE artist IN ({ph})
            UNION SELECT * FROM tracks_artists WHERE artist IN ({ph})
        )",
        ph = placeholders(artists.len())
    );
    let mut params: Vec<&dyn rusqlite::ToSql> = Vec::new();
    for a in &artists {
        params.push(a);
    }
    for a in &artists {
        params.push(a);
    }
    Ok(conn.query_row(&sql, &params[..], |row| row.get(0))?)
}

/// List genres in use, each annotated with whether every release carrying it is still new. Parent
/// genres inherit the annotation from their children.
pub fn list_genres(c: &Config) -> Result<Vec<GenreEntry>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare(
        "
        SELECT rg.genre, MIN(r.id) AS has_non_new_release
        FROM releases_genres rg
        LEFT JOIN releases r ON r.id = rg.release_id AND NOT r.new
        GROUP BY rg.genre
        ",
    )?;
    let rows: Vec<(String, Option<String>)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut rval: std::collections::BTreeMap<String, bool> = std::collections::BTreeMap::new();
    for (genre, has_non_new) in rows {
        let only_new = has_non_new.is_none();
        for parent in transitive_parent_genres(&genre) {
            let acc = rval.entry(parent).or_insert(true);
            *acc = *acc && only_new;
        }
        let acc = rval.entry(genre).or_insert(true);
        *acc = *acc && only_new;
    }
    Ok(rval.into_iter().map(|(genre, only_new_releases)| GenreEntry { genre, only_new_releases }).collect())
}

pub fn genre_exists(c: &Config, genre: &str) -> Result<bool> {
    let mut genres = vec![genre.to_string()];
    genres.extend(transitive_child_genres(genre));
    let conn = connect(c)?;
    let sql = format!(
        "SELECT EXISTS(SELECT * FROM releases_genres WHERE genre IN ({}))",
        placeholders(genres.len())
    );
    let params: Vec<&dyn rusqlite::ToSql> = genres.iter().map(|g| g as &dyn rusqlite::ToSql).collect();
    Ok(conn.query_row(&sql, &params[..], |row| row.get(0))?)
}

pub fn list_labels(c: &Config) -> Result<Vec<LabelEntry>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare(
        "
        SELECT rl.label, MIN(r.id) AS has_non_new_release
        FROM releases_labels rl
        LEFT JOIN releases r ON r.id = rl.release_id AND NOT r.new
        GROUP BY rl.label
        ORDER BY rl.label
        ",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(LabelEntry { label: row.get(0)?, only_new_releases: row.get::<_, Option<String>>(1)?.is_none() })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn label_exists(c: &Config, label: &str) -> Result<bool> {
    let conn = connect(c)?;
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT * FROM releases_labels WHERE label = ?1)",
        params![label],
        |row| row.get(0),
    )?)
}

pub fn list_descriptors(c: &Config) -> Result<Vec<DescriptorEntry>> {
    let conn = connect(c)?;
    let mut stmt = conn.prepare(
        "
        SELECT rd.descriptor, MIN(r.id) AS has_non_new_release
        FROM releases_descriptors rd
        LEFT JOIN releases r ON r.id = rd.release_id AND NOT r.new
        GROUP BY rd.descriptor
        ORDER BY rd.descriptor
        ",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(DescriptorEntry { descriptor: row.get(0)?, only_new_releases: row.get::<_, Option<String>>(1)?.is_none() })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn descriptor_exists(c: &Config, descriptor: &str) -> Result<bool> {
    let conn = connect(c)?;
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT * FROM releases_descriptors WHERE descriptor = ?1)",
        params![descriptor],
        |row| row.get(0),
    )?)
}

/// `"[date] artists - title"` for a release: the display form used in collage manifests and logs.
pub fn make_release_descriptor(
    releasetitle: &str,
    releasedate: Option<RoseDate>,
    originaldate: Option<RoseDate>,
    artists: &ArtistMapping,
) -> String {
    let date = originaldate.or(releasedate);
    let datepart = match date {
        Some(d) => format!("[{}]", RoseDate { month: d.month.or(Some(1)), day: d.day.or(Some(1)), ..d }),
        None => "[0000-00-00]".to_string(),
    };
    format!("{datepart} {} - {releasetitle}", artistsfmt(artists))
}

/// `"artists - title"` for a track: the display form used in playlist manifests and logs.
pub fn make_track_descriptor(tracktitle: &str, artists: &ArtistMapping) -> String {
    format!("{} - {tracktitle}", artistsfmt(artists))
}
