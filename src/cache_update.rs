/// The cache update sequence: diff the source tree against the cache and converge them.
///
/// Three problems shape this module:
///
/// 1. **Arbitrary renames:** files and directories can be renamed between scans. We survive them
///    by writing stable identifiers to disk: a release sidecar and embedded track tags.
/// 2. **In-progress directory creation:** a directory may be observed mid-copy. Unless `force` is
///    passed, we skip directories that lack a sidecar yet have audio files with embedded IDs.
/// 3. **Performance:** disk access is the bottleneck, so we stat before we read, read only files
///    whose mtimes changed, and batch all database writes into one transaction per cycle.
///
/// Workers are stateless with respect to the write path: they read the filesystem and their own
/// read connection, mutate only the release they were assigned, and return one change record per
/// release over a channel. The controlling context applies every record in a single transaction,
/// maintains the FTS index, and then cascades manifest rescans for affected collages/playlists.
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::audiotags::{is_supported_audio_path, AudioTags, RoseDate};
use crate::cache::{
    cached_release_from_view, collage_lock_name, compute_metahash, connect, lock,
    make_release_descriptor, make_track_descriptor, maybe_invalidate_cache_database,
    playlist_lock_name, unpack_artists, Release, CACHE_UPDATE_LOCK,
};
use crate::common::{
    compare_strs, mint_id, sanitize_dirname, sanitize_filename, truncate_to_bytes, uniq, Artist,
    ArtistMapping, ArtistRole, ReleaseType,
};
use crate::config::Config;
use crate::datafiles::{datafile_id_from_name, datafile_path, read_datafile, write_datafile, StoredDataFile};
use crate::error::{Result, RoseError, RoseExpectedError};
use crate::templates::{evaluate_release_template, evaluate_track_template};

/// How long the orchestrator's lease on the cache-update lock lasts. A cycle that exceeds this
/// has lost mutual exclusion and aborts instead of committing further work.
const CACHE_UPDATE_LEASE_SECS: f64 = 900.0;

const COLLAGES_DIR: &str = "!collages";
const PLAYLISTS_DIR: &str = "!playlists";

/// Update the read cache to match the source directory: all releases, then evictions, then
/// collages and playlists. This is the single entry point per library mutation cycle; it holds
/// the cross-process cache-update lock for the duration.
pub fn update_cache(c: &Config, force: bool) -> Result<()> {
    maybe_invalidate_cache_database(c)?;
    let lk = lock(c, CACHE_UPDATE_LOCK, CACHE_UPDATE_LEASE_SECS)?;
    update_cache_for_releases(c, None, force)?;
    update_cache_evict_nonexistent_releases(c)?;
    if lk.expired() {
        return Err(RoseError::CacheUpdate(
            "cache-update lock lease expired mid-cycle; aborting before manifest updates".to_string(),
        ));
    }
    update_cache_for_collages(c, None, force)?;
    update_cache_evict_nonexistent_collages(c)?;
    update_cache_for_playlists(c, None, force)?;
    update_cache_evict_nonexistent_playlists(c)?;
    Ok(())
}

fn mtime_string(path: &Path) -> Result<String> {
    let meta = fs::metadata(path)?;
    let mtime = meta.modified()?;
    let d = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();
    Ok(format!("{}.{:09}", d.as_secs(), d.subsec_nanos()))
}

/// A track as the scanner sees it: the cached row shape, without the release projection.
#[derive(Debug, Clone, Serialize)]
struct TrackScan {
    id: String,
    source_path: PathBuf,
    source_mtime: String,
    virtual_filename: String,
    tracktitle: String,
    tracknumber: String,
    tracktotal: i32,
    discnumber: String,
    formatted_position: String,
    duration_seconds: i32,
    trackartists: ArtistMapping,
}

/// The per-release output of a scanner worker: everything the controlling context needs to apply
/// in the cycle's write transaction.
enum ReleaseChangeRecord {
    /// The directory has no readable tracks; drop it from the cache if present.
    Evict { source_path: PathBuf },
    Upsert {
        release: Release,
        release_dirty: bool,
        /// Source paths of cached tracks that are no longer on disk.
        deleted_track_paths: Vec<String>,
        /// Tracks whose rows must be (re)written.
        dirty_tracks: Vec<TrackScan>,
    },
}

/// Update the read cache for the given release directories (all of them when None). Mints or
/// preserves identifiers, writes sidecars and embedded tags, plans renames, and applies one write
/// transaction for the whole batch.
pub fn update_cache_for_releases(c: &Config, release_dirs: Option<Vec<PathBuf>>, force: bool) -> Result<()> {
    let release_dirs = match release_dirs {
        Some(dirs) => dirs,
        None => {
            let mut dirs = Vec::new();
            for entry in fs::read_dir(&c.music_source_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    dirs.push(entry.path());
                }
            }
            dirs
        }
    };
    let release_dirs: Vec<PathBuf> = release_dirs
        .into_iter()
        .filter(|d| {
            d.file_name()
                .and_then(|n| n.to_str())
                .map(|name| {
                    name != COLLAGES_DIR
                        && name != PLAYLISTS_DIR
                        && !c.ignore_release_directories.contains(&name.to_string())
                })
                .unwrap_or(true)
        })
        .collect();
    if release_dirs.is_empty() {
        debug!("No-Op: no whitelisted releases passed into update_cache_for_releases");
        return Ok(());
    }
    debug!("Refreshing the read cache for {} releases", release_dirs.len());

    // Partition the releases across the worker pool. Workers share only read state; each sends a
    // per-release result back over the channel and never touches the write path.
    let num_workers = c.max_proc.max(1).min(release_dirs.len());
    let batch_size = release_dirs.len().div_ceil(num_workers);
    let mut results: Vec<Result<Option<ReleaseChangeRecord>>> = Vec::with_capacity(release_dirs.len());
    std::thread::scope(|s| {
        let (tx, rx) = mpsc::channel::<Result<Option<ReleaseChangeRecord>>>();
        for batch in release_dirs.chunks(batch_size) {
            let tx = tx.clone();
            s.spawn(move || {
                let conn = match connect(c) {
                    Ok(conn) => conn,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                for dir in batch {
                    let _ = tx.send(scan_release_dir(c, &conn, dir, force));
                }
            });
        }
        drop(tx);
        for result in rx {
            results.push(result);
        }
    });

    // Per-release failures do not abort the scan: expected errors are logged and the release is
    // skipped. Anything else aborts the cycle before the transaction opens.
    let mut records = Vec::new();
    for result in results {
        match result {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(RoseError::Expected(e)) => warn!("Skipping release: {e}"),
            Err(e) => return Err(e),
        }
    }
    if records.is_empty() {
        return Ok(());
    }

    let mut conn = connect(c)?;
    let (update_collages, update_playlists) = apply_release_change_records(c, &mut conn, records)?;
    drop(conn);

    // Cascade: rescan every collage/playlist whose members were touched, in the same cycle, with
    // force on so description_meta strings stay synchronized with renames and edits.
    if !update_collages.is_empty() {
        update_cache_for_collages(c, Some(update_collages.as_slice()), true)?;
    }
    if !update_playlists.is_empty() {
        update_cache_for_playlists(c, Some(update_playlists.as_slice()), true)?;
    }
    Ok(())
}

/// Scan one release directory and compute its change record. Only this worker touches this
/// directory's files.
fn scan_release_dir(
    c: &Config,
    conn: &Connection,
    dir: &Path,
    force: bool,
) -> Result<Option<ReleaseChangeRecord>> {
    if !dir.is_dir() {
        debug!("Skipping scan of {} because it is not a directory", dir.display());
        return Ok(None);
    }
    debug!("Scanning release {}", dir.display());

    let mut files: Vec<PathBuf> = Vec::new();
    let mut datafile_ids: Vec<String> = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(datafile_id_from_name) {
            datafile_ids.push(id);
        }
        files.push(entry.path().to_path_buf());
    }
    files.sort();

    if datafile_ids.len() > 1 {
        return Err(RoseExpectedError::DuplicateDatafile { path: dir.to_path_buf() }.into());
    }
    let preexisting_release_id = datafile_ids.into_iter().next();

    let Some(first_audio_file) = files.iter().find(|f| is_supported_audio_path(f)).cloned() else {
        debug!("Did not find any audio files in {}, scheduling eviction", dir.display());
        return Ok(Some(ReleaseChangeRecord::Evict { source_path: dir.to_path_buf() }));
    };

    // Pull the cached state for this release, if any, through the worker's read connection.
    let cached = match &preexisting_release_id {
        Some(id) => fetch_cached_release(c, conn, id)?,
        None => None,
    };
    let (mut release, cached_tracks, mut release_dirty) = match cached {
        Some((release, tracks)) => (release, tracks, false),
        None => {
            debug!("First-time unidentified release found at {}", dir.display());
            (empty_release(dir, preexisting_release_id.clone().unwrap_or_default()), HashMap::new(), true)
        }
    };

    if release.source_path != dir {
        debug!("Source path change detected for {}, updating", dir.display());
        release.source_path = dir.to_path_buf();
        release_dirty = true;
    }

    // Resolve the sidecar. Creation is guarded against half-moved directories: audio files that
    // already embed a release id without a sidecar mean another tool may still be writing.
    match &preexisting_release_id {
        None => {
            let embedded_release_id =
                AudioTags::from_file(&first_audio_file).ok().and_then(|t| t.release_id);
            if let Some(embedded) = &embedded_release_id {
                if !force {
                    warn!(
                        "No-Op: skipping release at {}: files already have release_id {embedded} but the \
                         sidecar is missing; is another tool mid-write? Run with force to recreate it",
                        dir.display()
                    );
                    return Ok(None);
                }
            }
            let new_release_id = embedded_release_id.unwrap_or_else(mint_id);
            debug!("Creating new sidecar for release {}", dir.display());
            let datafile = StoredDataFile::new(new_release_id.clone());
            let dpath = datafile_path(dir, &new_release_id);
            write_datafile(&dpath, &datafile)?;
            release.id = new_release_id;
            release.new = datafile.release.new;
            release.added_at = datafile.release.added_at;
            release.datafile_mtime = mtime_string(&dpath)?;
            release_dirty = true;
        }
        Some(id) => {
            let dpath = datafile_path(dir, id);
            let datafile_mtime = match mtime_string(&dpath) {
                Ok(m) => m,
                Err(_) => {
                    warn!("Skipping update of {}: sidecar vanished mid-scan", dir.display());
                    return Ok(None);
                }
            };
            if datafile_mtime != release.datafile_mtime || force {
                debug!("Sidecar changed for release {}, updating", dir.display());
                release_dirty = true;
                release.datafile_mtime = datafile_mtime;
                let datafile = read_datafile(&dpath)?;
                release.new = datafile.release.new;
                release.added_at = datafile.release.added_at;
            }
        }
    }

    // Cover art.
    let valid_cover_arts = c.valid_cover_arts();
    let cover = files
        .iter()
        .find(|f| {
            f.file_name()
                .and_then(|n| n.to_str())
                .map(|n| valid_cover_arts.contains(&n.to_lowercase()))
                .unwrap_or(false)
        })
        .cloned();
    if cover != release.cover_image_path {
        debug!("Cover art change detected for release {}", dir.display());
        release.cover_image_path = cover;
        release_dirty = true;
    }

    // Diff the on-disk audio files against the cached tracks. Tracks still keyed in
    // `unknown_cached_tracks` at the end of the loop vanished from disk and get deleted.
    let mut unknown_cached_tracks: HashSet<String> =
        cached_tracks.keys().cloned().collect();
    let mut tracks: Vec<TrackScan> = Vec::new();
    let mut dirty_track_ids: HashSet<String> = HashSet::new();
    let mut read_tags: Vec<AudioTags> = Vec::new();
    let mut claimed_track_ids: HashSet<String> = HashSet::new();

    for f in files.iter().filter(|f| is_supported_audio_path(f)) {
        let fkey = f.to_string_lossy().to_string();
        let cached_track = cached_tracks.get(&fkey);
        unknown_cached_tracks.remove(&fkey);

        let track_mtime = match mtime_string(f) {
            Ok(m) => m,
            Err(_) => {
                warn!("Skipping track update for {}: file no longer exists", f.display());
                continue;
            }
        };
        if let Some(cached) = cached_track {
            if cached.source_mtime == track_mtime && !force {
                debug!("Track cache hit (mtime) for {}, reusing cached data", f.display());
                claimed_track_ids.insert(cached.id.clone());
                tracks.push(cached.clone());
                continue;
            }
        }

        debug!("Track cache miss for {}, reading tags from disk", f.display());
        let mut tags = match AudioTags::from_file(f) {
            Ok(tags) => tags,
            Err(RoseError::Expected(e)) => {
                warn!("Skipping unreadable track {}: {e}", f.display());
                continue;
            }
            Err(e) => return Err(e),
        };

        // Compute the track id. The id is embedded into the file for persistence across renames
        // and rebuilds; an embedded id already claimed by a different track is not reused.
        let embedded_usable = tags.id.as_ref().map(|id| !claimed_track_ids.contains(id)).unwrap_or(false);
        let mut track_mtime = track_mtime;
        if !embedded_usable || tags.release_id.as_deref() != Some(release.id.as_str()) {
            if !embedded_usable && tags.id.is_some() {
                debug!("Embedded track id on {} already claimed, minting a fresh id", f.display());
                tags.id = None;
            }
            tags.id = Some(tags.id.clone().unwrap_or_else(mint_id));
            tags.release_id = Some(release.id.clone());
            if let Err(e) = tags.flush(c) {
                warn!("Skipping track update for {}: failed to write ids: {e}", f.display());
                continue;
            }
            track_mtime = mtime_string(f)?;
        }
        let track_id = tags.id.clone().unwrap_or_default();
        claimed_track_ids.insert(track_id.clone());

        let track = TrackScan {
            id: track_id.clone(),
            source_path: f.clone(),
            source_mtime: track_mtime,
            virtual_filename: String::new(),
            tracktitle: tags.tracktitle.clone().unwrap_or_else(|| "Unknown Title".to_string()),
            // `.` is reserved for parsing out positions; it should almost never appear here.
            tracknumber: tags.tracknumber.clone().unwrap_or_else(|| "1".to_string()).replace('.', ""),
            tracktotal: tags.tracktotal.unwrap_or(1),
            discnumber: tags.discnumber.clone().unwrap_or_else(|| "1".to_string()).replace('.', ""),
            formatted_position: String::new(),
            duration_seconds: tags.duration_sec,
            trackartists: tags.trackartists.clone(),
        };
        dirty_track_ids.insert(track.id.clone());
        tracks.push(track);
        read_tags.push(tags);
    }

    if tracks.is_empty() {
        debug!("No readable tracks in {}, scheduling eviction", dir.display());
        return Ok(Some(ReleaseChangeRecord::Evict { source_path: dir.to_path_buf() }));
    }

    // Aggregate release-level state from the track set.
    if !read_tags.is_empty() {
        aggregate_release_fields(&mut release, &read_tags, &mut release_dirty);
    }
    if aggregate_release_artists(&mut release, &tracks) {
        release_dirty = true;
    }

    // Track and disc totals.
    let mut totals: HashMap<String, i32> = HashMap::new();
    for track in &tracks {
        *totals.entry(track.discnumber.clone()).or_insert(0) += 1;
    }
    let disctotal = totals.len() as i32;
    if release.disctotal != disctotal {
        release.disctotal = disctotal;
        release_dirty = true;
    }
    for track in tracks.iter_mut() {
        let tracktotal = totals[&track.discnumber];
        if tracktotal != track.tracktotal {
            track.tracktotal = tracktotal;
            dirty_track_ids.insert(track.id.clone());
        }
        let formatted_position = format!("{:0>4}.{:0>4}", track.discnumber, track.tracknumber);
        if formatted_position != track.formatted_position {
            track.formatted_position = formatted_position;
            dirty_track_ids.insert(track.id.clone());
        }
    }

    // Virtual filenames: template-rendered, sanitized, and unique within the release. Collisions
    // are suffixed deterministically in disc/track order.
    tracks.sort_by(|a, b| a.formatted_position.cmp(&b.formatted_position).then(a.source_path.cmp(&b.source_path)));
    assign_virtual_filenames(c, &release, &mut tracks, &mut dirty_track_ids)?;

    // Source renames, when configured. The rename target is always at the release root, so nested
    // files are flattened and emptied subdirectories removed.
    if c.rename_source_files {
        execute_renames(c, &mut release, &mut tracks, &mut dirty_track_ids, release_dirty)?;
    }

    if release_dirty || !dirty_track_ids.is_empty() || !unknown_cached_tracks.is_empty() {
        info!("Updating cache for release {}", release.source_path.display());
    } else {
        return Ok(None);
    }

    let dirty_tracks: Vec<TrackScan> =
        tracks.into_iter().filter(|t| dirty_track_ids.contains(&t.id)).collect();
    Ok(Some(ReleaseChangeRecord::Upsert {
        release,
        release_dirty,
        deleted_track_paths: unknown_cached_tracks.into_iter().collect(),
        dirty_tracks,
    }))
}

fn empty_release(dir: &Path, id: String) -> Release {
    Release {
        id,
        source_path: dir.to_path_buf(),
        cover_image_path: None,
        added_at: String::new(),
        datafile_mtime: String::new(),
        releasetitle: String::new(),
        releasetype: ReleaseType::Unknown,
        releasedate: None,
        originaldate: None,
        compositiondate: None,
        edition: None,
        catalognumber: None,
        new: true,
        disctotal: 0,
        genres: Vec::new(),
        parent_genres: Vec::new(),
        secondary_genres: Vec::new(),
        parent_secondary_genres: Vec::new(),
        descriptors: Vec::new(),
        labels: Vec::new(),
        releaseartists: ArtistMapping::default(),
        metahash: String::new(),
    }
}

type CachedTracksByPath = HashMap<String, TrackScan>;

fn fetch_cached_release(
    c: &Config,
    conn: &Connection,
    release_id: &str,
) -> Result<Option<(Release, CachedTracksByPath)>> {
    let mut stmt = conn.prepare("SELECT * FROM releases_view WHERE id = ?1")?;
    let mut rows = stmt.query_and_then(params![release_id], |row| cached_release_from_view(c, row, false))?;
    let Some(release) = rows.next().transpose()? else {
        return Ok(None);
    };
    drop(rows);
    drop(stmt);

    let mut tracks = HashMap::new();
    let mut stmt = conn.prepare("SELECT * FROM tracks_view WHERE release_id = ?1")?;
    let mut rows = stmt.query(params![release_id])?;
    while let Some(row) = rows.next()? {
        let track = TrackScan {
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
                false,
            )?,
        };
        tracks.insert(track.source_path.to_string_lossy().to_string(), track);
    }
    Ok(Some((release, tracks)))
}

fn vote<T: Clone + Eq + std::hash::Hash + Ord>(values: impl Iterator<Item = T>) -> Option<T> {
    let mut counts: HashMap<T, usize> = HashMap::new();
    for v in values {
        *counts.entry(v).or_insert(0) += 1;
    }
    // Majority wins; ties break to the smallest value so the outcome is deterministic.
    counts.into_iter().max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0))).map(|(v, _)| v)
}

fn date_key(d: &RoseDate) -> (i32, u32, u32) {
    (d.year, d.month.unwrap_or(0), d.day.unwrap_or(0))
}

fn vote_date(values: impl Iterator<Item = Option<RoseDate>>) -> Option<RoseDate> {
    let keyed: Vec<(i32, u32, u32)> = values.flatten().map(|d| date_key(&d)).collect();
    vote(keyed.into_iter()).map(|(year, month, day)| RoseDate {
        year,
        month: if month == 0 { None } else { Some(month) },
        day: if day == 0 { None } else { Some(day) },
    })
}

/// Derive release-level fields from the tags read this scan, by majority vote across tracks. The
/// multi-valued sets are ordered unions instead.
fn aggregate_release_fields(release: &mut Release, tags: &[AudioTags], dirty: &mut bool) {
    let releasetitle = vote(tags.iter().filter_map(|t| t.releasetitle.clone()))
        .unwrap_or_else(|| "Unknown Release".to_string());
    if releasetitle != release.releasetitle {
        release.releasetitle = releasetitle;
        *dirty = true;
    }

    let releasetype = vote(tags.iter().map(|t| t.releasetype).filter(|rt| *rt != ReleaseType::Unknown))
        .unwrap_or(ReleaseType::Unknown);
    if releasetype != release.releasetype {
        release.releasetype = releasetype;
        *dirty = true;
    }

    let originaldate = vote_date(tags.iter().map(|t| t.originaldate));
    let compositiondate = vote_date(tags.iter().map(|t| t.compositiondate));
    let releasedate = vote_date(tags.iter().map(|t| t.releasedate)).or(originaldate).or(compositiondate);
    if releasedate != release.releasedate {
        release.releasedate = releasedate;
        *dirty = true;
    }
    if originaldate != release.originaldate {
        release.originaldate = originaldate;
        *dirty = true;
    }
    if compositiondate != release.compositiondate {
        release.compositiondate = compositiondate;
        *dirty = true;
    }

    let edition = vote(tags.iter().filter_map(|t| t.edition.clone()));
    if edition != release.edition {
        release.edition = edition;
        *dirty = true;
    }
    let catalognumber = vote(tags.iter().filter_map(|t| t.catalognumber.clone()));
    if catalognumber != release.catalognumber {
        release.catalognumber = catalognumber;
        *dirty = true;
    }

    let genres = uniq(tags.iter().flat_map(|t| t.genre.iter().cloned()).collect());
    if genres != release.genres {
        release.parent_genres = crate::cache::parent_genres_of(&genres);
        release.genres = genres;
        *dirty = true;
    }
    let secondary = uniq(tags.iter().flat_map(|t| t.secondarygenre.iter().cloned()).collect());
    if secondary != release.secondary_genres {
        release.parent_secondary_genres = crate::cache::parent_genres_of(&secondary);
        release.secondary_genres = secondary;
        *dirty = true;
    }
    let descriptors = uniq(tags.iter().flat_map(|t| t.descriptor.iter().cloned()).collect());
    if descriptors != release.descriptors {
        release.descriptors = descriptors;
        *dirty = true;
    }
    let labels = uniq(tags.iter().flat_map(|t| t.label.iter().cloned()).collect());
    if labels != release.labels {
        release.labels = labels;
        *dirty = true;
    }
}

/// The release artist roster is the most common artist set across tracks, per role. Votes run
/// over all tracks, cached and freshly read alike.
fn aggregate_release_artists(release: &mut Release, tracks: &[TrackScan]) -> bool {
    let mut roster = ArtistMapping::default();
    for role in ArtistRole::ALL {
        let keyed: Vec<String> = tracks
            .iter()
            .map(|t| serde_json::to_string(t.trackartists.role(role)).unwrap_or_default())
            .collect();
        if let Some(winner) = vote(keyed.into_iter()) {
            let artists: Vec<Artist> = serde_json::from_str(&winner).unwrap_or_default();
            *roster.role_mut(role) = artists;
        }
    }
    if roster != release.releaseartists {
        release.releaseartists = roster;
        true
    } else {
        false
    }
}

fn collision_suffixed(c: &Config, stem: &str, ext: &str, n: u32) -> String {
    let suffix = format!(" [{n}]");
    let budget = c.max_filename_bytes.saturating_sub(suffix.len() + ext.len());
    format!("{}{suffix}{ext}", truncate_to_bytes(stem, budget).trim_end())
}

fn split_ext(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) => name.split_at(pos),
        None => (name, ""),
    }
}

/// Render, sanitize, and deduplicate the virtual filename of every track. Tracks must already be
/// in disc/track order so numeric suffixes land deterministically.
fn assign_virtual_filenames(
    c: &Config,
    release: &Release,
    tracks: &mut [TrackScan],
    dirty_track_ids: &mut HashSet<String>,
) -> Result<()> {
    let mut seen: HashSet<String> = HashSet::new();
    for track in tracks.iter_mut() {
        let ext = track
            .source_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let mut rendered = track_for_template(c, release, track, &ext)?;
        // An empty render falls back to the track's original filename stem.
        if rendered == ext || rendered.is_empty() {
            let stem = track.source_path.file_stem().and_then(|s| s.to_str()).unwrap_or("Unknown");
            rendered = format!("{stem}{ext}");
        }
        let mut wanted = sanitize_filename(c, &rendered, true);
        let original_stem = split_ext(&wanted).0.to_string();
        let mut collision_no = 2;
        while !seen.insert(wanted.clone()) {
            if collision_no > 999 {
                return Err(RoseExpectedError::RenameCollision { name: rendered }.into());
            }
            wanted = collision_suffixed(c, &original_stem, &ext, collision_no);
            collision_no += 1;
        }
        if wanted != track.virtual_filename {
            track.virtual_filename = wanted;
            dirty_track_ids.insert(track.id.clone());
        }
    }
    Ok(())
}

fn track_for_template(c: &Config, release: &Release, track: &TrackScan, ext: &str) -> Result<String> {
    // Bridge the scanner's track shape into the template contract.
    let projected = crate::cache::Track {
        id: track.id.clone(),
        source_path: track.source_path.clone(),
        source_mtime: track.source_mtime.clone(),
        virtual_filename: track.virtual_filename.clone(),
        tracktitle: track.tracktitle.clone(),
        tracknumber: track.tracknumber.clone(),
        tracktotal: track.tracktotal,
        discnumber: track.discnumber.clone(),
        formatted_position: track.formatted_position.clone(),
        duration_seconds: track.duration_seconds,
        trackartists: track.trackartists.clone(),
        metahash: String::new(),
        release: Arc::new(release.clone()),
    };
    let rendered = evaluate_track_template(&c.path_templates.track, &projected, release)?;
    Ok(format!("{rendered}{ext}"))
}

/// Rename the release directory and track files to their rendered names. Nested tracks move to
/// the release root; directories emptied by the moves are removed bottom-up.
fn execute_renames(
    c: &Config,
    release: &mut Release,
    tracks: &mut [TrackScan],
    dirty_track_ids: &mut HashSet<String>,
    release_dirty: bool,
) -> Result<()> {
    if release_dirty {
        let rendered = evaluate_release_template(&c.path_templates.release, release)?;
        let mut wanted_dirname = sanitize_dirname(c, &rendered, true);
        let original_wanted = wanted_dirname.clone();
        let mut collision_no = 2;
        let current_name = release.source_path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
        let mut renamed_from: Option<PathBuf> = None;
        while !compare_strs(&wanted_dirname, release.source_path.file_name().and_then(|n| n.to_str()).unwrap_or("")) {
            let new_source_path = release.source_path.with_file_name(&wanted_dirname);
            if new_source_path.exists() {
                if collision_no > 999 {
                    return Err(RoseExpectedError::RenameCollision { name: original_wanted }.into());
                }
                wanted_dirname = collision_suffixed(c, &original_wanted, "", collision_no);
                collision_no += 1;
                continue;
            }
            fs::rename(&release.source_path, &new_source_path)?;
            info!("Renamed source release directory {current_name} to {wanted_dirname}");
            renamed_from = Some(release.source_path.clone());
            release.source_path = new_source_path;
            break;
        }
        if let Some(old_source_path) = renamed_from {
            if let Some(cover) = &release.cover_image_path {
                if let Ok(rel) = cover.strip_prefix(&old_source_path) {
                    release.cover_image_path = Some(release.source_path.join(rel));
                }
            }
            for track in tracks.iter_mut() {
                let old_track_path = track.source_path.clone();
                if let Ok(rel) = old_track_path.strip_prefix(&old_source_path) {
                    track.source_path = release.source_path.join(rel);
                    track.source_mtime = mtime_string(&track.source_path)?;
                    dirty_track_ids.insert(track.id.clone());
                }
            }
        }
    }

    for track in tracks.iter_mut() {
        if !dirty_track_ids.contains(&track.id) {
            continue;
        }
        let relpath = track
            .source_path
            .strip_prefix(&release.source_path)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut wanted_filename = track.virtual_filename.clone();
        let (original_stem, ext) = split_ext(&track.virtual_filename);
        let (original_stem, ext) = (original_stem.to_string(), ext.to_string());
        let mut collision_no = 2;
        while !compare_strs(&wanted_filename, &relpath) {
            let new_source_path = release.source_path.join(&wanted_filename);
            if new_source_path.exists() {
                if collision_no > 999 {
                    return Err(RoseExpectedError::RenameCollision { name: wanted_filename }.into());
                }
                wanted_filename = collision_suffixed(c, &original_stem, &ext, collision_no);
                collision_no += 1;
                continue;
            }
            fs::rename(&track.source_path, &new_source_path)?;
            info!(
                "Renamed source file {relpath} to {wanted_filename} in {}",
                release.source_path.display()
            );
            track.source_path = new_source_path;
            track.source_mtime = mtime_string(&track.source_path)?;
            track.virtual_filename = wanted_filename.clone();
            // Clean out any directories the move emptied, bottom-up.
            let mut parent = PathBuf::from(&relpath);
            while let Some(dirname) = parent.parent().map(|p| p.to_path_buf()) {
                if dirname.as_os_str().is_empty() {
                    break;
                }
                let abs = release.source_path.join(&dirname);
                let is_empty = abs.is_dir() && abs.read_dir().map(|mut d| d.next().is_none()).unwrap_or(false);
                if !is_empty {
                    break;
                }
                let _ = fs::remove_dir(&abs);
                parent = dirname;
            }
            break;
        }
    }
    Ok(())
}

/// Apply all change records in a single write transaction, maintain the FTS index, and compute
/// which collages/playlists reference the touched entities.
fn apply_release_change_records(
    c: &Config,
    conn: &mut Connection,
    records: Vec<ReleaseChangeRecord>,
) -> Result<(Vec<String>, Vec<String>)> {
    let tx = conn.transaction()?;
    let mut upd_release_ids: Vec<String> = Vec::new();
    let mut upd_track_ids: Vec<String> = Vec::new();
    let mut touched_release_ids: Vec<String> = Vec::new();
    let mut touched_track_ids: Vec<String> = Vec::new();

    for record in &records {
        match record {
            ReleaseChangeRecord::Evict { source_path } => {
                let release_id: Option<String> = tx
                    .query_row(
                        "SELECT id FROM releases WHERE source_path = ?1",
                        params![source_path.to_string_lossy()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(release_id) = release_id else { continue };
                evict_release(&tx, &release_id, &mut touched_track_ids)?;
                touched_release_ids.push(release_id);
            }
            ReleaseChangeRecord::Upsert { release, release_dirty, deleted_track_paths, dirty_tracks } => {
                for path in deleted_track_paths {
                    let deleted: Option<(String, i64)> = tx
                        .query_row(
                            "SELECT id, rowid FROM tracks WHERE release_id = ?1 AND source_path = ?2",
                            params![release.id, path],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?;
                    let Some((track_id, rowid)) = deleted else { continue };
                    tx.execute("DELETE FROM rules_engine_fts WHERE rowid = ?1", params![rowid])?;
                    tx.execute("DELETE FROM tracks WHERE id = ?1", params![track_id])?;
                    touched_track_ids.push(track_id);
                }
                if *release_dirty {
                    upsert_release_row(c, &tx, release)?;
                    upd_release_ids.push(release.id.clone());
                    touched_release_ids.push(release.id.clone());
                }
                for track in dirty_tracks {
                    upsert_track_row(c, &tx, release, track)?;
                    upd_track_ids.push(track.id.clone());
                    touched_track_ids.push(track.id.clone());
                }
            }
        }
    }

    update_fts(&tx, &upd_release_ids, &upd_track_ids)?;

    // Identify the collages and playlists to cascade onto. We do not try to be precise: any
    // membership overlap with the touched entities queues a force rescan, which is cheap. The
    // membership tables have no foreign keys, so evicted ids still resolve here.
    let update_collages = affected_collages(&tx, &touched_release_ids)?;
    let update_playlists = affected_playlists(&tx, &touched_track_ids)?;

    tx.commit()?;
    Ok((update_collages, update_playlists))
}

/// Delete a release row and its tracks, with FTS cleanup, recording the track ids for the
/// playlist cascade. The row cascade handles the link tables.
fn evict_release(
    tx: &rusqlite::Transaction,
    release_id: &str,
    touched_track_ids: &mut Vec<String>,
) -> Result<()> {
    let mut stmt = tx.prepare("SELECT id FROM tracks WHERE release_id = ?1")?;
    let track_ids: Vec<String> =
        stmt.query_map(params![release_id], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
    drop(stmt);
    touched_track_ids.extend(track_ids);
    tx.execute(
        "DELETE FROM rules_engine_fts WHERE rowid IN (SELECT rowid FROM tracks WHERE release_id = ?1)",
        params![release_id],
    )?;
    tx.execute("DELETE FROM releases WHERE id = ?1", params![release_id])?;
    Ok(())
}

fn affected_collages(tx: &rusqlite::Transaction, release_ids: &[String]) -> Result<Vec<String>> {
    if release_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT DISTINCT collage_name FROM collages_releases
         WHERE release_id IN ({}) ORDER BY collage_name",
        vec!["?"; release_ids.len()].join(",")
    );
    let mut stmt = tx.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = release_ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(&params[..], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn affected_playlists(tx: &rusqlite::Transaction, track_ids: &[String]) -> Result<Vec<String>> {
    if track_ids.is_empty() {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT DISTINCT playlist_name FROM playlists_tracks
         WHERE track_id IN ({}) ORDER BY playlist_name",
        vec!["?"; track_ids.len()].join(",")
    );
    let mut stmt = tx.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = track_ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(&params[..], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

#[derive(Serialize)]
struct ReleaseMeta<'a> {
    source_path: &'a PathBuf,
    title: &'a str,
    releasetype: &'a str,
    releasedate: Option<String>,
    originaldate: Option<String>,
    compositiondate: Option<String>,
    edition: &'a Option<String>,
    catalognumber: &'a Option<String>,
    disctotal: i32,
    new: bool,
    genres: &'a [String],
    secondary_genres: &'a [String],
    descriptors: &'a [String],
    labels: &'a [String],
    artists: &'a ArtistMapping,
}

fn upsert_release_row(c: &Config, tx: &rusqlite::Transaction, release: &Release) -> Result<()> {
    let metahash = compute_metahash(&ReleaseMeta {
        source_path: &release.source_path,
        title: &release.releasetitle,
        releasetype: release.releasetype.as_str(),
        releasedate: release.releasedate.map(|d| d.to_string()),
        originaldate: release.originaldate.map(|d| d.to_string()),
        compositiondate: release.compositiondate.map(|d| d.to_string()),
        edition: &release.edition,
        catalognumber: &release.catalognumber,
        disctotal: release.disctotal,
        new: release.new,
        genres: &release.genres,
        secondary_genres: &release.secondary_genres,
        descriptors: &release.descriptors,
        labels: &release.labels,
        artists: &release.releaseartists,
    });
    // OR REPLACE handles a new release reusing a cached source_path; ON CONFLICT handles updates.
    tx.execute(
        "
        INSERT OR REPLACE INTO releases (
            id, source_path, cover_image_path, added_at, datafile_mtime, title, releasetype,
            releasedate, originaldate, compositiondate, edition, catalognumber, disctotal, new, metahash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT (id) DO UPDATE SET
            source_path = excluded.source_path
          , cover_image_path = excluded.cover_image_path
          , added_at = excluded.added_at
          , datafile_mtime = excluded.datafile_mtime
          , title = excluded.title
          , releasetype = excluded.releasetype
          , releasedate = excluded.releasedate
          , originaldate = excluded.originaldate
          , compositiondate = excluded.compositiondate
          , edition = excluded.edition
          , catalognumber = excluded.catalognumber
          , disctotal = excluded.disctotal
          , new = excluded.new
          , metahash = excluded.metahash
        ",
        params![
            release.id,
            release.source_path.to_string_lossy(),
            release.cover_image_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            release.added_at,
            release.datafile_mtime,
            release.releasetitle,
            release.releasetype.as_str(),
            release.releasedate.map(|d| d.to_string()),
            release.originaldate.map(|d| d.to_string()),
            release.compositiondate.map(|d| d.to_string()),
            release.edition,
            release.catalognumber,
            release.disctotal,
            release.new,
            metahash,
        ],
    )?;

    tx.execute("DELETE FROM releases_genres WHERE release_id = ?1", params![release.id])?;
    for (position, genre) in release.genres.iter().enumerate() {
        tx.execute(
            "INSERT INTO releases_genres (release_id, genre, sanitized_genre, position) VALUES (?1, ?2, ?3, ?4)",
            params![release.id, genre, sanitize_dirname(c, genre, false), position as i64],
        )?;
    }
    tx.execute("DELETE FROM releases_secondary_genres WHERE release_id = ?1", params![release.id])?;
    for (position, genre) in release.secondary_genres.iter().enumerate() {
        tx.execute(
            "INSERT INTO releases_secondary_genres (release_id, genre, sanitized_genre, position) VALUES (?1, ?2, ?3, ?4)",
            params![release.id, genre, sanitize_dirname(c, genre, false), position as i64],
        )?;
    }
    tx.execute("DELETE FROM releases_descriptors WHERE release_id = ?1", params![release.id])?;
    for (position, descriptor) in release.descriptors.iter().enumerate() {
        tx.execute(
            "INSERT INTO releases_descriptors (release_id, descriptor, position) VALUES (?1, ?2, ?3)",
            params![release.id, descriptor, position as i64],
        )?;
    }
    tx.execute("DELETE FROM releases_labels WHERE release_id = ?1", params![release.id])?;
    for (position, label) in release.labels.iter().enumerate() {
        tx.execute(
            "INSERT INTO releases_labels (release_id, label, sanitized_label, position) VALUES (?1, ?2, ?3, ?4)",
            params![release.id, label, sanitize_dirname(c, label, false), position as i64],
        )?;
    }
    tx.execute("DELETE FROM releases_artists WHERE release_id = ?1", params![release.id])?;
    let mut position = 0i64;
    for (role, artists) in release.releaseartists.items() {
        for artist in artists {
            tx.execute(
                "INSERT INTO releases_artists (release_id, artist, sanitized_artist, role, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![release.id, artist.name, sanitize_dirname(c, &artist.name, false), role.as_str(), position],
            )?;
            position += 1;
        }
    }
    Ok(())
}

fn upsert_track_row(c: &Config, tx: &rusqlite::Transaction, release: &Release, track: &TrackScan) -> Result<()> {
    let metahash = compute_metahash(&(track, &release.id));
    tx.execute(
        "
        INSERT OR REPLACE INTO tracks (
            id, source_path, source_mtime, virtual_filename, title, release_id,
            tracknumber, tracktotal, discnumber, formatted_position, duration_seconds, metahash
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT (id) DO UPDATE SET
            source_path = excluded.source_path
          , source_mtime = excluded.source_mtime
          , virtual_filename = excluded.virtual_filename
          , title = excluded.title
          , release_id = excluded.release_id
          , tracknumber = excluded.tracknumber
          , tracktotal = excluded.tracktotal
          , discnumber = excluded.discnumber
          , formatted_position = excluded.formatted_position
          , duration_seconds = excluded.duration_seconds
          , metahash = excluded.metahash
        ",
        params![
            track.id,
            track.source_path.to_string_lossy(),
            track.source_mtime,
            track.virtual_filename,
            track.tracktitle,
            release.id,
            track.tracknumber,
            track.tracktotal,
            track.discnumber,
            track.formatted_position,
            track.duration_seconds,
            metahash,
        ],
    )?;
    tx.execute("DELETE FROM tracks_artists WHERE track_id = ?1", params![track.id])?;
    let mut position = 0i64;
    for (role, artists) in track.trackartists.items() {
        for artist in artists {
            tx.execute(
                "INSERT INTO tracks_artists (track_id, artist, sanitized_artist, role, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![track.id, artist.name, sanitize_dirname(c, &artist.name, false), role.as_str(), position],
            )?;
            position += 1;
        }
    }
    Ok(())
}

/// Delete-and-reinsert the FTS rows of every touched track, plus all tracks of touched releases.
/// Deleted tracks only need the delete half; the insert joins against live rows.
fn update_fts(tx: &rusqlite::Transaction, upd_release_ids: &[String], upd_track_ids: &[String]) -> Result<()> {
    if upd_release_ids.is_empty() && upd_track_ids.is_empty() {
        return Ok(());
    }
    let track_ph = vec!["?"; upd_track_ids.len()].join(",");
    let release_ph = vec!["?"; upd_release_ids.len()].join(",");
    let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();
    for id in upd_track_ids {
        args.push(id);
    }
    for id in upd_release_ids {
        args.push(id);
    }

    tx.execute(
        &format!(
            "
            DELETE FROM rules_engine_fts WHERE rowid IN (
                SELECT t.rowid
                FROM tracks t
                JOIN releases r ON r.id = t.release_id
                WHERE t.id IN ({track_ph}) OR r.id IN ({release_ph})
            )
            "
        ),
        &args[..],
    )?;
    tx.execute(
        &format!(
            "
            INSERT INTO rules_engine_fts (
                rowid, tracktitle, releasetitle, releaseartist, trackartist,
                genre, label, descriptor, position, releaseyear
            )
            SELECT
                t.rowid
              , process_string_for_fts(t.title)
              , process_string_for_fts(r.title)
              , process_string_for_fts(COALESCE(GROUP_CONCAT(ra.artist, ' '), ''))
              , process_string_for_fts(COALESCE(GROUP_CONCAT(ta.artist, ' '), ''))
              , process_genres_for_fts(
                    COALESCE(GROUP_CONCAT(rg.genre, ' ¬ '), '') || ' ¬ ' || COALESCE(GROUP_CONCAT(rs.genre, ' ¬ '), '')
                )
              , process_string_for_fts(COALESCE(GROUP_CONCAT(rl.label, ' '), ''))
              , process_string_for_fts(COALESCE(GROUP_CONCAT(rd.descriptor, ' '), ''))
              , process_string_for_fts(t.formatted_position)
              , process_string_for_fts(COALESCE(SUBSTR(r.releasedate, 1, 4), ''))
            FROM tracks t
            JOIN releases r ON r.id = t.release_id
            LEFT JOIN releases_genres rg ON rg.release_id = r.id
            LEFT JOIN releases_secondary_genres rs ON rs.release_id = r.id
            LEFT JOIN releases_descriptors rd ON rd.release_id = r.id
            LEFT JOIN releases_labels rl ON rl.release_id = r.id
            LEFT JOIN releases_artists ra ON ra.release_id = r.id
            LEFT JOIN tracks_artists ta ON ta.track_id = t.id
            WHERE t.id IN ({track_ph}) OR r.id IN ({release_ph})
            GROUP BY t.id
            "
        ),
        &args[..],
    )?;
    Ok(())
}

/// Evict cached releases whose source directories no longer exist on disk, then cascade the
/// manifest rescan so collages and playlists mark the vanished members missing in this cycle.
pub fn update_cache_evict_nonexistent_releases(c: &Config) -> Result<()> {
    debug!("Evicting cached releases that are not on disk");
    let mut dirs: Vec<String> = Vec::new();
    for entry in fs::read_dir(&c.music_source_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path().to_string_lossy().to_string());
        }
    }

    let mut conn = connect(c)?;
    let tx = conn.transaction()?;
    let sql = format!(
        "SELECT id, source_path FROM releases WHERE source_path NOT IN ({})",
        vec!["?"; dirs.len()].join(",")
    );
    let mut stmt = tx.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = dirs.iter().map(|d| d as &dyn rusqlite::ToSql).collect();
    let evicted: Vec<(String, String)> = stmt
        .query_map(&params[..], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);
    if evicted.is_empty() {
        return Ok(());
    }

    let mut touched_track_ids = Vec::new();
    for (release_id, source_path) in &evicted {
        evict_release(&tx, release_id, &mut touched_track_ids)?;
        info!("Evicted missing release {source_path} from cache");
    }
    let evicted_ids: Vec<String> = evicted.into_iter().map(|(id, _)| id).collect();
    let update_collages = affected_collages(&tx, &evicted_ids)?;
    let update_playlists = affected_playlists(&tx, &touched_track_ids)?;
    tx.commit()?;
    drop(conn);

    if !update_collages.is_empty() {
        update_cache_for_collages(c, Some(update_collages.as_slice()), true)?;
    }
    if !update_playlists.is_empty() {
        update_cache_for_playlists(c, Some(update_playlists.as_slice()), true)?;
    }
    Ok(())
}

// Collage and playlist manifests. These are processed serially: there are far fewer manifests
// than releases, and each upsert is cheap.

struct ManifestScan {
    path: PathBuf,
    name: String,
}

fn list_manifests(dir: &Path, names: Option<&[String]>) -> Result<Vec<ManifestScan>> {
    fs::create_dir_all(dir)?;
    let mut rval = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string()) else {
            continue;
        };
        if names.map(|ns| ns.contains(&stem)).unwrap_or(true) {
            rval.push(ManifestScan { path, name: stem });
        }
    }
    rval.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(rval)
}

/// Update the read cache for the given collages (all of them when None). Members that no longer
/// resolve are marked missing but retained with their position; display metadata is
/// back-annotated into the manifest when stale.
pub fn update_cache_for_collages(c: &Config, collage_names: Option<&[String]>, force: bool) -> Result<()> {
    let collage_dir = c.music_source_dir.join(COLLAGES_DIR);
    let files = list_manifests(&collage_dir, collage_names)?;
    debug!("Refreshing the read cache for {} collages", files.len());

    let mut conn = connect(c)?;
    let mut cached_mtimes: HashMap<String, String> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT name, source_mtime FROM collages")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cached_mtimes.insert(row.get(0)?, row.get(1)?);
        }
    }
    let mut existing_release_ids: HashSet<String> = HashSet::new();
    {
        let mut stmt = conn.prepare("SELECT id FROM releases")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            existing_release_ids.insert(row.get(0)?);
        }
    }

    // Figure out which manifests need work, then take their locks before the transaction opens:
    // lock bookkeeping goes through its own connection and must not wait on our own transaction.
    let mut to_process: Vec<(&ManifestScan, String)> = Vec::new();
    for manifest in &files {
        let source_mtime = match mtime_string(&manifest.path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if Some(&source_mtime) == cached_mtimes.get(&manifest.name) && !force {
            debug!("Collage cache hit (mtime) for {}, reusing cached data", manifest.path.display());
            continue;
        }
        to_process.push((manifest, source_mtime));
    }
    let mut locks = Vec::with_capacity(to_process.len());
    for (manifest, _) in &to_process {
        locks.push(lock(c, &collage_lock_name(&manifest.name), 60.0)?);
    }

    let tx = conn.transaction()?;
    for (manifest, source_mtime) in to_process {
        debug!("Collage cache miss (mtime) for {}, reading data from disk", manifest.path.display());

        let contents = fs::read_to_string(&manifest.path)?;
        let mut data: toml::Table = match contents.parse() {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping malformed collage manifest {}: {e}", manifest.path.display());
                continue;
            }
        };
        let original_entries = data.get("releases").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut entries = original_entries.clone();

        let member_ids: Vec<String> = entries
            .iter()
            .filter_map(|e| e.as_table())
            .filter_map(|t| t.get("uuid").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();
        let descriptions = fetch_release_descriptions(c, &tx, &member_ids)?;

        for entry in entries.iter_mut() {
            let Some(table) = entry.as_table_mut() else { continue };
            let Some(uuid) = table.get("uuid").and_then(|v| v.as_str()).map(|s| s.to_string()) else {
                warn!("Collage {} has an entry without a uuid; leaving it as-is", manifest.name);
                continue;
            };
            let was_missing = table.get("missing").and_then(|v| v.as_bool()).unwrap_or(false);
            let is_missing = !existing_release_ids.contains(&uuid);
            if is_missing && !was_missing {
                warn!("Marking release {uuid} as missing in collage {}", manifest.name);
                table.insert("missing".to_string(), toml::Value::Boolean(true));
            } else if !is_missing && was_missing {
                info!("Missing release {uuid} in collage {} found again", manifest.name);
                table.remove("missing");
            }
            let mut description = match descriptions.get(&uuid) {
                Some(d) => d.clone(),
                None => table.get("description_meta").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            };
            if is_missing && !description.ends_with(" {MISSING}") {
                description.push_str(" {MISSING}");
            }
            table.insert("description_meta".to_string(), toml::Value::String(description));
        }

        let mut source_mtime = source_mtime;
        if entries != original_entries {
            debug!("Updating release descriptions for {}", manifest.name);
            data.insert("releases".to_string(), toml::Value::Array(entries.clone()));
            if let Err(e) = fs::write(&manifest.path, toml::to_string(&data)?) {
                warn!("Failed to rewrite collage manifest {}: {e}", manifest.path.display());
            } else {
                source_mtime = mtime_string(&manifest.path)?;
            }
        }

        info!("Updating cache for collage {}", manifest.name);
        tx.execute(
            "INSERT INTO collages (name, source_mtime) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET source_mtime = excluded.source_mtime",
            params![manifest.name, source_mtime],
        )?;
        tx.execute("DELETE FROM collages_releases WHERE collage_name = ?1", params![manifest.name])?;
        for (position, entry) in entries.iter().enumerate() {
            let Some(table) = entry.as_table() else { continue };
            let Some(uuid) = table.get("uuid").and_then(|v| v.as_str()) else { continue };
            let missing = table.get("missing").and_then(|v| v.as_bool()).unwrap_or(false);
            tx.execute(
                "INSERT INTO collages_releases (collage_name, release_id, position, missing) VALUES (?1, ?2, ?3, ?4)",
                params![manifest.name, uuid, position as i64, missing],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn fetch_release_descriptions(
    c: &Config,
    tx: &rusqlite::Transaction,
    release_ids: &[String],
) -> Result<HashMap<String, String>> {
    let mut rval = HashMap::new();
    if release_ids.is_empty() {
        return Ok(rval);
    }
    let sql = format!(
        "SELECT id, releasetitle, releasedate, originaldate, releaseartist_names, releaseartist_roles
         FROM releases_view WHERE id IN ({})",
        vec!["?"; release_ids.len()].join(",")
    );
    let mut stmt = tx.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = release_ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let mut rows = stmt.query(&params[..])?;
    while let Some(row) = rows.next()? {
        let id: String = row.get("id")?;
        let artists = unpack_artists(
            c,
            &row.get::<_, String>("releaseartist_names")?,
            &row.get::<_, String>("releaseartist_roles")?,
            true,
        )?;
        rval.insert(
            id,
            make_release_descriptor(
                &row.get::<_, String>("releasetitle")?,
                RoseDate::parse(row.get::<_, Option<String>>("releasedate")?.as_deref()),
                RoseDate::parse(row.get::<_, Option<String>>("originaldate")?.as_deref()),
                &artists,
            ),
        );
    }
    Ok(rval)
}

pub fn update_cache_evict_nonexistent_collages(c: &Config) -> Result<()> {
    debug!("Evicting cached collages that are not on disk");
    let names: Vec<String> = list_manifests(&c.music_source_dir.join(COLLAGES_DIR), None)?
        .into_iter()
        .map(|m| m.name)
        .collect();
    let conn = connect(c)?;
    let sql = format!(
        "DELETE FROM collages WHERE name NOT IN ({}) RETURNING name",
        vec!["?"; names.len()].join(",")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = names.iter().map(|n| n as &dyn rusqlite::ToSql).collect();
    let mut rows = stmt.query(&params[..])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        info!("Evicted missing collage {name} from cache");
    }
    Ok(())
}

/// Update the read cache for the given playlists (all of them when None). Mirrors the collage
/// scanner, with track members and optional cover art.
pub fn update_cache_for_playlists(c: &Config, playlist_names: Option<&[String]>, force: bool) -> Result<()> {
    let playlist_dir = c.music_source_dir.join(PLAYLISTS_DIR);
    let files = list_manifests(&playlist_dir, playlist_names)?;
    debug!("Refreshing the read cache for {} playlists", files.len());

    let mut all_files_in_dir: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(&playlist_dir)? {
        all_files_in_dir.push(entry?.path());
    }

    let mut conn = connect(c)?;
    let mut cached: HashMap<String, (String, Option<String>)> = HashMap::new();
    {
        let mut stmt = conn.prepare("SELECT name, source_mtime, cover_path FROM playlists")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            cached.insert(row.get(0)?, (row.get(1)?, row.get(2)?));
        }
    }
    let mut existing_track_ids: HashSet<String> = HashSet::new();
    {
        let mut stmt = conn.prepare("SELECT id FROM tracks")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            existing_track_ids.insert(row.get(0)?);
        }
    }

    // Same shape as the collage scanner: decide what needs work, take locks, then one
    // transaction for the batch.
    let mut to_process: Vec<(&ManifestScan, String, Option<PathBuf>)> = Vec::new();
    for manifest in &files {
        let (cached_mtime, cached_cover) =
            cached.get(&manifest.name).cloned().map(|(m, c)| (Some(m), c)).unwrap_or((None, None));

        // Cover art: an explicit manifest key wins; otherwise an adjacent art file named after
        // the playlist is picked up. A vanished cover forces the update through.
        let mut cover_dirty = false;
        let mut cover_path: Option<PathBuf> = cached_cover.map(PathBuf::from);
        if let Some(cp) = &cover_path {
            if !cp.is_file() {
                cover_path = None;
                cover_dirty = true;
            }
        }
        if cover_path.is_none() {
            for f in &all_files_in_dir {
                let stem_matches = f.file_stem().and_then(|s| s.to_str()) == Some(manifest.name.as_str());
                let ext_valid = f
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| c.valid_art_exts.iter().any(|v| v.eq_ignore_ascii_case(e)))
                    .unwrap_or(false);
                if stem_matches && ext_valid {
                    cover_path = Some(f.clone());
                    cover_dirty = true;
                    break;
                }
            }
        }

        let source_mtime = match mtime_string(&manifest.path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if Some(&source_mtime) == cached_mtime.as_ref() && !force && !cover_dirty {
            debug!("Playlist cache hit (mtime) for {}, reusing cached data", manifest.path.display());
            continue;
        }
        to_process.push((manifest, source_mtime, cover_path));
    }
    let mut locks = Vec::with_capacity(to_process.len());
    for (manifest, _, _) in &to_process {
        locks.push(lock(c, &playlist_lock_name(&manifest.name), 60.0)?);
    }

    let tx = conn.transaction()?;
    for (manifest, source_mtime, cover_path) in to_process {
        let mut cover_path = cover_path;
        debug!("Playlist cache miss (mtime) for {}, reading data from disk", manifest.path.display());

        let contents = fs::read_to_string(&manifest.path)?;
        let mut data: toml::Table = match contents.parse() {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping malformed playlist manifest {}: {e}", manifest.path.display());
                continue;
            }
        };
        let original_entries = data.get("tracks").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut entries = original_entries.clone();

        let member_ids: Vec<String> = entries
            .iter()
            .filter_map(|e| e.as_table())
            .filter_map(|t| t.get("track_uuid").and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();
        let descriptions = fetch_track_descriptions(c, &tx, &member_ids)?;

        for entry in entries.iter_mut() {
            let Some(table) = entry.as_table_mut() else { continue };
            let Some(uuid) = table.get("track_uuid").and_then(|v| v.as_str()).map(|s| s.to_string()) else {
                warn!("Playlist {} has an entry without a track_uuid; leaving it as-is", manifest.name);
                continue;
            };
            let was_missing = table.get("missing").and_then(|v| v.as_bool()).unwrap_or(false);
            let is_missing = !existing_track_ids.contains(&uuid);
            if is_missing && !was_missing {
                warn!("Marking track {uuid} as missing in playlist {}", manifest.name);
                table.insert("missing".to_string(), toml::Value::Boolean(true));
            } else if !is_missing && was_missing {
                info!("Missing track {uuid} in playlist {} found again", manifest.name);
                table.remove("missing");
            }
            let mut description = match descriptions.get(&uuid) {
                Some(d) => d.clone(),
                None => table.get("description_meta").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            };
            if is_missing && !description.ends_with(" {MISSING}") {
                description.push_str(" {MISSING}");
            }
            table.insert("description_meta".to_string(), toml::Value::String(description));
        }

        if let Some(explicit) = data.get("cover_path").and_then(|v| v.as_str()) {
            cover_path = Some(playlist_dir.join(explicit));
        }

        let mut source_mtime = source_mtime;
        if entries != original_entries {
            debug!("Updating track descriptions for {}", manifest.name);
            data.insert("tracks".to_string(), toml::Value::Array(entries.clone()));
            if let Err(e) = fs::write(&manifest.path, toml::to_string(&data)?) {
                warn!("Failed to rewrite playlist manifest {}: {e}", manifest.path.display());
            } else {
                source_mtime = mtime_string(&manifest.path)?;
            }
        }

        info!("Updating cache for playlist {}", manifest.name);
        tx.execute(
            "INSERT INTO playlists (name, source_mtime, cover_path) VALUES (?1, ?2, ?3)
             ON CONFLICT (name) DO UPDATE SET
                source_mtime = excluded.source_mtime
              , cover_path = excluded.cover_path",
            params![manifest.name, source_mtime, cover_path.as_ref().map(|p| p.to_string_lossy().to_string())],
        )?;
        tx.execute("DELETE FROM playlists_tracks WHERE playlist_name = ?1", params![manifest.name])?;
        for (position, entry) in entries.iter().enumerate() {
            let Some(table) = entry.as_table() else { continue };
            let Some(uuid) = table.get("track_uuid").and_then(|v| v.as_str()) else { continue };
            let missing = table.get("missing").and_then(|v| v.as_bool()).unwrap_or(false);
            tx.execute(
                "INSERT INTO playlists_tracks (playlist_name, track_id, position, missing) VALUES (?1, ?2, ?3, ?4)",
                params![manifest.name, uuid, position as i64, missing],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn fetch_track_descriptions(
    c: &Config,
    tx: &rusqlite::Transaction,
    track_ids: &[String],
) -> Result<HashMap<String, String>> {
    let mut rval = HashMap::new();
    if track_ids.is_empty() {
        return Ok(rval);
    }
    let sql = format!(
        "SELECT id, tracktitle, trackartist_names, trackartist_roles
         FROM tracks_view WHERE id IN ({})",
        vec!["?"; track_ids.len()].join(",")
    );
    let mut stmt = tx.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = track_ids.iter().map(|s| s as &dyn rusqlite::ToSql).collect();
    let mut rows = stmt.query(&params[..])?;
    while let Some(row) = rows.next()? {
        let id: String = row.get("id")?;
        let artists = unpack_artists(
            c,
            &row.get::<_, String>("trackartist_names")?,
            &row.get::<_, String>("trackartist_roles")?,
            true,
        )?;
        rval.insert(id, make_track_descriptor(&row.get::<_, String>("tracktitle")?, &artists));
    }
    Ok(rval)
}

pub fn update_cache_evict_nonexistent_playlists(c: &Config) -> Result<()> {
    debug!("Evicting cached playlists that are not on disk");
    let names: Vec<String> = list_manifests(&c.music_source_dir.join(PLAYLISTS_DIR), None)?
        .into_iter()
        .map(|m| m.name)
        .collect();
    let conn = connect(c)?;
    let sql = format!(
        "DELETE FROM playlists WHERE name NOT IN ({}) RETURNING name",
        vec!["?"; names.len()].join(",")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::ToSql> = names.iter().map(|n| n as &dyn rusqlite::ToSql).collect();
    let mut rows = stmt.query(&params[..])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        info!("Evicted missing playlist {name} from cache");
    }
    Ok(())
}
