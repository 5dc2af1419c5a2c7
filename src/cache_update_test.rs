use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::params;

use crate::cache::connect;
use crate::cache_update::*;
use crate::config::Config;
use crate::datafiles::datafile_id_from_name;
use crate::rules::{fast_search_for_matching_tracks, Matcher, MatcherTag, Pattern};
use crate::testing::{self, write_test_flac, FlacTags};

fn basic_tags(album: &str, artist: &str, title: &str, tracknumber: &str) -> FlacTags {
    FlacTags {
        album: Some(album.to_string()),
        albumartist: Some(artist.to_string()),
        artist: Some(artist.to_string()),
        title: Some(title.to_string()),
        tracknumber: Some(tracknumber.to_string()),
        discnumber: Some("1".to_string()),
        date: Some("2016".to_string()),
        genre: Some("K-Pop".to_string()),
        label: Some("A Cool Label".to_string()),
        ..Default::default()
    }
}

/// A two-track release used by most of the end-to-end scenarios.
fn write_square_one(source: &Path) -> PathBuf {
    let dir = source.join("BLACKPINK - 2016. SQUARE ONE");
    write_test_flac(&dir.join("01.flac"), &basic_tags("SQUARE ONE", "BLACKPINK", "WHISTLE", "1"));
    write_test_flac(&dir.join("02.flac"), &basic_tags("SQUARE ONE", "BLACKPINK", "BOOMBAYAH", "2"));
    dir
}

fn release_id_of(dir: &Path) -> Option<String> {
    for entry in fs::read_dir(dir).unwrap() {
        let name = entry.unwrap().file_name();
        if let Some(id) = name.to_str().and_then(datafile_id_from_name) {
            return Some(id);
        }
    }
    None
}

fn count(config: &Config, table: &str) -> i64 {
    let conn = connect(config).unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0)).unwrap()
}

#[test]
fn test_update_cache_first_ingest() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();

    // The release directory was given a sidecar with a fresh UUID.
    let release_id = release_id_of(&release_dir).expect("sidecar not written");

    let conn = connect(&config).unwrap();
    let (source_path, title, releasetype, releasedate, new): (String, String, String, String, bool) = conn
        .query_row(
            "SELECT source_path, title, releasetype, releasedate, new FROM releases WHERE id = ?1",
            params![release_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )
        .unwrap();
    assert_eq!(PathBuf::from(source_path), release_dir);
    assert_eq!(title, "SQUARE ONE");
    // No release type tag was written, so the type aggregates to unknown.
    assert_eq!(releasetype, "unknown");
    assert_eq!(releasedate, "2016");
    assert!(new);

    assert_eq!(count(&config, "tracks"), 2);
    let artists: Vec<(String, String)> = conn
        .prepare("SELECT artist, role FROM releases_artists WHERE release_id = ?1")
        .unwrap()
        .query_map(params![release_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(artists, vec![("BLACKPINK".to_string(), "main".to_string())]);

    let genres: Vec<String> = conn
        .prepare("SELECT genre FROM releases_genres WHERE release_id = ?1 ORDER BY position")
        .unwrap()
        .query_map(params![release_id], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(genres, vec!["K-Pop"]);

    // Both audio files now embed the track and release identifiers.
    for name in ["01.flac", "02.flac"] {
        let af = crate::audiotags::AudioTags::from_file(&release_dir.join(name)).unwrap();
        assert!(af.id.is_some());
        assert_eq!(af.release_id.as_deref(), Some(release_id.as_str()));
    }
}

#[test]
fn test_update_cache_idempotent_rescan() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();

    let dump = |config: &Config| -> Vec<(String, String, String)> {
        let conn = connect(config).unwrap();
        let mut rows: Vec<(String, String, String)> = conn
            .prepare("SELECT id, source_mtime, metahash FROM tracks")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        let release: (String, String, String) = conn
            .query_row("SELECT id, datafile_mtime, metahash FROM releases", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        rows.push(release);
        rows.sort();
        rows
    };

    let before = dump(&config);
    let sidecar_mtime_before = fs::metadata(release_dir.join(format!(
        ".rose.{}.toml",
        release_id_of(&release_dir).unwrap()
    )))
    .unwrap()
    .modified()
    .unwrap();

    update_cache(&config, false).unwrap();

    assert_eq!(dump(&config), before);
    let sidecar_mtime_after = fs::metadata(release_dir.join(format!(
        ".rose.{}.toml",
        release_id_of(&release_dir).unwrap()
    )))
    .unwrap()
    .modified()
    .unwrap();
    assert_eq!(sidecar_mtime_before, sidecar_mtime_after);
}

#[test]
fn test_update_cache_force_rescan_is_stable() {
    let (config, _dir) = testing::config();
    write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();

    let dump = |config: &Config| -> Vec<String> {
        let conn = connect(config).unwrap();
        let mut stmt = conn
            .prepare("SELECT id || title || metahash FROM tracks ORDER BY id")
            .unwrap();
        let result = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        result
    };
    update_cache(&config, true).unwrap();
    let first = dump(&config);
    update_cache(&config, true).unwrap();
    assert_eq!(dump(&config), first);
}

#[test]
fn test_update_cache_rename_stability() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let release_id = release_id_of(&release_dir).unwrap();
    let track_ids_before: Vec<String> = conn
        .prepare("SELECT id FROM tracks ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    drop(conn);

    let moved = config.music_source_dir.join("BLACKPINK - 2016. Square One");
    fs::rename(&release_dir, &moved).unwrap();
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let (id, source_path): (String, String) = conn
        .query_row("SELECT id, source_path FROM releases", [], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap();
    assert_eq!(id, release_id);
    assert_eq!(PathBuf::from(source_path), moved);
    let track_ids_after: Vec<String> = conn
        .prepare("SELECT id FROM tracks ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(track_ids_after, track_ids_before);
}

#[test]
fn test_rebuild_preserves_identifiers() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let ids_before: Vec<String> = conn
        .prepare("SELECT id FROM tracks ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    let release_id = release_id_of(&release_dir).unwrap();
    drop(conn);

    // Nuke the database and rebuild from the tree: identity comes back from the sidecar and the
    // embedded tags.
    fs::remove_file(config.cache_database_path()).unwrap();
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let ids_after: Vec<String> = conn
        .prepare("SELECT id FROM tracks ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(ids_after, ids_before);
    let id: String = conn.query_row("SELECT id FROM releases", [], |row| row.get(0)).unwrap();
    assert_eq!(id, release_id);
}

#[test]
fn test_update_cache_notices_deleted_track() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "tracks"), 2);

    fs::remove_file(release_dir.join("02.flac")).unwrap();
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "tracks"), 1);
}

#[test]
fn test_update_cache_skips_empty_directory() {
    let (config, _dir) = testing::config();
    let rd = config.music_source_dir.join("lalala");
    fs::create_dir_all(&rd).unwrap();
    fs::write(rd.join("ignoreme.file"), "").unwrap();
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 0);
}

#[test]
fn test_update_cache_uncaches_emptied_directory() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 1);

    fs::remove_dir_all(&release_dir).unwrap();
    fs::create_dir_all(&release_dir).unwrap();
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 0);
}

#[test]
fn test_update_cache_evicts_deleted_release() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 1);

    fs::remove_dir_all(&release_dir).unwrap();
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 0);
    assert_eq!(count(&config, "tracks"), 0);
}

#[test]
fn test_update_cache_ignores_configured_directories() {
    let (mut config, _dir) = testing::config();
    config.ignore_release_directories = vec!["BLACKPINK - 2016. SQUARE ONE".to_string()];
    write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 0);
}

#[test]
fn test_partial_write_guard() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();
    let release_id = release_id_of(&release_dir).unwrap();

    // Move the directory and hide the sidecar: this looks like a half-moved directory whose audio
    // files carry ids, and must not be stamped with a fresh release id.
    let renamed = config.music_source_dir.join("lalala");
    fs::rename(&release_dir, &renamed).unwrap();
    let sidecar = renamed.join(format!(".rose.{release_id}.toml"));
    let hidden = renamed.join("hidden.tmp");
    fs::rename(&sidecar, &hidden).unwrap();

    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 0);

    // Put the sidecar back: the release reappears under its old identity.
    fs::rename(&hidden, &sidecar).unwrap();
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 1);
    let conn = connect(&config).unwrap();
    let id: String = conn.query_row("SELECT id FROM releases", [], |row| row.get(0)).unwrap();
    assert_eq!(id, release_id);
    drop(conn);

    // Remove the sidecar for good and force: the embedded release id is preserved.
    fs::remove_file(&sidecar).unwrap();
    update_cache(&config, true).unwrap();
    assert_eq!(count(&config, "releases"), 1);
    let conn = connect(&config).unwrap();
    let id: String = conn.query_row("SELECT id FROM releases", [], |row| row.get(0)).unwrap();
    assert_eq!(id, release_id);
    assert!(sidecar.is_file());
}

#[test]
fn test_duplicate_sidecar_skips_release() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    fs::write(release_dir.join(".rose.aaa.toml"), "[release]\nid = \"aaa\"\n").unwrap();
    fs::write(release_dir.join(".rose.bbb.toml"), "[release]\nid = \"bbb\"\n").unwrap();
    // The release is logged and skipped; the scan as a whole succeeds.
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "releases"), 0);
}

#[test]
fn test_virtual_filename_collisions() {
    let (config, _dir) = testing::config();
    let dir = config.music_source_dir.join("collisions");
    // Two tracks that render to the same virtual filename.
    write_test_flac(&dir.join("a.flac"), &basic_tags("Album", "Artist", "Same Title", "1"));
    write_test_flac(&dir.join("b.flac"), &basic_tags("Album", "Artist", "Same Title", "1"));
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let mut filenames: Vec<String> = conn
        .prepare("SELECT virtual_filename FROM tracks")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    filenames.sort();
    assert_eq!(filenames, vec!["01. Same Title [2].flac", "01. Same Title.flac"]);
}

#[test]
fn test_rename_source_files() {
    let (mut config, _dir) = testing::config();
    config.rename_source_files = true;
    write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();

    let expected_dir = config.music_source_dir.join("BLACKPINK - 2016. SQUARE ONE [NEW]");
    assert!(expected_dir.is_dir(), "expected renamed release directory");
    assert!(expected_dir.join("01. WHISTLE.flac").is_file());
    assert!(expected_dir.join("02. BOOMBAYAH.flac").is_file());

    let conn = connect(&config).unwrap();
    let source_path: String = conn.query_row("SELECT source_path FROM releases", [], |row| row.get(0)).unwrap();
    assert_eq!(PathBuf::from(source_path), expected_dir);
}

#[test]
fn test_rename_source_files_flattens_nested_directories() {
    let (mut config, _dir) = testing::config();
    config.rename_source_files = true;
    let dir = config.music_source_dir.join("nested");
    write_test_flac(&dir.join("disc1").join("01.flac"), &basic_tags("Album", "Artist", "Track 1", "1"));
    update_cache(&config, false).unwrap();

    let release_dirs: Vec<PathBuf> = fs::read_dir(&config.music_source_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(release_dirs.len(), 1);
    let release_dir = &release_dirs[0];
    assert!(release_dir.join("01. Track 1.flac").is_file());
    assert!(!release_dir.join("disc1").exists());
}

#[test]
fn test_update_cache_collages() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();
    let release_id = release_id_of(&release_dir).unwrap();

    let collage_dir = config.music_source_dir.join("!collages");
    fs::create_dir_all(&collage_dir).unwrap();
    let cpath = collage_dir.join("Road Trip.toml");
    fs::write(&cpath, format!("[[releases]]\nuuid = \"{release_id}\"\ndescription_meta = \"lalala\"\n")).unwrap();
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let (name, rid, position, missing): (String, String, i64, bool) = conn
        .query_row(
            "SELECT collage_name, release_id, position, missing FROM collages_releases",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .unwrap();
    assert_eq!(name, "Road Trip");
    assert_eq!(rid, release_id);
    assert_eq!(position, 0);
    assert!(!missing);

    // The display metadata was recomputed and written back into the manifest.
    let contents = fs::read_to_string(&cpath).unwrap();
    assert!(contents.contains("[2016-01-01] BLACKPINK - SQUARE ONE"), "manifest: {contents}");
}

#[test]
fn test_collage_missing_member_preservation() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();
    let release_id = release_id_of(&release_dir).unwrap();

    let collage_dir = config.music_source_dir.join("!collages");
    fs::create_dir_all(&collage_dir).unwrap();
    let cpath = collage_dir.join("Road Trip.toml");
    fs::write(&cpath, format!("[[releases]]\nuuid = \"{release_id}\"\ndescription_meta = \"x\"\n")).unwrap();
    update_cache(&config, false).unwrap();

    // Delete the release directory. The collage member is retained, flagged missing, and the
    // manifest rewritten with the suffix, all in the same cycle.
    fs::remove_dir_all(&release_dir).unwrap();
    update_cache(&config, false).unwrap();

    assert_eq!(count(&config, "collages"), 1);
    let conn = connect(&config).unwrap();
    let (rid, position, missing): (String, i64, bool) = conn
        .query_row("SELECT release_id, position, missing FROM collages_releases", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .unwrap();
    assert_eq!(rid, release_id);
    assert_eq!(position, 0);
    assert!(missing);
    drop(conn);
    let contents = fs::read_to_string(&cpath).unwrap();
    assert!(contents.contains(" {MISSING}"), "manifest: {contents}");
    assert!(contents.contains("missing = true"), "manifest: {contents}");

    // Re-create the release under its old identity: the member is recovered.
    let restored = write_square_one(&config.music_source_dir);
    fs::write(
        restored.join(format!(".rose.{release_id}.toml")),
        format!("[release]\nid = \"{release_id}\"\n"),
    )
    .unwrap();
    update_cache(&config, false).unwrap();
    let conn = connect(&config).unwrap();
    let missing: bool = conn.query_row("SELECT missing FROM collages_releases", [], |row| row.get(0)).unwrap();
    assert!(!missing);
    let contents = fs::read_to_string(&cpath).unwrap();
    assert!(!contents.contains(" {MISSING}"), "manifest: {contents}");
}

#[test]
fn test_playlist_description_cascade() {
    let (config, _dir) = testing::config();
    let release_dir = write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let track_id: String = conn
        .query_row(
            "SELECT id FROM tracks WHERE source_path = ?1",
            params![release_dir.join("01.flac").to_string_lossy()],
            |row| row.get(0),
        )
        .unwrap();
    drop(conn);

    let playlist_dir = config.music_source_dir.join("!playlists");
    fs::create_dir_all(&playlist_dir).unwrap();
    let ppath = playlist_dir.join("Shower.toml");
    fs::write(&ppath, format!("[[tracks]]\ntrack_uuid = \"{track_id}\"\ndescription_meta = \"lalala\"\n")).unwrap();
    update_cache(&config, false).unwrap();

    let contents = fs::read_to_string(&ppath).unwrap();
    assert!(contents.contains("BLACKPINK - WHISTLE"), "manifest: {contents}");

    // Edit the track title through a direct tag write; the rescan cascades the new title into the
    // playlist manifest in the same cycle.
    let mut tag = metaflac::Tag::read_from_path(&release_dir.join("01.flac")).unwrap();
    tag.set_vorbis("TITLE", vec!["WHISTLE (Acoustic)"]);
    tag.save().unwrap();
    update_cache(&config, false).unwrap();

    let contents = fs::read_to_string(&ppath).unwrap();
    assert!(contents.contains("BLACKPINK - WHISTLE (Acoustic)"), "manifest: {contents}");
}

#[test]
fn test_playlist_cover_art_discovery() {
    let (config, _dir) = testing::config();
    write_square_one(&config.music_source_dir);
    update_cache(&config, false).unwrap();

    let playlist_dir = config.music_source_dir.join("!playlists");
    fs::create_dir_all(&playlist_dir).unwrap();
    fs::write(playlist_dir.join("Shower.toml"), "tracks = []\n").unwrap();
    fs::write(playlist_dir.join("Shower.jpg"), "").unwrap();
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let cover: Option<String> = conn.query_row("SELECT cover_path FROM playlists", [], |row| row.get(0)).unwrap();
    assert_eq!(cover.map(PathBuf::from), Some(playlist_dir.join("Shower.jpg")));
}

#[test]
fn test_evict_nonexistent_manifests() {
    let (config, _dir) = testing::config();
    let collage_dir = config.music_source_dir.join("!collages");
    fs::create_dir_all(&collage_dir).unwrap();
    fs::write(collage_dir.join("Keep.toml"), "releases = []\n").unwrap();
    fs::write(collage_dir.join("Drop.toml"), "releases = []\n").unwrap();
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "collages"), 2);

    fs::remove_file(collage_dir.join("Drop.toml")).unwrap();
    update_cache(&config, false).unwrap();
    assert_eq!(count(&config, "collages"), 1);
}

#[test]
fn test_fts_round_trip() {
    let (config, _dir) = testing::config();
    let dir = config.music_source_dir.join("loona");
    let mut tags = basic_tags("[+ +]", "LOOΠΔ", "Hi High", "1");
    tags.genre = Some("K-Pop".to_string());
    write_test_flac(&dir.join("01.flac"), &tags);
    update_cache(&config, false).unwrap();

    let conn = connect(&config).unwrap();
    let track_id: String = conn.query_row("SELECT id FROM tracks", [], |row| row.get(0)).unwrap();
    drop(conn);

    // Substring search across the character-tokenized index.
    let matcher = Matcher { tags: vec![MatcherTag::TrackArtist], pattern: Pattern::substring("LOO") };
    let results = fast_search_for_matching_tracks(&config, &matcher).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, track_id);

    // Adding a secondary genre updates the index within the next scan.
    let mut tag = metaflac::Tag::read_from_path(&dir.join("01.flac")).unwrap();
    tag.set_vorbis("SECONDARYGENRE", vec!["Dance-Pop"]);
    tag.save().unwrap();
    update_cache(&config, false).unwrap();

    let matcher = Matcher { tags: vec![MatcherTag::Genre], pattern: Pattern::substring("Dance") };
    let results = fast_search_for_matching_tracks(&config, &matcher).unwrap();
    assert_eq!(results.len(), 1);

    // Removing the primary genre drops it from the index.
    let mut tag = metaflac::Tag::read_from_path(&dir.join("01.flac")).unwrap();
    tag.set_vorbis("GENRE", vec!["Noise"]);
    tag.save().unwrap();
    update_cache(&config, false).unwrap();

    let matcher = Matcher { tags: vec![MatcherTag::Genre], pattern: Pattern::substring("K-Pop") };
    assert!(fast_search_for_matching_tracks(&config, &matcher).unwrap().is_empty());
}
