/// Shared test fixtures: an isolated config with a bootstrapped cache database, a cache seeded
/// with fake data through batch SQL, and synthesized FLAC files for end-to-end scanner tests.
///
/// The synthesized files are real FLAC containers: a STREAMINFO block describing two seconds of
/// 44.1kHz stereo audio and no frames. That is enough for the tag layer to read and write Vorbis
/// comments and durations without binary fixtures in the repository.
use std::fs;
use std::path::Path;
use std::sync::Once;

use tempfile::TempDir;

use crate::cache::{connect, maybe_invalidate_cache_database};
use crate::config::Config;
use crate::templates::PathTemplateConfig;

static INIT: Once = Once::new();

pub fn init() -> TempDir {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
    TempDir::new().expect("failed to create temp dir")
}

/// A config pointing at isolated temp directories, with the cache database bootstrapped.
pub fn config() -> (Config, TempDir) {
    let temp_dir = init();
    let base = temp_dir.path();
    fs::create_dir_all(base.join("cache")).expect("failed to create cache dir");
    fs::create_dir_all(base.join("source")).expect("failed to create source dir");

    let config = Config {
        music_source_dir: base.join("source"),
        cache_dir: base.join("cache"),
        max_proc: 2,
        ignore_release_directories: vec![],
        rename_source_files: false,
        max_filename_bytes: 180,
        cover_art_stems: ["folder", "cover", "art", "front"].map(String::from).to_vec(),
        valid_art_exts: ["jpg", "jpeg", "png"].map(String::from).to_vec(),
        write_parent_genres: false,
        artist_aliases_map: std::collections::HashMap::new(),
        artist_aliases_parents_map: std::collections::HashMap::new(),
        path_templates: PathTemplateConfig::with_defaults(),
    };
    maybe_invalidate_cache_database(&config).expect("failed to bootstrap cache database");
    (config, temp_dir)
}

/// A config plus a cache seeded with fake test data. The files on disk are stubs.
pub fn seeded_cache() -> (Config, TempDir) {
    let (config, temp_dir) = config();
    let source = config.music_source_dir.clone();

    let dirpaths = [source.join("r1"), source.join("r2"), source.join("r3")];
    let musicpaths = [
        source.join("r1").join("01.flac"),
        source.join("r1").join("02.flac"),
        source.join("r2").join("01.flac"),
        source.join("r3").join("01.flac"),
    ];
    let imagepath = source.join("r2").join("cover.jpg");
    let playlist_cover = source.join("!playlists").join("Lala Lisa.jpg");

    let conn = connect(&config).expect("failed to open seeded cache");
    let sql = format!(
        r#"
INSERT INTO releases
       (id  , source_path , cover_image_path, added_at                   , datafile_mtime, title      , releasetype, releasedate , originaldate, compositiondate, catalognumber, edition , disctotal, new  , metahash)
VALUES ('r1', '{dirpath0}', null            , '0000-01-01T00:00:00+00:00', '999'         , 'Release 1', 'album'    , '2023'      , null        , null           , null         , null    , 1        , false, '1')
     , ('r2', '{dirpath1}', '{imagepath}'   , '0000-01-01T00:00:00+00:00', '999'         , 'Release 2', 'album'    , '2021'      , '2019'      , null           , 'DG-001'     , 'Deluxe', 1        , true , '2')
     , ('r3', '{dirpath2}', null            , '0000-01-01T00:00:00+00:00', '999'         , 'Release 3', 'ep'       , '2021-04-20', null        , '1780'         , 'DG-002'     , null    , 1        , false, '3');

INSERT INTO releases_genres
       (release_id, genre             , sanitized_genre   , position)
VALUES ('r1'      , 'Techno'          , 'Techno'          , 0)
     , ('r1'      , 'Deep House'      , 'Deep House'      , 1)
     , ('r2'      , 'Modern Classical', 'Modern Classical', 0);

INSERT INTO releases_secondary_genres
       (release_id, genre             , sanitized_genre   , position)
VALUES ('r1'      , 'Rominimal'       , 'Rominimal'       , 0)
     , ('r1'      , 'Ambient'         , 'Ambient'         , 1)
     , ('r2'      , 'Orchestral Music', 'Orchestral Music', 0);

INSERT INTO releases_descriptors
       (release_id, descriptor, position)
VALUES ('r1'      , 'Warm'    , 0)
     , ('r1'      , 'Hot'     , 1)
     , ('r2'      , 'Wet'     , 0);

INSERT INTO releases_labels
       (release_id, label         , sanitized_label, position)
VALUES ('r1'      , 'Silk Music'  , 'Silk Music'   , 0)
     , ('r2'      , 'Native State', 'Native State' , 0);

INSERT INTO tracks
       (id  , source_path   , source_mtime, virtual_filename    , title    , release_id, tracknumber, tracktotal, discnumber, formatted_position, duration_seconds, metahash)
VALUES ('t1', '{musicpath0}', '999'       , '01. Track 1.flac'  , 'Track 1', 'r1'      , '01'       , 2         , '01'      , '0001.0001'       , 120             , '1')
     , ('t2', '{musicpath1}', '999'       , '02. Track 2.flac'  , 'Track 2', 'r1'      , '02'       , 2         , '01'      , '0001.0002'       , 240             , '2')
     , ('t3', '{musicpath2}', '999'       , '01. Track 1.flac'  , 'Track 1', 'r2'      , '01'       , 1         , '01'      , '0001.0001'       , 120             , '3')
     , ('t4', '{musicpath3}', '999'       , '01. Track 1.flac'  , 'Track 1', 'r3'      , '01'       , 1         , '01'      , '0001.0001'       , 120             , '4');

INSERT INTO releases_artists
       (release_id, artist           , sanitized_artist , role   , position)
VALUES ('r1'      , 'Techno Man'     , 'Techno Man'     , 'main' , 0)
     , ('r1'      , 'Bass Man'       , 'Bass Man'       , 'main' , 1)
     , ('r2'      , 'Violin Woman'   , 'Violin Woman'   , 'main' , 0)
     , ('r2'      , 'Conductor Woman', 'Conductor Woman', 'guest', 1);

INSERT INTO tracks_artists
       (track_id, artist           , sanitized_artist , role   , position)
VALUES ('t1'    , 'Techno Man'     , 'Techno Man'     , 'main' , 0)
     , ('t1'    , 'Bass Man'       , 'Bass Man'       , 'main' , 1)
     , ('t2'    , 'Techno Man'     , 'Techno Man'     , 'main' , 0)
     , ('t2'    , 'Bass Man'       , 'Bass Man'       , 'main' , 1)
     , ('t3'    , 'Violin Woman'   , 'Violin Woman'   , 'main' , 0)
     , ('t3'    , 'Conductor Woman', 'Conductor Woman', 'guest', 1);

INSERT INTO collages
       (name       , source_mtime)
VALUES ('Rose Gold', '999')
     , ('Ruby Red' , '999');

INSERT INTO collages_releases
       (collage_name, release_id, position, missing)
VALUES ('Rose Gold' , 'r1'      , 0       , false)
     , ('Rose Gold' , 'r2'      , 1       , false);

INSERT INTO playlists
       (name           , source_mtime, cover_path)
VALUES ('Lala Lisa'    , '999'       , '{playlist_cover}')
     , ('Turtle Rabbit', '999'       , null);

INSERT INTO playlists_tracks
       (playlist_name, track_id, position, missing)
VALUES ('Lala Lisa'  , 't1'    , 0       , false)
     , ('Lala Lisa'  , 't3'    , 1       , false);
"#,
        dirpath0 = dirpaths[0].display(),
        dirpath1 = dirpaths[1].display(),
        dirpath2 = dirpaths[2].display(),
        imagepath = imagepath.display(),
        musicpath0 = musicpaths[0].display(),
        musicpath1 = musicpaths[1].display(),
        musicpath2 = musicpaths[2].display(),
        musicpath3 = musicpaths[3].display(),
        playlist_cover = playlist_cover.display(),
    );
    conn.execute_batch(&sql).expect("failed to seed cache");

    conn.execute_batch(
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
        GROUP BY t.id
        ",
    )
    .expect("failed to seed FTS index");

    fs::create_dir_all(source.join("!collages")).expect("failed to create !collages");
    fs::create_dir_all(source.join("!playlists")).expect("failed to create !playlists");
    for d in &dirpaths {
        fs::create_dir_all(d).expect("failed to create release dir");
        let name = d.file_name().unwrap().to_str().unwrap();
        fs::write(
            d.join(format!(".rose.{name}.toml")),
            format!("[release]\nid = \"{name}\"\nadded_at = \"0000-01-01T00:00:00+00:00\"\nnew = false\n"),
        )
        .expect("failed to write sidecar");
    }
    for f in &musicpaths {
        write_minimal_flac(f);
    }
    fs::write(&imagepath, "").expect("failed to create cover");
    fs::write(&playlist_cover, "").expect("failed to create playlist cover");
    for cn in ["Rose Gold", "Ruby Red"] {
        fs::write(source.join("!collages").join(format!("{cn}.toml")), "").expect("failed to write collage toml");
    }
    fs::write(
        source.join("!playlists").join("Lala Lisa.toml"),
        r#"[[tracks]]
track_uuid = "t1"
description_meta = "Techno Man & Bass Man - Track 1"

[[tracks]]
track_uuid = "t3"
description_meta = "Violin Woman - Track 1"
"#,
    )
    .expect("failed to write playlist toml");
    fs::write(source.join("!playlists").join("Turtle Rabbit.toml"), "").expect("failed to write playlist toml");

    (config, temp_dir)
}

/// Write a frameless FLAC container: magic, then one STREAMINFO block describing 2 seconds of
/// 44.1kHz/16-bit stereo.
pub fn write_minimal_flac(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create parent dir");
    }
    let mut data: Vec<u8> = Vec::with_capacity(42);
    data.extend_from_slice(b"fLaC");
    // Last-metadata-block flag + block type 0 (STREAMINFO), 34-byte body.
    data.push(0x80);
    data.extend_from_slice(&[0x00, 0x00, 0x22]);
    // Min/max blocksize 4096; min/max framesize 0.
    data.extend_from_slice(&[0x10, 0x00, 0x10, 0x00]);
    data.extend_from_slice(&[0x00; 6]);
    // Sample rate 44100, 2 channels, 16 bits per sample, 88200 total samples.
    data.extend_from_slice(&[0x0A, 0xC4, 0x42, 0xF0, 0x00, 0x01, 0x58, 0x88]);
    // MD5 of the (absent) audio data.
    data.extend_from_slice(&[0x00; 16]);
    fs::write(path, data).expect("failed to write flac");
}

#[derive(Debug, Clone, Default)]
pub struct FlacTags {
    pub album: Option<String>,
    pub albumartist: Option<String>,
    pub artist: Option<String>,
    pub title: Option<String>,
    pub tracknumber: Option<String>,
    pub discnumber: Option<String>,
    pub date: Option<String>,
    pub genre: Option<String>,
    pub secondarygenre: Option<String>,
    pub label: Option<String>,
    pub releasetype: Option<String>,
}

/// Synthesize a FLAC file and stamp it the way a foreign tagger would: plain uppercase Vorbis
/// comment keys, semicolon-joined multi-values.
pub fn write_test_flac(path: &Path, tags: &FlacTags) {
    write_minimal_flac(path);
    let mut tag = metaflac::Tag::read_from_path(path).expect("failed to read synthesized flac");
    let mut set = |key: &str, value: &Option<String>| {
        if let Some(value) = value {
            tag.set_vorbis(key.to_string(), vec![value.clone()]);
        }
    };
    set("ALBUM", &tags.album);
    set("ALBUMARTIST", &tags.albumartist);
    set("ARTIST", &tags.artist);
    set("TITLE", &tags.title);
    set("TRACKNUMBER", &tags.tracknumber);
    set("DISCNUMBER", &tags.discnumber);
    set("DATE", &tags.date);
    set("GENRE", &tags.genre);
    set("SECONDARYGENRE", &tags.secondarygenre);
    set("LABEL", &tags.label);
    set("RELEASETYPE", &tags.releasetype);
    tag.save().expect("failed to save synthesized flac tags");
}
