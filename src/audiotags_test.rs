use crate::audiotags::*;
use crate::common::{Artist, ArtistMapping, ReleaseType};
use crate::testing::{write_test_flac, FlacTags};

fn mapping(main: &[&str], guest: &[&str]) -> ArtistMapping {
    ArtistMapping {
        main: main.iter().map(|n| Artist::new(n)).collect(),
        guest: guest.iter().map(|n| Artist::new(n)).collect(),
        ..Default::default()
    }
}

#[test]
fn test_split_tag() {
    assert_eq!(split_tag(Some(r"a \\ b")), vec!["a", "b"]);
    assert_eq!(split_tag(Some("a;b")), vec!["a", "b"]);
    assert_eq!(split_tag(Some("a; b")), vec!["a", "b"]);
    assert_eq!(split_tag(Some("a vs. b")), vec!["a", "b"]);
    assert_eq!(split_tag(Some("a / b")), vec!["a", "b"]);
    assert_eq!(split_tag(None), Vec::<String>::new());
}

#[test]
fn test_rose_date_parse() {
    assert_eq!(RoseDate::parse(Some("1990")), Some(RoseDate::year(1990)));
    assert_eq!(RoseDate::parse(Some("1990-02-05")), Some(RoseDate::new(1990, 2, 5)));
    // A time value after the date is tolerated.
    assert_eq!(RoseDate::parse(Some("1990-02-05T12:00:00")), Some(RoseDate::new(1990, 2, 5)));
    assert_eq!(RoseDate::parse(Some("onetwothree")), None);
    assert_eq!(RoseDate::parse(None), None);
}

#[test]
fn test_rose_date_display() {
    assert_eq!(RoseDate::year(1990).to_string(), "1990");
    assert_eq!(RoseDate::new(1990, 2, 5).to_string(), "1990-02-05");
    assert_eq!(RoseDate { year: 90, month: None, day: None }.to_string(), "0090");
}

#[test]
fn test_supports_extension() {
    assert!(supports_extension(".mp3"));
    assert!(supports_extension(".FLAC"));
    assert!(supports_extension(".opus"));
    assert!(!supports_extension(".wav"));
}

#[test]
fn test_parse_artist_string() {
    assert_eq!(parse_artist_string(Some("A;B feat. C;D"), None, None, None, None), mapping(&["A", "B"], &["C", "D"]));
    assert_eq!(
        parse_artist_string(Some("A pres. C;D"), None, None, None, None),
        ArtistMapping { djmixer: vec![Artist::new("A")], main: vec![Artist::new("C"), Artist::new("D")], ..Default::default() }
    );
    assert_eq!(
        parse_artist_string(Some("A performed by C;D"), None, None, None, None),
        ArtistMapping { composer: vec![Artist::new("A")], main: vec![Artist::new("C"), Artist::new("D")], ..Default::default() }
    );
    assert_eq!(
        parse_artist_string(Some("A pres. B;C feat. D;E"), None, None, None, None),
        ArtistMapping {
            djmixer: vec![Artist::new("A")],
            main: vec![Artist::new("B"), Artist::new("C")],
            guest: vec![Artist::new("D"), Artist::new("E")],
            ..Default::default()
        }
    );
    assert_eq!(
        parse_artist_string(Some("A remixed by B produced by C"), None, None, None, None),
        ArtistMapping {
            main: vec![Artist::new("A")],
            remixer: vec![Artist::new("B")],
            producer: vec![Artist::new("C")],
            ..Default::default()
        }
    );
    // Role arguments from side tags are deduplicated against the inline grammar.
    assert_eq!(
        parse_artist_string(Some("A pres. B"), None, None, None, Some("A")),
        ArtistMapping { djmixer: vec![Artist::new("A")], main: vec![Artist::new("B")], ..Default::default() }
    );
}

#[test]
fn test_format_artist_string() {
    assert_eq!(format_artist_string(&mapping(&["A", "B"], &["C", "D"])), "A;B feat. C;D");
    assert_eq!(
        format_artist_string(&ArtistMapping {
            djmixer: vec![Artist::new("A")],
            main: vec![Artist::new("C"), Artist::new("D")],
            ..Default::default()
        }),
        "A pres. C;D"
    );
    assert_eq!(
        format_artist_string(&ArtistMapping {
            composer: vec![Artist::new("A")],
            main: vec![Artist::new("C")],
            producer: vec![Artist::new("E")],
            ..Default::default()
        }),
        "A performed by C produced by E"
    );
    // Aliased artists are never written to disk.
    assert_eq!(
        format_artist_string(&ArtistMapping {
            main: vec![Artist::new("A"), Artist::aliased("B")],
            ..Default::default()
        }),
        "A"
    );
}

#[test]
fn test_parse_format_round_trip() {
    for s in ["A;B feat. C;D", "A pres. B;C feat. D;E", "X performed by Y", "A remixed by B produced by C"] {
        let parsed = parse_artist_string(Some(s), None, None, None, None);
        assert_eq!(format_artist_string(&parsed), s);
    }
}

#[test]
fn test_flac_read() {
    let dir = crate::testing::init();
    let path = dir.path().join("track1.flac");
    write_test_flac(
        &path,
        &FlacTags {
            album: Some("A Cool Album".to_string()),
            albumartist: Some("Artist A;Artist B".to_string()),
            artist: Some("Artist A;Artist B feat. Artist C".to_string()),
            title: Some("Track 1".to_string()),
            tracknumber: Some("1".to_string()),
            discnumber: Some("1".to_string()),
            date: Some("1990-02-05".to_string()),
            genre: Some("Deep House;Ambient".to_string()),
            label: Some("A Cool Label".to_string()),
            releasetype: Some("album".to_string()),
            ..Default::default()
        },
    );

    let af = AudioTags::from_file(&path).unwrap();
    assert_eq!(af.releasetitle.as_deref(), Some("A Cool Album"));
    assert_eq!(af.releasetype, ReleaseType::Album);
    assert_eq!(af.releasedate, Some(RoseDate::new(1990, 2, 5)));
    assert_eq!(af.genre, vec!["Deep House", "Ambient"]);
    assert_eq!(af.label, vec!["A Cool Label"]);
    assert_eq!(af.tracktitle.as_deref(), Some("Track 1"));
    assert_eq!(af.tracknumber.as_deref(), Some("1"));
    assert_eq!(af.discnumber.as_deref(), Some("1"));
    assert_eq!(af.releaseartists.main, vec![Artist::new("Artist A"), Artist::new("Artist B")]);
    assert_eq!(af.trackartists.main, vec![Artist::new("Artist A"), Artist::new("Artist B")]);
    assert_eq!(af.trackartists.guest, vec![Artist::new("Artist C")]);
    // Duration comes from STREAMINFO: 88200 samples at 44.1kHz.
    assert_eq!(af.duration_sec, 2);
    assert_eq!(af.id, None);
    assert_eq!(af.release_id, None);
}

#[test]
fn test_flac_flush_round_trip() {
    let (c, dir) = crate::testing::config();
    let path = dir.path().join("track1.flac");
    write_test_flac(
        &path,
        &FlacTags {
            album: Some("A Cool Album".to_string()),
            artist: Some("Artist A".to_string()),
            title: Some("Track 1".to_string()),
            tracknumber: Some("1".to_string()),
            date: Some("1990".to_string()),
            genre: Some("Deep House".to_string()),
            ..Default::default()
        },
    );
    // A role side tag that the flush must clear, so the main tag stays the sole authority.
    {
        let mut tag = metaflac::Tag::read_from_path(&path).unwrap();
        tag.set_vorbis("REMIXER", vec!["Ghost Remixer"]);
        tag.save().unwrap();
    }

    let mut af = AudioTags::from_file(&path).unwrap();
    assert_eq!(af.trackartists.remixer, vec![Artist::new("Ghost Remixer")]);
    af.trackartists.remixer = vec![Artist::new("New Remixer")];
    af.originaldate = Some(RoseDate::new(1990, 4, 20));
    af.flush(&c).unwrap();

    let af = AudioTags::from_file(&path).unwrap();
    assert_eq!(af.releasetitle.as_deref(), Some("A Cool Album"));
    assert_eq!(af.releasedate, Some(RoseDate::year(1990)));
    assert_eq!(af.originaldate, Some(RoseDate::new(1990, 4, 20)));
    assert_eq!(af.genre, vec!["Deep House"]);
    assert_eq!(af.trackartists.main, vec![Artist::new("Artist A")]);
    assert_eq!(af.trackartists.remixer, vec![Artist::new("New Remixer")]);

    // The side tag is gone from the raw file.
    let tag = metaflac::Tag::read_from_path(&path).unwrap();
    assert!(tag.get_vorbis("REMIXER").map(|mut v| v.next().is_none()).unwrap_or(true));
}

#[test]
fn test_flac_id_assignment() {
    let (c, dir) = crate::testing::config();
    let path = dir.path().join("track1.flac");
    write_test_flac(&path, &FlacTags { title: Some("Track 1".to_string()), ..Default::default() });

    let mut af = AudioTags::from_file(&path).unwrap();
    af.id = Some("ahaha".to_string());
    af.release_id = Some("bahaha".to_string());
    af.flush(&c).unwrap();

    let af = AudioTags::from_file(&path).unwrap();
    assert_eq!(af.id.as_deref(), Some("ahaha"));
    assert_eq!(af.release_id.as_deref(), Some("bahaha"));
}

#[test]
fn test_releasetype_normalization() {
    let (c, dir) = crate::testing::config();
    let path = dir.path().join("track1.flac");
    write_test_flac(&path, &FlacTags { releasetype: Some("ALBUM".to_string()), ..Default::default() });
    let mut af = AudioTags::from_file(&path).unwrap();
    assert_eq!(af.releasetype, ReleaseType::Album);

    // An unrecognized stored value reads back as unknown.
    af.releasetype = ReleaseType::Unknown;
    af.flush(&c).unwrap();
    let af = AudioTags::from_file(&path).unwrap();
    assert_eq!(af.releasetype, ReleaseType::Unknown);
}

#[test]
fn test_write_parent_genres() {
    let (mut c, dir) = crate::testing::config();
    c.write_parent_genres = true;
    let path = dir.path().join("track1.flac");
    write_test_flac(&path, &FlacTags { genre: Some("Deep House".to_string()), ..Default::default() });

    let af = AudioTags::from_file(&path).unwrap();
    af.flush(&c).unwrap();

    // Parents land in the raw tag after a marker, and are stripped back out on read.
    let tag = metaflac::Tag::read_from_path(&path).unwrap();
    let raw: Vec<&str> = tag.get_vorbis("GENRE").unwrap().collect();
    assert_eq!(raw, vec![r"Deep House\\PARENTS:\\Dance;Electronic;Electronic Dance Music;House"]);
    let af = AudioTags::from_file(&path).unwrap();
    assert_eq!(af.genre, vec!["Deep House"]);
}

#[test]
fn test_extract_cover_absent() {
    let dir = crate::testing::init();
    let path = dir.path().join("track1.flac");
    write_test_flac(&path, &FlacTags::default());
    assert!(AudioTags::extract_cover(&path).unwrap().is_none());
}

#[test]
fn test_unsupported_filetype() {
    let dir = crate::testing::init();
    let path = dir.path().join("track1.wav");
    std::fs::write(&path, "not audio").unwrap();
    assert!(AudioTags::from_file(&path).is_err());
}
