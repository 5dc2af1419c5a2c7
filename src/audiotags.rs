/// The audiotags module abstracts over tag reading and writing for five different audio
/// containers, exposing a single standard interface for all audio files.
///
/// It also owns the Rose-specific tagging semantics: multi-valued tags, the inline artist role
/// grammar, release type normalization, and the embedded stable identifiers.
use std::path::{Path, PathBuf};

use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::tag::{ItemKey, Tag as LoftyTag, TagExt, TagType};
use id3::TagLike;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::common::{flatten, uniq, Artist, ArtistMapping, ReleaseType};
use crate::config::Config;
use crate::error::{Result, RoseError, RoseExpectedError};
use crate::genre_hierarchy::transitive_parent_genres;

pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 5] = [".mp3", ".m4a", ".ogg", ".opus", ".flac"];

/// Whether the given file extension (with leading dot, any case) is a supported audio container.
pub fn supports_extension(ext: &str) -> bool {
    let ext = ext.to_lowercase();
    SUPPORTED_AUDIO_EXTENSIONS.iter().any(|e| *e == ext)
}

pub fn is_supported_audio_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| supports_extension(&format!(".{e}")))
        .unwrap_or(false)
}

static TAG_SPLITTER_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r" \\\\ | / |; ?| vs\. ").unwrap());
static DATE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})").unwrap());

/// A possibly-partial date: a year, optionally with month and day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoseDate {
    pub year: i32,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl RoseDate {
    pub fn year(year: i32) -> RoseDate {
        RoseDate { year, month: None, day: None }
    }

    pub fn new(year: i32, month: u32, day: u32) -> RoseDate {
        RoseDate { year, month: Some(month), day: Some(day) }
    }

    /// Parse a date out of a tag value. Bare years and `YYYY-MM-DD` prefixes are accepted;
    /// anything else is None.
    pub fn parse(value: Option<&str>) -> Option<RoseDate> {
        let value = value?.trim();
        if value.is_empty() {
            return None;
        }
        if let Ok(year) = value.parse::<i32>() {
            return Some(RoseDate::year(year));
        }
        if let Some(m) = DATE_REGEX.captures(value) {
            return Some(RoseDate::new(
                m[1].parse().ok()?,
                m[2].parse().ok()?,
                m[3].parse().ok()?,
            ));
        }
        None
    }
}

impl std::fmt::Display for RoseDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.month, self.day) {
            (None, None) => write!(f, "{:04}", self.year),
            _ => write!(f, "{:04}-{:02}-{:02}", self.year, self.month.unwrap_or(1), self.day.unwrap_or(1)),
        }
    }
}

/// The uniform tag contract across all supported containers.
#[derive(Debug, Clone)]
pub struct AudioTags {
    pub id: Option<String>,
    pub release_id: Option<String>,

    pub tracktitle: Option<String>,
    pub tracknumber: Option<String>,
    pub tracktotal: Option<i32>,
    pub discnumber: Option<String>,
    pub disctotal: Option<i32>,
    pub trackartists: ArtistMapping,

    pub releasetitle: Option<String>,
    pub releasetype: ReleaseType,
    pub releasedate: Option<RoseDate>,
    pub originaldate: Option<RoseDate>,
    pub compositiondate: Option<RoseDate>,
    pub genre: Vec<String>,
    pub secondarygenre: Vec<String>,
    pub descriptor: Vec<String>,
    pub edition: Option<String>,
    pub label: Vec<String>,
    pub catalognumber: Option<String>,
    pub releaseartists: ArtistMapping,

    /// Read-only: never written back to the file.
    pub duration_sec: i32,
    pub path: PathBuf,
}

enum Container {
    Mp3,
    M4a,
    Flac,
    OggVorbis,
    Opus,
}

fn container_for(path: &Path) -> Result<Container> {
    let ext = path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()).unwrap_or_default();
    match ext.as_str() {
        "mp3" => Ok(Container::Mp3),
        "m4a" => Ok(Container::M4a),
        "flac" => Ok(Container::Flac),
        "ogg" => Ok(Container::OggVorbis),
        "opus" => Ok(Container::Opus),
        _ => Err(RoseExpectedError::UnsupportedFiletype { extension: format!(".{ext}") }.into()),
    }
}

fn corrupt(path: &Path, message: impl std::fmt::Display) -> RoseError {
    RoseExpectedError::CorruptAudioFile { path: path.to_path_buf(), message: message.to_string() }.into()
}

impl AudioTags {
    /// Read the tags of an audio file on disk.
    pub fn from_file(path: &Path) -> Result<AudioTags> {
        match container_for(path)? {
            Container::Mp3 => read_mp3(path),
            Container::M4a => read_m4a(path),
            Container::Flac => read_flac(path),
            Container::OggVorbis | Container::Opus => read_ogg(path),
        }
    }

    /// Flush the current tags to the file on disk. Writing is deterministic and idempotent; role
    /// side tags are cleared so the main artist tag is the sole authority.
    pub fn flush(&self, c: &Config) -> Result<()> {
        match container_for(&self.path)? {
            Container::Mp3 => write_mp3(self, c),
            Container::M4a => write_m4a(self, c),
            Container::Flac => write_flac(self, c),
            Container::OggVorbis | Container::Opus => write_ogg(self, c),
        }
    }

    /// Pull the embedded cover art out of an audio file, if any.
    pub fn extract_cover(path: &Path) -> Result<Option<Vec<u8>>> {
        match container_for(path)? {
            Container::Mp3 => {
                let tag = match id3::Tag::read_from_path(path) {
                    Ok(tag) => tag,
                    Err(e) if matches!(e.kind, id3::ErrorKind::NoTag) => return Ok(None),
                    Err(e) => return Err(corrupt(path, e)),
                };
                let data = tag.pictures().next().map(|p| p.data.clone());
                Ok(data)
            }
            Container::M4a => {
                let tag = mp4ameta::Tag::read_from_path(path).map_err(|e| corrupt(path, e))?;
                Ok(tag.artwork().map(|img| img.data.to_vec()))
            }
            Container::Flac => {
                let tag = metaflac::Tag::read_from_path(path).map_err(|e| corrupt(path, e))?;
                let data = tag.pictures().next().map(|p| p.data.clone());
                Ok(data)
            }
            Container::OggVorbis | Container::Opus => {
                let tagged = lofty::read_from_path(path).map_err(|e| corrupt(path, e))?;
                Ok(tagged
                    .tag(TagType::VorbisComments)
                    .and_then(|t| t.pictures().first())
                    .map(|p| p.data().to_vec()))
            }
        }
    }
}

pub fn split_tag(value: Option<&str>) -> Vec<String> {
    match value {
        Some(v) if !v.is_empty() => TAG_SPLITTER_REGEX.split(v).map(|s| s.to_string()).collect(),
        _ => Vec::new(),
    }
}

/// Genre tags may carry a written-out parent genre suffix; strip it on read.
fn split_genre_tag(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else { return Vec::new() };
    let value = value.split(r"\\PARENTS:\\").next().unwrap_or(value);
    split_tag(Some(value))
}

fn format_genre_tag(c: &Config, genres: &[String]) -> String {
    if !c.write_parent_genres {
        return genres.join(";");
    }
    let mut parents: Vec<String> =
        uniq(flatten(genres.iter().map(|g| transitive_parent_genres(g)).collect()))
            .into_iter()
            .filter(|p| !genres.contains(p))
            .collect();
    if parents.is_empty() {
        return genres.join(";");
    }
    parents.sort();
    format!(r"{}\\PARENTS:\\{}", genres.join(";"), parents.join(";"))
}

fn parse_int(value: Option<&str>) -> Option<i32> {
    value.and_then(|v| v.trim().parse().ok())
}

/// Parse the inline artist role grammar:
///
/// ```text
/// [composer " performed by "] [dj " pres. "] main [" feat. " guest]
///     [" remixed by " remixer] [" produced by " producer]
/// ```
///
/// Parsing is total; unrecognized shapes land in `main`. Role arguments carry values from
/// container-specific side tags.
pub fn parse_artist_string(
    main: Option<&str>,
    remixer: Option<&str>,
    composer: Option<&str>,
    producer: Option<&str>,
    dj: Option<&str>,
) -> ArtistMapping {
    let mut li_main: Vec<String> = Vec::new();
    let mut li_guest: Vec<String> = Vec::new();
    let mut li_remixer = split_tag(remixer);
    let mut li_composer = split_tag(composer);
    let mut li_producer = split_tag(producer);
    let mut li_dj = split_tag(dj);

    let mut main = main.unwrap_or("").to_string();
    if let Some((rest, producer)) = main.split_once("produced by ") {
        li_producer.extend(split_tag(Some(producer)));
        main = rest.trim_end().to_string();
    }
    if let Some((rest, remixer)) = main.split_once("remixed by ") {
        li_remixer.extend(split_tag(Some(remixer)));
        main = rest.trim_end().to_string();
    }
    if let Some((rest, guest)) = main.split_once("feat. ") {
        li_guest.extend(split_tag(Some(guest)));
        main = rest.trim_end().to_string();
    }
    if let Some((dj, rest)) = main.split_once("pres. ") {
        li_dj.extend(split_tag(Some(dj.trim_end())));
        main = rest.to_string();
    }
    if let Some((composer, rest)) = main.split_once("performed by ") {
        li_composer.extend(split_tag(Some(composer.trim_end())));
        main = rest.to_string();
    }
    if !main.is_empty() {
        li_main.extend(split_tag(Some(&main)));
    }

    fn to_artists(names: Vec<String>) -> Vec<Artist> {
        uniq(names).into_iter().filter(|n| !n.is_empty()).map(|n| Artist::new(&n)).collect()
    }

    ArtistMapping {
        main: to_artists(li_main),
        guest: to_artists(li_guest),
        remixer: to_artists(li_remixer),
        producer: to_artists(li_producer),
        composer: to_artists(li_composer),
        djmixer: to_artists(li_dj),
    }
}

/// Format an artist mapping back into the inline role grammar. Aliased artists are not written.
pub fn format_artist_string(mapping: &ArtistMapping) -> String {
    fn format_role(artists: &[Artist]) -> String {
        artists.iter().filter(|a| !a.alias).map(|a| a.name.as_str()).collect::<Vec<_>>().join(";")
    }

    let mut r = format_role(&mapping.main);
    if !mapping.composer.is_empty() {
        r = format_role(&mapping.composer) + " performed by " + &r;
    }
    if !mapping.djmixer.is_empty() {
        r = format_role(&mapping.djmixer) + " pres. " + &r;
    }
    if !mapping.guest.is_empty() {
        r = r + " feat. " + &format_role(&mapping.guest);
    }
    if !mapping.remixer.is_empty() {
        r = r + " remixed by " + &format_role(&mapping.remixer);
    }
    if !mapping.producer.is_empty() {
        r = r + " produced by " + &format_role(&mapping.producer);
    }
    r
}

// ID3 (.mp3).

fn id3_text(tag: &id3::Tag, id: &str) -> Option<String> {
    // Multi-valued ID3v2.4 text frames are null-separated; re-join on our splitter's separator.
    tag.get(id)
        .and_then(|f| f.content().text())
        .map(|t| t.replace('\0', ";"))
        .filter(|t| !t.is_empty())
}

fn id3_extended_text(tag: &id3::Tag, description: &str) -> Option<String> {
    tag.extended_texts()
        .find(|t| t.description == description)
        .map(|t| t.value.trim_end_matches('\0').to_string())
        .filter(|t| !t.is_empty())
}

fn id3_timestamp_to_date(ts: Option<id3::Timestamp>) -> Option<RoseDate> {
    ts.map(|ts| RoseDate { year: ts.year, month: ts.month.map(|m| m as u32), day: ts.day.map(|d| d as u32) })
}

fn date_to_id3_timestamp(date: RoseDate) -> id3::Timestamp {
    id3::Timestamp {
        year: date.year,
        month: date.month.map(|m| m as u8),
        day: date.day.map(|d| d as u8),
        hour: None,
        minute: None,
        second: None,
    }
}

fn read_mp3(path: &Path) -> Result<AudioTags> {
    use id3::TagLike;

    let tag = match id3::Tag::read_from_path(path) {
        Ok(tag) => tag,
        Err(e) if matches!(e.kind, id3::ErrorKind::NoTag) => id3::Tag::new(),
        Err(e) => return Err(corrupt(path, e)),
    };

    // ID3 encodes trackno/discno as `no/total`; split them apart.
    let mut tracknumber = None;
    let mut tracktotal = None;
    if let Some(trck) = id3_text(&tag, "TRCK") {
        match trck.split_once('/') {
            Some((no, total)) => {
                tracknumber = Some(no.to_string());
                tracktotal = parse_int(Some(total));
            }
            None => tracknumber = Some(trck),
        }
    }
    let mut discnumber = None;
    let mut disctotal = None;
    if let Some(tpos) = id3_text(&tag, "TPOS") {
        match tpos.split_once('/') {
            Some((no, total)) => {
                discnumber = Some(no.to_string());
                disctotal = parse_int(Some(total));
            }
            None => discnumber = Some(tpos),
        }
    }

    let duration_sec = match mp3_duration::from_path(path) {
        Ok(d) => d.as_secs() as i32,
        Err(e) => {
            warn!("Failed to read duration of {}: {}", path.display(), e);
            0
        }
    };

    Ok(AudioTags {
        id: id3_extended_text(&tag, "ROSEID"),
        release_id: id3_extended_text(&tag, "ROSERELEASEID"),
        tracktitle: id3_text(&tag, "TIT2"),
        tracknumber,
        tracktotal,
        discnumber,
        disctotal,
        trackartists: parse_artist_string(
            id3_text(&tag, "TPE1").as_deref(),
            id3_text(&tag, "TPE4").as_deref(),
            id3_text(&tag, "TCOM").as_deref(),
            None,
            None,
        ),
        releasetitle: id3_text(&tag, "TALB"),
        releasetype: ReleaseType::from_str(
            id3_extended_text(&tag, "RELEASETYPE").unwrap_or_default().as_str(),
        ),
        releasedate: id3_timestamp_to_date(tag.date_recorded())
            .or_else(|| RoseDate::parse(id3_text(&tag, "TYER").as_deref())),
        originaldate: id3_timestamp_to_date(tag.original_date_released()),
        compositiondate: RoseDate::parse(id3_extended_text(&tag, "COMPOSITIONDATE").as_deref()),
        genre: split_genre_tag(id3_text(&tag, "TCON").as_deref()),
        secondarygenre: split_genre_tag(id3_extended_text(&tag, "SECONDARYGENRE").as_deref()),
        descriptor: split_tag(id3_extended_text(&tag, "DESCRIPTOR").as_deref()),
        edition: id3_extended_text(&tag, "EDITION"),
        label: split_tag(id3_text(&tag, "TPUB").as_deref()),
        catalognumber: id3_extended_text(&tag, "CATALOGNUMBER"),
        releaseartists: parse_artist_string(id3_text(&tag, "TPE2").as_deref(), None, None, None, None),
        duration_sec,
        path: path.to_path_buf(),
    })
}

fn write_mp3(t: &AudioTags, c: &Config) -> Result<()> {
    use id3::frame::ExtendedText;
    use id3::TagLike;

    let mut tag = match id3::Tag::read_from_path(&t.path) {
        Ok(tag) => tag,
        Err(e) if matches!(e.kind, id3::ErrorKind::NoTag) => id3::Tag::new(),
        Err(e) => return Err(corrupt(&t.path, e)),
    };

    fn set_text(tag: &mut id3::Tag, id: &'static str, value: Option<String>) {
        use id3::TagLike;
        tag.remove(id);
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            tag.add_frame(id3::Frame::text(id, value));
        }
    }
    fn set_extended(tag: &mut id3::Tag, description: &str, value: Option<String>) {
        use id3::TagLike;
        tag.remove_extended_text(Some(description), None);
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            tag.add_frame(ExtendedText { description: description.to_string(), value });
        }
    }

    set_extended(&mut tag, "ROSEID", t.id.clone());
    set_extended(&mut tag, "ROSERELEASEID", t.release_id.clone());
    set_text(&mut tag, "TIT2", t.tracktitle.clone());
    match t.releasedate {
        Some(d) => tag.set_date_recorded(date_to_id3_timestamp(d)),
        None => {
            tag.remove("TDRC");
        }
    }
    match t.originaldate {
        Some(d) => tag.set_original_date_released(date_to_id3_timestamp(d)),
        None => {
            tag.remove("TDOR");
        }
    }
    set_extended(&mut tag, "COMPOSITIONDATE", t.compositiondate.map(|d| d.to_string()));
    set_text(&mut tag, "TRCK", t.tracknumber.clone());
    set_text(&mut tag, "TPOS", t.discnumber.clone());
    set_text(&mut tag, "TALB", t.releasetitle.clone());
    set_text(&mut tag, "TCON", Some(format_genre_tag(c, &t.genre)));
    set_extended(&mut tag, "SECONDARYGENRE", Some(format_genre_tag(c, &t.secondarygenre)));
    set_extended(&mut tag, "DESCRIPTOR", Some(t.descriptor.join(";")));
    set_text(&mut tag, "TPUB", Some(t.label.join(";")));
    set_extended(&mut tag, "CATALOGNUMBER", t.catalognumber.clone());
    set_extended(&mut tag, "EDITION", t.edition.clone());
    set_extended(&mut tag, "RELEASETYPE", Some(t.releasetype.as_str().to_string()));
    set_text(&mut tag, "TPE2", Some(format_artist_string(&t.releaseartists)));
    set_text(&mut tag, "TPE1", Some(format_artist_string(&t.trackartists)));
    // The full roster is encoded into the main artist tag; wipe the role side tags.
    tag.remove("TPE4");
    tag.remove("TCOM");
    tag.remove("TIPL");
    tag.remove("IPLS");

    tag.write_to_path(&t.path, id3::Version::Id3v24).map_err(|e| corrupt(&t.path, e))?;
    Ok(())
}

// MP4 atoms (.m4a).

const M4A_FREEFORM_MEAN: &str = "net.sunsetglow.rose";
const M4A_ITUNES_MEAN: &str = "com.apple.iTunes";

fn m4a_freeform(tag: &mp4ameta::Tag, mean: &str, name: &str) -> Option<String> {
    let ident = mp4ameta::FreeformIdent::new(mean, name);
    let values: Vec<&str> = tag.strings_of(&ident).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(";")).filter(|v| !v.is_empty())
    }
}

fn read_m4a(path: &Path) -> Result<AudioTags> {
    let tag = mp4ameta::Tag::read_from_path(path).map_err(|e| corrupt(path, e))?;

    let joined = |values: Vec<&str>| -> Option<String> {
        if values.is_empty() {
            None
        } else {
            Some(values.join(";"))
        }
    };

    Ok(AudioTags {
        id: m4a_freeform(&tag, M4A_FREEFORM_MEAN, "ID"),
        release_id: m4a_freeform(&tag, M4A_FREEFORM_MEAN, "RELEASEID"),
        tracktitle: tag.title().map(|s| s.to_string()),
        tracknumber: tag.track_number().map(|n| n.to_string()),
        tracktotal: tag.total_tracks().map(|n| n as i32),
        discnumber: tag.disc_number().map(|n| n.to_string()),
        disctotal: tag.total_discs().map(|n| n as i32),
        trackartists: parse_artist_string(
            joined(tag.artists().collect()).as_deref(),
            m4a_freeform(&tag, M4A_ITUNES_MEAN, "REMIXER").as_deref(),
            joined(tag.composers().collect()).as_deref(),
            m4a_freeform(&tag, M4A_ITUNES_MEAN, "PRODUCER").as_deref(),
            m4a_freeform(&tag, M4A_ITUNES_MEAN, "DJMIXER").as_deref(),
        ),
        releasetitle: tag.album().map(|s| s.to_string()),
        releasetype: ReleaseType::from_str(
            m4a_freeform(&tag, M4A_ITUNES_MEAN, "RELEASETYPE").unwrap_or_default().as_str(),
        ),
        releasedate: RoseDate::parse(tag.year()),
        originaldate: RoseDate::parse(m4a_freeform(&tag, M4A_FREEFORM_MEAN, "ORIGINALDATE").as_deref()),
        compositiondate: RoseDate::parse(m4a_freeform(&tag, M4A_FREEFORM_MEAN, "COMPOSITIONDATE").as_deref()),
        genre: split_genre_tag(joined(tag.genres().collect()).as_deref()),
        secondarygenre: split_genre_tag(m4a_freeform(&tag, M4A_FREEFORM_MEAN, "SECONDARYGENRE").as_deref()),
        descriptor: split_tag(m4a_freeform(&tag, M4A_FREEFORM_MEAN, "DESCRIPTOR").as_deref()),
        edition: m4a_freeform(&tag, M4A_FREEFORM_MEAN, "EDITION"),
        label: split_tag(m4a_freeform(&tag, M4A_ITUNES_MEAN, "LABEL").as_deref()),
        catalognumber: m4a_freeform(&tag, M4A_ITUNES_MEAN, "CATALOGNUMBER"),
        releaseartists: parse_artist_string(
            joined(tag.album_artists().collect()).as_deref(),
            None,
            None,
            None,
            None,
        ),
        duration_sec: tag.duration().map(|d| d.as_secs() as i32).unwrap_or(0),
        path: path.to_path_buf(),
    })
}

fn write_m4a(t: &AudioTags, c: &Config) -> Result<()> {
    let mut tag = mp4ameta::Tag::read_from_path(&t.path).map_err(|e| corrupt(&t.path, e))?;

    fn set_freeform(tag: &mut mp4ameta::Tag, mean: &str, name: &str, value: Option<String>) {
        let ident = mp4ameta::FreeformIdent::new(mean, name);
        tag.remove_data_of(&ident);
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            tag.set_data(ident, mp4ameta::Data::Utf8(value));
        }
    }

    set_freeform(&mut tag, M4A_FREEFORM_MEAN, "ID", t.id.clone());
    set_freeform(&mut tag, M4A_FREEFORM_MEAN, "RELEASEID", t.release_id.clone());
    match &t.tracktitle {
        Some(title) => tag.set_title(title.clone()),
        None => tag.remove_title(),
    }
    match t.releasedate {
        Some(d) => tag.set_year(d.to_string()),
        None => tag.remove_year(),
    }
    set_freeform(&mut tag, M4A_FREEFORM_MEAN, "ORIGINALDATE", t.originaldate.map(|d| d.to_string()));
    set_freeform(&mut tag, M4A_FREEFORM_MEAN, "COMPOSITIONDATE", t.compositiondate.map(|d| d.to_string()));
    match &t.releasetitle {
        Some(album) => tag.set_album(album.clone()),
        None => tag.remove_album(),
    }
    tag.remove_genres();
    let genre = format_genre_tag(c, &t.genre);
    if !genre.is_empty() {
        tag.set_genre(genre);
    }
    set_freeform(&mut tag, M4A_FREEFORM_MEAN, "SECONDARYGENRE", Some(format_genre_tag(c, &t.secondarygenre)));
    set_freeform(&mut tag, M4A_FREEFORM_MEAN, "DESCRIPTOR", Some(t.descriptor.join(";")));
    set_freeform(&mut tag, M4A_ITUNES_MEAN, "LABEL", Some(t.label.join(";")));
    set_freeform(&mut tag, M4A_ITUNES_MEAN, "CATALOGNUMBER", t.catalognumber.clone());
    set_freeform(&mut tag, M4A_FREEFORM_MEAN, "EDITION", t.edition.clone());
    set_freeform(&mut tag, M4A_ITUNES_MEAN, "RELEASETYPE", Some(t.releasetype.as_str().to_string()));
    tag.remove_album_artists();
    tag.set_album_artist(format_artist_string(&t.releaseartists));
    tag.remove_artists();
    tag.set_artist(format_artist_string(&t.trackartists));
    set_freeform(&mut tag, M4A_ITUNES_MEAN, "REMIXER", None);
    set_freeform(&mut tag, M4A_ITUNES_MEAN, "PRODUCER", None);
    set_freeform(&mut tag, M4A_ITUNES_MEAN, "DJMIXER", None);
    tag.remove_composers();

    // MP4 track/disc numbers must be integers.
    match &t.tracknumber {
        Some(no) => {
            let no: u16 = no.trim().parse().map_err(|_| {
                RoseError::Expected(RoseExpectedError::UnsupportedTagValue(format!(
                    "m4a tracknumber must be an integer, got {no:?}"
                )))
            })?;
            tag.set_track_number(no);
        }
        None => tag.remove_track_number(),
    }
    match &t.discnumber {
        Some(no) => {
            let no: u16 = no.trim().parse().map_err(|_| {
                RoseError::Expected(RoseExpectedError::UnsupportedTagValue(format!(
                    "m4a discnumber must be an integer, got {no:?}"
                )))
            })?;
            tag.set_disc_number(no);
        }
        None => tag.remove_disc_number(),
    }

    tag.write_to_path(&t.path).map_err(|e| corrupt(&t.path, e))?;
    Ok(())
}

// FLAC (Vorbis comments).

fn flac_get(tag: &metaflac::Tag, key: &str) -> Option<String> {
    for k in [key.to_uppercase(), key.to_lowercase()] {
        if let Some(values) = tag.get_vorbis(&k) {
            let values: Vec<&str> = values.collect();
            if !values.is_empty() {
                return Some(values.join(";")).filter(|v| !v.is_empty());
            }
        }
    }
    None
}

fn read_flac(path: &Path) -> Result<AudioTags> {
    let tag = metaflac::Tag::read_from_path(path).map_err(|e| corrupt(path, e))?;

    let duration_sec = tag
        .get_streaminfo()
        .filter(|si| si.sample_rate > 0)
        .map(|si| (si.total_samples as f64 / si.sample_rate as f64).round() as i32)
        .unwrap_or(0);

    Ok(AudioTags {
        id: flac_get(&tag, "ROSEID"),
        release_id: flac_get(&tag, "ROSERELEASEID"),
        tracktitle: flac_get(&tag, "TITLE"),
        tracknumber: flac_get(&tag, "TRACKNUMBER"),
        tracktotal: parse_int(flac_get(&tag, "TRACKTOTAL").as_deref()),
        discnumber: flac_get(&tag, "DISCNUMBER"),
        disctotal: parse_int(flac_get(&tag, "DISCTOTAL").as_deref()),
        trackartists: parse_artist_string(
            flac_get(&tag, "ARTIST").as_deref(),
            flac_get(&tag, "REMIXER").as_deref(),
            flac_get(&tag, "COMPOSER").as_deref(),
            flac_get(&tag, "PRODUCER").as_deref(),
            flac_get(&tag, "DJMIXER").as_deref(),
        ),
        releasetitle: flac_get(&tag, "ALBUM"),
        releasetype: ReleaseType::from_str(flac_get(&tag, "RELEASETYPE").unwrap_or_default().as_str()),
        releasedate: RoseDate::parse(flac_get(&tag, "DATE").or_else(|| flac_get(&tag, "YEAR")).as_deref()),
        originaldate: RoseDate::parse(
            flac_get(&tag, "ORIGINALDATE").or_else(|| flac_get(&tag, "ORIGINALYEAR")).as_deref(),
        ),
        compositiondate: RoseDate::parse(flac_get(&tag, "COMPOSITIONDATE").as_deref()),
        genre: split_genre_tag(flac_get(&tag, "GENRE").as_deref()),
        secondarygenre: split_genre_tag(flac_get(&tag, "SECONDARYGENRE").as_deref()),
        descriptor: split_tag(flac_get(&tag, "DESCRIPTOR").as_deref()),
        edition: flac_get(&tag, "EDITION"),
        label: split_tag(
            flac_get(&tag, "LABEL")
                .or_else(|| flac_get(&tag, "ORGANIZATION"))
                .or_else(|| flac_get(&tag, "RECORDLABEL"))
                .as_deref(),
        ),
        catalognumber: flac_get(&tag, "CATALOGNUMBER"),
        releaseartists: parse_artist_string(flac_get(&tag, "ALBUMARTIST").as_deref(), None, None, None, None),
        duration_sec,
        path: path.to_path_buf(),
    })
}

fn write_flac(t: &AudioTags, c: &Config) -> Result<()> {
    let mut tag = metaflac::Tag::read_from_path(&t.path).map_err(|e| corrupt(&t.path, e))?;

    fn set(tag: &mut metaflac::Tag, key: &str, value: Option<String>) {
        tag.remove_vorbis(&key.to_lowercase());
        tag.remove_vorbis(&key.to_uppercase());
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            tag.set_vorbis(key.to_uppercase(), vec![value]);
        }
    }

    set(&mut tag, "ROSEID", t.id.clone());
    set(&mut tag, "ROSERELEASEID", t.release_id.clone());
    set(&mut tag, "TITLE", t.tracktitle.clone());
    set(&mut tag, "DATE", t.releasedate.map(|d| d.to_string()));
    set(&mut tag, "ORIGINALDATE", t.originaldate.map(|d| d.to_string()));
    set(&mut tag, "COMPOSITIONDATE", t.compositiondate.map(|d| d.to_string()));
    set(&mut tag, "TRACKNUMBER", t.tracknumber.clone());
    set(&mut tag, "TRACKTOTAL", t.tracktotal.map(|n| n.to_string()));
    set(&mut tag, "DISCNUMBER", t.discnumber.clone());
    set(&mut tag, "DISCTOTAL", t.disctotal.map(|n| n.to_string()));
    set(&mut tag, "ALBUM", t.releasetitle.clone());
    set(&mut tag, "GENRE", Some(format_genre_tag(c, &t.genre)));
    set(&mut tag, "SECONDARYGENRE", Some(format_genre_tag(c, &t.secondarygenre)));
    set(&mut tag, "DESCRIPTOR", Some(t.descriptor.join(";")));
    set(&mut tag, "LABEL", Some(t.label.join(";")));
    set(&mut tag, "CATALOGNUMBER", t.catalognumber.clone());
    set(&mut tag, "EDITION", t.edition.clone());
    set(&mut tag, "RELEASETYPE", Some(t.releasetype.as_str().to_string()));
    set(&mut tag, "ALBUMARTIST", Some(format_artist_string(&t.releaseartists)));
    set(&mut tag, "ARTIST", Some(format_artist_string(&t.trackartists)));
    // The full roster is encoded into the main artist tag; wipe the role side tags.
    set(&mut tag, "REMIXER", None);
    set(&mut tag, "PRODUCER", None);
    set(&mut tag, "COMPOSER", None);
    set(&mut tag, "DJMIXER", None);

    tag.save().map_err(|e| corrupt(&t.path, e))?;
    Ok(())
}

// Ogg Vorbis and Opus, via lofty's shared Vorbis comment handling.

fn lofty_get(tag: &LoftyTag, key: &ItemKey) -> Option<String> {
    let values: Vec<&str> = tag.get_strings(key).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(";")).filter(|v| !v.is_empty())
    }
}

fn lofty_unknown(tag: &LoftyTag, key: &str) -> Option<String> {
    lofty_get(tag, &ItemKey::Unknown(key.to_string()))
}

fn read_ogg(path: &Path) -> Result<AudioTags> {
    let tagged = lofty::read_from_path(path).map_err(|e| corrupt(path, e))?;
    let duration_sec = tagged.properties().duration().as_secs() as i32;
    let empty = LoftyTag::new(TagType::VorbisComments);
    let tag = tagged.tag(TagType::VorbisComments).unwrap_or(&empty);

    Ok(AudioTags {
        id: lofty_unknown(tag, "ROSEID"),
        release_id: lofty_unknown(tag, "ROSERELEASEID"),
        tracktitle: lofty_get(tag, &ItemKey::TrackTitle),
        tracknumber: lofty_get(tag, &ItemKey::TrackNumber),
        tracktotal: parse_int(lofty_get(tag, &ItemKey::TrackTotal).as_deref()),
        discnumber: lofty_get(tag, &ItemKey::DiscNumber),
        disctotal: parse_int(lofty_get(tag, &ItemKey::DiscTotal).as_deref()),
        trackartists: parse_artist_string(
            lofty_get(tag, &ItemKey::TrackArtist).as_deref(),
            lofty_get(tag, &ItemKey::Remixer).as_deref(),
            lofty_get(tag, &ItemKey::Composer).as_deref(),
            lofty_get(tag, &ItemKey::Producer).as_deref(),
            lofty_get(tag, &ItemKey::MixDj).as_deref(),
        ),
        releasetitle: lofty_get(tag, &ItemKey::AlbumTitle),
        releasetype: ReleaseType::from_str(lofty_unknown(tag, "RELEASETYPE").unwrap_or_default().as_str()),
        releasedate: RoseDate::parse(
            lofty_get(tag, &ItemKey::RecordingDate).or_else(|| lofty_get(tag, &ItemKey::Year)).as_deref(),
        ),
        originaldate: RoseDate::parse(lofty_get(tag, &ItemKey::OriginalReleaseDate).as_deref()),
        compositiondate: RoseDate::parse(lofty_unknown(tag, "COMPOSITIONDATE").as_deref()),
        genre: split_genre_tag(lofty_get(tag, &ItemKey::Genre).as_deref()),
        secondarygenre: split_genre_tag(lofty_unknown(tag, "SECONDARYGENRE").as_deref()),
        descriptor: split_tag(lofty_unknown(tag, "DESCRIPTOR").as_deref()),
        edition: lofty_unknown(tag, "EDITION"),
        label: split_tag(lofty_get(tag, &ItemKey::Label).as_deref()),
        catalognumber: lofty_get(tag, &ItemKey::CatalogNumber),
        releaseartists: parse_artist_string(lofty_get(tag, &ItemKey::AlbumArtist).as_deref(), None, None, None, None),
        duration_sec,
        path: path.to_path_buf(),
    })
}

fn write_ogg(t: &AudioTags, c: &Config) -> Result<()> {
    let tagged = lofty::read_from_path(&t.path).map_err(|e| corrupt(&t.path, e))?;
    let mut tag = tagged.tag(TagType::VorbisComments).cloned().unwrap_or_else(|| LoftyTag::new(TagType::VorbisComments));

    fn set(tag: &mut LoftyTag, key: ItemKey, value: Option<String>) {
        let _ = tag.remove_key(&key);
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            tag.insert_text(key, value);
        }
    }
    fn set_unknown(tag: &mut LoftyTag, key: &str, value: Option<String>) {
        set(tag, ItemKey::Unknown(key.to_string()), value);
    }

    set_unknown(&mut tag, "ROSEID", t.id.clone());
    set_unknown(&mut tag, "ROSERELEASEID", t.release_id.clone());
    set(&mut tag, ItemKey::TrackTitle, t.tracktitle.clone());
    set(&mut tag, ItemKey::RecordingDate, t.releasedate.map(|d| d.to_string()));
    set(&mut tag, ItemKey::OriginalReleaseDate, t.originaldate.map(|d| d.to_string()));
    set_unknown(&mut tag, "COMPOSITIONDATE", t.compositiondate.map(|d| d.to_string()));
    set(&mut tag, ItemKey::TrackNumber, t.tracknumber.clone());
    set(&mut tag, ItemKey::TrackTotal, t.tracktotal.map(|n| n.to_string()));
    set(&mut tag, ItemKey::DiscNumber, t.discnumber.clone());
    set(&mut tag, ItemKey::DiscTotal, t.disctotal.map(|n| n.to_string()));
    set(&mut tag, ItemKey::AlbumTitle, t.releasetitle.clone());
    set(&mut tag, ItemKey::Genre, Some(format_genre_tag(c, &t.genre)));
    set_unknown(&mut tag, "SECONDARYGENRE", Some(format_genre_tag(c, &t.secondarygenre)));
    set_unknown(&mut tag, "DESCRIPTOR", Some(t.descriptor.join(";")));
    set(&mut tag, ItemKey::Label, Some(t.label.join(";")));
    set(&mut tag, ItemKey::CatalogNumber, t.catalognumber.clone());
    set_unknown(&mut tag, "EDITION", t.edition.clone());
    set_unknown(&mut tag, "RELEASETYPE", Some(t.releasetype.as_str().to_string()));
    set(&mut tag, ItemKey::AlbumArtist, Some(format_artist_string(&t.releaseartists)));
    set(&mut tag, ItemKey::TrackArtist, Some(format_artist_string(&t.trackartists)));
    // The full roster is encoded into the main artist tag; wipe the role side tags.
    set(&mut tag, ItemKey::Remixer, None);
    set(&mut tag, ItemKey::Producer, None);
    set(&mut tag, ItemKey::Composer, None);
    set(&mut tag, ItemKey::MixDj, None);

    tag.save_to_path(&t.path, WriteOptions::default()).map_err(|e| corrupt(&t.path, e))?;
    Ok(())
}
