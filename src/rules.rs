/// The fast-search surface the cache exposes to the rules engine. The contract is two-phase:
///
/// 1. Translate a matcher into an FTS MATCH query and fetch a candidate track/release set
///    cheaply. The index is character-tokenized, so substring search is a phrase of characters;
///    it produces false positives but no false negatives.
/// 2. Post-filter the candidates exactly against the structural attributes in the read cache.
///
/// The rules DSL and its executor live outside the cache; only this glue does not.
use std::path::PathBuf;

use rusqlite::params;
use tracing::debug;

use crate::cache::{connect, process_string_for_fts, Release, Track};
use crate::config::Config;
use crate::error::Result;

/// The attribute surfaces a matcher can target. Each maps onto one FTS column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherTag {
    TrackTitle,
    ReleaseTitle,
    ReleaseArtist,
    TrackArtist,
    Genre,
    Label,
    Descriptor,
    Position,
    ReleaseYear,
}

impl MatcherTag {
    fn fts_column(self) -> &'static str {
        match self {
            MatcherTag::TrackTitle => "tracktitle",
            MatcherTag::ReleaseTitle => "releasetitle",
            MatcherTag::ReleaseArtist => "releaseartist",
            MatcherTag::TrackArtist => "trackartist",
            MatcherTag::Genre => "genre",
            MatcherTag::Label => "label",
            MatcherTag::Descriptor => "descriptor",
            MatcherTag::Position => "position",
            MatcherTag::ReleaseYear => "releaseyear",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub needle: String,
    pub strict_start: bool,
    pub strict_end: bool,
    pub case_insensitive: bool,
}

impl Pattern {
    pub fn substring(needle: &str) -> Pattern {
        Pattern { needle: needle.to_string(), strict_start: false, strict_end: false, case_insensitive: false }
    }
}

#[derive(Debug, Clone)]
pub struct Matcher {
    pub tags: Vec<MatcherTag>,
    pub pattern: Pattern,
}

/// A candidate from the fast search phase. The caller post-filters before trusting it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastSearchResult {
    pub id: String,
    pub path: PathBuf,
}

/// Exact pattern match against a single attribute value.
pub fn matches_pattern(pattern: &Pattern, value: &str) -> bool {
    let (needle, value) = if pattern.case_insensitive {
        (pattern.needle.to_lowercase(), value.to_lowercase())
    } else {
        (pattern.needle.clone(), value.to_string())
    };
    match (pattern.strict_start, pattern.strict_end) {
        (true, true) => value == needle,
        (true, false) => value.starts_with(&needle),
        (false, true) => value.ends_with(&needle),
        (false, false) => value.contains(&needle),
    }
}

/// Build the FTS MATCH expression for a matcher: the targeted columns, matched against the
/// needle's characters as a phrase of single-character tokens.
fn fts_match_expression(matcher: &Matcher) -> String {
    let columns: Vec<&str> = matcher.tags.iter().map(|t| t.fts_column()).collect();
    // FTS5 escapes a double quote inside a string by doubling it.
    let needle = process_string_for_fts(&matcher.pattern.needle).replace('"', "\"\"");
    format!("{{{}}} : \"{}\"", columns.join(" "), needle)
}

pub fn fast_search_for_matching_tracks(c: &Config, matcher: &Matcher) -> Result<Vec<FastSearchResult>> {
    let query = fts_match_expression(matcher);
    debug!("Executing track fast search with query {query}");
    let conn = connect(c)?;
    let mut stmt = conn.prepare(
        "
        SELECT DISTINCT t.id, t.source_path
        FROM rules_engine_fts
        JOIN tracks t ON t.rowid = rules_engine_fts.rowid
        WHERE rules_engine_fts MATCH ?1
        ORDER BY t.source_path
        ",
    )?;
    let rows = stmt.query_map(params![query], |row| {
        Ok(FastSearchResult { id: row.get(0)?, path: PathBuf::from(row.get::<_, String>(1)?) })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn fast_search_for_matching_releases(c: &Config, matcher: &Matcher) -> Result<Vec<FastSearchResult>> {
    let query = fts_match_expression(matcher);
    debug!("Executing release fast search with query {query}");
    let conn = connect(c)?;
    let mut stmt = conn.prepare(
        "
        SELECT DISTINCT r.id, r.source_path
        FROM rules_engine_fts
        JOIN tracks t ON t.rowid = rules_engine_fts.rowid
        JOIN releases r ON r.id = t.release_id
        WHERE rules_engine_fts MATCH ?1
        ORDER BY r.source_path
        ",
    )?;
    let rows = stmt.query_map(params![query], |row| {
        Ok(FastSearchResult { id: row.get(0)?, path: PathBuf::from(row.get::<_, String>(1)?) })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn release_tag_values(release: &Release, tag: MatcherTag) -> Vec<String> {
    match tag {
        MatcherTag::ReleaseTitle => vec![release.releasetitle.clone()],
        MatcherTag::ReleaseArtist => release.releaseartists.all().into_iter().map(|a| a.name).collect(),
        MatcherTag::Genre => {
            let mut rval = release.genres.clone();
            rval.extend(release.parent_genres.clone());
            rval.extend(release.secondary_genres.clone());
            rval.extend(release.parent_secondary_genres.clone());
            rval
        }
        MatcherTag::Label => release.labels.clone(),
        MatcherTag::Descriptor => release.descriptors.clone(),
        MatcherTag::ReleaseYear => release.releasedate.map(|d| d.year.to_string()).into_iter().collect(),
        MatcherTag::TrackTitle | MatcherTag::TrackArtist | MatcherTag::Position => Vec::new(),
    }
}

fn track_tag_values(track: &Track, tag: MatcherTag) -> Vec<String> {
    match tag {
        MatcherTag::TrackTitle => vec![track.tracktitle.clone()],
        MatcherTag::TrackArtist => track.trackartists.all().into_iter().map(|a| a.name).collect(),
        MatcherTag::Position => vec![track.formatted_position.clone()],
        _ => release_tag_values(&track.release, tag),
    }
}

/// Drop fast-search false positives by matching the pattern exactly against the cached
/// structural attributes.
pub fn filter_track_false_positives_using_read_cache(matcher: &Matcher, tracks: Vec<Track>) -> Vec<Track> {
    tracks
        .into_iter()
        .filter(|t| {
            matcher
                .tags
                .iter()
                .any(|tag| track_tag_values(t, *tag).iter().any(|v| matches_pattern(&matcher.pattern, v)))
        })
        .collect()
}

pub fn filter_release_false_positives_using_read_cache(matcher: &Matcher, releases: Vec<Release>) -> Vec<Release> {
    releases
        .into_iter()
        .filter(|r| {
            matcher
                .tags
                .iter()
                .any(|tag| release_tag_values(r, *tag).iter().any(|v| matches_pattern(&matcher.pattern, v)))
        })
        .collect()
}
