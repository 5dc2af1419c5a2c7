use crate::cache::{list_releases, list_tracks};
use crate::rules::*;
use crate::testing;

#[test]
fn test_matches_pattern() {
    let p = Pattern::substring("rack");
    assert!(matches_pattern(&p, "Track 1"));
    assert!(!matches_pattern(&p, "Blackpink"));

    let p = Pattern { needle: "Track".to_string(), strict_start: true, strict_end: false, case_insensitive: false };
    assert!(matches_pattern(&p, "Track 1"));
    assert!(!matches_pattern(&p, "A Track"));

    let p = Pattern { needle: "1".to_string(), strict_start: false, strict_end: true, case_insensitive: false };
    assert!(matches_pattern(&p, "Track 1"));
    assert!(!matches_pattern(&p, "Track 12"));

    let p = Pattern { needle: "Track 1".to_string(), strict_start: true, strict_end: true, case_insensitive: false };
    assert!(matches_pattern(&p, "Track 1"));
    assert!(!matches_pattern(&p, "Track 12"));

    let p = Pattern { needle: "track".to_string(), strict_start: false, strict_end: false, case_insensitive: true };
    assert!(matches_pattern(&p, "TRACK 1"));
}

#[test]
fn test_fast_search_for_matching_tracks() {
    let (config, _dir) = testing::seeded_cache();
    let matcher = Matcher { tags: vec![MatcherTag::TrackTitle], pattern: Pattern::substring("rack 1") };
    let results = fast_search_for_matching_tracks(&config, &matcher).unwrap();
    let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["t1", "t3", "t4"]);
}

#[test]
fn test_fast_search_for_matching_releases() {
    let (config, _dir) = testing::seeded_cache();
    let matcher = Matcher { tags: vec![MatcherTag::ReleaseArtist], pattern: Pattern::substring("chno Ma") };
    let results = fast_search_for_matching_releases(&config, &matcher).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "r1");
}

#[test]
fn test_fast_search_includes_parent_genres() {
    let (config, _dir) = testing::seeded_cache();
    // r1 carries Deep House; its parent House is in the index too.
    let matcher = Matcher { tags: vec![MatcherTag::Genre], pattern: Pattern::substring("House") };
    let results = fast_search_for_matching_releases(&config, &matcher).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "r1");
}

#[test]
fn test_fast_search_scopes_columns() {
    let (config, _dir) = testing::seeded_cache();
    // "Silk Music" is a label; a title-scoped search must not return it.
    let matcher = Matcher { tags: vec![MatcherTag::TrackTitle], pattern: Pattern::substring("Silk") };
    assert!(fast_search_for_matching_tracks(&config, &matcher).unwrap().is_empty());
    let matcher = Matcher { tags: vec![MatcherTag::Label], pattern: Pattern::substring("Silk") };
    assert!(!fast_search_for_matching_tracks(&config, &matcher).unwrap().is_empty());
}

#[test]
fn test_post_filter_tracks() {
    let (config, _dir) = testing::seeded_cache();
    let tracks = list_tracks(&config, None).unwrap();

    let matcher = Matcher { tags: vec![MatcherTag::TrackArtist], pattern: Pattern::substring("Violin") };
    let filtered = filter_track_false_positives_using_read_cache(&matcher, tracks.clone());
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, "t3");

    // The same needle scoped to the title surface matches nothing: the candidates were false
    // positives.
    let matcher = Matcher { tags: vec![MatcherTag::TrackTitle], pattern: Pattern::substring("Violin") };
    assert!(filter_track_false_positives_using_read_cache(&matcher, tracks).is_empty());
}

#[test]
fn test_post_filter_releases() {
    let (config, _dir) = testing::seeded_cache();
    let releases = list_releases(&config, None).unwrap();

    let matcher = Matcher { tags: vec![MatcherTag::Genre], pattern: Pattern::substring("House") };
    let filtered = filter_release_false_positives_using_read_cache(&matcher, releases.clone());
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, "r1");

    let matcher = Matcher { tags: vec![MatcherTag::ReleaseYear], pattern: Pattern::substring("2023") };
    let filtered = filter_release_false_positives_using_read_cache(&matcher, releases);
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, "r1");
}

#[test]
fn test_fts_query_escapes_quotes() {
    let (config, _dir) = testing::seeded_cache();
    let matcher = Matcher { tags: vec![MatcherTag::TrackTitle], pattern: Pattern::substring(r#"she said ""#) };
    // Must not be a syntax error.
    assert!(fast_search_for_matching_tracks(&config, &matcher).unwrap().is_empty());
}
