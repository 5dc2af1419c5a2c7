/// Static genre hierarchy: a compile-time-embedded mapping from genre to its direct parents, plus
/// the reflexive-transitive closure in both directions. Lookups are case-insensitive but preserve
/// the canonical casing of the stored genres. Unknown genres resolve to the empty set.
use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

const GENRE_HIERARCHY_JSON: &str = include_str!("genre_hierarchy.json");

static IMMEDIATE_PARENT_GENRES: Lazy<HashMap<String, Vec<String>>> = Lazy::new(|| {
    serde_json::from_str(GENRE_HIERARCHY_JSON).expect("embedded genre hierarchy must parse")
});

/// Lowercased genre -> canonical casing.
static CANONICAL_GENRES: Lazy<HashMap<String, String>> = Lazy::new(|| {
    IMMEDIATE_PARENT_GENRES.keys().map(|g| (g.to_lowercase(), g.clone())).collect()
});

pub static TRANSITIVE_PARENT_GENRES: Lazy<HashMap<String, Vec<String>>> = Lazy::new(|| {
    let mut rval = HashMap::new();
    for (genre, parents) in IMMEDIATE_PARENT_GENRES.iter() {
        let mut all = Vec::new();
        let mut seen = HashSet::new();
        let mut unvisited = parents.clone();
        while let Some(parent) = unvisited.pop() {
            if seen.insert(parent.clone()) {
                if let Some(grandparents) = IMMEDIATE_PARENT_GENRES.get(&parent) {
                    unvisited.extend(grandparents.iter().cloned());
                }
                all.push(parent);
            }
        }
        all.sort();
        rval.insert(genre.clone(), all);
    }
    rval
});

pub static TRANSITIVE_CHILD_GENRES: Lazy<HashMap<String, Vec<String>>> = Lazy::new(|| {
    let mut rval: HashMap<String, Vec<String>> = HashMap::new();
    for (child, parents) in TRANSITIVE_PARENT_GENRES.iter() {
        for parent in parents {
            rval.entry(parent.clone()).or_default().push(child.clone());
        }
    }
    for children in rval.values_mut() {
        children.sort();
    }
    rval
});

/// Resolve a genre to its canonical casing, if it is known.
pub fn canonical_genre(genre: &str) -> Option<&'static str> {
    CANONICAL_GENRES.get(&genre.to_lowercase()).map(|s| s.as_str())
}

/// All transitive parents of a genre, in canonical casing. Unknown genres yield an empty set.
pub fn transitive_parent_genres(genre: &str) -> Vec<String> {
    canonical_genre(genre)
        .and_then(|g| TRANSITIVE_PARENT_GENRES.get(g))
        .cloned()
        .unwrap_or_default()
}

/// All transitive children of a genre, in canonical casing. Unknown genres yield an empty set.
pub fn transitive_child_genres(genre: &str) -> Vec<String> {
    canonical_genre(genre)
        .and_then(|g| TRANSITIVE_CHILD_GENRES.get(g))
        .cloned()
        .unwrap_or_default()
}
