use crate::genre_hierarchy::*;

#[test]
fn test_transitive_parents() {
    let parents = transitive_parent_genres("Deep House");
    assert!(parents.contains(&"House".to_string()));
    assert!(parents.contains(&"Electronic Dance Music".to_string()));
    assert!(parents.contains(&"Dance".to_string()));
    assert!(parents.contains(&"Electronic".to_string()));
}

#[test]
fn test_lookup_is_case_insensitive_but_preserves_casing() {
    assert_eq!(transitive_parent_genres("deep house"), transitive_parent_genres("Deep House"));
    assert_eq!(canonical_genre("k-pop"), Some("K-Pop"));
    let parents = transitive_parent_genres("DANCE-POP");
    assert!(parents.contains(&"Pop".to_string()));
}

#[test]
fn test_unknown_genre_resolves_to_empty_set() {
    assert!(transitive_parent_genres("Zouglou").is_empty());
    assert!(canonical_genre("Zouglou").is_none());
}

#[test]
fn test_transitive_children() {
    let children = transitive_child_genres("House");
    assert!(children.contains(&"Deep House".to_string()));
    assert!(children.contains(&"Rominimal".to_string()));
    let children = transitive_child_genres("Electronic");
    assert!(children.contains(&"Techno".to_string()));
}

#[test]
fn test_roots_have_no_parents() {
    assert!(transitive_parent_genres("Pop").is_empty());
    assert!(transitive_parent_genres("Electronic").is_empty());
}
