use std::fs;

use crate::config::Config;

#[test]
fn test_parse_minimal_config() {
    let dir = crate::testing::init();
    let cfgpath = dir.path().join("config.toml");
    let source = dir.path().join("source");
    let cache = dir.path().join("cache");
    fs::create_dir_all(&source).unwrap();
    fs::write(
        &cfgpath,
        format!("music_source_dir = \"{}\"\ncache_dir = \"{}\"\n", source.display(), cache.display()),
    )
    .unwrap();

    let c = Config::parse(Some(&cfgpath)).unwrap();
    assert_eq!(c.music_source_dir, source);
    assert_eq!(c.cache_dir, cache);
    assert!(cache.is_dir());
    assert_eq!(c.max_filename_bytes, 180);
    assert!(!c.rename_source_files);
    assert_eq!(c.cover_art_stems, vec!["folder", "cover", "art", "front"]);
    assert_eq!(c.valid_art_exts, vec!["jpg", "jpeg", "png"]);
    assert!(c.max_proc >= 1);
    assert_eq!(c.cache_database_path(), cache.join("cache.sqlite3"));
}

#[test]
fn test_parse_full_config() {
    let dir = crate::testing::init();
    let cfgpath = dir.path().join("config.toml");
    let source = dir.path().join("source");
    let cache = dir.path().join("cache");
    fs::create_dir_all(&source).unwrap();
    fs::write(
        &cfgpath,
        format!(
            r#"
music_source_dir = "{}"
cache_dir = "{}"
max_proc = 4
max_filename_bytes = 120
rename_source_files = true
ignore_release_directories = ["tmp"]
write_parent_genres = true

[[artist_aliases]]
artist = "BLACKPINK"
aliases = ["BP"]

[path_templates]
release = "{{{{ releasetitle }}}}"
"#,
            source.display(),
            cache.display()
        ),
    )
    .unwrap();

    let c = Config::parse(Some(&cfgpath)).unwrap();
    assert_eq!(c.max_proc, 4);
    assert_eq!(c.max_filename_bytes, 120);
    assert!(c.rename_source_files);
    assert!(c.write_parent_genres);
    assert_eq!(c.ignore_release_directories, vec!["tmp"]);
    assert_eq!(c.artist_aliases_map.get("BLACKPINK").unwrap(), &vec!["BP".to_string()]);
    assert_eq!(c.artist_aliases_parents_map.get("BP").unwrap(), &vec!["BLACKPINK".to_string()]);
    assert_eq!(c.path_templates.release.text, "{{ releasetitle }}");
}

#[test]
fn test_missing_music_source_dir() {
    let dir = crate::testing::init();
    let cfgpath = dir.path().join("config.toml");
    fs::write(&cfgpath, format!("cache_dir = \"{}\"\n", dir.path().join("cache").display())).unwrap();
    assert!(Config::parse(Some(&cfgpath)).is_err());
}

#[test]
fn test_missing_config_file() {
    let dir = crate::testing::init();
    assert!(Config::parse(Some(&dir.path().join("nope.toml"))).is_err());
}

#[test]
fn test_cyclic_artist_aliases_rejected() {
    let dir = crate::testing::init();
    let cfgpath = dir.path().join("config.toml");
    let source = dir.path().join("source");
    fs::create_dir_all(&source).unwrap();
    fs::write(
        &cfgpath,
        format!(
            r#"
music_source_dir = "{}"
cache_dir = "{}"

[[artist_aliases]]
artist = "A"
aliases = ["B"]

[[artist_aliases]]
artist = "B"
aliases = ["A"]
"#,
            source.display(),
            dir.path().join("cache").display()
        ),
    )
    .unwrap();
    assert!(Config::parse(Some(&cfgpath)).is_err());
}

#[test]
fn test_zero_max_proc_rejected() {
    let dir = crate::testing::init();
    let cfgpath = dir.path().join("config.toml");
    let source = dir.path().join("source");
    fs::create_dir_all(&source).unwrap();
    fs::write(
        &cfgpath,
        format!(
            "music_source_dir = \"{}\"\ncache_dir = \"{}\"\nmax_proc = 0\n",
            source.display(),
            dir.path().join("cache").display()
        ),
    )
    .unwrap();
    assert!(Config::parse(Some(&cfgpath)).is_err());
}
