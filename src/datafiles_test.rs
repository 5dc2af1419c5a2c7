use std::fs;

use crate::datafiles::*;
use crate::error::{RoseError, RoseExpectedError};

#[test]
fn test_datafile_id_from_name() {
    assert_eq!(datafile_id_from_name(".rose.abc123.toml"), Some("abc123".to_string()));
    assert_eq!(datafile_id_from_name("rose.abc123.toml"), None);
    assert_eq!(datafile_id_from_name(".rose.abc.123.toml"), None);
    assert_eq!(datafile_id_from_name("cover.jpg"), None);
}

#[test]
fn test_read_valid_datafile() {
    let dir = crate::testing::init();
    let path = dir.path().join(".rose.lalala.toml");
    fs::write(
        &path,
        "[release]\nid = \"lalala\"\nadded_at = \"2023-10-23T00:00:00-04:00\"\nnew = false\n",
    )
    .unwrap();

    let datafile = read_datafile(&path).unwrap();
    assert_eq!(datafile.release.id, "lalala");
    assert_eq!(datafile.release.added_at, "2023-10-23T00:00:00-04:00");
    assert!(!datafile.release.new);
}

#[test]
fn test_read_heals_empty_datafile() {
    let dir = crate::testing::init();
    let path = dir.path().join(".rose.lalala.toml");
    fs::write(&path, "").unwrap();

    let datafile = read_datafile(&path).unwrap();
    assert_eq!(datafile.release.id, "lalala");
    assert!(datafile.release.new);
    assert!(!datafile.release.added_at.is_empty());

    // The resolved values were written back to disk.
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("id = \"lalala\""));
    assert!(contents.contains("new = true"));
    assert!(contents.contains("added_at = "));
}

#[test]
fn test_read_rejects_id_mismatch() {
    let dir = crate::testing::init();
    let path = dir.path().join(".rose.lalala.toml");
    fs::write(&path, "[release]\nid = \"hahaha\"\n").unwrap();

    match read_datafile(&path) {
        Err(RoseError::Expected(RoseExpectedError::DatafileIdMismatch { datafile_id, filename_id, .. })) => {
            assert_eq!(datafile_id, "hahaha");
            assert_eq!(filename_id, "lalala");
        }
        other => panic!("expected DatafileIdMismatch, got {other:?}"),
    }
}

#[test]
fn test_write_read_round_trip() {
    let dir = crate::testing::init();
    let datafile = StoredDataFile::new("abc".to_string());
    let path = datafile_path(dir.path(), &datafile.release.id);
    write_datafile(&path, &datafile).unwrap();
    assert_eq!(read_datafile(&path).unwrap(), datafile);
}
