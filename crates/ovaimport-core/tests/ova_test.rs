//! Integration tests for OVA extraction.

mod common;

use std::fs;

use common::{build_ova, build_ova_gz, build_ova_raw_name, ovf_xml};
use ovaimport_core::ova::extract_ova;
use ovaimport_core::Error;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_extract_plain_tar() {
    let tmp = TempDir::new().unwrap();
    let xml = ovf_xml(Some("EFI"), &[]);
    let ova = build_ova(
        tmp.path(),
        "app.ova",
        &[("app.ovf", xml.as_bytes()), ("disk1.vmdk", b"disk one")],
    );
    let dest = tmp.path().join("work");

    let files = extract_ova(&ova, &dest).expect("extraction should succeed");

    assert_eq!(files, vec![PathBuf::from("app.ovf"), PathBuf::from("disk1.vmdk")]);
    assert_eq!(fs::read(dest.join("disk1.vmdk")).unwrap(), b"disk one");
    assert_eq!(fs::read_to_string(dest.join("app.ovf")).unwrap(), xml);
}

#[test]
fn test_extract_gzip_tar() {
    let tmp = TempDir::new().unwrap();
    let ova = build_ova_gz(
        tmp.path(),
        "app.ova",
        &[("app.ovf", b"<Envelope/>"), ("disk1.img", b"payload")],
    );
    let dest = tmp.path().join("work");

    extract_ova(&ova, &dest).expect("gzip archive should extract");

    assert_eq!(fs::read(dest.join("disk1.img")).unwrap(), b"payload");
}

#[test]
fn test_extract_nested_member() {
    let tmp = TempDir::new().unwrap();
    let ova = build_ova(tmp.path(), "app.ova", &[("disks/disk1.vmdk", b"nested")]);
    let dest = tmp.path().join("work");

    let files = extract_ova(&ova, &dest).unwrap();

    assert_eq!(files, vec![PathBuf::from("disks/disk1.vmdk")]);
    assert!(dest.join("disks/disk1.vmdk").is_file());
}

#[test]
fn test_reextract_clears_leftovers() {
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("work");
    fs::create_dir_all(&dest).unwrap();
    fs::write(dest.join("stale.vmdk"), b"from a failed run").unwrap();
    fs::write(dest.join("old.ovf"), b"<Envelope/>").unwrap();

    let ova = build_ova(tmp.path(), "app.ova", &[("app.ovf", b"<Envelope/>")]);
    extract_ova(&ova, &dest).unwrap();

    assert!(!dest.join("stale.vmdk").exists());
    assert!(!dest.join("old.ovf").exists());
    assert!(dest.join("app.ovf").exists());
}

#[test]
fn test_extract_into_existing_empty_dir() {
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("work");
    fs::create_dir_all(&dest).unwrap();

    let ova = build_ova(tmp.path(), "app.ova", &[("app.ovf", b"<Envelope/>")]);
    extract_ova(&ova, &dest).expect("empty pre-existing directory is fine");
    assert!(dest.join("app.ovf").exists());
}

#[test]
fn test_extract_twice_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("work");
    let ova = build_ova(
        tmp.path(),
        "app.ova",
        &[("app.ovf", b"<Envelope/>"), ("disk1.vmdk", b"x")],
    );

    let first = extract_ova(&ova, &dest).unwrap();
    let second = extract_ova(&ova, &dest).unwrap();

    assert_eq!(first, second);
    assert_eq!(fs::read_dir(&dest).unwrap().count(), 2);
}

#[test]
fn test_rejects_parent_traversal() {
    let tmp = TempDir::new().unwrap();
    let ova = build_ova_raw_name(tmp.path(), "evil.ova", "../escaped.txt", b"owned");
    let dest = tmp.path().join("work");

    let err = extract_ova(&ova, &dest).unwrap_err();

    assert!(matches!(err, Error::ArchiveRead { .. }), "got {err:?}");
    assert!(!tmp.path().join("escaped.txt").exists());
}

#[test]
fn test_rejects_absolute_member() {
    let tmp = TempDir::new().unwrap();
    let ova = build_ova_raw_name(tmp.path(), "evil.ova", "/tmp/absolute.txt", b"owned");
    let dest = tmp.path().join("work");

    let err = extract_ova(&ova, &dest).unwrap_err();
    assert!(matches!(err, Error::ArchiveRead { .. }), "got {err:?}");
}

#[test]
fn test_missing_archive() {
    let tmp = TempDir::new().unwrap();
    let err = extract_ova(&tmp.path().join("nope.ova"), &tmp.path().join("work")).unwrap_err();

    assert!(matches!(err, Error::ArchiveRead { .. }));
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_corrupt_archive() {
    let tmp = TempDir::new().unwrap();
    let ova = tmp.path().join("corrupt.ova");
    fs::write(&ova, vec![b'x'; 1024]).unwrap();

    let err = extract_ova(&ova, &tmp.path().join("work")).unwrap_err();
    assert!(matches!(err, Error::ArchiveRead { .. }), "got {err:?}");
}

#[test]
fn test_destination_is_a_file() {
    let tmp = TempDir::new().unwrap();
    let dest = tmp.path().join("work");
    fs::write(&dest, b"in the way").unwrap();
    let ova = build_ova(tmp.path(), "app.ova", &[("app.ovf", b"<Envelope/>")]);

    let err = extract_ova(&ova, &dest).unwrap_err();
    assert!(matches!(err, Error::PathConflict { .. }));
}
