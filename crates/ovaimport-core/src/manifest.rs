//! OVA manifest verification.
//!
//! A manifest (`*.mf`) lists one digest per archive member in the form
//! `SHA256(disk1.vmdk)= <hex>`. Only SHA256 entries are checked.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::ova::member_path;

/// One `ALGO(file)= digest` line of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Digest algorithm as written (e.g. "SHA256", "SHA1").
    pub algorithm: String,
    /// File name relative to the manifest.
    pub file: String,
    /// Lower-case hex digest.
    pub digest: String,
}

/// Parse manifest content. Blank and malformed lines are ignored.
pub fn parse_manifest(content: &str) -> Vec<ManifestEntry> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<ManifestEntry> {
    let line = line.trim();
    let open = line.find('(')?;
    let close = line.rfind(")=")?;
    if close <= open {
        return None;
    }

    let algorithm = line[..open].trim();
    let file = &line[open + 1..close];
    let digest = line[close + 2..].trim();
    if algorithm.is_empty() || file.is_empty() || digest.is_empty() {
        return None;
    }

    Some(ManifestEntry {
        algorithm: algorithm.to_ascii_uppercase(),
        file: file.to_string(),
        digest: digest.to_ascii_lowercase(),
    })
}

/// Compute the SHA256 hex digest of a file, streaming its contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| Error::io(e, path))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify the manifest at `manifest_path` against files in its directory.
///
/// # Returns
///
/// The number of entries that were checked.
///
/// # Errors
///
/// - [`Error::ManifestMismatch`] when a digest differs.
/// - [`Error::ArchiveRead`] when a listed file is missing or lies outside
///   the manifest's directory.
pub fn verify_manifest(manifest_path: &Path) -> Result<usize> {
    let content = fs::read_to_string(manifest_path).map_err(|e| Error::io(e, manifest_path))?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let mut checked = 0;
    for entry in parse_manifest(&content) {
        if entry.algorithm != "SHA256" {
            tracing::warn!(
                file = %entry.file,
                algorithm = %entry.algorithm,
                "unsupported manifest digest, not verified"
            );
            continue;
        }

        let Some(relative) = member_path(Path::new(&entry.file))? else {
            return Err(Error::archive(format!(
                "manifest lists an empty file name for digest {}",
                entry.digest
            )));
        };
        let path = base.join(relative);
        if !path.is_file() {
            return Err(Error::archive(format!(
                "manifest lists '{}' but it is not in the archive",
                entry.file
            )));
        }

        let actual = sha256_file(&path)?;
        if actual != entry.digest {
            return Err(Error::ManifestMismatch {
                file: entry.file,
                expected: entry.digest,
                actual,
            });
        }
        tracing::debug!(file = %entry.file, "manifest digest verified");
        checked += 1;
    }

    Ok(checked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_parse_manifest_lines() {
        let entries = parse_manifest(
            "SHA256(vm.ovf)= ABCDEF\n\nSHA1(disk1.vmdk)= 0123\ngarbage line\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].algorithm, "SHA256");
        assert_eq!(entries[0].file, "vm.ovf");
        assert_eq!(entries[0].digest, "abcdef");
        assert_eq!(entries[1].algorithm, "SHA1");
    }

    #[test]
    fn test_parse_manifest_filename_with_parens() {
        let entries = parse_manifest("SHA256(disk (copy).vmdk)= aa");
        assert_eq!(entries[0].file, "disk (copy).vmdk");
    }

    #[test]
    fn test_sha256_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        fs::write(&path, b"hello world").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_verify_manifest_ok() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("disk1.img"), b"hello world").unwrap();
        let mf = tmp.path().join("vm.mf");
        fs::write(
            &mf,
            format!("SHA256(disk1.img)= {HELLO_SHA256}\nSHA1(disk1.img)= 2aae6c35\n"),
        )
        .unwrap();

        assert_eq!(verify_manifest(&mf).unwrap(), 1);
    }

    #[test]
    fn test_verify_manifest_mismatch() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("disk1.img"), b"tampered").unwrap();
        let mf = tmp.path().join("vm.mf");
        fs::write(&mf, format!("SHA256(disk1.img)= {HELLO_SHA256}\n")).unwrap();

        let err = verify_manifest(&mf).unwrap_err();
        assert!(matches!(err, Error::ManifestMismatch { ref file, .. } if file == "disk1.img"));
    }

    #[test]
    fn test_verify_manifest_missing_file() {
        let tmp = TempDir::new().unwrap();
        let mf = tmp.path().join("vm.mf");
        fs::write(&mf, format!("SHA256(gone.img)= {HELLO_SHA256}\n")).unwrap();

        let err = verify_manifest(&mf).unwrap_err();
        assert!(matches!(err, Error::ArchiveRead { .. }));
    }

    #[test]
    fn test_verify_manifest_rejects_parent_path() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("secret.txt"), b"hello world").unwrap();
        let work = tmp.path().join("work");
        fs::create_dir(&work).unwrap();
        let mf = work.join("vm.mf");
        fs::write(&mf, format!("SHA256(../secret.txt)= {HELLO_SHA256}\n")).unwrap();

        let err = verify_manifest(&mf).unwrap_err();
        assert!(matches!(err, Error::ArchiveRead { .. }));
    }

    #[test]
    fn test_verify_manifest_rejects_absolute_path() {
        let tmp = TempDir::new().unwrap();
        let secret = tmp.path().join("secret.txt");
        fs::write(&secret, b"hello world").unwrap();
        let work = tmp.path().join("work");
        fs::create_dir(&work).unwrap();
        let mf = work.join("vm.mf");
        fs::write(
            &mf,
            format!("SHA256({})= {HELLO_SHA256}\n", secret.display()),
        )
        .unwrap();

        let err = verify_manifest(&mf).unwrap_err();
        assert!(matches!(err, Error::ArchiveRead { .. }));
    }

    #[test]
    fn test_verify_manifest_nested_member() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub").join("disk1.img"), b"hello world").unwrap();
        let mf = tmp.path().join("vm.mf");
        fs::write(&mf, format!("SHA256(./sub/disk1.img)= {HELLO_SHA256}\n")).unwrap();

        assert_eq!(verify_manifest(&mf).unwrap(), 1);
    }
}
