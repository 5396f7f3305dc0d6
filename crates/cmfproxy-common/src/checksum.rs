//! SHA-256 helpers for downloaded bundles
//!
//! A fetched bundle gets a `<file>.sha256` sidecar holding its hex digest.
//! The publish stage consults the sidecar before trusting a local file.

use crate::error::{CommonError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Extension appended to a bundle file name for its digest sidecar
pub const SIDECAR_EXTENSION: &str = "sha256";

/// Compute the hex SHA-256 of any readable source
pub fn sha256_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the hex SHA-256 of an in-memory value
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the hex SHA-256 of a file
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    sha256_reader(&mut file)
}

/// Path of the sidecar for `path` (`bundle.tar.gz` -> `bundle.tar.gz.sha256`)
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Record `digest` next to `path`
pub fn write_sidecar(path: &Path, digest: &str) -> Result<PathBuf> {
    let sidecar = sidecar_path(path);
    std::fs::write(&sidecar, format!("{}\n", digest))?;
    Ok(sidecar)
}

/// Read the recorded digest for `path`, if a sidecar exists
pub fn read_sidecar(path: &Path) -> Result<Option<String>> {
    let sidecar = sidecar_path(path);
    let contents = match std::fs::read_to_string(&sidecar) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let digest = contents.trim();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CommonError::MalformedSidecar(sidecar.display().to_string()));
    }

    Ok(Some(digest.to_ascii_lowercase()))
}

/// Check `path` against its sidecar.
///
/// Returns `Ok(true)` when the digest matches, `Ok(false)` when no sidecar
/// was recorded, and `ChecksumMismatch` otherwise.
pub fn verify_sidecar(path: &Path, actual: &str) -> Result<bool> {
    match read_sidecar(path)? {
        None => Ok(false),
        Some(expected) if expected == actual => Ok(true),
        Some(expected) => Err(CommonError::ChecksumMismatch {
            path: path.display().to_string(),
            expected,
            actual: actual.to_string(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256_reader() {
        let mut cursor = Cursor::new(b"hello world");
        assert_eq!(sha256_reader(&mut cursor).unwrap(), HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_sha256_bytes_matches_reader() {
        assert_eq!(sha256_bytes(b"hello world"), HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_sidecar_path_appends_extension() {
        let path = Path::new("/data/cmf_downloads/node-1.tar.gz");
        assert_eq!(
            sidecar_path(path),
            PathBuf::from("/data/cmf_downloads/node-1.tar.gz.sha256")
        );
    }

    #[test]
    fn test_verify_sidecar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("a.tar.gz");
        std::fs::write(&bundle, b"hello world").unwrap();

        assert!(!verify_sidecar(&bundle, HELLO_WORLD_SHA256).unwrap());

        let digest = sha256_file(&bundle).unwrap();
        write_sidecar(&bundle, &digest).unwrap();
        assert!(verify_sidecar(&bundle, HELLO_WORLD_SHA256).unwrap());
    }

    #[test]
    fn test_verify_sidecar_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("a.tar.gz");
        std::fs::write(&bundle, b"hello world").unwrap();
        write_sidecar(&bundle, HELLO_WORLD_SHA256).unwrap();

        std::fs::write(&bundle, b"hello w").unwrap();
        let actual = sha256_file(&bundle).unwrap();
        let err = verify_sidecar(&bundle, &actual).unwrap_err();
        assert!(matches!(err, CommonError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_read_sidecar_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("a.tar.gz");
        std::fs::write(sidecar_path(&bundle), "not-a-digest").unwrap();
        assert!(matches!(
            read_sidecar(&bundle),
            Err(CommonError::MalformedSidecar(_))
        ));
    }
}
