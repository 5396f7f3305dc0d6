//! Bundle references
//!
//! A [`BundleRef`] is the remote URL of one uploaded archive. It is the key
//! shared by all three checkpoint files, so it is kept verbatim: no
//! normalization, no trimming beyond what the checkpoint reader does.

use cmfproxy_common::checksum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Suffix that marks a telemetry upload as a bundle
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Hex digits of the reference digest used to disambiguate query URLs
const QUERY_DIGEST_LEN: usize = 12;

/// Remote location of one archive
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleRef(String);

impl BundleRef {
    /// Wrap a URL, rejecting values that cannot live on one checkpoint line
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if url.trim().is_empty() || url.contains('\n') || url.contains('\r') {
            return Err(SyncError::InvalidBundleRef(url));
        }
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the reference names a recognized archive
    pub fn is_archive(&self) -> bool {
        self.0.ends_with(ARCHIVE_SUFFIX)
    }

    /// Local file name for the bundle.
    ///
    /// The final path segment of the URL. When the URL carries a query or
    /// fragment, a short digest of the whole reference is appended to the
    /// stem, so references that differ only there never share a file.
    pub fn file_name(&self) -> String {
        let (path, has_query) = match self.0.find(['?', '#']) {
            Some(at) => (&self.0[..at], true),
            None => (self.0.as_str(), false),
        };
        let segment = path
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(path);

        if !has_query {
            return segment.to_string();
        }

        let digest = checksum::sha256_bytes(self.0.as_bytes());
        let tag = &digest[..QUERY_DIGEST_LEN];
        match segment.strip_suffix(ARCHIVE_SUFFIX) {
            Some(stem) => format!("{}-{}{}", stem, tag, ARCHIVE_SUFFIX),
            None => format!("{}-{}", segment, tag),
        }
    }

    /// Name of the per-bundle workspace directory (file name minus suffix)
    pub fn workspace_name(&self) -> String {
        let file_name = self.file_name();
        match file_name.strip_suffix(ARCHIVE_SUFFIX) {
            Some(stem) => stem.to_string(),
            None => file_name,
        }
    }

    /// Where the fetched file lives inside `download_dir`
    pub fn local_path(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(self.file_name())
    }

    /// Where the bundle is unpacked inside `workspace_root`
    pub fn workspace_path(&self, workspace_root: &Path) -> PathBuf {
        workspace_root.join(self.workspace_name())
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for BundleRef {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for BundleRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str =
        "https://storage.sagecontinuum.org/api/v1/data/cmf/W0A1/1718000000000000000-run42.tar.gz";

    #[test]
    fn test_file_and_workspace_names() {
        let bundle = BundleRef::new(URL).unwrap();
        assert_eq!(bundle.file_name(), "1718000000000000000-run42.tar.gz");
        assert_eq!(bundle.workspace_name(), "1718000000000000000-run42");
        assert!(bundle.is_archive());
    }

    #[test]
    fn test_query_variants_get_distinct_files_and_workspaces() {
        let one = BundleRef::new("http://h/get?id=1&f=x.tar.gz").unwrap();
        let two = BundleRef::new("http://h/get?id=2&f=x.tar.gz").unwrap();
        let dir = Path::new("/d");

        assert_ne!(one.file_name(), two.file_name());
        assert_ne!(one.local_path(dir), two.local_path(dir));
        assert_ne!(one.workspace_name(), two.workspace_name());
        assert!(one.file_name().starts_with("get-"));
        // The reference itself keeps the query so it stays a faithful key
        assert_eq!(one.as_str(), "http://h/get?id=1&f=x.tar.gz");
    }

    #[test]
    fn test_query_on_archive_path_keeps_suffix() {
        let bundle = BundleRef::new("http://host/a/b.tar.gz?sig=abc").unwrap();
        let name = bundle.file_name();

        assert!(name.starts_with("b-"));
        assert!(name.ends_with(ARCHIVE_SUFFIX));
        assert_eq!(name.len(), "b-".len() + QUERY_DIGEST_LEN + ARCHIVE_SUFFIX.len());
        assert_eq!(bundle.workspace_name(), name.trim_end_matches(ARCHIVE_SUFFIX));
        // Stable across calls
        assert_eq!(bundle.file_name(), name);
    }

    #[test]
    fn test_paths_are_rooted_at_given_dirs() {
        let bundle = BundleRef::new("http://host/x.tar.gz").unwrap();
        assert_eq!(
            bundle.local_path(Path::new("/srv/cmf_downloads")),
            PathBuf::from("/srv/cmf_downloads/x.tar.gz")
        );
        assert_eq!(
            bundle.workspace_path(Path::new("/srv/work")),
            PathBuf::from("/srv/work/x")
        );
    }

    #[test]
    fn test_rejects_multiline_and_empty() {
        assert!(BundleRef::new("http://host/a.tar.gz\nhttp://host/b.tar.gz").is_err());
        assert!(BundleRef::new("   ").is_err());
    }

    #[test]
    fn test_non_archive() {
        let bundle = BundleRef::new("http://host/readme.txt").unwrap();
        assert!(!bundle.is_archive());
        assert_eq!(bundle.workspace_name(), "readme.txt");
    }
}
