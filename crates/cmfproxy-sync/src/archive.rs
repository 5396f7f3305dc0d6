//! Bundle extraction
//!
//! Bundles are gzip-compressed tar archives. Extraction runs on a blocking
//! thread and refuses entries that would land outside the workspace.

use flate2::read::GzDecoder;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// Unpack `archive` into `dest`, returning the number of entries written
pub async fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<usize> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    let archive_for_err = archive.clone();

    tokio::task::spawn_blocking(move || unpack(&archive, &dest))
        .await
        .map_err(|e| SyncError::Extract {
            archive: archive_for_err,
            message: format!("extraction task failed: {}", e),
        })?
}

fn unpack(archive: &Path, dest: &Path) -> Result<usize> {
    let fail = |message: String| SyncError::Extract {
        archive: archive.to_path_buf(),
        message,
    };

    let file = File::open(archive).map_err(|e| fail(format!("cannot open: {}", e)))?;
    std::fs::create_dir_all(dest).map_err(|e| fail(format!("cannot create workspace: {}", e)))?;

    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut written = 0usize;

    let entries = tar
        .entries()
        .map_err(|e| fail(format!("cannot read entries: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| fail(format!("corrupt entry: {}", e)))?;
        let name: PathBuf = entry
            .path()
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| PathBuf::from("<unreadable>"));

        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| fail(format!("cannot unpack {}: {}", name.display(), e)))?;
        if unpacked {
            written += 1;
        } else {
            warn!(archive = %archive.display(), entry = %name.display(), "Skipped entry outside workspace");
        }
    }

    debug!(archive = %archive.display(), dest = %dest.display(), entries = written, "Archive extracted");
    Ok(written)
}
