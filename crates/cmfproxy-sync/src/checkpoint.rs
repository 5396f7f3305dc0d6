//! Checkpoint store
//!
//! Each pipeline stage records the bundles it has finished in a plain text
//! file, one [`BundleRef`] per line. The files stay human-readable and
//! diffable; they are the only state the daemon keeps across restarts.
//!
//! - `load` treats a missing file as an empty set.
//! - `save` replaces the whole file through a temporary sibling + rename.
//! - `append` adds one line and syncs it before returning.
//!
//! One writer per file is assumed.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::bundle::BundleRef;
use crate::error::{Result, SyncError};

/// A set of bundle references; ordered so iteration is reproducible
pub type CheckpointSet = BTreeSet<BundleRef>;

/// Discovery checkpoint file name (overwritten every cycle)
pub const DISCOVERED_FILE: &str = "queried_files.txt";
/// Fetch checkpoint file name (append-only)
pub const FETCHED_FILE: &str = "downloaded_files.txt";
/// Publish checkpoint file name (append-only)
pub const PUBLISHED_FILE: &str = "pushed_files.txt";

fn checkpoint_err(path: &Path, source: std::io::Error) -> SyncError {
    SyncError::Checkpoint {
        path: path.to_path_buf(),
        source,
    }
}

/// Read a checkpoint file. A missing file is an empty set.
pub fn load(path: &Path) -> Result<CheckpointSet> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Checkpoint absent, starting empty");
            return Ok(CheckpointSet::new());
        },
        Err(e) => return Err(checkpoint_err(path, e)),
    };

    let mut set = CheckpointSet::new();
    for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match BundleRef::new(line) {
            Ok(bundle) => {
                set.insert(bundle);
            },
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint line"),
        }
    }
    Ok(set)
}

/// Replace a checkpoint file with exactly `set`
pub fn save(path: &Path, set: &CheckpointSet) -> Result<()> {
    ensure_parent(path)?;

    let tmp = temp_sibling(path);
    let mut body = String::new();
    for bundle in set {
        body.push_str(bundle.as_str());
        body.push('\n');
    }

    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    write().map_err(|e| checkpoint_err(path, e))?;

    debug!(path = %path.display(), entries = set.len(), "Checkpoint saved");
    Ok(())
}

/// Durably add one entry to an accumulating checkpoint
pub fn append(path: &Path, bundle: &BundleRef) -> Result<()> {
    ensure_parent(path)?;

    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        // Recover from a previous writer that died before its newline
        if file.metadata()?.len() > 0 && !ends_with_newline(path)? {
            file.write_all(b"\n")?;
        }
        file.write_all(bundle.as_str().as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()
    };
    write().map_err(|e| checkpoint_err(path, e))?;

    debug!(path = %path.display(), bundle = %bundle, "Checkpoint appended");
    Ok(())
}

/// `upstream − downstream`: what the next stage still has to do
pub fn pending(upstream: &CheckpointSet, downstream: &CheckpointSet) -> Vec<BundleRef> {
    upstream.difference(downstream).cloned().collect()
}

fn ends_with_newline(path: &Path) -> std::io::Result<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = fs::File::open(path)?;
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| checkpoint_err(path, e))?;
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Locations of the three checkpoint files under one state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub discovered: PathBuf,
    pub fetched: PathBuf,
    pub published: PathBuf,
}

impl CheckpointPaths {
    pub fn in_dir(state_dir: &Path) -> Self {
        Self {
            discovered: state_dir.join(DISCOVERED_FILE),
            fetched: state_dir.join(FETCHED_FILE),
            published: state_dir.join(PUBLISHED_FILE),
        }
    }
}
