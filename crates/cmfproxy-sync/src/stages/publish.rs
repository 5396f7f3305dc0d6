//! Publish: ingest fetched bundles into the metadata store
//!
//! For each bundle in `fetched − published`:
//!
//! 1. check the local file (and its checksum sidecar when enabled)
//! 2. unpack it into its own workspace
//! 3. run the store's init command inside the workspace
//! 4. rewrite `<pipeline>:/src/...` artifact locations to the durable prefix
//! 5. push metadata, then artifacts
//!
//! Only a bundle that gets through every step is appended to the publish
//! checkpoint. A failure anywhere leaves the workspace in place for the
//! retry on the next cycle and moves on to the next bundle.

use cmfproxy_common::checksum;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::archive;
use crate::bundle::BundleRef;
use crate::checkpoint::{self, CheckpointPaths};
use crate::error::{Result, SyncError};
use crate::metadata::MetadataStore;

/// Inputs of the publish stage that come from configuration
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub workspace_root: PathBuf,
    pub download_dir: PathBuf,
    pub pipeline_name: String,
    pub artifact_prefix: String,
    pub verify_local_bundles: bool,
    pub stage_name: Option<String>,
    pub execution_name: Option<String>,
}

/// Result of one publish pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub published: Vec<BundleRef>,
    pub failed: Vec<BundleRef>,
}

pub struct PublishStage {
    store: Arc<dyn MetadataStore>,
    settings: PublishSettings,
    paths: CheckpointPaths,
}

impl PublishStage {
    pub fn new(store: Arc<dyn MetadataStore>, settings: PublishSettings, paths: CheckpointPaths) -> Self {
        Self {
            store,
            settings,
            paths,
        }
    }

    pub async fn run(&self) -> Result<PublishOutcome> {
        let fetched = checkpoint::load(&self.paths.fetched)?;
        let published = checkpoint::load(&self.paths.published)?;

        let pending: Vec<BundleRef> = checkpoint::pending(&fetched, &published)
            .into_iter()
            .filter(|bundle| {
                let keep = bundle.is_archive();
                if !keep {
                    debug!(bundle = %bundle, "Not an archive, skipping publish");
                }
                keep
            })
            .collect();

        let mut outcome = PublishOutcome::default();
        if pending.is_empty() {
            info!("No new bundles to publish");
            return Ok(outcome);
        }
        info!(
            pending = pending.len(),
            pipeline = %self.settings.pipeline_name,
            stage = self.settings.stage_name.as_deref().unwrap_or("-"),
            execution = self.settings.execution_name.as_deref().unwrap_or("-"),
            "Publishing bundles"
        );

        for bundle in pending {
            match self.publish_one(&bundle).await {
                Ok(rewritten) => {
                    checkpoint::append(&self.paths.published, &bundle)?;
                    info!(bundle = %bundle, rewritten, "✓ Bundle published");
                    outcome.published.push(bundle);
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e @ SyncError::LocalBundle { .. }) => {
                    error!(bundle = %bundle, error = %e, "✗ Local bundle unusable, needs operator attention");
                    outcome.failed.push(bundle);
                },
                Err(e) => {
                    error!(bundle = %bundle, error = %e, "✗ Publish failed, will retry next cycle");
                    outcome.failed.push(bundle);
                },
            }
        }

        Ok(outcome)
    }

    /// Run every step for one bundle; returns the number of rewritten locations
    #[tracing::instrument(skip(self), fields(bundle = %bundle))]
    async fn publish_one(&self, bundle: &BundleRef) -> Result<usize> {
        let archive_path = bundle.local_path(&self.settings.download_dir);
        self.check_local(&archive_path).await?;

        let workspace = bundle.workspace_path(&self.settings.workspace_root);
        tokio::fs::create_dir_all(&workspace).await?;

        let entries = archive::extract_tar_gz(&archive_path, &workspace).await?;
        debug!(workspace = %workspace.display(), entries, "Bundle extracted");

        self.store.init(&workspace).await?;
        let rewritten = self.rewrite_locations(&workspace).await?;

        self.store.push_metadata(&workspace).await?;
        self.store.push_artifacts(&workspace).await?;

        Ok(rewritten)
    }

    async fn check_local(&self, archive_path: &Path) -> Result<()> {
        if !tokio::fs::try_exists(archive_path).await.unwrap_or(false) {
            return Err(SyncError::LocalBundle {
                path: archive_path.to_path_buf(),
                message: "missing from download directory".to_string(),
            });
        }
        if !self.settings.verify_local_bundles {
            return Ok(());
        }

        let path = archive_path.to_path_buf();
        let verified = tokio::task::spawn_blocking(move || -> Result<bool> {
            let actual = checksum::sha256_file(&path)?;
            Ok(checksum::verify_sidecar(&path, &actual)?)
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;

        if !verified {
            warn!(path = %archive_path.display(), "No checksum sidecar, integrity not verified");
        }
        Ok(())
    }

    async fn rewrite_locations(&self, workspace: &Path) -> Result<usize> {
        let mut rewritten = 0;

        for artifact in self.store.artifact_urls(workspace).await? {
            let Some(updated) = rewrite_artifact_url(
                &artifact.url,
                &self.settings.pipeline_name,
                &self.settings.artifact_prefix,
            ) else {
                continue;
            };

            self.store
                .set_artifact_url(workspace, artifact.id, &updated)
                .await?;
            debug!(artifact_id = artifact.id, from = %artifact.url, to = %updated, "Artifact location rewritten");
            rewritten += 1;
        }

        Ok(rewritten)
    }
}

/// Map a `<pipeline>:/src/<rest>` location to `<prefix>/<rest>`.
///
/// The `<pipeline>:` tag is dropped along with `/src`, so the stored value is
/// a plain remote location (`s3://dvc-art/data/foo.csv`), not a tagged one
/// like `pipelineX:s3://dvc-art/data/foo.csv`.
///
/// Returns `None` for locations that do not carry the placeholder prefix.
pub fn rewrite_artifact_url(url: &str, pipeline: &str, prefix: &str) -> Option<String> {
    let rest = url.strip_prefix(pipeline)?.strip_prefix(":/src")?;
    if !rest.starts_with('/') {
        return None;
    }
    Some(format!("{}{}", prefix.trim_end_matches('/'), rest))
}
