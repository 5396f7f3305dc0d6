//! Fetch: download newly discovered bundles
//!
//! `pending = discovered − fetched`. Each success is appended to the fetch
//! checkpoint right away, so a crash mid-stage never re-downloads finished
//! bundles. Failures are only logged; the bundle stays pending and is tried
//! again next cycle.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::bundle::BundleRef;
use crate::checkpoint::{self, CheckpointPaths};
use crate::config::Credentials;
use crate::error::{Result, SyncError};
use crate::transfer::BundleFetcher;

/// Result of one fetch pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub fetched: Vec<BundleRef>,
    pub failed: Vec<BundleRef>,
}

pub struct FetchStage {
    fetcher: Arc<dyn BundleFetcher>,
    credentials: Option<Credentials>,
    download_dir: PathBuf,
    paths: CheckpointPaths,
}

impl FetchStage {
    pub fn new(
        fetcher: Arc<dyn BundleFetcher>,
        credentials: Option<Credentials>,
        download_dir: PathBuf,
        paths: CheckpointPaths,
    ) -> Self {
        Self {
            fetcher,
            credentials,
            download_dir,
            paths,
        }
    }

    pub async fn run(&self) -> Result<FetchOutcome> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| SyncError::config("portal username or access token not found"))?;

        let discovered = checkpoint::load(&self.paths.discovered)?;
        let fetched = checkpoint::load(&self.paths.fetched)?;
        let pending = checkpoint::pending(&discovered, &fetched);

        let mut outcome = FetchOutcome::default();
        if pending.is_empty() {
            info!("No new bundles to download");
            return Ok(outcome);
        }
        info!(pending = pending.len(), "Downloading new bundles");

        for bundle in pending {
            match self.fetcher.fetch(&bundle, &self.download_dir, credentials).await {
                Ok(file) => {
                    checkpoint::append(&self.paths.fetched, &bundle)?;
                    info!(bundle = %bundle, bytes = file.bytes, sha256 = %file.sha256, "✓ Bundle downloaded");
                    outcome.fetched.push(bundle);
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(bundle = %bundle, error = %e, "✗ Download failed, will retry next cycle");
                    outcome.failed.push(bundle);
                },
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSet;
    use crate::transfer::FetchedBundle;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;

    /// Records every attempt; bundles listed in `failing` return an error
    #[derive(Default)]
    struct FakeFetcher {
        failing: Mutex<HashSet<String>>,
        attempts: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn failing(urls: &[&str]) -> Self {
            let fetcher = Self::default();
            fetcher
                .failing
                .lock()
                .unwrap()
                .extend(urls.iter().map(|u| u.to_string()));
            fetcher
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BundleFetcher for FakeFetcher {
        async fn fetch(
            &self,
            bundle: &BundleRef,
            dest_dir: &Path,
            _credentials: &Credentials,
        ) -> Result<FetchedBundle> {
            self.attempts.lock().unwrap().push(bundle.to_string());
            if self.failing.lock().unwrap().contains(bundle.as_str()) {
                return Err(SyncError::HttpStatus {
                    url: bundle.to_string(),
                    status: 503,
                });
            }
            Ok(FetchedBundle {
                path: bundle.local_path(dest_dir),
                bytes: 1,
                sha256: "0".repeat(64),
            })
        }
    }

    fn creds() -> Option<Credentials> {
        Some(Credentials {
            username: "u".to_string(),
            token: "t".to_string(),
        })
    }

    fn set(urls: &[&str]) -> CheckpointSet {
        urls.iter().map(|u| BundleRef::new(*u).unwrap()).collect()
    }

    const A: &str = "http://h/a.tar.gz";
    const B: &str = "http://h/b.tar.gz";

    #[tokio::test]
    async fn test_only_pending_attempted_and_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::in_dir(dir.path());
        checkpoint::save(&paths.discovered, &set(&[A, B])).unwrap();
        checkpoint::append(&paths.fetched, &BundleRef::new(A).unwrap()).unwrap();

        let fetcher = Arc::new(FakeFetcher::failing(&[B]));
        let stage = FetchStage::new(fetcher.clone(), creds(), dir.path().join("dl"), paths.clone());

        // B fails: stays absent
        let outcome = stage.run().await.unwrap();
        assert_eq!(fetcher.attempts(), vec![B.to_string()]);
        assert_eq!(outcome.failed, vec![BundleRef::new(B).unwrap()]);
        assert_eq!(checkpoint::load(&paths.fetched).unwrap(), set(&[A]));

        // B succeeds on retry
        fetcher.heal();
        let outcome = stage.run().await.unwrap();
        assert_eq!(outcome.fetched, vec![BundleRef::new(B).unwrap()]);
        assert_eq!(checkpoint::load(&paths.fetched).unwrap(), set(&[A, B]));

        // Never again
        stage.run().await.unwrap();
        assert_eq!(fetcher.attempts(), vec![B.to_string(), B.to_string()]);
    }

    #[tokio::test]
    async fn test_missing_credentials_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::in_dir(dir.path());
        checkpoint::save(&paths.discovered, &set(&[A])).unwrap();

        let fetcher = Arc::new(FakeFetcher::default());
        let stage = FetchStage::new(fetcher.clone(), None, dir.path().join("dl"), paths.clone());

        let err = stage.run().await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(fetcher.attempts().is_empty());
        assert!(!paths.fetched.exists());
    }

    #[tokio::test]
    async fn test_nothing_discovered_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CheckpointPaths::in_dir(dir.path());

        let fetcher = Arc::new(FakeFetcher::default());
        let stage = FetchStage::new(fetcher.clone(), creds(), dir.path().join("dl"), paths);

        assert_eq!(stage.run().await.unwrap(), FetchOutcome::default());
        assert!(fetcher.attempts().is_empty());
    }
}
