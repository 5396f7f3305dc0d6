//! Credentialed bundle download
//!
//! [`HttpFetcher`] streams one bundle to `<download_dir>/<file>.part`,
//! renames it into place once the body is complete, and records a SHA-256
//! sidecar for the publish stage's integrity check.

use async_trait::async_trait;
use cmfproxy_common::checksum;
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::bundle::BundleRef;
use crate::config::Credentials;
use crate::error::{Result, SyncError};

/// A bundle that landed in the download directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBundle {
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
}

/// Fetches one bundle into a directory
#[async_trait]
pub trait BundleFetcher: Send + Sync {
    async fn fetch(
        &self,
        bundle: &BundleRef,
        dest_dir: &Path,
        credentials: &Credentials,
    ) -> Result<FetchedBundle>;
}

/// HTTP(S) fetcher using basic auth with the portal username and token
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cmfproxy/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    async fn download_to(
        &self,
        bundle: &BundleRef,
        part: &Path,
        credentials: &Credentials,
    ) -> Result<u64> {
        let response = self
            .client
            .get(bundle.as_str())
            .basic_auth(&credentials.username, Some(&credentials.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::HttpStatus {
                url: bundle.to_string(),
                status: status.as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(part).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl BundleFetcher for HttpFetcher {
    async fn fetch(
        &self,
        bundle: &BundleRef,
        dest_dir: &Path,
        credentials: &Credentials,
    ) -> Result<FetchedBundle> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let target = bundle.local_path(dest_dir);
        let part = part_path(&target);

        let bytes = match self.download_to(bundle, &part, credentials).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&part).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %part.display(), error = %cleanup, "Could not remove partial download");
                    }
                }
                return Err(e);
            },
        };

        tokio::fs::rename(&part, &target).await?;

        let hashed = target.clone();
        let sha256 = tokio::task::spawn_blocking(move || -> Result<String> {
            let digest = checksum::sha256_file(&hashed)?;
            checksum::write_sidecar(&hashed, &digest)?;
            Ok(digest)
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))??;

        debug!(bundle = %bundle, path = %target.display(), bytes, "Bundle written");

        Ok(FetchedBundle {
            path: target,
            bytes,
            sha256,
        })
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
