//! Sync orchestrator
//!
//! Runs Discovery, Fetch and Publish in order, then idles for the cycle
//! interval, until shut down. Per-bundle failures are absorbed by the stages;
//! anything that reaches this level is fatal and ends the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::checkpoint::CheckpointPaths;
use crate::config::Config;
use crate::error::Result;
use crate::metadata::{CmfStore, MetadataStore};
use crate::stages::{DiscoveryStage, FetchStage, PublishSettings, PublishStage};
use crate::telemetry::{SageDataClient, TelemetrySource};
use crate::transfer::{BundleFetcher, HttpFetcher};

/// Summary of one pipeline cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub discovered: usize,
    pub failed_nodes: Vec<String>,
    pub discovery_written: bool,
    pub fetched: usize,
    pub fetch_failed: usize,
    pub published: usize,
    pub publish_failed: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    /// Whether every node answered and every pending bundle went through
    pub fn is_clean(&self) -> bool {
        self.failed_nodes.is_empty() && self.fetch_failed == 0 && self.publish_failed == 0
    }
}

pub struct SyncOrchestrator {
    discovery: DiscoveryStage,
    fetch: FetchStage,
    publish: PublishStage,
    interval: Duration,
}

impl SyncOrchestrator {
    /// Wire the production adapters from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let source = SageDataClient::new(
            config.sage_server.data_api_url.clone(),
            config.sage_server.plugin.clone(),
            config.sage_server.history_period.clone(),
            config.query_timeout(),
        )?;
        let fetcher = HttpFetcher::new(config.download_timeout())?;
        let store = CmfStore::from_config(config)?;

        Ok(Self::with_collaborators(
            config,
            Arc::new(source),
            Arc::new(fetcher),
            Arc::new(store),
        ))
    }

    /// Wire arbitrary collaborators; used by tests and alternate deployments
    pub fn with_collaborators(
        config: &Config,
        source: Arc<dyn TelemetrySource>,
        fetcher: Arc<dyn BundleFetcher>,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let paths = CheckpointPaths::in_dir(&config.sync.state_dir);
        let download_dir = config.download_dir();

        let discovery = DiscoveryStage::new(
            source,
            config.sage_server.nodes.clone(),
            paths.discovered.clone(),
        );
        let fetch = FetchStage::new(
            fetcher,
            config.credentials(),
            download_dir.clone(),
            paths.clone(),
        );
        let publish = PublishStage::new(
            store,
            PublishSettings {
                workspace_root: config.workspace_root(),
                download_dir,
                pipeline_name: config.pipeline.pipeline_name.clone(),
                artifact_prefix: config.sync.artifact_prefix.clone(),
                verify_local_bundles: config.sync.verify_local_bundles,
                stage_name: config.pipeline.stage_name.clone(),
                execution_name: config.pipeline.execution_name.clone(),
            },
            paths,
        );

        Self {
            discovery,
            fetch,
            publish,
            interval: config.cycle_interval(),
        }
    }

    /// Run Discovery, Fetch and Publish once
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let span = tracing::info_span!("cycle", cycle_id = %cycle_id);

        async move {
            let started = Instant::now();
            info!("Starting sync cycle");

            let discovery = self.discovery.run().await?;
            let fetch = self.fetch.run().await?;
            let publish = self.publish.run().await?;

            let report = CycleReport {
                cycle_id,
                discovered: discovery.discovered.len(),
                failed_nodes: discovery.failed_nodes,
                discovery_written: discovery.checkpoint_written,
                fetched: fetch.fetched.len(),
                fetch_failed: fetch.failed.len(),
                published: publish.published.len(),
                publish_failed: publish.failed.len(),
                elapsed: started.elapsed(),
            };

            if report.is_clean() {
                info!(
                    discovered = report.discovered,
                    fetched = report.fetched,
                    published = report.published,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Sync cycle completed"
                );
            } else {
                warn!(
                    discovered = report.discovered,
                    failed_nodes = report.failed_nodes.len(),
                    fetched = report.fetched,
                    fetch_failed = report.fetch_failed,
                    published = report.published,
                    publish_failed = report.publish_failed,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Sync cycle completed with failures"
                );
            }

            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Cycle until `shutdown` resolves or a fatal error occurs.
    ///
    /// A shutdown during a cycle drops the in-flight work; progress recorded
    /// so far is whatever the checkpoints already hold.
    pub async fn run_forever<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(interval_secs = self.interval.as_secs(), "Sync daemon started");

        loop {
            tokio::select! {
                result = self.run_cycle() => {
                    result?;
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested during cycle, stopping");
                    return Ok(());
                },
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping");
                    return Ok(());
                },
            }
        }
    }
}
