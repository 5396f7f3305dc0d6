//! Discovery: find uploaded bundles in recent telemetry
//!
//! Every cycle queries each node for the lookback window, keeps `upload`
//! records whose value names a `.tar.gz`, and overwrites the discovery
//! checkpoint with the union. A failed node query is not the same as a node
//! with nothing to report:
//!
//! - some nodes failed: the answered nodes' bundles are merged into the
//!   previous checkpoint, so entries the failed nodes reported earlier stay
//! - every node failed: the previous checkpoint is left untouched

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bundle::BundleRef;
use crate::checkpoint::{self, CheckpointSet};
use crate::error::Result;
use crate::telemetry::{TelemetryRecord, TelemetrySource};

/// Record name that announces an uploaded file
pub const UPLOAD_RECORD_NAME: &str = "upload";

/// Result of one discovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// What the checkpoint now holds (or, when every node failed, the
    /// empty set found this cycle)
    pub discovered: CheckpointSet,
    /// Nodes whose query failed this cycle
    pub failed_nodes: Vec<String>,
    /// Whether the discovery checkpoint was written this cycle
    pub checkpoint_written: bool,
}

pub struct DiscoveryStage {
    source: Arc<dyn TelemetrySource>,
    nodes: Vec<String>,
    checkpoint: PathBuf,
}

impl DiscoveryStage {
    pub fn new(source: Arc<dyn TelemetrySource>, nodes: Vec<String>, checkpoint: PathBuf) -> Self {
        Self {
            source,
            nodes,
            checkpoint,
        }
    }

    pub async fn run(&self) -> Result<DiscoveryOutcome> {
        let mut outcome = DiscoveryOutcome::default();

        for node in &self.nodes {
            match self.source.query(node).await {
                Ok(records) => {
                    let found = upload_bundles(&records);
                    info!(node = %node, records = records.len(), bundles = found.len(), "Node queried");
                    outcome.discovered.extend(found);
                },
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(node = %node, error = %e, "✗ Telemetry query failed");
                    outcome.failed_nodes.push(node.clone());
                },
            }
        }

        let answered = self.nodes.len() - outcome.failed_nodes.len();
        if outcome.failed_nodes.is_empty() {
            checkpoint::save(&self.checkpoint, &outcome.discovered)?;
            outcome.checkpoint_written = true;
            info!(
                bundles = outcome.discovered.len(),
                path = %self.checkpoint.display(),
                "Discovery checkpoint written"
            );
        } else if answered > 0 {
            let previous = checkpoint::load(&self.checkpoint)?;
            outcome.discovered.extend(previous);
            checkpoint::save(&self.checkpoint, &outcome.discovered)?;
            outcome.checkpoint_written = true;
            warn!(
                bundles = outcome.discovered.len(),
                failed_nodes = ?outcome.failed_nodes,
                "Discovery checkpoint merged with previous entries for failed nodes"
            );
        } else {
            warn!(
                failed_nodes = ?outcome.failed_nodes,
                "Every node query failed, discovery checkpoint left unchanged"
            );
        }

        Ok(outcome)
    }
}

/// Bundle references announced by `upload` records
pub fn upload_bundles(records: &[TelemetryRecord]) -> CheckpointSet {
    records
        .iter()
        .filter(|record| record.name == UPLOAD_RECORD_NAME)
        .map(TelemetryRecord::value_text)
        .filter(|value| value.ends_with(crate::bundle::ARCHIVE_SUFFIX))
        .filter_map(|value| match BundleRef::new(value) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(error = %e, "Ignoring upload record");
                None
            },
        })
        .collect()
}
