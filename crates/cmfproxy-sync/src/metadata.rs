//! Metadata store adapter
//!
//! The publish stage drives a CMF workspace through [`MetadataStore`]:
//! initialize it, rewrite artifact locations in its local ML-Metadata file,
//! then push metadata and artifacts upstream. [`CmfStore`] implements this
//! with the `cmf` CLI and direct SQLite access to the ML-Metadata file.
//!
//! Every command runs with the workspace as its working directory; the
//! daemon's own working directory is never touched.

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, SyncError};

/// Location property of one artifact record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUrl {
    pub id: i64,
    pub url: String,
}

/// Operations the publish stage needs from the metadata store
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Initialize the store inside `workspace`
    async fn init(&self, workspace: &Path) -> Result<()>;

    /// Artifact records that carry a location
    async fn artifact_urls(&self, workspace: &Path) -> Result<Vec<ArtifactUrl>>;

    /// Persist a new location for artifact `id`
    async fn set_artifact_url(&self, workspace: &Path, id: i64, url: &str) -> Result<()>;

    async fn push_metadata(&self, workspace: &Path) -> Result<()>;

    async fn push_artifacts(&self, workspace: &Path) -> Result<()>;
}

/// `cmf` CLI + ML-Metadata SQLite implementation
#[derive(Debug, Clone)]
pub struct CmfStore {
    init_command: String,
    cmf_bin: String,
    pipeline_name: String,
    pipeline_file: String,
    timeout: Duration,
}

impl CmfStore {
    /// `init_command` must already have its placeholders resolved
    pub fn new(
        init_command: impl Into<String>,
        cmf_bin: impl Into<String>,
        pipeline_name: impl Into<String>,
        pipeline_file: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            init_command: init_command.into(),
            cmf_bin: cmf_bin.into(),
            pipeline_name: pipeline_name.into(),
            pipeline_file: pipeline_file.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            config.cmf_server.resolved_init_command()?,
            config.sync.cmf_bin.clone(),
            config.pipeline.pipeline_name.clone(),
            config.pipeline.pipeline_file.clone(),
            config.command_timeout(),
        ))
    }

    /// ML-Metadata file inside a workspace
    pub fn mlmd_path(&self, workspace: &Path) -> PathBuf {
        workspace.join(&self.pipeline_file)
    }

    fn push_command(&self, what: &str) -> Command {
        let mut command = Command::new(&self.cmf_bin);
        command.args([
            what,
            "push",
            "-p",
            self.pipeline_name.as_str(),
            "-f",
            self.pipeline_file.as_str(),
        ]);
        command
    }

    async fn run(&self, label: &str, mut command: Command, workspace: &Path) -> Result<()> {
        command
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = label, workspace = %workspace.display(), "Running metadata store command");

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(result) => result
                .map_err(|e| SyncError::command(label, format!("could not start: {}", e)))?,
            Err(_) => {
                return Err(SyncError::Timeout {
                    operation: format!("`{}`", label),
                    elapsed: self.timeout,
                })
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(command = label, output = %stdout.trim(), "Command output");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::command(
                label,
                format!("{}: {}", output.status, last_lines(&stderr, 5)),
            ));
        }

        Ok(())
    }

    async fn with_mlmd<T, F>(&self, workspace: &Path, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.mlmd_path(workspace);

        tokio::task::spawn_blocking(move || {
            if !path.is_file() {
                return Err(SyncError::LocalBundle {
                    path,
                    message: "ML-Metadata file not found in workspace".to_string(),
                });
            }
            let mut conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    }
}

#[async_trait]
impl MetadataStore for CmfStore {
    async fn init(&self, workspace: &Path) -> Result<()> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.init_command);
        self.run("cmf init", command, workspace).await
    }

    async fn artifact_urls(&self, workspace: &Path) -> Result<Vec<ArtifactUrl>> {
        self.with_mlmd(workspace, |conn| read_artifact_urls(conn)).await
    }

    async fn set_artifact_url(&self, workspace: &Path, id: i64, url: &str) -> Result<()> {
        let url = url.to_string();
        self.with_mlmd(workspace, move |conn| write_artifact_url(conn, id, &url))
            .await?;
        info!(artifact_id = id, "Artifact location updated");
        Ok(())
    }

    async fn push_metadata(&self, workspace: &Path) -> Result<()> {
        self.run("cmf metadata push", self.push_command("metadata"), workspace)
            .await
    }

    async fn push_artifacts(&self, workspace: &Path) -> Result<()> {
        self.run("cmf artifact push", self.push_command("artifact"), workspace)
            .await
    }
}

fn read_artifact_urls(conn: &Connection) -> Result<Vec<ArtifactUrl>> {
    let mut stmt = conn.prepare(
        "SELECT artifact_id, string_value FROM ArtifactProperty
         WHERE name = 'url' AND is_custom_property = 0 AND string_value IS NOT NULL
         ORDER BY artifact_id",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok(ArtifactUrl {
            id: row.get(0)?,
            url: row.get(1)?,
        })
    })?;

    let urls = rows.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(urls)
}

fn write_artifact_url(conn: &mut Connection, id: i64, url: &str) -> Result<()> {
    let tx = conn.transaction()?;

    let updated = tx.execute(
        "UPDATE ArtifactProperty SET string_value = ?1
         WHERE artifact_id = ?2 AND name = 'url' AND is_custom_property = 0",
        params![url, id],
    )?;
    if updated == 0 {
        return Err(SyncError::MetadataStore(rusqlite::Error::QueryReturnedNoRows));
    }

    tx.execute(
        "UPDATE Artifact SET last_update_time_since_epoch = ?1 WHERE id = ?2",
        params![chrono::Utc::now().timestamp_millis(), id],
    )?;

    tx.commit()?;
    Ok(())
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join(" | ")
}
