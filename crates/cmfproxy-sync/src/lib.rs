//! CMF Proxy sync library
//!
//! Moves metadata bundles uploaded by edge nodes into a central CMF server.
//!
//! # Pipeline
//!
//! - **Discovery**: query node telemetry for `upload` records naming a
//!   `.tar.gz` bundle and record them in `queried_files.txt`
//! - **Fetch**: download each new bundle with portal credentials and record
//!   it in `downloaded_files.txt`
//! - **Publish**: unpack, initialize a CMF workspace, rewrite artifact
//!   locations, push metadata and artifacts, and record the bundle in
//!   `pushed_files.txt`
//!
//! Each checkpoint is a plain text file; a stage's pending work is always
//! "previous checkpoint minus mine", so the daemon can be killed and
//! restarted at any point.
//!
//! # Example
//!
//! ```no_run
//! use cmfproxy_sync::{config::Config, orchestrator::SyncOrchestrator};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(Path::new("config.json"))?;
//!     let report = SyncOrchestrator::from_config(&config)?.run_cycle().await?;
//!     println!("published {} bundles", report.published);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod bundle;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod metadata;
pub mod orchestrator;
pub mod stages;
pub mod telemetry;
pub mod transfer;

pub use error::{Result, SyncError};
