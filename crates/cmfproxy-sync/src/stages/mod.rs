//! Pipeline stages
//!
//! Each stage reads the checkpoint of the stage before it, works through
//! what is pending, and records its own progress. Stages never share state
//! other than the checkpoint files.

pub mod discovery;
pub mod fetch;
pub mod publish;

pub use discovery::{DiscoveryOutcome, DiscoveryStage};
pub use fetch::{FetchOutcome, FetchStage};
pub use publish::{rewrite_artifact_url, PublishOutcome, PublishSettings, PublishStage};
