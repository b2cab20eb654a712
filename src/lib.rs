//! # nzb-triage
//!
//! Pre-download availability and archive-structure triage for Usenet NZB manifests.
//!
//! ## Design Philosophy
//!
//! nzb-triage answers one question before a download starts: is this release
//! streamable from the news server as-is? It does so cheaply:
//! - **Sampled availability** - a few `STAT` checks per file, never the whole release
//! - **Header-only inspection** - only the first article body of an archive is decoded
//! - **Bounded** - one wall-clock budget and one connection cap per call
//! - **Library-first** - the `nzb-triage` binary is a thin diagnostic wrapper
//!
//! Two entry points mirror the two layers:
//! - [`TriageEngine`] decides on a batch of already-downloaded manifests
//! - [`CandidateRunner`] ranks raw search results, downloads their manifests and
//!   drives the engine under a global time budget
//!
//! ## Quick Start
//!
//! ```no_run
//! use nzb_triage::{CandidateRunner, Config, RawSearchResult, TriageEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let engine = Arc::new(TriageEngine::from_config(config.runner.triage.clone()));
//!     let runner = CandidateRunner::with_http_fetcher(config.runner.clone(), engine)?;
//!
//!     let results: Vec<RawSearchResult> = serde_json::from_str(
//!         r#"[{"downloadUrl": "https://indexer.example/get/1", "title": "Movie", "size": 1}]"#,
//!     )?;
//!     let report = runner.run(&results).await;
//!     println!("first verified: {:?}", report.first_verified());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Archive header inspection
pub mod archive;
/// Configuration types
pub mod config;
/// Triage engine
pub mod engine;
/// Error types
pub mod error;
/// NNTP sessions and connectors
pub mod nntp;
/// NZB manifest parsing
pub mod nzb;
/// Bounded NNTP connection pool
pub mod pool;
/// Segment availability probing
pub mod sampler;
/// Candidate ranking and budgeted triage
pub mod runner;
/// Core types
pub mod types;
/// Utility functions
pub mod utils;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use archive::{ArchiveClassifier, ArchiveInspector, ContainerKind, DefaultArchivePolicy};
pub use config::{Config, RunnerConfig, ServerConfig, TriageConfig};
pub use engine::TriageEngine;
pub use error::{Error, Result};
pub use nntp::{ArticleBody, ArticleStatus, Connector, NntpConnector, NntpSession};
pub use nzb::{Manifest, ManifestFile, Segment, parse_manifest};
pub use pool::{ConnectionPool, PoolStats};
pub use runner::{
    Candidate, CandidateDecision, CandidateRunner, HttpManifestFetcher, IndexerHints,
    ManifestFetcher, RawSearchResult, RunnerReport,
};
pub use types::{
    ArchiveFinding, ArchiveStatus, Blocker, Decision, PoolTotals, Status, TriageMetrics,
    TriageOutcome, TriageSummary, Verdict, Warning,
};
