//! Triage engine: manifests in, one decision per manifest out.
//!
//! A call parses every manifest, then for each one runs the segment sampler and the
//! archive inspector concurrently against a connection pool and folds their
//! results into a [`Decision`]. The whole call is bounded by a deadline; when the
//! deadline wins, the call yields [`TriageOutcome::TimedOut`] and no partial result.

use crate::archive::{ArchiveClassifier, ArchiveInspector, DefaultArchivePolicy};
use crate::config::TriageConfig;
use crate::nntp::{Connector, NntpConnector};
use crate::nzb::parse_manifest;
use crate::pool::{ConnectionPool, PoolStats};
use crate::sampler::{CommandMetrics, assess_file, sample_file};
use crate::types::{
    ArchiveFinding, Blocker, Decision, TriageMetrics, TriageOutcome, TriageSummary, Verdict,
    Warning,
};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::time::Instant;

/// Pool used by one call
enum PoolLease {
    /// Process-scoped pool; left open
    Shared(Arc<ConnectionPool>),
    /// Created for this call; closed at its end
    Ephemeral(Arc<ConnectionPool>),
    /// No server configured
    Unconfigured,
}

impl PoolLease {
    fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        match self {
            PoolLease::Shared(pool) | PoolLease::Ephemeral(pool) => Some(pool),
            PoolLease::Unconfigured => None,
        }
    }

    fn mode(&self) -> &'static str {
        match self {
            PoolLease::Shared(_) => "shared",
            PoolLease::Ephemeral(_) => "ephemeral",
            PoolLease::Unconfigured => "none",
        }
    }
}

/// Decides whether manifests are retrievable and structurally usable
pub struct TriageEngine {
    config: TriageConfig,
    connector: Option<Arc<dyn Connector>>,
    inspector: ArchiveInspector,
    shared_pool: Option<Arc<ConnectionPool>>,
}

impl std::fmt::Debug for TriageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageEngine")
            .field("config", &self.config)
            .field("has_connector", &self.connector.is_some())
            .field("shared_pool", &self.shared_pool)
            .finish()
    }
}

impl TriageEngine {
    /// Create an engine from its collaborators.
    ///
    /// Without a connector the engine still parses manifests but cannot check them against a server.
    pub fn new(
        config: TriageConfig,
        connector: Option<Arc<dyn Connector>>,
        classifier: Arc<dyn ArchiveClassifier>,
    ) -> Self {
        let inspector = ArchiveInspector::new(classifier, &config);
        Self {
            config,
            connector,
            inspector,
            shared_pool: None,
        }
    }

    /// Create an engine talking to `config.server` with the built-in archive policy
    pub fn from_config(config: TriageConfig) -> Self {
        let connector = config
            .server
            .clone()
            .map(|server| Arc::new(NntpConnector::new(server)) as Arc<dyn Connector>);
        let classifier = Arc::new(DefaultArchivePolicy::new(config.archive_dirs.clone()));
        if !classifier.archive_dirs().is_empty() {
            tracing::debug!(
                archive_dirs = ?classifier.archive_dirs(),
                "archive locations carried by the default policy"
            );
        }
        Self::new(config, connector, classifier)
    }

    /// Attach a process-scoped pool, used by calls while `reuse_pool` is set
    pub fn with_shared_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.shared_pool = Some(pool);
        self
    }

    /// Build a pool suitable for [`with_shared_pool`](Self::with_shared_pool) from this
    /// engine's connector and settings. `None` when no server is configured.
    ///
    /// Must be called from within a Tokio runtime when keep-alive is configured.
    pub fn build_shared_pool(&self) -> Option<Arc<ConnectionPool>> {
        self.connector.as_ref().map(|connector| {
            ConnectionPool::new(
                Arc::clone(connector),
                self.config.max_connections,
                self.config.keep_alive,
            )
        })
    }

    /// The attached shared pool, if any
    pub fn shared_pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.shared_pool.as_ref()
    }

    /// Settings this engine runs with
    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    /// Triage `payloads`, bounded by the configured health-check timeout
    pub async fn triage(&self, payloads: &[Vec<u8>]) -> TriageOutcome {
        self.triage_with_deadline(payloads, Instant::now() + self.config.health_check_timeout)
            .await
    }

    /// Triage `payloads`, bounded by the earlier of `deadline` and the configured
    /// health-check timeout
    pub async fn triage_with_deadline(&self, payloads: &[Vec<u8>], deadline: Instant) -> TriageOutcome {
        let started = std::time::Instant::now();
        if payloads.is_empty() {
            return TriageOutcome::Completed(TriageSummary::from_decisions(
                Vec::new(),
                started.elapsed(),
                TriageMetrics::default(),
            ));
        }

        let deadline = deadline.min(Instant::now() + self.config.health_check_timeout);
        let lease = self.lease_pool();
        let before = lease.pool().map(|pool| pool.stats());
        let command_metrics = CommandMetrics::default();

        tracing::debug!(
            manifests = payloads.len(),
            pool_mode = lease.mode(),
            "starting triage"
        );

        let decisions = tokio::time::timeout_at(
            deadline,
            self.decide_all(payloads, lease.pool(), deadline, &command_metrics),
        )
        .await;

        if let PoolLease::Ephemeral(pool) = &lease {
            pool.close_all().await;
        }

        let Ok(decisions) = decisions else {
            tracing::warn!(
                manifests = payloads.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "triage timed out"
            );
            return TriageOutcome::TimedOut;
        };

        let mut metrics = TriageMetrics::default();
        command_metrics.fill(&mut metrics);
        if let (Some(pool), Some(before)) = (lease.pool(), before) {
            fill_pool_metrics(&mut metrics, &before, &pool.stats());
        }

        let summary = TriageSummary::from_decisions(decisions, started.elapsed(), metrics);
        tracing::info!(
            manifests = payloads.len(),
            accepted = summary.accepted,
            rejected = summary.rejected,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            pool_mode = lease.mode(),
            "triage finished"
        );
        TriageOutcome::Completed(summary)
    }

    fn lease_pool(&self) -> PoolLease {
        if self.config.reuse_pool
            && let Some(pool) = &self.shared_pool
            && !pool.is_closed()
        {
            return PoolLease::Shared(Arc::clone(pool));
        }
        match &self.connector {
            Some(connector) => PoolLease::Ephemeral(ConnectionPool::new(
                Arc::clone(connector),
                self.config.max_connections,
                None,
            )),
            None => PoolLease::Unconfigured,
        }
    }

    async fn decide_all(
        &self,
        payloads: &[Vec<u8>],
        pool: Option<&Arc<ConnectionPool>>,
        deadline: Instant,
        metrics: &CommandMetrics,
    ) -> Vec<Decision> {
        stream::iter(payloads.iter().enumerate())
            .map(|(index, payload)| self.decide(index, payload, pool, deadline, metrics))
            .buffer_unordered(self.config.max_parallel_nzbs.max(1))
            .collect()
            .await
    }

    async fn decide(
        &self,
        index: usize,
        payload: &[u8],
        pool: Option<&Arc<ConnectionPool>>,
        deadline: Instant,
        metrics: &CommandMetrics,
    ) -> Decision {
        let manifest = match parse_manifest(payload) {
            Ok(manifest) => manifest,
            Err(e) => {
                tracing::debug!(nzb_index = index, error = %e, "manifest rejected by parser");
                return Decision {
                    nzb_index: index,
                    nzb_title: None,
                    decision: Verdict::Error,
                    blockers: vec![Blocker::TriageError],
                    warnings: Vec::new(),
                    file_count: None,
                    archive_findings: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let Some(pool) = pool else {
            return Decision {
                nzb_index: index,
                nzb_title: manifest.title,
                decision: Verdict::Accept,
                blockers: Vec::new(),
                warnings: vec![Warning::NntpUnconfigured],
                file_count: Some(manifest.files.len()),
                archive_findings: Vec::new(),
                error: None,
            };
        };

        let sample_count = self.config.stat_sample_count;
        let stats = join_all(manifest.files.iter().map(|file| async move {
            let samples = sample_file(pool, file, sample_count, deadline, metrics).await;
            assess_file(file, &samples)
        }));
        let inspection = self.inspector.inspect(pool, &manifest.files, deadline, metrics);
        let (assessments, findings) = tokio::join!(stats, inspection);

        let mut blockers = Vec::new();
        let mut warnings = Vec::new();
        for (file_blockers, file_warnings) in assessments {
            file_blockers.into_iter().for_each(|b| push_unique(&mut blockers, b));
            file_warnings.into_iter().for_each(|w| push_unique(&mut warnings, w));
        }
        fold_findings(&findings, &mut blockers, &mut warnings);

        let verdict = if blockers.is_empty() {
            Verdict::Accept
        } else {
            Verdict::Blocked
        };
        tracing::debug!(
            nzb_index = index,
            files = manifest.files.len(),
            ?verdict,
            ?blockers,
            ?warnings,
            "manifest decided"
        );

        Decision {
            nzb_index: index,
            nzb_title: manifest.title,
            decision: verdict,
            blockers,
            warnings,
            file_count: Some(manifest.files.len()),
            archive_findings: findings,
            error: None,
        }
    }
}

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn fold_findings(findings: &[ArchiveFinding], blockers: &mut Vec<Blocker>, warnings: &mut Vec<Warning>) {
    for finding in findings {
        if let Some(blocker) = finding.status.blocker() {
            push_unique(blockers, blocker);
        }
        if let Some(warning) = finding.status.warning() {
            push_unique(warnings, warning);
        }
    }
}

fn fill_pool_metrics(metrics: &mut TriageMetrics, before: &PoolStats, after: &PoolStats) {
    metrics.pool_creates = after.created.saturating_sub(before.created);
    metrics.pool_reuses = after.reused.saturating_sub(before.reused);
    metrics.pool_closes = after.closed.saturating_sub(before.closed);
    metrics.client_acquisitions = after.acquisitions.saturating_sub(before.acquisitions);
    metrics.pool_totals = after.totals();
}
