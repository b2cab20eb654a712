//! Candidate runner: ranks raw search results, downloads their manifests and
//! drives the triage engine over them under one wall-clock budget.
//!
//! # Pipeline
//!
//! 1. [`build_candidates`]: drop results without a URL and repeated URLs (first wins)
//! 2. [`rank_candidates`]: preferred indexers first, then by size
//! 3. [`dedupe_by_title`]: keep the best-ranked result per normalized title
//! 4. select at most `max_candidates`
//! 5. a fixed set of workers claims candidates from a shared cursor
//! 6. every selected candidate ends with exactly one [`CandidateDecision`]

use crate::config::RunnerConfig;
use crate::engine::TriageEngine;
use crate::error::{Error, Result};
use crate::types::{
    ArchiveFinding, Blocker, Decision, Status, TriageOutcome, Warning, duration_ms,
};
use crate::utils::{normalize_indexer_token, normalize_title};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// `Accept` header sent when downloading manifests
pub const NZB_ACCEPT: &str = "application/x-nzb,text/xml;q=0.9,*/*;q=0.8";

/// `User-Agent` sent when downloading manifests
pub const USER_AGENT: &str = concat!("nzb-triage/", env!("CARGO_PKG_VERSION"));

/// One search result as returned by an indexer aggregator.
///
/// Indexers disagree on types, so `size` and `indexer_id` are kept loose.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSearchResult {
    /// Manifest download link; results without one are ignored
    #[serde(default, alias = "download_url", alias = "link")]
    pub download_url: Option<String>,
    /// Release title
    #[serde(default)]
    pub title: Option<String>,
    /// Declared size in bytes, as a number or numeric string
    #[serde(default)]
    pub size: Option<Value>,
    /// Indexer display name
    #[serde(default)]
    pub indexer: Option<String>,
    /// Indexer identifier, as a number or string
    #[serde(default, alias = "indexer_id")]
    pub indexer_id: Option<Value>,
}

/// A deduplicated, normalized search result
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Identity key
    pub download_url: String,
    /// Declared size in bytes (0 when unknown or unparsable)
    pub size: u64,
    /// Indexer identifier
    pub indexer_id: Option<String>,
    /// Indexer display name
    pub indexer_name: Option<String>,
    /// Title as given
    pub title: Option<String>,
    /// Lowercased, whitespace-collapsed title; `None` when empty
    pub normalized_title: Option<String>,
    /// Position in the raw result list
    pub source_index: usize,
}

impl Candidate {
    fn from_raw(index: usize, raw: &RawSearchResult, download_url: String) -> Self {
        Self {
            download_url,
            size: parse_size(raw.size.as_ref()),
            indexer_id: raw.indexer_id.as_ref().and_then(value_to_string),
            indexer_name: raw.indexer.clone(),
            title: raw.title.clone(),
            normalized_title: normalize_title(raw.title.as_deref()),
            source_index: index,
        }
    }

    fn matches_indexer(&self, preferred: &HashSet<String>) -> bool {
        [&self.indexer_id, &self.indexer_name]
            .into_iter()
            .flatten()
            .filter_map(|token| normalize_indexer_token(token))
            .any(|token| preferred.contains(&token))
    }
}

fn parse_size(value: Option<&Value>) -> u64 {
    let size = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match size {
        Some(size) if size.is_finite() && size > 0.0 => size as u64,
        _ => 0,
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Turn raw results into candidates, dropping repeated download URLs (first wins)
pub fn build_candidates(results: &[RawSearchResult]) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    results
        .iter()
        .enumerate()
        .filter_map(|(index, raw)| {
            let url = raw.download_url.as_deref()?.trim();
            if url.is_empty() || !seen.insert(url.to_string()) {
                return None;
            }
            Some(Candidate::from_raw(index, raw, url.to_string()))
        })
        .collect()
}

/// Order candidates: preferred indexers first, then within each group by closeness
/// to `preferred_size` (ties: larger first), or by descending size without one
pub fn rank_candidates(
    candidates: Vec<Candidate>,
    preferred_size: Option<u64>,
    preferred_indexers: &[String],
) -> Vec<Candidate> {
    let preferred: HashSet<String> = preferred_indexers
        .iter()
        .filter_map(|token| normalize_indexer_token(token))
        .collect();

    let (mut prioritized, mut fallback): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|candidate| candidate.matches_indexer(&preferred));

    let compare = |a: &Candidate, b: &Candidate| -> CmpOrdering {
        match preferred_size {
            Some(target) => a
                .size
                .abs_diff(target)
                .cmp(&b.size.abs_diff(target))
                .then_with(|| b.size.cmp(&a.size)),
            None => b.size.cmp(&a.size),
        }
    };
    prioritized.sort_by(compare);
    fallback.sort_by(compare);

    prioritized.extend(fallback);
    prioritized
}

/// Keep the first candidate per normalized title; untitled candidates are all kept
pub fn dedupe_by_title(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|candidate| match &candidate.normalized_title {
            Some(title) => seen.insert(title.clone()),
            None => true,
        })
        .collect()
}

/// Downloads manifest payloads
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    /// Fetch the manifest behind `url`; an empty payload is an error
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`ManifestFetcher`] over HTTP(S)
#[derive(Clone, Debug)]
pub struct HttpManifestFetcher {
    client: reqwest::Client,
}

impl HttpManifestFetcher {
    /// Create a fetcher whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = validate_download_url(url)?;
        let response = self
            .client
            .get(parsed)
            .header(reqwest::header::ACCEPT, NZB_ACCEPT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Fetch(format!("timed out fetching '{}'", url))
                } else {
                    Error::Fetch(format!("failed to fetch '{}': {}", url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch(format!("HTTP {} fetching '{}'", status, url)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Fetch(format!("failed to read body of '{}': {}", url, e)))?;
        if body.is_empty() {
            return Err(Error::Fetch("empty NZB payload".into()));
        }
        Ok(body.to_vec())
    }
}

/// Only absolute http(s) links are fetched
fn validate_download_url(url: &str) -> Result<url::Url> {
    let parsed =
        url::Url::parse(url).map_err(|e| Error::Fetch(format!("invalid NZB URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(Error::Fetch(format!(
            "URL scheme '{}' is not allowed; only http and https are supported",
            scheme
        ))),
    }
}

/// Final word on one selected candidate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDecision {
    /// Caller-facing status
    pub status: Status,
    /// Set when the candidate ran into the time budget
    pub timed_out: bool,
    /// Hard failures
    pub blockers: Vec<Blocker>,
    /// Soft issues
    pub warnings: Vec<Warning>,
    /// Fetch or engine error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Index of the manifest within its triage call
    pub nzb_index: Option<usize>,
    /// Files in the manifest
    pub file_count: Option<usize>,
    /// Archive findings from the engine
    pub archive_findings: Vec<ArchiveFinding>,
    /// Candidate title
    pub title: Option<String>,
    /// Candidate normalized title
    pub normalized_title: Option<String>,
    /// Candidate indexer id
    pub indexer_id: Option<String>,
    /// Candidate indexer name
    pub indexer_name: Option<String>,
}

impl CandidateDecision {
    fn bare(candidate: &Candidate, status: Status) -> Self {
        Self {
            status,
            timed_out: false,
            blockers: Vec::new(),
            warnings: Vec::new(),
            error: None,
            nzb_index: None,
            file_count: None,
            archive_findings: Vec::new(),
            title: candidate.title.clone(),
            normalized_title: candidate.normalized_title.clone(),
            indexer_id: candidate.indexer_id.clone(),
            indexer_name: candidate.indexer_name.clone(),
        }
    }

    fn timeout(candidate: &Candidate) -> Self {
        Self {
            timed_out: true,
            warnings: vec![Warning::TimedOut],
            ..Self::bare(candidate, Status::Pending)
        }
    }

    fn fetch_error(candidate: &Candidate, error: &Error) -> Self {
        Self {
            blockers: vec![Blocker::FetchError],
            error: Some(error.to_string()),
            ..Self::bare(candidate, Status::FetchError)
        }
    }

    fn no_decision(candidate: &Candidate) -> Self {
        Self {
            blockers: vec![Blocker::TriageError],
            warnings: vec![Warning::NoDecision],
            ..Self::bare(candidate, Status::Error)
        }
    }

    fn from_engine(candidate: &Candidate, decision: Decision) -> Self {
        Self {
            status: decision.status(),
            blockers: decision.blockers,
            warnings: decision.warnings,
            error: decision.error,
            nzb_index: Some(decision.nzb_index),
            file_count: decision.file_count,
            archive_findings: decision.archive_findings,
            ..Self::bare(candidate, Status::Pending)
        }
    }
}

/// Indexer hints the caller configured, echoed back untouched
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerHints {
    /// Indexers ranked first
    pub priority: Vec<String>,
    /// Reserved: indexers whose results favour health checks
    pub health: Vec<String>,
    /// Reserved: indexers that should be fetched one at a time
    pub serialized: Vec<String>,
    /// Whether the caller prefetches the first verified candidate
    pub prefetch_first_verified: bool,
}

/// Result of one runner invocation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerReport {
    /// One decision per selected candidate, keyed by download URL
    pub decisions: HashMap<String, CandidateDecision>,
    /// Selected download URLs, best first
    pub ranked_urls: Vec<String>,
    /// Wall-clock time of the invocation
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// Whether the time budget ran out
    pub timed_out: bool,
    /// Number of selected candidates
    pub candidates_considered: usize,
    /// Candidates the engine produced a decision for
    pub evaluated_count: usize,
    /// Candidates whose manifest could not be downloaded
    pub fetch_failures: usize,
    /// Configured indexer hints
    pub hints: IndexerHints,
}

impl RunnerReport {
    /// Decision for `url`, if it was selected
    pub fn decision(&self, url: &str) -> Option<&CandidateDecision> {
        self.decisions.get(url)
    }

    /// Best-ranked candidate with a verified status
    pub fn first_verified(&self) -> Option<&str> {
        self.ranked_urls
            .iter()
            .find(|url| {
                self.decisions
                    .get(url.as_str())
                    .is_some_and(|d| d.status == Status::Verified)
            })
            .map(String::as_str)
    }

    /// How many decisions ended in each status
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for decision in self.decisions.values() {
            *counts.entry(decision.status.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// State shared by the workers of one invocation
struct RunState<'a> {
    selected: &'a [Candidate],
    started: Instant,
    budget: Duration,
    cursor: AtomicUsize,
    timed_out: AtomicBool,
    evaluated: AtomicUsize,
    fetch_failures: AtomicUsize,
}

/// Ranks search results and triages their manifests under a time budget
pub struct CandidateRunner {
    config: RunnerConfig,
    engine: Arc<TriageEngine>,
    fetcher: Arc<dyn ManifestFetcher>,
}

impl std::fmt::Debug for CandidateRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateRunner")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl CandidateRunner {
    /// Create a runner from its collaborators
    pub fn new(
        config: RunnerConfig,
        engine: Arc<TriageEngine>,
        fetcher: Arc<dyn ManifestFetcher>,
    ) -> Self {
        Self {
            config,
            engine,
            fetcher,
        }
    }

    /// Create a runner that downloads manifests over HTTP with the configured timeout
    pub fn with_http_fetcher(config: RunnerConfig, engine: Arc<TriageEngine>) -> Result<Self> {
        let fetcher = HttpManifestFetcher::new(config.download_timeout)?;
        Ok(Self::new(config, engine, Arc::new(fetcher)))
    }

    /// The engine candidates are triaged with
    pub fn engine(&self) -> &Arc<TriageEngine> {
        &self.engine
    }

    /// Rank, deduplicate and select candidates without fetching anything
    pub fn select(&self, results: &[RawSearchResult]) -> Vec<Candidate> {
        let ranked = rank_candidates(
            build_candidates(results),
            self.config.preferred_size_bytes,
            &self.config.priority_indexers,
        );
        let mut unique = dedupe_by_title(ranked);
        unique.truncate(self.config.max_candidates.max(1));
        unique
    }

    /// Triage `results` and return one decision per selected candidate
    pub async fn run(&self, results: &[RawSearchResult]) -> RunnerReport {
        let started = Instant::now();
        let selected = self.select(results);
        let ranked_urls: Vec<String> = selected.iter().map(|c| c.download_url.clone()).collect();

        if selected.is_empty() {
            return self.report(HashMap::new(), ranked_urls, started, false, 0, 0);
        }

        let state = RunState {
            selected: &selected,
            started,
            budget: self.config.time_budget,
            cursor: AtomicUsize::new(0),
            timed_out: AtomicBool::new(false),
            evaluated: AtomicUsize::new(0),
            fetch_failures: AtomicUsize::new(0),
        };

        let workers = self.config.download_concurrency.clamp(1, selected.len());
        tracing::debug!(
            candidates = selected.len(),
            workers,
            budget_ms = state.budget.as_millis() as u64,
            "starting candidate triage"
        );

        let mut decisions: HashMap<String, CandidateDecision> =
            join_all((0..workers).map(|_| self.work(&state)))
                .await
                .into_iter()
                .flatten()
                .collect();

        let timed_out = state.timed_out.load(Ordering::Acquire);
        for candidate in &selected {
            decisions
                .entry(candidate.download_url.clone())
                .or_insert_with(|| {
                    if timed_out {
                        CandidateDecision::timeout(candidate)
                    } else {
                        CandidateDecision::bare(candidate, Status::Skipped)
                    }
                });
        }

        let report = self.report(
            decisions,
            ranked_urls,
            started,
            timed_out,
            state.evaluated.load(Ordering::Relaxed),
            state.fetch_failures.load(Ordering::Relaxed),
        );
        tracing::info!(
            candidates = report.candidates_considered,
            evaluated = report.evaluated_count,
            fetch_failures = report.fetch_failures,
            timed_out = report.timed_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "candidate triage finished"
        );
        report
    }

    /// One worker: claim candidates until none are left or the budget is gone
    async fn work(&self, state: &RunState<'_>) -> Vec<(String, CandidateDecision)> {
        let mut decided = Vec::new();
        loop {
            if state.timed_out.load(Ordering::Acquire) {
                break;
            }
            let index = state.cursor.fetch_add(1, Ordering::AcqRel);
            let Some(candidate) = state.selected.get(index) else {
                break;
            };
            let decision = self.evaluate(candidate, state).await;
            decided.push((candidate.download_url.clone(), decision));
        }
        decided
    }

    async fn evaluate(&self, candidate: &Candidate, state: &RunState<'_>) -> CandidateDecision {
        if state.started.elapsed() >= state.budget {
            state.timed_out.store(true, Ordering::Release);
            return CandidateDecision::timeout(candidate);
        }

        let payload = match self.fetcher.fetch(&candidate.download_url).await {
            Ok(payload) => payload,
            Err(e) => {
                state.fetch_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    download_url = %candidate.download_url,
                    error = %e,
                    "failed to download NZB for triage"
                );
                return CandidateDecision::fetch_error(candidate, &e);
            }
        };

        let remaining = state.budget.saturating_sub(state.started.elapsed());
        if remaining.is_zero() {
            state.timed_out.store(true, Ordering::Release);
            return CandidateDecision::timeout(candidate);
        }

        let outcome = self
            .engine
            .triage_with_deadline(std::slice::from_ref(&payload), Instant::now() + remaining)
            .await;

        match outcome {
            TriageOutcome::Completed(summary) => match summary.decisions.into_iter().next() {
                Some(decision) => {
                    state.evaluated.fetch_add(1, Ordering::Relaxed);
                    CandidateDecision::from_engine(candidate, decision)
                }
                None => {
                    tracing::warn!(download_url = %candidate.download_url, "engine returned no decision");
                    CandidateDecision::no_decision(candidate)
                }
            },
            TriageOutcome::TimedOut => {
                // The engine's own pace can expire before the global budget does.
                if state.started.elapsed() >= state.budget {
                    state.timed_out.store(true, Ordering::Release);
                }
                tracing::warn!(download_url = %candidate.download_url, "NZB triage timed out");
                CandidateDecision::timeout(candidate)
            }
        }
    }

    fn report(
        &self,
        decisions: HashMap<String, CandidateDecision>,
        ranked_urls: Vec<String>,
        started: Instant,
        timed_out: bool,
        evaluated_count: usize,
        fetch_failures: usize,
    ) -> RunnerReport {
        RunnerReport {
            candidates_considered: ranked_urls.len(),
            decisions,
            ranked_urls,
            elapsed: started.elapsed(),
            timed_out,
            evaluated_count,
            fetch_failures,
            hints: IndexerHints {
                priority: self.config.priority_indexers.clone(),
                health: self.config.health_indexers.clone(),
                serialized: self.config.serialized_indexers.clone(),
                prefetch_first_verified: self.config.prefetch_first_verified,
            },
        }
    }
}
