//! Segment availability sampling.
//!
//! Every file gets a small, deterministic sample of segments checked with `STAT`.
//! The sample always starts with the first and last segment (where archive headers
//! and recovery records live), then the middle, then quarter and eighth points.

use crate::error::{Error, Result};
use crate::nntp::{ArticleBody, ArticleStatus};
use crate::nzb::ManifestFile;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::types::{Blocker, TriageMetrics, Warning};
use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Outcome of one sampled segment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleOutcome {
    /// The server has the article
    Present,
    /// The server cleanly reported the article as unknown
    Missing,
    /// Transport or protocol failure (including pool exhaustion)
    ProtocolError,
}

/// Sampled outcomes for one file
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileSamples {
    /// `(segment index, outcome)` in ascending index order
    pub samples: Vec<(usize, SampleOutcome)>,
}

impl FileSamples {
    fn count(&self, outcome: SampleOutcome) -> usize {
        self.samples.iter().filter(|(_, o)| *o == outcome).count()
    }

    fn missed(&self, index: usize) -> bool {
        self.samples
            .iter()
            .any(|(i, o)| *i == index && *o == SampleOutcome::Missing)
    }
}

/// Pick `min(segment_count, sample_count)` distinct segment indices, ascending.
pub fn select_sample_indices(segment_count: usize, sample_count: usize) -> Vec<usize> {
    let wanted = segment_count.min(sample_count);
    if wanted == 0 {
        return Vec::new();
    }

    let n = segment_count;
    let last = n - 1;
    let anchors = [
        0,
        last,
        n / 2,
        n / 4,
        (3 * n) / 4,
        n / 8,
        (3 * n) / 8,
        (5 * n) / 8,
        (7 * n) / 8,
    ];

    let mut picked: Vec<usize> = Vec::with_capacity(wanted);
    for index in anchors.into_iter().chain(0..n) {
        if picked.len() == wanted {
            break;
        }
        let index = index.min(last);
        if !picked.contains(&index) {
            picked.push(index);
        }
    }
    picked.sort_unstable();
    picked
}

/// Blockers and warnings raised by one file's samples
pub fn assess_file(file: &ManifestFile, samples: &FileSamples) -> (Vec<Blocker>, Vec<Warning>) {
    let mut blockers = Vec::new();
    let mut warnings = Vec::new();

    let sampled = samples.samples.len();
    let missing = samples.count(SampleOutcome::Missing);
    let errors = samples.count(SampleOutcome::ProtocolError);
    let expendable = file.kind.is_expendable();

    if missing > 0 {
        let last = file.segments.len().saturating_sub(1);
        let structural_miss = is_archive_container(file) && (samples.missed(0) || samples.missed(last));
        if !expendable && (missing >= 2 || missing == sampled || structural_miss) {
            blockers.push(Blocker::MissingArticles);
        } else {
            warnings.push(Warning::MissingArticles);
        }
    }

    if errors > 0 {
        if !expendable && errors == sampled {
            blockers.push(Blocker::NntpError);
        } else {
            warnings.push(Warning::NntpError);
        }
    }

    (blockers, warnings)
}

fn is_archive_container(file: &ManifestFile) -> bool {
    use crate::nzb::FileKind;
    matches!(
        file.kind,
        FileKind::RarFirstVolume | FileKind::RarVolume | FileKind::SevenZip | FileKind::Zip
    )
}

/// Per-call STAT/BODY counters, shared by every command of one triage call
#[derive(Debug, Default)]
pub struct CommandMetrics {
    stat_calls: AtomicU64,
    stat_successes: AtomicU64,
    stat_missing: AtomicU64,
    stat_errors: AtomicU64,
    stat_duration_ms: AtomicU64,
    body_calls: AtomicU64,
    body_successes: AtomicU64,
    body_missing: AtomicU64,
    body_errors: AtomicU64,
    body_duration_ms: AtomicU64,
    body_bytes: AtomicU64,
    decoded_bytes: AtomicU64,
}

impl CommandMetrics {
    /// Copy the counters into a metrics record
    pub fn fill(&self, metrics: &mut TriageMetrics) {
        metrics.stat_calls = self.stat_calls.load(Ordering::Relaxed);
        metrics.stat_successes = self.stat_successes.load(Ordering::Relaxed);
        metrics.stat_missing = self.stat_missing.load(Ordering::Relaxed);
        metrics.stat_errors = self.stat_errors.load(Ordering::Relaxed);
        metrics.stat_duration_ms = self.stat_duration_ms.load(Ordering::Relaxed);
        metrics.body_calls = self.body_calls.load(Ordering::Relaxed);
        metrics.body_successes = self.body_successes.load(Ordering::Relaxed);
        metrics.body_missing = self.body_missing.load(Ordering::Relaxed);
        metrics.body_errors = self.body_errors.load(Ordering::Relaxed);
        metrics.body_duration_ms = self.body_duration_ms.load(Ordering::Relaxed);
        metrics.body_bytes = self.body_bytes.load(Ordering::Relaxed);
        metrics.decoded_bytes = self.decoded_bytes.load(Ordering::Relaxed);
    }

    /// Count bytes produced by decoding a fetched body
    pub(crate) fn record_decoded(&self, bytes: usize) {
        self.decoded_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Article body bytes kept from the wire so far
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes.load(Ordering::Relaxed)
    }

    /// Bytes produced by yEnc decoding so far
    pub fn decoded_bytes(&self) -> u64 {
        self.decoded_bytes.load(Ordering::Relaxed)
    }

    fn record(&self, command: Command<'_>, outcome: SampleOutcome, started: std::time::Instant) {
        let elapsed = started.elapsed().as_millis() as u64;
        let (calls, successes, missing, errors, duration) = match command {
            Command::Stat(_) => (
                &self.stat_calls,
                &self.stat_successes,
                &self.stat_missing,
                &self.stat_errors,
                &self.stat_duration_ms,
            ),
            Command::Body(..) => (
                &self.body_calls,
                &self.body_successes,
                &self.body_missing,
                &self.body_errors,
                &self.body_duration_ms,
            ),
        };
        calls.fetch_add(1, Ordering::Relaxed);
        duration.fetch_add(elapsed, Ordering::Relaxed);
        let counter = match outcome {
            SampleOutcome::Present => successes,
            SampleOutcome::Missing => missing,
            SampleOutcome::ProtocolError => errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Command<'a> {
    Stat(&'a str),
    /// Message id and the most body bytes to keep
    Body(&'a str, usize),
}

#[derive(Debug)]
pub(crate) enum Reply {
    Present,
    Missing,
    Body(ArticleBody),
}

async fn attempt(pool: &Arc<ConnectionPool>, deadline: Instant, command: Command<'_>) -> Result<Reply> {
    let mut conn: PooledConnection = pool.acquire(deadline).await?;
    let result = match command {
        Command::Stat(id) => conn.stat(id).await.map(|status| match status {
            ArticleStatus::Present => Reply::Present,
            ArticleStatus::Missing => Reply::Missing,
        }),
        Command::Body(id, limit) => conn
            .body(id, limit)
            .await
            .map(|body| body.map_or(Reply::Missing, Reply::Body)),
    };
    // A body cut short leaves the rest of the response on the wire.
    let reusable = match &result {
        Ok(Reply::Body(body)) => body.complete,
        other => other.is_ok(),
    };
    conn.release(reusable);
    result
}

/// Run one command on a pooled session, retrying once on a fresh session when the
/// first one fails at the transport level. Bounded by `deadline`.
pub(crate) async fn execute(
    pool: &Arc<ConnectionPool>,
    deadline: Instant,
    command: Command<'_>,
    metrics: &CommandMetrics,
) -> Result<Reply> {
    let started = std::time::Instant::now();
    let result = tokio::time::timeout_at(deadline, async {
        match attempt(pool, deadline, command).await {
            Err(e) if e.is_connection_failure() => {
                tracing::debug!(error = %e, ?command, "retrying on a fresh NNTP session");
                attempt(pool, deadline, command).await
            }
            other => other,
        }
    })
    .await
    .unwrap_or(Err(Error::Timeout));

    let outcome = match &result {
        Ok(Reply::Missing) => SampleOutcome::Missing,
        Ok(_) => SampleOutcome::Present,
        Err(_) => SampleOutcome::ProtocolError,
    };
    if let Ok(Reply::Body(body)) = &result {
        metrics
            .body_bytes
            .fetch_add(body.data.len() as u64, Ordering::Relaxed);
    }
    metrics.record(command, outcome, started);
    result
}

/// STAT the sampled segments of one file concurrently
pub async fn sample_file(
    pool: &Arc<ConnectionPool>,
    file: &ManifestFile,
    sample_count: usize,
    deadline: Instant,
    metrics: &CommandMetrics,
) -> FileSamples {
    let indices = select_sample_indices(file.segments.len(), sample_count);
    let checks = indices.into_iter().map(|index| async move {
        let segment = &file.segments[index];
        let outcome = match execute(pool, deadline, Command::Stat(&segment.message_id), metrics).await {
            Ok(Reply::Missing) => SampleOutcome::Missing,
            Ok(_) => SampleOutcome::Present,
            Err(e) => {
                tracing::debug!(
                    message_id = %segment.message_id,
                    error = %e,
                    "segment STAT failed"
                );
                SampleOutcome::ProtocolError
            }
        };
        (index, outcome)
    });

    FileSamples {
        samples: join_all(checks).await,
    }
}
