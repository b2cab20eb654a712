//! Core types for nzb-triage

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Terminal engine verdict for one manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    /// No blocker was raised
    Accept,
    /// At least one content blocker was raised
    Blocked,
    /// The manifest could not be triaged at all (unparsable, internal failure)
    Error,
    /// The manifest could not be downloaded
    FetchError,
}

impl Verdict {
    /// Lowercase label as exposed to callers
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "accept",
            Verdict::Blocked => "blocked",
            Verdict::Error => "error",
            Verdict::FetchError => "fetch-error",
        }
    }
}

/// Caller-facing status of a candidate, derived from its verdict and findings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    /// Accepted with positive structural evidence
    Verified,
    /// Accepted without positive structural evidence
    Unverified,
    /// Rejected for content reasons
    Blocked,
    /// Triage failed
    Error,
    /// Manifest download failed
    FetchError,
    /// Not evaluated because the budget ran out
    Pending,
    /// Not evaluated although the budget did not run out
    Skipped,
}

impl Status {
    /// Lowercase label as exposed to callers
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Verified => "verified",
            Status::Unverified => "unverified",
            Status::Blocked => "blocked",
            Status::Error => "error",
            Status::FetchError => "fetch-error",
            Status::Pending => "pending",
            Status::Skipped => "skipped",
        }
    }

}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hard failure reasons; any blocker prevents acceptance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Blocker {
    /// Manifest unparsable or triage failed internally
    TriageError,
    /// Manifest could not be downloaded
    FetchError,
    /// Sampled articles are gone from the server
    MissingArticles,
    /// Every sample of a file failed at the transport level
    NntpError,
    /// RAR member is compressed
    RarCompressed,
    /// RAR archive or member is encrypted
    RarEncrypted,
    /// 7z archive uses a compressing coder
    #[serde(rename = "sevenzip-compressed")]
    SevenZipCompressed,
    /// 7z archive is encrypted
    #[serde(rename = "sevenzip-encrypted")]
    SevenZipEncrypted,
    /// ZIP member is compressed
    ZipCompressed,
    /// ZIP member is encrypted
    ZipEncrypted,
    /// Archive header is malformed or fails its checksum
    ArchiveCorrupt,
    /// Article body could not be decoded
    DecodeError,
}

impl Blocker {
    /// Lowercase label used in frequency tables
    pub fn as_str(&self) -> &'static str {
        match self {
            Blocker::TriageError => "triage-error",
            Blocker::FetchError => "fetch-error",
            Blocker::MissingArticles => "missing-articles",
            Blocker::NntpError => "nntp-error",
            Blocker::RarCompressed => "rar-compressed",
            Blocker::RarEncrypted => "rar-encrypted",
            Blocker::SevenZipCompressed => "sevenzip-compressed",
            Blocker::SevenZipEncrypted => "sevenzip-encrypted",
            Blocker::ZipCompressed => "zip-compressed",
            Blocker::ZipEncrypted => "zip-encrypted",
            Blocker::ArchiveCorrupt => "archive-corrupt",
            Blocker::DecodeError => "decode-error",
        }
    }
}

impl std::fmt::Display for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Soft findings; they never prevent acceptance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Warning {
    /// Some sampled articles are missing but not enough to block
    MissingArticles,
    /// Some STAT commands failed at the transport level
    NntpError,
    /// 7z archive found but its storage method could not be confirmed
    #[serde(rename = "sevenzip-unverified")]
    SevenZipUnverified,
    /// File looked like an archive but carries no known signature
    UnknownSignature,
    /// Archive header ran past the inspected window
    HeaderTruncated,
    /// No news server configured; only the manifest was checked
    NntpUnconfigured,
    /// Triage ran out of time
    TimedOut,
    /// The engine produced no decision for the manifest
    NoDecision,
}

impl Warning {
    /// Lowercase label used in frequency tables
    pub fn as_str(&self) -> &'static str {
        match self {
            Warning::MissingArticles => "missing-articles",
            Warning::NntpError => "nntp-error",
            Warning::SevenZipUnverified => "sevenzip-unverified",
            Warning::UnknownSignature => "unknown-signature",
            Warning::HeaderTruncated => "header-truncated",
            Warning::NntpUnconfigured => "nntp-unconfigured",
            Warning::TimedOut => "timed-out",
            Warning::NoDecision => "no-decision",
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of inspecting one file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveStatus {
    /// RAR first volume whose first member is stored uncompressed
    RarStored,
    /// RAR member is compressed
    RarCompressed,
    /// RAR headers or member encrypted
    RarEncrypted,
    /// 7z archive whose coders are all `Copy`
    #[serde(rename = "sevenzip-stored")]
    SevenZipStored,
    /// 7z archive with a compressing coder
    #[serde(rename = "sevenzip-compressed")]
    SevenZipCompressed,
    /// 7z archive with an AES coder
    #[serde(rename = "sevenzip-encrypted")]
    SevenZipEncrypted,
    /// 7z archive whose header could not be reached or is itself encoded
    #[serde(rename = "sevenzip-unverified")]
    SevenZipUnverified,
    /// ZIP member stored uncompressed
    ZipStored,
    /// ZIP member compressed
    ZipCompressed,
    /// ZIP member encrypted
    ZipEncrypted,
    /// Non-archive file whose first segment was retrieved and decoded
    SegmentOk,
    /// First segment is not on the server
    SegmentMissing,
    /// First segment could not be fetched because of transport failures
    SegmentError,
    /// Article body could not be decoded
    DecodeError,
    /// Archive-named file without a known signature
    UnknownSignature,
    /// Header ran past the decoded window
    HeaderTruncated,
    /// Header malformed or checksum mismatch
    HeaderCorrupt,
    /// Header is fine but a spanning sample is missing
    ArchiveIncomplete,
}

impl ArchiveStatus {
    /// Lowercase label, identical to the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveStatus::RarStored => "rar-stored",
            ArchiveStatus::RarCompressed => "rar-compressed",
            ArchiveStatus::RarEncrypted => "rar-encrypted",
            ArchiveStatus::SevenZipStored => "sevenzip-stored",
            ArchiveStatus::SevenZipCompressed => "sevenzip-compressed",
            ArchiveStatus::SevenZipEncrypted => "sevenzip-encrypted",
            ArchiveStatus::SevenZipUnverified => "sevenzip-unverified",
            ArchiveStatus::ZipStored => "zip-stored",
            ArchiveStatus::ZipCompressed => "zip-compressed",
            ArchiveStatus::ZipEncrypted => "zip-encrypted",
            ArchiveStatus::SegmentOk => "segment-ok",
            ArchiveStatus::SegmentMissing => "segment-missing",
            ArchiveStatus::SegmentError => "segment-error",
            ArchiveStatus::DecodeError => "decode-error",
            ArchiveStatus::UnknownSignature => "unknown-signature",
            ArchiveStatus::HeaderTruncated => "header-truncated",
            ArchiveStatus::HeaderCorrupt => "header-corrupt",
            ArchiveStatus::ArchiveIncomplete => "archive-incomplete",
        }
    }

    /// Whether this status is positive structural evidence
    pub fn is_positive(&self) -> bool {
        matches!(
            self,
            ArchiveStatus::RarStored
                | ArchiveStatus::SevenZipStored
                | ArchiveStatus::ZipStored
                | ArchiveStatus::SegmentOk
        )
    }

    /// Blocker raised by this status, if any
    pub fn blocker(&self) -> Option<Blocker> {
        match self {
            ArchiveStatus::RarCompressed => Some(Blocker::RarCompressed),
            ArchiveStatus::RarEncrypted => Some(Blocker::RarEncrypted),
            ArchiveStatus::SevenZipCompressed => Some(Blocker::SevenZipCompressed),
            ArchiveStatus::SevenZipEncrypted => Some(Blocker::SevenZipEncrypted),
            ArchiveStatus::ZipCompressed => Some(Blocker::ZipCompressed),
            ArchiveStatus::ZipEncrypted => Some(Blocker::ZipEncrypted),
            ArchiveStatus::HeaderCorrupt => Some(Blocker::ArchiveCorrupt),
            ArchiveStatus::DecodeError => Some(Blocker::DecodeError),
            ArchiveStatus::SegmentMissing | ArchiveStatus::ArchiveIncomplete => {
                Some(Blocker::MissingArticles)
            }
            _ => None,
        }
    }

    /// Warning raised by this status, if any
    pub fn warning(&self) -> Option<Warning> {
        match self {
            ArchiveStatus::SegmentError => Some(Warning::NntpError),
            ArchiveStatus::SevenZipUnverified => Some(Warning::SevenZipUnverified),
            ArchiveStatus::UnknownSignature => Some(Warning::UnknownSignature),
            ArchiveStatus::HeaderTruncated => Some(Warning::HeaderTruncated),
            _ => None,
        }
    }
}

/// Classification of one inspected file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFinding {
    /// Inspection outcome
    pub status: ArchiveStatus,
    /// Filename extracted from the subject
    pub filename: Option<String>,
    /// Raw subject line
    pub subject: String,
    /// Free-form detail (e.g., the member name or the decode error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Engine decision for one manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Index of the manifest in the triage call's input
    pub nzb_index: usize,
    /// Title from the manifest metadata, if present
    pub nzb_title: Option<String>,
    /// Verdict
    pub decision: Verdict,
    /// Hard failures (deduplicated, in first-seen order)
    pub blockers: Vec<Blocker>,
    /// Soft issues (deduplicated, in first-seen order)
    pub warnings: Vec<Warning>,
    /// Number of files in the manifest (None if it could not be parsed)
    pub file_count: Option<usize>,
    /// One finding per inspected file
    pub archive_findings: Vec<ArchiveFinding>,
    /// Parse or internal error message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Decision {
    /// Collapse verdict and findings into the caller-facing status
    pub fn status(&self) -> Status {
        match self.decision {
            Verdict::Accept if self.blockers.is_empty() => {
                if self.archive_findings.iter().any(|f| f.status.is_positive()) {
                    Status::Verified
                } else {
                    Status::Unverified
                }
            }
            Verdict::Accept | Verdict::Blocked => Status::Blocked,
            Verdict::Error => Status::Error,
            Verdict::FetchError => Status::FetchError,
        }
    }

    /// Whether the verdict is an acceptance
    pub fn is_accepted(&self) -> bool {
        self.decision == Verdict::Accept
    }
}

/// Per-call NNTP and pool counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageMetrics {
    /// STAT commands issued
    pub stat_calls: u64,
    /// STAT commands answered "present"
    pub stat_successes: u64,
    /// STAT commands answered "not found"
    pub stat_missing: u64,
    /// STAT commands that failed at the transport level
    pub stat_errors: u64,
    /// Total time spent in STAT round-trips
    pub stat_duration_ms: u64,
    /// BODY commands issued
    pub body_calls: u64,
    /// BODY commands that returned an article
    pub body_successes: u64,
    /// BODY commands answered "not found"
    pub body_missing: u64,
    /// BODY commands that failed at the transport level
    pub body_errors: u64,
    /// Total time spent in BODY round-trips
    pub body_duration_ms: u64,
    /// Article body bytes kept from the wire
    pub body_bytes: u64,
    /// Bytes produced by yEnc decoding
    pub decoded_bytes: u64,
    /// Connections created during this call
    pub pool_creates: u64,
    /// Idle connections reused during this call
    pub pool_reuses: u64,
    /// Connections closed during this call
    pub pool_closes: u64,
    /// Acquisitions during this call
    pub client_acquisitions: u64,
    /// Cumulative counters of the pool used by this call
    pub pool_totals: PoolTotals,
}

impl TriageMetrics {
    /// Mean STAT latency in milliseconds
    pub fn avg_stat_ms(&self) -> u64 {
        self.stat_duration_ms.checked_div(self.stat_calls).unwrap_or(0)
    }

    /// Mean BODY latency in milliseconds
    pub fn avg_body_ms(&self) -> u64 {
        self.body_duration_ms.checked_div(self.body_calls).unwrap_or(0)
    }
}

/// Cumulative pool counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTotals {
    /// Connections ever created
    pub created: u64,
    /// Idle connections ever reused
    pub reused: u64,
    /// Connections ever closed
    pub closed: u64,
}

/// Result of one triage call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriageSummary {
    /// One decision per input manifest, ordered by `nzb_index`
    pub decisions: Vec<Decision>,
    /// Decisions with an `accept` verdict
    pub accepted: usize,
    /// Decisions with any other verdict
    pub rejected: usize,
    /// Wall-clock time of the call
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    /// How many decisions carry each blocker
    pub blocker_counts: BTreeMap<String, usize>,
    /// How many decisions carry each warning
    pub warning_counts: BTreeMap<String, usize>,
    /// NNTP and pool counters
    pub metrics: TriageMetrics,
}

impl TriageSummary {
    /// Build a summary from finished decisions
    pub fn from_decisions(
        mut decisions: Vec<Decision>,
        elapsed: Duration,
        metrics: TriageMetrics,
    ) -> Self {
        decisions.sort_by_key(|d| d.nzb_index);
        let accepted = decisions.iter().filter(|d| d.is_accepted()).count();
        let rejected = decisions.len() - accepted;

        let mut blocker_counts = BTreeMap::new();
        let mut warning_counts = BTreeMap::new();
        for decision in &decisions {
            for blocker in &decision.blockers {
                *blocker_counts.entry(blocker.as_str().to_string()).or_insert(0) += 1;
            }
            for warning in &decision.warnings {
                *warning_counts.entry(warning.as_str().to_string()).or_insert(0) += 1;
            }
        }

        Self {
            decisions,
            accepted,
            rejected,
            elapsed,
            blocker_counts,
            warning_counts,
            metrics,
        }
    }

    /// Decision for the manifest at `index` in the call's input
    pub fn decision(&self, index: usize) -> Option<&Decision> {
        self.decisions.iter().find(|d| d.nzb_index == index)
    }
}

/// A triage call either completes or runs out of time; there is no partial result
#[derive(Clone, Debug)]
pub enum TriageOutcome {
    /// Every manifest received a decision
    Completed(TriageSummary),
    /// The deadline elapsed first
    TimedOut,
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
