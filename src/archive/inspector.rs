//! Fetches and classifies the leading bytes of archive-like files.

use super::{ArchiveClassifier, ContainerKind, HeaderCheck, rar, sevenz, zip};
use crate::config::TriageConfig;
use crate::error::{Error, Result};
use crate::nntp::ArticleBody;
use crate::nzb::{ManifestFile, Segment};
use crate::pool::ConnectionPool;
use crate::sampler::{self, Command, CommandMetrics, Reply, select_sample_indices};
use crate::types::{ArchiveFinding, ArchiveStatus};
use futures::future::join_all;
use nntp_rs::YencDecoded;
use std::sync::Arc;
use tokio::time::Instant;

/// Wire allowance for the `=ybegin` / `=ypart` lines on top of a decoded-byte budget
const YENC_FRAMING_BYTES: usize = 1024;

/// Most decoded bytes one spanning sample may use
const SPAN_SAMPLE_BYTES: usize = 4096;

/// Decoded bytes one file may still produce across all of its fetches.
///
/// A slice is set aside for spanning samples up front, so header reads never
/// starve them.
#[derive(Debug)]
struct DecodeBudget {
    remaining: usize,
    per_sample: usize,
    samples: usize,
}

impl DecodeBudget {
    fn new(cap: usize, samples: usize) -> Self {
        Self {
            remaining: cap,
            per_sample: (cap / (samples + 1)).min(SPAN_SAMPLE_BYTES),
            samples,
        }
    }

    /// What header reads may still use
    fn for_headers(&self) -> usize {
        self.remaining
            .saturating_sub(self.per_sample * self.samples)
    }

    fn spend(&mut self, bytes: usize) {
        self.remaining = self.remaining.saturating_sub(bytes);
    }
}

/// One decoded segment and where its bytes sit in the file
struct DecodedSegment {
    data: Vec<u8>,
    offset: u64,
}

enum Fetched {
    Decoded(DecodedSegment),
    Missing,
    Failed(Error),
    Undecodable(String),
}

/// Inspects archive headers of the files chosen by an [`ArchiveClassifier`].
///
/// Every inspected file yields exactly one [`ArchiveFinding`]. Nothing is retried
/// beyond the single transport retry the sampler already does per command.
#[derive(Clone)]
pub struct ArchiveInspector {
    classifier: Arc<dyn ArchiveClassifier>,
    max_decoded_bytes: usize,
    archive_sample_count: usize,
    inspect_limit: usize,
}

impl std::fmt::Debug for ArchiveInspector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveInspector")
            .field("max_decoded_bytes", &self.max_decoded_bytes)
            .field("archive_sample_count", &self.archive_sample_count)
            .field("inspect_limit", &self.inspect_limit)
            .finish_non_exhaustive()
    }
}

impl ArchiveInspector {
    /// Create an inspector using the caps from `config`
    pub fn new(classifier: Arc<dyn ArchiveClassifier>, config: &TriageConfig) -> Self {
        Self {
            classifier,
            max_decoded_bytes: config.max_decoded_bytes.max(1),
            archive_sample_count: config.archive_sample_count,
            inspect_limit: config.archive_inspect_limit,
        }
    }

    /// Files that will be inspected: archive heads first, then other candidates,
    /// manifest order within each group, capped at the inspect limit
    pub fn select<'a>(&self, files: &'a [ManifestFile]) -> Vec<&'a ManifestFile> {
        let (mut archives, others): (Vec<_>, Vec<_>) = files
            .iter()
            .filter(|file| self.classifier.should_inspect(file))
            .partition(|file| self.classifier.is_archive(file));
        archives.extend(others);
        archives.truncate(self.inspect_limit);
        archives
    }

    /// Inspect every selected file concurrently, as far as the pool allows
    pub async fn inspect(
        &self,
        pool: &Arc<ConnectionPool>,
        files: &[ManifestFile],
        deadline: Instant,
        metrics: &CommandMetrics,
    ) -> Vec<ArchiveFinding> {
        let selected = self.select(files);
        join_all(
            selected
                .into_iter()
                .map(|file| self.inspect_file(pool, file, deadline, metrics)),
        )
        .await
    }

    async fn inspect_file(
        &self,
        pool: &Arc<ConnectionPool>,
        file: &ManifestFile,
        deadline: Instant,
        metrics: &CommandMetrics,
    ) -> ArchiveFinding {
        let span = self.span_indices(file);
        let mut budget = DecodeBudget::new(self.max_decoded_bytes, span.len());

        let check = match file.segments.first() {
            None => HeaderCheck::with_details(ArchiveStatus::SegmentMissing, "file has no segments"),
            Some(first) => {
                match fetch_segment(pool, first, budget.for_headers(), deadline, metrics).await {
                    Fetched::Decoded(head) => {
                        budget.spend(head.data.len());
                        let check = self
                            .check_head(pool, file, &head.data, &mut budget, deadline, metrics)
                            .await;
                        if check.status.is_positive() && !span.is_empty() {
                            self.verify_span(pool, file, &span, &budget, deadline, metrics)
                                .await
                                .unwrap_or(check)
                        } else {
                            check
                        }
                    }
                    Fetched::Missing => HeaderCheck::new(ArchiveStatus::SegmentMissing),
                    Fetched::Failed(e) => {
                        HeaderCheck::with_details(ArchiveStatus::SegmentError, e.to_string())
                    }
                    Fetched::Undecodable(reason) => {
                        HeaderCheck::with_details(ArchiveStatus::DecodeError, reason)
                    }
                }
            }
        };

        tracing::debug!(
            file = %file.filename,
            status = ?check.status,
            details = ?check.details,
            unspent_bytes = budget.remaining,
            "archive inspection finished"
        );

        ArchiveFinding {
            status: check.status,
            filename: Some(file.filename.clone()),
            subject: file.subject.clone(),
            details: check.details,
        }
    }

    /// Segments fetched beyond the first to check that the archive spans intact
    fn span_indices(&self, file: &ManifestFile) -> Vec<usize> {
        select_sample_indices(file.segments.len(), self.archive_sample_count)
            .into_iter()
            .filter(|index| *index != 0)
            .collect()
    }

    async fn check_head(
        &self,
        pool: &Arc<ConnectionPool>,
        file: &ManifestFile,
        head: &[u8],
        budget: &mut DecodeBudget,
        deadline: Instant,
        metrics: &CommandMetrics,
    ) -> HeaderCheck {
        match self.classifier.sniff(head) {
            None if self.classifier.is_archive(file) => {
                HeaderCheck::new(ArchiveStatus::UnknownSignature)
            }
            None => HeaderCheck::new(ArchiveStatus::SegmentOk),
            Some(ContainerKind::Rar4) => rar::inspect_rar4(head),
            Some(ContainerKind::Rar5) => rar::inspect_rar5(head),
            Some(ContainerKind::Zip) => zip::inspect_zip(head),
            Some(ContainerKind::SevenZip) => {
                self.check_sevenz(pool, file, head, budget, deadline, metrics)
                    .await
            }
        }
    }

    /// The 7z coder list lives in the next header at the end of the archive; read
    /// it from the head when it fits, else from the file's last segment when that
    /// segment fits in what is left of the budget.
    async fn check_sevenz(
        &self,
        pool: &Arc<ConnectionPool>,
        file: &ManifestFile,
        head: &[u8],
        budget: &mut DecodeBudget,
        deadline: Instant,
        metrics: &CommandMetrics,
    ) -> HeaderCheck {
        let location = match sevenz::parse_signature_header(head) {
            Ok(location) => location,
            Err(check) => return check,
        };
        let Some(end) = location.offset.checked_add(location.size) else {
            return HeaderCheck::corrupt("next header size overflows");
        };

        if let Some(header) = slice_at(head, 0, location.offset, end) {
            return sevenz::inspect_next_header(header, location.crc);
        }

        let not_sampled =
            || HeaderCheck::with_details(ArchiveStatus::SevenZipUnverified, "next header not sampled");
        let Some(last) = file.segments.last().filter(|_| file.segments.len() > 1) else {
            return not_sampled();
        };

        match fetch_segment(pool, last, budget.for_headers(), deadline, metrics).await {
            Fetched::Decoded(tail) => {
                budget.spend(tail.data.len());
                match slice_at(&tail.data, tail.offset, location.offset, end) {
                    Some(header) => sevenz::inspect_next_header(header, location.crc),
                    None => not_sampled(),
                }
            }
            Fetched::Missing => HeaderCheck::with_details(
                ArchiveStatus::ArchiveIncomplete,
                format!("segment {} missing", last.number),
            ),
            Fetched::Failed(e) => {
                HeaderCheck::with_details(ArchiveStatus::SevenZipUnverified, e.to_string())
            }
            Fetched::Undecodable(reason) => {
                HeaderCheck::with_details(ArchiveStatus::DecodeError, reason)
            }
        }
    }

    /// Fetch a few more segments of a positively identified archive. Returns a
    /// replacement check when one of them is gone or broken.
    async fn verify_span(
        &self,
        pool: &Arc<ConnectionPool>,
        file: &ManifestFile,
        indices: &[usize],
        budget: &DecodeBudget,
        deadline: Instant,
        metrics: &CommandMetrics,
    ) -> Option<HeaderCheck> {
        if budget.per_sample == 0 {
            tracing::debug!(file = %file.filename, "no decode budget left for spanning samples");
            return None;
        }

        let fetches = indices.iter().map(|index| {
            let segment = &file.segments[*index];
            async move {
                let fetched = fetch_segment(pool, segment, budget.per_sample, deadline, metrics).await;
                (segment, fetched)
            }
        });

        for (segment, fetched) in join_all(fetches).await {
            match fetched {
                Fetched::Decoded(_) => {}
                Fetched::Missing => {
                    return Some(HeaderCheck::with_details(
                        ArchiveStatus::ArchiveIncomplete,
                        format!("segment {} missing", segment.number),
                    ));
                }
                Fetched::Undecodable(reason) => {
                    return Some(HeaderCheck::with_details(ArchiveStatus::DecodeError, reason));
                }
                // Transport trouble says nothing about the archive itself.
                Fetched::Failed(e) => {
                    tracing::debug!(
                        message_id = %segment.message_id,
                        error = %e,
                        "spanning sample failed"
                    );
                }
            }
        }
        None
    }
}

/// `data` holds file bytes starting at `data_offset`; return `[start, end)` of the
/// file when it lies entirely inside
fn slice_at(data: &[u8], data_offset: u64, start: u64, end: u64) -> Option<&[u8]> {
    let from = usize::try_from(start.checked_sub(data_offset)?).ok()?;
    let to = usize::try_from(end.checked_sub(data_offset)?).ok()?;
    data.get(from..to)
}

/// Length of the leading `=ybegin` / `=ypart` lines
fn framing_len(raw: &[u8]) -> usize {
    let mut end = 0;
    for keyword in [b"=ybegin ".as_slice(), b"=ypart ".as_slice()] {
        if !raw[end..].starts_with(keyword) {
            break;
        }
        match raw[end..].iter().position(|b| *b == b'\n') {
            Some(pos) => end += pos + 1,
            None => return raw.len(),
        }
    }
    end
}

/// Decode a yEnc body so that at most `budget` bytes come out. Data past the budget,
/// or a body cut short on the wire, is closed off with a bare trailer.
fn decode_within(body: ArticleBody, budget: usize) -> nntp_rs::Result<YencDecoded> {
    let mut raw = body.data;
    let framing = framing_len(&raw);
    if body.complete && raw.len() - framing <= budget {
        return nntp_rs::yenc_decode(&raw);
    }

    let mut keep = raw.len().min(framing + budget);
    // `=` only ever starts an escape pair; never keep half of one.
    if keep > framing && raw[keep - 1] == b'=' {
        keep -= 1;
    }
    raw.truncate(keep);
    // A trailer cut in half would read as data.
    let last_line = raw[framing..]
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(framing, |pos| framing + pos + 1);
    if raw[last_line..].starts_with(b"=y") {
        raw.truncate(last_line);
    }
    if !raw.ends_with(b"\n") {
        raw.extend_from_slice(b"\r\n");
    }
    raw.extend_from_slice(b"=yend size=0\r\n");
    nntp_rs::yenc_decode(&raw)
}

async fn fetch_segment(
    pool: &Arc<ConnectionPool>,
    segment: &Segment,
    budget: usize,
    deadline: Instant,
    metrics: &CommandMetrics,
) -> Fetched {
    let command = Command::Body(
        &segment.message_id,
        budget.saturating_add(YENC_FRAMING_BYTES),
    );
    let reply = sampler::execute(pool, deadline, command, metrics).await;
    settle(reply, segment, budget, metrics)
}

fn settle(reply: Result<Reply>, segment: &Segment, budget: usize, metrics: &CommandMetrics) -> Fetched {
    match reply {
        Ok(Reply::Body(body)) => match decode_within(body, budget) {
            Ok(decoded) => {
                metrics.record_decoded(decoded.data.len());
                let offset = decoded
                    .part
                    .as_ref()
                    .map(|p| p.begin.saturating_sub(1))
                    .unwrap_or(0);
                Fetched::Decoded(DecodedSegment {
                    data: decoded.data,
                    offset,
                })
            }
            Err(e) => Fetched::Undecodable(e.to_string()),
        },
        Ok(Reply::Missing) => Fetched::Missing,
        Ok(Reply::Present) => Fetched::Failed(Error::Nntp(format!(
            "BODY {} answered like STAT",
            segment.message_id
        ))),
        Err(e) => Fetched::Failed(e),
    }
}
