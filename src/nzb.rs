//! Manifest parsing and file classification.
//!
//! A manifest is parsed once per triage call and never mutated afterwards. Parsing
//! failures are reported as [`Error::InvalidNzb`]; the engine turns them into a
//! `triage-error` decision instead of failing the call.

use crate::error::{Error, Result};

/// Parsed NZB manifest
#[derive(Clone, Debug)]
pub struct Manifest {
    /// Title from `<meta type="title">`, if present
    pub title: Option<String>,
    /// Files in document order
    pub files: Vec<ManifestFile>,
}

impl Manifest {
    /// Sum of declared segment sizes across all files
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(ManifestFile::total_bytes).sum()
    }
}

/// One file of a manifest
#[derive(Clone, Debug)]
pub struct ManifestFile {
    /// Raw subject line
    pub subject: String,
    /// Filename extracted from the subject (falls back to the subject itself)
    pub filename: String,
    /// Newsgroups the file was posted to
    pub groups: Vec<String>,
    /// Segments ordered by segment number
    pub segments: Vec<Segment>,
    /// Role of the file within the release
    pub kind: FileKind,
}

impl ManifestFile {
    /// Sum of declared segment sizes
    pub fn total_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }
}

/// One article of a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Message id without angle brackets
    pub message_id: String,
    /// Declared encoded size in bytes
    pub bytes: u64,
    /// 1-based segment number
    pub number: u32,
}

/// Role of a file within a release, derived from its name
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// `name.rar` or `name.part01.rar`
    RarFirstVolume,
    /// Any later RAR volume (`.partNN.rar`, `.rNN`)
    RarVolume,
    /// `.7z` or the first split `.7z.001`
    SevenZip,
    /// `.zip`
    Zip,
    /// PAR2 recovery data
    Par2,
    /// Small companion files (nfo, sfv, nzb, txt, srr, images)
    Auxiliary,
    /// Anything else: media or an obfuscated archive
    Payload,
}

impl FileKind {
    /// Classify a file by name
    pub fn from_filename(filename: &str) -> Self {
        let lower = filename.to_lowercase();
        if is_par2_file(&lower) {
            FileKind::Par2
        } else if is_first_rar_volume(&lower) {
            FileKind::RarFirstVolume
        } else if is_rar_file(&lower) {
            FileKind::RarVolume
        } else if lower.ends_with(".7z") || lower.ends_with(".7z.001") {
            FileKind::SevenZip
        } else if lower.ends_with(".zip") {
            FileKind::Zip
        } else if AUXILIARY_EXTENSIONS.iter().any(|ext| lower.ends_with(ext)) {
            FileKind::Auxiliary
        } else {
            FileKind::Payload
        }
    }

    /// Whether the name marks the file as the head of an archive container
    pub fn is_archive_head(&self) -> bool {
        matches!(
            self,
            FileKind::RarFirstVolume | FileKind::SevenZip | FileKind::Zip
        )
    }

    /// Whether misses in this file are never fatal on their own
    pub fn is_expendable(&self) -> bool {
        matches!(self, FileKind::Par2 | FileKind::Auxiliary)
    }
}

const AUXILIARY_EXTENSIONS: &[&str] = &[
    ".nfo", ".sfv", ".nzb", ".txt", ".srr", ".srs", ".jpg", ".jpeg", ".png", ".url",
];

/// Parse raw manifest bytes.
///
/// Fails on non-UTF-8 input, unparsable markup, a manifest without files, or any
/// segment lacking a message id.
pub fn parse_manifest(content: &[u8]) -> Result<Manifest> {
    let text = std::str::from_utf8(content)
        .map_err(|e| Error::InvalidNzb(format!("NZB content is not valid UTF-8: {}", e)))?;

    let nzb = nntp_rs::parse_nzb(text)
        .map_err(|e| Error::InvalidNzb(format!("Failed to parse NZB: {}", e)))?;

    nzb.validate()
        .map_err(|e| Error::InvalidNzb(format!("NZB validation failed: {}", e)))?;

    if nzb.files.is_empty() {
        return Err(Error::InvalidNzb("NZB contains no files".into()));
    }

    let title = nzb
        .meta
        .get("title")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut files = Vec::with_capacity(nzb.files.len());
    for file in &nzb.files {
        let mut segments = Vec::with_capacity(file.segments.len());
        for segment in &file.segments {
            let message_id = segment
                .message_id
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string();
            if message_id.is_empty() {
                return Err(Error::InvalidNzb(format!(
                    "segment {} of \"{}\" has no message id",
                    segment.number, file.subject
                )));
            }
            segments.push(Segment {
                message_id,
                bytes: segment.bytes as u64,
                number: segment.number as u32,
            });
        }
        segments.sort_by_key(|s| s.number);

        let filename = parse_filename_from_subject(&file.subject);
        let kind = FileKind::from_filename(&filename);
        files.push(ManifestFile {
            subject: file.subject.clone(),
            filename,
            groups: file.groups.clone(),
            segments,
            kind,
        });
    }

    Ok(Manifest { title, files })
}

/// Extract a filename from a Usenet subject line.
///
/// Subjects usually carry the filename in quotes, e.g.
/// `Some.Movie.2024 [01/50] - "Some.Movie.2024.part01.rar" yEnc (1/100)`.
/// Without quotes the subject is stripped of its yEnc part counter and used as is.
pub fn parse_filename_from_subject(subject: &str) -> String {
    if let Some(start) = subject.find('"')
        && let Some(end) = subject[start + 1..].find('"')
    {
        let filename = subject[start + 1..start + 1 + end].trim();
        if !filename.is_empty() {
            return filename.to_string();
        }
    }

    let trimmed = subject.trim();
    let without_counter = match trimmed.rfind(" yEnc") {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };
    without_counter.trim().to_string()
}

/// Check if a filename is the first volume of a RAR archive set.
///
/// `archive.rar` and `archive.part01.rar` (any zero padding) are first volumes;
/// `.partNN.rar` with NN > 1 and old-style `.rNN` never are.
pub(crate) fn is_first_rar_volume(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    let Some(stem) = lower.strip_suffix(".rar") else {
        return false;
    };

    if let Some(part_idx) = stem.rfind(".part") {
        let digits = &stem[part_idx + 5..];
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            return digits.parse::<u32>().map(|n| n == 1).unwrap_or(false);
        }
    }
    true
}

/// Check if a filename is any RAR volume.
pub(crate) fn is_rar_file(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    if lower.ends_with(".rar") {
        return true;
    }
    if let Some(dot) = lower.rfind('.') {
        let ext = &lower[dot + 1..];
        return ext.len() >= 3
            && ext.starts_with('r')
            && ext[1..].chars().all(|c| c.is_ascii_digit());
    }
    false
}

/// Check if a filename is a PAR2 file.
pub(crate) fn is_par2_file(filename: &str) -> bool {
    filename.to_lowercase().ends_with(".par2")
}
