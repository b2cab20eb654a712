//! Archive container recognition and header inspection.
//!
//! Which files count as archives, and which byte signatures identify a container,
//! is a pluggable policy ([`ArchiveClassifier`]). The parsers themselves only ever
//! look at the first decoded bytes of a file (plus, for 7z, the tail holding the
//! next header) and never decompress anything.

mod inspector;
mod rar;
mod sevenz;
mod zip;

pub use inspector::ArchiveInspector;

use crate::nzb::{FileKind, ManifestFile};
use crate::types::ArchiveStatus;
use std::path::PathBuf;

pub(crate) const RAR4_SIGNATURE: &[u8] = b"Rar!\x1a\x07\x00";
pub(crate) const RAR5_SIGNATURE: &[u8] = b"Rar!\x1a\x07\x01\x00";
pub(crate) const SEVENZ_SIGNATURE: &[u8] = &[0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c];
pub(crate) const ZIP_SIGNATURE: &[u8] = b"PK\x03\x04";

/// Container format identified from leading bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerKind {
    /// RAR 1.5 - 4.x
    Rar4,
    /// RAR 5.0+
    Rar5,
    /// 7-Zip
    SevenZip,
    /// PKZIP
    Zip,
}

/// Decides which files are inspected and how their leading bytes are identified
pub trait ArchiveClassifier: Send + Sync {
    /// Whether the file is named like the head of an archive container
    fn is_archive(&self, file: &ManifestFile) -> bool;

    /// Whether the file's first segment should be fetched and inspected at all
    fn should_inspect(&self, file: &ManifestFile) -> bool;

    /// Identify a container from the first decoded bytes
    fn sniff(&self, head: &[u8]) -> Option<ContainerKind>;
}

/// Built-in policy: RAR first volumes, `.7z`/`.7z.001` and `.zip` by name; RAR4,
/// RAR5, 7z and ZIP by signature. Obfuscated payload files are inspected too.
#[derive(Clone, Debug, Default)]
pub struct DefaultArchivePolicy {
    archive_dirs: Vec<PathBuf>,
}

impl DefaultArchivePolicy {
    /// Create the policy, carrying any configured archive locations
    pub fn new(archive_dirs: Vec<PathBuf>) -> Self {
        Self { archive_dirs }
    }

    /// Configured archive locations (not consulted by the built-in rules)
    pub fn archive_dirs(&self) -> &[PathBuf] {
        &self.archive_dirs
    }
}

impl ArchiveClassifier for DefaultArchivePolicy {
    fn is_archive(&self, file: &ManifestFile) -> bool {
        file.kind.is_archive_head()
    }

    fn should_inspect(&self, file: &ManifestFile) -> bool {
        file.kind.is_archive_head() || file.kind == FileKind::Payload
    }

    fn sniff(&self, head: &[u8]) -> Option<ContainerKind> {
        if head.starts_with(RAR5_SIGNATURE) {
            Some(ContainerKind::Rar5)
        } else if head.starts_with(RAR4_SIGNATURE) {
            Some(ContainerKind::Rar4)
        } else if head.starts_with(SEVENZ_SIGNATURE) {
            Some(ContainerKind::SevenZip)
        } else if head.starts_with(ZIP_SIGNATURE) {
            Some(ContainerKind::Zip)
        } else {
            None
        }
    }
}

/// Result of parsing one container header
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct HeaderCheck {
    pub status: ArchiveStatus,
    pub details: Option<String>,
}

impl HeaderCheck {
    pub fn new(status: ArchiveStatus) -> Self {
        Self {
            status,
            details: None,
        }
    }

    pub fn with_details(status: ArchiveStatus, details: impl Into<String>) -> Self {
        Self {
            status,
            details: Some(details.into()),
        }
    }

    pub fn truncated() -> Self {
        Self::new(ArchiveStatus::HeaderTruncated)
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::with_details(ArchiveStatus::HeaderCorrupt, reason)
    }
}

/// Little-endian cursor over a header buffer; every read fails cleanly past the end
#[derive(Clone, Debug)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    pub fn skip(&mut self, len: usize) -> Option<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.bytes(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(|b| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(b);
            u64::from_le_bytes(buf)
        })
    }

    /// RAR5 variable-length integer: 7 bits per byte, high bit = continuation
    pub fn vint(&mut self) -> Option<u64> {
        let mut value: u64 = 0;
        for shift in (0..70).step_by(7) {
            let byte = self.u8()?;
            if shift < 64 {
                value |= u64::from(byte & 0x7f) << shift;
            }
            if byte & 0x80 == 0 {
                return Some(value);
            }
        }
        None
    }
}
