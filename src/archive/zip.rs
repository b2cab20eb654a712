//! ZIP local file header inspection.

use super::{ByteReader, HeaderCheck, ZIP_SIGNATURE};
use crate::types::ArchiveStatus;

const LOCAL_HEADER_LEN: usize = 30;
const FLAG_ENCRYPTED: u16 = 0x0001;
const METHOD_STORED: u16 = 0;
const METHOD_AES: u16 = 99;

/// Classify the first non-directory entry found in the head buffer
pub(crate) fn inspect_zip(head: &[u8]) -> HeaderCheck {
    let mut pos = 0usize;

    loop {
        let Some(header) = head.get(pos..) else {
            return HeaderCheck::truncated();
        };
        if header.len() < LOCAL_HEADER_LEN {
            return HeaderCheck::truncated();
        }
        if !header.starts_with(ZIP_SIGNATURE) {
            return HeaderCheck::corrupt("missing local file header");
        }

        let mut reader = ByteReader::at(header, 6);
        let (Some(flags), Some(method)) = (reader.u16(), reader.u16()) else {
            return HeaderCheck::truncated();
        };
        let mut reader = ByteReader::at(header, 18);
        let (Some(compressed_size), Some(_), Some(name_len), Some(extra_len)) =
            (reader.u32(), reader.u32(), reader.u16(), reader.u16())
        else {
            return HeaderCheck::truncated();
        };
        let name = reader
            .bytes(usize::from(name_len))
            .map(|n| String::from_utf8_lossy(n).into_owned());

        if let Some(name) = &name
            && name.ends_with('/')
            && compressed_size == 0
        {
            pos += LOCAL_HEADER_LEN + usize::from(name_len) + usize::from(extra_len);
            continue;
        }

        let status = if flags & FLAG_ENCRYPTED != 0 || method == METHOD_AES {
            ArchiveStatus::ZipEncrypted
        } else if method == METHOD_STORED {
            ArchiveStatus::ZipStored
        } else {
            ArchiveStatus::ZipCompressed
        };

        return match (status, name) {
            (ArchiveStatus::ZipCompressed, Some(name)) => {
                HeaderCheck::with_details(status, format!("{} (method {})", name, method))
            }
            (ArchiveStatus::ZipCompressed, None) => {
                HeaderCheck::with_details(status, format!("method {}", method))
            }
            (_, Some(name)) => HeaderCheck::with_details(status, name),
            (_, None) => HeaderCheck::new(status),
        };
    }
}
