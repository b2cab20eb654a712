//! 7z signature header and plain (unencoded) next-header parsing.
//!
//! The 32-byte signature header at the start of the archive points at the "next
//! header" near the end of the file. Only that header lists the coders, so the
//! inspector fetches the tail segment and hands the slice to
//! [`inspect_next_header`]. Archives whose next header is itself compressed
//! (`kEncodedHeader`) cannot be judged without decompressing and stay unverified.

use super::{ByteReader, HeaderCheck};
use crate::types::ArchiveStatus;

pub(crate) const SIGNATURE_HEADER_LEN: usize = 32;

const K_END: u64 = 0x00;
const K_HEADER: u64 = 0x01;
const K_ARCHIVE_PROPERTIES: u64 = 0x02;
const K_ADDITIONAL_STREAMS_INFO: u64 = 0x03;
const K_MAIN_STREAMS_INFO: u64 = 0x04;
const K_FILES_INFO: u64 = 0x05;
const K_PACK_INFO: u64 = 0x06;
const K_UNPACK_INFO: u64 = 0x07;
const K_SUBSTREAMS_INFO: u64 = 0x08;
const K_SIZE: u64 = 0x09;
const K_CRC: u64 = 0x0a;
const K_FOLDER: u64 = 0x0b;
const K_ENCODED_HEADER: u8 = 0x17;

const CODER_COPY: &[u8] = &[0x00];
const CODER_AES: &[u8] = &[0x06, 0xf1, 0x07, 0x01];

const MAX_FOLDERS: u64 = 1024;
const MAX_CODERS: u64 = 64;

/// Location of the next header, taken from a verified signature header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NextHeaderLocation {
    /// Absolute offset from the start of the archive
    pub offset: u64,
    pub size: u64,
    pub crc: u32,
}

/// Parse and verify the signature header
pub(crate) fn parse_signature_header(head: &[u8]) -> Result<NextHeaderLocation, HeaderCheck> {
    if head.len() < SIGNATURE_HEADER_LEN {
        return Err(HeaderCheck::truncated());
    }

    let mut reader = ByteReader::at(head, 8);
    let (Some(start_crc), Some(offset), Some(size), Some(crc)) =
        (reader.u32(), reader.u64(), reader.u64(), reader.u32())
    else {
        return Err(HeaderCheck::truncated());
    };

    if crc32fast::hash(&head[12..SIGNATURE_HEADER_LEN]) != start_crc {
        return Err(HeaderCheck::corrupt("start header CRC mismatch"));
    }
    if size == 0 {
        return Err(HeaderCheck::with_details(
            ArchiveStatus::SevenZipUnverified,
            "archive has no header",
        ));
    }
    let Some(offset) = offset.checked_add(SIGNATURE_HEADER_LEN as u64) else {
        return Err(HeaderCheck::corrupt("next header offset overflows"));
    };

    Ok(NextHeaderLocation { offset, size, crc })
}

/// Classify the archive from its next header bytes
pub(crate) fn inspect_next_header(header: &[u8], expected_crc: u32) -> HeaderCheck {
    if crc32fast::hash(header) != expected_crc {
        return HeaderCheck::corrupt("next header CRC mismatch");
    }

    match header.first() {
        Some(&K_ENCODED_HEADER) => {
            return HeaderCheck::with_details(ArchiveStatus::SevenZipUnverified, "encoded header");
        }
        Some(&b) if u64::from(b) == K_HEADER => {}
        _ => return HeaderCheck::corrupt("unknown next header type"),
    }

    let mut reader = ByteReader::at(header, 1);
    match read_coders(&mut reader) {
        Ok(coders) => classify_coders(&coders),
        Err(reason) => HeaderCheck::with_details(ArchiveStatus::SevenZipUnverified, reason),
    }
}

fn classify_coders(coders: &[Vec<u8>]) -> HeaderCheck {
    if coders.is_empty() {
        return HeaderCheck::with_details(ArchiveStatus::SevenZipUnverified, "no packed streams");
    }
    if coders.iter().any(|id| id == CODER_AES) {
        return HeaderCheck::new(ArchiveStatus::SevenZipEncrypted);
    }
    match coders.iter().find(|id| id.as_slice() != CODER_COPY) {
        None => HeaderCheck::new(ArchiveStatus::SevenZipStored),
        Some(id) => HeaderCheck::with_details(
            ArchiveStatus::SevenZipCompressed,
            format!("coder {}", hex(id)),
        ),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Walk the header down to the folder list and collect every coder id
fn read_coders(reader: &mut ByteReader<'_>) -> Result<Vec<Vec<u8>>, &'static str> {
    const SHORT: &str = "header ended unexpectedly";

    loop {
        match read_number(reader).ok_or(SHORT)? {
            K_END | K_FILES_INFO => return Ok(Vec::new()),
            K_ARCHIVE_PROPERTIES => skip_properties(reader).ok_or(SHORT)?,
            K_ADDITIONAL_STREAMS_INFO => return Err("additional streams are not supported"),
            K_MAIN_STREAMS_INFO => return read_streams_info(reader),
            _ => return Err("unexpected property in header"),
        }
    }
}

fn read_streams_info(reader: &mut ByteReader<'_>) -> Result<Vec<Vec<u8>>, &'static str> {
    const SHORT: &str = "streams info ended unexpectedly";

    loop {
        match read_number(reader).ok_or(SHORT)? {
            K_PACK_INFO => skip_pack_info(reader).ok_or(SHORT)?,
            K_UNPACK_INFO => {
                if read_number(reader).ok_or(SHORT)? != K_FOLDER {
                    return Err("unpack info without folder list");
                }
                let folders = read_number(reader).ok_or(SHORT)?;
                if folders > MAX_FOLDERS {
                    return Err("too many folders");
                }
                if reader.u8().ok_or(SHORT)? != 0 {
                    return Err("external folder list");
                }
                let mut coders = Vec::new();
                for _ in 0..folders {
                    read_folder(reader, &mut coders).ok_or(SHORT)?;
                }
                return Ok(coders);
            }
            K_SUBSTREAMS_INFO | K_END => return Ok(Vec::new()),
            _ => return Err("unexpected property in streams info"),
        }
    }
}

fn skip_pack_info(reader: &mut ByteReader<'_>) -> Option<()> {
    read_number(reader)?; // pack position
    let streams = read_number(reader)?;
    loop {
        match read_number(reader)? {
            K_SIZE => {
                for _ in 0..streams {
                    read_number(reader)?;
                }
            }
            K_CRC => skip_digests(reader, streams)?,
            K_END => return Some(()),
            _ => return None,
        }
    }
}

fn skip_digests(reader: &mut ByteReader<'_>, count: u64) -> Option<()> {
    let all_defined = reader.u8()?;
    let defined = if all_defined != 0 {
        count
    } else {
        let bits = reader.bytes(count.div_ceil(8) as usize)?;
        bits.iter()
            .map(|b| u64::from(b.count_ones()))
            .sum::<u64>()
            .min(count)
    };
    reader.skip((defined as usize).checked_mul(4)?)
}

fn skip_properties(reader: &mut ByteReader<'_>) -> Option<()> {
    loop {
        if read_number(reader)? == K_END {
            return Some(());
        }
        let size = read_number(reader)?;
        reader.skip(size as usize)?;
    }
}

fn read_folder(reader: &mut ByteReader<'_>, coders: &mut Vec<Vec<u8>>) -> Option<()> {
    let count = read_number(reader)?;
    if count == 0 || count > MAX_CODERS {
        return None;
    }

    let mut total_in: u64 = 0;
    let mut total_out: u64 = 0;
    for _ in 0..count {
        let flags = reader.u8()?;
        let id = reader.bytes(usize::from(flags & 0x0f))?;
        coders.push(id.to_vec());
        if flags & 0x10 != 0 {
            total_in += read_number(reader)?;
            total_out += read_number(reader)?;
        } else {
            total_in += 1;
            total_out += 1;
        }
        if flags & 0x20 != 0 {
            let size = read_number(reader)?;
            reader.skip(size as usize)?;
        }
    }

    let bind_pairs = total_out.checked_sub(1)?;
    for _ in 0..bind_pairs {
        read_number(reader)?;
        read_number(reader)?;
    }
    let packed = total_in.checked_sub(bind_pairs)?;
    if packed > 1 {
        for _ in 0..packed {
            read_number(reader)?;
        }
    }
    Some(())
}

/// 7z variable-length NUMBER: leading one bits in the first byte count extra bytes
pub(crate) fn read_number(reader: &mut ByteReader<'_>) -> Option<u64> {
    let first = reader.u8()?;
    let mut mask: u8 = 0x80;
    let mut value: u64 = 0;
    for i in 0..8 {
        if first & mask == 0 {
            let high = u64::from(first & mask.wrapping_sub(1));
            value |= high << (8 * i);
            return Some(value);
        }
        value |= u64::from(reader.u8()?) << (8 * i);
        mask >>= 1;
    }
    Some(value)
}
