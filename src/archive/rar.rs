//! RAR 4.x and RAR 5 header walking.
//!
//! Only the block headers up to the first file entry are read. The first file
//! entry decides the verdict: stored members can be streamed straight out of the
//! volume set, compressed or encrypted ones cannot.

use super::{ByteReader, HeaderCheck, RAR4_SIGNATURE, RAR5_SIGNATURE};
use crate::types::ArchiveStatus;

/// Upper bound on blocks walked before giving up on finding a file entry
const MAX_BLOCKS: usize = 64;

// RAR 4.x block types
const RAR4_MAIN_HEAD: u8 = 0x73;
const RAR4_FILE_HEAD: u8 = 0x74;
const RAR4_END_ARCHIVE: u8 = 0x7b;

// RAR 4.x flags
const MHD_PASSWORD: u16 = 0x0080;
const LHD_PASSWORD: u16 = 0x0004;
const LHD_LARGE: u16 = 0x0100;
const LHD_UNICODE: u16 = 0x0200;
const LHD_DIRECTORY_MASK: u16 = 0x00e0;
const LONG_BLOCK: u16 = 0x8000;

const RAR4_METHOD_STORE: u8 = 0x30;

// RAR 5 header types
const RAR5_FILE: u64 = 2;
const RAR5_ENCRYPTION: u64 = 4;
const RAR5_END: u64 = 5;

// RAR 5 flags
const HFL_EXTRA: u64 = 0x0001;
const HFL_DATA: u64 = 0x0002;
const FHFL_DIRECTORY: u64 = 0x0001;
const FHFL_UTIME: u64 = 0x0002;
const FHFL_CRC32: u64 = 0x0004;
const FHEXTRA_CRYPT: u64 = 0x01;

const RAR5_MAX_HEADER: u64 = 2 * 1024 * 1024;

struct Rar4Block {
    kind: u8,
    flags: u16,
    end: usize,
    add_size: u64,
}

fn read_rar4_block(data: &[u8], pos: usize) -> Result<Rar4Block, HeaderCheck> {
    let mut reader = ByteReader::at(data, pos);
    let (Some(crc), Some(kind), Some(flags), Some(size)) =
        (reader.u16(), reader.u8(), reader.u16(), reader.u16())
    else {
        return Err(HeaderCheck::truncated());
    };

    let size = usize::from(size);
    if size < 7 {
        return Err(HeaderCheck::corrupt(format!("block header size {} too small", size)));
    }
    let end = pos + size;
    let Some(header) = data.get(pos..end) else {
        return Err(HeaderCheck::truncated());
    };

    let computed = crc32fast::hash(&header[2..]) & 0xffff;
    if computed != u32::from(crc) {
        return Err(HeaderCheck::corrupt(format!(
            "block 0x{:02x} header CRC mismatch",
            kind
        )));
    }

    let add_size = if flags & LONG_BLOCK != 0 && size >= 11 {
        ByteReader::at(header, 7).u32().map(u64::from).unwrap_or(0)
    } else {
        0
    };

    Ok(Rar4Block {
        kind,
        flags,
        end,
        add_size,
    })
}

struct Rar4File {
    name: String,
    method: u8,
    packed: u64,
}

fn parse_rar4_file(header: &[u8], flags: u16) -> Option<Rar4File> {
    let mut reader = ByteReader::at(header, 7);
    let pack_low = reader.u32()?;
    reader.skip(4 + 1 + 4 + 4 + 1)?; // unpacked size, host os, file crc, mtime, version
    let method = reader.u8()?;
    let name_len = usize::from(reader.u16()?);
    reader.skip(4)?; // attributes
    let pack_high = if flags & LHD_LARGE != 0 {
        let high = reader.u32()?;
        reader.skip(4)?;
        high
    } else {
        0
    };
    let raw_name = reader.bytes(name_len)?;
    let raw_name = if flags & LHD_UNICODE != 0 {
        raw_name.split(|b| *b == 0).next().unwrap_or(raw_name)
    } else {
        raw_name
    };

    Some(Rar4File {
        name: String::from_utf8_lossy(raw_name).into_owned(),
        method,
        packed: (u64::from(pack_high) << 32) | u64::from(pack_low),
    })
}

/// Walk a RAR 4.x volume up to its first non-directory file entry
pub(crate) fn inspect_rar4(data: &[u8]) -> HeaderCheck {
    let mut pos = RAR4_SIGNATURE.len();

    for _ in 0..MAX_BLOCKS {
        let block = match read_rar4_block(data, pos) {
            Ok(block) => block,
            Err(check) => return check,
        };

        match block.kind {
            RAR4_MAIN_HEAD if block.flags & MHD_PASSWORD != 0 => {
                return HeaderCheck::with_details(ArchiveStatus::RarEncrypted, "encrypted headers");
            }
            RAR4_FILE_HEAD => {
                let Some(file) = parse_rar4_file(&data[pos..block.end], block.flags) else {
                    return HeaderCheck::corrupt("file header shorter than its fields");
                };
                if block.flags & LHD_DIRECTORY_MASK == LHD_DIRECTORY_MASK {
                    pos = block.end.saturating_add(file.packed as usize);
                    continue;
                }
                if block.flags & LHD_PASSWORD != 0 {
                    return HeaderCheck::with_details(ArchiveStatus::RarEncrypted, file.name);
                }
                let status = if file.method == RAR4_METHOD_STORE {
                    ArchiveStatus::RarStored
                } else {
                    ArchiveStatus::RarCompressed
                };
                return HeaderCheck::with_details(status, file.name);
            }
            RAR4_END_ARCHIVE => return HeaderCheck::corrupt("archive has no file entries"),
            _ => {
                pos = block.end.saturating_add(block.add_size as usize);
            }
        }
    }

    HeaderCheck::truncated()
}

/// Walk a RAR 5 volume up to its first non-directory file entry
pub(crate) fn inspect_rar5(data: &[u8]) -> HeaderCheck {
    let mut pos = RAR5_SIGNATURE.len();

    for _ in 0..MAX_BLOCKS {
        let mut reader = ByteReader::at(data, pos);
        let Some(crc) = reader.u32() else {
            return HeaderCheck::truncated();
        };
        let size_start = reader.position();
        let Some(header_size) = reader.vint() else {
            return HeaderCheck::truncated();
        };
        if header_size == 0 || header_size > RAR5_MAX_HEADER {
            return HeaderCheck::corrupt(format!("implausible header size {}", header_size));
        }
        let header_start = reader.position();
        let end = header_start + header_size as usize;
        let Some(covered) = data.get(size_start..end) else {
            return HeaderCheck::truncated();
        };
        if crc32fast::hash(covered) != crc {
            return HeaderCheck::corrupt("header CRC mismatch");
        }

        let mut header = ByteReader::at(&data[..end], header_start);
        let Some(parsed) = parse_rar5_common(&mut header) else {
            return HeaderCheck::corrupt("header shorter than its fields");
        };

        match parsed.kind {
            RAR5_ENCRYPTION => {
                return HeaderCheck::with_details(ArchiveStatus::RarEncrypted, "encrypted headers");
            }
            RAR5_FILE => {
                let extra_start = end.saturating_sub(parsed.extra_size as usize);
                let Some(file) = parse_rar5_file(&mut header, &data[..end], extra_start) else {
                    return HeaderCheck::corrupt("file header shorter than its fields");
                };
                if file.encrypted {
                    return HeaderCheck::with_details(ArchiveStatus::RarEncrypted, file.name);
                }
                if file.directory {
                    pos = end.saturating_add(parsed.data_size as usize);
                    continue;
                }
                let status = if file.method == 0 {
                    ArchiveStatus::RarStored
                } else {
                    ArchiveStatus::RarCompressed
                };
                return HeaderCheck::with_details(status, file.name);
            }
            RAR5_END => return HeaderCheck::corrupt("archive has no file entries"),
            _ => {
                pos = end.saturating_add(parsed.data_size as usize);
            }
        }
    }

    HeaderCheck::truncated()
}

struct Rar5Common {
    kind: u64,
    extra_size: u64,
    data_size: u64,
}

fn parse_rar5_common(reader: &mut ByteReader<'_>) -> Option<Rar5Common> {
    let kind = reader.vint()?;
    let flags = reader.vint()?;
    let extra_size = if flags & HFL_EXTRA != 0 { reader.vint()? } else { 0 };
    let data_size = if flags & HFL_DATA != 0 { reader.vint()? } else { 0 };
    Some(Rar5Common {
        kind,
        extra_size,
        data_size,
    })
}

struct Rar5File {
    name: String,
    method: u64,
    directory: bool,
    encrypted: bool,
}

fn parse_rar5_file(reader: &mut ByteReader<'_>, header: &[u8], extra_start: usize) -> Option<Rar5File> {
    let file_flags = reader.vint()?;
    reader.vint()?; // unpacked size
    reader.vint()?; // attributes
    if file_flags & FHFL_UTIME != 0 {
        reader.skip(4)?;
    }
    if file_flags & FHFL_CRC32 != 0 {
        reader.skip(4)?;
    }
    let compression = reader.vint()?;
    reader.vint()?; // host os
    let name_len = reader.vint()? as usize;
    let name = String::from_utf8_lossy(reader.bytes(name_len)?).into_owned();

    let mut encrypted = false;
    let mut extra = ByteReader::at(header, extra_start.max(reader.position()));
    while extra.remaining() > 0 {
        let record_size = extra.vint()? as usize;
        let record_start = extra.position();
        let record_type = extra.vint()?;
        if record_type == FHEXTRA_CRYPT {
            encrypted = true;
        }
        extra = ByteReader::at(header, record_start.checked_add(record_size)?);
    }

    Some(Rar5File {
        name,
        method: (compression >> 7) & 0x07,
        directory: file_flags & FHFL_DIRECTORY != 0,
        encrypted,
    })
}
