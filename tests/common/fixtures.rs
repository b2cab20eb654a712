//! NZB fixtures and test content generators

use serde_json::{Value, json};

const YENC_LINE: usize = 128;

/// A manifest that is not XML at all, as served by indexers behind a login wall
pub const LOGIN_PAGE: &str = "<html><body>Please log in</body></html>";

/// Encode `data` as a single-part yEnc article body
pub fn generate_yenc_content(data: &[u8], filename: &str) -> Vec<u8> {
    let mut result = format!(
        "=ybegin line={} size={} name={}\r\n",
        YENC_LINE,
        data.len(),
        filename
    )
    .into_bytes();

    let mut col = 0usize;
    for (i, &byte) in data.iter().enumerate() {
        let encoded = byte.wrapping_add(42);
        let at_edge = col == 0 || col + 1 >= YENC_LINE || i + 1 == data.len();
        let escape = matches!(encoded, 0x00 | 0x0A | 0x0D | 0x3D)
            || (matches!(encoded, b'\t' | b' ') && at_edge)
            || (encoded == b'.' && col == 0);
        if escape {
            result.push(b'=');
            result.push(encoded.wrapping_add(64));
            col += 2;
        } else {
            result.push(encoded);
            col += 1;
        }
        if col >= YENC_LINE {
            result.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        result.extend_from_slice(b"\r\n");
    }

    let footer = format!(
        "=yend size={} crc32={:08x}\r\n",
        data.len(),
        crc32fast::hash(data)
    );
    result.extend_from_slice(footer.as_bytes());
    result
}

fn push_rar4_block(out: &mut Vec<u8>, block: &[u8]) {
    let crc = (crc32fast::hash(block) & 0xffff) as u16;
    out.extend(crc.to_le_bytes());
    out.extend_from_slice(block);
}

/// First bytes of a RAR 4.x volume whose single member uses `method` (0x30 = stored)
pub fn rar4_volume_head(member: &str, method: u8) -> Vec<u8> {
    let mut out = b"Rar!\x1a\x07\x00".to_vec();

    let mut main = vec![0x73];
    main.extend(0u16.to_le_bytes());
    main.extend(13u16.to_le_bytes());
    main.extend([0u8; 6]);
    push_rar4_block(&mut out, &main);

    let mut file = vec![0x74];
    file.extend(0x8000u16.to_le_bytes());
    file.extend(((32 + member.len()) as u16).to_le_bytes());
    file.extend(0u32.to_le_bytes());
    file.extend(0u32.to_le_bytes());
    file.push(2);
    file.extend(0u32.to_le_bytes());
    file.extend(0u32.to_le_bytes());
    file.push(29);
    file.push(method);
    file.extend((member.len() as u16).to_le_bytes());
    file.extend(0x20u32.to_le_bytes());
    file.extend(member.as_bytes());
    push_rar4_block(&mut out, &file);

    out
}

/// Message id of segment `number` (1-based) of `filename`
pub fn segment_id(filename: &str, number: usize) -> String {
    format!("{}-{}@nzb-triage.test", filename, number)
}

/// NZB document whose files are `(filename, segment count)` pairs
pub fn create_nzb(title: &str, files: &[(&str, usize)]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
"#,
    );
    xml.push_str(&format!(
        "  <head>\n    <meta type=\"title\">{}</meta>\n  </head>\n",
        title
    ));
    for (filename, segments) in files {
        xml.push_str(&format!(
            "  <file poster=\"test@example.com\" date=\"1700000000\" subject=\"{} [1/1] - &quot;{}&quot; yEnc (1/{})\">\n",
            title, filename, segments
        ));
        xml.push_str("    <groups>\n      <group>alt.binaries.test</group>\n    </groups>\n");
        xml.push_str("    <segments>\n");
        for n in 1..=*segments {
            xml.push_str(&format!(
                "      <segment bytes=\"768000\" number=\"{}\">{}</segment>\n",
                n,
                segment_id(filename, n)
            ));
        }
        xml.push_str("    </segments>\n  </file>\n");
    }
    xml.push_str("</nzb>\n");
    xml
}

/// A multi-volume RAR release: `volumes` files of `segments` segments each
pub fn rar_release(title: &str, volumes: usize, segments: usize) -> (String, Vec<String>) {
    let names: Vec<String> = (1..=volumes)
        .map(|v| format!("{}.part{:02}.rar", title, v))
        .collect();
    let files: Vec<(&str, usize)> = names.iter().map(|n| (n.as_str(), segments)).collect();
    (create_nzb(title, &files), names)
}

/// One raw search result in the aggregator's JSON shape
pub fn search_result(url: &str, title: &str, size: u64, indexer: &str) -> Value {
    json!({
        "downloadUrl": url,
        "title": title,
        "size": size,
        "indexer": indexer,
    })
}
