//! Shared fixtures for unit tests: a scripted news server, yEnc and NZB builders,
//! and byte-exact archive headers.

use crate::error::{Error, Result};
use crate::nntp::{ArticleBody, ArticleStatus, Connector, NntpSession};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Mock news server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    all_present: AtomicBool,
    latency: Mutex<Duration>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    missing: Mutex<HashSet<String>>,
    stat_failures: Mutex<HashMap<String, usize>>,
    body_failures: Mutex<HashMap<String, usize>>,
    failing_connects: AtomicUsize,
    fail_pings: AtomicBool,
    connects: AtomicUsize,
    quits: AtomicUsize,
    pings: AtomicUsize,
    stat_calls: AtomicUsize,
    body_calls: AtomicUsize,
    body_bytes: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// In-memory article store behind the [`Connector`] seam.
///
/// Clones share state, so a test keeps one handle for scripting and assertions
/// while the pool owns another.
#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every article not explicitly marked missing exists
    pub fn with_all_present(self) -> Self {
        self.state.all_present.store(true, Ordering::SeqCst);
        self
    }

    /// Delay every STAT/BODY by `latency`
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = latency;
        self
    }

    pub fn set_body(&self, message_id: &str, body: Vec<u8>) {
        self.state
            .bodies
            .lock()
            .unwrap()
            .insert(message_id.to_string(), body);
    }

    pub fn mark_missing(&self, message_id: &str) {
        self.state
            .missing
            .lock()
            .unwrap()
            .insert(message_id.to_string());
    }

    /// The next `times` STATs for `message_id` fail at the transport level
    /// (`usize::MAX` = forever)
    pub fn fail_stat(&self, message_id: &str, times: usize) {
        self.state
            .stat_failures
            .lock()
            .unwrap()
            .insert(message_id.to_string(), times);
    }

    /// Like [`fail_stat`](Self::fail_stat) for BODY
    pub fn fail_body(&self, message_id: &str, times: usize) {
        self.state
            .body_failures
            .lock()
            .unwrap()
            .insert(message_id.to_string(), times);
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.state.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn quits(&self) -> usize {
        self.state.quits.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    pub fn stat_calls(&self) -> usize {
        self.state.stat_calls.load(Ordering::SeqCst)
    }

    pub fn body_calls(&self) -> usize {
        self.state.body_calls.load(Ordering::SeqCst)
    }

    /// Article body bytes handed out across all sessions
    pub fn body_bytes_served(&self) -> usize {
        self.state.body_bytes.load(Ordering::SeqCst)
    }

    /// Highest number of commands that were running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn NntpSession>> {
        let failing = self.state.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.state
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            return Err(Error::Nntp("connection refused (scripted)".into()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockSession {
    state: Arc<MockState>,
}

fn strip_brackets(message_id: &str) -> &str {
    message_id.trim_start_matches('<').trim_end_matches('>')
}

/// Consume one scripted failure for `message_id`, if any are left
fn take_failure(failures: &Mutex<HashMap<String, usize>>, message_id: &str) -> bool {
    let mut failures = failures.lock().unwrap();
    match failures.get_mut(message_id) {
        Some(0) | None => false,
        Some(&mut usize::MAX) => true,
        Some(left) => {
            *left -= 1;
            true
        }
    }
}

impl MockSession {
    async fn enter(&self) {
        let now = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let latency = *self.state.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn leave(&self) {
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_missing(&self, message_id: &str) -> bool {
        self.state.missing.lock().unwrap().contains(message_id)
    }

    fn stat_now(&self, message_id: &str) -> Result<ArticleStatus> {
        if take_failure(&self.state.stat_failures, message_id) {
            return Err(Error::Nntp("connection reset (scripted)".into()));
        }
        let present = !self.is_missing(message_id)
            && (self.state.all_present.load(Ordering::SeqCst)
                || self.state.bodies.lock().unwrap().contains_key(message_id));
        Ok(if present {
            ArticleStatus::Present
        } else {
            ArticleStatus::Missing
        })
    }

    fn body_now(&self, message_id: &str) -> Result<Option<Vec<u8>>> {
        if take_failure(&self.state.body_failures, message_id) {
            return Err(Error::Nntp("connection reset (scripted)".into()));
        }
        if self.is_missing(message_id) {
            return Ok(None);
        }
        if let Some(body) = self.state.bodies.lock().unwrap().get(message_id) {
            return Ok(Some(body.clone()));
        }
        if self.state.all_present.load(Ordering::SeqCst) {
            return Ok(Some(yenc_single("segment.bin", &[0x11; 64])));
        }
        Ok(None)
    }
}

/// Keep whole lines of `data` up to `limit` bytes, as a real session reads them
fn cut_at_limit(mut data: Vec<u8>, limit: usize) -> ArticleBody {
    if data.len() <= limit {
        return ArticleBody {
            data,
            complete: true,
        };
    }
    let keep = data[..limit]
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    data.truncate(keep);
    ArticleBody {
        data,
        complete: false,
    }
}

#[async_trait]
impl NntpSession for MockSession {
    async fn stat(&mut self, message_id: &str) -> Result<ArticleStatus> {
        self.state.stat_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        let result = self.stat_now(strip_brackets(message_id));
        self.leave();
        result
    }

    async fn body(&mut self, message_id: &str, limit: usize) -> Result<Option<ArticleBody>> {
        self.state.body_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await;
        let result = self
            .body_now(strip_brackets(message_id))
            .map(|body| body.map(|data| cut_at_limit(data, limit)));
        self.leave();
        if let Ok(Some(body)) = &result {
            self.state
                .body_bytes
                .fetch_add(body.data.len(), Ordering::SeqCst);
        }
        result
    }

    async fn ping(&mut self) -> Result<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(Error::Nntp("ping failed (scripted)".into()));
        }
        Ok(())
    }

    async fn quit(&mut self) {
        self.state.quits.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// yEnc
// ---------------------------------------------------------------------------

const YENC_LINE: usize = 128;

fn yenc_lines(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32 + 4);
    let mut col = 0;
    for (i, byte) in data.iter().enumerate() {
        let c = byte.wrapping_add(42);
        let at_edge = col == 0 || col >= YENC_LINE - 1 || i + 1 == data.len();
        let escape = matches!(c, 0x00 | 0x0a | 0x0d | b'=')
            || (matches!(c, b'\t' | b' ') && at_edge)
            || (c == b'.' && col == 0);
        if escape {
            out.push(b'=');
            out.push(c.wrapping_add(64));
            col += 2;
        } else {
            out.push(c);
            col += 1;
        }
        if col >= YENC_LINE {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Single-part yEnc article body
pub(crate) fn yenc_single(name: &str, data: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "=ybegin line={} size={} name={}\r\n",
        YENC_LINE,
        data.len(),
        name
    )
    .into_bytes();
    out.extend(yenc_lines(data));
    out.extend(
        format!(
            "=yend size={} crc32={:08x}\r\n",
            data.len(),
            crc32fast::hash(data)
        )
        .into_bytes(),
    );
    out
}

/// Split `data` into multi-part yEnc article bodies of `part_size` bytes each
pub(crate) fn yenc_parts(name: &str, data: &[u8], part_size: usize) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = data.chunks(part_size).collect();
    let total = chunks.len();
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let begin = i * part_size + 1;
            let end = begin + chunk.len() - 1;
            let mut out = format!(
                "=ybegin part={} total={} line={} size={} name={}\r\n=ypart begin={} end={}\r\n",
                i + 1,
                total,
                YENC_LINE,
                data.len(),
                name,
                begin,
                end
            )
            .into_bytes();
            out.extend(yenc_lines(chunk));
            out.extend(
                format!(
                    "=yend size={} part={} pcrc32={:08x}\r\n",
                    chunk.len(),
                    i + 1,
                    crc32fast::hash(chunk)
                )
                .into_bytes(),
            );
            out
        })
        .collect()
}

// ---------------------------------------------------------------------------
// NZB documents
// ---------------------------------------------------------------------------

/// Builds NZB XML whose segment ids follow `<filename>-<n>@test`
#[derive(Default)]
pub(crate) struct NzbBuilder {
    title: Option<String>,
    files: Vec<(String, usize)>,
}

impl NzbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn file(mut self, name: &str, segments: usize) -> Self {
        self.files.push((name.to_string(), segments));
        self
    }

    pub fn build(&self) -> String {
        let mut xml = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n",
        );
        if let Some(title) = &self.title {
            xml.push_str(&format!(
                "  <head>\n    <meta type=\"title\">{}</meta>\n  </head>\n",
                title
            ));
        }
        for (name, segments) in &self.files {
            xml.push_str(&format!(
                "  <file poster=\"poster@example.com\" date=\"1700000000\" \
                 subject=\"&quot;{}&quot; yEnc (1/{})\">\n",
                name, segments
            ));
            xml.push_str("    <groups><group>alt.binaries.test</group></groups>\n");
            xml.push_str("    <segments>\n");
            for n in 1..=*segments {
                xml.push_str(&format!(
                    "      <segment bytes=\"700000\" number=\"{}\">{}-{}@test</segment>\n",
                    n, name, n
                ));
            }
            xml.push_str("    </segments>\n  </file>\n");
        }
        xml.push_str("</nzb>\n");
        xml
    }
}

// ---------------------------------------------------------------------------
// Archive headers
// ---------------------------------------------------------------------------

fn push_rar4_block(out: &mut Vec<u8>, block: &[u8]) {
    let crc = (crc32fast::hash(block) & 0xffff) as u16;
    out.extend(crc.to_le_bytes());
    out.extend_from_slice(block);
}

/// RAR 4.x volume: marker, main header, one file header (no data follows)
pub(crate) fn rar4_archive(name: &str, method: u8, file_flags: u16, main_flags: u16) -> Vec<u8> {
    let mut out = b"Rar!\x1a\x07\x00".to_vec();

    let mut main = vec![0x73];
    main.extend(main_flags.to_le_bytes());
    main.extend(13u16.to_le_bytes());
    main.extend([0u8; 6]);
    push_rar4_block(&mut out, &main);

    let mut file = vec![0x74];
    file.extend((file_flags | 0x8000).to_le_bytes());
    file.extend(((32 + name.len()) as u16).to_le_bytes());
    file.extend(0u32.to_le_bytes()); // packed size
    file.extend(0u32.to_le_bytes()); // unpacked size
    file.push(2); // host os
    file.extend(0u32.to_le_bytes()); // file crc
    file.extend(0u32.to_le_bytes()); // mtime
    file.push(29); // unpack version
    file.push(method);
    file.extend((name.len() as u16).to_le_bytes());
    file.extend(0x20u32.to_le_bytes()); // attributes
    file.extend(name.as_bytes());
    push_rar4_block(&mut out, &file);

    out
}

pub(crate) fn rar4_stored(name: &str) -> Vec<u8> {
    rar4_archive(name, 0x30, 0, 0)
}

fn vint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn push_rar5_block(out: &mut Vec<u8>, body: &[u8]) {
    let mut covered = Vec::new();
    vint(&mut covered, body.len() as u64);
    covered.extend_from_slice(body);
    out.extend(crc32fast::hash(&covered).to_le_bytes());
    out.extend(covered);
}

/// RAR 5 volume: marker, main header, one file header (no data follows)
pub(crate) fn rar5_archive(name: &str, method: u64, encrypted: bool) -> Vec<u8> {
    let mut out = b"Rar!\x1a\x07\x01\x00".to_vec();
    push_rar5_block(&mut out, &[1, 0, 0]);

    // Encryption record: size, type 1, version 0, flags 0
    let extra: Vec<u8> = if encrypted { vec![3, 1, 0, 0] } else { vec![] };
    let mut file = Vec::new();
    vint(&mut file, 2);
    vint(&mut file, if encrypted { 0x03 } else { 0x02 });
    if encrypted {
        vint(&mut file, extra.len() as u64);
    }
    vint(&mut file, 0); // data size
    vint(&mut file, 0); // file flags
    vint(&mut file, 0); // unpacked size
    vint(&mut file, 0x20); // attributes
    vint(&mut file, method << 7);
    vint(&mut file, 0); // host os
    vint(&mut file, name.len() as u64);
    file.extend(name.as_bytes());
    file.extend(extra);
    push_rar5_block(&mut out, &file);

    out
}

pub(crate) fn rar5_stored(name: &str) -> Vec<u8> {
    rar5_archive(name, 0, false)
}

fn sevenz_number(out: &mut Vec<u8>, value: u64) {
    if value < 0x80 {
        out.push(value as u8);
    } else if value < 0x4000 {
        out.push(0x80 | (value >> 8) as u8);
        out.push((value & 0xff) as u8);
    } else {
        out.push(0xff);
        out.extend(value.to_le_bytes());
    }
}

/// 7z archive of `packed_len` filler bytes followed by the given next header
pub(crate) fn sevenz_with_next_header(next_header: &[u8], packed_len: usize) -> Vec<u8> {
    let mut start = Vec::new();
    start.extend((packed_len as u64).to_le_bytes());
    start.extend((next_header.len() as u64).to_le_bytes());
    start.extend(crc32fast::hash(next_header).to_le_bytes());

    let mut out = vec![0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c, 0x00, 0x04];
    out.extend(crc32fast::hash(&start).to_le_bytes());
    out.extend(start);
    out.extend(std::iter::repeat_n(0x55u8, packed_len));
    out.extend_from_slice(next_header);
    out
}

/// 7z archive with one folder chaining `coders`; returns the bytes and the
/// absolute offset of the next header
pub(crate) fn sevenz_archive(coders: &[&[u8]], packed_len: usize) -> (Vec<u8>, usize) {
    let mut header = vec![0x01, 0x04, 0x06];
    sevenz_number(&mut header, 0); // pack position
    sevenz_number(&mut header, 1); // pack streams
    header.push(0x09);
    sevenz_number(&mut header, packed_len as u64);
    header.push(0x00);

    header.extend([0x07, 0x0b]);
    sevenz_number(&mut header, 1); // folders
    header.push(0x00); // not external
    sevenz_number(&mut header, coders.len() as u64);
    for id in coders {
        header.push(id.len() as u8);
        header.extend_from_slice(id);
    }
    for i in 1..coders.len() {
        sevenz_number(&mut header, i as u64); // in index
        sevenz_number(&mut header, (i - 1) as u64); // out index
    }
    header.push(0x0c);
    for _ in coders {
        sevenz_number(&mut header, packed_len as u64);
    }
    header.extend([0x00, 0x00, 0x00]);

    (
        sevenz_with_next_header(&header, packed_len),
        32 + packed_len,
    )
}

/// ZIP local file header without data
pub(crate) fn zip_local_header(name: &str, flags: u16, method: u16) -> Vec<u8> {
    let mut out = b"PK\x03\x04".to_vec();
    out.extend(20u16.to_le_bytes()); // version needed
    out.extend(flags.to_le_bytes());
    out.extend(method.to_le_bytes());
    out.extend(0u16.to_le_bytes()); // time
    out.extend(0u16.to_le_bytes()); // date
    out.extend(0u32.to_le_bytes()); // crc
    out.extend(0u32.to_le_bytes()); // compressed size
    out.extend(0u32.to_le_bytes()); // uncompressed size
    out.extend((name.len() as u16).to_le_bytes());
    out.extend(0u16.to_le_bytes()); // extra length
    out.extend(name.as_bytes());
    out
}
