use bytes::{Buf, Bytes, BytesMut};
use log::{debug, warn};

pub const ESCAPE: [u8; 4] = [0x1B; 4];
pub const START_MARKER: [u8; 8] = [0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01];
const END_TAG: u8 = 0x1A;
const END_MARKER_LEN: usize = 8;

/// Buffered bytes without any complete frame beyond this are dropped.
pub const MAX_BUFFERED: usize = 1024 * 1024;

/// Stateful splitter turning a raw serial byte stream into complete SML
/// transport frames (start escape sequence through end escape sequence,
/// including status and checksum bytes).
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buffer: BytesMut,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` and returns every complete frame now in the buffer, in
    /// stream order. Bytes after the last frame stay buffered for the next call.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let ranges = find_frames(&self.buffer);
        let Some(last) = ranges.last() else {
            self.enforce_limit();
            return Vec::new();
        };

        let consumed = self.buffer.split_to(last.1).freeze();
        debug!("📦 Extracted {} frame(s), {} bytes left buffered", ranges.len(), self.buffer.len());

        ranges
            .into_iter()
            .map(|(start, end)| consumed.slice(start..end))
            .collect()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn enforce_limit(&mut self) {
        if self.buffer.len() <= MAX_BUFFERED {
            return;
        }
        // keep enough to complete a start marker split across reads
        let keep = START_MARKER.len() - 1;
        let drop = self.buffer.len() - keep;
        warn!("⚠️ No complete frame in {} buffered bytes, discarding {}", self.buffer.len(), drop);
        self.buffer.advance(drop);
    }
}

fn escaped_before(buf: &[u8], pos: usize) -> bool {
    pos >= ESCAPE.len() && buf[pos - ESCAPE.len()..pos] == ESCAPE
}

fn is_start(buf: &[u8], pos: usize) -> bool {
    buf.len() >= pos + START_MARKER.len()
        && buf[pos..pos + START_MARKER.len()] == START_MARKER
        && !escaped_before(buf, pos)
}

fn is_end(buf: &[u8], pos: usize) -> bool {
    buf.len() >= pos + END_MARKER_LEN
        && buf[pos..pos + ESCAPE.len()] == ESCAPE
        && buf[pos + 4] == END_TAG
        && buf[pos + 5] <= 0x03
        && !escaped_before(buf, pos)
}

/// Non-overlapping `(start, end)` ranges of complete frames, scanning left to
/// right and taking the nearest terminator for each start marker.
fn find_frames(buf: &[u8]) -> Vec<(usize, usize)> {
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos + START_MARKER.len() <= buf.len() {
        if !is_start(buf, pos) {
            pos += 1;
            continue;
        }

        let body = pos + START_MARKER.len();
        match (body..buf.len()).find(|&i| is_end(buf, i)) {
            Some(end) => {
                frames.push((pos, end + END_MARKER_LEN));
                pos = end + END_MARKER_LEN;
            }
            // a later start cannot terminate either
            None => break,
        }
    }

    frames
}
