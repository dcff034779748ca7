//! Per-session media buffers.
//!
//! [`RelayBuffer`] is the continuous ring for MPEG-TS delivery: one
//! producer appends immutable `Bytes` chunks with monotonic sequence
//! numbers, readers follow with their own cursors and no producer-side
//! blocking. A full buffer drops the oldest chunks (counted); a reader
//! whose cursor falls behind the horizon is told so and disconnected by
//! its handler. [`SegmentStore`] is the segmented counterpart for
//! HLS/DASH output.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use bytes::Bytes;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub sequence: u64,
    pub data: Bytes,
}

/// Outcome of a cursor read.
#[derive(Debug)]
pub enum ReadOutcome {
    /// New chunks; advance the cursor to `next_cursor`.
    Chunks {
        chunks: Vec<MediaChunk>,
        next_cursor: u64,
    },
    /// Nothing new yet; wait on the buffer's notifier.
    UpToDate,
    /// The cursor fell behind the horizon; the client must disconnect.
    Lagged { oldest_available: u64 },
}

pub struct RelayBuffer {
    chunks: RwLock<VecDeque<MediaChunk>>,
    max_bytes: u64,
    max_chunks: usize,
    buffered_bytes: AtomicU64,
    upstream_bytes: AtomicU64,
    dropped_chunks: AtomicU64,
    next_sequence: AtomicU64,
    notify: Notify,
}

impl RelayBuffer {
    pub fn new(max_bytes: u64, max_chunks: usize) -> Self {
        Self {
            chunks: RwLock::new(VecDeque::new()),
            max_bytes: max_bytes.max(1),
            max_chunks: max_chunks.max(1),
            buffered_bytes: AtomicU64::new(0),
            upstream_bytes: AtomicU64::new(0),
            dropped_chunks: AtomicU64::new(0),
            next_sequence: AtomicU64::new(1),
            notify: Notify::new(),
        }
    }

    /// Append one chunk, enforcing the byte ceiling and chunk cap by
    /// dropping from the front. Single producer.
    pub fn push(&self, data: Bytes) -> u64 {
        if data.is_empty() {
            return self.next_sequence.load(Ordering::Relaxed).saturating_sub(1);
        }
        self.upstream_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);

        {
            let mut chunks = self.chunks.write().expect("buffer lock poisoned");
            self.buffered_bytes
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            chunks.push_back(MediaChunk { sequence, data });

            while chunks.len() > self.max_chunks
                || self.buffered_bytes.load(Ordering::Relaxed) > self.max_bytes
            {
                let Some(dropped) = chunks.pop_front() else {
                    break;
                };
                self.buffered_bytes
                    .fetch_sub(dropped.data.len() as u64, Ordering::Relaxed);
                self.dropped_chunks.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.notify.notify_waiters();
        sequence
    }

    /// Read everything after `cursor` (a sequence number; 0 reads from
    /// the current head).
    pub fn read_after(&self, cursor: u64, max_chunks: usize) -> ReadOutcome {
        let chunks = self.chunks.read().expect("buffer lock poisoned");
        let Some(front) = chunks.front() else {
            return ReadOutcome::UpToDate;
        };

        // A cursor older than the horizon cannot be served contiguously.
        if cursor != 0 && cursor + 1 < front.sequence {
            return ReadOutcome::Lagged {
                oldest_available: front.sequence,
            };
        }

        let collected: Vec<MediaChunk> = chunks
            .iter()
            .filter(|c| c.sequence > cursor)
            .take(max_chunks.max(1))
            .cloned()
            .collect();

        match collected.last().map(|last| last.sequence) {
            Some(next_cursor) => ReadOutcome::Chunks {
                chunks: collected,
                next_cursor,
            },
            None => ReadOutcome::UpToDate,
        }
    }

    /// Cursor positioned at the live edge: a new client starts here and
    /// receives only chunks produced after it joined.
    pub fn live_cursor(&self) -> u64 {
        self.next_sequence.load(Ordering::Relaxed).saturating_sub(1)
    }

    pub async fn wait_for_data(&self) {
        self.notify.notified().await;
    }

    pub fn upstream_bytes(&self) -> u64 {
        self.upstream_bytes.load(Ordering::Relaxed)
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks.load(Ordering::Relaxed)
    }
}

/// One HLS/DASH media segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub sequence: u64,
    pub data: Bytes,
    pub duration_secs: f64,
}

#[derive(Debug)]
pub enum SegmentLookup {
    Found(Segment),
    /// Older than the buffer horizon: 404.
    TooOld,
    /// Not produced yet: 404 (not-available).
    NotYet,
}

pub struct SegmentStore {
    segments: RwLock<VecDeque<Segment>>,
    init_segment: RwLock<Option<Bytes>>,
    max_segments: usize,
    next_sequence: AtomicU64,
    target_duration: f64,
}

impl SegmentStore {
    pub fn new(max_segments: usize, target_duration: f64) -> Self {
        Self {
            segments: RwLock::new(VecDeque::new()),
            init_segment: RwLock::new(None),
            max_segments: max_segments.max(2),
            next_sequence: AtomicU64::new(0),
            target_duration,
        }
    }

    /// The init segment is cached once for the session's lifetime.
    pub fn set_init_segment(&self, data: Bytes) {
        let mut init = self.init_segment.write().expect("segment lock poisoned");
        if init.is_none() {
            *init = Some(data);
        }
    }

    pub fn init_segment(&self) -> Option<Bytes> {
        self.init_segment
            .read()
            .expect("segment lock poisoned")
            .clone()
    }

    pub fn push_segment(&self, data: Bytes, duration_secs: f64) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let mut segments = self.segments.write().expect("segment lock poisoned");
        segments.push_back(Segment {
            sequence,
            data,
            duration_secs,
        });
        while segments.len() > self.max_segments {
            segments.pop_front();
        }
        sequence
    }

    pub fn get(&self, sequence: u64) -> SegmentLookup {
        let segments = self.segments.read().expect("segment lock poisoned");
        let Some(front) = segments.front() else {
            return SegmentLookup::NotYet;
        };
        if sequence < front.sequence {
            return SegmentLookup::TooOld;
        }
        match segments.iter().find(|s| s.sequence == sequence) {
            Some(segment) => SegmentLookup::Found(segment.clone()),
            None => SegmentLookup::NotYet,
        }
    }

    /// Live HLS media playlist over the current window.
    pub fn hls_playlist(&self, segment_path: &dyn Fn(u64) -> String) -> String {
        let segments = self.segments.read().expect("segment lock poisoned");
        let media_sequence = segments.front().map(|s| s.sequence).unwrap_or(0);
        let target = segments
            .iter()
            .map(|s| s.duration_secs)
            .fold(self.target_duration, f64::max)
            .ceil() as u64;

        let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        playlist.push_str(&format!("#EXT-X-TARGETDURATION:{target}\n"));
        playlist.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
        for segment in segments.iter() {
            playlist.push_str(&format!("#EXTINF:{:.3},\n", segment.duration_secs));
            playlist.push_str(&segment_path(segment.sequence));
            playlist.push('\n');
        }
        playlist
    }

    /// Minimal live DASH manifest: one video+audio muxed representation,
    /// segments addressed by number through a template.
    pub fn dash_manifest(&self, base_path: &str, mime: &str) -> String {
        let segments = self.segments.read().expect("segment lock poisoned");
        let start_number = segments.front().map(|s| s.sequence).unwrap_or(0);
        let duration = self.target_duration.max(1.0);

        format!(
            concat!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
                "<MPD xmlns=\"urn:mpeg:dash:schema:mpd:2011\" type=\"dynamic\" ",
                "profiles=\"urn:mpeg:dash:profile:isoff-live:2011\" ",
                "minimumUpdatePeriod=\"PT{duration}S\" minBufferTime=\"PT{duration}S\">\n",
                "  <Period id=\"0\" start=\"PT0S\">\n",
                "    <AdaptationSet mimeType=\"{mime}\" segmentAlignment=\"true\">\n",
                "      <SegmentTemplate media=\"{base}?format=dash&amp;seg=$Number$\" ",
                "initialization=\"{base}?format=dash&amp;init=v\" ",
                "duration=\"{duration_ms}\" timescale=\"1000\" startNumber=\"{start}\"/>\n",
                "      <Representation id=\"0\" bandwidth=\"4000000\"/>\n",
                "    </AdaptationSet>\n",
                "  </Period>\n",
                "</MPD>\n",
            ),
            duration = duration.ceil() as u64,
            duration_ms = (duration * 1000.0) as u64,
            mime = mime,
            base = base_path,
            start = start_number,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str) -> Bytes {
        Bytes::from(text.as_bytes().to_vec())
    }

    #[test]
    fn readers_follow_the_producer() {
        let buffer = RelayBuffer::new(1024, 16);
        let cursor = buffer.live_cursor();
        buffer.push(chunk("a"));
        buffer.push(chunk("b"));

        match buffer.read_after(cursor, 16) {
            ReadOutcome::Chunks {
                chunks,
                next_cursor,
            } => {
                assert_eq!(chunks.len(), 2);
                assert_eq!(chunks[0].data, chunk("a"));
                assert_eq!(next_cursor, chunks[1].sequence);
            }
            other => panic!("expected chunks, got {other:?}"),
        }
    }

    #[test]
    fn full_buffer_drops_oldest_and_counts() {
        let buffer = RelayBuffer::new(8, 1000);
        for i in 0..10 {
            buffer.push(chunk(&format!("xxx{i}")));
        }
        assert!(buffer.dropped_chunks() > 0);
        assert!(buffer.buffered_bytes() <= 8);
    }

    #[test]
    fn lagging_reader_is_told_to_disconnect() {
        let buffer = RelayBuffer::new(16, 2);
        buffer.push(chunk("aaaa"));
        let stale_cursor = 1;
        for i in 0..5 {
            buffer.push(chunk(&format!("bb{i}")));
        }
        match buffer.read_after(stale_cursor, 16) {
            ReadOutcome::Lagged { oldest_available } => assert!(oldest_available > 2),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn live_cursor_skips_history() {
        let buffer = RelayBuffer::new(1024, 16);
        buffer.push(chunk("old"));
        let cursor = buffer.live_cursor();
        buffer.push(chunk("new"));
        match buffer.read_after(cursor, 16) {
            ReadOutcome::Chunks { chunks, .. } => {
                assert_eq!(chunks.len(), 1);
                assert_eq!(chunks[0].data, chunk("new"));
            }
            other => panic!("expected chunks, got {other:?}"),
        }
    }

    #[test]
    fn segment_horizon_boundaries() {
        let store = SegmentStore::new(3, 4.0);
        for i in 0..6u8 {
            store.push_segment(Bytes::from(vec![i]), 4.0);
        }
        // Window holds sequences 3..=5.
        assert!(matches!(store.get(2), SegmentLookup::TooOld));
        assert!(matches!(store.get(3), SegmentLookup::Found(_)));
        assert!(matches!(store.get(5), SegmentLookup::Found(_)));
        assert!(matches!(store.get(6), SegmentLookup::NotYet));
    }

    #[test]
    fn playlist_reflects_the_window() {
        let store = SegmentStore::new(2, 4.0);
        store.push_segment(Bytes::from_static(b"a"), 4.0);
        store.push_segment(Bytes::from_static(b"b"), 4.0);
        store.push_segment(Bytes::from_static(b"c"), 4.0);
        let playlist = store.hls_playlist(&|seq| format!("seg-{seq}.ts"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:1\n"));
        assert!(playlist.contains("seg-1.ts"));
        assert!(playlist.contains("seg-2.ts"));
        assert!(!playlist.contains("seg-0.ts"));
    }

    #[test]
    fn init_segment_is_write_once() {
        let store = SegmentStore::new(4, 4.0);
        store.set_init_segment(Bytes::from_static(b"first"));
        store.set_init_segment(Bytes::from_static(b"second"));
        assert_eq!(store.init_segment().unwrap(), Bytes::from_static(b"first"));
    }
}
