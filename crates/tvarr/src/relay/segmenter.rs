//! Splits a continuous relay output into media segments for HLS/DASH.
//!
//! TS output is cut on 188-byte packet boundaries at roughly the target
//! duration. Fragmented MP4 output is split on box boundaries: ftyp+moov
//! form the cached init segment, each moof..mdat run becomes one media
//! segment.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use super::buffer::SegmentStore;

pub const TS_PACKET: usize = 188;

pub struct TsSegmenter {
    store: Arc<SegmentStore>,
    pending: BytesMut,
    target_secs: f64,
    segment_started: Instant,
}

impl TsSegmenter {
    pub fn new(store: Arc<SegmentStore>, target_secs: f64) -> Self {
        Self {
            store,
            pending: BytesMut::new(),
            target_secs: target_secs.max(0.5),
            segment_started: Instant::now(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);

        let elapsed = self.segment_started.elapsed().as_secs_f64();
        if elapsed < self.target_secs {
            return;
        }

        // Cut on the last whole TS packet.
        let cut = (self.pending.len() / TS_PACKET) * TS_PACKET;
        if cut == 0 {
            return;
        }
        let segment = self.pending.split_to(cut).freeze();
        self.store.push_segment(segment, elapsed);
        self.segment_started = Instant::now();
    }

    /// Emit whatever is pending as a final short segment.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let elapsed = self.segment_started.elapsed().as_secs_f64();
        let segment = self.pending.split().freeze();
        self.store.push_segment(segment, elapsed.max(0.1));
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Fmp4State {
    /// Collecting ftyp/moov into the init segment.
    Init,
    /// Collecting moof..mdat fragments.
    Fragments,
}

pub struct Fmp4Segmenter {
    store: Arc<SegmentStore>,
    pending: BytesMut,
    init: BytesMut,
    fragment: BytesMut,
    state: Fmp4State,
    fragment_started: Instant,
}

impl Fmp4Segmenter {
    pub fn new(store: Arc<SegmentStore>) -> Self {
        Self {
            store,
            pending: BytesMut::new(),
            init: BytesMut::new(),
            fragment: BytesMut::new(),
            state: Fmp4State::Init,
            fragment_started: Instant::now(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);

        while let Some((box_type, box_len)) = peek_box(&self.pending) {
            if self.pending.len() < box_len {
                break;
            }
            let full_box = self.pending.split_to(box_len).freeze();
            self.consume_box(&box_type, full_box);
        }
    }

    fn consume_box(&mut self, box_type: &[u8; 4], data: Bytes) {
        match (&self.state, box_type) {
            (Fmp4State::Init, b"moof") => {
                // Init is complete at the first fragment.
                self.store.set_init_segment(self.init.split().freeze());
                self.state = Fmp4State::Fragments;
                self.fragment_started = Instant::now();
                self.fragment.extend_from_slice(&data);
            }
            (Fmp4State::Init, _) => {
                self.init.extend_from_slice(&data);
            }
            (Fmp4State::Fragments, b"moof") => {
                if !self.fragment.is_empty() {
                    self.emit_fragment();
                }
                self.fragment.extend_from_slice(&data);
            }
            (Fmp4State::Fragments, b"mdat") => {
                self.fragment.extend_from_slice(&data);
                self.emit_fragment();
            }
            (Fmp4State::Fragments, _) => {
                self.fragment.extend_from_slice(&data);
            }
        }
    }

    fn emit_fragment(&mut self) {
        let duration = self.fragment_started.elapsed().as_secs_f64().max(0.1);
        let segment = self.fragment.split().freeze();
        self.store.push_segment(segment, duration);
        self.fragment_started = Instant::now();
    }
}

/// Read an ISO-BMFF box header: (type, total length). `None` when more
/// bytes are needed or the header is nonsense.
fn peek_box(data: &[u8]) -> Option<([u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }
    let mut size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let box_type: [u8; 4] = [data[4], data[5], data[6], data[7]];
    let mut header = 8usize;

    if size == 1 {
        // 64-bit largesize.
        if data.len() < 16 {
            return None;
        }
        size = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        header = 16;
    }

    if size < header as u64 || size > usize::MAX as u64 {
        return None;
    }
    Some((box_type, size as usize))
}
