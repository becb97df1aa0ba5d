use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use rand::Rng;

use crate::frame::{Frame, CLOSE};

/// A unidirectional byte channel within a connection, identified by a
/// non-zero stream id. Stream 0 is reserved for connection-level control
/// and is not represented by a `Stream`.
pub struct Stream {
    pub stream_id: u32,
    pending: VecDeque<Frame>,
    received_data: BytesMut,
    bytes_sent: u64,
    bytes_received: u64,
    frames_received: u64,
    frames_sent: u64,
    stime: Option<Instant>,
    etime: Option<Instant>,
    closed: bool,
    frame_size: u16,
}

impl Stream {
    /// Creates an empty receiver: `stream_id` recorded, no frames queued.
    pub fn new_receiver(stream_id: u32) -> Self {
        Self {
            stream_id,
            pending: VecDeque::new(),
            received_data: BytesMut::new(),
            bytes_sent: 0,
            bytes_received: 0,
            frames_received: 0,
            frames_sent: 0,
            stime: None,
            etime: None,
            closed: false,
            frame_size: rand::thread_rng().gen_range(1000..=2000),
        }
    }

    /// Creates a sender stream bound to a byte source, fragmenting it
    /// immediately via `populate_from_source`.
    pub fn new_sender(stream_id: u32, source: Bytes) -> Self {
        let mut stream = Self::new_receiver(stream_id);
        stream.populate_from_source(source);
        stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn received_data(&self) -> &[u8] {
        &self.received_data
    }

    pub fn elapsed(&self) -> Option<std::time::Duration> {
        match (self.stime, self.etime) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn has_pending_frames(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Reads the entire source into memory and fragments it into
    /// successive `frame_size`-byte data frames (the final one may be
    /// shorter), followed by one empty CLOSE frame. Fixed at construction;
    /// no further fragmentation occurs.
    pub fn populate_from_source(&mut self, source: Bytes) {
        let chunk = self.frame_size as usize;
        let total = source.len() as u32;
        let mut offset = 0u32;
        let mut remaining = source;

        while !remaining.is_empty() {
            let take = chunk.min(remaining.len());
            let data = remaining.split_to(take);
            self.pending.push_back(Frame::data_frame(self.stream_id, offset, data));
            offset += take as u32;
        }

        self.pending.push_back(Frame::close_frame(self.stream_id, total));
    }

    /// Pops the head of the pending queue, recording `stime` on first pop.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let frame = self.pending.pop_front()?;
        if self.stime.is_none() {
            self.stime = Some(Instant::now());
        }
        self.bytes_sent += frame.length() as u64;
        self.frames_sent += 1;
        Some(frame)
    }

    #[cfg(test)]
    pub(crate) fn push_test_frame(&mut self, frame: Frame) {
        self.pending.push_back(frame);
    }

    /// Appends the frame's data to `received_data` in arrival order
    /// (reordering by offset is a non-goal, see `spec.md` §9). Sets
    /// `closed`/`etime` on a CLOSE frame.
    pub fn deliver(&mut self, frame: Frame) {
        if self.stime.is_none() {
            self.stime = Some(Instant::now());
        }

        self.received_data.extend_from_slice(&frame.data);
        self.bytes_received += frame.length() as u64;
        self.frames_received += 1;

        if frame.frame_type & CLOSE != 0 && !self.closed {
            self.etime = Some(Instant::now());
            self.closed = true;
        }
    }
}
