// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! Buffer-handoff protocol between a reader and its consumer.
//!
//! Reassembly buffers are owned by the consumer and loaned to the reader as
//! plain `Vec<u8>` capabilities: the vector's `len()` is the usable capacity,
//! the reader tracks the written size separately and reports it on each
//! upcall. A buffer granted to the reader must stay untouched by the consumer
//! until the reader hands it back through `copy_complete`, a completion
//! upcall, or `cancel`.
//!
//! All callbacks run synchronously on the reader's worker thread while no
//! reader-internal lock is held, so the consumer observes a strict
//! happens-before from datagram arrival to completion.

/// A fully reassembled frame from the acknowledged fragmented stream.
#[derive(Debug)]
pub struct CompletedFrame {
    /// The filled buffer; valid bytes are `buffer[..size]`.
    pub buffer: Vec<u8>,
    pub size: usize,
    pub frame_number: u16,
    /// Frames lost between this completion and the previous one
    /// (wrapping 16-bit accounting).
    pub missed_frames: u16,
}

/// Consumer contract for the acknowledged fragmented stream (Engine A).
pub trait FrameConsumer: Send {
    /// A frame is complete. Returns the buffer to fill next (handing the
    /// same vector back is fine).
    fn frame_complete(&mut self, frame: CompletedFrame) -> Vec<u8>;

    /// The current buffer cannot hold `needed` bytes. Return a buffer of at
    /// least `needed` bytes, or an empty one to refuse — refusal makes the
    /// reader skip the rest of the current frame.
    fn buffer_too_small(&mut self, needed: usize) -> Vec<u8>;

    /// The reader no longer references `retired`; ownership returns to the
    /// consumer.
    fn copy_complete(&mut self, retired: Vec<u8>);

    /// The reader is shutting down; the in-progress buffer comes back with
    /// the bytes accumulated so far.
    fn cancel(&mut self, buffer: Vec<u8>, size: usize);
}

/// A fully depacketized H.264 NAL unit from the real-time stream.
#[derive(Debug)]
pub struct CompletedNalu {
    /// The filled buffer; valid bytes are `buffer[..size]`.
    pub buffer: Vec<u8>,
    pub size: usize,
    /// Media timestamp converted to microseconds (90 kHz wire clock).
    pub timestamp_us: u64,
    /// True iff the access unit started at the packet that completed this
    /// unit.
    pub first_of_au: bool,
    /// Marker bit of the completing packet.
    pub last_of_au: bool,
    /// Sequence-number gaps observed inside the current access unit.
    pub seq_gaps: u32,
}

/// Consumer contract for the real-time packetized stream (Engine B).
pub trait NaluConsumer: Send {
    /// A NAL unit is complete. Returns the buffer to fill next.
    fn nalu_complete(&mut self, nalu: CompletedNalu) -> Vec<u8>;

    /// The current buffer cannot hold `needed` bytes. Return a buffer of at
    /// least `needed` bytes, or an empty one to refuse — refusal drops the
    /// current packet's write.
    fn buffer_too_small(&mut self, needed: usize) -> Vec<u8>;

    /// The reader no longer references `retired`.
    fn copy_complete(&mut self, retired: Vec<u8>);

    /// The reader is shutting down; the in-progress buffer comes back.
    fn cancel(&mut self, buffer: Vec<u8>, size: usize);
}
