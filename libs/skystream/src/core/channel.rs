// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! Channel-backed consumers.
//!
//! Ready-made implementations of the buffer-handoff traits that forward
//! completed units over a crossbeam channel and hand fresh buffers back to
//! the reader. The callbacks still run synchronously on the worker thread,
//! so the ordering guarantees of the reader are unchanged; the channel only
//! moves the finished unit to whichever thread wants it.
//!
//! A disconnected receiver is not an error: units are dropped and the
//! stream keeps running.

use crossbeam_channel::Sender;

use crate::core::buffers::{CompletedFrame, CompletedNalu, FrameConsumer, NaluConsumer};

/// A reassembled frame as it leaves the channel.
#[derive(Debug)]
pub struct ReassembledFrame {
    pub data: Vec<u8>,
    pub frame_number: u16,
    pub missed_frames: u16,
}

/// FrameConsumer that ships completed frames over a channel.
pub struct ChannelFrameConsumer {
    sender: Sender<ReassembledFrame>,
    /// Capacity of replacement buffers; grows to the largest grant asked for.
    buffer_capacity: usize,
}

impl ChannelFrameConsumer {
    pub fn new(sender: Sender<ReassembledFrame>, buffer_capacity: usize) -> Self {
        assert!(buffer_capacity > 0, "replacement buffers need capacity");
        Self {
            sender,
            buffer_capacity,
        }
    }
}

impl FrameConsumer for ChannelFrameConsumer {
    fn frame_complete(&mut self, frame: CompletedFrame) -> Vec<u8> {
        let mut data = frame.buffer;
        data.truncate(frame.size);
        if self
            .sender
            .send(ReassembledFrame {
                data,
                frame_number: frame.frame_number,
                missed_frames: frame.missed_frames,
            })
            .is_err()
        {
            tracing::trace!(frame = frame.frame_number, "receiver gone, frame dropped");
        }
        vec![0u8; self.buffer_capacity]
    }

    fn buffer_too_small(&mut self, needed: usize) -> Vec<u8> {
        self.buffer_capacity = self.buffer_capacity.max(needed);
        vec![0u8; self.buffer_capacity]
    }

    fn copy_complete(&mut self, retired: Vec<u8>) {
        drop(retired);
    }

    fn cancel(&mut self, buffer: Vec<u8>, _size: usize) {
        drop(buffer);
    }
}

/// A depacketized NAL unit as it leaves the channel.
#[derive(Debug)]
pub struct NaluUnit {
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub first_of_au: bool,
    pub last_of_au: bool,
    pub seq_gaps: u32,
}

/// NaluConsumer that ships completed NAL units over a channel.
pub struct ChannelNaluConsumer {
    sender: Sender<NaluUnit>,
    buffer_capacity: usize,
}

impl ChannelNaluConsumer {
    pub fn new(sender: Sender<NaluUnit>, buffer_capacity: usize) -> Self {
        assert!(buffer_capacity > 0, "replacement buffers need capacity");
        Self {
            sender,
            buffer_capacity,
        }
    }
}

impl NaluConsumer for ChannelNaluConsumer {
    fn nalu_complete(&mut self, nalu: CompletedNalu) -> Vec<u8> {
        let mut data = nalu.buffer;
        data.truncate(nalu.size);
        if self
            .sender
            .send(NaluUnit {
                data,
                timestamp_us: nalu.timestamp_us,
                first_of_au: nalu.first_of_au,
                last_of_au: nalu.last_of_au,
                seq_gaps: nalu.seq_gaps,
            })
            .is_err()
        {
            tracing::trace!("receiver gone, NAL unit dropped");
        }
        vec![0u8; self.buffer_capacity]
    }

    fn buffer_too_small(&mut self, needed: usize) -> Vec<u8> {
        self.buffer_capacity = self.buffer_capacity.max(needed);
        vec![0u8; self.buffer_capacity]
    }

    fn copy_complete(&mut self, retired: Vec<u8>) {
        drop(retired);
    }

    fn cancel(&mut self, buffer: Vec<u8>, _size: usize) {
        drop(buffer);
    }
}
