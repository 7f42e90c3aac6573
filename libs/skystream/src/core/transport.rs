// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! Datagram-manager surface for the acknowledged fragmented stream.
//!
//! Engine A never touches a socket: all of its I/O goes through an external
//! datagram manager addressed by buffer id. The manager side of the contract
//! is reproduced here as a trait plus the buffer-parameter tables the sender
//! has to mirror.

use crate::core::error::Result;
use crate::core::wire::{AckPacket, FragmentHeader, FRAGMENT_SIZE, MAX_FRAGMENTS_PER_FRAME};

/// External datagram transport, addressed by I/O-buffer id.
pub trait DatagramManager: Send + Sync {
    /// Blocking read of one datagram into `buf`. Implementations bound the
    /// wait to roughly one second and surface expiry as an
    /// `io::ErrorKind::TimedOut`/`WouldBlock` error, which callers treat as
    /// a quiet retry.
    fn read(&self, buffer_id: u8, buf: &mut [u8]) -> Result<usize>;

    /// Queue one datagram for sending.
    fn send(&self, buffer_id: u8, data: &[u8]) -> Result<()>;
}

/// How a manager I/O buffer drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Fire-and-forget datagrams, queued in order.
    Unreliable,
    /// Single overwriting slot; only the newest datagram is ever sent.
    LatestOnly,
}

/// Configuration of one manager I/O buffer. The sender must register the
/// mirror image of these on its side of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoBufferParams {
    pub buffer_id: u8,
    pub delivery: DeliveryPolicy,
    /// Queued datagram slots.
    pub capacity: u32,
    /// Largest datagram the buffer accepts.
    pub datagram_size: usize,
    /// Send retries before a datagram is dropped; negative means unbounded.
    pub retry_count: i32,
}

/// Parameters for the stream-data receive buffer.
///
/// One slot per possible in-flight fragment; data fragments are never
/// retried by the manager, the ack protocol drives retransmission instead.
pub fn video_data_buffer_params(buffer_id: u8) -> IoBufferParams {
    IoBufferParams {
        buffer_id,
        delivery: DeliveryPolicy::Unreliable,
        capacity: MAX_FRAGMENTS_PER_FRAME as u32,
        datagram_size: FRAGMENT_SIZE + FragmentHeader::SIZE,
        retry_count: 0,
    }
}

/// Parameters for the acknowledgement send buffer.
///
/// A single overwriting slot: the ack worker refreshes the bitmap at ~1 kHz
/// and only the newest snapshot is worth transmitting.
pub fn video_ack_buffer_params(buffer_id: u8) -> IoBufferParams {
    IoBufferParams {
        buffer_id,
        delivery: DeliveryPolicy::LatestOnly,
        capacity: 1,
        datagram_size: AckPacket::SIZE,
        retry_count: -1,
    }
}
