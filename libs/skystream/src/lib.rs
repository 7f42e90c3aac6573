// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! Receive-side video stream reassembly for aerial-vehicle links.
//!
//! Two independent receive engines:
//!
//! - [`FrameStreamReader`] reassembles frames chopped into fixed-size
//!   fragments, acknowledging receipt through a 128-bit bitmap so the
//!   vehicle can retransmit what is missing. Transport is delegated to an
//!   external [`DatagramManager`].
//! - [`NaluStreamReader`] binds a UDP socket (unicast or multicast) and
//!   depacketizes an RTP-style H.264 elementary stream into NAL units per
//!   RFC 6184 (single NAL, FU-A, STAP-A), with per-interval reception
//!   statistics.
//!
//! Both engines hand reassembled units to the caller through the
//! buffer-handoff protocol in [`core::buffers`]: the consumer owns every
//! buffer, the reader borrows one at a time and returns it on completion,
//! resize, or shutdown. Workers are plain blocking loops driven from
//! caller-spawned threads; `stop` is observed within the engines' bounded
//! receive timeouts, after which `close` succeeds.

pub mod core;

pub use core::{
    bind_recv_socket, is_multicast, media_ts_to_us, video_ack_buffer_params,
    video_data_buffer_params, AckBitmap, AckPacket, ChannelFrameConsumer,
    ChannelNaluConsumer, CompletedFrame, CompletedNalu, DatagramManager, DeliveryPolicy,
    FragmentHeader, FrameConsumer, FrameStreamReader, IoBufferParams, MonitorPoint,
    MonitorRing, NaluConsumer, NaluReaderConfig, NaluStreamReader, NaluUnit,
    ReassembledFrame, Result, RtpHeader, StreamError, StreamStats,
    DEFAULT_MAX_PACKET_SIZE, FRAGMENT_SIZE, MAX_FRAGMENTS_PER_FRAME, MONITOR_CAPACITY,
    RECV_BUFFER_TARGET,
};
