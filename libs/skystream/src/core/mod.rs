// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod bitmap;
pub mod buffers;
pub mod channel;
pub mod error;
pub mod frame_reader;
pub mod monitor;
pub mod nalu_reader;
pub mod socket;
pub mod transport;
pub mod wire;

pub use bitmap::AckBitmap;
pub use buffers::{CompletedFrame, CompletedNalu, FrameConsumer, NaluConsumer};
pub use channel::{
    ChannelFrameConsumer, ChannelNaluConsumer, NaluUnit, ReassembledFrame,
};
pub use error::{Result, StreamError};
pub use frame_reader::FrameStreamReader;
pub use monitor::{MonitorPoint, MonitorRing, StreamStats, MONITOR_CAPACITY};
pub use nalu_reader::{NaluReaderConfig, NaluStreamReader, DEFAULT_MAX_PACKET_SIZE};
pub use socket::{bind_recv_socket, is_multicast, RECV_BUFFER_TARGET};
pub use transport::{
    video_ack_buffer_params, video_data_buffer_params, DatagramManager, DeliveryPolicy,
    IoBufferParams,
};
pub use wire::{
    media_ts_to_us, AckPacket, FragmentHeader, RtpHeader, FRAGMENT_SIZE,
    MAX_FRAGMENTS_PER_FRAME,
};
