// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! Acknowledged fragmented-stream reader (Engine A).
//!
//! Frames arrive as fixed-size fragments through an external datagram
//! manager. The data worker writes each fragment at its offset in the
//! consumer's buffer and keeps a 128-bit receipt bitmap; the ack worker
//! snapshots that bitmap at ~1 kHz and sends it back so the vehicle can
//! retransmit what is missing.
//!
//! Both workers are long-lived blocking loops meant to be driven from
//! externally spawned threads. They poll the stop signal once per iteration;
//! the manager's ~1 s read timeout bounds shutdown latency.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::bitmap::AckBitmap;
use crate::core::buffers::{CompletedFrame, FrameConsumer};
use crate::core::error::{Result, StreamError};
use crate::core::transport::DatagramManager;
use crate::core::wire::{AckPacket, FragmentHeader, FRAGMENT_SIZE, MAX_FRAGMENTS_PER_FRAME};

/// Pause between acknowledgement sends.
const ACK_INTERVAL: Duration = Duration::from_millis(1);

/// Worker lifecycle flags, guarded by the thread-state mutex.
#[derive(Debug, Default)]
struct ThreadState {
    data_started: bool,
    ack_started: bool,
    closed: bool,
}

/// The in-progress acknowledgement, guarded by the ack mutex. The data
/// worker is the only writer; the ack worker snapshots it for sending.
#[derive(Debug, Default)]
struct AckState {
    frame_number: u16,
    bitmap: AckBitmap,
}

/// Reassembly state owned by the data worker for the duration of its run.
struct Assembly {
    consumer: Box<dyn FrameConsumer>,
    buffer: Vec<u8>,
    size: usize,
    skip_current_frame: bool,
}

/// Receive side of the acknowledged fragmented video stream.
pub struct FrameStreamReader {
    manager: Arc<dyn DatagramManager>,
    data_buffer_id: u8,
    ack_buffer_id: u8,
    stop: AtomicBool,
    state: Mutex<ThreadState>,
    ack: Mutex<AckState>,
    /// Taken by the data worker when it starts; `None` afterwards.
    assembly: Mutex<Option<Assembly>>,
}

impl FrameStreamReader {
    /// Create a reader over `manager`, reassembling into `buffer`.
    ///
    /// `buffer` is the consumer's initial loan; its length is the usable
    /// capacity. Fails with `Configuration` when the buffer is empty or the
    /// two buffer ids collide.
    pub fn new(
        manager: Arc<dyn DatagramManager>,
        data_buffer_id: u8,
        ack_buffer_id: u8,
        consumer: Box<dyn FrameConsumer>,
        buffer: Vec<u8>,
    ) -> Result<Arc<Self>> {
        if buffer.is_empty() {
            return Err(StreamError::Configuration(
                "initial frame buffer must have non-zero capacity".into(),
            ));
        }
        if data_buffer_id == ack_buffer_id {
            return Err(StreamError::Configuration(format!(
                "data and ack buffer ids must differ (both {})",
                data_buffer_id
            )));
        }
        Ok(Arc::new(Self {
            manager,
            data_buffer_id,
            ack_buffer_id,
            stop: AtomicBool::new(false),
            state: Mutex::new(ThreadState::default()),
            ack: Mutex::new(AckState::default()),
            assembly: Mutex::new(Some(Assembly {
                consumer,
                buffer,
                size: 0,
                skip_current_frame: false,
            })),
        }))
    }

    /// Data worker entry point. Call from a dedicated thread; returns when
    /// `stop` has been observed.
    pub fn run_data_worker(&self) {
        {
            let mut state = self.state.lock();
            if state.data_started {
                tracing::warn!("data worker already running, ignoring second start");
                return;
            }
            state.data_started = true;
        }
        let taken = self.assembly.lock().take();
        let Some(mut assembly) = taken else {
            tracing::warn!("data worker has no assembly state (already consumed)");
            self.state.lock().data_started = false;
            return;
        };

        tracing::info!(buffer_id = self.data_buffer_id, "stream data worker started");
        let mut recv_buf = vec![0u8; FRAGMENT_SIZE + FragmentHeader::SIZE];
        // Sentinel start value: the very first completion reports the wrapped
        // distance from 0xFFFF (0 for frame 0).
        let mut previous_frame = u16::MAX;

        while !self.stop.load(Ordering::Relaxed) {
            let size = match self.manager.read(self.data_buffer_id, &mut recv_buf) {
                Ok(n) => n,
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    tracing::warn!("fragment read failed: {}", e);
                    continue;
                }
            };
            let Some(header) = FragmentHeader::parse(&recv_buf[..size]) else {
                tracing::debug!(size, "datagram shorter than fragment header, dropped");
                continue;
            };
            if header.fragments_per_frame == 0
                || header.fragments_per_frame as usize > MAX_FRAGMENTS_PER_FRAME
                || header.fragment_number >= header.fragments_per_frame
            {
                tracing::warn!(
                    fragment = header.fragment_number,
                    total = header.fragments_per_frame,
                    "fragment header out of range, dropped"
                );
                continue;
            }
            let payload_len = size - FragmentHeader::SIZE;

            {
                let mut ack = self.ack.lock();
                if ack.frame_number != header.frame_number {
                    // The wire numbering is authoritative: any change starts
                    // a new frame, even a smaller number.
                    assembly.size = 0;
                    assembly.skip_current_frame = false;
                    ack.frame_number = header.frame_number;
                    ack.bitmap.reset();
                    tracing::trace!(frame = header.frame_number, "new frame started");
                }
                ack.bitmap.set(header.fragment_number);
            }

            let cp_index = header.fragment_number as usize * FRAGMENT_SIZE;
            let end_index = cp_index + payload_len;

            while end_index > assembly.buffer.len() && !assembly.skip_current_frame {
                let mut grant = assembly.consumer.buffer_too_small(end_index);
                if !grant.is_empty() && grant.len() >= assembly.size {
                    grant[..assembly.size].copy_from_slice(&assembly.buffer[..assembly.size]);
                } else {
                    tracing::debug!(
                        frame = header.frame_number,
                        needed = end_index,
                        granted = grant.len(),
                        "buffer grant refused, skipping rest of frame"
                    );
                    // The accumulated prefix stays in the retired buffer, so
                    // the adopted one starts empty.
                    assembly.skip_current_frame = true;
                    assembly.size = 0;
                }
                let retired = mem::replace(&mut assembly.buffer, grant);
                assembly.consumer.copy_complete(retired);
            }

            if !assembly.skip_current_frame {
                assembly.buffer[cp_index..end_index]
                    .copy_from_slice(&recv_buf[FragmentHeader::SIZE..size]);
                assembly.size = assembly.size.max(end_index);
            }

            let all_received = {
                let ack = self.ack.lock();
                ack.bitmap.all_set(header.fragments_per_frame)
            };
            // "Different from the previous completed frame" makes completion
            // fire at most once no matter how fragments repeat.
            if all_received
                && header.frame_number != previous_frame
                && !assembly.skip_current_frame
            {
                let missed_frames = header
                    .frame_number
                    .wrapping_sub(previous_frame)
                    .wrapping_sub(1);
                previous_frame = header.frame_number;
                tracing::debug!(
                    frame = header.frame_number,
                    size = assembly.size,
                    missed_frames,
                    "frame complete"
                );
                let buffer = mem::take(&mut assembly.buffer);
                let size = assembly.size;
                assembly.buffer = assembly.consumer.frame_complete(CompletedFrame {
                    buffer,
                    size,
                    frame_number: header.frame_number,
                    missed_frames,
                });
            }
        }

        drop(recv_buf);
        let buffer = mem::take(&mut assembly.buffer);
        let size = assembly.size;
        assembly.consumer.cancel(buffer, size);
        tracing::info!("stream data worker stopped");
        self.state.lock().data_started = false;
    }

    /// Ack worker entry point. Sends the current bitmap snapshot at ~1 kHz
    /// until `stop` is observed.
    pub fn run_ack_worker(&self) {
        {
            let mut state = self.state.lock();
            if state.ack_started {
                tracing::warn!("ack worker already running, ignoring second start");
                return;
            }
            state.ack_started = true;
        }
        tracing::info!(buffer_id = self.ack_buffer_id, "stream ack worker started");

        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(ACK_INTERVAL);
            let packet = {
                let ack = self.ack.lock();
                let (high, low) = ack.bitmap.words();
                AckPacket {
                    frame_number: ack.frame_number as u32,
                    high,
                    low,
                }
            };
            if let Err(e) = self.manager.send(self.ack_buffer_id, &packet.encode()) {
                if !e.is_timeout() {
                    tracing::warn!("ack send failed: {}", e);
                }
            }
        }

        tracing::info!("stream ack worker stopped");
        self.state.lock().ack_started = false;
    }

    /// Signal both workers to exit. Idempotent.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::Relaxed) {
            tracing::info!("stream reader stop requested");
        }
    }

    /// Tear the reader down. Refused with `Busy` while either worker is
    /// still running; a second successful call is a `Configuration` error.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamError::Configuration("reader already closed".into()));
        }
        if state.data_started || state.ack_started {
            return Err(StreamError::Busy("workers have not observed stop yet"));
        }
        state.closed = true;
        Ok(())
    }

    /// True once both workers have exited.
    pub fn is_stopped(&self) -> bool {
        let state = self.state.lock();
        !state.data_started && !state.ack_started
    }
}
