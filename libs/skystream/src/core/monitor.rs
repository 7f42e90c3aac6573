// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! Rolling reception monitoring for the real-time stream.
//!
//! A fixed-capacity ring of per-packet observations, queried over a
//! caller-chosen lookback window. The owning reader updates and queries the
//! ring under its monitoring mutex; the ring itself carries no locking.

use crate::core::error::{Result, StreamError};
use crate::core::wire::media_ts_to_us;

/// Ring capacity. At 30 fps video with ~30 packets per frame this covers a
/// little over two seconds of stream.
pub const MONITOR_CAPACITY: usize = 2048;

/// One received packet, as observed at the socket.
#[derive(Debug, Clone, Copy)]
pub struct MonitorPoint {
    /// Reception time, microseconds on the reader's monotonic clock.
    pub recv_ts_us: u64,
    /// Raw 90 kHz media timestamp from the packet header.
    pub media_ts: u32,
    pub seq_num: u16,
    pub marker: bool,
    pub bytes: u32,
}

/// Aggregated reception statistics over a lookback window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    /// Reception time actually covered by the points in the window.
    pub real_interval_us: u64,
    /// Standard deviation of per-packet reception delay.
    pub jitter_us: u64,
    pub bytes_received: u64,
    pub mean_packet_size: u32,
    pub packet_size_std_dev: u32,
    pub packets_received: u32,
    /// Sequence-number gaps (mod 2^16) between consecutive points.
    pub packets_missed: u32,
}

/// Fixed-capacity circular store of `MonitorPoint`s.
#[derive(Debug)]
pub struct MonitorRing {
    points: Vec<MonitorPoint>,
    /// Slot of the most recently written point.
    index: usize,
    /// Number of valid points, 0..=capacity.
    count: usize,
}

impl MonitorRing {
    pub fn new() -> Self {
        Self::with_capacity(MONITOR_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 1, "monitor ring needs at least one slot");
        Self {
            points: Vec::with_capacity(capacity),
            index: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Record one packet, overwriting the oldest slot when full.
    pub fn push(&mut self, point: MonitorPoint) {
        if self.points.len() < self.points.capacity() {
            self.points.push(point);
            self.index = self.points.len() - 1;
        } else {
            self.index = (self.index + 1) % self.points.len();
            self.points[self.index] = point;
        }
        self.count = self.points.len();
    }

    /// Point `back` steps behind the most recent one (0 = most recent).
    fn at(&self, back: usize) -> &MonitorPoint {
        debug_assert!(back < self.count);
        let cap = self.points.len();
        let idx = (self.index + cap - back) % cap;
        &self.points[idx]
    }

    /// Aggregate over the last `interval_us` of reception time, bounded by
    /// the number of stored points.
    ///
    /// Walks backward from the most recent point; the first pass accumulates
    /// bytes, reception delay and sequence gaps, the second pass computes the
    /// jitter and packet-size deviations.
    pub fn query(&self, interval_us: u64) -> Result<StreamStats> {
        if interval_us == 0 {
            return Err(StreamError::Configuration(
                "monitoring interval must be non-zero".into(),
            ));
        }
        if self.count == 0 {
            return Err(StreamError::Configuration(
                "no packets observed yet".into(),
            ));
        }

        let newest = self.at(0);
        let horizon = newest.recv_ts_us.saturating_sub(interval_us);

        // First pass: locate the window and accumulate the sums.
        let mut included = 0usize;
        let mut bytes: u64 = 0;
        let mut delay_sum: i64 = 0;
        let mut missed: u32 = 0;
        for back in 0..self.count {
            let p = self.at(back);
            if p.recv_ts_us < horizon {
                break;
            }
            bytes += p.bytes as u64;
            delay_sum += p.recv_ts_us as i64 - media_ts_to_us(p.media_ts) as i64;
            if back > 0 {
                let newer = self.at(back - 1);
                let delta = newer.seq_num.wrapping_sub(p.seq_num) as i16;
                if delta > 1 {
                    missed += (delta - 1) as u32;
                }
            }
            included += 1;
        }

        let oldest = self.at(included - 1);
        let n = included as f64;
        let mean_delay = delay_sum as f64 / n;
        let mean_size = bytes as f64 / n;

        // Second pass: variances.
        let mut delay_var = 0.0f64;
        let mut size_var = 0.0f64;
        for back in 0..included {
            let p = self.at(back);
            let delay = (p.recv_ts_us as i64 - media_ts_to_us(p.media_ts) as i64) as f64;
            delay_var += (delay - mean_delay) * (delay - mean_delay);
            size_var += (p.bytes as f64 - mean_size) * (p.bytes as f64 - mean_size);
        }
        delay_var /= n;
        size_var /= n;

        Ok(StreamStats {
            real_interval_us: newest.recv_ts_us - oldest.recv_ts_us,
            jitter_us: delay_var.sqrt().round() as u64,
            bytes_received: bytes,
            mean_packet_size: mean_size.round() as u32,
            packet_size_std_dev: size_var.sqrt().round() as u32,
            packets_received: included as u32,
            packets_missed: missed,
        })
    }
}

impl Default for MonitorRing {
    fn default() -> Self {
        Self::new()
    }
}
