// Copyright (c) 2025 Skystream Contributors
// SPDX-License-Identifier: Apache-2.0

//! Real-time packetized stream reader (Engine B).
//!
//! Depacketizes an RTP-style H.264 elementary stream received directly over
//! UDP (unicast or multicast) into NAL units, per RFC 6184: single-NAL,
//! FU-A fragmentation, and STAP-A aggregation. Completed units are handed to
//! the consumer through the buffer-handoff protocol; every received packet
//! also lands in the monitoring ring for the windowed statistics query.
//!
//! The receive worker is a long-lived blocking loop meant for an externally
//! spawned thread. A reserved send worker idles until stop so the two-worker
//! teardown discipline matches the fragmented-stream engine.

use std::any::Any;
use std::mem;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::buffers::{CompletedNalu, NaluConsumer};
use crate::core::error::{Result, StreamError};
use crate::core::monitor::{MonitorPoint, MonitorRing, StreamStats};
use crate::core::socket::bind_recv_socket;
use crate::core::wire::RtpHeader;

/// H.264 NAL unit types carried in the low 5 bits of the payload head.
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// Annex B start code prepended when `insert_start_codes` is set.
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Default datagram ceiling: 1500-byte Ethernet MTU minus IP/UDP headers.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;

/// Pause between send-worker stop polls while the worker is reserved.
const SEND_IDLE: Duration = Duration::from_millis(10);

/// Receive configuration for the packetized stream.
#[derive(Debug, Clone)]
pub struct NaluReaderConfig {
    /// Multicast group to join (first octet 224..=239) or expected unicast
    /// source; `None` binds unicast on the interface address.
    pub recv_addr: Option<Ipv4Addr>,
    /// Local interface to bind / use as the multicast member interface.
    pub iface_addr: Option<Ipv4Addr>,
    pub recv_port: u16,
    pub recv_timeout: Duration,
    /// Largest accepted datagram; `0` selects [`DEFAULT_MAX_PACKET_SIZE`].
    pub max_packet_size: usize,
    /// Prepend the 4-byte Annex B start code to every delivered NAL unit.
    pub insert_start_codes: bool,
}

impl Default for NaluReaderConfig {
    fn default() -> Self {
        Self {
            recv_addr: None,
            iface_addr: None,
            recv_port: 5004,
            recv_timeout: Duration::from_secs(5),
            max_packet_size: 0,
            insert_start_codes: true,
        }
    }
}

impl NaluReaderConfig {
    fn validate(&self) -> Result<()> {
        if self.recv_port == 0 {
            return Err(StreamError::Configuration(
                "receive port must be non-zero".into(),
            ));
        }
        if self.recv_timeout.is_zero() {
            return Err(StreamError::Configuration(
                "receive timeout must be non-zero".into(),
            ));
        }
        if self.max_packet_size != 0 && self.max_packet_size <= RtpHeader::SIZE {
            return Err(StreamError::Configuration(format!(
                "max packet size {} cannot hold the {}-byte header",
                self.max_packet_size,
                RtpHeader::SIZE
            )));
        }
        Ok(())
    }

    fn effective_max_packet_size(&self) -> usize {
        if self.max_packet_size == 0 {
            DEFAULT_MAX_PACKET_SIZE
        } else {
            self.max_packet_size
        }
    }
}

/// Worker lifecycle flags, guarded by the stream mutex.
#[derive(Debug, Default)]
struct StreamState {
    recv_started: bool,
    send_started: bool,
    closed: bool,
}

/// Monitoring ring plus the first-packet media-timestamp anchor, guarded by
/// the monitoring mutex.
#[derive(Debug, Default)]
struct MonitorState {
    ring: MonitorRing,
    first_media_ts: Option<u32>,
}

/// NAL-unit assembly state machine, owned by the receive worker.
///
/// Socket-free on purpose: the worker feeds it parsed headers and payloads,
/// tests feed it hand-built packets.
pub(crate) struct NaluAssembly {
    consumer: Box<dyn NaluConsumer>,
    insert_start_codes: bool,
    buffer: Vec<u8>,
    size: usize,
    fu_pending: bool,
    previous_seq: Option<u16>,
    previous_timestamp: Option<u32>,
    /// Sequence gaps inside the current access unit.
    gaps: u32,
    /// Sequence number that began the current access unit.
    au_start_seq: Option<u16>,
    /// Payload bytes seen in the current access unit.
    au_bytes: usize,
}

impl NaluAssembly {
    pub(crate) fn new(
        consumer: Box<dyn NaluConsumer>,
        buffer: Vec<u8>,
        insert_start_codes: bool,
    ) -> Self {
        Self {
            consumer,
            insert_start_codes,
            buffer,
            size: 0,
            fu_pending: false,
            previous_seq: None,
            previous_timestamp: None,
            gaps: 0,
            au_start_seq: None,
            au_bytes: 0,
        }
    }

    /// Drive the state machine with one parsed datagram.
    pub(crate) fn process(&mut self, header: &RtpHeader, payload: &[u8]) {
        // Signed mod-2^16 delta screens reordered packets out; the previous
        // sequence number is deliberately left untouched for them.
        let delta = match self.previous_seq {
            None => 1,
            Some(prev) => i32::from(header.seq_num.wrapping_sub(prev) as i16),
        };
        if delta <= 0 {
            tracing::debug!(
                seq = header.seq_num,
                delta,
                "out-of-order packet dropped"
            );
            return;
        }
        self.previous_seq = Some(header.seq_num);
        self.gaps += (delta - 1) as u32;

        if let Some(prev_ts) = self.previous_timestamp {
            if prev_ts != header.timestamp && self.gaps > 0 {
                tracing::debug!(
                    timestamp = prev_ts,
                    gaps = self.gaps,
                    "access unit ended incomplete"
                );
            }
        }
        self.previous_timestamp = Some(header.timestamp);
        if self.au_start_seq.is_none() {
            self.au_start_seq = Some(header.seq_num);
        }
        self.au_bytes += payload.len();

        if payload.is_empty() {
            tracing::trace!(seq = header.seq_num, "empty payload, nothing to assemble");
            return;
        }

        match payload[0] & 0x1F {
            NAL_TYPE_FU_A => self.process_fu_a(header, payload),
            NAL_TYPE_STAP_A => self.process_stap_a(header, payload),
            _ => self.process_single(header, payload),
        }

        if header.marker() {
            tracing::trace!(
                seq = header.seq_num,
                bytes = self.au_bytes,
                "access unit boundary"
            );
            self.gaps = 0;
            self.au_bytes = 0;
            self.au_start_seq = None;
        }
    }

    /// Fragmentation unit: synthesize the NAL header byte from the FU
    /// indicator and FU header, then concatenate fragment payloads.
    fn process_fu_a(&mut self, header: &RtpHeader, payload: &[u8]) {
        if payload.len() < 2 {
            tracing::trace!(seq = header.seq_num, "fragmentation unit too small, dropped");
            return;
        }
        let fu_indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            if self.fu_pending {
                tracing::debug!(
                    seq = header.seq_num,
                    "new fragmented unit started, abandoning pending one"
                );
            }
            self.fu_pending = true;
            self.size = 0;
            let nal_header = (fu_indicator & 0xE0) | (fu_header & 0x1F);
            if self.insert_start_codes {
                self.append(&START_CODE);
            }
            self.append(&[nal_header]);
            self.append(&payload[2..]);
        } else if self.fu_pending {
            self.append(&payload[2..]);
        } else {
            // Mid-stream join: fragments before the next start are useless.
            tracing::trace!(seq = header.seq_num, "fragment without start, dropped");
            return;
        }

        if end {
            self.fu_pending = false;
            self.complete(header, header.marker());
        }
    }

    /// Aggregation packet: 2-byte big-endian size-prefixed NAL units, each
    /// delivered as its own completion.
    fn process_stap_a(&mut self, header: &RtpHeader, payload: &[u8]) {
        if self.fu_pending {
            tracing::debug!(
                seq = header.seq_num,
                "aggregate interrupts pending fragmented unit, abandoning it"
            );
            self.fu_pending = false;
        }

        let mut units: Vec<(usize, usize)> = Vec::new();
        let mut offset = 1;
        while offset + 2 <= payload.len() {
            let nal_size =
                u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
            offset += 2;
            if nal_size == 0 {
                continue;
            }
            if offset + nal_size > payload.len() {
                tracing::warn!(
                    seq = header.seq_num,
                    nal_size,
                    remaining = payload.len() - offset,
                    "aggregate unit size exceeds packet bounds, rest dropped"
                );
                break;
            }
            units.push((offset, offset + nal_size));
            offset += nal_size;
        }

        let last_index = units.len().saturating_sub(1);
        for (i, (from, to)) in units.into_iter().enumerate() {
            self.size = 0;
            if self.insert_start_codes {
                self.append(&START_CODE);
            }
            self.append(&payload[from..to]);
            self.complete(header, header.marker() && i == last_index);
        }
    }

    /// Single NAL unit carried whole in one packet.
    fn process_single(&mut self, header: &RtpHeader, payload: &[u8]) {
        if self.fu_pending {
            tracing::debug!(
                seq = header.seq_num,
                "single unit interrupts pending fragmented unit, abandoning it"
            );
            self.fu_pending = false;
        }
        self.size = 0;
        if self.insert_start_codes {
            self.append(&START_CODE);
        }
        self.append(payload);
        self.complete(header, header.marker());
    }

    /// Append with the growth handoff: when the buffer cannot take `data`,
    /// ask the consumer for `size + data.len()` bytes, migrate the prefix on
    /// success, otherwise drop this write. The returned buffer is adopted
    /// either way.
    fn append(&mut self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let needed = self.size + data.len();
        if needed > self.buffer.len() {
            let mut grant = self.consumer.buffer_too_small(needed);
            let granted = grant.len() >= needed;
            if granted {
                grant[..self.size].copy_from_slice(&self.buffer[..self.size]);
            } else {
                tracing::debug!(
                    needed,
                    granted = grant.len(),
                    "buffer grant refused, dropping write"
                );
            }
            let retired = mem::replace(&mut self.buffer, grant);
            self.consumer.copy_complete(retired);
            if !granted {
                // The accumulated prefix went back with the retired buffer.
                self.size = 0;
                return false;
            }
        }
        self.buffer[self.size..self.size + data.len()].copy_from_slice(data);
        self.size += data.len();
        true
    }

    fn complete(&mut self, header: &RtpHeader, last_of_au: bool) {
        let first_of_au = self.au_start_seq == Some(header.seq_num);
        let buffer = mem::take(&mut self.buffer);
        let size = self.size;
        tracing::trace!(
            seq = header.seq_num,
            size,
            first_of_au,
            last_of_au,
            "NAL unit complete"
        );
        self.buffer = self.consumer.nalu_complete(CompletedNalu {
            buffer,
            size,
            timestamp_us: header.timestamp_us(),
            first_of_au,
            last_of_au,
            seq_gaps: self.gaps,
        });
        self.size = 0;
    }

    fn cancel(mut self) {
        let buffer = mem::take(&mut self.buffer);
        let size = self.size;
        self.consumer.cancel(buffer, size);
    }
}

/// Receive side of the real-time packetized video stream.
pub struct NaluStreamReader {
    config: NaluReaderConfig,
    custom: Box<dyn Any + Send + Sync>,
    stop: AtomicBool,
    stream: Mutex<StreamState>,
    monitor: Mutex<MonitorState>,
    /// Taken by the receive worker when it starts; `None` afterwards.
    assembly: Mutex<Option<NaluAssembly>>,
    /// Zero point of the monotonic reception clock.
    epoch: Instant,
}

impl NaluStreamReader {
    /// Create a reader with a validated configuration. `buffer` is the
    /// consumer's initial loan; `custom` is an opaque token retrievable via
    /// [`custom`](Self::custom).
    pub fn new(
        config: NaluReaderConfig,
        consumer: Box<dyn NaluConsumer>,
        buffer: Vec<u8>,
        custom: Box<dyn Any + Send + Sync>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if buffer.is_empty() {
            return Err(StreamError::Configuration(
                "initial NAL buffer must have non-zero capacity".into(),
            ));
        }
        let insert = config.insert_start_codes;
        Ok(Arc::new(Self {
            config,
            custom,
            stop: AtomicBool::new(false),
            stream: Mutex::new(StreamState::default()),
            monitor: Mutex::new(MonitorState::default()),
            assembly: Mutex::new(Some(NaluAssembly::new(consumer, buffer, insert))),
            epoch: Instant::now(),
        }))
    }

    /// Receive worker entry point. Binds the socket, then reads datagrams
    /// until `stop` is observed. Bind failure is fatal to the worker only:
    /// it logs, returns the buffer through `cancel`, and exits with its
    /// started flag clear.
    pub fn run_recv_worker(&self) {
        {
            let mut stream = self.stream.lock();
            if stream.recv_started {
                tracing::warn!("receive worker already running, ignoring second start");
                return;
            }
            stream.recv_started = true;
        }
        let taken = self.assembly.lock().take();
        let Some(mut assembly) = taken else {
            tracing::warn!("receive worker has no assembly state (already consumed)");
            self.stream.lock().recv_started = false;
            return;
        };

        let socket = match bind_recv_socket(
            self.config.recv_addr,
            self.config.iface_addr,
            self.config.recv_port,
            self.config.recv_timeout,
        ) {
            Ok(socket) => socket,
            Err(e) => {
                tracing::error!(port = self.config.recv_port, "socket setup failed: {}", e);
                assembly.cancel();
                self.stream.lock().recv_started = false;
                return;
            }
        };
        tracing::info!(port = self.config.recv_port, "stream receive worker started");

        let mut scratch = vec![0u8; self.config.effective_max_packet_size()];
        while !self.stop.load(Ordering::Relaxed) {
            let len = match socket.recv(&mut scratch) {
                Ok(len) => len,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::warn!("datagram receive failed: {}", e);
                    continue;
                }
            };
            // Datagrams shorter than the header are discarded silently.
            let Some(header) = RtpHeader::parse(&scratch[..len]) else {
                continue;
            };
            self.record_packet(&header, len);
            assembly.process(&header, &scratch[RtpHeader::SIZE..len]);
        }

        assembly.cancel();
        drop(socket);
        tracing::info!("stream receive worker stopped");
        self.stream.lock().recv_started = false;
    }

    /// Reserved send worker. Holds its started flag and idles until `stop`;
    /// kept so teardown waits on the same two-worker discipline as the
    /// fragmented-stream engine.
    pub fn run_send_worker(&self) {
        {
            let mut stream = self.stream.lock();
            if stream.send_started {
                tracing::warn!("send worker already running, ignoring second start");
                return;
            }
            stream.send_started = true;
        }
        tracing::debug!("stream send worker started (reserved)");
        while !self.stop.load(Ordering::Relaxed) {
            std::thread::sleep(SEND_IDLE);
        }
        tracing::debug!("stream send worker stopped");
        self.stream.lock().send_started = false;
    }

    /// Record one packet in the monitoring ring.
    pub(crate) fn record_packet(&self, header: &RtpHeader, len: usize) {
        let recv_ts_us = self.epoch.elapsed().as_micros() as u64;
        let mut monitor = self.monitor.lock();
        if monitor.first_media_ts.is_none() {
            monitor.first_media_ts = Some(header.timestamp);
        }
        monitor.ring.push(MonitorPoint {
            recv_ts_us,
            media_ts: header.timestamp,
            seq_num: header.seq_num,
            marker: header.marker(),
            bytes: len as u32,
        });
    }

    /// Aggregate reception statistics over the last `interval`.
    pub fn monitoring(&self, interval: Duration) -> Result<StreamStats> {
        let monitor = self.monitor.lock();
        monitor.ring.query(interval.as_micros() as u64)
    }

    /// Media timestamp of the first received packet, for consumers that
    /// align their own clock to the stream.
    pub fn first_media_timestamp(&self) -> Option<u32> {
        self.monitor.lock().first_media_ts
    }

    /// The opaque token supplied at construction.
    pub fn custom(&self) -> &(dyn Any + Send + Sync) {
        &*self.custom
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
        let mut stream = self.stream.lock();
        if stream.closed {
            return Err(StreamError::Configuration("reader already closed".into()));
        }
        if stream.recv_started || stream.send_started {
            return Err(StreamError::Busy("workers have not observed stop yet"));
        }
        stream.closed = true;
        Ok(())
    }

    /// True once both workers have exited.
    pub fn is_stopped(&self) -> bool {
        let stream = self.stream.lock();
        !stream.recv_started && !stream.send_started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffers::testing::{NaluEvent, RecordingNaluConsumer};
    use std::net::UdpSocket;
    use std::time::Instant;

    fn header(seq: u16, ts: u32, marker: bool) -> RtpHeader {
        RtpHeader {
            flags: 0x8000 | (if marker { 0x80 } else { 0 }) | 96,
            seq_num: seq,
            timestamp: ts,
            ssrc: 0x1122_3344,
        }
    }

    fn assembly(
        capacity: usize,
        insert_start_codes: bool,
        grant: bool,
    ) -> (NaluAssembly, Arc<Mutex<Vec<NaluEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let consumer = RecordingNaluConsumer {
            events: Arc::clone(&events),
            grant,
        };
        (
            NaluAssembly::new(Box::new(consumer), vec![0u8; capacity], insert_start_codes),
            events,
        )
    }

    fn completions(events: &Mutex<Vec<NaluEvent>>) -> Vec<(usize, u64, bool, bool, u32, Vec<u8>)> {
        events
            .lock()
            .iter()
            .filter_map(|e| match e {
                NaluEvent::Complete {
                    size,
                    timestamp_us,
                    first_of_au,
                    last_of_au,
                    seq_gaps,
                    data,
                } => Some((*size, *timestamp_us, *first_of_au, *last_of_au, *seq_gaps, data.clone())),
                _ => None,
            })
            .collect()
    }

    /// Split `nal` into FU-A payloads: the NAL header byte moves into the
    /// FU indicator/header pair, the body is chunked.
    fn fu_a_payloads(nal: &[u8], chunk: usize) -> Vec<Vec<u8>> {
        let fu_indicator = (nal[0] & 0xE0) | NAL_TYPE_FU_A;
        let chunks: Vec<&[u8]> = nal[1..].chunks(chunk).collect();
        let last = chunks.len() - 1;
        chunks
            .iter()
            .enumerate()
            .map(|(i, body)| {
                let mut fu_header = nal[0] & 0x1F;
                if i == 0 {
                    fu_header |= 0x80;
                }
                if i == last {
                    fu_header |= 0x40;
                }
                let mut payload = vec![fu_indicator, fu_header];
                payload.extend_from_slice(body);
                payload
            })
            .collect()
    }

    #[test]
    fn test_single_nalu_with_marker() {
        // S5: one packet, single NAL, marker set.
        let (mut asm, events) = assembly(1024, false, true);
        let payload = vec![0x65, 0x01, 0x02, 0x03];
        asm.process(&header(100, 90_000, true), &payload);

        let completes = completions(&events);
        assert_eq!(completes.len(), 1);
        let (size, ts_us, first, last, gaps, data) = completes[0].clone();
        assert_eq!(size, 4);
        assert_eq!(ts_us, 1_000_000);
        assert!(first);
        assert!(last);
        assert_eq!(gaps, 0);
        assert_eq!(data, payload);
    }

    #[test]
    fn test_single_nalu_start_code_inserted() {
        let (mut asm, events) = assembly(1024, true, true);
        let payload = vec![0x41, 0xAA, 0xBB];
        asm.process(&header(7, 0, false), &payload);

        let completes = completions(&events);
        assert_eq!(completes.len(), 1);
        let mut expected = START_CODE.to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(completes[0].5, expected);
        assert!(!completes[0].3, "marker clear, not last of access unit");
    }

    #[test]
    fn test_fu_a_reassembly() {
        // S4: a 5000-byte NAL carried in five fragments, marker on the last.
        let mut nal = vec![0x65u8];
        nal.extend((0..4999).map(|i| (i % 251) as u8));
        let payloads = fu_a_payloads(&nal, 1000);
        assert_eq!(payloads.len(), 5);

        let (mut asm, events) = assembly(8192, true, true);
        for (i, payload) in payloads.iter().enumerate() {
            let seq = 100 + i as u16;
            asm.process(&header(seq, 180_000, i == 4), payload);
        }

        let completes = completions(&events);
        assert_eq!(completes.len(), 1);
        let (size, ts_us, first, last, gaps, data) = completes[0].clone();
        // Start code + reconstructed header byte + concatenated fragments.
        let mut expected = START_CODE.to_vec();
        expected.extend_from_slice(&nal);
        assert_eq!(size, 5004);
        assert_eq!(data, expected);
        assert_eq!(ts_us, 2_000_000);
        assert!(!first, "unit completes four packets after the access unit started");
        assert!(last);
        assert_eq!(gaps, 0);
    }

    #[test]
    fn test_fu_a_restart_abandons_pending_unit() {
        let first_nal = vec![0x65, 1, 1, 1, 1, 1, 1];
        let second_nal = vec![0x61, 2, 2, 2];
        let (mut asm, events) = assembly(1024, false, true);

        // Start of the first unit, never finished.
        asm.process(&header(10, 9_000, false), &fu_a_payloads(&first_nal, 3)[0]);
        // Full second unit.
        for (i, payload) in fu_a_payloads(&second_nal, 2).iter().enumerate() {
            asm.process(&header(11 + i as u16, 9_090, i == 1), payload);
        }

        let completes = completions(&events);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].5, second_nal);
    }

    #[test]
    fn test_fu_a_mid_stream_join_dropped() {
        // Middle and end fragments without a start: nothing is delivered.
        let nal = vec![0x65, 9, 9, 9, 9, 9, 9];
        let payloads = fu_a_payloads(&nal, 2);
        let (mut asm, events) = assembly(1024, false, true);
        asm.process(&header(50, 0, false), &payloads[1]);
        asm.process(&header(51, 0, true), &payloads[2]);
        assert!(completions(&events).is_empty());
    }

    #[test]
    fn test_stap_a_aggregate_delivers_each_unit() {
        let unit_a = vec![0x67, 0x42, 0x00];
        let unit_b = vec![0x68, 0xCE];
        let unit_c = vec![0x65, 0x11, 0x22, 0x33];
        let mut payload = vec![0x78]; // STAP-A with NRI 3
        for unit in [&unit_a, &unit_b, &unit_c] {
            payload.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            payload.extend_from_slice(unit);
        }

        let (mut asm, events) = assembly(1024, false, true);
        asm.process(&header(30, 45_000, true), &payload);

        let completes = completions(&events);
        assert_eq!(completes.len(), 3);
        assert_eq!(completes[0].5, unit_a);
        assert_eq!(completes[1].5, unit_b);
        assert_eq!(completes[2].5, unit_c);
        // Marker maps to last-of-AU only on the final aggregated unit.
        assert!(!completes[0].3);
        assert!(!completes[1].3);
        assert!(completes[2].3);
    }

    #[test]
    fn test_stap_a_truncated_size_drops_remainder() {
        let unit_a = vec![0x67, 0x42];
        let mut payload = vec![0x78];
        payload.extend_from_slice(&(unit_a.len() as u16).to_be_bytes());
        payload.extend_from_slice(&unit_a);
        // Claimed 100-byte unit with only 2 bytes present.
        payload.extend_from_slice(&100u16.to_be_bytes());
        payload.extend_from_slice(&[0xAB, 0xCD]);

        let (mut asm, events) = assembly(1024, false, true);
        asm.process(&header(31, 0, false), &payload);

        let completes = completions(&events);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].5, unit_a);
    }

    #[test]
    fn test_out_of_order_packet_dropped_without_seq_update() {
        let (mut asm, events) = assembly(1024, false, true);
        asm.process(&header(10, 0, false), &[0x61, 1]);
        // Stale packet: dropped, and must not move previous_seq back.
        asm.process(&header(9, 0, false), &[0x61, 2]);
        asm.process(&header(11, 0, false), &[0x61, 3]);

        let completes = completions(&events);
        assert_eq!(completes.len(), 2);
        // Had previous_seq regressed to 9, the delta 9 -> 11 would report a gap.
        assert_eq!(completes[1].4, 0);
    }

    #[test]
    fn test_seq_gaps_accumulate_within_access_unit() {
        let (mut asm, events) = assembly(1024, false, true);
        asm.process(&header(10, 0, false), &[0x61, 1]);
        // Two packets lost before seq 13.
        asm.process(&header(13, 0, false), &[0x61, 2]);
        let completes = completions(&events);
        assert_eq!(completes[1].4, 2);
    }

    #[test]
    fn test_marker_resets_gap_counter_and_au_start() {
        let (mut asm, events) = assembly(1024, false, true);
        asm.process(&header(5, 0, false), &[0x61, 1]);
        asm.process(&header(8, 0, true), &[0x61, 2]); // gaps 2, then boundary
        asm.process(&header(9, 90, false), &[0x61, 3]);

        let completes = completions(&events);
        assert_eq!(completes.len(), 3);
        assert_eq!(completes[1].4, 2);
        // Fresh access unit: zero gaps, and seq 9 is its first unit.
        assert_eq!(completes[2].4, 0);
        assert!(completes[2].2);
    }

    #[test]
    fn test_buffer_growth_migrates_prefix() {
        let mut nal = vec![0x65u8];
        nal.extend((0..99).map(|i| i as u8));
        let (mut asm, events) = assembly(8, false, true);
        for (i, payload) in fu_a_payloads(&nal, 10).iter().enumerate() {
            asm.process(&header(i as u16, 0, false), payload);
        }

        let evs = events.lock();
        assert!(evs.iter().any(|e| matches!(e, NaluEvent::TooSmall { .. })));
        assert!(evs.iter().any(|e| matches!(e, NaluEvent::CopyComplete)));
        drop(evs);
        let completes = completions(&events);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].5, nal);
    }

    #[test]
    fn test_refused_grant_drops_write() {
        let (mut asm, events) = assembly(2, false, false);
        asm.process(&header(1, 0, true), &[0x65, 1, 2, 3, 4, 5, 6, 7, 8, 9]);

        let evs = events.lock();
        assert!(matches!(evs[0], NaluEvent::TooSmall { needed: 10 }));
        assert!(matches!(evs[1], NaluEvent::CopyComplete));
        // The write was dropped; completion reports an empty unit.
        assert!(matches!(evs[2], NaluEvent::Complete { size: 0, .. }));
    }

    fn test_config(port: u16) -> NaluReaderConfig {
        NaluReaderConfig {
            recv_addr: None,
            iface_addr: Some(Ipv4Addr::LOCALHOST),
            recv_port: port,
            recv_timeout: Duration::from_millis(100),
            max_packet_size: 0,
            insert_start_codes: false,
        }
    }

    fn recording_reader(
        config: NaluReaderConfig,
    ) -> (Arc<NaluStreamReader>, Arc<Mutex<Vec<NaluEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let consumer = RecordingNaluConsumer {
            events: Arc::clone(&events),
            grant: true,
        };
        let reader = NaluStreamReader::new(
            config,
            Box::new(consumer),
            vec![0u8; 2048],
            Box::new(()),
        )
        .unwrap();
        (reader, events)
    }

    #[test]
    fn test_config_validation() {
        let bad_port = NaluReaderConfig {
            recv_port: 0,
            ..NaluReaderConfig::default()
        };
        assert!(matches!(
            bad_port.validate(),
            Err(StreamError::Configuration(_))
        ));

        let bad_timeout = NaluReaderConfig {
            recv_timeout: Duration::ZERO,
            ..NaluReaderConfig::default()
        };
        assert!(matches!(
            bad_timeout.validate(),
            Err(StreamError::Configuration(_))
        ));

        let bad_size = NaluReaderConfig {
            max_packet_size: 8,
            ..NaluReaderConfig::default()
        };
        assert!(matches!(
            bad_size.validate(),
            Err(StreamError::Configuration(_))
        ));

        assert_eq!(
            NaluReaderConfig::default().effective_max_packet_size(),
            DEFAULT_MAX_PACKET_SIZE
        );
    }

    #[test]
    fn test_new_rejects_empty_buffer() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let consumer = RecordingNaluConsumer { events, grant: true };
        assert!(matches!(
            NaluStreamReader::new(
                test_config(5004),
                Box::new(consumer),
                Vec::new(),
                Box::new(()),
            ),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_custom_token_roundtrip() {
        let (reader, _events) = recording_reader(test_config(5004));
        let token = reader.custom().downcast_ref::<()>();
        assert!(token.is_some());

        let events = Arc::new(Mutex::new(Vec::new()));
        let consumer = RecordingNaluConsumer { events, grant: true };
        let reader = NaluStreamReader::new(
            test_config(5004),
            Box::new(consumer),
            vec![0u8; 64],
            Box::new(42u32),
        )
        .unwrap();
        assert_eq!(reader.custom().downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_monitoring_counts_received_and_missed() {
        // S6 shape: 1000 packets with three singles dropped.
        let (reader, _events) = recording_reader(test_config(5004));
        for seq in 0..1000u16 {
            if matches!(seq, 100 | 200 | 300) {
                continue;
            }
            reader.record_packet(&header(seq, seq as u32 * 90, false), 1400);
        }
        let stats = reader.monitoring(Duration::from_secs(1)).unwrap();
        assert_eq!(stats.packets_received, 997);
        assert_eq!(stats.packets_missed, 3);
        assert_eq!(stats.mean_packet_size, 1400);
        assert_eq!(stats.packet_size_std_dev, 0);
        assert_eq!(reader.first_media_timestamp(), Some(0));
    }

    #[test]
    fn test_monitoring_before_any_packet_errors() {
        let (reader, _events) = recording_reader(test_config(5004));
        assert!(matches!(
            reader.monitoring(Duration::from_secs(1)),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_udp_receive_and_lifecycle() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        // Reserve a free localhost port.
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let (reader, events) = recording_reader(test_config(port));
        let recv = Arc::clone(&reader);
        let recv_thread = std::thread::spawn(move || recv.run_recv_worker());
        let send = Arc::clone(&reader);
        let send_thread = std::thread::spawn(move || send.run_send_worker());

        // Workers are running: teardown must be refused.
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(reader.close(), Err(StreamError::Busy(_))));

        // Feed single-NAL packets until one is delivered (resend covers the
        // window before the worker's bind completes).
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut packet = header(1, 90_000, true).encode().to_vec();
        packet.extend_from_slice(&[0x65, 0xDE, 0xAD, 0xBE, 0xEF]);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            sender.send_to(&packet, ("127.0.0.1", port)).unwrap();
            std::thread::sleep(Duration::from_millis(10));
            let delivered = events
                .lock()
                .iter()
                .any(|e| matches!(e, NaluEvent::Complete { .. }));
            if delivered {
                break;
            }
            assert!(Instant::now() < deadline, "no NAL unit delivered over UDP");
        }

        let stats = reader.monitoring(Duration::from_secs(5)).unwrap();
        assert!(stats.packets_received >= 1);
        assert!(stats.bytes_received >= packet.len() as u64);

        reader.stop();
        recv_thread.join().unwrap();
        send_thread.join().unwrap();
        assert!(reader.is_stopped());
        assert!(matches!(
            events.lock().last(),
            Some(NaluEvent::Cancel { .. })
        ));
        reader.close().unwrap();
        assert!(matches!(
            reader.close(),
            Err(StreamError::Configuration(_))
        ));
    }
}
