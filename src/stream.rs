//! One data connection and its accumulated results.
//!
//! A [`Stream`] is owned by its test's coordinator. The pieces a worker
//! task touches concurrently live in [`StreamShared`]: atomic byte
//! counters, the done flag and cancellation token, and the UDP receive
//! state behind a mutex. Pacing is decided inside the sender loop.

use crate::measurements::{self, TcpStats};
use crate::protocol::StreamRecord;
use crate::test::TestShared;
use crate::transport::DataSocket;
use crate::worker::WorkerExit;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Byte and block counters a worker increments while the test runs.
#[derive(Debug, Default)]
pub struct StreamCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub blocks_sent: AtomicU64,
    pub blocks_received: AtomicU64,
    pub interval_bytes_sent: AtomicU64,
    pub interval_bytes_received: AtomicU64,
}

impl StreamCounters {
    pub fn add_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.interval_bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.blocks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.interval_bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.blocks_received.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        for counter in [
            &self.bytes_sent,
            &self.bytes_received,
            &self.blocks_sent,
            &self.blocks_received,
            &self.interval_bytes_sent,
            &self.interval_bytes_received,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Loss, reordering and jitter tracking for a receiving UDP stream.
///
/// The estimator only looks at the highest sequence number seen so far:
/// a late packet counts as out of order and cancels one previously counted
/// loss. Reorderings that overlap a gap can therefore under-count loss;
/// peers compute their statistics the same way, so this is kept as is.
///
/// # Examples
///
/// ```
/// use rsperf::stream::UdpReceiveState;
///
/// let mut state = UdpReceiveState::default();
/// for seq in [1, 2, 3, 5, 4, 6] {
///     state.on_packet(seq, 0.010);
/// }
/// assert_eq!(state.out_of_order, 1);
/// assert_eq!(state.errors, 0);
/// assert_eq!(state.packet_count, 6);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UdpReceiveState {
    /// Highest sequence number observed
    pub packet_count: u64,
    /// Smoothed jitter in seconds
    pub jitter: f64,
    prev_transit: Option<f64>,
    pub out_of_order: u64,
    /// Inferred lost packets
    pub errors: u64,
    pub omitted_packet_count: u64,
    pub omitted_errors: u64,
    pub omitted_out_of_order: u64,
    interval_packet_count: u64,
    interval_errors: u64,
    interval_out_of_order: u64,
}

/// UDP counter changes over one stats interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UdpDelta {
    pub packets: i64,
    pub errors: i64,
    pub out_of_order: i64,
    pub jitter: f64,
}

impl UdpReceiveState {
    /// Accounts one datagram with sequence `seq` and one-way transit time
    /// `transit` in seconds.
    pub fn on_packet(&mut self, seq: u64, transit: f64) {
        let expected = self.packet_count + 1;
        if seq >= expected {
            if seq > expected {
                self.errors += seq - expected;
            }
            self.packet_count = seq;
        } else {
            self.out_of_order += 1;
            if self.errors > 0 {
                self.errors -= 1;
            }
        }

        // RFC 1889 interarrival jitter.
        let prev = self.prev_transit.unwrap_or(transit);
        let d = (transit - prev).abs();
        self.prev_transit = Some(transit);
        self.jitter += (d - self.jitter) / 16.0;
    }

    /// Counts reported after the omit period.
    pub fn measured_packets(&self) -> u64 {
        self.packet_count.saturating_sub(self.omitted_packet_count)
    }

    pub fn measured_errors(&self) -> i64 {
        self.errors as i64 - self.omitted_errors as i64
    }

    pub fn measured_out_of_order(&self) -> u64 {
        self.out_of_order.saturating_sub(self.omitted_out_of_order)
    }

    /// Marks the end of the omit period.
    pub fn snapshot_omit(&mut self) {
        self.omitted_packet_count = self.packet_count;
        self.omitted_errors = self.errors;
        self.omitted_out_of_order = self.out_of_order;
        self.jitter = 0.0;
    }

    /// Changes since the previous call.
    pub fn take_interval(&mut self) -> UdpDelta {
        let delta = UdpDelta {
            packets: self.packet_count as i64 - self.interval_packet_count as i64,
            errors: self.errors as i64 - self.interval_errors as i64,
            out_of_order: self.out_of_order as i64 - self.interval_out_of_order as i64,
            jitter: self.jitter,
        };
        self.interval_packet_count = self.packet_count;
        self.interval_errors = self.errors;
        self.interval_out_of_order = self.out_of_order;
        delta
    }
}

/// State shared between a stream's coordinator and its worker task.
#[derive(Debug)]
pub struct StreamShared {
    pub id: u32,
    pub sender: bool,
    pub counters: StreamCounters,
    pub udp: Mutex<UdpReceiveState>,
    /// Last UDP sequence number sent
    udp_sequence: AtomicU64,
    done: AtomicBool,
    cancel: CancellationToken,
    test: Weak<TestShared>,
}

impl StreamShared {
    pub fn new(id: u32, sender: bool, test: &Arc<TestShared>) -> Self {
        Self {
            id,
            sender,
            counters: StreamCounters::default(),
            udp: Mutex::new(UdpReceiveState::default()),
            udp_sequence: AtomicU64::new(0),
            done: AtomicBool::new(false),
            cancel: test.cancel_token().child_token(),
            test: Arc::downgrade(test),
        }
    }

    /// The owning test, if it still exists.
    pub fn test(&self) -> Option<Arc<TestShared>> {
        self.test.upgrade()
    }

    /// Sequence number for the next UDP datagram, starting at 1.
    pub fn next_sequence(&self) -> u64 {
        self.udp_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn packets_sent(&self) -> u64 {
        self.udp_sequence.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// First half of stopping a worker: raise the flag, then interrupt any
    /// pending socket operation.
    pub fn signal_done(&self) {
        self.done.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One per-interval snapshot, appended at each stats tick.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalResult {
    pub bytes_transferred: u64,
    /// Seconds since the test started
    pub interval_start: f64,
    pub interval_end: f64,
    pub interval_duration: f64,
    pub omitted: bool,
    pub tcp: Option<TcpStats>,
    pub udp: Option<UdpDelta>,
    /// Datagrams sent during the interval (UDP senders)
    pub packets_sent: Option<u64>,
}

/// Accumulated results of a stream.
#[derive(Debug, Clone)]
pub struct StreamResult {
    pub start_time: Instant,
    /// Start time before any omit reset
    pub start_time_fixed: Instant,
    pub end_time: Option<Instant>,
    pub intervals: Vec<IntervalResult>,
    /// Retransmits counted since the omit period
    pub retransmits: u64,
    pub max_snd_cwnd: u64,
    pub max_rtt: u64,
    pub min_rtt: Option<u64>,
    rtt_sum: u64,
    rtt_count: u64,
    last_total_retrans: Option<u64>,
    last_packets_sent: u64,
    omitted_packets_sent: u64,
}

impl StreamResult {
    fn new(now: Instant) -> Self {
        Self {
            start_time: now,
            start_time_fixed: now,
            end_time: None,
            intervals: Vec::new(),
            retransmits: 0,
            max_snd_cwnd: 0,
            max_rtt: 0,
            min_rtt: None,
            rtt_sum: 0,
            rtt_count: 0,
            last_total_retrans: None,
            last_packets_sent: 0,
            omitted_packets_sent: 0,
        }
    }

    pub fn mean_rtt(&self) -> Option<u64> {
        (self.rtt_count > 0).then(|| self.rtt_sum / self.rtt_count)
    }

    /// Seconds from (post-omit) start to end, or to `now` if still running.
    pub fn seconds(&self, now: Instant) -> f64 {
        self.end_time
            .unwrap_or(now)
            .saturating_duration_since(self.start_time)
            .as_secs_f64()
    }
}

/// A data stream as owned by the test coordinator.
pub struct Stream {
    pub shared: Arc<StreamShared>,
    socket: Option<DataSocket>,
    buffer: Option<Vec<u8>>,
    worker: Option<JoinHandle<WorkerExit>>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub raw_fd: Option<i32>,
    pub result: StreamResult,
    /// What the peer reported for this stream in the result exchange
    pub peer: Option<StreamRecord>,
}

impl Stream {
    /// Wraps a connected socket and pre-fills its send buffer.
    pub fn new(
        id: u32,
        sender: bool,
        socket: DataSocket,
        test: &Arc<TestShared>,
        block_size: usize,
        repeating_payload: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            shared: Arc::new(StreamShared::new(id, sender, test)),
            local_addr: socket.local_addr().ok(),
            remote_addr: socket.peer_addr().ok(),
            raw_fd: socket.raw_fd(),
            socket: Some(socket),
            buffer: Some(fill_buffer(block_size, repeating_payload)),
            worker: None,
            result: StreamResult::new(now),
            peer: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn is_sender(&self) -> bool {
        self.shared.sender
    }

    pub fn socket(&self) -> Option<&DataSocket> {
        self.socket.as_ref()
    }

    /// True once a started worker has returned on its own.
    pub fn worker_finished(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.is_finished())
    }

    /// Hands the socket and buffer to a new worker task.
    pub fn start_worker(&mut self, transport: crate::transport::TransportKind) -> bool {
        if self.worker.is_some() {
            return false;
        }
        let (Some(socket), Some(buffer)) = (self.socket.take(), self.buffer.take()) else {
            return false;
        };
        self.result.start_time_fixed = Instant::now();
        self.worker = Some(crate::worker::spawn(
            self.shared.clone(),
            transport,
            socket,
            buffer,
        ));
        true
    }

    /// Stops the worker: signal, cancel, then join. The socket comes back
    /// to the stream so it is only closed after the worker is gone.
    pub async fn stop_worker(&mut self) -> crate::Result<()> {
        self.shared.signal_done();
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        let exit = handle
            .await
            .map_err(|e| crate::Error::Resource(format!("stream {} worker: {}", self.id(), e)))?;
        self.socket = Some(exit.socket);
        self.buffer = Some(exit.buffer);
        match exit.result {
            Err(e) if e.is_soft() => {
                debug!("Stream {} stopped after soft error: {}", self.id(), e);
                Ok(())
            }
            other => other,
        }
    }

    /// Drops the socket. Must follow [`Stream::stop_worker`].
    pub fn close(&mut self) {
        if self.worker.is_some() {
            warn!("Closing stream {} while its worker is running", self.id());
            self.shared.signal_done();
        }
        self.socket = None;
    }

    /// Appends one interval snapshot covering `start..end` seconds.
    pub fn gather_interval(&mut self, start: f64, end: f64, omitted: bool, tcp: bool) -> &IntervalResult {
        let counters = &self.shared.counters;
        let bytes = if self.shared.sender {
            counters.interval_bytes_sent.swap(0, Ordering::Relaxed)
        } else {
            counters.interval_bytes_received.swap(0, Ordering::Relaxed)
        };

        let mut tcp_stats = None;
        let mut udp = None;
        let mut packets_sent = None;

        if tcp {
            if let Some(stats) = self.raw_fd.and_then(measurements::tcp_stats) {
                if self.shared.sender {
                    let total = stats.retransmits;
                    let delta = total.saturating_sub(self.result.last_total_retrans.unwrap_or(total));
                    self.result.last_total_retrans = Some(total);
                    self.result.retransmits += delta;
                    self.result.max_snd_cwnd = self.result.max_snd_cwnd.max(stats.snd_cwnd.unwrap_or(0));
                    if let Some(rtt) = stats.rtt {
                        self.result.max_rtt = self.result.max_rtt.max(rtt);
                        self.result.min_rtt = Some(self.result.min_rtt.map_or(rtt, |m| m.min(rtt)));
                        self.result.rtt_sum += rtt;
                        self.result.rtt_count += 1;
                    }
                    tcp_stats = Some(TcpStats {
                        retransmits: delta,
                        ..stats
                    });
                } else {
                    tcp_stats = Some(TcpStats {
                        retransmits: 0,
                        ..stats
                    });
                }
            }
        } else if self.shared.sender {
            let sent = self.shared.packets_sent();
            packets_sent = Some(sent - self.result.last_packets_sent);
            self.result.last_packets_sent = sent;
        } else {
            udp = Some(self.shared.udp.lock().take_interval());
        }

        self.result.intervals.push(IntervalResult {
            bytes_transferred: bytes,
            interval_start: start,
            interval_end: end,
            interval_duration: (end - start).max(0.0),
            omitted,
            tcp: tcp_stats,
            udp,
            packets_sent,
        });
        // Just pushed.
        &self.result.intervals[self.result.intervals.len() - 1]
    }

    /// Resets cumulative counters at the end of the omit period. Reported
    /// intervals are kept.
    pub fn reset_stats(&mut self, now: Instant) {
        self.shared.counters.reset();
        self.shared.udp.lock().snapshot_omit();
        self.result.start_time = now;
        self.result.retransmits = 0;
        self.result.max_snd_cwnd = 0;
        self.result.max_rtt = 0;
        self.result.min_rtt = None;
        self.result.rtt_sum = 0;
        self.result.rtt_count = 0;
        self.result.omitted_packets_sent = self.shared.packets_sent();
    }

    pub fn mark_end(&mut self, now: Instant) {
        if self.result.end_time.is_none() {
            self.result.end_time = Some(now);
        }
    }

    /// Datagrams sent since the omit period.
    pub fn measured_packets_sent(&self) -> u64 {
        self.shared
            .packets_sent()
            .saturating_sub(self.result.omitted_packets_sent)
    }

    /// This side's record for the result exchange.
    pub fn record(&self, tcp: bool, now: Instant) -> StreamRecord {
        let counters = &self.shared.counters;
        let seconds = self.result.seconds(now);
        if self.shared.sender {
            StreamRecord {
                id: self.id(),
                bytes: counters.bytes_sent.load(Ordering::Relaxed),
                retransmits: if tcp && measurements::HAS_TCP_INFO {
                    self.result.retransmits as i64
                } else {
                    -1
                },
                jitter: 0.0,
                errors: 0,
                omitted_errors: 0,
                packets: self.measured_packets_sent(),
                omitted_packets: self.result.omitted_packets_sent,
                start_time: 0.0,
                end_time: seconds,
            }
        } else {
            let udp = self.shared.udp.lock();
            StreamRecord {
                id: self.id(),
                bytes: counters.bytes_received.load(Ordering::Relaxed),
                retransmits: -1,
                jitter: udp.jitter,
                errors: udp.measured_errors(),
                omitted_errors: udp.omitted_errors as i64,
                packets: udp.measured_packets(),
                omitted_packets: udp.omitted_packet_count,
                start_time: 0.0,
                end_time: seconds,
            }
        }
    }
}

/// Builds a send buffer of `size` bytes: random, or the digits 0-9 repeated.
pub fn fill_buffer(size: usize, repeating: bool) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    if repeating {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = b'0' + (i % 10) as u8;
        }
    } else {
        rand::thread_rng().fill_bytes(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_sequence() {
        let mut state = UdpReceiveState::default();
        for seq in 1..=100 {
            state.on_packet(seq, 0.001);
        }
        assert_eq!(state.packet_count, 100);
        assert_eq!(state.errors, 0);
        assert_eq!(state.out_of_order, 0);
    }

    #[test]
    fn test_gap_then_late_arrival() {
        let mut state = UdpReceiveState::default();
        let mut history = Vec::new();
        for seq in [1, 2, 3, 5, 4, 6] {
            state.on_packet(seq, 0.0);
            history.push((state.errors, state.out_of_order));
        }
        // Gap counted when 5 arrives, cancelled when 4 shows up late.
        assert_eq!(history[3], (1, 0));
        assert_eq!(history[4], (0, 1));
        assert_eq!(history[5], (0, 1));
        assert_eq!(state.packet_count, 6);
    }

    #[test]
    fn test_duplicate_counts_as_out_of_order() {
        let mut state = UdpReceiveState::default();
        for seq in [1, 2, 2, 3] {
            state.on_packet(seq, 0.0);
        }
        assert_eq!(state.out_of_order, 1);
        assert_eq!(state.errors, 0);
    }

    #[test]
    fn test_overlapping_reorder_undercounts_loss() {
        // 3 is lost, then a duplicate of 2 cancels the counted loss.
        let mut state = UdpReceiveState::default();
        for seq in [1, 2, 4, 2] {
            state.on_packet(seq, 0.0);
        }
        assert_eq!(state.out_of_order, 1);
        assert_eq!(state.errors, 0);
    }

    #[test]
    fn test_jitter_estimator() {
        let mut state = UdpReceiveState::default();
        state.on_packet(1, 0.010);
        assert_eq!(state.jitter, 0.0);
        state.on_packet(2, 0.012);
        assert!((state.jitter - 0.000125).abs() < 1e-12);
        state.on_packet(3, 0.009);
        let expected = 0.000125 + (0.003 - 0.000125) / 16.0;
        assert!((state.jitter - expected).abs() < 1e-12);
    }

    #[test]
    fn test_jitter_exact_in_milliseconds() {
        let mut state = UdpReceiveState::default();
        state.on_packet(1, 10.0);
        state.on_packet(2, 12.0);
        assert_eq!(state.jitter, 0.125);
    }

    #[test]
    fn test_interval_deltas_and_omit() {
        let mut state = UdpReceiveState::default();
        for seq in [1, 2, 4] {
            state.on_packet(seq, 0.0);
        }
        let d = state.take_interval();
        assert_eq!((d.packets, d.errors, d.out_of_order), (4, 1, 0));

        state.on_packet(3, 0.0);
        let d = state.take_interval();
        assert_eq!((d.packets, d.errors, d.out_of_order), (0, -1, 1));

        state.snapshot_omit();
        state.on_packet(5, 0.0);
        assert_eq!(state.measured_packets(), 1);
        assert_eq!(state.measured_errors(), 0);
        assert_eq!(state.measured_out_of_order(), 0);
    }

    #[test]
    fn test_fill_buffer() {
        let buf = fill_buffer(25, true);
        assert_eq!(&buf[..12], b"012345678901");
        assert_eq!(fill_buffer(1000, false).len(), 1000);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_in_order_delivery_has_no_loss(n in 1u64..2000) {
                let mut state = UdpReceiveState::default();
                for seq in 1..=n {
                    state.on_packet(seq, 0.0);
                }
                prop_assert_eq!(state.errors, 0);
                prop_assert_eq!(state.packet_count, n);
            }

            #[test]
            fn prop_dropped_packets_are_counted(
                n in 10u64..500,
                drops in proptest::collection::btree_set(2u64..500, 0..20),
            ) {
                let mut state = UdpReceiveState::default();
                let mut dropped = 0;
                for seq in 1..=n {
                    if drops.contains(&seq) && seq < n {
                        dropped += 1;
                        continue;
                    }
                    state.on_packet(seq, 0.0);
                }
                prop_assert_eq!(state.errors, dropped);
                prop_assert_eq!(state.out_of_order, 0);
            }

            #[test]
            fn prop_adjacent_swap_nets_zero_loss(n in 3u64..500, swap_at in 1u64..499) {
                prop_assume!(swap_at + 1 < n);
                let mut order: Vec<u64> = (1..=n).collect();
                order.swap(swap_at as usize - 1, swap_at as usize);
                let mut state = UdpReceiveState::default();
                for seq in order {
                    state.on_packet(seq, 0.0);
                }
                prop_assert_eq!(state.errors, 0);
                prop_assert_eq!(state.out_of_order, 1);
            }

            #[test]
            fn prop_constant_transit_has_zero_jitter(transit in 0.0f64..10.0, n in 1u64..100) {
                let mut state = UdpReceiveState::default();
                for seq in 1..=n {
                    state.on_packet(seq, transit);
                }
                prop_assert_eq!(state.jitter, 0.0);
            }
        }
    }
}
