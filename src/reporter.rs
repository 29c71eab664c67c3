//! Human-readable and JSON output.
//!
//! All output of a test goes through one [`OutputSink`], so concurrent
//! tests (or a test and its server) never interleave partial lines. The
//! [`Reporter`] turns interval snapshots and the final [`TestReport`] into
//! iperf-style text, or writes the JSON document once at the end.

use crate::config::Protocol;
use crate::error::Result;
use crate::measurements::{IntervalReport, IntervalStreamStats, StreamSummary, TestReport};
use log::warn;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

const SEPARATOR: &str = "- - - - - - - - - - - - - - - - - - - - - - - - -";

/// Shared, line-buffered destination for report output.
///
/// # Examples
///
/// ```
/// use rsperf::reporter::OutputSink;
///
/// let sink = OutputSink::discard();
/// sink.line("nothing to see");
/// ```
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// A sink that drops everything, for embedding and tests.
    pub fn discard() -> Self {
        Self::new(std::io::sink())
    }

    /// Writes one line. Output failures are logged, never fatal.
    pub fn line(&self, text: &str) {
        let mut out = self.inner.lock();
        if let Err(e) = writeln!(out, "{}", text).and_then(|_| out.flush()) {
            warn!("Failed to write report output: {}", e);
        }
    }

    /// Writes `value` as pretty-printed JSON followed by a newline.
    pub fn json<T: Serialize>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.line(&text);
        Ok(())
    }
}

impl Default for OutputSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink").finish_non_exhaustive()
    }
}

/// Scales a byte count to KBytes, MBytes or GBytes.
pub fn format_bytes(bytes: u64) -> (f64, &'static str) {
    let bytes = bytes as f64;
    if bytes >= 1024.0 * 1024.0 * 1024.0 {
        (bytes / (1024.0 * 1024.0 * 1024.0), "GBytes")
    } else if bytes >= 1024.0 * 1024.0 {
        (bytes / (1024.0 * 1024.0), "MBytes")
    } else {
        (bytes / 1024.0, "KBytes")
    }
}

/// Scales a bit rate to Kbits, Mbits or Gbits per second.
pub fn format_bitrate(bits_per_second: f64) -> (f64, &'static str) {
    if bits_per_second >= 1_000_000_000.0 {
        (bits_per_second / 1_000_000_000.0, "Gbits/sec")
    } else if bits_per_second >= 1_000_000.0 {
        (bits_per_second / 1_000_000.0, "Mbits/sec")
    } else {
        (bits_per_second / 1_000.0, "Kbits/sec")
    }
}

fn stream_label(id: Option<i32>) -> String {
    match id {
        Some(id) => format!("[{:3}]", id),
        None => "[SUM]".to_string(),
    }
}

fn transfer_columns(start: f64, end: f64, bytes: u64, bits_per_second: f64) -> String {
    let (transfer, transfer_unit) = format_bytes(bytes);
    let (rate, rate_unit) = format_bitrate(bits_per_second);
    format!(
        "{:6.2}-{:<6.2} sec  {:6.2} {:>6}  {:6.2} {:>9}",
        start, end, transfer, transfer_unit, rate, rate_unit
    )
}

/// Column header printed before the first interval line.
pub fn interval_header(protocol: Protocol, sender: bool) -> String {
    match protocol {
        Protocol::Udp if sender => {
            "[ ID] Interval           Transfer     Bitrate         Total Datagrams".to_string()
        }
        Protocol::Udp => {
            "[ ID] Interval           Transfer     Bitrate         Jitter    Lost/Total Datagrams"
                .to_string()
        }
        _ if sender => {
            "[ ID] Interval           Transfer     Bitrate         Retr  Cwnd".to_string()
        }
        _ => "[ ID] Interval           Transfer     Bitrate".to_string(),
    }
}

/// One interval line for a stream (`id`) or for the sum (`None`).
pub fn interval_line(id: Option<i32>, stats: &IntervalStreamStats) -> String {
    let mut line = format!(
        "{} {}",
        stream_label(id),
        transfer_columns(stats.start, stats.end, stats.bytes, stats.bits_per_second)
    );

    if let Some(tcp) = stats.tcp.as_ref().filter(|_| stats.sender) {
        line.push_str(&format!("  {:4}", tcp.retransmits));
        if let Some(cwnd) = tcp.snd_cwnd {
            let (value, unit) = format_bytes(cwnd);
            line.push_str(&format!("  {:6.2} {}", value, unit));
        }
    } else if stats.sender {
        if let Some(packets) = stats.packets {
            line.push_str(&format!("  {}", packets));
        }
    } else if let (Some(lost), Some(packets)) = (stats.lost_packets, stats.packets) {
        line.push_str(&format!(
            "  {:6.3} ms  {}/{} ({:.2}%)",
            stats.jitter_ms.unwrap_or(0.0),
            lost,
            packets,
            stats.lost_percent.unwrap_or(0.0)
        ));
    }

    if stats.omitted {
        line.push_str("  (omitted)");
    }
    line
}

/// One summary line; `role` is "sender" or "receiver".
pub fn summary_line(id: Option<i32>, summary: &StreamSummary, protocol: Protocol, role: &str) -> String {
    let mut line = format!(
        "{} {}",
        stream_label(id),
        transfer_columns(summary.start, summary.end, summary.bytes, summary.bits_per_second)
    );
    match protocol {
        Protocol::Udp => {
            if let (Some(lost), Some(packets)) = (summary.lost_packets, summary.packets) {
                line.push_str(&format!(
                    "  {:6.3} ms  {}/{} ({:.2}%)",
                    summary.jitter_ms.unwrap_or(0.0),
                    lost,
                    packets,
                    summary.lost_percent.unwrap_or(0.0)
                ));
            }
        }
        _ => match summary.retransmits {
            Some(retr) if summary.sender => line.push_str(&format!("  {:4}", retr)),
            _ => line.push_str("      "),
        },
    }
    line.push_str(&format!("  {}", role));
    line
}

/// Formats and writes everything a test prints.
#[derive(Debug, Clone)]
pub struct Reporter {
    sink: OutputSink,
    json: bool,
}

impl Reporter {
    pub fn new(sink: OutputSink, json: bool) -> Self {
        Self { sink, json }
    }

    pub fn is_json(&self) -> bool {
        self.json
    }

    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    /// Free-form status line, suppressed in JSON mode.
    pub fn info(&self, text: &str) {
        if !self.json {
            self.sink.line(text);
        }
    }

    pub fn header(&self, protocol: Protocol, sender: bool) {
        self.info(&interval_header(protocol, sender));
    }

    pub fn interval(&self, report: &IntervalReport) {
        if self.json {
            return;
        }
        for stats in &report.streams {
            self.sink.line(&interval_line(stats.socket, stats));
        }
        if report.streams.len() > 1 {
            self.sink.line(&interval_line(None, &report.sum));
            if let Some(reverse) = &report.sum_bidir_reverse {
                self.sink.line(&interval_line(None, reverse));
            }
        }
    }

    /// Prints the end-of-test summary, or the whole JSON document.
    ///
    /// `local_sender` tells which side the CPU line attributes to this host.
    pub fn finish(&self, report: &TestReport, protocol: Protocol, local_sender: bool) -> Result<()> {
        if self.json {
            return self.sink.json(report);
        }

        let end = &report.end;
        self.sink.line(SEPARATOR);
        self.sink.line(&summary_header(protocol));
        for stream in &end.streams {
            if let Some(sender) = &stream.sender {
                self.sink.line(&summary_line(sender.socket, sender, protocol, "sender"));
            }
            if let Some(receiver) = &stream.receiver {
                self.sink.line(&summary_line(receiver.socket, receiver, protocol, "receiver"));
            }
        }
        if end.streams.len() > 1 {
            self.sink.line(&summary_line(None, &end.sum_sent, protocol, "sender"));
            self.sink.line(&summary_line(None, &end.sum_received, protocol, "receiver"));
            if let (Some(sent), Some(received)) =
                (&end.sum_sent_bidir_reverse, &end.sum_received_bidir_reverse)
            {
                self.sink.line(&summary_line(None, sent, protocol, "sender"));
                self.sink.line(&summary_line(None, received, protocol, "receiver"));
            }
        }

        let cpu = &end.cpu_utilization_percent;
        self.sink.line(&format!(
            "CPU Utilization: local/{} {:.1}% ({:.1}%u/{:.1}%s), remote/{} {:.1}% ({:.1}%u/{:.1}%s)",
            direction(local_sender),
            cpu.host_total,
            cpu.host_user,
            cpu.host_system,
            direction(!local_sender),
            cpu.remote_total,
            cpu.remote_user,
            cpu.remote_system
        ));

        if let Some(server_output) = &report.server_output_json {
            self.sink.line("");
            self.sink.line("Server output:");
            self.sink.json(server_output)?;
        }
        self.sink.line("");
        Ok(())
    }

    /// Reports a failed test: a JSON document carrying `error`, or a line.
    pub fn error(&self, report: Option<&TestReport>, message: &str) {
        if self.json {
            let written = match report {
                Some(report) => {
                    let mut report = report.clone();
                    report.error = Some(message.to_string());
                    self.sink.json(&report)
                }
                None => self.sink.json(&serde_json::json!({ "error": message })),
            };
            if let Err(e) = written {
                warn!("Failed to write JSON error document: {}", e);
            }
        } else {
            self.sink.line(&format!("rsperf: error - {}", message));
        }
    }
}

fn summary_header(protocol: Protocol) -> String {
    match protocol {
        Protocol::Udp => {
            "[ ID] Interval           Transfer     Bitrate         Jitter    Lost/Total Datagrams"
                .to_string()
        }
        _ => "[ ID] Interval           Transfer     Bitrate         Retr".to_string(),
    }
}

fn direction(sender: bool) -> &'static str {
    if sender {
        "sender"
    } else {
        "receiver"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::TcpStats;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    fn interval(sender: bool) -> IntervalStreamStats {
        IntervalStreamStats {
            socket: Some(5),
            start: 0.0,
            end: 1.0,
            seconds: 1.0,
            bytes: 1024 * 1024,
            bits_per_second: 8_388_608.0,
            tcp: None,
            packets: None,
            lost_packets: None,
            lost_percent: None,
            jitter_ms: None,
            out_of_order: None,
            omitted: false,
            sender,
        }
    }

    #[test]
    fn test_format_units() {
        assert_eq!(format_bytes(512 * 1024), (512.0, "KBytes"));
        assert_eq!(format_bytes(3 * 1024 * 1024), (3.0, "MBytes"));
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), (2.0, "GBytes"));
        assert_eq!(format_bitrate(9_420_000_000.0).1, "Gbits/sec");
        assert_eq!(format_bitrate(1_048_576.0).1, "Mbits/sec");
        assert_eq!(format_bitrate(64_000.0), (64.0, "Kbits/sec"));
    }

    #[test]
    fn test_tcp_sender_interval_line() {
        let mut stats = interval(true);
        stats.tcp = Some(TcpStats {
            retransmits: 3,
            snd_cwnd: Some(64 * 1024),
            ..TcpStats::default()
        });
        let line = interval_line(Some(5), &stats);
        assert!(line.starts_with("[  5]"));
        assert!(line.contains("1.00 MBytes"));
        assert!(line.contains("8.39 Mbits/sec"));
        assert!(line.contains("   3"));
        assert!(line.contains("64.00 KBytes"));
    }

    #[test]
    fn test_udp_receiver_line_and_omitted_flag() {
        let mut stats = interval(false);
        stats.packets = Some(100);
        stats.lost_packets = Some(2);
        stats.lost_percent = Some(2.0);
        stats.jitter_ms = Some(0.25);
        stats.omitted = true;
        let line = interval_line(None, &stats);
        assert!(line.starts_with("[SUM]"));
        assert!(line.contains("0.250 ms  2/100 (2.00%)"));
        assert!(line.ends_with("(omitted)"));
    }

    #[test]
    fn test_sink_writes_lines() {
        let capture = Capture::default();
        let sink = OutputSink::new(capture.clone());
        sink.line("first");
        sink.clone().line("second");
        assert_eq!(capture.text(), "first\nsecond\n");
    }

    #[test]
    fn test_json_mode_suppresses_text() {
        let capture = Capture::default();
        let reporter = Reporter::new(OutputSink::new(capture.clone()), true);
        reporter.info("Connecting to host");
        reporter.header(Protocol::Tcp, true);
        assert!(capture.text().is_empty());

        reporter.error(None, "control connection lost");
        let value: serde_json::Value = serde_json::from_str(&capture.text()).unwrap();
        assert_eq!(value["error"], "control connection lost");
    }
}
