use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Whether per-connection TCP statistics are available on this platform.
pub const HAS_TCP_INFO: bool = cfg!(target_os = "linux");

/// Connection information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub socket: Option<i32>,
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ConnectionInfo {
    pub fn from_addrs(
        socket: Option<i32>,
        local: Option<std::net::SocketAddr>,
        remote: Option<std::net::SocketAddr>,
    ) -> Self {
        Self {
            socket,
            local_host: local.map(|a| a.ip().to_string()).unwrap_or_default(),
            local_port: local.map(|a| a.port()).unwrap_or(0),
            remote_host: remote.map(|a| a.ip().to_string()).unwrap_or_default(),
            remote_port: remote.map(|a| a.port()).unwrap_or(0),
        }
    }
}

/// Test parameters echoed in the start section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStartConfig {
    pub protocol: String,
    pub num_streams: usize,
    pub blksize: usize,
    pub omit: u64,
    pub duration: u64,
    pub bytes: u64,
    pub blocks: u64,
    pub reverse: i32,
    pub tos: u8,
    pub target_bitrate: u64,
    pub bidir: i32,
    pub fqrate: u64,
    pub interval: f64,
}

/// System information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub version: String,
    pub system_info: String,
    pub timestamp: i64,
    pub timestamp_str: String,
}

/// TCP statistics for an interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpStats {
    pub retransmits: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snd_cwnd: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rttvar: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pmtu: Option<u64>,
}

/// Per-stream line of an interval report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalStreamStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<i32>,
    pub start: f64,
    pub end: f64,
    pub seconds: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(flatten)]
    pub tcp: Option<TcpStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_of_order: Option<i64>,
    pub omitted: bool,
    pub sender: bool,
}

/// One reporting interval across all streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalReport {
    pub streams: Vec<IntervalStreamStats>,
    pub sum: IntervalStreamStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum_bidir_reverse: Option<IntervalStreamStats>,
}

/// Stream summary for end results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<i32>,
    pub start: f64,
    pub end: f64,
    pub seconds: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_snd_cwnd: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rtt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_rtt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_rtt: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_of_order: Option<u64>,
    pub sender: bool,
}

impl StreamSummary {
    /// Summary of `bytes` moved over `seconds`.
    pub fn new(bytes: u64, seconds: f64, sender: bool) -> Self {
        Self {
            end: seconds,
            seconds,
            bytes,
            bits_per_second: bits_per_second(bytes, seconds),
            sender,
            ..Default::default()
        }
    }

    /// Adds another stream's summary into this sum.
    ///
    /// Bytes, retransmits and packet counters add up, the time span is the
    /// longest one and jitter is averaged by the caller.
    pub fn accumulate(&mut self, other: &StreamSummary) {
        self.bytes += other.bytes;
        if other.seconds > self.seconds {
            self.seconds = other.seconds;
            self.end = other.end;
        }
        self.bits_per_second = bits_per_second(self.bytes, self.seconds);
        self.retransmits = add_opt(self.retransmits, other.retransmits);
        self.lost_packets = add_opt(self.lost_packets, other.lost_packets);
        self.packets = add_opt(self.packets, other.packets);
        self.out_of_order = add_opt(self.out_of_order, other.out_of_order);
        if let (Some(lost), Some(packets)) = (self.lost_packets, self.packets) {
            self.lost_percent = Some(lost_percent(lost, packets));
        }
    }
}

fn add_opt<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, None) => a,
        (None, b) => b,
    }
}

pub fn bits_per_second(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bytes as f64 * 8.0 / seconds
    } else {
        0.0
    }
}

pub fn lost_percent(lost: i64, packets: u64) -> f64 {
    if packets > 0 {
        100.0 * lost as f64 / packets as f64
    } else {
        0.0
    }
}

/// CPU utilization statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUtilization {
    pub host_total: f64,
    pub host_user: f64,
    pub host_system: f64,
    pub remote_total: f64,
    pub remote_user: f64,
    pub remote_system: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndStreamInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<StreamSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<StreamSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<StreamSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEndInfo {
    pub streams: Vec<EndStreamInfo>,
    pub sum_sent: StreamSummary,
    pub sum_received: StreamSummary,
    /// UDP only: receiver-side loss and jitter across streams
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<StreamSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum_sent_bidir_reverse: Option<StreamSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum_received_bidir_reverse: Option<StreamSummary>,
    pub cpu_utilization_percent: CpuUtilization,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_tcp_congestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_tcp_congestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampInfo {
    pub time: String,
    pub timesecs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectingTo {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStartInfo {
    pub connected: Vec<ConnectionInfo>,
    pub version: String,
    pub system_info: String,
    pub timestamp: TimestampInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connecting_to: Option<ConnectingTo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_connection: Option<ConnectingTo>,
    pub cookie: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_mss_default: Option<u32>,
    pub sock_bufsize: u32,
    pub sndbuf_actual: u32,
    pub rcvbuf_actual: u32,
    pub test_start: TestStartConfig,
}

/// Complete test results in iperf3 format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub start: TestStartInfo,
    pub intervals: Vec<IntervalReport>,
    pub end: TestEndInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<String>,
    /// The server's own report, when requested by the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_output_json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Process CPU time at one instant.
#[derive(Debug, Clone, Copy)]
pub struct CpuSnapshot {
    wall: Instant,
    user: Duration,
    system: Duration,
}

impl CpuSnapshot {
    pub fn now() -> Self {
        let (user, system) = process_cpu_times();
        Self {
            wall: Instant::now(),
            user,
            system,
        }
    }

    /// Percent of wall time spent in user and system mode since `self`.
    ///
    /// Returns `(total, user, system)`.
    pub fn utilization_since(&self, end: &CpuSnapshot) -> (f64, f64, f64) {
        let wall = end.wall.saturating_duration_since(self.wall).as_secs_f64();
        if wall <= 0.0 {
            return (0.0, 0.0, 0.0);
        }
        let user = end.user.saturating_sub(self.user).as_secs_f64() / wall * 100.0;
        let system = end.system.saturating_sub(self.system).as_secs_f64() / wall * 100.0;
        (user + system, user, system)
    }
}

#[cfg(unix)]
fn process_cpu_times() -> (Duration, Duration) {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return (Duration::ZERO, Duration::ZERO);
    }
    let to_duration = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    (to_duration(usage.ru_utime), to_duration(usage.ru_stime))
}

#[cfg(not(unix))]
fn process_cpu_times() -> (Duration, Duration) {
    (Duration::ZERO, Duration::ZERO)
}

/// Get system information
pub fn get_system_info() -> SystemInfo {
    let now = chrono::Utc::now();
    SystemInfo {
        version: format!("rsperf {}", crate::VERSION),
        system_info: format!(
            "{} {} {}",
            std::env::consts::OS,
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            std::env::consts::ARCH,
        ),
        timestamp_str: now.format("%a, %d %b %Y %H:%M:%S UTC").to_string(),
        timestamp: now.timestamp(),
    }
}

/// Reads kernel TCP statistics for the socket `fd` (Linux only).
///
/// `retransmits` holds the cumulative retransmit count; `snd_cwnd` is in
/// bytes.
#[cfg(target_os = "linux")]
pub fn tcp_stats(fd: i32) -> Option<TcpStats> {
    use std::mem;

    // Leading part of struct tcp_info
    #[repr(C)]
    struct TcpInfo {
        state: u8,
        ca_state: u8,
        retransmits: u8,
        probes: u8,
        backoff: u8,
        options: u8,
        snd_wscale: u8,
        rcv_wscale: u8,

        rto: u32,
        ato: u32,
        snd_mss: u32,
        rcv_mss: u32,

        unacked: u32,
        sacked: u32,
        lost: u32,
        retrans: u32,
        fackets: u32,

        last_data_sent: u32,
        last_ack_sent: u32,
        last_data_recv: u32,
        last_ack_recv: u32,

        pmtu: u32,
        rcv_ssthresh: u32,
        rtt: u32,
        rttvar: u32,
        snd_ssthresh: u32,
        snd_cwnd: u32,
        advmss: u32,
        reordering: u32,

        rcv_rtt: u32,
        rcv_space: u32,

        total_retrans: u32,
    }

    let mut info: TcpInfo = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<TcpInfo>() as libc::socklen_t;

    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_TCP,
            libc::TCP_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if result != 0 {
        return None;
    }
    Some(TcpStats {
        retransmits: info.total_retrans as u64,
        snd_cwnd: Some(info.snd_cwnd as u64 * info.snd_mss as u64),
        rtt: Some(info.rtt as u64),
        rttvar: Some(info.rttvar as u64),
        pmtu: Some(info.pmtu as u64),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn tcp_stats(_fd: i32) -> Option<TcpStats> {
    None
}

/// Congestion control algorithm in use on `fd`, if the OS reports one.
#[cfg(target_os = "linux")]
pub fn tcp_congestion(fd: i32) -> Option<String> {
    let mut buf = [0u8; 16];
    let mut len = buf.len() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut len,
        )
    };
    if result != 0 {
        return None;
    }
    let end = buf[..len as usize].iter().position(|&b| b == 0).unwrap_or(len as usize);
    std::str::from_utf8(&buf[..end]).ok().map(str::to_string)
}

#[cfg(not(target_os = "linux"))]
pub fn tcp_congestion(_fd: i32) -> Option<String> {
    None
}

/// Selects a congestion control algorithm on `fd`.
#[cfg(target_os = "linux")]
pub fn set_tcp_congestion(fd: i32, algorithm: &str) -> std::io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            algorithm.as_ptr() as *const libc::c_void,
            algorithm.len() as libc::socklen_t,
        )
    };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_tcp_congestion(_fd: i32, _algorithm: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "congestion control selection is not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_accumulate() {
        let mut sum = StreamSummary::new(0, 0.0, true);
        let mut a = StreamSummary::new(1_000_000, 10.0, true);
        a.retransmits = Some(3);
        let mut b = StreamSummary::new(2_000_000, 9.5, true);
        b.retransmits = Some(1);
        sum.accumulate(&a);
        sum.accumulate(&b);
        assert_eq!(sum.bytes, 3_000_000);
        assert_eq!(sum.seconds, 10.0);
        assert_eq!(sum.retransmits, Some(4));
        assert_eq!(sum.bits_per_second, 2_400_000.0);
    }

    #[test]
    fn test_udp_summary_loss() {
        let mut sum = StreamSummary::new(0, 0.0, false);
        let mut a = StreamSummary::new(100, 1.0, false);
        a.lost_packets = Some(5);
        a.packets = Some(100);
        let mut b = StreamSummary::new(100, 1.0, false);
        b.lost_packets = Some(15);
        b.packets = Some(100);
        sum.accumulate(&a);
        sum.accumulate(&b);
        assert_eq!(sum.lost_percent, Some(10.0));
    }

    #[test]
    fn test_zero_duration_rate() {
        assert_eq!(bits_per_second(1000, 0.0), 0.0);
        assert_eq!(lost_percent(3, 0), 0.0);
    }

    #[test]
    fn test_summary_skips_unset_fields() {
        let json = serde_json::to_value(StreamSummary::new(10, 1.0, true)).unwrap();
        assert!(json.get("retransmits").is_none());
        assert!(json.get("jitter_ms").is_none());
        assert_eq!(json["bytes"], 10);
    }

    #[test]
    fn test_cpu_utilization_bounds() {
        let start = CpuSnapshot::now();
        let mut x = 0u64;
        for i in 0..1_000_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        let end = CpuSnapshot::now();
        let (total, user, system) = start.utilization_since(&end);
        assert!(total >= 0.0);
        assert!((total - user - system).abs() < 1e-9);
    }

    #[test]
    fn test_system_info() {
        let info = get_system_info();
        assert!(info.version.starts_with("rsperf "));
        assert!(info.timestamp > 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_tcp_stats_on_loopback() {
        use std::os::fd::AsRawFd;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _server = listener.accept().await.unwrap();
        let stats = tcp_stats(client.as_raw_fd()).expect("tcp_info");
        assert!(stats.snd_cwnd.unwrap_or(0) > 0);
        assert!(tcp_congestion(client.as_raw_fd()).is_some());
    }
}
