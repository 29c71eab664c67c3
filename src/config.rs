use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5201;
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_TCP_BLOCK_SIZE: usize = 128 * 1024;
pub const DEFAULT_UDP_BLOCK_SIZE: usize = 1460;
pub const DEFAULT_UDP_RATE: u64 = 1024 * 1024;
pub const DEFAULT_PACING_TIMER: Duration = Duration::from_micros(1000);
pub const DEFAULT_RCV_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_BITRATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_UDP_CONNECT_RETRIES: u32 = 3;
pub const DEFAULT_UDP_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_FORCED_RESTARTS: u32 = 10;

pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;
pub const MAX_UDP_BLOCK_SIZE: usize = 65507;
pub const MAX_STREAMS: usize = 128;
pub const MAX_DURATION: Duration = Duration::from_secs(86400);
pub const MAX_OMIT: Duration = Duration::from_secs(600);
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_INTERVAL: Duration = Duration::from_secs(60);
pub const MAX_MSS: u32 = 9 * 1024;
pub const MAX_SOCKET_BUFFER: u32 = 512 * 1024 * 1024;
pub const MAX_BURST: u32 = 1000;
pub const MAX_BITRATE_LIMIT_INTERVAL: Duration = Duration::from_secs(600);

/// Transport protocol used for the data streams.
///
/// Only TCP and UDP carry data today; the remaining variants are accepted
/// by the parameter exchange and rejected when a stream is opened.
///
/// # Examples
///
/// ```
/// use rsperf::{Config, Protocol};
///
/// let config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(100_000_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol
    Tcp,
    /// User Datagram Protocol
    Udp,
    Sctp,
    Vsock,
    Quic,
}

impl Protocol {
    /// Name used in the JSON result document.
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Sctp => "SCTP",
            Protocol::Vsock => "VSOCK",
            Protocol::Quic => "QUIC",
        }
    }

    pub fn default_block_size(&self) -> usize {
        match self {
            Protocol::Udp => DEFAULT_UDP_BLOCK_SIZE,
            _ => DEFAULT_TCP_BLOCK_SIZE,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of the control connection this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Listens for incoming connections
    Server,
    /// Connects to a server and drives the test
    Client,
}

/// Direction of the data flow, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestMode {
    /// Client sends, server receives
    Sender,
    /// Server sends, client receives (reverse)
    Receiver,
    /// Both directions at once
    Bidirectional,
}

impl TestMode {
    pub fn from_flags(reverse: bool, bidirectional: bool) -> Self {
        if bidirectional {
            TestMode::Bidirectional
        } else if reverse {
            TestMode::Receiver
        } else {
            TestMode::Sender
        }
    }

    pub fn is_reverse(&self) -> bool {
        matches!(self, TestMode::Receiver)
    }

    pub fn is_bidirectional(&self) -> bool {
        matches!(self, TestMode::Bidirectional)
    }
}

/// When the client declares the test over.
///
/// Holding the three conditions in one enum keeps them mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndCondition {
    /// Run for a fixed time
    Duration(Duration),
    /// Stop once this many bytes have been transferred
    Bytes(u64),
    /// Stop once this many blocks have been transferred
    Blocks(u64),
}

impl Default for EndCondition {
    fn default() -> Self {
        EndCondition::Duration(DEFAULT_DURATION)
    }
}

impl EndCondition {
    pub fn duration(&self) -> Option<Duration> {
        match self {
            EndCondition::Duration(d) => Some(*d),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<u64> {
        match self {
            EndCondition::Bytes(n) => Some(*n),
            _ => None,
        }
    }

    pub fn blocks(&self) -> Option<u64> {
        match self {
            EndCondition::Blocks(n) => Some(*n),
            _ => None,
        }
    }
}

/// Negotiated, immutable parameters of one test.
///
/// The client derives them from its [`Config`]; the server rebuilds them
/// from the parameter document it receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub block_size: usize,
    /// Target rate in bits per second per stream, 0 = unlimited
    pub rate: u64,
    /// Packets per pacing tick, 0 = no fixed burst
    pub burst: u32,
    pub pacing_timer: Duration,
    /// Kernel fair-queue pacing rate in bits per second, 0 = off
    pub fq_rate: u64,
    /// Requested socket buffer size, 0 = OS default
    pub socket_bufsize: u32,
    pub mss: u32,
    pub tos: u8,
    pub flowlabel: u32,
    pub end: EndCondition,
    pub omit: Duration,
    pub no_delay: bool,
    pub congestion: Option<String>,
    pub udp_counters_64bit: bool,
    pub repeating_payload: bool,
    pub dont_fragment: bool,
    /// Server aggregate limit in bits per second, 0 = off
    pub bitrate_limit: u64,
    pub bitrate_limit_interval: Duration,
    pub rcv_timeout: Duration,
    pub connect_timeout: Option<Duration>,
    pub udp_connect_retries: u32,
    pub udp_connect_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_TCP_BLOCK_SIZE,
            rate: 0,
            burst: 0,
            pacing_timer: DEFAULT_PACING_TIMER,
            fq_rate: 0,
            socket_bufsize: 0,
            mss: 0,
            tos: 0,
            flowlabel: 0,
            end: EndCondition::default(),
            omit: Duration::ZERO,
            no_delay: false,
            congestion: None,
            udp_counters_64bit: false,
            repeating_payload: false,
            dont_fragment: false,
            bitrate_limit: 0,
            bitrate_limit_interval: DEFAULT_BITRATE_LIMIT_INTERVAL,
            rcv_timeout: DEFAULT_RCV_TIMEOUT,
            connect_timeout: None,
            udp_connect_retries: DEFAULT_UDP_CONNECT_RETRIES,
            udp_connect_timeout: DEFAULT_UDP_CONNECT_TIMEOUT,
        }
    }
}

/// Configuration for rsperf clients and servers.
///
/// Use the builder methods to customize the configuration, then hand it to
/// [`crate::Client::new`] or [`crate::Server::bind`]. All checks run in
/// [`Config::validate`] before any socket is opened.
///
/// # Examples
///
/// ## Basic TCP Client
///
/// ```
/// use rsperf::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_duration(Duration::from_secs(30))
///     .with_block_size(256 * 1024);
/// assert!(config.validate().is_ok());
/// ```
///
/// ## Byte-limited reverse test
///
/// ```
/// use rsperf::Config;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_bytes(10_000_000)
///     .with_reverse(true);
/// ```
///
/// ## Server Configuration
///
/// ```
/// use rsperf::Config;
///
/// let config = Config::server(5201).with_one_off(true);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,
    pub protocol: Protocol,

    /// Control port (server listens, client connects)
    pub port: u16,

    /// Server address (client only)
    pub server_addr: Option<String>,

    /// Local address to bind to
    pub bind_addr: Option<IpAddr>,

    /// First local port for the client's data streams
    pub bind_port: Option<u16>,

    pub mode: TestMode,
    pub parallel: usize,
    pub end: EndCondition,
    pub omit: Duration,

    /// Interval between periodic reports; zero disables them
    pub interval: Duration,

    /// Target bandwidth in bits per second
    pub bandwidth: Option<u64>,

    /// Block (read/write) size; `None` picks the protocol default
    pub block_size: Option<usize>,

    pub burst: u32,
    pub pacing_timer: Duration,
    pub fq_rate: u64,
    pub window: u32,
    pub mss: u32,
    pub no_delay: bool,
    pub tos: u8,
    pub flowlabel: u32,
    pub congestion: Option<String>,
    pub udp_counters_64bit: bool,
    pub repeating_payload: bool,
    pub dont_fragment: bool,

    /// Output in JSON format
    pub json: bool,

    pub title: Option<String>,
    pub extra_data: Option<String>,
    pub get_server_output: bool,
    pub authtoken: Option<String>,

    pub connect_timeout: Option<Duration>,
    pub rcv_timeout: Duration,
    pub udp_connect_retries: u32,
    pub udp_connect_timeout: Duration,

    /// Server: serve a single client, then exit
    pub one_off: bool,
    /// Server: restart the listener when no client arrives in time
    pub idle_timeout: Option<Duration>,
    /// Server: aggregate bitrate ceiling, 0 = off
    pub bitrate_limit: u64,
    pub bitrate_limit_interval: Duration,
    pub max_forced_restarts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Client,
            protocol: Protocol::Tcp,
            port: DEFAULT_PORT,
            server_addr: None,
            bind_addr: None,
            bind_port: None,
            mode: TestMode::Sender,
            parallel: 1,
            end: EndCondition::default(),
            omit: Duration::ZERO,
            interval: Duration::from_secs(1),
            bandwidth: None,
            block_size: None,
            burst: 0,
            pacing_timer: DEFAULT_PACING_TIMER,
            fq_rate: 0,
            window: 0,
            mss: 0,
            no_delay: false,
            tos: 0,
            flowlabel: 0,
            congestion: None,
            udp_counters_64bit: false,
            repeating_payload: false,
            dont_fragment: false,
            json: false,
            title: None,
            extra_data: None,
            get_server_output: false,
            authtoken: None,
            connect_timeout: None,
            rcv_timeout: DEFAULT_RCV_TIMEOUT,
            udp_connect_retries: DEFAULT_UDP_CONNECT_RETRIES,
            udp_connect_timeout: DEFAULT_UDP_CONNECT_TIMEOUT,
            one_off: false,
            idle_timeout: None,
            bitrate_limit: 0,
            bitrate_limit_interval: DEFAULT_BITRATE_LIMIT_INTERVAL,
            max_forced_restarts: DEFAULT_MAX_FORCED_RESTARTS,
        }
    }
}

impl Config {
    /// Creates a new server configuration listening on `port`.
    ///
    /// Port 0 binds an ephemeral port; read it back with
    /// [`crate::Server::local_addr`].
    pub fn server(port: u16) -> Self {
        Self {
            role: Role::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a new client configuration.
    ///
    /// # Arguments
    ///
    /// * `server_addr` - The IP address or hostname of the server
    /// * `port` - The control port to connect to (typically 5201)
    pub fn client(server_addr: String, port: u16) -> Self {
        Self {
            role: Role::Client,
            server_addr: Some(server_addr),
            port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Runs the test for a fixed time.
    ///
    /// # Examples
    ///
    /// ```
    /// use rsperf::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_duration(Duration::from_secs(30));
    /// assert_eq!(config.end.duration(), Some(Duration::from_secs(30)));
    /// ```
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.end = EndCondition::Duration(duration);
        self
    }

    /// Ends the test after `bytes` bytes instead of after a duration.
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.end = EndCondition::Bytes(bytes);
        self
    }

    /// Ends the test after `blocks` blocks instead of after a duration.
    pub fn with_blocks(mut self, blocks: u64) -> Self {
        self.end = EndCondition::Blocks(blocks);
        self
    }

    /// Sets the target bandwidth per stream in bits per second.
    ///
    /// Zero means unlimited, including for UDP where the default would
    /// otherwise be 1 Mbit/s.
    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    /// Sets the block size for reads and writes.
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = Some(size);
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Enables or disables reverse mode (server sends, client receives).
    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.mode = TestMode::from_flags(reverse, self.mode.is_bidirectional());
        self
    }

    /// Enables or disables sending in both directions at once.
    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.mode = TestMode::from_flags(self.mode.is_reverse(), bidirectional);
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Sets the interval for periodic reporting; zero disables it.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Discards the first `omit` of the test from the results.
    pub fn with_omit(mut self, omit: Duration) -> Self {
        self.omit = omit;
        self
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_pacing_timer(mut self, pacing_timer: Duration) -> Self {
        self.pacing_timer = pacing_timer;
        self
    }

    pub fn with_fq_rate(mut self, fq_rate: u64) -> Self {
        self.fq_rate = fq_rate;
        self
    }

    /// Requests a socket buffer size in bytes.
    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    pub fn with_mss(mut self, mss: u32) -> Self {
        self.mss = mss;
        self
    }

    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    pub fn with_tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn with_congestion(mut self, algorithm: String) -> Self {
        self.congestion = Some(algorithm);
        self
    }

    pub fn with_udp_counters_64bit(mut self, enabled: bool) -> Self {
        self.udp_counters_64bit = enabled;
        self
    }

    pub fn with_repeating_payload(mut self, enabled: bool) -> Self {
        self.repeating_payload = enabled;
        self
    }

    pub fn with_title(mut self, title: String) -> Self {
        self.title = Some(title);
        self
    }

    pub fn with_extra_data(mut self, extra: String) -> Self {
        self.extra_data = Some(extra);
        self
    }

    /// Asks the server to return its own result document.
    pub fn with_get_server_output(mut self, enabled: bool) -> Self {
        self.get_server_output = enabled;
        self
    }

    pub fn with_authtoken(mut self, token: String) -> Self {
        self.authtoken = Some(token);
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Binds the client's data streams to consecutive ports from `port`.
    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Aborts when a receiving stream sees no data for this long.
    pub fn with_rcv_timeout(mut self, timeout: Duration) -> Self {
        self.rcv_timeout = timeout;
        self
    }

    pub fn with_udp_connect_retries(mut self, retries: u32, timeout: Duration) -> Self {
        self.udp_connect_retries = retries;
        self.udp_connect_timeout = timeout;
        self
    }

    /// Server: exit after the first client is served.
    pub fn with_one_off(mut self, one_off: bool) -> Self {
        self.one_off = one_off;
        self
    }

    /// Server: restart listening when no client connects within `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Server: abort tests whose aggregate rate stays above `limit` bit/s
    /// over the averaging `interval`.
    pub fn with_bitrate_limit(mut self, limit: u64, interval: Duration) -> Self {
        self.bitrate_limit = limit;
        self.bitrate_limit_interval = interval;
        self
    }

    /// Block size after applying the protocol default.
    pub fn effective_block_size(&self) -> usize {
        self.block_size
            .unwrap_or_else(|| self.protocol.default_block_size())
    }

    /// Target rate after applying the UDP default.
    pub fn effective_rate(&self) -> u64 {
        match (self.bandwidth, self.protocol) {
            (Some(rate), _) => rate,
            (None, Protocol::Udp) => DEFAULT_UDP_RATE,
            (None, _) => 0,
        }
    }

    /// Builds the settings this configuration negotiates.
    pub fn settings(&self) -> Settings {
        Settings {
            block_size: self.effective_block_size(),
            rate: self.effective_rate(),
            burst: self.burst,
            pacing_timer: self.pacing_timer,
            fq_rate: self.fq_rate,
            socket_bufsize: self.window,
            mss: self.mss,
            tos: self.tos,
            flowlabel: self.flowlabel,
            end: self.end,
            omit: self.omit,
            no_delay: self.no_delay,
            congestion: self.congestion.clone(),
            udp_counters_64bit: self.udp_counters_64bit,
            repeating_payload: self.repeating_payload,
            dont_fragment: self.dont_fragment,
            bitrate_limit: self.bitrate_limit,
            bitrate_limit_interval: self.bitrate_limit_interval,
            rcv_timeout: self.rcv_timeout,
            connect_timeout: self.connect_timeout,
            udp_connect_retries: self.udp_connect_retries,
            udp_connect_timeout: self.udp_connect_timeout,
        }
    }

    /// Checks every option against its limits and against the role.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RoleConflict`] for options that do not apply to the
    /// configured role and [`Error::Config`] for out-of-range values.
    pub fn validate(&self) -> Result<()> {
        match self.role {
            Role::Client => self.validate_client_role()?,
            Role::Server => self.validate_server_role()?,
        }

        if self.parallel == 0 || self.parallel > MAX_STREAMS {
            return Err(Error::Config(format!(
                "number of parallel streams must be between 1 and {}",
                MAX_STREAMS
            )));
        }

        if !self.interval.is_zero()
            && (self.interval < MIN_INTERVAL || self.interval > MAX_INTERVAL)
        {
            return Err(Error::Config(format!(
                "report interval must be 0 or between {:?} and {:?}",
                MIN_INTERVAL, MAX_INTERVAL
            )));
        }

        if self.omit > MAX_OMIT {
            return Err(Error::Config(format!("omit must not exceed {:?}", MAX_OMIT)));
        }

        validate_settings(self.protocol, &self.settings())
    }

    fn validate_client_role(&self) -> Result<()> {
        match self.server_addr.as_deref() {
            Some(addr) if !addr.is_empty() => {}
            _ => return Err(Error::Config("client requires a server address".to_string())),
        }
        if self.port == 0 {
            return Err(Error::Config("client port must not be 0".to_string()));
        }
        if self.one_off {
            return Err(Error::RoleConflict("one-off is a server-only option".to_string()));
        }
        if self.idle_timeout.is_some() {
            return Err(Error::RoleConflict(
                "idle timeout is a server-only option".to_string(),
            ));
        }
        if self.bitrate_limit > 0 {
            return Err(Error::RoleConflict(
                "server bitrate limit is a server-only option".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_server_role(&self) -> Result<()> {
        if self.server_addr.is_some() {
            return Err(Error::RoleConflict(
                "a server does not take a server address".to_string(),
            ));
        }
        if self.mode != TestMode::Sender {
            return Err(Error::RoleConflict(
                "reverse and bidirectional are client-only options".to_string(),
            ));
        }
        if self.end != EndCondition::default() {
            return Err(Error::RoleConflict(
                "test end conditions are client-only options".to_string(),
            ));
        }
        if self.bandwidth.is_some() || self.get_server_output || self.bind_port.is_some() {
            return Err(Error::RoleConflict(
                "bandwidth, server output and bind port are client-only options".to_string(),
            ));
        }
        if self.bitrate_limit_interval.is_zero()
            || self.bitrate_limit_interval > MAX_BITRATE_LIMIT_INTERVAL
        {
            return Err(Error::Config(format!(
                "bitrate limit interval must be between 1s and {:?}",
                MAX_BITRATE_LIMIT_INTERVAL
            )));
        }
        Ok(())
    }
}

/// Checks negotiated settings, also used by the server on received parameters.
pub fn validate_settings(protocol: Protocol, settings: &Settings) -> Result<()> {
    let max_block = match protocol {
        Protocol::Udp => MAX_UDP_BLOCK_SIZE,
        _ => MAX_BLOCK_SIZE,
    };
    let min_block = match protocol {
        Protocol::Udp => crate::udp_packet::header_len(settings.udp_counters_64bit),
        _ => 1,
    };
    if settings.block_size < min_block || settings.block_size > max_block {
        return Err(Error::Config(format!(
            "block size must be between {} and {} bytes for {}",
            min_block, max_block, protocol
        )));
    }

    match settings.end {
        EndCondition::Duration(d) if d > MAX_DURATION => {
            return Err(Error::Config(format!(
                "test duration must not exceed {:?}",
                MAX_DURATION
            )))
        }
        EndCondition::Bytes(0) | EndCondition::Blocks(0) => {
            return Err(Error::Config(
                "byte and block end conditions must be non-zero".to_string(),
            ))
        }
        _ => {}
    }

    if settings.mss > MAX_MSS {
        return Err(Error::Config(format!("MSS must not exceed {}", MAX_MSS)));
    }
    if settings.socket_bufsize > MAX_SOCKET_BUFFER {
        return Err(Error::Config(format!(
            "socket buffer size must not exceed {}",
            MAX_SOCKET_BUFFER
        )));
    }
    if settings.burst > MAX_BURST {
        return Err(Error::Config(format!("burst must not exceed {}", MAX_BURST)));
    }
    if settings.pacing_timer.is_zero() {
        return Err(Error::Config("pacing timer must be non-zero".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = Config::client("127.0.0.1".to_string(), 5201);
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.end, EndCondition::Duration(DEFAULT_DURATION));
        assert_eq!(config.effective_block_size(), DEFAULT_TCP_BLOCK_SIZE);
        assert_eq!(config.effective_rate(), 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_udp_defaults() {
        let config = Config::client("127.0.0.1".to_string(), 5201).with_protocol(Protocol::Udp);
        assert_eq!(config.effective_block_size(), DEFAULT_UDP_BLOCK_SIZE);
        assert_eq!(config.effective_rate(), DEFAULT_UDP_RATE);

        let unlimited = config.with_bandwidth(0);
        assert_eq!(unlimited.effective_rate(), 0);
    }

    #[test]
    fn test_end_conditions_are_exclusive() {
        let config = Config::client("h".to_string(), 5201)
            .with_duration(Duration::from_secs(5))
            .with_bytes(1000);
        assert_eq!(config.end, EndCondition::Bytes(1000));
        assert_eq!(config.end.duration(), None);

        let config = config.with_blocks(7);
        assert_eq!(config.end.blocks(), Some(7));
        assert_eq!(config.end.bytes(), None);
    }

    #[test]
    fn test_mode_flags() {
        let config = Config::client("h".to_string(), 5201).with_reverse(true);
        assert_eq!(config.mode, TestMode::Receiver);

        let config = config.with_bidirectional(true);
        assert_eq!(config.mode, TestMode::Bidirectional);
        assert!(config.mode.is_bidirectional());
        assert!(!config.mode.is_reverse());
    }

    #[test]
    fn test_validate_limits() {
        let base = Config::client("h".to_string(), 5201);
        assert!(matches!(
            base.clone().with_parallel(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            base.clone().with_parallel(MAX_STREAMS + 1).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            base.clone().with_block_size(MAX_BLOCK_SIZE + 1).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            base.clone()
                .with_protocol(Protocol::Udp)
                .with_block_size(MAX_UDP_BLOCK_SIZE + 1)
                .validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            base.clone()
                .with_interval(Duration::from_millis(50))
                .validate(),
            Err(Error::Config(_))
        ));
        assert!(base.clone().with_interval(Duration::ZERO).validate().is_ok());
        assert!(matches!(
            base.clone().with_mss(MAX_MSS + 1).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            base.clone().with_bytes(0).validate(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            base.with_duration(MAX_DURATION + Duration::from_secs(1))
                .validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_role_conflicts() {
        let client = Config::client("h".to_string(), 5201).with_one_off(true);
        assert!(matches!(client.validate(), Err(Error::RoleConflict(_))));

        let server = Config::server(5201).with_reverse(true);
        assert!(matches!(server.validate(), Err(Error::RoleConflict(_))));

        let server = Config::server(5201).with_bytes(10);
        assert!(matches!(server.validate(), Err(Error::RoleConflict(_))));

        let server = Config::server(0)
            .with_one_off(true)
            .with_bitrate_limit(1_000_000, Duration::from_secs(5));
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_client_requires_address() {
        let mut config = Config::client(String::new(), 5201);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.server_addr = None;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_settings_follow_config() {
        let settings = Config::client("h".to_string(), 5201)
            .with_bytes(1_000_000)
            .with_block_size(1024)
            .with_window(65536)
            .with_no_delay(true)
            .settings();
        assert_eq!(settings.block_size, 1024);
        assert_eq!(settings.end, EndCondition::Bytes(1_000_000));
        assert_eq!(settings.socket_bufsize, 65536);
        assert!(settings.no_delay);
    }
}
