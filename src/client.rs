use crate::config::{Config, Role};
use crate::measurements::TestReport;
use crate::protocol::{
    deserialize_message, generate_cookie, read_server_error, try_read_state, write_cookie,
    write_message, write_state, TestParams, TestResults,
};
use crate::reporter::OutputSink;
use crate::state::TestState;
use crate::test::Test;
use crate::timer::sleep_until;
use crate::transport::{connect_tcp, resolve, StreamContext, Transport};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Progress event types reported during test execution.
///
/// These events allow monitoring of test progress in real-time through callbacks.
/// Events are emitted for test lifecycle stages and periodic updates. Both the
/// client and the server emit them.
///
/// # Examples
///
/// ```no_run
/// use rsperf::{Client, Config, ProgressEvent};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_duration(Duration::from_secs(10));
///
/// let client = Client::new(config)?
///     .with_callback(|event: ProgressEvent| {
///         match event {
///             ProgressEvent::TestStarted => println!("Starting..."),
///             ProgressEvent::IntervalUpdate { bits_per_second, .. } => {
///                 println!("Speed: {:.2} Mbps", bits_per_second / 1_000_000.0);
///             }
///             ProgressEvent::TestCompleted { total_bytes, .. } => {
///                 println!("Transferred {} bytes", total_bytes);
///             }
///             ProgressEvent::Error(msg) => eprintln!("Error: {}", msg),
///             _ => {}
///         }
///     });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The control connection is established.
    Connected { local: SocketAddr, remote: SocketAddr },
    /// A data stream was connected or accepted.
    StreamConnected { id: u32, sender: bool },
    /// Test is starting.
    ///
    /// This event is emitted once, when the test enters TEST_START.
    TestStarted,
    /// Interval update with statistics.
    ///
    /// Emitted once per reporting interval with the totals over all streams
    /// for that interval.
    ///
    /// # Fields
    ///
    /// * `interval_start` - Start time of this interval relative to test start
    /// * `interval_end` - End time of this interval relative to test start
    /// * `bytes` - Number of bytes transferred during this interval
    /// * `bits_per_second` - Throughput in bits per second for this interval
    /// * `packets` - Number of packets (UDP only)
    /// * `jitter_ms` - Jitter in milliseconds (UDP only)
    /// * `lost_packets` - Number of lost packets (UDP only)
    /// * `lost_percent` - Packet loss percentage (UDP only)
    /// * `retransmits` - Number of TCP retransmits (TCP sender only)
    /// * `omitted` - The interval fell in the omit period
    IntervalUpdate {
        interval_start: Duration,
        interval_end: Duration,
        bytes: u64,
        bits_per_second: f64,
        packets: Option<u64>,
        jitter_ms: Option<f64>,
        lost_packets: Option<u64>,
        lost_percent: Option<f64>,
        retransmits: Option<u64>,
        omitted: bool,
    },
    /// Test completed with final measurements.
    ///
    /// Emitted once at the end of a successful test with total statistics.
    ///
    /// # Fields
    ///
    /// * `total_bytes` - Total bytes transferred during the entire test
    /// * `duration` - Actual test duration
    /// * `bits_per_second` - Average throughput over the entire test
    /// * `total_packets` - Total packets sent/received (UDP only)
    /// * `jitter_ms` - Final jitter measurement in milliseconds (UDP only)
    /// * `lost_packets` - Total lost packets (UDP only)
    /// * `lost_percent` - Final packet loss percentage (UDP only)
    /// * `out_of_order` - Out-of-order packet count (UDP only)
    TestCompleted {
        total_bytes: u64,
        duration: Duration,
        bits_per_second: f64,
        total_packets: Option<u64>,
        jitter_ms: Option<f64>,
        lost_packets: Option<u64>,
        lost_percent: Option<f64>,
        out_of_order: Option<u64>,
    },
    /// Error occurred during test execution.
    ///
    /// Contains a descriptive error message. The test ends after this event.
    Error(String),
}

/// Callback trait for receiving progress updates during test execution.
///
/// Implement this trait to receive real-time notifications about test progress.
/// The trait is automatically implemented for any function or closure with the
/// correct signature.
///
/// # Examples
///
/// ## Using a Closure
///
/// ```no_run
/// use rsperf::{Client, Config, ProgressEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5201);
/// let client = Client::new(config)?
///     .with_callback(|event| {
///         println!("Event: {:?}", event);
///     });
/// # Ok(())
/// # }
/// ```
///
/// ## Custom Implementation
///
/// ```
/// use rsperf::ProgressCallback;
/// use rsperf::ProgressEvent;
///
/// struct MyCallback;
///
/// impl ProgressCallback for MyCallback {
///     fn on_progress(&self, event: ProgressEvent) {
///         // Custom handling
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    /// Called when a progress event occurs.
    ///
    /// # Arguments
    ///
    /// * `event` - The progress event that occurred
    fn on_progress(&self, event: ProgressEvent);
}

/// Simple function-based callback
impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

pub type CallbackRef = Arc<dyn ProgressCallback>;

/// What woke the coordinator up.
enum Wake {
    Cancelled,
    Control(std::io::Result<()>),
    Tick,
}

/// Network performance test client.
///
/// The `Client` connects to a server, negotiates the test parameters over
/// the control connection and then drives the test: it opens the data
/// streams, decides when the test ends, and exchanges results with the
/// server.
///
/// # Features
///
/// - **TCP and UDP**: Test both reliable (TCP) and unreliable (UDP) protocols
/// - **Reverse and bidirectional modes**: The server sends, or both sides do
/// - **End conditions**: Run for a duration, a byte count or a block count
/// - **UDP Metrics**: Packet loss, jitter (RFC 1889), and out-of-order detection
/// - **Progress Callbacks**: Real-time updates during test execution
///
/// # Examples
///
/// ## Basic TCP Test
///
/// ```no_run
/// use rsperf::{Client, Config, Protocol};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_protocol(Protocol::Tcp)
///     .with_duration(Duration::from_secs(10));
///
/// let client = Client::new(config)?;
/// let report = client.run().await?;
///
/// println!("Average throughput: {:.2} Mbps",
///          report.end.sum_received.bits_per_second / 1_000_000.0);
/// # Ok(())
/// # }
/// ```
///
/// ## UDP Test with Bandwidth Limit
///
/// ```no_run
/// use rsperf::{Client, Config, Protocol};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_protocol(Protocol::Udp)
///     .with_bandwidth(100_000_000) // 100 Mbps
///     .with_duration(Duration::from_secs(10));
///
/// let client = Client::new(config)?;
/// let report = client.run().await?;
///
/// if let Some(sum) = &report.end.sum {
///     println!("Packets: {:?}, Loss: {:?}, Jitter: {:?} ms",
///              sum.packets, sum.lost_packets, sum.jitter_ms);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    callback: Option<CallbackRef>,
    output: OutputSink,
    cancellation_token: CancellationToken,
}

impl Client {
    /// Creates a new client with the given configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - The test configuration. Must be a client configuration
    ///   with a server address set.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is not a valid client
    /// configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use rsperf::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201);
    /// let client = Client::new(config).expect("Failed to create client");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.role != Role::Client {
            return Err(Error::RoleConflict(
                "a client needs a client configuration".to_string(),
            ));
        }
        config.validate()?;

        Ok(Self {
            config,
            callback: None,
            output: OutputSink::stdout(),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Attaches a progress callback to receive real-time test updates.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rsperf::{Client, Config, ProgressEvent};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::client("127.0.0.1".to_string(), 5201);
    /// let client = Client::new(config)?
    ///     .with_callback(|event: ProgressEvent| {
    ///         println!("Progress: {:?}", event);
    ///     });
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Sends the human-readable or JSON output somewhere other than stdout.
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling it interrupts a running test: the client tells the server
    /// with CLIENT_TERMINATE and returns [`Error::Interrupted`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rsperf::{Client, Config};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = Config::client("127.0.0.1".to_string(), 5201);
    /// let client = Client::new(config)?;
    ///
    /// let cancel_token = client.cancellation_token().clone();
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(5)).await;
    ///     cancel_token.cancel();
    /// });
    ///
    /// client.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Runs one test against the server and returns the final report.
    ///
    /// The report (or JSON document) is also printed to the output sink.
    /// On failure the partial results gathered so far are printed along with
    /// the error.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The server cannot be reached or refuses the test
    /// - The server reports an error or terminates
    /// - The control connection breaks or carries an unexpected message
    /// - The test is cancelled through [`Client::cancellation_token`]
    pub async fn run(&self) -> Result<TestReport> {
        let mut test = Test::new(&self.config);
        test.set_output(self.output.clone());
        test.set_callback(self.callback.clone());

        match self.run_test(&mut test).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.abort(&mut test, &e).await;
                Err(e)
            }
        }
    }

    async fn run_test(&self, test: &mut Test) -> Result<TestReport> {
        let host = self
            .config
            .server_addr
            .clone()
            .ok_or_else(|| Error::Config("client requires a server address".to_string()))?;
        let port = self.config.port;

        test.transport().init(test.settings())?;
        let remote = resolve(&host, port).await?;
        test.set_cookie(generate_cookie());
        test.set_connecting_to(&host, port);
        test.reporter()
            .info(&format!("Connecting to host {}, port {}", host, port));

        let local = self.config.bind_addr.map(|ip| SocketAddr::new(ip, 0));
        let mut control = tokio::select! {
            _ = self.cancellation_token.cancelled() => return Err(Error::Interrupted),
            r = connect_tcp(remote, local, self.config.connect_timeout, |_| Ok(())) => r?,
        };
        control.set_nodelay(true)?;
        write_cookie(&mut control, test.cookie()).await?;
        let local = control.local_addr()?;
        info!("Connected to {} from {}", remote, local);
        test.control = Some(control);
        test.notify(ProgressEvent::Connected { local, remote });

        let params = TestParams::from_config(&self.config);
        loop {
            let shared = test.shared().clone();
            let deadline = test.next_deadline();
            let wake = {
                let control = test
                    .control
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("no control connection".to_string()))?;
                tokio::select! {
                    biased;
                    _ = self.cancellation_token.cancelled() => Wake::Cancelled,
                    r = control.readable() => Wake::Control(r),
                    _ = shared.end_notified(), if test.state() == TestState::TestRunning => Wake::Tick,
                    _ = sleep_until(deadline) => Wake::Tick,
                }
            };

            match wake {
                Wake::Cancelled => return Err(Error::Interrupted),
                Wake::Control(ready) => {
                    ready?;
                    let state = match test.control.as_ref() {
                        Some(control) => try_read_state(control)?,
                        None => None,
                    };
                    if let Some(state) = state {
                        if let Some(report) = self.handle_state(test, state, &params, remote).await? {
                            return Ok(report);
                        }
                    }
                }
                Wake::Tick => {}
            }

            let now = Instant::now();
            match test.state() {
                TestState::TestStart => test.run_timers(now)?,
                TestState::TestRunning => {
                    test.reap_workers().await;
                    test.run_timers(now)?;
                    test.check_idle(now)?;
                    if test.end_condition_met() {
                        self.end_test(test).await?;
                    }
                }
                _ => {}
            }
        }
    }

    /// Acts on one state byte from the server. Returns the final report once
    /// the test is over.
    async fn handle_state(
        &self,
        test: &mut Test,
        state: TestState,
        params: &TestParams,
        remote: SocketAddr,
    ) -> Result<Option<TestReport>> {
        debug!("Received {}", state);
        match state {
            TestState::ParamExchange => {
                test.set_state(state)?;
                write_message(test.control_mut()?, params).await?;
            }
            TestState::CreateStreams => {
                test.set_state(state)?;
                self.create_streams(test, remote).await?;
            }
            TestState::TestStart => {
                test.set_state(state)?;
                test.on_test_start(Instant::now());
            }
            TestState::TestRunning => {
                test.set_state(state)?;
                test.on_test_running(Instant::now());
                test.start_workers();
            }
            TestState::ExchangeResults => {
                test.set_state(state)?;
                let results = test.results();
                let control = test.control_mut()?;
                write_message(control, &results).await?;
                let peer: TestResults = deserialize_message(control).await?;
                test.apply_peer_results(peer)?;
            }
            TestState::DisplayResults => {
                test.set_state(state)?;
                let report = test.report();
                test.print_report(&report)?;
                test.notify_completed(&report);
                test.close_streams();
                test.send_state(TestState::IperfDone).await?;
                return Ok(Some(report));
            }
            TestState::AccessDenied => return Err(Error::AccessDenied),
            TestState::ServerError => {
                let err = read_server_error(test.control_mut()?).await?;
                return Err(err);
            }
            TestState::ServerTerminate => return Err(Error::ServerTerminated),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected state {} from the server",
                    other
                )))
            }
        }
        Ok(None)
    }

    async fn create_streams(&self, test: &mut Test, remote: SocketAddr) -> Result<()> {
        let settings = test.settings().clone();
        let cookie = test.cookie().to_string();
        let transport = test.transport();

        for index in 0..test.expected_streams() {
            let local = self.stream_local_addr(remote, index)?;
            let ctx = StreamContext {
                settings: &settings,
                cookie: &cookie,
            };
            let socket = tokio::select! {
                _ = self.cancellation_token.cancelled() => return Err(Error::Interrupted),
                r = transport.connect(remote, local, ctx) => r?,
            };
            let sender = test.stream_sends(index);
            test.add_stream(socket, sender);
        }
        Ok(())
    }

    /// Local address for data stream `index`: the bind address and
    /// consecutive ports from the bind port, when either is set.
    fn stream_local_addr(&self, remote: SocketAddr, index: usize) -> Result<Option<SocketAddr>> {
        let port = match self.config.bind_port {
            Some(first) => u16::try_from(index)
                .ok()
                .and_then(|i| first.checked_add(i))
                .ok_or_else(|| Error::Config("bind port range overflows".to_string()))?,
            None => 0,
        };
        Ok(match (self.config.bind_addr, port) {
            (None, 0) => None,
            (Some(ip), port) => Some(SocketAddr::new(ip, port)),
            (None, port) => {
                let ip = if remote.is_ipv4() {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                } else {
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                };
                Some(SocketAddr::new(ip, port))
            }
        })
    }

    async fn end_test(&self, test: &mut Test) -> Result<()> {
        info!("Test end condition reached");
        test.send_state(TestState::TestEnd).await?;
        test.finish(Instant::now());
        test.stop_workers().await;
        Ok(())
    }

    /// Cleans up after a failed test and reports what was measured so far.
    async fn abort(&self, test: &mut Test, err: &Error) {
        warn!("Test aborted: {}", err);
        let tell_server = matches!(
            err,
            Error::Interrupted | Error::IdleTimeout(_) | Error::Stream { .. } | Error::Protocol(_)
        );
        if tell_server && !test.state().is_terminal() {
            if let Some(control) = test.control.as_mut() {
                // Best effort, the server may already be gone.
                if let Err(e) = write_state(control, TestState::ClientTerminate).await {
                    debug!("Could not send CLIENT_TERMINATE: {}", e);
                }
            }
        }

        test.stop_workers().await;
        test.close_streams();

        let message = err.to_string();
        test.set_error(message.clone());
        if test.streams().is_empty() {
            test.print_error(None, &message);
        } else {
            test.finish(Instant::now());
            let report = test.report();
            test.print_error(Some(&report), &message);
        }
        test.notify(ProgressEvent::Error(message));
        test.control = None;
    }
}
