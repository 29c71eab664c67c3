use crate::client::{CallbackRef, ProgressCallback, ProgressEvent};
use crate::config::{Config, Role};
use crate::protocol::{
    deserialize_message, read_cookie, read_state, try_read_state, write_message,
    write_server_error, write_state, TestParams, TestResults,
};
use crate::reporter::{OutputSink, Reporter};
use crate::state::TestState;
use crate::test::Test;
use crate::timer::sleep_until;
use crate::transport::{bind_listener, DataSocket, Listener, StreamContext, Transport, TransportKind};
use crate::{Error, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const BANNER: &str = "-----------------------------------------------------------";

/// Decides whether a client may run a test.
///
/// The server calls it with the `authtoken` from the parameter document,
/// `None` when the client sent none. Closures taking `Option<&str>` work as
/// authorizers.
///
/// # Examples
///
/// ```no_run
/// use rsperf::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::bind(Config::server(5201))
///     .await?
///     .with_authorizer(|token: Option<&str>| token == Some("letmein"));
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: Option<&str>) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(Option<&str>) -> bool + Send + Sync,
{
    fn authorize(&self, token: Option<&str>) -> bool {
        self(token)
    }
}

/// How one pass through the accept loop ended.
enum Served {
    Test,
    Idle,
}

enum Wake {
    Cancelled,
    Control(std::io::Result<()>),
    Stream(Result<DataSocket>),
    Intruder(std::io::Result<(TcpStream, SocketAddr)>),
    Tick,
}

/// Network performance test server.
///
/// The `Server` listens for clients on one TCP port and runs their tests one
/// at a time. The same port carries the control connections and, for TCP
/// tests, the data streams; UDP data streams use the same port number.
/// Connections that arrive while a test is running are turned away with
/// ACCESS_DENIED without disturbing the test.
///
/// # Examples
///
/// ## Basic Server
///
/// ```no_run
/// use rsperf::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::bind(Config::server(5201)).await?;
///
/// println!("Starting server on {}...", server.local_addr());
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## One-off Server
///
/// ```no_run
/// use rsperf::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::server(5201).with_one_off(true);
/// let server = Server::bind(config).await?;
///
/// // Returns after the first client's test.
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    callback: Option<CallbackRef>,
    authorizer: Option<Arc<dyn Authorizer>>,
    output: OutputSink,
    cancellation_token: CancellationToken,
    forced_idle_restarts: AtomicU32,
    forced_no_msg_restarts: AtomicU32,
}

impl Server {
    /// Validates the configuration and binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-server or invalid configuration, or when
    /// the port cannot be bound.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rsperf::{Config, Server};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// // Port 0 picks a free port.
    /// let server = Server::bind(Config::server(0)).await?;
    /// println!("Listening on {}", server.local_addr());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn bind(config: Config) -> Result<Self> {
        if config.role != Role::Server {
            return Err(Error::RoleConflict(
                "a server needs a server configuration".to_string(),
            ));
        }
        config.validate()?;

        let listener = bind_listener(config.bind_addr, config.port)?;
        let local_addr = listener.local_addr()?;
        info!("Server bound to {}", local_addr);

        Ok(Self {
            config,
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            callback: None,
            authorizer: None,
            output: OutputSink::stdout(),
            cancellation_token: CancellationToken::new(),
            forced_idle_restarts: AtomicU32::new(0),
            forced_no_msg_restarts: AtomicU32::new(0),
        })
    }

    /// Address the server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Attaches a progress callback, invoked for every test the server runs.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Requires every client to pass `authorizer`.
    pub fn with_authorizer<A: Authorizer + 'static>(mut self, authorizer: A) -> Self {
        self.authorizer = Some(Arc::new(authorizer));
        self
    }

    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    /// Token that stops [`Server::run`]. A running test is ended with
    /// SERVER_TERMINATE.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Times the listener was restarted because no client came within the
    /// idle timeout.
    pub fn forced_idle_restarts(&self) -> u32 {
        self.forced_idle_restarts.load(Ordering::Relaxed)
    }

    /// Tests aborted because the peer stopped sending data.
    pub fn forced_no_msg_restarts(&self) -> u32 {
        self.forced_no_msg_restarts.load(Ordering::Relaxed)
    }

    /// Serves clients until cancelled, or after one test in one-off mode.
    ///
    /// A failed test does not stop the server, except in one-off mode where
    /// its error is returned.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot be restarted, when a restart
    /// counter exceeds the configured maximum, or for the failed test of a
    /// one-off server.
    pub async fn run(&self) -> Result<()> {
        let reporter = Reporter::new(self.output.clone(), self.config.json);
        let max_restarts = self.config.max_forced_restarts;
        let mut test_number: u64 = 0;

        loop {
            test_number += 1;
            reporter.info(BANNER);
            reporter.info(&format!(
                "Server listening on {} (test #{})",
                self.local_addr.port(),
                test_number
            ));
            reporter.info(BANNER);

            let listener = self.listener()?;
            let outcome = self.serve_one(&listener).await;
            drop(listener);

            match outcome {
                Ok(Served::Test) => debug!("Test #{} finished", test_number),
                Ok(Served::Idle) => {
                    if self.config.one_off {
                        info!("No client within the idle timeout, exiting");
                        return Ok(());
                    }
                    let restarts = self.forced_idle_restarts.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("No client within the idle timeout, restarting ({})", restarts);
                    if restarts > max_restarts {
                        return Err(Error::IdleTimeout(self.config.idle_timeout.unwrap_or_default()));
                    }
                    self.rebind()?;
                    test_number -= 1;
                    continue;
                }
                Err(Error::Interrupted) => {
                    info!("Server stopped");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Test #{} failed: {}", test_number, e);
                    if matches!(e, Error::IdleTimeout(_)) {
                        let restarts =
                            self.forced_no_msg_restarts.fetch_add(1, Ordering::Relaxed) + 1;
                        if restarts > max_restarts {
                            return Err(e);
                        }
                    }
                    if self.config.one_off {
                        return Err(e);
                    }
                }
            }

            if self.config.one_off {
                return Ok(());
            }
        }
    }

    fn listener(&self) -> Result<Arc<TcpListener>> {
        self.listener
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection("server listener is closed".to_string()))
    }

    /// Closes and reopens the listening socket on the same address.
    fn rebind(&self) -> Result<()> {
        let mut slot = self.listener.lock();
        drop(slot.take());
        let listener = bind_listener(self.config.bind_addr, self.local_addr.port())?;
        *slot = Some(Arc::new(listener));
        debug!("Listener restarted on {}", self.local_addr);
        Ok(())
    }

    /// Waits for one client and runs its test.
    async fn serve_one(&self, listener: &Arc<TcpListener>) -> Result<Served> {
        let accepted = tokio::select! {
            _ = self.cancellation_token.cancelled() => return Err(Error::Interrupted),
            r = within(self.config.idle_timeout, listener.accept()) => r,
        };
        let (mut control, peer) = match accepted {
            Some(r) => r?,
            None => return Ok(Served::Idle),
        };

        let mut test = Test::new(&self.config);
        test.set_output(self.output.clone());
        test.set_callback(self.callback.clone());

        let rcv_timeout = self.config.rcv_timeout;
        let timeout = (!rcv_timeout.is_zero()).then_some(rcv_timeout);
        let cookie = match within(timeout, read_cookie(&mut control)).await {
            Some(r) => r?,
            None => return Err(Error::Connection(format!("no cookie from {}", peer))),
        };
        control.set_nodelay(true)?;
        let local = control.local_addr()?;

        test.set_cookie(cookie);
        test.set_accepted_connection(peer);
        test.control = Some(control);
        test.reporter().info(&format!(
            "Accepted connection from {}, port {}",
            peer.ip(),
            peer.port()
        ));
        test.notify(ProgressEvent::Connected { local, remote: peer });

        match self.run_test(&mut test, listener).await {
            Ok(()) => Ok(Served::Test),
            Err(e) => {
                self.abort(&mut test, &e).await;
                Err(e)
            }
        }
    }

    async fn run_test(&self, test: &mut Test, listener: &Arc<TcpListener>) -> Result<()> {
        test.send_state(TestState::ParamExchange).await?;
        let params: TestParams = deserialize_message(test.control_mut()?).await?;
        self.authorize(test, &params).await?;
        let negotiated = params.negotiate(test.settings())?;
        test.apply_negotiated(negotiated)?;

        let settings = test.settings().clone();
        let cookie = test.cookie().to_string();
        let transport = test.transport();
        let tcp = test.protocol() == crate::Protocol::Tcp;
        let ctx = StreamContext {
            settings: &settings,
            cookie: &cookie,
        };
        let mut streams = Some(transport.listen(listener, ctx).await?);
        test.send_state(TestState::CreateStreams).await?;

        let expected = test.expected_streams();
        let create_deadline =
            (!settings.rcv_timeout.is_zero()).then(|| Instant::now() + settings.rcv_timeout);

        loop {
            let creating = test.state() == TestState::CreateStreams;
            let deadline = if creating {
                create_deadline
            } else {
                test.next_deadline()
            };
            let wake = {
                let control = test
                    .control
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("no control connection".to_string()))?;
                tokio::select! {
                    biased;
                    _ = self.cancellation_token.cancelled() => Wake::Cancelled,
                    r = control.readable() => Wake::Control(r),
                    r = accept_stream(transport, streams.as_mut(), ctx), if creating => Wake::Stream(r),
                    r = listener.accept(), if !(creating && tcp) => Wake::Intruder(r),
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
                        if self.handle_state(test, state).await? {
                            return Ok(());
                        }
                    }
                }
                Wake::Stream(Ok(socket)) => {
                    let index = test.streams().len();
                    let sender = test.stream_sends(index);
                    test.add_stream(socket, sender);
                    if test.streams().len() == expected {
                        streams = None;
                        start_test(test).await?;
                    }
                }
                Wake::Stream(Err(e @ (Error::AccessDenied | Error::Connection(_)))) => {
                    warn!("Rejected stream connection: {}", e);
                }
                Wake::Stream(Err(e)) => return Err(e),
                Wake::Intruder(Ok((stream, peer))) => reject(stream, peer),
                Wake::Intruder(Err(e)) => debug!("Accept failed during a test: {}", e),
                Wake::Tick => {}
            }

            let now = Instant::now();
            match test.state() {
                TestState::CreateStreams => {
                    if create_deadline.is_some_and(|d| now >= d) {
                        return Err(Error::IdleTimeout(settings.rcv_timeout));
                    }
                }
                TestState::TestStart | TestState::TestRunning => {
                    test.reap_workers().await;
                    test.run_timers(now)?;
                    test.check_idle(now)?;
                }
                _ => {}
            }
        }
    }

    async fn authorize(&self, test: &mut Test, params: &TestParams) -> Result<()> {
        let Some(authorizer) = &self.authorizer else {
            return Ok(());
        };
        if authorizer.authorize(params.authtoken.as_deref()) {
            return Ok(());
        }
        warn!("Rejecting test: authorization failed");
        // Best effort, the test fails either way.
        if let Err(e) = write_state(test.control_mut()?, TestState::AccessDenied).await {
            debug!("Could not send ACCESS_DENIED: {}", e);
        }
        Err(Error::Auth("invalid or missing credentials".to_string()))
    }

    /// Acts on one state byte from the client. Returns true once the test is
    /// complete.
    async fn handle_state(&self, test: &mut Test, state: TestState) -> Result<bool> {
        debug!("Received {}", state);
        match state {
            TestState::TestEnd => {
                self.end_test(test).await?;
                Ok(true)
            }
            TestState::ClientTerminate => {
                test.set_state(state)?;
                Err(Error::ClientTerminated)
            }
            other => Err(Error::Protocol(format!(
                "unexpected state {} from the client",
                other
            ))),
        }
    }

    async fn end_test(&self, test: &mut Test) -> Result<()> {
        test.set_state(TestState::TestEnd)?;
        test.finish(Instant::now());
        test.stop_workers().await;
        test.close_streams();

        test.send_state(TestState::ExchangeResults).await?;
        let peer: TestResults = deserialize_message(test.control_mut()?).await?;
        test.apply_peer_results(peer)?;

        let mut results = test.results();
        if test.get_server_output() {
            results.server_output_json = Some(serde_json::to_value(test.report())?);
        }
        write_message(test.control_mut()?, &results).await?;
        test.send_state(TestState::DisplayResults).await?;

        let rcv_timeout = test.settings().rcv_timeout;
        let timeout = (!rcv_timeout.is_zero()).then_some(rcv_timeout);
        let state = match within(timeout, read_state(test.control_mut()?)).await {
            Some(r) => r?,
            None => return Err(Error::IdleTimeout(rcv_timeout)),
        };
        match state {
            TestState::IperfDone => test.set_state(state)?,
            TestState::ClientTerminate => return Err(Error::ClientTerminated),
            other => {
                return Err(Error::Protocol(format!(
                    "expected IPERF_DONE, got {}",
                    other
                )))
            }
        }

        let report = test.report();
        test.print_report(&report)?;
        test.notify_completed(&report);
        info!("Test complete");
        Ok(())
    }

    /// Tells the client why the test ended, when it does not know yet, and
    /// reports what was measured.
    async fn abort(&self, test: &mut Test, err: &Error) {
        warn!("Test aborted: {}", err);
        let already_known = matches!(
            err,
            Error::PeerClosed | Error::ClientTerminated | Error::Auth(_) | Error::AccessDenied
        );
        if !already_known && !test.state().is_terminal() {
            if let Some(control) = test.control.as_mut() {
                // Best effort, the control connection may be what failed.
                let sent = match err {
                    Error::Interrupted => write_state(control, TestState::ServerTerminate).await,
                    other => write_server_error(control, other).await,
                };
                if let Err(e) = sent {
                    debug!("Could not notify the client: {}", e);
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

async fn start_test(test: &mut Test) -> Result<()> {
    test.send_state(TestState::TestStart).await?;
    test.on_test_start(Instant::now());
    test.send_state(TestState::TestRunning).await?;
    test.on_test_running(Instant::now());
    test.start_workers();
    Ok(())
}

async fn accept_stream(
    transport: TransportKind,
    listener: Option<&mut Listener>,
    ctx: StreamContext<'_>,
) -> Result<DataSocket> {
    match listener {
        Some(listener) => transport.accept(listener, ctx).await,
        None => std::future::pending().await,
    }
}

/// Turns away a connection that arrived while a test is in progress.
fn reject(mut stream: TcpStream, peer: SocketAddr) {
    warn!("Rejecting connection from {}: a test is already running", peer);
    tokio::spawn(async move {
        if let Err(e) = write_state(&mut stream, TestState::AccessDenied).await {
            debug!("Could not send ACCESS_DENIED to {}: {}", peer, e);
        }
    });
}

/// Awaits `fut`, giving up after `limit` when one is set.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{generate_cookie, write_cookie};

    async fn loopback_server(config: Config) -> Server {
        Server::bind(config.with_bind_addr("127.0.0.1".parse().unwrap()))
            .await
            .unwrap()
            .with_output(OutputSink::discard())
    }

    #[tokio::test]
    async fn test_bind_rejects_client_config() {
        let result = Server::bind(Config::client("127.0.0.1".to_string(), 5201)).await;
        assert!(matches!(result, Err(Error::RoleConflict(_))));
    }

    #[tokio::test]
    async fn test_ephemeral_port() {
        let server = loopback_server(Config::server(0)).await;
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_one_off_idle_exit() {
        let server = loopback_server(
            Config::server(0)
                .with_one_off(true)
                .with_idle_timeout(Duration::from_millis(100)),
        )
        .await;
        let result = tokio::time::timeout(Duration::from_secs(5), server.run())
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(server.forced_idle_restarts(), 0);
    }

    #[tokio::test]
    async fn test_idle_restarts_are_bounded() {
        let mut config = Config::server(0).with_idle_timeout(Duration::from_millis(50));
        config.max_forced_restarts = 2;
        let server = loopback_server(config).await;
        let result = tokio::time::timeout(Duration::from_secs(5), server.run())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::IdleTimeout(_))));
        assert_eq!(server.forced_idle_restarts(), 3);
    }

    #[tokio::test]
    async fn test_cancel_stops_server() {
        let server = loopback_server(Config::server(0)).await;
        let token = server.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let result = tokio::time::timeout(Duration::from_secs(5), server.run())
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_authorizer_denies_access() {
        let server = loopback_server(Config::server(0).with_one_off(true))
            .await
            .with_authorizer(|token: Option<&str>| token == Some("secret"));
        let addr = server.local_addr();
        let serving = async { server.run().await };

        let client = async {
            let mut control = TcpStream::connect(addr).await.unwrap();
            write_cookie(&mut control, &generate_cookie()).await.unwrap();
            assert_eq!(
                read_state(&mut control).await.unwrap(),
                TestState::ParamExchange
            );
            let params = TestParams::from_config(
                &Config::client("127.0.0.1".to_string(), addr.port())
                    .with_authtoken("wrong".to_string()),
            );
            write_message(&mut control, &params).await.unwrap();
            read_state(&mut control).await.unwrap()
        };

        let (result, state) = tokio::join!(serving, client);
        assert_eq!(state, TestState::AccessDenied);
        assert!(matches!(result, Err(Error::Auth(_))));
    }

    #[tokio::test]
    async fn test_bad_parameters_send_server_error() {
        let server = loopback_server(Config::server(0).with_one_off(true)).await;
        let addr = server.local_addr();
        let serving = async { server.run().await };

        let client = async {
            let mut control = TcpStream::connect(addr).await.unwrap();
            write_cookie(&mut control, &generate_cookie()).await.unwrap();
            read_state(&mut control).await.unwrap();
            let params = TestParams {
                tcp: true,
                parallel: 0,
                len: 1024,
                time: 1,
                ..TestParams::default()
            };
            write_message(&mut control, &params).await.unwrap();
            let state = read_state(&mut control).await.unwrap();
            assert_eq!(state, TestState::ServerError);
            crate::protocol::read_server_error(&mut control).await.unwrap()
        };

        let (result, reported) = tokio::join!(serving, client);
        assert!(result.is_err());
        assert!(matches!(reported, Error::ServerError { .. }));
    }
}
