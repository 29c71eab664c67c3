use super::{apply_common_options, DataSocket, Listener, StreamContext, Transport};
use crate::config::{Protocol, Settings};
use crate::error::{Error, Result};
use crate::measurements;
use crate::protocol::{read_cookie, write_cookie, write_state};
use crate::state::TestState;
use crate::stream::StreamShared;
use crate::test::TestShared;
use log::{debug, warn};
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Data streams over TCP, accepted on the control listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    async fn listen(&self, control: &Arc<TcpListener>, _ctx: StreamContext<'_>) -> Result<Listener> {
        Ok(Listener::Tcp(control.clone()))
    }

    async fn accept(&self, listener: &mut Listener, ctx: StreamContext<'_>) -> Result<DataSocket> {
        let Listener::Tcp(listener) = listener else {
            return Err(Error::Protocol("TCP accept on a UDP listener".to_string()));
        };
        let (mut stream, peer) = listener.accept().await?;

        let cookie = read_cookie_within(&mut stream, ctx.settings.rcv_timeout).await?;
        if cookie != ctx.cookie {
            warn!("Rejecting stream connection from {}: cookie mismatch", peer);
            // Best effort, the peer may already be gone.
            let _ = write_state(&mut stream, TestState::AccessDenied).await;
            return Err(Error::AccessDenied);
        }

        apply_tcp_options(&SockRef::from(&stream), ctx.settings, peer.is_ipv6())?;
        debug!("Accepted TCP stream from {}", peer);
        Ok(DataSocket::Tcp(stream))
    }

    async fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        ctx: StreamContext<'_>,
    ) -> Result<DataSocket> {
        let settings = ctx.settings;
        let mut stream = connect_tcp(remote, local, settings.connect_timeout, |sock| {
            apply_tcp_options(&SockRef::from(sock), settings, remote.is_ipv6())
        })
        .await?;
        write_cookie(&mut stream, ctx.cookie).await?;
        debug!("Connected TCP stream {:?} -> {}", stream.local_addr().ok(), remote);
        Ok(DataSocket::Tcp(stream))
    }

    async fn send(
        &self,
        socket: &mut DataSocket,
        stream: &StreamShared,
        test: &TestShared,
        buf: &mut [u8],
    ) -> Result<usize> {
        let DataSocket::Tcp(socket) = socket else {
            return Err(Error::Protocol("TCP send on a UDP socket".to_string()));
        };
        socket
            .write_all(buf)
            .await
            .map_err(|e| Error::stream(stream.id, e))?;
        let n = buf.len();
        if test.is_counting() {
            stream.counters.add_sent(n as u64);
            test.record_sent(n as u64);
        }
        Ok(n)
    }

    async fn recv(
        &self,
        socket: &mut DataSocket,
        stream: &StreamShared,
        test: &TestShared,
        buf: &mut [u8],
    ) -> Result<usize> {
        let DataSocket::Tcp(socket) = socket else {
            return Err(Error::Protocol("TCP receive on a UDP socket".to_string()));
        };
        let n = socket
            .read(buf)
            .await
            .map_err(|e| Error::stream(stream.id, e))?;
        if n == 0 {
            return Err(Error::stream(
                stream.id,
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ));
        }
        if test.is_counting() {
            stream.counters.add_received(n as u64);
            test.record_received(n as u64);
        }
        Ok(n)
    }
}

async fn read_cookie_within(stream: &mut TcpStream, limit: Duration) -> Result<String> {
    if limit.is_zero() {
        return read_cookie(stream).await;
    }
    tokio::time::timeout(limit, read_cookie(stream))
        .await
        .map_err(|_| Error::Connection("timed out waiting for the stream cookie".to_string()))?
}

/// TCP-specific options on top of the common ones: MSS, Nagle and the
/// congestion control algorithm.
pub(crate) fn apply_tcp_options(sock: &SockRef<'_>, settings: &Settings, ipv6: bool) -> Result<()> {
    apply_common_options(sock, settings, ipv6)?;
    if settings.mss > 0 {
        sock.set_mss(settings.mss)?;
    }
    if settings.no_delay {
        sock.set_nodelay(true)?;
    }
    if let Some(algorithm) = settings.congestion.as_deref() {
        set_congestion(sock, algorithm)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_congestion(sock: &SockRef<'_>, algorithm: &str) -> Result<()> {
    use std::os::fd::AsRawFd;
    measurements::set_tcp_congestion(sock.as_raw_fd(), algorithm).map_err(|e| {
        Error::Config(format!(
            "unable to set TCP congestion control to {}: {}",
            algorithm, e
        ))
    })
}

#[cfg(not(unix))]
fn set_congestion(_sock: &SockRef<'_>, algorithm: &str) -> Result<()> {
    Err(Error::Config(format!(
        "unable to set TCP congestion control to {}",
        algorithm
    )))
}

/// Opens a TCP connection, optionally from a fixed local address.
///
/// `configure` runs on the raw socket before the connect, so options like
/// the MSS and buffer sizes take effect for the handshake.
pub(crate) async fn connect_tcp<F>(
    remote: SocketAddr,
    local: Option<SocketAddr>,
    connect_timeout: Option<Duration>,
    configure: F,
) -> Result<TcpStream>
where
    F: FnOnce(&Socket) -> Result<()>,
{
    let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(socket2::Protocol::TCP))?;
    configure(&socket)?;
    socket.set_nonblocking(true)?;
    if let Some(local) = local {
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(local))?;
    }

    // Non-blocking connect; completion is awaited below.
    match socket.connect(&SockAddr::from(remote)) {
        Ok(()) => {}
        #[cfg(unix)]
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.raw_os_error() == Some(libc::EALREADY)
                || e.raw_os_error() == Some(libc::EWOULDBLOCK) => {}
        Err(e) => return Err(connect_error(remote, e)),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    let established = async {
        stream.writable().await?;
        match stream.take_error()? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    };
    match connect_timeout {
        Some(limit) => tokio::time::timeout(limit, established)
            .await
            .map_err(|_| Error::Connection(format!("connection to {} timed out", remote)))?
            .map_err(|e| connect_error(remote, e))?,
        None => established.await.map_err(|e| connect_error(remote, e))?,
    }
    Ok(stream)
}

/// Binds the control listener. Without an explicit address the listener
/// is dual-stack where the platform allows it.
pub(crate) fn bind_listener(bind_addr: Option<IpAddr>, port: u16) -> Result<TcpListener> {
    let addr = match bind_addr {
        Some(ip) => SocketAddr::new(ip, port),
        None => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
    };
    let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(socket2::Protocol::TCP)) {
        Ok(socket) => socket,
        Err(e) if bind_addr.is_none() => {
            debug!("IPv6 unavailable ({}), listening on IPv4 only", e);
            return bind_listener(Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), port);
        }
        Err(e) => return Err(e.into()),
    };
    socket.set_reuse_address(true)?;
    if bind_addr.is_none() {
        socket.set_only_v6(false)?;
    }
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|e| Error::Connection(format!("unable to listen on {}: {}", addr, e)))?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

fn connect_error(remote: SocketAddr, e: std::io::Error) -> Error {
    Error::Connection(format!("unable to connect to {}: {}", remote, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_cookie() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let settings = Settings::default();
        let cookie = crate::protocol::generate_cookie();
        let ctx = StreamContext {
            settings: &settings,
            cookie: &cookie,
        };

        let transport = TcpTransport;
        let mut server_side = transport.listen(&listener, ctx).await.unwrap();
        let (client, server) = tokio::join!(
            transport.connect(addr, None, ctx),
            transport.accept(&mut server_side, ctx)
        );
        let client = client.unwrap();
        let server = server.unwrap();
        assert_eq!(client.local_addr().unwrap(), server.peer_addr().unwrap());
    }

    #[tokio::test]
    async fn test_wrong_cookie_is_denied() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let settings = Settings::default();
        let expected = crate::protocol::generate_cookie();
        let other = crate::protocol::generate_cookie();

        let transport = TcpTransport;
        let mut server_side = Listener::Tcp(listener.clone());
        let client = async {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            write_cookie(&mut stream, &other).await.unwrap();
            crate::protocol::read_state(&mut stream).await
        };
        let server = transport.accept(
            &mut server_side,
            StreamContext {
                settings: &settings,
                cookie: &expected,
            },
        );
        let (state, accepted) = tokio::join!(client, server);
        assert!(matches!(accepted, Err(Error::AccessDenied)));
        assert!(matches!(state, Ok(TestState::AccessDenied)));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port and close it again.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let result = connect_tcp(addr, None, Some(Duration::from_secs(2)), |_| Ok(())).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_mss_and_nodelay_applied() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = Settings {
            no_delay: true,
            ..Settings::default()
        };
        let stream = connect_tcp(addr, None, None, |sock| {
            apply_tcp_options(&SockRef::from(sock), &settings, false)
        })
        .await
        .unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_bind_listener_on_loopback() {
        let listener = bind_listener(Some("127.0.0.1".parse().unwrap()), 0).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        assert_eq!(client.unwrap().local_addr().unwrap(), accepted.unwrap().1);
    }
}
