//! Data-plane transports.
//!
//! A [`Transport`] knows how to open data streams for one protocol and how
//! to move one block across them. The coordinator picks an implementation
//! through [`TransportKind`]; only TCP and UDP are implemented, the other
//! protocols the parameter exchange can name are rejected when the test is
//! initialized.

mod tcp;
mod udp;

pub(crate) use tcp::{bind_listener, connect_tcp};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use crate::config::{Protocol, Settings};
use crate::error::{Error, Result};
use crate::stream::StreamShared;
use crate::test::TestShared;
use log::debug;
use socket2::SockRef;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Where a server accepts data streams.
#[derive(Debug)]
pub enum Listener {
    /// The control listener, shared with the coordinator
    Tcp(Arc<TcpListener>),
    /// A UDP socket bound to the server port, replaced after every accept
    Udp(UdpSocket),
}

/// A connected data socket.
#[derive(Debug)]
pub enum DataSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl DataSocket {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            DataSocket::Tcp(s) => s.local_addr(),
            DataSocket::Udp(s) => s.local_addr(),
        }
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            DataSocket::Tcp(s) => s.peer_addr(),
            DataSocket::Udp(s) => s.peer_addr(),
        }
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> Option<i32> {
        use std::os::fd::AsRawFd;
        Some(match self {
            DataSocket::Tcp(s) => s.as_raw_fd(),
            DataSocket::Udp(s) => s.as_raw_fd(),
        })
    }

    #[cfg(not(unix))]
    pub fn raw_fd(&self) -> Option<i32> {
        None
    }

    pub fn sock_ref(&self) -> SockRef<'_> {
        match self {
            DataSocket::Tcp(s) => SockRef::from(s),
            DataSocket::Udp(s) => SockRef::from(s),
        }
    }

    /// Kernel buffer sizes actually granted, `(send, receive)`.
    pub fn buffer_sizes(&self) -> (u32, u32) {
        let sock = self.sock_ref();
        (
            sock.send_buffer_size().unwrap_or(0) as u32,
            sock.recv_buffer_size().unwrap_or(0) as u32,
        )
    }
}

/// Per-test inputs a transport needs to open streams.
#[derive(Debug, Clone, Copy)]
pub struct StreamContext<'a> {
    pub settings: &'a Settings,
    pub cookie: &'a str,
}

/// One data-plane protocol.
///
/// `send` and `recv` move exactly one block and update the stream and test
/// counters, but only while the test is in the running state.
pub trait Transport {
    fn protocol(&self) -> Protocol;

    /// Checks the negotiated settings before any stream is opened.
    fn init(&self, _settings: &Settings) -> Result<()> {
        Ok(())
    }

    /// Opens the server side for data streams on the control port.
    fn listen(
        &self,
        control: &Arc<TcpListener>,
        ctx: StreamContext<'_>,
    ) -> impl Future<Output = Result<Listener>> + Send;

    /// Waits for the next data stream. Cancel-safe until a connection has
    /// been picked up.
    fn accept(
        &self,
        listener: &mut Listener,
        ctx: StreamContext<'_>,
    ) -> impl Future<Output = Result<DataSocket>> + Send;

    /// Opens one client data stream to `remote`.
    fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        ctx: StreamContext<'_>,
    ) -> impl Future<Output = Result<DataSocket>> + Send;

    fn send(
        &self,
        socket: &mut DataSocket,
        stream: &StreamShared,
        test: &TestShared,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send;

    fn recv(
        &self,
        socket: &mut DataSocket,
        stream: &StreamShared,
        test: &TestShared,
        buf: &mut [u8],
    ) -> impl Future<Output = Result<usize>> + Send;
}

/// The transport selected for a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp(TcpTransport),
    Udp(UdpTransport),
    /// Negotiable but not implemented
    Unsupported(Protocol),
}

impl TransportKind {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Tcp => TransportKind::Tcp(TcpTransport),
            Protocol::Udp => TransportKind::Udp(UdpTransport),
            other => TransportKind::Unsupported(other),
        }
    }

    fn unsupported(protocol: Protocol) -> Error {
        Error::UnsupportedProtocol(protocol.name().to_string())
    }
}

impl Transport for TransportKind {
    fn protocol(&self) -> Protocol {
        match self {
            TransportKind::Tcp(t) => t.protocol(),
            TransportKind::Udp(t) => t.protocol(),
            TransportKind::Unsupported(p) => *p,
        }
    }

    fn init(&self, settings: &Settings) -> Result<()> {
        match self {
            TransportKind::Tcp(t) => t.init(settings),
            TransportKind::Udp(t) => t.init(settings),
            TransportKind::Unsupported(p) => Err(Self::unsupported(*p)),
        }
    }

    async fn listen(&self, control: &Arc<TcpListener>, ctx: StreamContext<'_>) -> Result<Listener> {
        match self {
            TransportKind::Tcp(t) => t.listen(control, ctx).await,
            TransportKind::Udp(t) => t.listen(control, ctx).await,
            TransportKind::Unsupported(p) => Err(Self::unsupported(*p)),
        }
    }

    async fn accept(&self, listener: &mut Listener, ctx: StreamContext<'_>) -> Result<DataSocket> {
        match self {
            TransportKind::Tcp(t) => t.accept(listener, ctx).await,
            TransportKind::Udp(t) => t.accept(listener, ctx).await,
            TransportKind::Unsupported(p) => Err(Self::unsupported(*p)),
        }
    }

    async fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        ctx: StreamContext<'_>,
    ) -> Result<DataSocket> {
        match self {
            TransportKind::Tcp(t) => t.connect(remote, local, ctx).await,
            TransportKind::Udp(t) => t.connect(remote, local, ctx).await,
            TransportKind::Unsupported(p) => Err(Self::unsupported(*p)),
        }
    }

    async fn send(
        &self,
        socket: &mut DataSocket,
        stream: &StreamShared,
        test: &TestShared,
        buf: &mut [u8],
    ) -> Result<usize> {
        match self {
            TransportKind::Tcp(t) => t.send(socket, stream, test, buf).await,
            TransportKind::Udp(t) => t.send(socket, stream, test, buf).await,
            TransportKind::Unsupported(p) => Err(Self::unsupported(*p)),
        }
    }

    async fn recv(
        &self,
        socket: &mut DataSocket,
        stream: &StreamShared,
        test: &TestShared,
        buf: &mut [u8],
    ) -> Result<usize> {
        match self {
            TransportKind::Tcp(t) => t.recv(socket, stream, test, buf).await,
            TransportKind::Udp(t) => t.recv(socket, stream, test, buf).await,
            TransportKind::Unsupported(p) => Err(Self::unsupported(*p)),
        }
    }
}

/// Options shared by TCP and UDP data sockets: buffers, ToS and the
/// kernel pacing rate.
pub(crate) fn apply_common_options(sock: &SockRef<'_>, settings: &Settings, ipv6: bool) -> Result<()> {
    if settings.socket_bufsize > 0 {
        let size = settings.socket_bufsize as usize;
        sock.set_send_buffer_size(size)?;
        sock.set_recv_buffer_size(size)?;
        debug!(
            "Socket buffers requested {} bytes, granted snd={} rcv={}",
            size,
            sock.send_buffer_size().unwrap_or(0),
            sock.recv_buffer_size().unwrap_or(0)
        );
    }
    if settings.tos > 0 {
        set_tos(sock, settings.tos, ipv6)?;
    }
    if settings.fq_rate > 0 {
        set_max_pacing_rate(sock, settings.fq_rate / 8)?;
    }
    Ok(())
}

fn set_tos(sock: &SockRef<'_>, tos: u8, ipv6: bool) -> Result<()> {
    if ipv6 {
        set_int_option(sock, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, tos as libc::c_int)
    } else {
        sock.set_tos(tos as u32).map_err(Error::Io)
    }
}

#[cfg(target_os = "linux")]
fn set_max_pacing_rate(sock: &SockRef<'_>, bytes_per_second: u64) -> Result<()> {
    let rate = bytes_per_second.min(u32::MAX as u64) as libc::c_int;
    set_int_option(sock, libc::SOL_SOCKET, libc::SO_MAX_PACING_RATE, rate)
}

#[cfg(not(target_os = "linux"))]
fn set_max_pacing_rate(_sock: &SockRef<'_>, _bytes_per_second: u64) -> Result<()> {
    Err(Error::Config(
        "fair-queue pacing is not supported on this platform".to_string(),
    ))
}

#[cfg(target_os = "linux")]
pub(crate) fn set_dont_fragment(sock: &SockRef<'_>) -> Result<()> {
    set_int_option(sock, libc::IPPROTO_IP, libc::IP_MTU_DISCOVER, libc::IP_PMTUDISC_DO)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_dont_fragment(_sock: &SockRef<'_>) -> Result<()> {
    Err(Error::Config(
        "don't-fragment is not supported on this platform".to_string(),
    ))
}

#[cfg(unix)]
fn set_int_option(sock: &SockRef<'_>, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
    use std::os::fd::AsRawFd;
    let ret = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Resolves `host:port`, preferring the first address returned.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::Connection(format!("could not resolve host: {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_selection() {
        assert_eq!(TransportKind::for_protocol(Protocol::Tcp).protocol(), Protocol::Tcp);
        assert_eq!(TransportKind::for_protocol(Protocol::Udp).protocol(), Protocol::Udp);
        for p in [Protocol::Sctp, Protocol::Vsock, Protocol::Quic] {
            let t = TransportKind::for_protocol(p);
            assert_eq!(t.protocol(), p);
            assert!(matches!(
                t.init(&Settings::default()),
                Err(Error::UnsupportedProtocol(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve("127.0.0.1", 5201).await.unwrap();
        assert_eq!(addr.port(), 5201);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_buffer_option_applied() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let settings = Settings {
            socket_bufsize: 256 * 1024,
            ..Settings::default()
        };
        apply_common_options(&SockRef::from(&socket), &settings, false).unwrap();
        let (snd, rcv) = DataSocket::Udp(socket).buffer_sizes();
        assert!(snd > 0);
        assert!(rcv > 0);
    }
}
