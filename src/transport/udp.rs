use super::{apply_common_options, set_dont_fragment, DataSocket, Listener, StreamContext, Transport};
use crate::config::{Protocol, Settings, MAX_UDP_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::stream::StreamShared;
use crate::test::TestShared;
use crate::udp_packet::{
    epoch_secs, header_len, is_handshake_datagram, parse_header, write_header, UDP_CONNECT_MSG,
    UDP_CONNECT_REPLY,
};
use log::debug;
use socket2::{Domain, SockAddr, SockRef, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::net::{TcpListener, UdpSocket};

/// Data streams over UDP.
///
/// The server listens on the control port number. Each connect datagram
/// turns the listening socket into that stream's connected socket, and a
/// fresh listener is bound in its place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpTransport;

impl Transport for UdpTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn init(&self, settings: &Settings) -> Result<()> {
        let min = header_len(settings.udp_counters_64bit);
        if settings.block_size < min || settings.block_size > MAX_UDP_BLOCK_SIZE {
            return Err(Error::Config(format!(
                "UDP block size must be between {} and {} bytes",
                min, MAX_UDP_BLOCK_SIZE
            )));
        }
        Ok(())
    }

    async fn listen(&self, control: &Arc<TcpListener>, ctx: StreamContext<'_>) -> Result<Listener> {
        let addr = control.local_addr()?;
        Ok(Listener::Udp(bind_udp(addr, ctx.settings)?))
    }

    async fn accept(&self, listener: &mut Listener, ctx: StreamContext<'_>) -> Result<DataSocket> {
        let Listener::Udp(socket) = listener else {
            return Err(Error::Protocol("UDP accept on a TCP listener".to_string()));
        };

        let mut buf = [0u8; 64];
        let peer = loop {
            let (n, peer) = socket.recv_from(&mut buf).await?;
            if n == 4 && buf[..4] == UDP_CONNECT_MSG.to_be_bytes() {
                break peer;
            }
            debug!("Ignoring {} byte datagram from {} on the UDP listener", n, peer);
        };

        let local = socket.local_addr()?;
        let fresh = bind_udp(local, ctx.settings)?;
        let connected = std::mem::replace(socket, fresh);
        connected.connect(peer).await?;
        connected.send(&UDP_CONNECT_REPLY.to_be_bytes()).await?;
        debug!("Accepted UDP stream from {}", peer);
        Ok(DataSocket::Udp(connected))
    }

    async fn connect(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        ctx: StreamContext<'_>,
    ) -> Result<DataSocket> {
        let settings = ctx.settings;
        let local = local.unwrap_or_else(|| unspecified_for(remote));
        let socket = bind_udp(local, settings)?;
        socket.connect(remote).await?;

        let attempts = settings.udp_connect_retries + 1;
        let mut buf = [0u8; 64];
        for attempt in 1..=attempts {
            socket
                .send(&UDP_CONNECT_MSG.to_be_bytes())
                .await
                .map_err(|e| Error::Connection(format!("UDP connect to {}: {}", remote, e)))?;
            match tokio::time::timeout(settings.udp_connect_timeout, socket.recv(&mut buf)).await {
                Ok(Ok(4)) if buf[..4] == UDP_CONNECT_REPLY.to_be_bytes() => {
                    debug!("UDP stream connected to {} after {} attempt(s)", remote, attempt);
                    return Ok(DataSocket::Udp(socket));
                }
                Ok(Ok(n)) => debug!("Unexpected {} byte datagram during UDP connect", n),
                Ok(Err(e)) => debug!("UDP connect attempt {} to {} failed: {}", attempt, remote, e),
                Err(_) => debug!("UDP connect attempt {} to {} timed out", attempt, remote),
            }
        }
        Err(Error::Connection(format!(
            "no UDP connect reply from {} after {} attempts",
            remote, attempts
        )))
    }

    async fn send(
        &self,
        socket: &mut DataSocket,
        stream: &StreamShared,
        test: &TestShared,
        buf: &mut [u8],
    ) -> Result<usize> {
        let DataSocket::Udp(socket) = socket else {
            return Err(Error::Protocol("UDP send on a TCP socket".to_string()));
        };
        let sequence = stream.next_sequence();
        write_header(buf, sequence, SystemTime::now(), test.settings().udp_counters_64bit);
        let n = socket
            .send(buf)
            .await
            .map_err(|e| Error::stream(stream.id, e))?;
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
        let DataSocket::Udp(socket) = socket else {
            return Err(Error::Protocol("UDP receive on a TCP socket".to_string()));
        };
        let n = socket
            .recv(buf)
            .await
            .map_err(|e| Error::stream(stream.id, e))?;
        let packet = &buf[..n];
        if is_handshake_datagram(packet) {
            return Ok(0);
        }
        if test.is_counting() {
            stream.counters.add_received(n as u64);
            test.record_received(n as u64);
            if let Some(header) = parse_header(packet, test.settings().udp_counters_64bit) {
                let transit = epoch_secs(SystemTime::now()) - header.sent_secs();
                stream.udp.lock().on_packet(header.sequence, transit);
            }
        }
        Ok(n)
    }
}

fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    let ip = if remote.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, 0)
}

/// Binds a non-blocking UDP socket that can share its port with other
/// stream sockets.
fn bind_udp(addr: SocketAddr, settings: &Settings) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    {
        let sock = SockRef::from(&socket);
        apply_common_options(&sock, settings, addr.is_ipv6())?;
        if settings.dont_fragment && addr.is_ipv4() {
            set_dont_fragment(&sock)?;
        }
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
