//! UDP datagram header and connect handshake messages.
//!
//! Every UDP data datagram starts with the sender's timestamp and a
//! sequence counter, followed by filler up to the block size.
//!
//! # Packet Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────┬──────────────┐
//! │   Seconds    │ Microseconds │      Sequence        │   Payload    │
//! │   (4 bytes)  │  (4 bytes)   │  (4 or 8 bytes)      │  (variable)  │
//! └──────────────┴──────────────┴──────────────────────┴──────────────┘
//! ```
//!
//! All fields are big-endian. The first datagram of a stream carries
//! sequence number 1.
//!
//! # Connect handshake
//!
//! Before data flows the client sends the 4-byte [`UDP_CONNECT_MSG`] on the
//! new stream socket and the server answers with [`UDP_CONNECT_REPLY`].
//!
//! # Examples
//!
//! ```
//! use rsperf::udp_packet::{parse_header, write_header, header_len};
//! use std::time::{Duration, UNIX_EPOCH};
//!
//! let mut packet = vec![0u8; 1460];
//! let sent = UNIX_EPOCH + Duration::from_micros(1_500_000);
//! write_header(&mut packet, 42, sent, false);
//!
//! let header = parse_header(&packet, false).expect("Invalid packet");
//! assert_eq!(header.sequence, 42);
//! assert_eq!(header.sec, 1);
//! assert_eq!(header.usec, 500_000);
//! assert_eq!(header_len(false), 12);
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Client-to-server connect datagram.
pub const UDP_CONNECT_MSG: u32 = 0x3637_3839;
/// Server-to-client connect acknowledgement.
pub const UDP_CONNECT_REPLY: u32 = 0x3938_3736;

/// Header length for the selected counter width.
pub fn header_len(counters_64bit: bool) -> usize {
    if counters_64bit {
        16
    } else {
        12
    }
}

/// Decoded UDP datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPacketHeader {
    /// Send time, seconds since the UNIX epoch
    pub sec: u32,
    /// Send time, microsecond part
    pub usec: u32,
    /// Packet sequence number (monotonically increasing from 1)
    pub sequence: u64,
}

impl UdpPacketHeader {
    /// Send time as seconds since the epoch.
    pub fn sent_secs(&self) -> f64 {
        self.sec as f64 + self.usec as f64 / 1_000_000.0
    }
}

/// Writes the header for `sequence` into the front of `buf`.
///
/// `buf` must be at least [`header_len`] bytes; the block-size check in
/// the configuration guarantees that for data buffers.
pub fn write_header(buf: &mut [u8], sequence: u64, sent: SystemTime, counters_64bit: bool) {
    let since_epoch = sent.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    buf[0..4].copy_from_slice(&(since_epoch.as_secs() as u32).to_be_bytes());
    buf[4..8].copy_from_slice(&since_epoch.subsec_micros().to_be_bytes());
    if counters_64bit {
        buf[8..16].copy_from_slice(&sequence.to_be_bytes());
    } else {
        buf[8..12].copy_from_slice(&(sequence as u32).to_be_bytes());
    }
}

/// Parses the header at the front of a received datagram.
///
/// Returns `None` when the datagram is shorter than the header.
pub fn parse_header(packet: &[u8], counters_64bit: bool) -> Option<UdpPacketHeader> {
    if packet.len() < header_len(counters_64bit) {
        return None;
    }
    let sec = u32::from_be_bytes(packet[0..4].try_into().ok()?);
    let usec = u32::from_be_bytes(packet[4..8].try_into().ok()?);
    let sequence = if counters_64bit {
        u64::from_be_bytes(packet[8..16].try_into().ok()?)
    } else {
        u32::from_be_bytes(packet[8..12].try_into().ok()?) as u64
    };
    Some(UdpPacketHeader { sec, usec, sequence })
}

/// True for a stray connect or connect-reply datagram.
///
/// Retried handshakes can land on a data socket after the stream is up;
/// such datagrams are dropped without touching any counter.
pub fn is_handshake_datagram(packet: &[u8]) -> bool {
    if packet.len() != 4 {
        return false;
    }
    let value = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
    value == UDP_CONNECT_MSG || value == UDP_CONNECT_REPLY
}

/// Seconds since the epoch for `t`, as used for transit computation.
pub fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_32bit() {
        let mut buf = [0u8; 12];
        let sent = UNIX_EPOCH + Duration::new(0x0102_0304, 5_000);
        write_header(&mut buf, 0x0A0B_0C0D, sent, false);
        assert_eq!(&buf[0..4], &[1, 2, 3, 4]);
        assert_eq!(&buf[4..8], &5u32.to_be_bytes());
        assert_eq!(&buf[8..12], &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_header_64bit_counter() {
        let mut buf = [0u8; 64];
        let seq = (1u64 << 40) + 7;
        write_header(&mut buf, seq, SystemTime::now(), true);
        assert_eq!(parse_header(&buf, true).unwrap().sequence, seq);
        // A 32-bit reader sees only the high half.
        assert_ne!(parse_header(&buf, false).unwrap().sequence, seq);
    }

    #[test]
    fn test_short_packet() {
        assert!(parse_header(&[0u8; 11], false).is_none());
        assert!(parse_header(&[0u8; 15], true).is_none());
    }

    #[test]
    fn test_handshake_detection() {
        assert!(is_handshake_datagram(&UDP_CONNECT_MSG.to_be_bytes()));
        assert!(is_handshake_datagram(&UDP_CONNECT_REPLY.to_be_bytes()));
        assert!(!is_handshake_datagram(&[0u8; 4]));
        let mut data = vec![0u8; 12];
        data[..4].copy_from_slice(&UDP_CONNECT_MSG.to_be_bytes());
        assert!(!is_handshake_datagram(&data));
    }

    #[test]
    fn test_sent_secs() {
        let header = UdpPacketHeader {
            sec: 10,
            usec: 250_000,
            sequence: 1,
        };
        assert!((header.sent_secs() - 10.25).abs() < 1e-9);
    }
}
