//! Control-channel wire format.
//!
//! Three kinds of data share the control socket:
//!
//! - **State bytes**: one signed byte, no framing. `IPERF_DONE` and
//!   `CLIENT_TERMINATE` are followed by three zero bytes.
//! - **JSON frames**: a 4-byte big-endian length followed by UTF-8 JSON,
//!   used for the parameter and result exchanges.
//! - **Raw fields**: the 36-byte session cookie, and the two big-endian
//!   `i32` values that follow a `SERVER_ERROR` state byte.

use crate::config::{Config, EndCondition, Protocol, Settings, TestMode};
use crate::error::{codes, Error, Result};
use crate::state::TestState;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Length of the session cookie on the wire.
pub const COOKIE_SIZE: usize = 36;

const COOKIE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Largest JSON frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Generates a random session cookie.
///
/// # Examples
///
/// ```
/// use rsperf::protocol::{generate_cookie, COOKIE_SIZE};
///
/// let cookie = generate_cookie();
/// assert_eq!(cookie.len(), COOKIE_SIZE);
/// ```
pub fn generate_cookie() -> String {
    let mut rng = rand::thread_rng();
    (0..COOKIE_SIZE)
        .map(|_| COOKIE_ALPHABET[rng.gen_range(0..COOKIE_ALPHABET.len())] as char)
        .collect()
}

/// Writes the cookie as exactly [`COOKIE_SIZE`] bytes.
pub async fn write_cookie<W: AsyncWrite + Unpin>(writer: &mut W, cookie: &str) -> Result<()> {
    let bytes = cookie.as_bytes();
    if bytes.len() != COOKIE_SIZE {
        return Err(Error::Protocol(format!(
            "cookie must be {} bytes, got {}",
            COOKIE_SIZE,
            bytes.len()
        )));
    }
    writer.write_all(bytes).await?;
    Ok(())
}

/// Reads exactly [`COOKIE_SIZE`] bytes.
pub async fn read_cookie<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut buf = [0u8; COOKIE_SIZE];
    reader.read_exact(&mut buf).await.map_err(eof_is_peer_closed)?;
    String::from_utf8(buf.to_vec())
        .map_err(|_| Error::Protocol("cookie is not valid UTF-8".to_string()))
}

/// Encodes a state byte, padding terminal states to four bytes.
pub fn encode_state(state: TestState) -> Vec<u8> {
    let mut out = vec![state.to_wire() as u8];
    if state.needs_padding() {
        out.extend_from_slice(&[0u8; 3]);
    }
    out
}

pub async fn write_state<W: AsyncWrite + Unpin>(writer: &mut W, state: TestState) -> Result<()> {
    writer.write_all(&encode_state(state)).await?;
    writer.flush().await?;
    Ok(())
}

/// Blocks until one state byte arrives.
pub async fn read_state<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TestState> {
    let byte = reader.read_i8().await.map_err(eof_is_peer_closed)?;
    TestState::from_wire(byte)
}

/// Reads a state byte if one is already buffered.
///
/// Returns `Ok(None)` when the socket had no data after all, so the caller
/// can go back to waiting for readiness.
pub fn try_read_state(stream: &TcpStream) -> Result<Option<TestState>> {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Ok(0) => Err(Error::PeerClosed),
        Ok(_) => TestState::from_wire(buf[0] as i8).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Serializes a value to a length-prefixed JSON frame.
///
/// - First 4 bytes: JSON length as big-endian u32
/// - Remaining bytes: UTF-8 encoded JSON
///
/// # Examples
///
/// ```
/// use rsperf::protocol::serialize_message;
///
/// let bytes = serialize_message(&serde_json::json!({"tcp": true})).unwrap();
/// assert_eq!(&bytes[..4], &[0, 0, 0, 12]);
/// ```
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len())
        .map_err(|_| Error::Protocol("JSON frame too large".to_string()))?;
    let mut result = Vec::with_capacity(4 + json.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&json);
    Ok(result)
}

/// Deserializes one length-prefixed JSON frame from an async reader.
///
/// # Errors
///
/// Returns [`Error::PeerClosed`] if the stream ends mid-frame,
/// [`Error::Protocol`] for an oversized length and [`Error::Json`] for a
/// malformed document.
pub async fn deserialize_message<T, R>(reader: &mut R) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(eof_is_peer_closed)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "JSON frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_LEN
        )));
    }

    let mut json_bytes = vec![0u8; len];
    reader
        .read_exact(&mut json_bytes)
        .await
        .map_err(eof_is_peer_closed)?;

    Ok(serde_json::from_slice(&json_bytes)?)
}

pub async fn write_message<T, W>(writer: &mut W, msg: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&serialize_message(msg)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Sends `SERVER_ERROR` followed by the error code and errno.
pub async fn write_server_error<W: AsyncWrite + Unpin>(writer: &mut W, err: &Error) -> Result<()> {
    let mut frame = encode_state(TestState::ServerError);
    frame.extend_from_slice(&err.code().to_be_bytes());
    frame.extend_from_slice(&err.os_errno().to_be_bytes());
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the two values following a `SERVER_ERROR` byte.
pub async fn read_server_error<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Error> {
    let code = reader.read_i32().await.map_err(eof_is_peer_closed)?;
    let errno = reader.read_i32().await.map_err(eof_is_peer_closed)?;
    Ok(Error::from_wire(code, errno))
}

fn eof_is_peer_closed(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::PeerClosed
    } else {
        Error::Io(e)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero<T: Default + PartialEq>(v: &T) -> bool {
    *v == T::default()
}

/// Flags iperf3 peers encode as 0/1 numbers rather than JSON booleans.
mod int_flag {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Flag {
            Bool(bool),
            Int(i64),
        }
        Ok(match Flag::deserialize(d)? {
            Flag::Bool(b) => b,
            Flag::Int(n) => n != 0,
        })
    }
}

/// Parameter document sent by the client after `PARAM_EXCHANGE`.
///
/// Only non-default optional fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestParams {
    #[serde(default, skip_serializing_if = "is_false")]
    pub tcp: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub udp: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub sctp: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub vsock: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub quic: bool,
    #[serde(default)]
    pub omit: u64,
    #[serde(default)]
    pub time: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub num: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub blockcount: u64,
    #[serde(rename = "MSS", default, skip_serializing_if = "is_zero")]
    pub mss: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub nodelay: bool,
    #[serde(default)]
    pub parallel: usize,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reverse: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub bidirectional: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub window: u32,
    #[serde(default)]
    pub len: usize,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bandwidth: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fqrate: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pacing_timer: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub burst: u32,
    #[serde(rename = "TOS", default, skip_serializing_if = "is_zero")]
    pub tos: u8,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub flowlabel: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion: Option<String>,
    #[serde(default, with = "int_flag", skip_serializing_if = "is_false")]
    pub get_server_output: bool,
    #[serde(default, with = "int_flag", skip_serializing_if = "is_false")]
    pub udp_counters_64bit: bool,
    #[serde(default, with = "int_flag", skip_serializing_if = "is_false")]
    pub repeating_payload: bool,
    #[serde(default, with = "int_flag", skip_serializing_if = "is_false")]
    pub dont_fragment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authtoken: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

/// What the server learns from a parameter document.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub protocol: Protocol,
    /// Mode as the client sees it
    pub mode: TestMode,
    pub parallel: usize,
    pub settings: Settings,
    pub get_server_output: bool,
    pub title: Option<String>,
    pub extra_data: Option<String>,
    pub authtoken: Option<String>,
}

impl TestParams {
    /// Builds the document a client sends for `config`.
    pub fn from_config(config: &Config) -> Self {
        let settings = config.settings();
        let (num, blockcount, time) = match settings.end {
            EndCondition::Duration(d) => (0, 0, d.as_secs()),
            EndCondition::Bytes(n) => (n, 0, 0),
            EndCondition::Blocks(n) => (0, n, 0),
        };
        Self {
            tcp: config.protocol == Protocol::Tcp,
            udp: config.protocol == Protocol::Udp,
            sctp: config.protocol == Protocol::Sctp,
            vsock: config.protocol == Protocol::Vsock,
            quic: config.protocol == Protocol::Quic,
            omit: settings.omit.as_secs(),
            time,
            num,
            blockcount,
            mss: settings.mss,
            nodelay: settings.no_delay,
            parallel: config.parallel,
            reverse: config.mode.is_reverse(),
            bidirectional: config.mode.is_bidirectional(),
            window: settings.socket_bufsize,
            len: settings.block_size,
            bandwidth: settings.rate,
            fqrate: settings.fq_rate,
            pacing_timer: settings.pacing_timer.as_micros() as u64,
            burst: settings.burst,
            tos: settings.tos,
            flowlabel: settings.flowlabel,
            title: config.title.clone(),
            extra_data: config.extra_data.clone(),
            congestion: settings.congestion.clone(),
            get_server_output: config.get_server_output,
            udp_counters_64bit: settings.udp_counters_64bit,
            repeating_payload: settings.repeating_payload,
            dont_fragment: settings.dont_fragment,
            authtoken: config.authtoken.clone(),
            client_version: Some(format!("rsperf {}", crate::VERSION)),
        }
    }

    pub fn protocol(&self) -> Result<Protocol> {
        let selected: Vec<Protocol> = [
            (self.tcp, Protocol::Tcp),
            (self.udp, Protocol::Udp),
            (self.sctp, Protocol::Sctp),
            (self.vsock, Protocol::Vsock),
            (self.quic, Protocol::Quic),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, p)| *p)
        .collect();
        match selected.as_slice() {
            [p] => Ok(*p),
            [] => Err(Error::Protocol("parameters name no protocol".to_string())),
            _ => Err(Error::Protocol("parameters name more than one protocol".to_string())),
        }
    }

    /// Applies the document on top of the server's own settings.
    ///
    /// Server-side policy (bitrate limit, receive timeout) stays as in
    /// `base`; everything the client controls is taken from the document.
    pub fn negotiate(&self, base: &Settings) -> Result<Negotiated> {
        let protocol = self.protocol()?;
        let end = match (self.num, self.blockcount) {
            (0, 0) => EndCondition::Duration(Duration::from_secs(self.time)),
            (n, 0) => EndCondition::Bytes(n),
            (0, n) => EndCondition::Blocks(n),
            _ => {
                return Err(Error::Config(
                    crate::error::describe_code(codes::END_CONDITIONS).to_string(),
                ))
            }
        };
        if self.parallel == 0 || self.parallel > crate::config::MAX_STREAMS {
            return Err(Error::Config(format!(
                "invalid number of parallel streams: {}",
                self.parallel
            )));
        }

        let block_size = if self.len == 0 {
            protocol.default_block_size()
        } else {
            self.len
        };
        let pacing_timer = if self.pacing_timer == 0 {
            base.pacing_timer
        } else {
            Duration::from_micros(self.pacing_timer)
        };

        let settings = Settings {
            block_size,
            rate: self.bandwidth,
            burst: self.burst,
            pacing_timer,
            fq_rate: self.fqrate,
            socket_bufsize: self.window,
            mss: self.mss,
            tos: self.tos,
            flowlabel: self.flowlabel,
            end,
            omit: Duration::from_secs(self.omit),
            no_delay: self.nodelay,
            congestion: self.congestion.clone(),
            udp_counters_64bit: self.udp_counters_64bit,
            repeating_payload: self.repeating_payload,
            dont_fragment: self.dont_fragment,
            ..base.clone()
        };
        crate::config::validate_settings(protocol, &settings)?;

        Ok(Negotiated {
            protocol,
            mode: TestMode::from_flags(self.reverse, self.bidirectional),
            parallel: self.parallel,
            settings,
            get_server_output: self.get_server_output,
            title: self.title.clone(),
            extra_data: self.extra_data.clone(),
            authtoken: self.authtoken.clone(),
        })
    }
}

/// Per-stream record in the result exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub id: u32,
    pub bytes: u64,
    /// -1 when the sender could not read retransmits
    pub retransmits: i64,
    pub jitter: f64,
    pub errors: i64,
    #[serde(default)]
    pub omitted_errors: i64,
    pub packets: u64,
    #[serde(default)]
    pub omitted_packets: u64,
    pub start_time: f64,
    pub end_time: f64,
}

/// Result document exchanged after `EXCHANGE_RESULTS`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub cpu_util_total: f64,
    pub cpu_util_user: f64,
    pub cpu_util_system: f64,
    pub sender_has_retransmits: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_used: Option<String>,
    pub streams: Vec<StreamRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_output_json: Option<serde_json::Value>,
}
