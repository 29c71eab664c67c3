use std::time::Duration;
use thiserror::Error;

/// Wire codes carried in a `SERVER_ERROR` frame.
///
/// Values follow the iperf3 numbering so a foreign peer prints a sensible
/// message when it receives one of ours.
pub mod codes {
    pub const NONE: i32 = 0;
    pub const SERVER_CLIENT: i32 = 1;
    pub const NO_ROLE: i32 = 2;
    pub const SERVER_ONLY: i32 = 3;
    pub const CLIENT_ONLY: i32 = 4;
    pub const DURATION: i32 = 5;
    pub const NUM_STREAMS: i32 = 6;
    pub const BLOCK_SIZE: i32 = 7;
    pub const BUF_SIZE: i32 = 8;
    pub const INTERVAL: i32 = 9;
    pub const MSS: i32 = 10;
    pub const OMIT: i32 = 12;
    pub const UNIMPLEMENTED: i32 = 13;
    pub const BURST: i32 = 15;
    pub const END_CONDITIONS: i32 = 16;
    pub const TOTAL_RATE: i32 = 25;
    pub const BAD_FORMAT: i32 = 27;
    pub const NEW_TEST: i32 = 100;
    pub const INIT_TEST: i32 = 101;
    pub const LISTEN: i32 = 102;
    pub const CONNECT: i32 = 103;
    pub const ACCEPT: i32 = 104;
    pub const SEND_COOKIE: i32 = 105;
    pub const RECV_COOKIE: i32 = 106;
    pub const CTRL_WRITE: i32 = 107;
    pub const CTRL_READ: i32 = 108;
    pub const CTRL_CLOSE: i32 = 109;
    pub const MESSAGE: i32 = 110;
    pub const SEND_MESSAGE: i32 = 111;
    pub const RECV_MESSAGE: i32 = 112;
    pub const SEND_PARAMS: i32 = 113;
    pub const RECV_PARAMS: i32 = 114;
    pub const PACKAGE_RESULTS: i32 = 115;
    pub const SEND_RESULTS: i32 = 116;
    pub const RECV_RESULTS: i32 = 117;
    pub const SELECT: i32 = 118;
    pub const CLIENT_TERM: i32 = 119;
    pub const SERVER_TERM: i32 = 120;
    pub const ACCESS_DENIED: i32 = 121;
    pub const SET_NODELAY: i32 = 122;
    pub const SET_MSS: i32 = 123;
    pub const SET_BUF: i32 = 124;
    pub const SET_TOS: i32 = 125;
    pub const CREATE_STREAM: i32 = 200;
    pub const INIT_STREAM: i32 = 201;
    pub const STREAM_LISTEN: i32 = 202;
    pub const STREAM_CONNECT: i32 = 203;
    pub const STREAM_ACCEPT: i32 = 204;
    pub const STREAM_WRITE: i32 = 205;
    pub const STREAM_READ: i32 = 206;
    pub const STREAM_CLOSE: i32 = 207;
    pub const STREAM_ID: i32 = 208;
    pub const NEW_TIMER: i32 = 300;
    pub const SET_PACING: i32 = 303;
    pub const AUTH_TEST: i32 = 305;
    pub const NO_MSG: i32 = 307;
    pub const THREAD: i32 = 310;
}

/// Errors raised anywhere in a test run.
///
/// Each variant maps onto one kind of failure: configuration problems are
/// found before any socket is opened, protocol and connection errors come
/// from the control channel, and stream errors from the data plane.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Role conflict: {0}")]
    RoleConflict(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Access denied: the server is busy or rejected the session cookie")]
    AccessDenied,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Control connection closed unexpectedly by peer")]
    PeerClosed,

    #[error("Unknown control state {0}")]
    UnknownState(i8),

    #[error("Authorization failed: {0}")]
    Auth(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Stream {id}: {source}")]
    Stream {
        id: u32,
        soft: bool,
        #[source]
        source: std::io::Error,
    },

    #[error("Idle timeout: no data for {0:?}")]
    IdleTimeout(Duration),

    #[error("Total bitrate {actual} bit/s exceeds the server limit of {limit} bit/s")]
    TotalRateExceeded { actual: u64, limit: u64 },

    #[error("Server error: {} (os error {errno})", code_text(.code))]
    ServerError { code: i32, errno: i32 },

    #[error("The server has terminated")]
    ServerTerminated,

    #[error("The client has terminated")]
    ClientTerminated,

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Test interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps a data-path I/O failure, classifying it as soft when the
    /// operation merely made no progress.
    pub fn stream(id: u32, source: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let soft = matches!(
            source.kind(),
            WouldBlock | Interrupted | TimedOut | ConnectionRefused
        ) || is_no_buffer_space(&source);
        Error::Stream { id, soft, source }
    }

    /// True for stream errors that only stop the one stream.
    pub fn is_soft(&self) -> bool {
        matches!(self, Error::Stream { soft: true, .. })
    }

    /// Numeric code sent to the peer in a `SERVER_ERROR` frame.
    pub fn code(&self) -> i32 {
        match self {
            Error::Io(_) => codes::CTRL_READ,
            Error::Json(_) => codes::RECV_PARAMS,
            Error::Config(_) => codes::BAD_FORMAT,
            Error::RoleConflict(_) => codes::SERVER_CLIENT,
            Error::Connection(_) => codes::STREAM_ACCEPT,
            Error::AccessDenied => codes::ACCESS_DENIED,
            Error::Protocol(_) => codes::MESSAGE,
            Error::PeerClosed => codes::CTRL_CLOSE,
            Error::UnknownState(_) => codes::MESSAGE,
            Error::Auth(_) => codes::AUTH_TEST,
            Error::Resource(_) => codes::THREAD,
            Error::Stream { source, .. } if source.kind() == std::io::ErrorKind::UnexpectedEof => {
                codes::STREAM_READ
            }
            Error::Stream { .. } => codes::STREAM_WRITE,
            Error::IdleTimeout(_) => codes::NO_MSG,
            Error::TotalRateExceeded { .. } => codes::TOTAL_RATE,
            Error::ServerError { code, .. } => *code,
            Error::ServerTerminated => codes::SERVER_TERM,
            Error::ClientTerminated => codes::CLIENT_TERM,
            Error::UnsupportedProtocol(_) => codes::UNIMPLEMENTED,
            Error::Interrupted => codes::SERVER_TERM,
        }
    }

    /// OS errno attached to the error, or 0.
    pub fn os_errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(0),
            Error::Stream { source, .. } => source.raw_os_error().unwrap_or(0),
            Error::ServerError { errno, .. } => *errno,
            _ => 0,
        }
    }

    /// Rebuilds the error a server reported in a `SERVER_ERROR` frame.
    pub fn from_wire(code: i32, errno: i32) -> Self {
        match code {
            codes::ACCESS_DENIED => Error::AccessDenied,
            _ => Error::ServerError { code, errno },
        }
    }
}

#[cfg(unix)]
fn is_no_buffer_space(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOBUFS)
}

#[cfg(not(unix))]
fn is_no_buffer_space(_e: &std::io::Error) -> bool {
    false
}

fn code_text(code: &i32) -> &'static str {
    describe_code(*code)
}

/// Human-readable text for a wire error code.
pub fn describe_code(code: i32) -> &'static str {
    match code {
        codes::NONE => "no error",
        codes::SERVER_CLIENT => "cannot be both server and client",
        codes::NO_ROLE => "must either be a client or server",
        codes::SERVER_ONLY => "some option you are trying to set is server only",
        codes::CLIENT_ONLY => "some option you are trying to set is client only",
        codes::DURATION => "test duration too long",
        codes::NUM_STREAMS => "number of parallel streams too large",
        codes::BLOCK_SIZE => "block size invalid",
        codes::BUF_SIZE => "socket buffer size too large",
        codes::INTERVAL => "invalid report interval",
        codes::MSS => "TCP MSS too large",
        codes::OMIT => "bogus value for omit",
        codes::UNIMPLEMENTED => "an option you are trying to set is not implemented yet",
        codes::BURST => "invalid burst count",
        codes::END_CONDITIONS => "only one test end condition (-t, -n, -k) may be specified",
        codes::TOTAL_RATE => "total required bandwidth is larger than server limit",
        codes::BAD_FORMAT => "bad format specifier",
        codes::NEW_TEST => "unable to create a new test",
        codes::INIT_TEST => "test initialization failed",
        codes::LISTEN => "unable to start listener for connections",
        codes::CONNECT => "unable to connect to server",
        codes::ACCEPT => "unable to accept connection from client",
        codes::SEND_COOKIE => "unable to send cookie to server",
        codes::RECV_COOKIE => "unable to receive cookie at server",
        codes::CTRL_WRITE => "unable to write to the control socket",
        codes::CTRL_READ => "unable to read from the control socket",
        codes::CTRL_CLOSE => "control socket has closed unexpectedly",
        codes::MESSAGE => "received an unknown control message",
        codes::SEND_MESSAGE => "unable to send control message",
        codes::RECV_MESSAGE => "unable to receive control message",
        codes::SEND_PARAMS => "unable to send parameters to server",
        codes::RECV_PARAMS => "unable to receive parameters from client",
        codes::PACKAGE_RESULTS => "unable to package results",
        codes::SEND_RESULTS => "unable to send results",
        codes::RECV_RESULTS => "unable to receive results",
        codes::SELECT => "select failed",
        codes::CLIENT_TERM => "the client has terminated",
        codes::SERVER_TERM => "the server has terminated",
        codes::ACCESS_DENIED => "the server is busy running a test. try again later",
        codes::SET_NODELAY => "unable to set TCP/SCTP NODELAY",
        codes::SET_MSS => "unable to set TCP/SCTP MSS",
        codes::SET_BUF => "unable to set socket buffer size",
        codes::SET_TOS => "unable to set IP TOS",
        codes::CREATE_STREAM => "unable to create a new stream",
        codes::INIT_STREAM => "unable to initialize stream",
        codes::STREAM_LISTEN => "unable to start stream listener",
        codes::STREAM_CONNECT => "unable to connect stream",
        codes::STREAM_ACCEPT => "unable to accept stream connection",
        codes::STREAM_WRITE => "unable to write to stream socket",
        codes::STREAM_READ => "unable to read from stream socket",
        codes::STREAM_CLOSE => "stream socket has closed unexpectedly",
        codes::STREAM_ID => "stream has an invalid id",
        codes::NEW_TIMER => "unable to create new timer",
        codes::SET_PACING => "unable to set socket pacing",
        codes::AUTH_TEST => "test authorization failed",
        codes::NO_MSG => "idle timeout for receiving data",
        codes::THREAD => "unable to create or join a stream worker",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_keeps_code_and_errno() {
        let err = Error::from_wire(codes::STREAM_LISTEN, 98);
        assert_eq!(err.code(), codes::STREAM_LISTEN);
        assert_eq!(err.os_errno(), 98);
        assert!(err.to_string().contains("unable to start stream listener"));
    }

    #[test]
    fn test_access_denied_from_wire() {
        assert!(matches!(
            Error::from_wire(codes::ACCESS_DENIED, 0),
            Error::AccessDenied
        ));
    }

    #[test]
    fn test_stream_error_classification() {
        let soft = Error::stream(1, std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(soft.is_soft());

        let hard = Error::stream(1, std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert!(!hard.is_soft());
        assert_eq!(hard.code(), codes::STREAM_WRITE);
    }

    #[test]
    fn test_unknown_code_description() {
        assert_eq!(describe_code(-42), "unknown error");
    }
}
