//! rsperf - network throughput measurement speaking the iperf3 control protocol
//!
//! This library runs iperf3-compatible throughput tests in client and server
//! roles. A client connects to a server, negotiates the test over a TCP
//! control connection and drives one or more TCP or UDP data streams; both
//! sides collect per-interval statistics and exchange their results at the
//! end.
//!
//! # Features
//!
//! - TCP and UDP throughput testing
//! - Normal, reverse and bidirectional modes with parallel streams
//! - Duration, byte-count and block-count end conditions
//! - Rate pacing, omit (warm-up) periods and a server-side bitrate ceiling
//! - UDP loss, jitter and out-of-order accounting
//! - Human-readable and JSON output, progress callbacks
//! - Asynchronous I/O using tokio
//!
//! # Example
//!
//! ```no_run
//! use rsperf::{Client, Config, Server};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Server::bind(Config::server(0).with_one_off(true)).await?;
//! let port = server.local_addr().port();
//! tokio::spawn(async move { server.run().await });
//!
//! let client = Client::new(Config::client("127.0.0.1".to_string(), port).with_bytes(1_000_000))?;
//! let report = client.run().await?;
//! println!("{} bytes received", report.end.sum_received.bytes);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod measurements;
pub mod pacing;
pub mod protocol;
pub mod reporter;
pub mod server;
pub mod state;
pub mod stream;
pub mod timer;
pub mod transport;
pub mod udp_packet;
mod worker;

pub use client::{Client, ProgressCallback, ProgressEvent};
pub use config::{Config, EndCondition, Protocol, Role, Settings, TestMode};
pub use error::{Error, Result};
pub use measurements::TestReport;
pub use reporter::OutputSink;
pub use server::{Authorizer, Server};
pub use state::TestState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
