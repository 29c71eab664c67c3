use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rsperf::{Client, Config, Protocol, Server};
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rsperf")]
#[command(about = "Network throughput measurement, compatible with the iperf3 protocol", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options both roles understand.
#[derive(Args)]
struct Common {
    /// Port to listen on or connect to
    #[arg(short, long, default_value = "5201", env = "IPERF_PORT")]
    port: u16,

    /// Bind to a specific local address
    #[arg(short = 'B', long)]
    bind: Option<IpAddr>,

    /// Output in JSON format
    #[arg(short = 'J', long, env = "IPERF_JSON")]
    json: bool,

    /// Seconds between periodic reports, 0 to disable
    #[arg(short, long, default_value = "1", env = "IPERF_INTERVAL")]
    interval: f64,

    /// Seconds without data before a running test is aborted
    #[arg(long, default_value = "120")]
    rcv_timeout: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        #[command(flatten)]
        common: Common,

        /// Handle one client, then exit
        #[arg(short = '1', long)]
        one_off: bool,

        /// Restart the listener when no client arrives for this many seconds
        #[arg(long)]
        idle_timeout: Option<u64>,

        /// Abort tests whose total rate exceeds this bitrate (K/M/G suffixes)
        #[arg(long, value_parser = parse_size)]
        server_bitrate_limit: Option<u64>,

        /// Averaging window for the bitrate limit, in seconds
        #[arg(long, default_value = "5")]
        bitrate_limit_interval: u64,

        /// Only accept clients presenting this token
        #[arg(long, env = "IPERF_AUTHTOKEN")]
        authtoken: Option<String>,
    },

    /// Run in client mode
    Client {
        /// Server address to connect to
        server: String,

        #[command(flatten)]
        common: Common,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,

        /// Test duration in seconds
        #[arg(short = 't', long, default_value = "10", conflicts_with_all = ["bytes", "blocks"])]
        time: u64,

        /// Number of bytes to transmit (K/M/G suffixes)
        #[arg(short = 'n', long, value_parser = parse_size, conflicts_with = "blocks")]
        bytes: Option<u64>,

        /// Number of blocks to transmit (K/M/G suffixes)
        #[arg(short = 'k', long, value_parser = parse_size)]
        blocks: Option<u64>,

        /// Target bitrate in bits/sec (K/M/G suffixes), 0 for unlimited
        #[arg(short, long, value_parser = parse_size)]
        bandwidth: Option<u64>,

        /// Packets sent per pacing tick
        #[arg(long, default_value = "0")]
        burst: u32,

        /// Pacing timer in microseconds
        #[arg(long, default_value = "1000")]
        pacing_timer: u64,

        /// Kernel fair-queue pacing rate in bits/sec (K/M/G suffixes)
        #[arg(long, value_parser = parse_size)]
        fq_rate: Option<u64>,

        /// Block length in bytes (K/M suffixes)
        #[arg(short = 'l', long, value_parser = parse_size)]
        length: Option<u64>,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value = "1")]
        parallel: usize,

        /// Run in reverse mode (server sends, client receives)
        #[arg(short = 'R', long, conflicts_with = "bidir")]
        reverse: bool,

        /// Send and receive at the same time
        #[arg(long)]
        bidir: bool,

        /// Seconds to omit from the start of the results
        #[arg(short = 'O', long, default_value = "0")]
        omit: u64,

        /// Socket buffer size (K/M suffixes)
        #[arg(short, long, value_parser = parse_size, env = "TCP_WINDOW_SIZE")]
        window: Option<u64>,

        /// TCP maximum segment size
        #[arg(short = 'M', long)]
        mss: Option<u32>,

        /// Disable Nagle's algorithm
        #[arg(short = 'N', long)]
        no_delay: bool,

        /// IP type of service
        #[arg(short = 'S', long)]
        tos: Option<u8>,

        /// TCP congestion control algorithm
        #[arg(short = 'C', long)]
        congestion: Option<String>,

        /// Prefix every output line with this title
        #[arg(short = 'T', long)]
        title: Option<String>,

        /// Extra data carried in the JSON output
        #[arg(long)]
        extra_data: Option<String>,

        /// Include the server's results in the output
        #[arg(long)]
        get_server_output: bool,

        /// First local port for the data streams
        #[arg(long)]
        cport: Option<u16>,

        /// Control connection timeout in milliseconds
        #[arg(long)]
        connect_timeout: Option<u64>,

        /// Use 64-bit UDP packet counters
        #[arg(long)]
        udp_counters_64bit: bool,

        /// Fill payloads with a repeating pattern
        #[arg(long)]
        repeating_payload: bool,

        /// Set the IPv4 don't-fragment flag on UDP
        #[arg(long)]
        dont_fragment: bool,

        /// Token presented to servers that require one
        #[arg(long, env = "IPERF_AUTHTOKEN")]
        authtoken: Option<String>,
    },
}

/// Parses a count with an optional K, M or G suffix (powers of 1024 for
/// sizes, as iperf does).
fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('k' | 'K') => (&value[..value.len() - 1], 1024.0),
        Some('m' | 'M') => (&value[..value.len() - 1], 1024.0 * 1024.0),
        Some('g' | 'G') => (&value[..value.len() - 1], 1024.0 * 1024.0 * 1024.0),
        _ => (value, 1.0),
    };
    let number: f64 = digits
        .parse()
        .map_err(|_| format!("invalid number: {}", value))?;
    if number < 0.0 || !number.is_finite() {
        return Err(format!("invalid number: {}", value));
    }
    Ok((number * multiplier) as u64)
}

fn apply_common(mut config: Config, common: &Common) -> Config {
    if let Some(bind) = common.bind {
        config = config.with_bind_addr(bind);
    }
    config
        .with_json(common.json)
        .with_interval(Duration::from_secs_f64(common.interval.max(0.0)))
        .with_rcv_timeout(Duration::from_secs_f64(common.rcv_timeout.max(0.0)))
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, shutting down");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            common,
            one_off,
            idle_timeout,
            server_bitrate_limit,
            bitrate_limit_interval,
            authtoken,
        } => {
            let mut config = apply_common(Config::server(common.port), &common).with_one_off(one_off);
            if let Some(secs) = idle_timeout {
                config = config.with_idle_timeout(Duration::from_secs(secs));
            }
            if let Some(limit) = server_bitrate_limit {
                config = config.with_bitrate_limit(limit, Duration::from_secs(bitrate_limit_interval));
            }

            let mut server = Server::bind(config)
                .await
                .context("failed to start the server")?;
            if let Some(expected) = authtoken {
                server = server.with_authorizer(move |token: Option<&str>| token == Some(expected.as_str()));
            }
            cancel_on_interrupt(server.cancellation_token().clone());
            server.run().await?;
        }

        Commands::Client {
            server,
            common,
            udp,
            time,
            bytes,
            blocks,
            bandwidth,
            burst,
            pacing_timer,
            fq_rate,
            length,
            parallel,
            reverse,
            bidir,
            omit,
            window,
            mss,
            no_delay,
            tos,
            congestion,
            title,
            extra_data,
            get_server_output,
            cport,
            connect_timeout,
            udp_counters_64bit,
            repeating_payload,
            dont_fragment,
            authtoken,
        } => {
            let protocol = if udp { Protocol::Udp } else { Protocol::Tcp };

            let mut config = apply_common(Config::client(server, common.port), &common)
                .with_protocol(protocol)
                .with_duration(Duration::from_secs(time))
                .with_parallel(parallel)
                .with_reverse(reverse)
                .with_bidirectional(bidir)
                .with_omit(Duration::from_secs(omit))
                .with_burst(burst)
                .with_pacing_timer(Duration::from_micros(pacing_timer))
                .with_no_delay(no_delay)
                .with_get_server_output(get_server_output)
                .with_udp_counters_64bit(udp_counters_64bit)
                .with_repeating_payload(repeating_payload);
            config.dont_fragment = dont_fragment;

            if let Some(n) = bytes {
                config = config.with_bytes(n);
            }
            if let Some(n) = blocks {
                config = config.with_blocks(n);
            }
            if let Some(bw) = bandwidth {
                config = config.with_bandwidth(bw);
            }
            if let Some(rate) = fq_rate {
                config = config.with_fq_rate(rate);
            }
            if let Some(len) = length {
                config = config.with_block_size(usize::try_from(len).context("block length too large")?);
            }
            if let Some(w) = window {
                config = config.with_window(u32::try_from(w).context("window size too large")?);
            }
            if let Some(mss) = mss {
                config = config.with_mss(mss);
            }
            if let Some(tos) = tos {
                config = config.with_tos(tos);
            }
            if let Some(algorithm) = congestion {
                config = config.with_congestion(algorithm);
            }
            if let Some(title) = title {
                config = config.with_title(title);
            }
            if let Some(extra) = extra_data {
                config = config.with_extra_data(extra);
            }
            if let Some(port) = cport {
                config = config.with_bind_port(port);
            }
            if let Some(ms) = connect_timeout {
                config = config.with_connect_timeout(Duration::from_millis(ms));
            }
            if let Some(token) = authtoken {
                config = config.with_authtoken(token);
            }

            let client = Client::new(config)?;
            cancel_on_interrupt(client.cancellation_token().clone());
            client.run().await?;
        }
    }

    Ok(())
}
