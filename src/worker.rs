//! Per-stream data-path tasks.
//!
//! One task runs per stream from TEST_RUNNING until the coordinator stops
//! it. A sender pushes blocks as fast as pacing allows; a receiver reads
//! until it is cancelled. Both loops await socket operations inside a
//! `select!` on the stream's cancellation token, so stopping a worker never
//! needs the socket to be closed under it.

use crate::error::{Error, Result};
use crate::pacing::{multisend_batch, Throttle};
use crate::stream::StreamShared;
use crate::test::TestShared;
use crate::transport::{DataSocket, Transport, TransportKind};
use log::{debug, trace};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// What a worker hands back when it finishes.
pub struct WorkerExit {
    pub socket: DataSocket,
    pub buffer: Vec<u8>,
    pub result: Result<()>,
}

/// Starts the worker task for `stream`.
pub fn spawn(
    stream: Arc<StreamShared>,
    transport: TransportKind,
    mut socket: DataSocket,
    mut buffer: Vec<u8>,
) -> JoinHandle<WorkerExit> {
    tokio::spawn(async move {
        let result = match stream.test() {
            Some(test) if stream.sender => {
                send_loop(&stream, &test, &transport, &mut socket, &mut buffer).await
            }
            Some(test) => recv_loop(&stream, &test, &transport, &mut socket, &mut buffer).await,
            None => Ok(()),
        };
        match &result {
            Ok(()) => debug!("Stream {} worker finished", stream.id),
            Err(e) => debug!("Stream {} worker failed: {}", stream.id, e),
        }
        WorkerExit {
            socket,
            buffer,
            result,
        }
    })
}

async fn send_loop(
    stream: &StreamShared,
    test: &TestShared,
    transport: &TransportKind,
    socket: &mut DataSocket,
    buffer: &mut [u8],
) -> Result<()> {
    let settings = test.settings();
    let throttle = Throttle::new(settings.rate, Instant::now());
    let batch = multisend_batch(settings.burst, settings.rate);
    let pacing = settings.pacing_timer;
    let cancel = stream.cancel_token().clone();
    let mut sent: u64 = 0;

    loop {
        if stream.is_done() {
            return Ok(());
        }
        if test.send_limit_reached() {
            debug!("Stream {} reached the test transfer limit", stream.id);
            test.notify_end();
            return Ok(());
        }

        if !throttle.green_light(sent, Instant::now()) {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(pacing) => continue,
            }
        }

        for _ in 0..batch {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                r = transport.send(socket, stream, test, buffer) => r,
            };
            match outcome {
                Ok(n) => sent += n as u64,
                Err(e) if e.is_soft() => {
                    trace!("Stream {} soft send error: {}", stream.id, e);
                    backoff(&cancel, pacing).await;
                    break;
                }
                Err(e) => return Err(e),
            }
            if stream.is_done() || test.send_limit_reached() {
                break;
            }
            if throttle.is_limited() && !throttle.green_light(sent, Instant::now()) {
                break;
            }
        }
    }
}

async fn recv_loop(
    stream: &StreamShared,
    test: &TestShared,
    transport: &TransportKind,
    socket: &mut DataSocket,
    buffer: &mut [u8],
) -> Result<()> {
    let pacing = test.settings().pacing_timer;
    let cancel = stream.cancel_token().clone();

    loop {
        if stream.is_done() {
            return Ok(());
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            r = transport.recv(socket, stream, test, buffer) => r,
        };
        match outcome {
            Ok(_) => {
                if test.receive_limit_reached() {
                    test.notify_end();
                }
            }
            Err(e) if e.is_soft() => {
                trace!("Stream {} soft receive error: {}", stream.id, e);
                backoff(&cancel, pacing).await;
            }
            Err(e @ Error::Stream { .. }) if stream.is_done() => {
                debug!("Stream {} closed while stopping: {}", stream.id, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

async fn backoff(cancel: &tokio_util::sync::CancellationToken, pause: std::time::Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(pause) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndCondition, Settings};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_sender_stops_at_byte_limit() {
        let settings = Settings {
            block_size: 1024,
            end: EndCondition::Bytes(10 * 1024),
            ..Settings::default()
        };
        let test = Arc::new(TestShared::new(settings));
        test.set_counting(true);
        let stream = Arc::new(StreamShared::new(1, true, &test));
        let (client, mut server) = tcp_pair().await;

        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut total = 0;
            while let Ok(n) = server.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                total += n;
            }
            total
        });

        let handle = spawn(
            stream.clone(),
            TransportKind::for_protocol(crate::Protocol::Tcp),
            DataSocket::Tcp(client),
            vec![0u8; 1024],
        );
        let exit = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(exit.result.is_ok());
        assert_eq!(test.bytes_sent(), 10 * 1024);
        assert_eq!(stream.counters.blocks_sent.load(Ordering::Relaxed), 10);
        drop(exit);
        assert_eq!(drain.await.unwrap(), 10 * 1024);
    }

    #[tokio::test]
    async fn test_receiver_is_cancelled_while_blocked() {
        let test = Arc::new(TestShared::new(Settings::default()));
        let stream = Arc::new(StreamShared::new(1, false, &test));
        let (client, _server) = tcp_pair().await;

        let handle = spawn(
            stream.clone(),
            TransportKind::for_protocol(crate::Protocol::Tcp),
            DataSocket::Tcp(client),
            vec![0u8; 1024],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        stream.signal_done();
        let exit = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(exit.result.is_ok());
        assert!(exit.socket.peer_addr().is_ok());
    }
}
