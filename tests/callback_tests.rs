use rsperf::{Client, Config, OutputSink, ProgressCallback, ProgressEvent, Protocol, Server};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

/// Custom callback implementation using a struct
#[derive(Clone, Default)]
struct TestCallback {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl TestCallback {
    fn get_events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressCallback for TestCallback {
    fn on_progress(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn one_off_server(callback: Option<TestCallback>) -> (SocketAddr, tokio::task::JoinHandle<rsperf::Result<()>>) {
    let mut server = Server::bind(
        Config::server(0)
            .with_bind_addr("127.0.0.1".parse().unwrap())
            .with_one_off(true),
    )
    .await
    .unwrap()
    .with_output(OutputSink::discard());
    if let Some(callback) = callback {
        server = server.with_callback(callback);
    }
    let addr = server.local_addr();
    (addr, tokio::spawn(async move { server.run().await }))
}

#[tokio::test]
async fn test_custom_callback_struct() {
    let (addr, server) = one_off_server(None).await;
    let callback = TestCallback::default();

    let client = Client::new(
        Config::client("127.0.0.1".to_string(), addr.port()).with_bytes(500_000),
    )
    .unwrap()
    .with_output(OutputSink::discard())
    .with_callback(callback.clone());

    timeout(Duration::from_secs(20), client.run())
        .await
        .unwrap()
        .unwrap();
    server.await.unwrap().unwrap();

    let events = callback.get_events();
    assert!(matches!(events.first(), Some(ProgressEvent::Connected { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::StreamConnected { id: 1, sender: true })));
    assert!(events.iter().any(|e| matches!(e, ProgressEvent::TestStarted)));
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Error(_))));
    match events.last() {
        Some(ProgressEvent::TestCompleted { total_bytes, .. }) => assert!(*total_bytes > 0),
        other => panic!("last event should be TestCompleted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_interval_updates_with_closure() {
    let (addr, server) = one_off_server(None).await;
    let intervals = Arc::new(Mutex::new(Vec::new()));
    let seen = intervals.clone();

    let client = Client::new(
        Config::client("127.0.0.1".to_string(), addr.port())
            .with_duration(Duration::from_secs(2))
            .with_interval(Duration::from_millis(500)),
    )
    .unwrap()
    .with_output(OutputSink::discard())
    .with_callback(move |event: ProgressEvent| {
        if let ProgressEvent::IntervalUpdate {
            interval_start,
            interval_end,
            bytes,
            ..
        } = event
        {
            seen.lock().unwrap().push((interval_start, interval_end, bytes));
        }
    });

    timeout(Duration::from_secs(20), client.run())
        .await
        .unwrap()
        .unwrap();
    server.await.unwrap().unwrap();

    let intervals = intervals.lock().unwrap();
    assert!(intervals.len() >= 3, "got {} intervals", intervals.len());
    for pair in intervals.windows(2) {
        assert!(pair[0].1 <= pair[1].1);
    }
    assert!(intervals.iter().any(|(_, _, bytes)| *bytes > 0));
}

#[tokio::test]
async fn test_omitted_intervals_are_flagged() {
    let (addr, server) = one_off_server(None).await;
    let flags = Arc::new(Mutex::new(Vec::new()));
    let seen = flags.clone();

    let client = Client::new(
        Config::client("127.0.0.1".to_string(), addr.port())
            .with_duration(Duration::from_secs(1))
            .with_omit(Duration::from_secs(1))
            .with_interval(Duration::from_millis(500)),
    )
    .unwrap()
    .with_output(OutputSink::discard())
    .with_callback(move |event: ProgressEvent| {
        if let ProgressEvent::IntervalUpdate { omitted, .. } = event {
            seen.lock().unwrap().push(omitted);
        }
    });

    timeout(Duration::from_secs(20), client.run())
        .await
        .unwrap()
        .unwrap();
    server.await.unwrap().unwrap();

    let flags = flags.lock().unwrap();
    assert!(flags.first().copied().unwrap_or(false), "first interval should be omitted");
    assert!(flags.iter().any(|omitted| !omitted));
}

#[tokio::test]
async fn test_server_callback_sees_udp_test() {
    let callback = TestCallback::default();
    let (addr, server) = one_off_server(Some(callback.clone())).await;

    let client = Client::new(
        Config::client("127.0.0.1".to_string(), addr.port())
            .with_protocol(Protocol::Udp)
            .with_bandwidth(10_000_000)
            .with_bytes(100_000),
    )
    .unwrap()
    .with_output(OutputSink::discard());

    timeout(Duration::from_secs(20), client.run())
        .await
        .unwrap()
        .unwrap();
    server.await.unwrap().unwrap();

    let events = callback.get_events();
    // The server receives in a normal test.
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::StreamConnected { sender: false, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::TestCompleted { total_packets: Some(_), .. })));
}

#[tokio::test]
async fn test_error_event_on_refused_connection() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let callback = TestCallback::default();
    let client = Client::new(Config::client("127.0.0.1".to_string(), port))
        .unwrap()
        .with_output(OutputSink::discard())
        .with_callback(callback.clone());

    assert!(client.run().await.is_err());
    let events = callback.get_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], ProgressEvent::Error(_)));
}
