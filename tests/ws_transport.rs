use std::net::TcpListener;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parkscan::channel::{
    ChannelEvent, ChannelSettings, ChannelState, SendStatus, TelemetryChannel, Transport,
    WsTransport,
};

/// Accepts one WebSocket client, completes the handshake and then never reads
/// until told to stop.
fn stalled_server() -> (String, mpsc::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let _socket = tungstenite::accept(stream).expect("handshake");
        let _ = stop_rx.recv();
    });
    (format!("ws://{}/ws/stream", addr), stop_tx, handle)
}

#[test]
fn stalled_peer_bounds_buffered_output() {
    let (endpoint, stop, server) = stalled_server();
    let mut transport = WsTransport::new(Duration::from_secs(5));
    let mut conn = transport.open(&endpoint).expect("open");

    let payload = "x".repeat(100 * 1024);
    let mut accepted = 0usize;
    let mut dropped = 0usize;
    for _ in 0..2000 {
        match conn.send_text(&payload).expect("send") {
            SendStatus::Flushed | SendStatus::Queued => accepted += 1,
            SendStatus::Dropped => {
                dropped += 1;
                assert!(!conn.is_writable());
            }
        }
    }

    // Kernel socket buffers absorb some; the rest must be dropped, not held.
    assert!(dropped > 0, "nothing dropped; {} sends accepted", accepted);
    assert!(
        accepted * payload.len() < 64 * 1024 * 1024,
        "{} sends accepted by a peer that never reads",
        accepted
    );

    drop(conn);
    let _ = stop.send(());
    server.join().expect("server thread");
}

#[test]
fn channel_connects_without_blocking_the_caller() {
    let (endpoint, stop, server) = stalled_server();
    let mut channel = TelemetryChannel::new(
        ChannelSettings::new(endpoint),
        Box::new(WsTransport::new(Duration::from_secs(5))),
    );

    let t0 = Instant::now();
    channel.connect(t0);
    let mut events = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !channel.is_connected() && Instant::now() < deadline {
        events.extend(channel.poll(Instant::now()));
        if channel.state() == ChannelState::Connecting {
            thread::sleep(Duration::from_millis(5));
        }
    }
    assert!(channel.is_connected(), "events so far: {:?}", events);
    assert!(events.contains(&ChannelEvent::Connected));

    channel.close();
    let _ = stop.send(());
    server.join().expect("server thread");
}

#[test]
fn unreachable_endpoint_reports_connect_failure_through_poll() {
    // Bind then drop to get a port with nothing listening.
    let port = TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port();
    let mut channel = TelemetryChannel::new(
        ChannelSettings::new(format!("ws://127.0.0.1:{}/ws/stream", port)),
        Box::new(WsTransport::new(Duration::from_secs(2))),
    );
    channel.connect(Instant::now());

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut events = Vec::new();
    while events.is_empty() && Instant::now() < deadline {
        events = channel.poll(Instant::now());
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(
        events.as_slice(),
        [ChannelEvent::ConnectFailed { .. }]
    ));
    assert_eq!(channel.state(), ChannelState::Retrying);
}
