//! Multi-component scenarios exercising the full `SessionManager` ->
//! `Session` -> ICE worker -> FMP multiplexer stack end to end, the way
//! RustyRTC keeps its cross-module reproductions under `tests/` instead of
//! inline `#[cfg(test)]` modules. Two peers run in-process, wired together
//! by a `MockFriendOverlay` pair for signaling and real loopback UDP sockets
//! for the data path.
#![allow(clippy::unwrap_used)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use carrier_session::channel::{ChannelId, CloseReason};
use carrier_session::error::ErrorKind;
use carrier_session::identity::mock_overlay::MockFriendOverlay;
use carrier_session::identity::user_id::UserId;
use carrier_session::log::logger::Logger;
use carrier_session::log::logger_handle::LoggerHandle;
use carrier_session::session::manager::{RequestHandler, RequestOutcome, SessionManager};
use carrier_session::stream::options::{StreamId, StreamKind, StreamOptions};
use carrier_session::stream::state::StreamState;
use carrier_session::stream::StreamCallbacks;

fn id(byte: u8) -> UserId {
    UserId::from_bytes([byte; 32])
}

fn test_logger(name: &str) -> LoggerHandle {
    Logger::start_in_dir(std::env::temp_dir(), name, 256, 32, 1).handle()
}

fn noop_handler() -> RequestHandler {
    Arc::new(|_, _, _| {})
}

/// Forwards every state transition and stream byte onto mpsc channels a test
/// can block on, so assertions don't race the ICE worker thread.
struct Observer {
    state: mpsc::Sender<StreamState>,
    data: mpsc::Sender<Vec<u8>>,
}

impl StreamCallbacks for Observer {
    fn on_state_changed(&self, _stream: StreamId, state: StreamState) {
        let _ = self.state.send(state);
    }

    fn on_stream_data(&self, _stream: StreamId, bytes: Vec<u8>) {
        let _ = self.data.send(bytes);
    }
}

fn wait_for_state(rx: &mpsc::Receiver<StreamState>, want: StreamState, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(state) if state == want => return true,
            Ok(_) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return false,
        }
    }
    false
}

/// Drives a client session through `new_session` -> `request` -> answer ->
/// `session_start`, returning once the stream the caller added is connected.
fn connect_one_stream(
    manager: &Arc<SessionManager>,
    peer: UserId,
    options: StreamOptions,
) -> (carrier_session::stream::Stream, mpsc::Receiver<StreamState>, mpsc::Receiver<Vec<u8>>) {
    let session = manager.new_session(peer).expect("new_session");
    let (state_tx, state_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel();
    let stream = session
        .add_stream(StreamKind::Application, options, Arc::new(Observer { state: state_tx, data: data_tx }))
        .expect("add_stream");

    let (done_tx, done_rx) = mpsc::channel();
    manager
        .request(&session, Box::new(move |outcome| { let _ = done_tx.send(outcome); }))
        .expect("request");
    let outcome = done_rx.recv_timeout(Duration::from_secs(5)).expect("peer answered");
    let peer_sdp = match outcome {
        RequestOutcome::Accepted(sdp) => sdp,
        other => panic!("expected Accepted, got {other:?}"),
    };
    session.session_start(&peer_sdp).expect("session_start");
    assert!(wait_for_state(&state_rx, StreamState::Connected, Duration::from_secs(5)), "stream never connected");
    (stream, state_rx, data_rx)
}

/// S1: a plain, non-multiplexed reliable stream delivers bytes in order.
#[test]
fn s1_plain_reliable_stream_round_trips_bytes() {
    let (overlay_a, overlay_b) = MockFriendOverlay::pair(id(1), id(2));

    let (server_data_tx, server_data_rx) = mpsc::channel();
    let server_handler: RequestHandler = Arc::new(move |manager, peer, remote_sdp| {
        let session = manager.session(&peer).expect("session created for inbound request");
        let (state_tx, _state_rx) = mpsc::channel();
        for desc in &remote_sdp.streams {
            session
                .add_stream(desc.kind, desc.options, Arc::new(Observer { state: state_tx.clone(), data: server_data_tx.clone() }))
                .expect("mirror stream");
        }
        manager.reply(&peer, true, "").expect("reply accept");
        session.session_start(&remote_sdp).expect("session_start on answering side");
    });

    let manager_b = SessionManager::init(overlay_b, "127.0.0.1".parse().unwrap(), test_logger("s1-server"), server_handler);
    let manager_a = SessionManager::init(overlay_a, "127.0.0.1".parse().unwrap(), test_logger("s1-client"), noop_handler());

    let options = StreamOptions { reliable: true, plain: true, multiplexing: false, port_forwarding: false };
    let (stream, _state_rx, _unused_data_rx) = connect_one_stream(&manager_a, id(2), options);

    stream.write(b"hello, carrier").expect("write");

    let received = server_data_rx.recv_timeout(Duration::from_secs(5)).expect("server received stream data");
    assert_eq!(received, b"hello, carrier");

    manager_a.cleanup();
    manager_b.cleanup();
}

/// S2: a multiplexing stream carries several independent channels; data on
/// each arrives in order and closing one doesn't disturb the others.
#[test]
fn s2_multiplexed_channels_carry_independent_data() {
    let (overlay_a, overlay_b) = MockFriendOverlay::pair(id(3), id(4));

    struct ServerChannels {
        opens: mpsc::Sender<(StreamId, ChannelId, Vec<u8>)>,
        data: mpsc::Sender<(ChannelId, Vec<u8>)>,
        closes: mpsc::Sender<(ChannelId, CloseReason)>,
    }
    impl StreamCallbacks for ServerChannels {
        fn on_channel_open(&self, stream: StreamId, channel: ChannelId, cookie: Vec<u8>) -> bool {
            let _ = self.opens.send((stream, channel, cookie));
            true
        }
        fn on_channel_data(&self, _stream: StreamId, channel: ChannelId, bytes: Vec<u8>) {
            let _ = self.data.send((channel, bytes));
        }
        fn on_channel_close(&self, _stream: StreamId, channel: ChannelId, reason: CloseReason) {
            let _ = self.closes.send((channel, reason));
        }
    }

    let (opens_tx, opens_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel();
    let (closes_tx, closes_rx) = mpsc::channel();
    let server_handler: RequestHandler = Arc::new(move |manager, peer, remote_sdp| {
        let session = manager.session(&peer).expect("session created for inbound request");
        for desc in &remote_sdp.streams {
            session
                .add_stream(
                    desc.kind,
                    desc.options,
                    Arc::new(ServerChannels { opens: opens_tx.clone(), data: data_tx.clone(), closes: closes_tx.clone() }),
                )
                .expect("mirror stream");
        }
        manager.reply(&peer, true, "").expect("reply accept");
        session.session_start(&remote_sdp).expect("session_start on answering side");
    });

    let manager_b = SessionManager::init(overlay_b, "127.0.0.1".parse().unwrap(), test_logger("s2-server"), server_handler);
    let manager_a = SessionManager::init(overlay_a, "127.0.0.1".parse().unwrap(), test_logger("s2-client"), noop_handler());

    let options = StreamOptions { reliable: true, plain: false, multiplexing: true, port_forwarding: false };
    let (stream, _state_rx, _data_rx) = connect_one_stream(&manager_a, id(4), options);

    let chan_one = stream.open_channel(b"one").expect("open channel one");
    let chan_two = stream.open_channel(b"two").expect("open channel two");

    let (_s, c, cookie) = opens_rx.recv_timeout(Duration::from_secs(5)).expect("channel one opened server-side");
    assert_eq!(c, chan_one);
    assert_eq!(cookie, b"one");
    let (_s, c, cookie) = opens_rx.recv_timeout(Duration::from_secs(5)).expect("channel two opened server-side");
    assert_eq!(c, chan_two);
    assert_eq!(cookie, b"two");

    stream.write_channel(chan_one, b"alpha").expect("write chan one");
    stream.write_channel(chan_two, b"beta").expect("write chan two");

    let mut seen = std::collections::HashMap::new();
    for _ in 0..2 {
        let (c, bytes) = data_rx.recv_timeout(Duration::from_secs(5)).expect("channel data");
        seen.insert(c, bytes);
    }
    assert_eq!(seen.get(&chan_one), Some(&b"alpha".to_vec()));
    assert_eq!(seen.get(&chan_two), Some(&b"beta".to_vec()));

    stream.close_channel(chan_one).expect("close channel one");
    let (closed, reason) = closes_rx.recv_timeout(Duration::from_secs(5)).expect("channel one closed server-side");
    assert_eq!(closed, chan_one);
    assert_eq!(reason, CloseReason::Normal);

    stream.write_channel(chan_two, b"gamma").expect("channel two still usable after channel one closed");
    let (c, bytes) = data_rx.recv_timeout(Duration::from_secs(5)).expect("channel two data after sibling close");
    assert_eq!(c, chan_two);
    assert_eq!(bytes, b"gamma");

    manager_a.cleanup();
    manager_b.cleanup();
}

/// S3: port forwarding tunnels a TCP byte stream end to end through a
/// multiplexing + port-forwarding channel to a real backend listener.
#[test]
fn s3_port_forwarding_tunnels_a_tcp_echo_connection() {
    let backend = std::net::TcpListener::bind("127.0.0.1:0").expect("bind echo backend");
    let backend_port = backend.local_addr().expect("local_addr").port();
    std::thread::spawn(move || {
        for incoming in backend.incoming() {
            let Ok(mut socket) = incoming else { break };
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    let (overlay_a, overlay_b) = MockFriendOverlay::pair(id(5), id(6));
    let server_handler: RequestHandler = Arc::new(move |manager, peer, remote_sdp| {
        let session = manager.session(&peer).expect("session created for inbound request");
        for desc in &remote_sdp.streams {
            session
                .add_stream(desc.kind, desc.options, Arc::new(carrier_session::stream::NoopStreamCallbacks))
                .expect("mirror stream");
        }
        session.add_service("echo", "127.0.0.1", backend_port).expect("add_service");
        manager.reply(&peer, true, "").expect("reply accept");
        session.session_start(&remote_sdp).expect("session_start on answering side");
    });

    let manager_b = SessionManager::init(overlay_b, "127.0.0.1".parse().unwrap(), test_logger("s3-server"), server_handler);
    let manager_a = SessionManager::init(overlay_a, "127.0.0.1".parse().unwrap(), test_logger("s3-client"), noop_handler());

    let options = StreamOptions { reliable: true, plain: false, multiplexing: true, port_forwarding: true };
    let (stream, _state_rx, _data_rx) = connect_one_stream(&manager_a, id(6), options);

    // Grab a free local port the way the UDP overlay tests do: bind then
    // drop, so `open_port_forwarding` can bind the same port itself.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let local_port = probe.local_addr().expect("local_addr").port();
    drop(probe);

    stream.open_port_forwarding("echo", "127.0.0.1", local_port).expect("open_port_forwarding");

    let mut conn = connect_with_retry(local_port, Duration::from_secs(5));
    conn.write_all(b"ping-through-tunnel").expect("write to forwarded connection");
    let mut buf = [0u8; 19];
    conn.read_exact(&mut buf).expect("read echoed bytes back through the tunnel");
    assert_eq!(&buf, b"ping-through-tunnel");

    manager_a.cleanup();
    manager_b.cleanup();
}

fn connect_with_retry(port: u16, timeout: Duration) -> TcpStream {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(s) => return s,
            Err(_) if std::time::Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("could not connect to forwarded local listener: {e}"),
        }
    }
}

/// S5: re-creating a session to the same peer before the prior one reaches
/// `closed` is `ALREADY_EXIST`; after it closes, a new one is legal again.
#[test]
fn s5_session_double_new_then_close_then_new_again() {
    let (overlay_a, _overlay_b) = MockFriendOverlay::pair(id(7), id(8));
    let manager = SessionManager::init(overlay_a, "127.0.0.1".parse().unwrap(), test_logger("s5"), noop_handler());

    let first = manager.new_session(id(8)).expect("first new_session");
    let err = manager.new_session(id(8)).expect_err("second new_session before close");
    assert_eq!(err.kind, ErrorKind::AlreadyExist);

    manager.forget(&id(8));
    drop(first);

    let second = manager.new_session(id(8)).expect("new_session after close is legal again");
    assert_eq!(second.stream_count(), 0);

    manager.cleanup();
}
