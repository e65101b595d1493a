//! `speedtest`: exercises one multiplexing channel end to end and reports
//! throughput, mirroring spec §8 scenario S2. A thin consumer of the core,
//! structured like `pfd`: parse args, load `Config`, start a `Logger`,
//! build a `Carrier`, run.

use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use carrier_session::channel::ChannelId;
use carrier_session::config::Config;
use carrier_session::identity::udp_overlay::UdpFriendOverlay;
use carrier_session::identity::user_id::UserId;
use carrier_session::log::logger::Logger;
use carrier_session::log::logger_handle::LoggerHandle;
use carrier_session::session::manager::{RequestHandler, RequestOutcome, SessionManager};
use carrier_session::session::Carrier;
use carrier_session::stream::options::{StreamId, StreamKind, StreamOptions};
use carrier_session::stream::state::StreamState;
use carrier_session::stream::StreamCallbacks;
use carrier_session::{sink_error, sink_info};

const PACKET_SIZE: usize = 1024;
/// Default transfer size for a client-mode run (spec §8 S2: "A writes 1 MiB").
const DEFAULT_TOTAL_BYTES: u64 = 1024 * 1024;

fn usage(code: i32) -> ! {
    eprintln!("usage: speedtest -c <config> [--debug] [-h|-?]");
    process::exit(code);
}

fn parse_args() -> (String, bool) {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<String> = None;
    let mut debug = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" => {
                i += 1;
                config_path = args.get(i).cloned();
            }
            "--debug" => debug = true,
            "-h" | "-?" => usage(0),
            other => {
                eprintln!("[speedtest] unrecognized argument '{other}'");
                usage(-1);
            }
        }
        i += 1;
    }
    match config_path {
        Some(path) => (path, debug),
        None => usage(-1),
    }
}

fn wait_for_debugger() {
    eprintln!("[speedtest] --debug: waiting for SPEEDTEST_DEBUG_ATTACHED to be set...");
    while env::var("SPEEDTEST_DEBUG_ATTACHED").is_err() {
        thread::sleep(Duration::from_millis(200));
    }
}

fn required<'a>(config: &'a Config, key: &str) -> &'a str {
    config.get_global(key).unwrap_or_else(|| {
        eprintln!("[speedtest] missing required config key '{key}'");
        process::exit(-1);
    })
}

fn self_id(config: &Config) -> UserId {
    match config.get_global("self_id").map(UserId::from_base58) {
        Some(Ok(id)) => id,
        Some(Err(_)) | None => UserId::from_bytes(rand::random()),
    }
}

fn peer_id_and_addr(config: &Config) -> (UserId, SocketAddr) {
    let peer_id = UserId::from_base58(required(config, "serverid")).unwrap_or_else(|e| {
        eprintln!("[speedtest] invalid serverid: {e}");
        process::exit(-1);
    });
    let peer_addr: SocketAddr = required(config, "server_address").parse().unwrap_or_else(|e| {
        eprintln!("[speedtest] invalid server_address: {e}");
        process::exit(-1);
    });
    (peer_id, peer_addr)
}

fn main() {
    let (config_path, debug) = parse_args();
    if debug {
        wait_for_debugger();
    }

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[speedtest] error loading config {config_path}: {e}");
            process::exit(-1);
        }
    };

    let datadir = config.get_or_default("", "datadir", "./speedtest-data");
    let logger = Logger::start_in_dir(datadir, "speedtest", 1024, 64, 1);
    let handle = logger.handle();

    let mode = config.get_global("mode").unwrap_or("client");
    sink_info!(handle, "speedtest starting in '{mode}' mode, config={config_path}");

    match mode {
        "server" => run_server(&config, handle),
        "client" => run_client(&config, handle),
        other => {
            eprintln!("[speedtest] unknown mode '{other}', expected 'server' or 'client'");
            process::exit(-1);
        }
    }
}

#[derive(Default)]
struct Counter {
    bytes: AtomicU64,
}

struct ServerCallbacks {
    counter: Arc<Counter>,
    logger: LoggerHandle,
    started: std::sync::Mutex<Option<Instant>>,
}

impl StreamCallbacks for ServerCallbacks {
    fn on_channel_open(&self, _stream: StreamId, _channel: ChannelId, _cookie: Vec<u8>) -> bool {
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        true
    }

    fn on_channel_data(&self, _stream: StreamId, _channel: ChannelId, bytes: Vec<u8>) {
        self.counter.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }

    fn on_channel_close(&self, _stream: StreamId, _channel: ChannelId, reason: carrier_session::channel::CloseReason) {
        let total = self.counter.bytes.load(Ordering::Relaxed);
        let elapsed = self
            .started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed())
            .unwrap_or_default();
        let kib_per_sec = if elapsed.as_secs_f64() > 0.0 {
            (total as f64 / 1024.0) / elapsed.as_secs_f64()
        } else {
            0.0
        };
        sink_info!(
            self.logger,
            "channel closed ({reason:?}): received {total} bytes in {elapsed:?} ({kib_per_sec:.1} KiB/s)"
        );
    }
}

fn run_server(config: &Config, logger: LoggerHandle) {
    let self_id = self_id(config);
    let (peer_id, peer_addr) = peer_id_and_addr(config);
    let bind_addr: SocketAddr = config
        .get_or_default("", "bind_address", "0.0.0.0:33446")
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("[speedtest] invalid bind_address: {e}");
            process::exit(-1);
        });

    let overlay = match UdpFriendOverlay::bind(bind_addr, peer_id, peer_addr, logger.clone()) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("[speedtest] failed to bind overlay socket: {e}");
            process::exit(-1);
        }
    };

    let counter = Arc::new(Counter::default());
    let logger_for_handler = logger.clone();
    let counter_for_handler = Arc::clone(&counter);
    let handler: RequestHandler = Arc::new(move |manager, peer, remote_sdp| {
        let Some(session) = manager.session(&peer) else {
            return;
        };
        let callbacks = Arc::new(ServerCallbacks {
            counter: Arc::clone(&counter_for_handler),
            logger: logger_for_handler.clone(),
            started: std::sync::Mutex::new(None),
        });
        for desc in &remote_sdp.streams {
            if session.add_stream(desc.kind, desc.options, callbacks.clone()).is_err() {
                let _ = manager.reply(&peer, false, "stream negotiation failed");
                return;
            }
        }
        if manager.reply(&peer, true, "").is_ok() {
            let _ = session.session_start(&remote_sdp);
            sink_info!(logger_for_handler, "accepted speedtest session from {peer}");
        }
    });

    let carrier = Carrier::new(self_id, Config::empty(), overlay, bind_addr.ip(), logger.clone(), handler);
    sink_info!(logger, "speedtest server listening for {peer_id} on {bind_addr}");
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
    #[allow(unreachable_code)]
    {
        carrier.shutdown();
    }
}

fn run_client(config: &Config, logger: LoggerHandle) {
    let self_id = self_id(config);
    let (peer_id, peer_addr) = peer_id_and_addr(config);
    let bind_addr: SocketAddr = "0.0.0.0:0".parse().unwrap_or_else(|e| {
        eprintln!("[speedtest] unreachable: {e}");
        process::exit(-1);
    });
    let total_bytes = config
        .get_global("total_bytes")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TOTAL_BYTES);

    let overlay = match UdpFriendOverlay::bind(bind_addr, peer_id, peer_addr, logger.clone()) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("[speedtest] failed to bind overlay socket: {e}");
            process::exit(-1);
        }
    };

    let manager = SessionManager::init(overlay, "0.0.0.0".parse().unwrap(), logger.clone(), Arc::new(|_, _, _| {}));
    sink_info!(logger, "client {self_id} connecting to {peer_id} at {peer_addr}");

    let session = manager.new_session(peer_id).unwrap_or_else(|e| {
        eprintln!("[speedtest] could not start a session with {peer_id}: {e}");
        process::exit(-1);
    });

    let (state_tx, state_rx) = mpsc::channel();
    struct WaitForConnected(mpsc::Sender<StreamState>);
    impl StreamCallbacks for WaitForConnected {
        fn on_state_changed(&self, _stream: StreamId, state: StreamState) {
            let _ = self.0.send(state);
        }
    }

    let options = StreamOptions { reliable: true, plain: true, multiplexing: true, port_forwarding: false };
    let stream = session
        .add_stream(StreamKind::Application, options, Arc::new(WaitForConnected(state_tx)))
        .unwrap_or_else(|e| {
            eprintln!("[speedtest] could not add a stream: {e}");
            process::exit(-1);
        });

    let (done_tx, done_rx) = mpsc::channel();
    manager
        .request(
            &session,
            Box::new(move |outcome| {
                let _ = done_tx.send(outcome);
            }),
        )
        .unwrap_or_else(|e| {
            eprintln!("[speedtest] could not send session request: {e}");
            process::exit(-1);
        });

    let outcome = done_rx.recv_timeout(Duration::from_secs(65)).unwrap_or_else(|_| {
        eprintln!("[speedtest] server never answered");
        process::exit(-1);
    });
    let peer_sdp = match outcome {
        RequestOutcome::Accepted(sdp) => sdp,
        RequestOutcome::Refused(reason) => {
            eprintln!("[speedtest] server refused: {reason}");
            process::exit(-1);
        }
        RequestOutcome::TimedOut => {
            eprintln!("[speedtest] server request timed out");
            process::exit(-1);
        }
    };
    if let Err(e) = session.session_start(&peer_sdp) {
        eprintln!("[speedtest] failed to start session: {e}");
        process::exit(-1);
    }

    if !wait_for_connected(&state_rx, Duration::from_secs(35)) {
        eprintln!("[speedtest] stream never reached connected");
        process::exit(-1);
    }

    let channel = stream.open_channel(b"speedtest").unwrap_or_else(|e| {
        eprintln!("[speedtest] could not open channel: {e}");
        process::exit(-1);
    });

    sink_info!(logger, "sending {total_bytes} bytes in {PACKET_SIZE}-byte packets");
    let payload = vec![0xABu8; PACKET_SIZE];
    let start = Instant::now();
    let mut sent: u64 = 0;
    while sent < total_bytes {
        #[allow(clippy::cast_possible_truncation)]
        let chunk_len = std::cmp::min(PACKET_SIZE as u64, total_bytes - sent) as usize;
        loop {
            match stream.write_channel(channel, &payload[..chunk_len]) {
                Ok(_) => break,
                Err(e) if e.is_busy() => thread::sleep(Duration::from_millis(5)),
                Err(e) => {
                    sink_error!(logger, "write_channel failed: {e}");
                    process::exit(-1);
                }
            }
        }
        sent += chunk_len as u64;
    }
    let elapsed = start.elapsed();
    let kib_per_sec = (sent as f64 / 1024.0) / elapsed.as_secs_f64().max(0.001);
    sink_info!(logger, "sent {sent} bytes in {elapsed:?} ({kib_per_sec:.1} KiB/s)");

    if let Err(e) = stream.close_channel(channel) {
        sink_error!(logger, "close_channel failed: {e}");
    }
    thread::sleep(Duration::from_millis(200));
    manager.cleanup();
}

fn wait_for_connected(rx: &mpsc::Receiver<StreamState>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(StreamState::Connected) => return true,
            Ok(StreamState::Failed | StreamState::Closed) => return false,
            Ok(_) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return false,
        }
    }
    false
}
