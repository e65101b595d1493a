//! `pfd`: TCP port-forwarding daemon consuming the carrier-session core
//! (spec §4.6, §6). Server mode accepts one inbound session from a
//! configured peer, mirrors its requested stream list, registers every
//! service the peer is allowed to use, and dials the backend when a
//! forwarding channel opens. Client mode connects to a configured peer,
//! negotiates one multiplexing+port-forwarding stream, and binds a local
//! listener per wanted service.
//!
//! This is a thin consumer of the core, in the spirit of RustyRTC's own
//! `src/bin/*.rs`: parse args, load `Config`, start a `Logger`, build the
//! domain object, run. The DHT/friend overlay is out of scope for this
//! crate (spec §1), so both modes ride `identity::udp_overlay::UdpFriendOverlay`,
//! a single-peer UDP stand-in, instead of a real DHT.

use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use carrier_session::config::Config;
use carrier_session::identity::udp_overlay::UdpFriendOverlay;
use carrier_session::identity::user_id::UserId;
use carrier_session::log::logger::Logger;
use carrier_session::log::logger_handle::LoggerHandle;
use carrier_session::session::manager::{RequestHandler, RequestOutcome, SessionManager};
use carrier_session::session::Carrier;
use carrier_session::stream::options::{StreamKind, StreamOptions};
use carrier_session::stream::state::StreamState;
use carrier_session::stream::StreamCallbacks;
use carrier_session::{sink_error, sink_info, sink_warn};

fn usage(code: i32) -> ! {
    eprintln!("usage: pfd -c <config> [--debug] [-h|-?]");
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
                eprintln!("[pfd] unrecognized argument '{other}'");
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

/// `--debug` waits for a debugger to attach before proceeding. There is no
/// real debugger-attach hook available to a library crate, so this is
/// gated on an env var the operator sets once attached, matching how a CLI
/// tool documents (but stubs) this in the absence of a platform hook.
fn wait_for_debugger() {
    eprintln!("[pfd] --debug: waiting for PFD_DEBUG_ATTACHED to be set...");
    while env::var("PFD_DEBUG_ATTACHED").is_err() {
        thread::sleep(Duration::from_millis(200));
    }
}

fn required<'a>(config: &'a Config, key: &str) -> &'a str {
    config.get_global(key).unwrap_or_else(|| {
        eprintln!("[pfd] missing required config key '{key}'");
        process::exit(-1);
    })
}

fn main() {
    let (config_path, debug) = parse_args();
    if debug {
        wait_for_debugger();
    }

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[pfd] error loading config {config_path}: {e}");
            process::exit(-1);
        }
    };

    let datadir = config.get_or_default("", "datadir", "./pfd-data");
    let logger = Logger::start_in_dir(datadir, "pfd", 1024, 64, 1);
    let handle = logger.handle();

    let mode = config.get_global("mode").unwrap_or("client");
    sink_info!(handle, "pfd starting in '{mode}' mode, config={config_path}");

    match mode {
        "server" => run_server(&config, handle),
        "client" => run_client(&config, handle),
        other => {
            eprintln!("[pfd] unknown mode '{other}', expected 'server' or 'client'");
            process::exit(-1);
        }
    }
}

fn self_id(config: &Config) -> UserId {
    match config.get_global("self_id").map(UserId::from_base58) {
        Some(Ok(id)) => id,
        Some(Err(_)) | None => {
            let bytes: [u8; 32] = rand::random();
            UserId::from_bytes(bytes)
        }
    }
}

/// Both modes are point-to-point against one configured peer, since
/// `UdpFriendOverlay` is a single-peer stand-in for the out-of-scope DHT
/// (spec §1). `serverid`/`server_address` name that peer in both
/// directions (spec §6's table documents them for client mode; a
/// single-peer overlay needs the same pair on the listening side too).
fn peer_id_and_addr(config: &Config) -> (UserId, SocketAddr) {
    let peer_id = UserId::from_base58(required(config, "serverid")).unwrap_or_else(|e| {
        eprintln!("[pfd] invalid serverid: {e}");
        process::exit(-1);
    });
    let peer_addr: SocketAddr = required(config, "server_address").parse().unwrap_or_else(|e| {
        eprintln!("[pfd] invalid server_address: {e}");
        process::exit(-1);
    });
    (peer_id, peer_addr)
}

struct ForwardCallbacks;
impl StreamCallbacks for ForwardCallbacks {}

fn run_server(config: &Config, logger: LoggerHandle) {
    let self_id = self_id(config);
    let (peer_id, peer_addr) = peer_id_and_addr(config);
    let bind_addr: SocketAddr = config.get_or_default("", "bind_address", "0.0.0.0:33445").parse().unwrap_or_else(|e| {
        eprintln!("[pfd] invalid bind_address: {e}");
        process::exit(-1);
    });

    let services = config.services();
    let allowed = config.allowed_users();
    sink_info!(logger, "server: {} service(s) configured, {} user(s) allowed", services.len(), allowed.len());

    let overlay = match UdpFriendOverlay::bind(bind_addr, peer_id, peer_addr, logger.clone()) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("[pfd] failed to bind overlay socket on {bind_addr}: {e}");
            process::exit(-1);
        }
    };

    let services_for_handler = services.clone();
    let allowed_for_handler = allowed.clone();
    let logger_for_handler = logger.clone();
    let handler: RequestHandler = Arc::new(move |manager, peer, remote_sdp| {
        let permitted = allowed_for_handler.get(&peer).cloned().unwrap_or_default();
        if permitted.is_empty() {
            sink_warn!(logger_for_handler, "rejecting session from unauthorized peer {peer}");
            let _ = manager.reply(&peer, false, "not authorized");
            return;
        }
        let Some(session) = manager.session(&peer) else {
            return;
        };
        for desc in &remote_sdp.streams {
            if session
                .add_stream(desc.kind, desc.options, Arc::new(ForwardCallbacks))
                .is_err()
            {
                sink_warn!(logger_for_handler, "failed to mirror requested stream from {peer}");
                let _ = manager.reply(&peer, false, "stream negotiation failed");
                return;
            }
        }
        for svc in &services_for_handler {
            if permitted.contains(&svc.name) {
                let _ = session.add_service(&svc.name, &svc.host, svc.port);
            }
        }
        if manager.reply(&peer, true, "").is_ok() {
            let _ = session.session_start(&remote_sdp);
            sink_info!(logger_for_handler, "accepted session from {peer}");
        }
    });

    let carrier = Carrier::new(self_id, Config::empty(), overlay, bind_addr.ip(), logger.clone(), handler);
    sink_info!(logger, "server listening for {peer_id} on {bind_addr}");
    park_forever();
    carrier.shutdown();
}

fn run_client(config: &Config, logger: LoggerHandle) {
    let self_id = self_id(config);
    let (peer_id, peer_addr) = peer_id_and_addr(config);
    let bind_addr: SocketAddr = "0.0.0.0:0".parse().unwrap_or_else(|e| {
        eprintln!("[pfd] unreachable: {e}");
        process::exit(-1);
    });

    let wanted = config.services();
    if wanted.is_empty() {
        eprintln!("[pfd] client mode needs at least one `service = name:bind_host:bind_port` entry");
        process::exit(-1);
    }

    let overlay = match UdpFriendOverlay::bind(bind_addr, peer_id, peer_addr, logger.clone()) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("[pfd] failed to bind overlay socket: {e}");
            process::exit(-1);
        }
    };
    let manager = SessionManager::init(overlay, "0.0.0.0".parse().unwrap(), logger.clone(), Arc::new(|_, _, _| {}));
    sink_info!(logger, "client {self_id} connecting to {peer_id} at {peer_addr}");

    let session = manager.new_session(peer_id).unwrap_or_else(|e| {
        eprintln!("[pfd] could not start a session with {peer_id}: {e}");
        process::exit(-1);
    });

    let (state_tx, state_rx) = mpsc::channel();
    struct WaitForConnected(mpsc::Sender<StreamState>);
    impl StreamCallbacks for WaitForConnected {
        fn on_state_changed(&self, _stream: carrier_session::stream::options::StreamId, state: StreamState) {
            let _ = self.0.send(state);
        }
    }

    let options = StreamOptions { reliable: true, plain: false, multiplexing: true, port_forwarding: true };
    let stream = session
        .add_stream(StreamKind::Application, options, Arc::new(WaitForConnected(state_tx)))
        .unwrap_or_else(|e| {
            eprintln!("[pfd] could not add a forwarding stream: {e}");
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
            eprintln!("[pfd] could not send session request: {e}");
            process::exit(-1);
        });

    let outcome = match done_rx.recv_timeout(Duration::from_secs(65)) {
        Ok(outcome) => outcome,
        Err(_) => {
            eprintln!("[pfd] server never answered");
            process::exit(-1);
        }
    };
    let peer_sdp = match outcome {
        RequestOutcome::Accepted(sdp) => sdp,
        RequestOutcome::Refused(reason) => {
            eprintln!("[pfd] server refused: {reason}");
            process::exit(-1);
        }
        RequestOutcome::TimedOut => {
            eprintln!("[pfd] server request timed out");
            process::exit(-1);
        }
    };
    if let Err(e) = session.session_start(&peer_sdp) {
        eprintln!("[pfd] failed to start session: {e}");
        process::exit(-1);
    }

    if !wait_for_connected(&state_rx, Duration::from_secs(35)) {
        eprintln!("[pfd] stream never reached connected");
        process::exit(-1);
    }
    sink_info!(logger, "forwarding stream connected to {peer_id}");

    for svc in &wanted {
        match stream.open_port_forwarding(&svc.name, &svc.host, svc.port) {
            Ok(()) => sink_info!(logger, "forwarding '{}' on {}:{}", svc.name, svc.host, svc.port),
            Err(e) => sink_error!(logger, "failed to start forwarding '{}': {e}", svc.name),
        }
    }

    park_forever();
    manager.cleanup();
}

fn wait_for_connected(rx: &mpsc::Receiver<StreamState>, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
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

fn park_forever() -> ! {
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
