//! ICE worker thread (spec §4.4, §5 concurrency model).
//!
//! One thread per session owns the `IceAgent`, the UDP socket, and the
//! `Multiplexer` exclusively; every other thread talks to it by posting
//! commands and waiting on a reply channel, and every multiplexer callback
//! fires on this thread. Grounded in shape on the worker-thread + mpsc
//! command-queue pattern used throughout `sctp::sender`/`sctp::receiver`
//! and `connection_manager::ice_worker`.

use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::channel::{ChannelId, CloseReason};
use crate::error::{CarrierError, ErrorKind, Facility};
use crate::fmp::{MuxCallbacks, Multiplexer};
use crate::ice::agent::{IceAgent, IceRole};
use crate::ice::candidate::{gather_host_candidates, Candidate};
use crate::log::logger_handle::LoggerHandle;
use crate::stream::options::{StreamId, StreamOptions};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Events delivered to the session that owns this transport. Per-stream and
/// per-channel data/close events are instead routed through the registered
/// `MuxCallbacks` so they reach the `Stream`/`Channel` handles directly;
/// this enum covers transport-wide lifecycle only.
#[derive(Debug, Clone)]
pub enum IceEvent {
    Connected { remote: SocketAddr },
    Failed,
}

enum Command {
    AddRemoteCandidate(Candidate),
    SetRemoteCredentials { ufrag: String, pwd: String },
    RegisterStream {
        stream_id: StreamId,
        options: StreamOptions,
        reply: Sender<Result<(), CarrierError>>,
    },
    RemoveStream(StreamId),
    WriteStream {
        stream_id: StreamId,
        bytes: Vec<u8>,
        reply: Sender<Result<(), CarrierError>>,
    },
    OpenChannel {
        stream_id: StreamId,
        cookie: Vec<u8>,
        reply: Sender<Result<ChannelId, CarrierError>>,
    },
    WriteChannel {
        stream_id: StreamId,
        channel_id: ChannelId,
        bytes: Vec<u8>,
        reply: Sender<Result<(), CarrierError>>,
    },
    CloseChannel {
        stream_id: StreamId,
        channel_id: ChannelId,
        reply: Sender<Result<(), CarrierError>>,
    },
    PendChannel {
        stream_id: StreamId,
        channel_id: ChannelId,
        reply: Sender<Result<(), CarrierError>>,
    },
    ResumeChannel {
        stream_id: StreamId,
        channel_id: ChannelId,
        reply: Sender<Result<(), CarrierError>>,
    },
    Stop,
}

/// Cheap, cloneable, `Send + Sync` handle; every method posts to the worker
/// thread and blocks on its reply, so callers never touch the `Multiplexer`
/// or socket directly.
#[derive(Clone)]
pub struct IceTransportHandle {
    commands: Sender<Command>,
}

fn recv_reply<T>(rx: Receiver<Result<T, CarrierError>>) -> Result<T, CarrierError> {
    rx.recv()
        .map_err(|_| CarrierError::with_context(Facility::Ice, ErrorKind::WrongState, "ice worker stopped"))?
}

impl IceTransportHandle {
    pub fn add_remote_candidate(&self, c: Candidate) {
        let _ = self.commands.send(Command::AddRemoteCandidate(c));
    }

    pub fn set_remote_credentials(&self, ufrag: String, pwd: String) {
        let _ = self.commands.send(Command::SetRemoteCredentials { ufrag, pwd });
    }

    pub fn register_stream(&self, stream_id: StreamId, options: StreamOptions) -> Result<(), CarrierError> {
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::RegisterStream { stream_id, options, reply })
            .map_err(|_| CarrierError::new(Facility::Ice, ErrorKind::WrongState))?;
        recv_reply(rx)
    }

    pub fn remove_stream(&self, stream_id: StreamId) {
        let _ = self.commands.send(Command::RemoveStream(stream_id));
    }

    pub fn write_stream(&self, stream_id: StreamId, bytes: Vec<u8>) -> Result<(), CarrierError> {
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::WriteStream { stream_id, bytes, reply })
            .map_err(|_| CarrierError::new(Facility::Ice, ErrorKind::WrongState))?;
        recv_reply(rx)
    }

    pub fn open_channel(&self, stream_id: StreamId, cookie: Vec<u8>) -> Result<ChannelId, CarrierError> {
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::OpenChannel { stream_id, cookie, reply })
            .map_err(|_| CarrierError::new(Facility::Ice, ErrorKind::WrongState))?;
        recv_reply(rx)
    }

    pub fn write_channel(&self, stream_id: StreamId, channel_id: ChannelId, bytes: Vec<u8>) -> Result<(), CarrierError> {
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::WriteChannel { stream_id, channel_id, bytes, reply })
            .map_err(|_| CarrierError::new(Facility::Ice, ErrorKind::WrongState))?;
        recv_reply(rx)
    }

    pub fn close_channel(&self, stream_id: StreamId, channel_id: ChannelId) -> Result<(), CarrierError> {
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::CloseChannel { stream_id, channel_id, reply })
            .map_err(|_| CarrierError::new(Facility::Ice, ErrorKind::WrongState))?;
        recv_reply(rx)
    }

    pub fn pend_channel(&self, stream_id: StreamId, channel_id: ChannelId) -> Result<(), CarrierError> {
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::PendChannel { stream_id, channel_id, reply })
            .map_err(|_| CarrierError::new(Facility::Ice, ErrorKind::WrongState))?;
        recv_reply(rx)
    }

    pub fn resume_channel(&self, stream_id: StreamId, channel_id: ChannelId) -> Result<(), CarrierError> {
        let (reply, rx) = mpsc::channel();
        self.commands
            .send(Command::ResumeChannel { stream_id, channel_id, reply })
            .map_err(|_| CarrierError::new(Facility::Ice, ErrorKind::WrongState))?;
        recv_reply(rx)
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

pub struct IceWorker {
    handle: IceTransportHandle,
    join: Option<JoinHandle<()>>,
}

impl IceWorker {
    /// Spawns the worker thread, binds a UDP socket for `bind_addr`, and
    /// starts the ICE agent in `role`. `events` receives transport-wide
    /// lifecycle events; `callbacks` is wired straight into the multiplexer
    /// so per-stream/per-channel events fire without an extra hop.
    ///
    /// `credentials` fixes the agent's local ufrag/pwd instead of letting it
    /// generate its own, so the caller can build the local SDP (spec §4.2,
    /// "ufrag/pwd are ... bound to the session for its lifetime") before the
    /// worker thread even starts.
    pub fn spawn(
        bind_addr: SocketAddr,
        role: IceRole,
        credentials: (String, String),
        callbacks: Arc<dyn MuxCallbacks>,
        events: Sender<IceEvent>,
        logger: LoggerHandle,
    ) -> std::io::Result<(Self, Candidate)> {
        let (socket, local_candidate) = gather_host_candidates(bind_addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let (tx, rx) = mpsc::channel();

        let mut agent = IceAgent::new(role);
        agent.local_ufrag = credentials.0;
        agent.local_pwd = credentials.1;
        agent.add_local_candidate(local_candidate);

        let join = std::thread::spawn(move || {
            run_worker(socket, agent, callbacks, rx, events, logger);
        });

        Ok((
            Self {
                handle: IceTransportHandle { commands: tx },
                join: Some(join),
            },
            local_candidate,
        ))
    }

    #[must_use]
    pub fn handle(&self) -> IceTransportHandle {
        self.handle.clone()
    }
}

impl Drop for IceWorker {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_worker(
    socket: UdpSocket,
    mut agent: IceAgent,
    callbacks: Arc<dyn MuxCallbacks>,
    commands: Receiver<Command>,
    events: Sender<IceEvent>,
    logger: LoggerHandle,
) {
    let mut mux = Multiplexer::new(callbacks);
    let mut connected = false;
    let mut recv_buf = vec![0u8; 65536];

    loop {
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(cmd) => handle_command(cmd, &mut mux, &mut agent, &socket),
            Err(RecvTimeoutError::Timeout) => {}
        }

        match socket.recv_from(&mut recv_buf) {
            Ok((n, from)) => {
                agent.note_received();
                for reply in mux.on_datagram(&recv_buf[..n]) {
                    let _ = socket.send_to(&reply, from);
                }
                if !connected {
                    connected = true;
                    let _ = events.send(IceEvent::Connected { remote: from });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => crate::sink_warn!(logger, "ice worker socket error: {e}"),
        }

        if connected {
            if agent.has_timed_out() {
                crate::sink_warn!(logger, "ice keepalive timeout, session failing");
                let _ = events.send(IceEvent::Failed);
                break;
            }
            if let Some(remote) = agent.remote_addr() {
                if agent.keepalive_due() {
                    let _ = socket.send_to(&[], remote);
                    agent.note_keepalive_sent();
                }
                let (resend, failed) = mux.retransmit_due();
                for frame in resend {
                    let _ = socket.send_to(&frame, remote);
                }
                if !failed.is_empty() {
                    crate::sink_warn!(logger, "{} reliable flow(s) exhausted retransmits", failed.len());
                }
            }
        }
    }
}

fn handle_command(cmd: Command, mux: &mut Multiplexer, agent: &mut IceAgent, socket: &UdpSocket) {
    match cmd {
        Command::Stop => {}
        Command::AddRemoteCandidate(c) => {
            agent.add_remote_candidate(c);
            // First candidate pair is optimistically nominated; spec's
            // connectivity checks degrade to "first pair that yields
            // traffic" since both peers bind a single UDP socket each.
            if !agent.pairs().is_empty() {
                agent.mark_succeeded(0);
            }
        }
        Command::SetRemoteCredentials { ufrag, pwd } => agent.set_remote_credentials(ufrag, pwd),
        Command::RegisterStream { stream_id, options, reply } => {
            mux.register_stream(stream_id, options, &agent.local_ufrag, &agent.local_pwd);
            let _ = reply.send(Ok(()));
        }
        Command::RemoveStream(stream_id) => mux.remove_stream(stream_id),
        Command::WriteStream { stream_id, bytes, reply } => {
            let result = mux.write_stream(stream_id, &bytes).map(|frames| {
                if let Some(remote) = agent.remote_addr() {
                    for f in frames {
                        let _ = socket.send_to(&f, remote);
                    }
                }
            });
            let _ = reply.send(result);
        }
        Command::OpenChannel { stream_id, cookie, reply } => {
            let result = mux.open_channel(stream_id, &cookie).map(|(channel_id, frame)| {
                if let Some(remote) = agent.remote_addr() {
                    let _ = socket.send_to(&frame, remote);
                }
                channel_id
            });
            let _ = reply.send(result);
        }
        Command::WriteChannel { stream_id, channel_id, bytes, reply } => {
            let result = mux.write_channel(stream_id, channel_id, &bytes).map(|frames| {
                if let Some(remote) = agent.remote_addr() {
                    for f in frames {
                        let _ = socket.send_to(&f, remote);
                    }
                }
            });
            let _ = reply.send(result);
        }
        Command::CloseChannel { stream_id, channel_id, reply } => {
            let result = mux.close_channel(stream_id, channel_id).map(|frame| {
                if let Some(remote) = agent.remote_addr() {
                    let _ = socket.send_to(&frame, remote);
                }
            });
            let _ = reply.send(result);
        }
        Command::PendChannel { stream_id, channel_id, reply } => {
            let result = mux.pend_channel(stream_id, channel_id).map(|frame| {
                if let Some(remote) = agent.remote_addr() {
                    let _ = socket.send_to(&frame, remote);
                }
            });
            let _ = reply.send(result);
        }
        Command::ResumeChannel { stream_id, channel_id, reply } => {
            let result = mux.resume_channel(stream_id, channel_id).map(|frame| {
                if let Some(remote) = agent.remote_addr() {
                    let _ = socket.send_to(&frame, remote);
                }
            });
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::stream::options::StreamOptions;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NullCallbacks;
    impl MuxCallbacks for NullCallbacks {
        fn on_stream_data(&self, _stream: StreamId, _bytes: Vec<u8>) {}
        fn on_channel_open_request(&self, _stream: StreamId, _channel: ChannelId, _cookie: Vec<u8>) -> bool {
            true
        }
        fn on_channel_opened(&self, _stream: StreamId, _channel: ChannelId) {}
        fn on_channel_data(&self, _stream: StreamId, _channel: ChannelId, _bytes: Vec<u8>) {}
        fn on_channel_close(&self, _stream: StreamId, _channel: ChannelId, _reason: CloseReason) {}
        fn on_channel_pend(&self, _stream: StreamId, _channel: ChannelId, _paused: bool) {}
    }

    #[derive(Default)]
    struct CollectingCallbacks {
        data: Mutex<Vec<Vec<u8>>>,
    }
    impl MuxCallbacks for CollectingCallbacks {
        fn on_stream_data(&self, _stream: StreamId, bytes: Vec<u8>) {
            self.data.lock().unwrap().push(bytes);
        }
        fn on_channel_open_request(&self, _stream: StreamId, _channel: ChannelId, _cookie: Vec<u8>) -> bool {
            true
        }
        fn on_channel_opened(&self, _stream: StreamId, _channel: ChannelId) {}
        fn on_channel_data(&self, _stream: StreamId, _channel: ChannelId, _bytes: Vec<u8>) {}
        fn on_channel_close(&self, _stream: StreamId, _channel: ChannelId, _reason: CloseReason) {}
        fn on_channel_pend(&self, _stream: StreamId, _channel: ChannelId, _paused: bool) {}
    }

    #[test]
    fn two_workers_exchange_a_reliable_stream_over_loopback() {
        let logger = crate::log::logger::Logger::start_in_dir(std::env::temp_dir(), "ice-worker-test", 64, 8, 1).handle();
        let (events_a_tx, _events_a_rx) = mpsc::channel();
        let (events_b_tx, _events_b_rx) = mpsc::channel();

        let cb_a: Arc<dyn MuxCallbacks> = Arc::new(NullCallbacks);
        let cb_b = Arc::new(CollectingCallbacks::default());

        let (worker_a, cand_a) = IceWorker::spawn(
            "127.0.0.1:0".parse().unwrap(),
            IceRole::Controlling,
            crate::ice::agent::generate_credentials(),
            cb_a,
            events_a_tx,
            logger.clone(),
        )
        .unwrap();
        let (worker_b, cand_b) = IceWorker::spawn(
            "127.0.0.1:0".parse().unwrap(),
            IceRole::Controlled,
            crate::ice::agent::generate_credentials(),
            cb_b.clone(),
            events_b_tx,
            logger,
        )
        .unwrap();

        let handle_a = worker_a.handle();
        let handle_b = worker_b.handle();
        handle_a.add_remote_candidate(cand_b);
        handle_b.add_remote_candidate(cand_a);

        let opts = StreamOptions { reliable: true, plain: true, multiplexing: false, port_forwarding: false };
        handle_a.register_stream(1, opts).unwrap();
        handle_b.register_stream(1, opts).unwrap();

        handle_a.write_stream(1, b"hello worker".to_vec()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if !cb_b.data.lock().unwrap().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let received = cb_b.data.lock().unwrap();
        assert_eq!(received.concat(), b"hello worker");
    }
}
