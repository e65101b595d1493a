//! TCP port-forwarding service (spec §4.6).
//!
//! Grounded in shape on `file_handler::file_handler`'s listener-loop +
//! per-transfer worker-thread topology, adapted from chunked file transfer
//! to a raw bidirectional TCP byte pipe per channel. Outbound accepts local
//! TCP connections and opens one channel per connection; inbound dials a
//! registered backend when an incoming channel's open cookie names it.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::ChannelId;
use crate::stream::options::StreamId;

/// `{name, host, port}` backend registered by the answering side via
/// `Session::add_service`, matching spec §3 "PortForwardService".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardService {
    pub name: String,
    pub host: String,
    pub port: u16,
}

pub const MAX_SERVICE_NAME_LEN: usize = 63;

/// How long an outbound pipe waits for the peer's channel-open ACK before
/// giving up on the local TCP connection (spec §8: unregistered services
/// close "within 5s").
const OPEN_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-channel socket registry, shared between the ICE worker thread
/// (delivering inbound channel bytes) and the TCP-side reader threads
/// (pushing outbound bytes into the channel).
#[derive(Default)]
pub struct PortForwardManager {
    sockets: Mutex<HashMap<(StreamId, ChannelId), TcpStream>>,
    pending_open: Mutex<HashMap<(StreamId, ChannelId), SyncSender<()>>>,
}

impl PortForwardManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a socket awaiting the peer's channel-open acknowledgement;
    /// returns the receiver the caller blocks on (with a timeout) before
    /// starting the forwarding loops.
    fn register_pending(&self, stream: StreamId, channel: ChannelId) -> std::sync::mpsc::Receiver<()> {
        let (tx, rx) = sync_channel(1);
        self.pending_open.lock().unwrap_or_else(|e| e.into_inner()).insert((stream, channel), tx);
        rx
    }

    /// Called from the session's `on_channel_opened` callback: signals any
    /// thread waiting on `register_pending` that the channel is ready.
    pub fn notify_opened(&self, stream: StreamId, channel: ChannelId) {
        if let Some(tx) = self
            .pending_open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(stream, channel))
        {
            let _ = tx.send(());
        }
    }

    pub fn register_socket(&self, stream: StreamId, channel: ChannelId, socket: TcpStream) {
        self.sockets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((stream, channel), socket);
    }

    /// Delivers inbound channel bytes to the local TCP socket, if any is
    /// registered for `(stream, channel)`.
    pub fn deliver(&self, stream: StreamId, channel: ChannelId, bytes: &[u8]) {
        let mut guard = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sock) = guard.get_mut(&(stream, channel)) {
            let _ = sock.write_all(bytes);
        }
    }

    /// Channel closed (either direction): half-close the local TCP write
    /// side; the socket is dropped once the reader thread observes EOF.
    pub fn close(&self, stream: StreamId, channel: ChannelId) {
        let mut guard = self.sockets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sock) = guard.remove(&(stream, channel)) {
            let _ = sock.shutdown(std::net::Shutdown::Both);
        }
        self.pending_open.lock().unwrap_or_else(|e| e.into_inner()).remove(&(stream, channel));
    }
}

/// Spawns the reader thread that pumps bytes from `socket` into the
/// channel via `write_channel`, stopping (and closing the channel) on EOF
/// or write failure. `write_channel` is a closure over the session's
/// `IceTransportHandle` so this module never depends on `Session` directly.
pub fn spawn_tcp_to_channel_pump(
    mut socket: TcpStream,
    stream_id: StreamId,
    channel_id: ChannelId,
    write_channel: impl Fn(ChannelId, &[u8]) -> bool + Send + 'static,
    close_channel: impl FnOnce() + Send + 'static,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if !write_channel(channel_id, &buf[..n]) {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        let _ = stream_id;
        close_channel();
    });
}

/// Blocks (with a bounded timeout) until the peer acknowledges the channel
/// open, then registers the socket and starts the TCP->channel pump.
/// Returns `false` if the open timed out (caller should close the socket).
pub fn wait_then_pump(
    manager: &Arc<PortForwardManager>,
    stream_id: StreamId,
    channel_id: ChannelId,
    socket: TcpStream,
    write_channel: impl Fn(ChannelId, &[u8]) -> bool + Send + 'static,
    close_channel: impl FnOnce() + Send + 'static,
) -> bool {
    let rx = manager.register_pending(stream_id, channel_id);
    if rx.recv_timeout(OPEN_ACK_TIMEOUT).is_err() {
        manager.close(stream_id, channel_id);
        return false;
    }
    let Ok(cloned) = socket.try_clone() else {
        return false;
    };
    manager.register_socket(stream_id, channel_id, cloned);
    spawn_tcp_to_channel_pump(socket, stream_id, channel_id, write_channel, close_channel);
    true
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn pending_open_is_notified_exactly_once() {
        let mgr = PortForwardManager::new();
        let rx = mgr.register_pending(1, 7);
        mgr.notify_opened(1, 7);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn deliver_writes_to_registered_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (mut server_side, _) = listener.accept().unwrap();

        let mgr = PortForwardManager::new();
        mgr.register_socket(1, 1, client);
        mgr.deliver(1, 1, b"ping");

        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}
