//! Flex multiplexer (spec §4.5): frames streams, channels, and
//! port-forwarding services over one ICE datagram flow.
//!
//! Grounded on the four-thread `SctpSession` topology in `sctp::*` for the
//! *shape* of the design (router dispatching by id, a sender owning
//! retransmit state, a receiver doing reassembly) — not on real SCTP; this
//! is the core's own framing protocol per spec §6. Owned exclusively by the
//! ICE worker thread (spec §4.4/§5): no internal locking.

use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{ChannelId, ChannelIdAllocator, ChannelState, CloseReason, CONTROL_CHANNEL};
use crate::error::{CarrierError, ErrorKind, Facility};
use crate::fmp::crypto::{self, KEY_LEN};
use crate::fmp::frame::{AckPayload, Frame, FrameFlags, MAX_PAYLOAD};
use crate::fmp::reliability::{RecvBuffer, SendWindow};
use crate::stream::options::{StreamId, StreamOptions};

pub const MAX_COOKIE_LEN: usize = 256;
/// Spec §4.3: "a stream supports >= 128 concurrent channels."
pub const MAX_CHANNELS_PER_STREAM: usize = 128;

pub trait MuxCallbacks: Send + Sync {
    fn on_stream_data(&self, stream: StreamId, bytes: Vec<u8>);
    /// Returning `false` rejects the channel (spec §9 open question: closed
    /// with reason `Error`).
    fn on_channel_open_request(&self, stream: StreamId, channel: ChannelId, cookie: Vec<u8>) -> bool;
    fn on_channel_opened(&self, stream: StreamId, channel: ChannelId);
    fn on_channel_data(&self, stream: StreamId, channel: ChannelId, bytes: Vec<u8>);
    fn on_channel_close(&self, stream: StreamId, channel: ChannelId, reason: CloseReason);
    fn on_channel_pend(&self, stream: StreamId, channel: ChannelId, paused: bool);
}

struct Flow {
    send: SendWindow,
    recv: RecvBuffer,
    nonce_counter: u64,
}

impl Default for Flow {
    fn default() -> Self {
        Self {
            send: SendWindow::default(),
            recv: RecvBuffer::default(),
            nonce_counter: 0,
        }
    }
}

struct ChannelEntry {
    state: ChannelState,
    flow: Flow,
    closed_emitted: bool,
    opened_emitted: bool,
}

struct StreamEntry {
    options: StreamOptions,
    key: Option<[u8; KEY_LEN]>,
    control: Flow,
    channels: HashMap<ChannelId, ChannelEntry>,
    alloc: ChannelIdAllocator,
}

pub struct Multiplexer {
    streams: HashMap<StreamId, StreamEntry>,
    callbacks: Arc<dyn MuxCallbacks>,
}

impl Multiplexer {
    #[must_use]
    pub fn new(callbacks: Arc<dyn MuxCallbacks>) -> Self {
        Self {
            streams: HashMap::new(),
            callbacks,
        }
    }

    pub fn register_stream(&mut self, stream_id: StreamId, options: StreamOptions, ufrag: &str, pwd: &str) {
        let key = (!options.plain).then(|| crypto::derive_session_key(ufrag, pwd));
        self.streams.insert(
            stream_id,
            StreamEntry {
                options,
                key,
                control: Flow::default(),
                channels: HashMap::new(),
                alloc: ChannelIdAllocator::new(),
            },
        );
    }

    pub fn remove_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    fn encrypt_if_needed(
        key: Option<[u8; KEY_LEN]>,
        stream_id: StreamId,
        channel_id: ChannelId,
        flow: &mut Flow,
        payload: &mut [u8],
    ) {
        if let Some(key) = key {
            crypto::apply_keystream(&key, stream_id, channel_id, flow.nonce_counter, payload);
            flow.nonce_counter += 1;
        }
    }

    /// Non-reliable frames can arrive out of order or not at all, so the
    /// nonce counter travels with the packet (as an 8-byte plaintext prefix)
    /// instead of being tracked locally on both ends — a tracked counter
    /// would desync the moment a datagram is lost.
    fn encrypt_unreliable(
        key: [u8; KEY_LEN],
        stream_id: StreamId,
        channel_id: ChannelId,
        flow: &mut Flow,
        bytes: &[u8],
    ) -> Vec<u8> {
        let counter = flow.nonce_counter;
        flow.nonce_counter += 1;
        let mut out = Vec::with_capacity(8 + bytes.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(bytes);
        crypto::apply_keystream(&key, stream_id, channel_id, counter, &mut out[8..]);
        out
    }

    fn decrypt_unreliable(
        key: [u8; KEY_LEN],
        stream_id: StreamId,
        channel_id: ChannelId,
        payload: &[u8],
    ) -> Option<Vec<u8>> {
        if payload.len() < 8 {
            return None;
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&payload[..8]);
        let counter = u64::from_be_bytes(counter_bytes);
        let mut body = payload[8..].to_vec();
        crypto::apply_keystream(&key, stream_id, channel_id, counter, &mut body);
        Some(body)
    }

    /// Writes raw stream-wide bytes (channel 0). Returns the frames to send.
    pub fn write_stream(&mut self, stream_id: StreamId, bytes: &[u8]) -> Result<Vec<Vec<u8>>, CarrierError> {
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::WrongState))?;

        if !entry.options.reliable && bytes.len() > MAX_PAYLOAD {
            return Err(CarrierError::with_context(
                Facility::Fmp,
                ErrorKind::TooLong,
                "datagram exceeds MTU for a non-reliable stream",
            ));
        }
        if entry.options.reliable && entry.control.send.is_full() {
            return Err(CarrierError::new(Facility::Fmp, ErrorKind::Busy));
        }

        let mut frames = Vec::new();
        let chunks: Vec<&[u8]> = if entry.options.reliable {
            bytes.chunks(MAX_PAYLOAD).collect()
        } else {
            vec![bytes]
        };
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut payload = chunk.to_vec();
            let flags_base = if entry.options.reliable { FrameFlags::RELIABLE } else { 0 };
            let flags = if entry.options.reliable && i != last {
                flags_base | FrameFlags::FRAG
            } else {
                flags_base
            };
            let seq = if entry.options.reliable {
                let s = entry.control.send.next_seq;
                entry.control.send.next_seq += 1;
                s
            } else {
                0
            };
            if entry.options.reliable {
                Self::encrypt_if_needed(entry.key, stream_id, CONTROL_CHANNEL, &mut entry.control, &mut payload);
            } else if let Some(key) = entry.key {
                payload = Self::encrypt_unreliable(key, stream_id, CONTROL_CHANNEL, &mut entry.control, &payload);
            }
            let frame = Frame::data(flags, stream_id, CONTROL_CHANNEL, seq, payload);
            let encoded = frame
                .encode()
                .map_err(|e| CarrierError::with_context(Facility::Fmp, ErrorKind::ProtocolError, e.to_string()))?;
            if entry.options.reliable {
                entry.control.send.track(seq, encoded.clone());
            }
            frames.push(encoded);
        }
        Ok(frames)
    }

    pub fn open_channel(&mut self, stream_id: StreamId, cookie: &[u8]) -> Result<(ChannelId, Vec<u8>), CarrierError> {
        if cookie.len() > MAX_COOKIE_LEN {
            return Err(CarrierError::new(Facility::Fmp, ErrorKind::TooLong));
        }
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::WrongState))?;
        if !entry.options.multiplexing {
            return Err(CarrierError::new(Facility::Fmp, ErrorKind::WrongState));
        }
        if entry.channels.len() >= MAX_CHANNELS_PER_STREAM {
            return Err(CarrierError::new(Facility::Fmp, ErrorKind::LimitExceeded));
        }
        let channel_id = entry
            .alloc
            .allocate()
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::LimitExceeded))?;
        entry.channels.insert(
            channel_id,
            ChannelEntry {
                state: ChannelState::Opening,
                flow: Flow::default(),
                closed_emitted: false,
                opened_emitted: false,
            },
        );
        let frame = Frame {
            flags: FrameFlags(FrameFlags::SYN),
            stream_id,
            channel_id,
            seq: 0,
            payload: cookie.to_vec(),
        };
        let encoded = frame
            .encode()
            .map_err(|e| CarrierError::with_context(Facility::Fmp, ErrorKind::ProtocolError, e.to_string()))?;
        Ok((channel_id, encoded))
    }

    pub fn write_channel(
        &mut self,
        stream_id: StreamId,
        channel_id: ChannelId,
        bytes: &[u8],
    ) -> Result<Vec<Vec<u8>>, CarrierError> {
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::WrongState))?;
        let reliable = entry.options.reliable;
        let key = entry.key;
        let chan = entry
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::NotExist))?;
        if !chan.state.can_send_data() {
            return Err(CarrierError::new(Facility::Fmp, ErrorKind::WrongState));
        }
        if reliable && chan.flow.send.is_full() {
            return Err(CarrierError::new(Facility::Fmp, ErrorKind::Busy));
        }

        let mut frames = Vec::new();
        let chunks: Vec<&[u8]> = if reliable { bytes.chunks(MAX_PAYLOAD).collect() } else { vec![bytes] };
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut payload = chunk.to_vec();
            let flags_base = if reliable { FrameFlags::RELIABLE } else { 0 };
            let flags = if reliable && i != last { flags_base | FrameFlags::FRAG } else { flags_base };
            let seq = if reliable {
                let s = chan.flow.send.next_seq;
                chan.flow.send.next_seq += 1;
                s
            } else {
                0
            };
            if let Some(key) = key {
                if reliable {
                    crypto::apply_keystream(&key, stream_id, channel_id, chan.flow.nonce_counter, &mut payload);
                    chan.flow.nonce_counter += 1;
                } else {
                    payload = Self::encrypt_unreliable(key, stream_id, channel_id, &mut chan.flow, &payload);
                }
            }
            let frame = Frame::data(flags, stream_id, channel_id, seq, payload);
            let encoded = frame
                .encode()
                .map_err(|e| CarrierError::with_context(Facility::Fmp, ErrorKind::ProtocolError, e.to_string()))?;
            if reliable {
                chan.flow.send.track(seq, encoded.clone());
            }
            frames.push(encoded);
        }
        Ok(frames)
    }

    pub fn close_channel(&mut self, stream_id: StreamId, channel_id: ChannelId) -> Result<Vec<u8>, CarrierError> {
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::WrongState))?;
        let chan = entry
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::NotExist))?;
        chan.state = ChannelState::Closing;
        let frame = Frame::control(FrameFlags::FIN, stream_id, channel_id);
        frame
            .encode()
            .map_err(|e| CarrierError::with_context(Facility::Fmp, ErrorKind::ProtocolError, e.to_string()))
    }

    fn set_pend(&mut self, stream_id: StreamId, channel_id: ChannelId, pend: bool) -> Result<Vec<u8>, CarrierError> {
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::WrongState))?;
        let chan = entry
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| CarrierError::new(Facility::Fmp, ErrorKind::NotExist))?;
        chan.state = if pend { ChannelState::LocalPending } else { ChannelState::Open };
        let flag = if pend { FrameFlags::PEND } else { FrameFlags::RSUM };
        Frame::control(flag, stream_id, channel_id)
            .encode()
            .map_err(|e| CarrierError::with_context(Facility::Fmp, ErrorKind::ProtocolError, e.to_string()))
    }

    pub fn pend_channel(&mut self, stream_id: StreamId, channel_id: ChannelId) -> Result<Vec<u8>, CarrierError> {
        self.set_pend(stream_id, channel_id, true)
    }

    pub fn resume_channel(&mut self, stream_id: StreamId, channel_id: ChannelId) -> Result<Vec<u8>, CarrierError> {
        self.set_pend(stream_id, channel_id, false)
    }

    /// Periodic maintenance: returns retransmit frames due, and `(stream,
    /// channel)` pairs whose retransmit limit was exceeded (caller should
    /// fail the stream/channel per spec §7).
    pub fn retransmit_due(&mut self) -> (Vec<Vec<u8>>, Vec<(StreamId, Option<ChannelId>)>) {
        let mut out = Vec::new();
        let mut failed = Vec::new();
        for (&stream_id, entry) in &mut self.streams {
            if entry.options.reliable {
                let (resend, exhausted) = entry.control.send.due_for_retransmit();
                out.extend(resend.into_iter().map(|(_, bytes)| bytes));
                if !exhausted.is_empty() {
                    failed.push((stream_id, None));
                }
            }
            for (&channel_id, chan) in &mut entry.channels {
                let (resend, exhausted) = chan.flow.send.due_for_retransmit();
                out.extend(resend.into_iter().map(|(_, bytes)| bytes));
                if !exhausted.is_empty() {
                    failed.push((stream_id, Some(channel_id)));
                }
            }
        }
        (out, failed)
    }

    /// Processes one inbound datagram. Returns frames that must be sent
    /// back (acks, SYN-ACK/FIN replies); invokes callbacks inline.
    pub fn on_datagram(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let Ok(frame) = Frame::decode(bytes) else {
            return Vec::new();
        };
        let stream_id = frame.stream_id;
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return Vec::new();
        };

        if frame.channel_id == CONTROL_CHANNEL {
            return Self::handle_control_channel_frame(entry, stream_id, frame, &self.callbacks);
        }
        Self::handle_channel_frame(entry, stream_id, frame, &self.callbacks)
    }

    fn handle_control_channel_frame(
        entry: &mut StreamEntry,
        stream_id: StreamId,
        frame: Frame,
        callbacks: &Arc<dyn MuxCallbacks>,
    ) -> Vec<Vec<u8>> {
        if frame.flags.has(FrameFlags::ACK) {
            if let Ok(ack) = AckPayload::decode(&frame.payload) {
                let sample = entry.control.send.apply_ack(ack.cumulative, ack.bitmap);
                if let Some(rtt) = sample {
                    entry.control.send.rtt.sample(rtt);
                }
            }
            return Vec::new();
        }
        if !frame.flags.has(FrameFlags::DATA) {
            return Vec::new();
        }

        let mut out = Vec::new();
        let key = entry.key;
        if entry.options.reliable {
            let mut payload = frame.payload;
            if let Some(key) = key {
                crypto::apply_keystream(&key, stream_id, CONTROL_CHANNEL, frame.seq.into(), &mut payload);
            }
            for delivered in entry.control.recv.accept(frame.seq, payload) {
                callbacks.on_stream_data(stream_id, delivered);
            }
            let (cumulative, bitmap) = entry.control.recv.ack();
            let ack = AckPayload { cumulative, bitmap }.encode();
            let ack_frame = Frame {
                flags: FrameFlags(FrameFlags::ACK | FrameFlags::RELIABLE),
                stream_id,
                channel_id: CONTROL_CHANNEL,
                seq: 0,
                payload: ack,
            };
            if let Ok(encoded) = ack_frame.encode() {
                out.push(encoded);
            }
        } else {
            let payload = match key {
                Some(key) => match Self::decrypt_unreliable(key, stream_id, CONTROL_CHANNEL, &frame.payload) {
                    Some(p) => p,
                    None => return out,
                },
                None => frame.payload,
            };
            callbacks.on_stream_data(stream_id, payload);
        }
        out
    }

    fn handle_channel_frame(
        entry: &mut StreamEntry,
        stream_id: StreamId,
        frame: Frame,
        callbacks: &Arc<dyn MuxCallbacks>,
    ) -> Vec<Vec<u8>> {
        let channel_id = frame.channel_id;

        if frame.flags.has(FrameFlags::SYN) && !frame.flags.has(FrameFlags::ACK) {
            // Inbound open request.
            if frame.payload.len() > MAX_COOKIE_LEN {
                return Frame::control(FrameFlags::FIN, stream_id, channel_id)
                    .encode()
                    .map(|e| vec![e])
                    .unwrap_or_default();
            }
            let accept = callbacks.on_channel_open_request(stream_id, channel_id, frame.payload.clone());
            return if accept {
                entry.channels.insert(
                    channel_id,
                    ChannelEntry {
                        state: ChannelState::Open,
                        flow: Flow::default(),
                        closed_emitted: false,
                        opened_emitted: true,
                    },
                );
                callbacks.on_channel_opened(stream_id, channel_id);
                Frame::control(FrameFlags::SYN | FrameFlags::ACK, stream_id, channel_id)
                    .encode()
                    .map(|e| vec![e])
                    .unwrap_or_default()
            } else {
                callbacks.on_channel_close(stream_id, channel_id, CloseReason::Error);
                Frame::control(FrameFlags::FIN, stream_id, channel_id)
                    .encode()
                    .map(|e| vec![e])
                    .unwrap_or_default()
            };
        }

        let key = entry.key;
        let Some(chan) = entry.channels.get_mut(&channel_id) else {
            return Vec::new();
        };

        if frame.flags.has(FrameFlags::SYN) && frame.flags.has(FrameFlags::ACK) {
            chan.state = ChannelState::Open;
            if !chan.opened_emitted {
                chan.opened_emitted = true;
                callbacks.on_channel_opened(stream_id, channel_id);
            }
            return Vec::new();
        }

        if frame.flags.has(FrameFlags::FIN) {
            let was_open = chan.state != ChannelState::Closed;
            chan.state = ChannelState::Closed;
            if !chan.closed_emitted {
                chan.closed_emitted = true;
                callbacks.on_channel_close(stream_id, channel_id, CloseReason::Normal);
            }
            return if was_open {
                Frame::control(FrameFlags::FIN, stream_id, channel_id)
                    .encode()
                    .map(|e| vec![e])
                    .unwrap_or_default()
            } else {
                Vec::new()
            };
        }

        if frame.flags.has(FrameFlags::PEND) {
            chan.state = ChannelState::RemotePending;
            callbacks.on_channel_pend(stream_id, channel_id, true);
            return Vec::new();
        }
        if frame.flags.has(FrameFlags::RSUM) {
            chan.state = ChannelState::Open;
            callbacks.on_channel_pend(stream_id, channel_id, false);
            return Vec::new();
        }

        if frame.flags.has(FrameFlags::ACK) {
            if let Ok(ack) = AckPayload::decode(&frame.payload) {
                let sample = chan.flow.send.apply_ack(ack.cumulative, ack.bitmap);
                if let Some(rtt) = sample {
                    chan.flow.send.rtt.sample(rtt);
                }
            }
            return Vec::new();
        }

        if !frame.flags.has(FrameFlags::DATA) {
            return Vec::new();
        }

        let reliable = frame.flags.has(FrameFlags::RELIABLE);
        let mut out = Vec::new();
        if reliable {
            let mut payload = frame.payload;
            if let Some(key) = key {
                // Sender's nonce counter and sequence number advance in lockstep
                // for a reliable flow, so the sequence number doubles as the nonce.
                crypto::apply_keystream(&key, stream_id, channel_id, frame.seq.into(), &mut payload);
            }
            for delivered in chan.flow.recv.accept(frame.seq, payload) {
                callbacks.on_channel_data(stream_id, channel_id, delivered);
            }
            let (cumulative, bitmap) = chan.flow.recv.ack();
            let ack = AckPayload { cumulative, bitmap }.encode();
            if let Ok(encoded) = (Frame {
                flags: FrameFlags(FrameFlags::ACK | FrameFlags::RELIABLE),
                stream_id,
                channel_id,
                seq: 0,
                payload: ack,
            })
            .encode()
            {
                out.push(encoded);
            }
        } else {
            let payload = match key {
                Some(key) => match Self::decrypt_unreliable(key, stream_id, channel_id, &frame.payload) {
                    Some(p) => p,
                    None => return out,
                },
                None => frame.payload,
            };
            callbacks.on_channel_data(stream_id, channel_id, payload);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCallbacks {
        data: Mutex<Vec<Vec<u8>>>,
        channel_data: Mutex<Vec<(ChannelId, Vec<u8>)>>,
        opened: Mutex<Vec<ChannelId>>,
        closed: Mutex<Vec<(ChannelId, CloseReason)>>,
        accept_channels: bool,
    }

    impl MuxCallbacks for RecordingCallbacks {
        fn on_stream_data(&self, _stream: StreamId, bytes: Vec<u8>) {
            self.data.lock().unwrap().push(bytes);
        }
        fn on_channel_open_request(&self, _stream: StreamId, _channel: ChannelId, _cookie: Vec<u8>) -> bool {
            self.accept_channels
        }
        fn on_channel_opened(&self, _stream: StreamId, channel: ChannelId) {
            self.opened.lock().unwrap().push(channel);
        }
        fn on_channel_data(&self, _stream: StreamId, channel: ChannelId, bytes: Vec<u8>) {
            self.channel_data.lock().unwrap().push((channel, bytes));
        }
        fn on_channel_close(&self, _stream: StreamId, channel: ChannelId, reason: CloseReason) {
            self.closed.lock().unwrap().push((channel, reason));
        }
        fn on_channel_pend(&self, _stream: StreamId, _channel: ChannelId, _paused: bool) {}
    }

    fn reliable_plain_opts() -> StreamOptions {
        StreamOptions { reliable: true, plain: true, multiplexing: false, port_forwarding: false }
    }

    #[test]
    fn plain_reliable_stream_delivers_bytes_in_order() {
        let cb_a = Arc::new(RecordingCallbacks::default());
        let cb_b = Arc::new(RecordingCallbacks { accept_channels: true, ..Default::default() });
        let mut a = Multiplexer::new(cb_a);
        let mut b = Multiplexer::new(cb_b.clone());
        a.register_stream(1, reliable_plain_opts(), "u", "p");
        b.register_stream(1, reliable_plain_opts(), "u", "p");

        let frames = a.write_stream(1, b"Hello,World!").unwrap();
        for f in frames {
            let acks = b.on_datagram(&f);
            for ack in acks {
                let _ = a.on_datagram(&ack);
            }
        }
        let received = cb_b.data.lock().unwrap();
        assert_eq!(received.concat(), b"Hello,World!");
    }

    #[test]
    fn multiplexed_channel_open_data_close_round_trips() {
        let cb_a = Arc::new(RecordingCallbacks::default());
        let cb_b = Arc::new(RecordingCallbacks { accept_channels: true, ..Default::default() });
        let mux_opts = StreamOptions { reliable: true, plain: true, multiplexing: true, port_forwarding: false };
        let mut a = Multiplexer::new(cb_a.clone());
        let mut b = Multiplexer::new(cb_b.clone());
        a.register_stream(2, mux_opts, "u", "p");
        b.register_stream(2, mux_opts, "u", "p");

        let (channel_id, syn) = a.open_channel(2, b"cookie").unwrap();
        let syn_ack = b.on_datagram(&syn);
        assert_eq!(cb_b.opened.lock().unwrap().as_slice(), [channel_id]);
        for f in syn_ack {
            let empty = a.on_datagram(&f);
            assert!(empty.is_empty());
        }
        assert_eq!(cb_a.opened.lock().unwrap().as_slice(), [channel_id]);

        let data_frames = a.write_channel(2, channel_id, &vec![7u8; 3000]).unwrap();
        for f in data_frames {
            for ack in b.on_datagram(&f) {
                a.on_datagram(&ack);
            }
        }
        let received = cb_b.channel_data.lock().unwrap();
        let total: Vec<u8> = received.iter().flat_map(|(_, b)| b.clone()).collect();
        assert_eq!(total.len(), 3000);

        let fin = a.close_channel(2, channel_id).unwrap();
        let fin_back = b.on_datagram(&fin);
        assert_eq!(cb_b.closed.lock().unwrap()[0], (channel_id, CloseReason::Normal));
        for f in fin_back {
            a.on_datagram(&f);
        }
        assert_eq!(cb_a.closed.lock().unwrap()[0], (channel_id, CloseReason::Normal));
    }

    #[test]
    fn rejected_channel_closes_with_error() {
        let cb_a = Arc::new(RecordingCallbacks::default());
        let cb_b = Arc::new(RecordingCallbacks { accept_channels: false, ..Default::default() });
        let mux_opts = StreamOptions { reliable: true, plain: true, multiplexing: true, port_forwarding: false };
        let mut a = Multiplexer::new(cb_a);
        let mut b = Multiplexer::new(cb_b.clone());
        a.register_stream(3, mux_opts, "u", "p");
        b.register_stream(3, mux_opts, "u", "p");

        let (channel_id, syn) = a.open_channel(3, b"cookie").unwrap();
        b.on_datagram(&syn);
        assert_eq!(cb_b.closed.lock().unwrap()[0], (channel_id, CloseReason::Error));
    }

    #[test]
    fn cookie_over_256_bytes_is_too_long() {
        let cb = Arc::new(RecordingCallbacks::default());
        let mux_opts = StreamOptions { reliable: true, plain: true, multiplexing: true, port_forwarding: false };
        let mut a = Multiplexer::new(cb);
        a.register_stream(4, mux_opts, "u", "p");
        let err = a.open_channel(4, &vec![0u8; 257]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TooLong);
    }
}
