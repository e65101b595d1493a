//! FMP wire frame: one per ICE datagram (spec §4.5, §6).
//!
//! ```text
//! 1 byte  flags   (SYN|FIN|DATA|ACK|PEND|RSUM|FRAG|RELIABLE)
//! 1 byte  stream id
//! 2 bytes channel id (0 = stream-wide control)
//! 4 bytes sequence number (reliable only; 0 on unreliable)
//! 2 bytes payload length
//! payload (up to MTU - header)
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use crate::channel::ChannelId;
use crate::stream::options::StreamId;

pub const HEADER_LEN: usize = 1 + 1 + 2 + 4 + 2;
/// Conservative UDP MTU budget; payloads above this are fragmented.
pub const MTU: usize = 1200;
pub const MAX_PAYLOAD: usize = MTU - HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(pub u8);

impl FrameFlags {
    pub const SYN: u8 = 0x01;
    pub const FIN: u8 = 0x02;
    pub const DATA: u8 = 0x04;
    pub const ACK: u8 = 0x08;
    pub const PEND: u8 = 0x10;
    pub const RSUM: u8 = 0x20;
    pub const FRAG: u8 = 0x40;
    pub const RELIABLE: u8 = 0x80;

    #[must_use]
    pub const fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    #[must_use]
    pub const fn with(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: FrameFlags,
    pub stream_id: StreamId,
    pub channel_id: ChannelId,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn control(flags: u8, stream_id: StreamId, channel_id: ChannelId) -> Self {
        Self {
            flags: FrameFlags(flags),
            stream_id,
            channel_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    #[must_use]
    pub fn data(
        flags: u8,
        stream_id: StreamId,
        channel_id: ChannelId,
        seq: u32,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            flags: FrameFlags(flags | FrameFlags::DATA),
            stream_id,
            channel_id,
            seq,
            payload,
        }
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.write_u8(self.flags.0)?;
        buf.write_u8(self.stream_id)?;
        buf.write_u16::<BigEndian>(self.channel_id)?;
        buf.write_u32::<BigEndian>(self.seq)?;
        #[allow(clippy::cast_possible_truncation)]
        buf.write_u16::<BigEndian>(self.payload.len() as u16)?;
        buf.write_all(&self.payload)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(bytes);
        let flags = cur.read_u8()?;
        let stream_id = cur.read_u8()?;
        let channel_id = cur.read_u16::<BigEndian>()?;
        let seq = cur.read_u32::<BigEndian>()?;
        let len = cur.read_u16::<BigEndian>()? as usize;
        let mut payload = vec![0u8; len];
        cur.read_exact(&mut payload)?;
        Ok(Self {
            flags: FrameFlags(flags),
            stream_id,
            channel_id,
            seq,
            payload,
        })
    }
}

/// Cumulative-ack + 32-bit selective bitmap, carried as an ACK frame's
/// payload (spec §4.5 "ACKs are cumulative plus a selective bitmap").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub cumulative: u32,
    pub bitmap: u32,
}

impl AckPayload {
    #[must_use]
    pub fn encode(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        let _ = buf.write_u32::<BigEndian>(self.cumulative);
        let _ = buf.write_u32::<BigEndian>(self.bitmap);
        buf
    }

    pub fn decode(bytes: &[u8]) -> io::Result<Self> {
        let mut cur = Cursor::new(bytes);
        let cumulative = cur.read_u32::<BigEndian>()?;
        let bitmap = cur.read_u32::<BigEndian>()?;
        Ok(Self { cumulative, bitmap })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn frame_round_trips() {
        let f = Frame::data(FrameFlags::RELIABLE, 3, 7, 42, b"hello".to_vec());
        let bytes = f.encode().unwrap();
        let back = Frame::decode(&bytes).unwrap();
        assert_eq!(f, back);
    }

    #[test]
    fn control_frame_has_empty_payload() {
        let f = Frame::control(FrameFlags::SYN, 1, 5);
        assert!(f.payload.is_empty());
        assert!(f.flags.has(FrameFlags::SYN));
        assert!(!f.flags.has(FrameFlags::FIN));
    }

    #[test]
    fn ack_payload_round_trips() {
        let ack = AckPayload { cumulative: 10, bitmap: 0b1011 };
        let back = AckPayload::decode(&ack.encode()).unwrap();
        assert_eq!(ack, back);
    }
}
