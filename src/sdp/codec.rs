//! Opaque session description blob: a compact line-oriented text format,
//! bounded to ≤4 KiB on the wire (spec §6).

use std::net::SocketAddr;

use crate::error::{CarrierError, ErrorKind, Facility};
use crate::ice::{Candidate, CandidateKind};
use crate::sdp::candidate_desc::CandidateDesc;
use crate::sdp::service_desc::ServiceRegistration;
use crate::sdp::stream_desc::StreamDescriptor;
use crate::stream::options::{StreamKind, StreamOptions};

pub const MAX_SDP_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<CandidateDesc>,
    /// Ordinal stream list; position is the matching key for the answer.
    pub streams: Vec<StreamDescriptor>,
    pub services: Vec<ServiceRegistration>,
}

impl SessionDescription {
    #[must_use]
    pub fn new(ufrag: String, pwd: String) -> Self {
        Self {
            ufrag,
            pwd,
            candidates: Vec::new(),
            streams: Vec::new(),
            services: Vec::new(),
        }
    }

    pub fn push_candidate(&mut self, c: Candidate) {
        self.candidates.push(CandidateDesc {
            addr: c.addr,
            priority: c.priority,
            kind: c.kind,
        });
    }

    pub fn serialize(&self) -> Result<Vec<u8>, CarrierError> {
        let mut out = String::new();
        out.push_str("v=1\n");
        out.push_str(&format!("u={}\n", self.ufrag));
        out.push_str(&format!("p={}\n", self.pwd));
        for c in &self.candidates {
            out.push_str(&format!("c={}:{}:{}\n", c.addr, c.priority, c.kind.to_wire()));
        }
        for s in &self.streams {
            out.push_str(&format!("s={}:{}\n", s.kind.to_wire(), s.options.to_bits()));
        }
        for svc in &self.services {
            out.push_str(&format!("f={}:{}:{}\n", svc.name, svc.host, svc.port));
        }
        if out.len() > MAX_SDP_LEN {
            return Err(CarrierError::with_context(
                Facility::Sdp,
                ErrorKind::TooLong,
                format!("sdp blob is {} bytes, max is {MAX_SDP_LEN}", out.len()),
            ));
        }
        Ok(out.into_bytes())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CarrierError> {
        if bytes.len() > MAX_SDP_LEN {
            return Err(CarrierError::with_context(
                Facility::Sdp,
                ErrorKind::TooLong,
                format!("sdp blob is {} bytes, max is {MAX_SDP_LEN}", bytes.len()),
            ));
        }
        let text = std::str::from_utf8(bytes).map_err(|e| {
            CarrierError::with_context(Facility::Sdp, ErrorKind::ProtocolError, e.to_string())
        })?;

        let mut ufrag = None;
        let mut pwd = None;
        let mut candidates = Vec::new();
        let mut streams = Vec::new();
        let mut services = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            let Some((tag, rest)) = line.split_once('=') else {
                continue;
            };
            match tag {
                "v" => {}
                "u" => ufrag = Some(rest.to_string()),
                "p" => pwd = Some(rest.to_string()),
                "c" => candidates.push(parse_candidate(rest)?),
                "s" => streams.push(parse_stream(rest)?),
                "f" => services.push(parse_service(rest)?),
                _ => {}
            }
        }

        let ufrag = ufrag.ok_or_else(|| {
            CarrierError::with_context(Facility::Sdp, ErrorKind::ProtocolError, "missing ufrag")
        })?;
        let pwd = pwd.ok_or_else(|| {
            CarrierError::with_context(Facility::Sdp, ErrorKind::ProtocolError, "missing pwd")
        })?;

        Ok(Self {
            ufrag,
            pwd,
            candidates,
            streams,
            services,
        })
    }
}

fn parse_candidate(rest: &str) -> Result<CandidateDesc, CarrierError> {
    let bad = || {
        CarrierError::with_context(Facility::Sdp, ErrorKind::ProtocolError, "malformed candidate line")
    };
    let mut parts = rest.rsplitn(3, ':');
    let kind_s = parts.next().ok_or_else(bad)?;
    let prio_s = parts.next().ok_or_else(bad)?;
    let addr_s = parts.next().ok_or_else(bad)?;
    let kind = kind_s
        .parse::<u8>()
        .ok()
        .and_then(CandidateKind::from_wire)
        .ok_or_else(bad)?;
    let priority = prio_s.parse::<u32>().map_err(|_| bad())?;
    let addr: SocketAddr = addr_s.parse().map_err(|_| bad())?;
    Ok(CandidateDesc { addr, priority, kind })
}

fn parse_stream(rest: &str) -> Result<StreamDescriptor, CarrierError> {
    let bad = || {
        CarrierError::with_context(Facility::Sdp, ErrorKind::ProtocolError, "malformed stream line")
    };
    let (kind_s, opts_s) = rest.split_once(':').ok_or_else(bad)?;
    let kind = kind_s
        .parse::<u8>()
        .ok()
        .and_then(StreamKind::from_wire)
        .ok_or_else(bad)?;
    let bits = opts_s.parse::<u8>().map_err(|_| bad())?;
    Ok(StreamDescriptor {
        kind,
        options: StreamOptions::from_bits(bits),
    })
}

fn parse_service(rest: &str) -> Result<ServiceRegistration, CarrierError> {
    let bad = || {
        CarrierError::with_context(Facility::Sdp, ErrorKind::ProtocolError, "malformed service line")
    };
    let mut parts = rest.rsplitn(3, ':');
    let port_s = parts.next().ok_or_else(bad)?;
    let host = parts.next().ok_or_else(bad)?.to_string();
    let name = parts.next().ok_or_else(bad)?.to_string();
    let port = port_s.parse::<u16>().map_err(|_| bad())?;
    Ok(ServiceRegistration { name, host, port })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn round_trips_a_full_description() {
        let mut sdp = SessionDescription::new("ufrag1234".into(), "pwd1234567890123456789012".into());
        sdp.push_candidate(Candidate::new("127.0.0.1:4000".parse().unwrap(), CandidateKind::Host));
        sdp.streams.push(StreamDescriptor {
            kind: StreamKind::Application,
            options: StreamOptions {
                reliable: true,
                plain: true,
                multiplexing: true,
                port_forwarding: true,
            },
        });
        sdp.services.push(ServiceRegistration {
            name: "echo".into(),
            host: "127.0.0.1".into(),
            port: 7,
        });

        let bytes = sdp.serialize().unwrap();
        let parsed = SessionDescription::parse(&bytes).unwrap();
        assert_eq!(parsed, sdp);
    }

    #[test]
    fn rejects_oversized_blob() {
        let mut sdp = SessionDescription::new("u".into(), "p".into());
        for _ in 0..2000 {
            sdp.services.push(ServiceRegistration {
                name: "x".repeat(20),
                host: "127.0.0.1".into(),
                port: 80,
            });
        }
        assert!(matches!(
            sdp.serialize().unwrap_err().kind,
            ErrorKind::TooLong
        ));
    }

    #[test]
    fn rejects_truncated_blob() {
        let err = SessionDescription::parse(b"v=1\nu=abc\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProtocolError);
    }
}
