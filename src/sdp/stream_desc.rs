use crate::stream::options::{StreamKind, StreamOptions};

/// One ordinal entry in the SDP stream list (spec §4.2 "SDP discipline").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub options: StreamOptions,
}
