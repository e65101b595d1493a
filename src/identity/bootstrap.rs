//! Static, process-wide bootstrap node table used to join the identity overlay.

use std::net::IpAddr;

use crate::identity::user_id::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapNode {
    pub host: IpAddr,
    pub port: u16,
    pub public_key: UserId,
}

impl BootstrapNode {
    #[must_use]
    pub fn new(host: IpAddr, port: u16, public_key: UserId) -> Self {
        Self {
            host,
            port,
            public_key,
        }
    }
}
