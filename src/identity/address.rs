//! Shareable address: `UserId` + 4-byte nospam + 2-byte checksum.
//!
//! Grounded on `original_source/src/carrier/dht/dht.h`
//! (`DHT_ADDRESS_SIZE = DHT_PUBLIC_KEY_SIZE + sizeof(uint32_t) + sizeof(uint16_t)`).
//! The checksum is the XOR-fold of the id+nospam bytes taken two at a time,
//! matching the original's address checksum scheme.

use std::fmt;

use crate::error::{CarrierError, ErrorKind, Facility};
use crate::identity::user_id::{USER_ID_LEN, UserId};

pub const ADDRESS_LEN: usize = USER_ID_LEN + 4 + 2;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    user_id: UserId,
    nospam: [u8; 4],
}

impl Address {
    #[must_use]
    pub fn new(user_id: UserId, nospam: [u8; 4]) -> Self {
        Self { user_id, nospam }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    #[must_use]
    pub fn nospam(&self) -> [u8; 4] {
        self.nospam
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; ADDRESS_LEN] {
        let mut buf = [0u8; ADDRESS_LEN];
        buf[..USER_ID_LEN].copy_from_slice(self.user_id.as_bytes());
        buf[USER_ID_LEN..USER_ID_LEN + 4].copy_from_slice(&self.nospam);
        let checksum = checksum(&buf[..USER_ID_LEN + 4]);
        buf[USER_ID_LEN + 4..].copy_from_slice(&checksum);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CarrierError> {
        if bytes.len() != ADDRESS_LEN {
            return Err(CarrierError::with_context(
                Facility::Identity,
                ErrorKind::BadAddress,
                format!("address must be {ADDRESS_LEN} bytes, got {}", bytes.len()),
            ));
        }
        let expected = checksum(&bytes[..USER_ID_LEN + 4]);
        if bytes[USER_ID_LEN + 4..] != expected {
            return Err(CarrierError::with_context(
                Facility::Identity,
                ErrorKind::BadAddress,
                "address checksum mismatch",
            ));
        }
        let mut id_bytes = [0u8; USER_ID_LEN];
        id_bytes.copy_from_slice(&bytes[..USER_ID_LEN]);
        let mut nospam = [0u8; 4];
        nospam.copy_from_slice(&bytes[USER_ID_LEN..USER_ID_LEN + 4]);
        Ok(Self {
            user_id: UserId::from_bytes(id_bytes),
            nospam,
        })
    }

    pub fn from_base58(s: &str) -> Result<Self, CarrierError> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| CarrierError::with_context(Facility::Identity, ErrorKind::BadAddress, e.to_string()))?;
        Self::from_bytes(&decoded)
    }

    #[must_use]
    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_base58())
    }
}

fn checksum(data: &[u8]) -> [u8; 2] {
    let mut out = [0u8; 2];
    for (i, b) in data.iter().enumerate() {
        out[i % 2] ^= b;
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let addr = Address::new(UserId::from_bytes([3u8; USER_ID_LEN]), [9, 8, 7, 6]);
        let bytes = addr.to_bytes();
        let parsed = Address::from_bytes(&bytes).unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn round_trips_through_base58() {
        let addr = Address::new(UserId::from_bytes([1u8; USER_ID_LEN]), [0, 0, 0, 1]);
        let encoded = addr.to_base58();
        let parsed = Address::from_base58(&encoded).unwrap();
        assert_eq!(addr, parsed);
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let addr = Address::new(UserId::from_bytes([2u8; USER_ID_LEN]), [1, 2, 3, 4]);
        let mut bytes = addr.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(Address::from_bytes(&bytes).is_err());
    }
}
