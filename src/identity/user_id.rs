//! Long-lived public identity: a 32-byte public key, rendered base58.
//!
//! Grounded on `original_source/src/carrier/dht/dht.h` (`DHT_PUBLIC_KEY_SIZE`).

use std::fmt;

use crate::error::{CarrierError, ErrorKind, Facility};

pub const USER_ID_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId([u8; USER_ID_LEN]);

impl UserId {
    #[must_use]
    pub fn from_bytes(bytes: [u8; USER_ID_LEN]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; USER_ID_LEN] {
        &self.0
    }

    pub fn from_base58(s: &str) -> Result<Self, CarrierError> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| CarrierError::with_context(Facility::Identity, ErrorKind::BadAddress, e.to_string()))?;
        let bytes: [u8; USER_ID_LEN] = decoded.try_into().map_err(|_| {
            CarrierError::with_context(
                Facility::Identity,
                ErrorKind::BadAddress,
                "user id must decode to 32 bytes",
            )
        })?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.to_base58())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn round_trips_through_base58() {
        let id = UserId::from_bytes([7u8; USER_ID_LEN]);
        let encoded = id.to_base58();
        let decoded = UserId::from_base58(&encoded).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn rejects_wrong_length() {
        let short = bs58::encode([1u8, 2, 3]).into_string();
        assert!(UserId::from_base58(&short).is_err());
    }
}
