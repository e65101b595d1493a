//! Per-stream payload encryption (spec §4.5 "Plain vs. encrypted").
//!
//! Grounded on the AES-128-CTR + HMAC key-derivation shape in
//! `srtp::utils` (same cipher family, same "derive then counter-mode"
//! structure), generalized from SRTP's master-key/salt pair to FMP's
//! session key derived from the two peers' shared ICE credentials.
//! Headers are never encrypted, only payloads; `plain` streams skip this
//! entirely (spec's documented diagnostic mode).

use aes::Aes128;
use aes::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 16;

/// Derives a 16-byte AES key from the session's ufrag+pwd, which both peers
/// already share identically after the SDP exchange (spec §4.2).
#[must_use]
pub fn derive_session_key(ufrag: &str, pwd: &str) -> [u8; KEY_LEN] {
    // HMAC accepts keys of any length, so this never fails.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(pwd.as_bytes()).expect("hmac accepts any key length");
    mac.update(b"carrier-fmp-session-key");
    mac.update(ufrag.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&digest[..KEY_LEN]);
    key
}

/// Builds a 16-byte counter-mode IV from the stream id, channel id, and a
/// per-flow monotonic counter, the way `srtp::utils::compute_iv` folds an
/// index into a salt. `(stream_id, channel_id, counter)` is unique for the
/// lifetime of a session, so the keystream is never reused.
#[must_use]
pub fn counter_iv(stream_id: u8, channel_id: u16, counter: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0] = stream_id;
    iv[1..3].copy_from_slice(&channel_id.to_be_bytes());
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// In-place AES-128-CTR over `data`; encryption and decryption are the same
/// operation for a stream cipher.
pub fn apply_keystream(key: &[u8; KEY_LEN], stream_id: u8, channel_id: u16, counter: u64, data: &mut [u8]) {
    let iv = counter_iv(stream_id, channel_id, counter);
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_recovers_plaintext() {
        let key = derive_session_key("ufrag", "pwd01234567890123456789012");
        let mut buf = b"Hello,World!".to_vec();
        let original = buf.clone();
        apply_keystream(&key, 3, 1, 7, &mut buf);
        assert_ne!(buf, original);
        apply_keystream(&key, 3, 1, 7, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn different_counters_give_different_keystreams() {
        let key = derive_session_key("ufrag", "pwd");
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        apply_keystream(&key, 1, 1, 0, &mut a);
        apply_keystream(&key, 1, 1, 1, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn same_ufrag_pwd_derive_identical_key_on_both_sides() {
        let a = derive_session_key("sharedufrag", "sharedpwd");
        let b = derive_session_key("sharedufrag", "sharedpwd");
        assert_eq!(a, b);
    }
}
