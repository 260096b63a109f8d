//! Cryptography for the record protocol
//!
//! Per-stream keys are derived from the configured pre-shared key with
//! HKDF-SHA256 so that every tunnel stream seals under a distinct key.
//! The AEAD is ChaCha20-Poly1305 with a 12-byte nonce and 16-byte tag.

use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

/// Nonce size for the AEAD (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Tag size for the AEAD (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Stream key size (ChaCha20-Poly1305)
pub const KEY_SIZE: usize = 32;

/// Salt for per-stream key derivation
const KDF_SALT: &[u8] = b"aether-v1";

/// Derive the 32-byte key for one tunnel stream.
///
/// `key = HKDF-SHA256(ikm = psk, salt = "aether-v1", info = stream_id BE)`
pub fn derive_stream_key(psk: &str, stream_id: u64) -> Result<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), psk.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(&stream_id.to_be_bytes(), &mut okm)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Build the AEAD cipher for one stream.
pub fn stream_cipher(psk: &str, stream_id: u64) -> Result<ChaCha20Poly1305> {
    let key = derive_stream_key(psk, stream_id)?;
    ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))
}

/// Draw a random IV. The all-zero IV is redrawn.
pub fn random_iv() -> [u8; NONCE_SIZE] {
    let mut iv = [0u8; NONCE_SIZE];
    loop {
        rand::thread_rng().fill_bytes(&mut iv);
        if iv != [0u8; NONCE_SIZE] {
            return iv;
        }
    }
}

/// Fill a buffer with random bytes (padding content).
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_stream_key() {
        let k1 = derive_stream_key("secret", 1).unwrap();
        let k2 = derive_stream_key("secret", 2).unwrap();
        let k1_again = derive_stream_key("secret", 1).unwrap();
        assert_eq!(k1, k1_again);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_derive_distinct_psk() {
        let k1 = derive_stream_key("secret", 1).unwrap();
        let k2 = derive_stream_key("other", 1).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_random_iv_nonzero() {
        let iv = random_iv();
        assert_ne!(iv, [0u8; NONCE_SIZE]);
    }
}
