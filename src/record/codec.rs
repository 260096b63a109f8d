//! Record sealing and opening
//!
//! A `RecordCodec` is bound to one tunnel stream: it holds the cipher for
//! the stream's derived key and turns plaintext into wire frames and back.
//! The codec owns no I/O.

use std::time::Instant;

use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::Rng;

use crate::crypto::{self, NONCE_SIZE};
use crate::error::{Error, Result};

use super::replay::ReplayCache;
use super::{
    code, encode_error_payload, MetadataPayload, Record, RecordType, AEAD_TAG_LEN, HEADER_LEN,
    MAX_RECORD_LEN,
};

/// Seals and opens records for a single tunnel stream.
pub struct RecordCodec {
    cipher: ChaCha20Poly1305,
    stream_id: u64,
}

impl RecordCodec {
    /// Create a codec for the given stream, deriving the stream key from the
    /// pre-shared key.
    pub fn new(psk: &str, stream_id: u64) -> Result<Self> {
        Ok(Self {
            cipher: crypto::stream_cipher(psk, stream_id)?,
            stream_id,
        })
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Build a complete wire frame (length prefix included) for the given
    /// plaintext. Padding length is drawn uniformly from `[0, max_padding]`.
    pub fn seal(&self, kind: RecordType, plaintext: &[u8], max_padding: u16) -> Result<Vec<u8>> {
        let iv = crypto::random_iv();
        let padding_len: u16 = rand::thread_rng().gen_range(0..=max_padding);
        let payload_len = plaintext.len() + AEAD_TAG_LEN;

        let mut header = [0u8; HEADER_LEN];
        header[0] = kind as u8;
        header[4..8].copy_from_slice(&(payload_len as u32).to_be_bytes());
        header[8..12].copy_from_slice(&(padding_len as u32).to_be_bytes());
        header[12..24].copy_from_slice(&iv);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| Error::Crypto(format!("seal failed: {}", e)))?;

        let total_len = HEADER_LEN + payload_len + padding_len as usize;
        let mut frame = Vec::with_capacity(4 + total_len);
        frame.extend_from_slice(&(total_len as u32).to_be_bytes());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&ciphertext);
        frame.extend_from_slice(&crypto::random_bytes(padding_len as usize));
        Ok(frame)
    }

    /// Seal the stream's Metadata record.
    pub fn seal_metadata(&self, meta: &MetadataPayload) -> Result<Vec<u8>> {
        self.seal(
            RecordType::Metadata,
            &meta.encode()?,
            meta.options.max_padding,
        )
    }

    /// Seal an Error record. Errors are not padded.
    pub fn seal_error(&self, code: u16, message: &str) -> Result<Vec<u8>> {
        self.seal(RecordType::Error, &encode_error_payload(code, message), 0)
    }

    /// Parse and decrypt one frame body (the bytes after the length prefix).
    ///
    /// The replay cache, when given, is consulted before the AEAD open; a
    /// fresh IV is recorded whether or not decryption then succeeds.
    pub fn open(&self, frame: &[u8], replay: Option<&ReplayCache>) -> Result<Record> {
        if frame.len() < HEADER_LEN {
            return Err(Error::Protocol(format!(
                "record too short: {} bytes",
                frame.len()
            )));
        }
        if frame.len() > MAX_RECORD_LEN as usize {
            return Err(Error::Protocol(format!(
                "record too large: {} bytes",
                frame.len()
            )));
        }

        let kind = frame[0];
        let payload_len =
            u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]) as usize;
        let padding_len =
            u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
        if HEADER_LEN + payload_len + padding_len != frame.len() {
            return Err(Error::Protocol("record length fields disagree".into()));
        }

        let mut iv = [0u8; NONCE_SIZE];
        iv.copy_from_slice(&frame[12..24]);

        if let Some(cache) = replay {
            if cache.seen_or_add(&iv, Instant::now()) {
                return Err(Error::Replay);
            }
        }

        // payload_len == 0 is a keepalive: nothing sealed, nothing to open
        let payload = if payload_len == 0 {
            Vec::new()
        } else {
            if payload_len < AEAD_TAG_LEN {
                return Err(Error::Crypto("ciphertext shorter than tag".into()));
            }
            let ciphertext = &frame[HEADER_LEN..HEADER_LEN + payload_len];
            self.cipher
                .decrypt(
                    Nonce::from_slice(&iv),
                    Payload {
                        msg: ciphertext,
                        aad: &frame[..HEADER_LEN],
                    },
                )
                .map_err(|_| Error::Crypto("record authentication failed".into()))?
        };

        Ok(Record { kind, iv, payload })
    }
}

/// Wire error code for a local failure, used when the gateway reports a
/// failed open back to the peer.
pub fn error_code_for(err: &Error) -> u16 {
    match err {
        Error::Replay => code::REPLAY_DETECTED,
        Error::Crypto(_) => code::METADATA_DECRYPT_FAILED,
        _ => code::PROTOCOL_VIOLATION,
    }
}
