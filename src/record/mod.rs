//! Record protocol
//!
//! The wire unit between daemon and gateway is the Record: a 24-byte header
//! (type, reserved, payload length, padding length, IV) followed by AEAD
//! ciphertext and random padding, prefixed by a u32 total length. The header
//! is the associated data of the AEAD seal; padding carries no integrity
//! beyond the length fields and is ignored on read.
//!
//! ```text
//! u32 total_length (BE)
//! ┌──────┬──────────┬─────────────┬─────────────┬──────────┐
//! │ type │ reserved │ payload_len │ padding_len │ IV       │  24-byte header (AAD)
//! │  1B  │    3B    │   u32 BE    │   u32 BE    │  12B     │
//! ├──────┴──────────┴─────────────┴─────────────┴──────────┤
//! │ ciphertext ‖ tag (payload_len bytes)                   │
//! │ padding (padding_len bytes, random, ignored)           │
//! └────────────────────────────────────────────────────────┘
//! ```

mod codec;
pub mod reader;
pub mod replay;

pub use codec::{error_code_for, RecordCodec};
pub use reader::RecordReader;
pub use replay::ReplayCache;

use crate::crypto::{NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// Record header length (includes the IV, excludes the length prefix)
pub const HEADER_LEN: usize = 24;

/// Maximum accepted record size (1 MiB)
pub const MAX_RECORD_LEN: u32 = 1024 * 1024;

/// Default padding bound for sealed records
pub const DEFAULT_MAX_PADDING: u16 = 256;

/// Wire error codes carried by Error records
pub mod code {
    pub const METADATA_REQUIRED: u16 = 0x0001;
    pub const METADATA_DECRYPT_FAILED: u16 = 0x0002;
    pub const REPLAY_DETECTED: u16 = 0x0003;
    pub const UPSTREAM_CONNECT_FAILED: u16 = 0x0004;
    pub const PROTOCOL_VIOLATION: u16 = 0x0005;
}

/// Record types. Unknown type bytes are tolerated on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Metadata = 1,
    Data = 2,
    Error = 3,
}

impl RecordType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(RecordType::Metadata),
            2 => Some(RecordType::Data),
            3 => Some(RecordType::Error),
            _ => None,
        }
    }
}

/// A parsed and decrypted record
#[derive(Debug)]
pub struct Record {
    /// Raw type byte from the header
    pub kind: u8,
    /// IV from the header
    pub iv: [u8; NONCE_SIZE],
    /// Decrypted payload
    pub payload: Vec<u8>,
}

impl Record {
    /// Known record type, if any
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_u8(self.kind)
    }

    /// Decode the payload as a Metadata payload
    pub fn decode_metadata(&self) -> Result<MetadataPayload> {
        MetadataPayload::decode(&self.payload)
    }

    /// Decode the payload as an Error record (code, message)
    pub fn decode_error(&self) -> Result<(u16, String)> {
        decode_error_payload(&self.payload)
    }
}

/// Per-stream options carried in the Metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataOptions {
    /// Upper bound for per-record padding, inclusive
    pub max_padding: u16,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            max_padding: DEFAULT_MAX_PADDING,
        }
    }
}

/// Option TLV tag for max_padding
const OPT_MAX_PADDING: u8 = 0x01;

/// Plaintext of a Metadata record: the tunnel destination plus options.
///
/// Layout: `host_len u8` ‖ host ‖ `port u16 BE` ‖ `options_len u8` ‖ TLVs.
/// Each TLV is `tag u8, len u8, value`; unknown tags are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPayload {
    pub host: String,
    pub port: u16,
    pub options: MetadataOptions,
}

impl MetadataPayload {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            options: MetadataOptions::default(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.host.is_empty() || self.host.len() > 255 {
            return Err(Error::InvalidAddress(format!(
                "host length {} out of range",
                self.host.len()
            )));
        }
        if self.port == 0 {
            return Err(Error::InvalidAddress("port must be nonzero".into()));
        }

        let mut buf = Vec::with_capacity(1 + self.host.len() + 2 + 6);
        buf.push(self.host.len() as u8);
        buf.extend_from_slice(self.host.as_bytes());
        buf.extend_from_slice(&self.port.to_be_bytes());

        // options block: max_padding TLV
        buf.push(4);
        buf.push(OPT_MAX_PADDING);
        buf.push(2);
        buf.extend_from_slice(&self.options.max_padding.to_be_bytes());
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::Protocol("empty metadata payload".into()));
        }
        let host_len = buf[0] as usize;
        if buf.len() < 1 + host_len + 2 {
            return Err(Error::Protocol("truncated metadata payload".into()));
        }
        let host = std::str::from_utf8(&buf[1..1 + host_len])
            .map_err(|_| Error::Protocol("metadata host is not UTF-8".into()))?
            .to_string();
        if host.is_empty() {
            return Err(Error::Protocol("empty metadata host".into()));
        }
        let port = u16::from_be_bytes([buf[1 + host_len], buf[2 + host_len]]);
        if port == 0 {
            return Err(Error::Protocol("metadata port is zero".into()));
        }

        let mut options = MetadataOptions::default();
        let rest = &buf[3 + host_len..];
        if !rest.is_empty() {
            let opts_len = rest[0] as usize;
            if rest.len() < 1 + opts_len {
                return Err(Error::Protocol("truncated metadata options".into()));
            }
            let mut tlv = &rest[1..1 + opts_len];
            while tlv.len() >= 2 {
                let (tag, len) = (tlv[0], tlv[1] as usize);
                if tlv.len() < 2 + len {
                    return Err(Error::Protocol("truncated metadata option".into()));
                }
                let value = &tlv[2..2 + len];
                if tag == OPT_MAX_PADDING && len == 2 {
                    options.max_padding = u16::from_be_bytes([value[0], value[1]]);
                }
                tlv = &tlv[2 + len..];
            }
        }

        Ok(Self {
            host,
            port,
            options,
        })
    }
}

/// Encode an Error record payload: code, two reserved zero bytes, message.
pub fn encode_error_payload(code: u16, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + message.len());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf.extend_from_slice(message.as_bytes());
    buf
}

/// Decode an Error record payload. The two bytes after the code are
/// tolerated regardless of content.
pub fn decode_error_payload(buf: &[u8]) -> Result<(u16, String)> {
    if buf.len() < 4 {
        return Err(Error::Protocol("error payload too short".into()));
    }
    let code = u16::from_be_bytes([buf[0], buf[1]]);
    let message = String::from_utf8_lossy(&buf[4..]).into_owned();
    Ok((code, message))
}

// payload_length accounts for the tag; keep the constant near the layout
pub(crate) const AEAD_TAG_LEN: usize = TAG_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_round_trip() {
        let meta = MetadataPayload::new("example.com", 443);
        let encoded = meta.encode().unwrap();
        let decoded = MetadataPayload::decode(&encoded).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.options.max_padding, DEFAULT_MAX_PADDING);
    }

    #[test]
    fn test_metadata_custom_padding() {
        let mut meta = MetadataPayload::new("example.com", 8080);
        meta.options.max_padding = 0;
        let decoded = MetadataPayload::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded.options.max_padding, 0);
    }

    #[test]
    fn test_metadata_unknown_tlv_skipped() {
        let mut buf = vec![4];
        buf.extend_from_slice(b"host");
        buf.extend_from_slice(&80u16.to_be_bytes());
        // unknown tag 0x7f, then max_padding = 16
        buf.push(7);
        buf.extend_from_slice(&[0x7f, 1, 0xaa]);
        buf.extend_from_slice(&[OPT_MAX_PADDING, 2, 0, 16]);
        let decoded = MetadataPayload::decode(&buf).unwrap();
        assert_eq!(decoded.host, "host");
        assert_eq!(decoded.options.max_padding, 16);
    }

    #[test]
    fn test_metadata_missing_options_defaults() {
        let mut buf = vec![4];
        buf.extend_from_slice(b"host");
        buf.extend_from_slice(&80u16.to_be_bytes());
        let decoded = MetadataPayload::decode(&buf).unwrap();
        assert_eq!(decoded.options.max_padding, DEFAULT_MAX_PADDING);
    }

    #[test]
    fn test_metadata_rejects_bad_input() {
        assert!(MetadataPayload::decode(&[]).is_err());
        assert!(MetadataPayload::new("", 80).encode().is_err());
        assert!(MetadataPayload::new("x".repeat(256), 80).encode().is_err());
        assert!(MetadataPayload::new("host", 0).encode().is_err());
    }

    #[test]
    fn test_error_payload_round_trip() {
        let buf = encode_error_payload(code::REPLAY_DETECTED, "replay detected");
        let (code, message) = decode_error_payload(&buf).unwrap();
        assert_eq!(code, code::REPLAY_DETECTED);
        assert_eq!(message, "replay detected");
    }

    #[test]
    fn test_error_payload_reserved_bytes_tolerated() {
        let mut buf = encode_error_payload(code::PROTOCOL_VIOLATION, "bad");
        buf[2] = 0xde;
        buf[3] = 0xad;
        let (code, message) = decode_error_payload(&buf).unwrap();
        assert_eq!(code, code::PROTOCOL_VIOLATION);
        assert_eq!(message, "bad");
    }

    #[test]
    fn test_record_type_from_u8() {
        assert_eq!(RecordType::from_u8(1), Some(RecordType::Metadata));
        assert_eq!(RecordType::from_u8(2), Some(RecordType::Data));
        assert_eq!(RecordType::from_u8(3), Some(RecordType::Error));
        assert_eq!(RecordType::from_u8(0), None);
        assert_eq!(RecordType::from_u8(42), None);
    }
}
