//! Record reader adapter
//!
//! Presents an incoming record stream as a plain byte stream: Data payloads
//! are stashed and drained in order, Error records surface as typed errors,
//! unknown record types are skipped for forward compatibility. The session
//! pipeline reads the first (Metadata) record itself; by the time the
//! adapter runs, a Metadata record is a protocol violation.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

use super::replay::ReplayCache;
use super::{Record, RecordCodec, RecordType, HEADER_LEN, MAX_RECORD_LEN};

/// Read one length-prefixed frame body. Returns `None` on a clean EOF at a
/// frame boundary; EOF inside a frame is an error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Protocol("EOF inside record length".into()));
        }
        filled += n;
    }

    let total_len = u32::from_be_bytes(len_buf);
    if total_len < HEADER_LEN as u32 {
        return Err(Error::Protocol(format!(
            "record length {} below header size",
            total_len
        )));
    }
    if total_len > MAX_RECORD_LEN {
        return Err(Error::Protocol(format!(
            "record length {} exceeds maximum",
            total_len
        )));
    }

    let mut frame = vec![0u8; total_len as usize];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Byte-stream view over a record stream.
pub struct RecordReader<R> {
    inner: R,
    codec: Arc<RecordCodec>,
    replay: Option<Arc<ReplayCache>>,
    stash: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(inner: R, codec: Arc<RecordCodec>) -> Self {
        Self {
            inner,
            codec,
            replay: None,
            stash: Vec::new(),
            pos: 0,
        }
    }

    /// Gate every decode through a replay cache (gateway side).
    pub fn with_replay(mut self, cache: Arc<ReplayCache>) -> Self {
        self.replay = Some(cache);
        self
    }

    /// Read, parse and decrypt the next record. `None` on clean EOF.
    pub async fn next_record(&mut self) -> Result<Option<Record>> {
        match read_frame(&mut self.inner).await? {
            Some(frame) => Ok(Some(self.codec.open(&frame, self.replay.as_deref())?)),
            None => Ok(None),
        }
    }

    /// Read decrypted payload bytes. Returns 0 on clean EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.pos >= self.stash.len() {
            let record = match self.next_record().await? {
                Some(record) => record,
                None => return Ok(0),
            };
            match record.record_type() {
                Some(RecordType::Data) => {
                    self.stash = record.payload;
                    self.pos = 0;
                    // empty Data records are keepalives: keep pulling
                }
                Some(RecordType::Error) => {
                    let (code, message) = record.decode_error()?;
                    return Err(Error::Remote { code, message });
                }
                Some(RecordType::Metadata) => {
                    return Err(Error::Protocol(
                        "metadata record after stream start".into(),
                    ));
                }
                None => continue,
            }
        }

        let n = buf.len().min(self.stash.len() - self.pos);
        buf[..n].copy_from_slice(&self.stash[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::code;
    use tokio::io::AsyncWriteExt;

    fn codec() -> Arc<RecordCodec> {
        Arc::new(RecordCodec::new("secret", 1).unwrap())
    }

    #[tokio::test]
    async fn test_reassembles_data_records() {
        let codec = codec();
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = RecordReader::new(rx, codec.clone());

        tx.write_all(&codec.seal(RecordType::Data, b"hello ", 16).unwrap())
            .await
            .unwrap();
        tx.write_all(&codec.seal(RecordType::Data, b"world", 16).unwrap())
            .await
            .unwrap();
        drop(tx);

        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_error_record_surfaces_typed() {
        let codec = codec();
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = RecordReader::new(rx, codec.clone());

        tx.write_all(
            &codec
                .seal_error(code::UPSTREAM_CONNECT_FAILED, "connect failed")
                .unwrap(),
        )
        .await
        .unwrap();

        let mut buf = [0u8; 16];
        match reader.read(&mut buf).await {
            Err(Error::Remote { code: c, message }) => {
                assert_eq!(c, code::UPSTREAM_CONNECT_FAILED);
                assert_eq!(message, "connect failed");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_metadata_is_violation() {
        let codec = codec();
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = RecordReader::new(rx, codec.clone());

        let meta = crate::record::MetadataPayload::new("example.com", 443);
        tx.write_all(&codec.seal_metadata(&meta).unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_skipped() {
        let codec = codec();
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = RecordReader::new(rx, codec.clone());

        // a zero-payload frame with an unknown type byte
        let mut unknown = vec![0u8; 4 + HEADER_LEN];
        unknown[..4].copy_from_slice(&(HEADER_LEN as u32).to_be_bytes());
        unknown[4] = 0x2a;
        unknown[4 + 12] = 0x01; // nonzero IV
        tx.write_all(&unknown).await.unwrap();
        tx.write_all(&codec.seal(RecordType::Data, b"after", 0).unwrap())
            .await
            .unwrap();
        drop(tx);

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"after");
    }

    #[tokio::test]
    async fn test_oversize_record_rejected() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = RecordReader::new(rx, codec());

        tx.write_all(&(MAX_RECORD_LEN + 1).to_be_bytes()).await.unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_undersize_record_rejected() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = RecordReader::new(rx, codec());

        tx.write_all(&23u32.to_be_bytes()).await.unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            reader.read(&mut buf).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_keepalive_is_invisible() {
        let codec = codec();
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = RecordReader::new(rx, codec.clone());

        // a zero-payload keepalive frame, then real data
        let mut keepalive = vec![0u8; 4 + HEADER_LEN];
        keepalive[..4].copy_from_slice(&(HEADER_LEN as u32).to_be_bytes());
        keepalive[4] = RecordType::Data as u8;
        keepalive[4 + 12] = 0x01;
        tx.write_all(&keepalive).await.unwrap();
        tx.write_all(&codec.seal(RecordType::Data, b"real", 0).unwrap())
            .await
            .unwrap();
        drop(tx);

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"real");
    }
}
