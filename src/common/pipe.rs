//! Relay copy loops
//!
//! The session pipeline couples a local connection to either a direct TCP
//! connection or a tunnel stream. Tunnel relays wrap plaintext into Data
//! records on the way up and drain record payloads on the way down; direct
//! relays copy bytes both ways. All loops use 32 KiB buffers.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::record::{RecordCodec, RecordReader, RecordType};

/// Relay buffer size (32KB)
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Copy plaintext from `reader`, sealing each read into a Data record on
/// `writer`. Returns the plaintext byte count on clean EOF.
pub async fn copy_into_records<R, W>(
    reader: &mut R,
    writer: &mut W,
    codec: &RecordCodec,
    max_padding: u16,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await.ok();
            return Ok(total);
        }
        let frame = codec.seal(RecordType::Data, &buf[..n], max_padding)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

/// Drain record payloads from `records` into `writer`. Returns the payload
/// byte count on clean EOF.
pub async fn copy_from_records<R, W>(
    records: &mut RecordReader<R>,
    writer: &mut W,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = records.read(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await.ok();
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
    }
}

/// Plain bidirectional relay for direct connections. Returns
/// (uploaded, downloaded) byte counts; per-direction errors end that
/// direction without failing the relay.
pub async fn relay_plain<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let upload = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match a_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if b_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if b_write.flush().await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = b_write.shutdown().await;
        total
    };

    let download = async {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = match b_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            if a_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            if a_write.flush().await.is_err() {
                break;
            }
            total += n as u64;
        }
        let _ = a_write.shutdown().await;
        total
    };

    tokio::join!(upload, download)
}

/// Normalize relay outcomes: a peer that closed first shows up on the
/// sibling task as a broken-pipe style error, which is not a failure.
pub fn normalize_close(result: Result<u64>) -> Result<u64> {
    match result {
        Err(Error::Io(ref e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            Ok(0)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_record_copy_round_trip() {
        let codec = Arc::new(RecordCodec::new("secret", 9).unwrap());
        let (local_a, mut local_b) = tokio::io::duplex(64 * 1024);
        let (tunnel_a, tunnel_b) = tokio::io::duplex(256 * 1024);

        // local_b writes plaintext; copy_into_records seals it onto the
        // tunnel; copy_from_records drains it back out of the tunnel.
        let payload = vec![0x5au8; 100_000];
        let write_side = {
            let payload = payload.clone();
            tokio::spawn(async move {
                local_b.write_all(&payload).await.unwrap();
                local_b.shutdown().await.unwrap();
                local_b
            })
        };

        let codec_up = codec.clone();
        let up = tokio::spawn(async move {
            let (mut read, _write) = tokio::io::split(local_a);
            let (_tr, mut tw) = tokio::io::split(tunnel_a);
            copy_into_records(&mut read, &mut tw, &codec_up, 64).await
        });

        let (tunnel_read, _tunnel_write) = tokio::io::split(tunnel_b);
        let mut records = RecordReader::new(tunnel_read, codec);
        let mut out = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = records.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }

        assert_eq!(out, payload);
        assert_eq!(up.await.unwrap().unwrap(), payload.len() as u64);
        write_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_plain_both_directions() {
        let (a, a_peer) = tokio::io::duplex(1024);
        let (b, b_peer) = tokio::io::duplex(1024);

        let relay = tokio::spawn(relay_plain(a_peer, b_peer));

        let (mut a_read, mut a_write) = tokio::io::split(a);
        let (mut b_read, mut b_write) = tokio::io::split(b);

        a_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_write.write_all(b"pong").await.unwrap();
        a_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        a_write.shutdown().await.unwrap();
        b_write.shutdown().await.unwrap();
        let (up, down) = relay.await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }

    #[test]
    fn test_normalize_close() {
        let broken: Result<u64> = Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe",
        )));
        assert_eq!(normalize_close(broken).unwrap(), 0);

        let real: Result<u64> = Err(Error::Crypto("bad tag".into()));
        assert!(normalize_close(real).is_err());
    }
}
