//! HTTP CONNECT inbound handshake
//!
//! Tunnel mode only: `CONNECT host:port HTTP/1.1` upgrades the connection
//! into a transparent byte stream once granted. Plain-method forwarding is
//! not offered.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::common::{Address, IntoStream, Result, Stream};
use crate::error::Error;

use super::{InboundProxy, Verdict};

const RESPONSE_200_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_403_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden\r\nConnection: close\r\n\r\n";
const RESPONSE_405_NOT_ALLOWED: &[u8] =
    b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n";

/// Maximum accepted handshake size
const MAX_REQUEST_LEN: usize = 16 * 1024;

/// HTTP CONNECT protocol handler
pub struct HttpProxy;

impl HttpProxy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboundProxy for HttpProxy {
    async fn read_request(&self, mut stream: Stream) -> Result<(Address, Stream)> {
        // read until the end of headers, keeping any bytes past it
        let mut buf = BytesMut::with_capacity(1024);
        let header_end = loop {
            if let Some(pos) = find_header_end(&buf) {
                break pos;
            }
            if buf.len() > MAX_REQUEST_LEN {
                return Err(Error::Protocol("HTTP request too large".into()));
            }
            let n = stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(Error::Protocol("EOF inside HTTP request".into()));
            }
        };

        let head = std::str::from_utf8(&buf[..header_end])
            .map_err(|_| Error::Protocol("HTTP request is not UTF-8".into()))?;
        let request_line = head.lines().next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");

        if !method.eq_ignore_ascii_case("CONNECT") {
            stream.write_all(RESPONSE_405_NOT_ALLOWED).await?;
            return Err(Error::Protocol(format!(
                "Unsupported HTTP method: {}",
                method
            )));
        }

        let address = parse_host_port(target)?;

        let leftover = buf.split_off(header_end + 4);
        let stream: Stream = if leftover.is_empty() {
            stream
        } else {
            PrependStream::new(leftover, stream).into_stream()
        };

        Ok((address, stream))
    }

    async fn respond(&self, stream: &mut Stream, verdict: Verdict) -> Result<()> {
        let response = match verdict {
            Verdict::Granted => RESPONSE_200_ESTABLISHED,
            Verdict::Refused => RESPONSE_403_FORBIDDEN,
        };
        stream.write_all(response).await?;
        stream.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse `host:port` from a CONNECT target.
fn parse_host_port(s: &str) -> Result<Address> {
    if s.is_empty() {
        return Err(Error::InvalidAddress("empty CONNECT target".into()));
    }
    if let Ok(addr) = s.parse() {
        return Ok(Address::Socket(addr));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::InvalidAddress(format!("invalid port: {}", p)))?;
            (h, port)
        }
        None => (s, 443),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse() {
        return Ok(Address::ip_port(ip, port));
    }
    Ok(Address::Domain(host.to_string(), port))
}

/// Stream wrapper that yields buffered bytes before the inner stream.
struct PrependStream {
    prepend: BytesMut,
    inner: Stream,
}

impl PrependStream {
    fn new(prepend: BytesMut, inner: Stream) -> Self {
        Self { prepend, inner }
    }
}

impl AsyncRead for PrependStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prepend.is_empty() {
            let to_copy = self.prepend.len().min(buf.remaining());
            buf.put_slice(&self.prepend[..to_copy]);
            let _ = self.prepend.split_to(to_copy);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrependStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_request() {
        let (client, server) = tokio::io::duplex(1024);
        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let (address, _stream) = HttpProxy::new()
            .read_request(server.into_stream())
            .await
            .unwrap();
        assert_eq!(address, Address::domain("example.com", 443));
    }

    #[tokio::test]
    async fn test_early_bytes_preserved() {
        let (client, server) = tokio::io::duplex(1024);
        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\nearly-data")
            .await
            .unwrap();

        let (_address, mut stream) = HttpProxy::new()
            .read_request(server.into_stream())
            .await
            .unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early-data");
    }

    #[tokio::test]
    async fn test_rejects_plain_get() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"GET http://example.com/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        assert!(HttpProxy::new()
            .read_request(server.into_stream())
            .await
            .is_err());

        let mut reply = [0u8; 12];
        client_read.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"HTTP/1.1 405");
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("example.com:8443").unwrap(),
            Address::domain("example.com", 8443)
        );
        assert_eq!(
            parse_host_port("1.2.3.4:80").unwrap(),
            Address::Socket("1.2.3.4:80".parse().unwrap())
        );
        assert_eq!(
            parse_host_port("[::1]:80").unwrap(),
            Address::Socket("[::1]:80".parse().unwrap())
        );
        assert_eq!(
            parse_host_port("example.com").unwrap(),
            Address::domain("example.com", 443)
        );
        assert!(parse_host_port("host:badport").is_err());
        assert!(parse_host_port("").is_err());
    }
}
