//! SOCKS5 inbound handshake

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Result, Stream};
use crate::error::Error;

use super::{InboundProxy, Verdict};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 protocol handler (no authentication)
pub struct Socks5Proxy;

impl Socks5Proxy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Socks5Proxy {
    fn default() -> Self {
        Self::new()
    }
}

fn reply(code: u8) -> [u8; 10] {
    [SOCKS5_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[async_trait]
impl InboundProxy for Socks5Proxy {
    async fn read_request(&self, mut stream: Stream) -> Result<(Address, Stream)> {
        // greeting: version and offered auth methods
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;
        if buf[0] != SOCKS5_VERSION {
            return Err(Error::Protocol(format!(
                "Unsupported SOCKS version: {}",
                buf[0]
            )));
        }

        let nmethods = buf[1] as usize;
        let mut methods = vec![0u8; nmethods];
        stream.read_exact(&mut methods).await?;

        if !methods.contains(&AUTH_NONE) {
            stream
                .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
                .await?;
            return Err(Error::Protocol("No acceptable auth method".into()));
        }
        stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

        // request: VER CMD RSV ATYP
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("Invalid SOCKS version in request".into()));
        }

        let address = match header[3] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                Address::Socket(SocketAddr::new(
                    Ipv4Addr::from(addr).into(),
                    u16::from_be_bytes(port),
                ))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                Address::Domain(
                    String::from_utf8_lossy(&domain).to_string(),
                    u16::from_be_bytes(port),
                )
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let mut port = [0u8; 2];
                stream.read_exact(&mut port).await?;
                Address::Socket(SocketAddr::new(
                    Ipv6Addr::from(addr).into(),
                    u16::from_be_bytes(port),
                ))
            }
            atyp => {
                stream.write_all(&reply(REP_ATYP_NOT_SUPPORTED)).await?;
                return Err(Error::Protocol(format!(
                    "Unsupported address type: {}",
                    atyp
                )));
            }
        };

        if header[1] != CMD_CONNECT {
            stream.write_all(&reply(REP_CMD_NOT_SUPPORTED)).await?;
            return Err(Error::Protocol(format!(
                "Unsupported SOCKS command: {}",
                header[1]
            )));
        }

        Ok((address, stream))
    }

    async fn respond(&self, stream: &mut Stream, verdict: Verdict) -> Result<()> {
        let code = match verdict {
            Verdict::Granted => REP_SUCCESS,
            Verdict::Refused => REP_CONNECTION_REFUSED,
        };
        stream.write_all(&reply(code)).await?;
        stream.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}
