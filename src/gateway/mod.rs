//! Gateway session handler
//!
//! Accepts WebTransport sessions at the configured path, services each
//! stream: exactly one Metadata record first, then a TCP dial toward the
//! decoded destination and a bidirectional relay. Failures before and
//! during the relay are reported to the peer as Error records; carrier
//! failures just end the stream.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use web_transport_quinn::Session;

use crate::common::pipe::{copy_from_records, copy_into_records, normalize_close};
use crate::error::{Error, Result};
use crate::record::reader::read_frame;
use crate::record::{
    code, error_code_for, RecordCodec, RecordReader, RecordType, ReplayCache,
};

/// Upstream dial timeout
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub psk: String,
    /// WebTransport upgrade path
    pub path: String,
}

/// The gateway: one QUIC endpoint, many sessions, one replay cache.
pub struct Gateway {
    config: GatewayConfig,
    replay: Arc<ReplayCache>,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            replay: Arc::new(ReplayCache::default()),
        }
    }

    /// Accept sessions until ctrl-c.
    pub async fn run(&self) -> Result<()> {
        let endpoint = self.build_endpoint()?;
        let mut server = web_transport_quinn::Server::new(endpoint.clone());
        let sweeper = self.replay.spawn_sweeper();

        info!(
            "Gateway listening on {} (path {})",
            self.config.listen, self.config.path
        );

        loop {
            tokio::select! {
                request = server.accept() => {
                    let Some(request) = request else { break };
                    let psk = self.config.psk.clone();
                    let path = self.config.path.clone();
                    let replay = Arc::clone(&self.replay);
                    tokio::spawn(async move {
                        if request.url().path() != path {
                            debug!("Rejecting session for {}", request.url().path());
                            request.close(http::StatusCode::NOT_FOUND).await.ok();
                            return;
                        }
                        match request.ok().await {
                            Ok(session) => handle_session(session, psk, replay).await,
                            Err(e) => warn!("Session upgrade failed: {}", e),
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        sweeper.abort();
        endpoint.close(0u32.into(), b"shutdown");
        endpoint.wait_idle().await;
        Ok(())
    }

    fn build_endpoint(&self) -> Result<quinn::Endpoint> {
        let certs = load_certs(&self.config.cert_file)?;
        let key = load_key(&self.config.key_file)?;

        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Config(format!("TLS config: {}", e)))?;
        tls_config.alpn_protocols = vec![web_transport_quinn::ALPN.to_vec()];

        let crypto = QuicServerConfig::try_from(tls_config)
            .map_err(|e| Error::Config(format!("QUIC crypto config: {}", e)))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

        quinn::Endpoint::server(server_config, self.config.listen)
            .map_err(|e| Error::Transport(format!("bind {}: {}", self.config.listen, e)))
    }
}

fn load_certs(path: &PathBuf) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("read certificate {:?}: {}", path, e)))?;
    rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("parse certificate {:?}: {}", path, e)))
}

fn load_key(path: &PathBuf) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("read key {:?}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut std::io::BufReader::new(file))
        .map_err(|e| Error::Config(format!("parse key {:?}: {}", path, e)))?
        .ok_or_else(|| Error::Config(format!("no private key in {:?}", path)))
}

/// Accept streams on one session, numbering them for key derivation.
async fn handle_session(session: Session, psk: String, replay: Arc<ReplayCache>) {
    info!("Session established");
    let mut stream_id: u64 = 0;

    loop {
        match session.accept_bi().await {
            Ok((send, recv)) => {
                stream_id += 1;
                let psk = psk.clone();
                let replay = Arc::clone(&replay);
                tokio::spawn(async move {
                    if let Err(e) = serve_stream(recv, send, &psk, stream_id, replay).await {
                        warn!("[stream {}] {}", stream_id, e);
                    }
                });
            }
            Err(e) => {
                debug!("Session ended: {}", e);
                break;
            }
        }
    }
}

/// Service one tunnel stream: metadata, dial, relay.
///
/// Generic over the stream halves so the record pipeline can be exercised
/// without a QUIC carrier.
pub async fn serve_stream<R, W>(
    mut recv: R,
    mut send: W,
    psk: &str,
    stream_id: u64,
    replay: Arc<ReplayCache>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let codec = Arc::new(RecordCodec::new(psk, stream_id)?);

    let frame = match read_frame(&mut recv).await {
        Ok(Some(frame)) => frame,
        // peer went away before sending anything
        Ok(None) => return Ok(()),
        Err(e) => {
            if matches!(e, Error::Protocol(_)) {
                send_error(&mut send, &codec, code::PROTOCOL_VIOLATION, "malformed record").await;
            }
            return Err(e);
        }
    };

    let record = match codec.open(&frame, Some(&replay)) {
        Ok(record) => record,
        Err(e) => {
            let (code, message) = match &e {
                Error::Replay => (code::REPLAY_DETECTED, "replay detected"),
                Error::Crypto(_) => (code::METADATA_DECRYPT_FAILED, "metadata decrypt failed"),
                _ => (code::PROTOCOL_VIOLATION, "malformed record"),
            };
            send_error(&mut send, &codec, code, message).await;
            return Err(e);
        }
    };

    if record.record_type() != Some(RecordType::Metadata) {
        send_error(&mut send, &codec, code::METADATA_REQUIRED, "metadata required").await;
        return Err(Error::Protocol(format!(
            "first record has type {}",
            record.kind
        )));
    }

    let meta = match record.decode_metadata() {
        Ok(meta) => meta,
        Err(e) => {
            send_error(&mut send, &codec, code::PROTOCOL_VIOLATION, "bad metadata").await;
            return Err(e);
        }
    };

    debug!("[stream {}] Connecting to {}:{}", stream_id, meta.host, meta.port);
    let upstream = match tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((meta.host.as_str(), meta.port)),
    )
    .await
    {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) => {
            send_error(&mut send, &codec, code::UPSTREAM_CONNECT_FAILED, "connect failed").await;
            return Err(Error::Transport(format!(
                "dial {}:{}: {}",
                meta.host, meta.port, e
            )));
        }
        Err(_) => {
            send_error(&mut send, &codec, code::UPSTREAM_CONNECT_FAILED, "connect timeout").await;
            return Err(Error::Timeout);
        }
    };

    info!("[stream {}] Relaying to {}:{}", stream_id, meta.host, meta.port);

    let (mut tcp_read, mut tcp_write) = tokio::io::split(upstream);
    let mut records = RecordReader::new(recv, Arc::clone(&codec)).with_replay(replay);

    // the select! block scopes both copy futures so the send half is
    // available again afterwards for a final Error record
    let (direction, outcome) = {
        let up = copy_from_records(&mut records, &mut tcp_write);
        let down = copy_into_records(&mut tcp_read, &mut send, &codec, meta.options.max_padding);
        tokio::pin!(up, down);
        tokio::select! {
            result = &mut up => ("up", result),
            result = &mut down => ("down", result),
        }
    };

    match normalize_close(outcome) {
        Ok(_) => {
            debug!("[stream {}] Closed ({})", stream_id, direction);
            Ok(())
        }
        Err(e) => {
            send_error(&mut send, &codec, error_code_for(&e), "relay failed").await;
            Err(e)
        }
    }
}

async fn send_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    codec: &RecordCodec,
    code: u16,
    message: &str,
) {
    if let Ok(frame) = codec.seal_error(code, message) {
        let _ = writer.write_all(&frame).await;
        let _ = writer.flush().await;
    }
}
