//! WebTransport tunnel client
//!
//! Owns the QUIC endpoint and the WebTransport session toward the gateway.
//! Streams are opened on the cached session; when that fails the session is
//! re-established once and the open retried. Stream ids are allocated from
//! a monotonic counter and drive per-stream key derivation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quinn::Endpoint;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;
use web_transport_quinn::{RecvStream, SendStream, Session};

use crate::error::{Error, Result};

/// One opened tunnel stream plus its derived-key stream id.
pub struct TunnelStream {
    pub id: u64,
    pub send: SendStream,
    pub recv: RecvStream,
}

/// WebTransport client toward the gateway endpoint.
pub struct TunnelClient {
    url: Url,
    server_name: String,
    port: u16,
    endpoint: Endpoint,
    session: Mutex<Option<Session>>,
    next_stream_id: AtomicU64,
}

impl TunnelClient {
    pub fn new(url: &str, allow_insecure: bool) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid URL: {}", e)))?;
        if url.scheme() != "https" {
            return Err(Error::Config(format!(
                "tunnel URL must be https, got {}",
                url.scheme()
            )));
        }
        let server_name = url
            .host_str()
            .ok_or_else(|| Error::Config("tunnel URL has no host".into()))?
            .to_string();
        let port = url.port().unwrap_or(443);

        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())
            .map_err(|e| Error::Transport(format!("bind QUIC endpoint: {}", e)))?;
        endpoint.set_default_client_config(build_client_config(allow_insecure)?);

        Ok(Self {
            url,
            server_name,
            port,
            endpoint,
            session: Mutex::new(None),
            next_stream_id: AtomicU64::new(1),
        })
    }

    /// Open a new tunnel stream, reconnecting the session once if the
    /// cached one is gone.
    pub async fn open_stream(&self) -> Result<TunnelStream> {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            match session.open_bi().await {
                Ok((send, recv)) => return Ok(TunnelStream { id, send, recv }),
                Err(e) => {
                    warn!("Tunnel session lost ({}), reconnecting", e);
                    *guard = None;
                }
            }
        }

        let session = self.connect().await?;
        let (send, recv) = session
            .open_bi()
            .await
            .map_err(|e| Error::Transport(format!("open stream: {}", e)))?;
        *guard = Some(session);
        Ok(TunnelStream { id, send, recv })
    }

    /// Whether a session is currently established.
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Drop the cached session; the next open reconnects. Dropping the last
    /// handle closes the underlying connection.
    pub async fn disconnect(&self) {
        self.session.lock().await.take();
        self.endpoint.wait_idle().await;
    }

    async fn connect(&self) -> Result<Session> {
        let addr = tokio::net::lookup_host((self.server_name.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                Error::Transport(format!("no address for {}", self.server_name))
            })?;

        debug!("Connecting to {} ({})", self.url, addr);
        let connecting = self
            .endpoint
            .connect(addr, &self.server_name)
            .map_err(|e| Error::Transport(format!("QUIC connect: {}", e)))?;
        let conn = connecting
            .await
            .map_err(|e| Error::Transport(format!("QUIC handshake: {}", e)))?;

        Session::connect(conn, &self.url)
            .await
            .map_err(|e| Error::Transport(format!("WebTransport upgrade: {}", e)))
    }
}

/// Build the QUIC client configuration.
fn build_client_config(allow_insecure: bool) -> Result<quinn::ClientConfig> {
    let tls_config = if allow_insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureServerCertVerifier))
            .with_no_client_auth()
    } else {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };

    let mut tls_config = tls_config;
    tls_config.alpn_protocols = vec![web_transport_quinn::ALPN.to_vec()];

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
        .map_err(|e| Error::Transport(format!("QUIC crypto config: {}", e)))?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

/// Certificate verifier that accepts anything. Only reachable through an
/// explicit insecure flag.
#[derive(Debug)]
struct InsecureServerCertVerifier;

impl ServerCertVerifier for InsecureServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT_CRYPTO: Once = Once::new();

    fn init_crypto_provider() {
        INIT_CRYPTO.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
    }

    #[tokio::test]
    async fn test_url_validation() {
        init_crypto_provider();
        assert!(TunnelClient::new("https://relay.example.com/v1/api/sync", false).is_ok());
        assert!(TunnelClient::new("http://relay.example.com/", false).is_err());
        assert!(TunnelClient::new("not a url", false).is_err());
    }

    #[tokio::test]
    async fn test_stream_ids_are_monotonic() {
        init_crypto_provider();
        let client =
            TunnelClient::new("https://relay.example.com:4433/v1/api/sync", true).unwrap();
        assert_eq!(client.server_name, "relay.example.com");
        assert_eq!(client.port, 4433);
        let a = client.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let b = client.next_stream_id.fetch_add(1, Ordering::Relaxed);
        assert!(b > a);
        assert_eq!(a, 1);
    }
}
