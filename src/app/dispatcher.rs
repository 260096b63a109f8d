//! Dispatcher - the per-connection session pipeline
//!
//! Each accepted local connection flows through here:
//!
//! ```text
//! proxy handshake → MatchRequest → RuleEngine
//!        ↓ direct                        ↓ proxy
//!   dial TCP, relay             open tunnel stream, send Metadata,
//!                               wrap/unwrap Data records
//! ```
//!
//! Block drops the connection without a reply; Reject answers with the
//! proxy protocol's refusal before closing.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::common::pipe::{
    copy_from_records, copy_into_records, normalize_close, relay_plain,
};
use crate::common::{Address, Stream};
use crate::error::{Error, Result};
use crate::proxy::{InboundProxy, Verdict};
use crate::record::{MetadataPayload, RecordCodec, RecordReader};
use crate::rules::{Action, MatchRequest, MatchResult, RuleEngine};
use crate::tunnel::{TunnelClient, TunnelStream};

use super::metrics::{
    format_bytes, RULE_DECISIONS, SESSIONS_FAILED, TRAFFIC_BYTES_DOWNLOADED,
    TRAFFIC_BYTES_UPLOADED,
};

/// Dispatcher routes accepted connections per the rule engine's verdict.
pub struct Dispatcher {
    engine: Arc<RuleEngine>,
    tunnel: Arc<TunnelClient>,
    psk: String,
}

impl Dispatcher {
    pub fn new(engine: Arc<RuleEngine>, tunnel: Arc<TunnelClient>, psk: impl Into<String>) -> Self {
        Self {
            engine,
            tunnel,
            psk: psk.into(),
        }
    }

    /// Handle one accepted local connection end to end.
    pub async fn dispatch(&self, proxy: &dyn InboundProxy, stream: Stream) -> Result<()> {
        let (address, mut stream) = proxy.read_request(stream).await?;

        let mut request = MatchRequest::new(address.port());
        if let Some((domain, _)) = address.as_domain() {
            request.domain = domain.to_string();
        }
        if let Some(ip) = address.ip() {
            request.ip = Some(ip);
        }

        // rule errors fall back to the default action
        let result = match self.engine.match_request(&request) {
            Ok(result) => result,
            Err(e) => {
                warn!("Rule evaluation failed for {}: {}", address, e);
                MatchResult {
                    action: self.engine.default_action(),
                    rule_id: String::new(),
                    rule_name: "default".into(),
                }
            }
        };
        RULE_DECISIONS
            .with_label_values(&[action_label(result.action)])
            .inc();
        debug!(
            "[{}] {} -> {:?} (rule: {})",
            proxy.name(),
            address,
            result.action,
            result.rule_name
        );

        match result.action {
            Action::Block => Ok(()),
            Action::Reject => proxy.respond(&mut stream, Verdict::Refused).await,
            Action::Direct => self.relay_direct(proxy, stream, &address).await,
            Action::Proxy => self.relay_tunnel(proxy, stream, &address).await,
        }
    }

    /// Direct mode: dial the destination and copy bytes both ways.
    async fn relay_direct(
        &self,
        proxy: &dyn InboundProxy,
        mut stream: Stream,
        address: &Address,
    ) -> Result<()> {
        let remote = match TcpStream::connect((address.host(), address.port())).await {
            Ok(remote) => remote,
            Err(e) => {
                SESSIONS_FAILED.inc();
                proxy.respond(&mut stream, Verdict::Refused).await.ok();
                return Err(Error::Transport(format!("dial {}: {}", address, e)));
            }
        };
        proxy.respond(&mut stream, Verdict::Granted).await?;

        let (up, down) = relay_plain(stream, remote).await;
        TRAFFIC_BYTES_UPLOADED.inc_by(up);
        TRAFFIC_BYTES_DOWNLOADED.inc_by(down);
        info!(
            "[direct] {} closed (↑{} ↓{})",
            address,
            format_bytes(up),
            format_bytes(down)
        );
        Ok(())
    }

    /// Proxy mode: open a tunnel stream, send Metadata, then run the two
    /// copy tasks until the first one finishes.
    async fn relay_tunnel(
        &self,
        proxy: &dyn InboundProxy,
        mut stream: Stream,
        address: &Address,
    ) -> Result<()> {
        let TunnelStream { id, mut send, recv } = match self.tunnel.open_stream().await {
            Ok(tunnel_stream) => tunnel_stream,
            Err(e) => {
                SESSIONS_FAILED.inc();
                proxy.respond(&mut stream, Verdict::Refused).await.ok();
                return Err(e);
            }
        };

        let codec = Arc::new(RecordCodec::new(&self.psk, id)?);
        let meta = MetadataPayload::new(address.host(), address.port());
        send.write_all(&codec.seal_metadata(&meta)?).await?;
        send.flush().await?;

        proxy.respond(&mut stream, Verdict::Granted).await?;

        let (local_read, local_write) = tokio::io::split(stream);
        let (err_tx, mut err_rx) = mpsc::channel::<(&'static str, Result<u64>)>(2);
        let max_padding = meta.options.max_padding;

        let up_task = tokio::spawn({
            let codec = Arc::clone(&codec);
            let err_tx = err_tx.clone();
            async move {
                let mut local_read = local_read;
                let mut send = send;
                let result =
                    copy_into_records(&mut local_read, &mut send, &codec, max_padding).await;
                let _ = err_tx.send(("up", result)).await;
            }
        });
        let down_task = tokio::spawn({
            async move {
                let mut records = RecordReader::new(recv, codec);
                let mut local_write = local_write;
                let result = copy_from_records(&mut records, &mut local_write).await;
                let _ = err_tx.send(("down", result)).await;
            }
        });

        // first completion wins; the sibling is cancelled and both
        // endpoints close as their halves drop
        let (direction, first) = err_rx
            .recv()
            .await
            .unwrap_or(("up", Err(Error::ConnectionClosed)));
        up_task.abort();
        down_task.abort();

        let mut bytes = [0u64; 2];
        match normalize_close(first) {
            Ok(n) => bytes[if direction == "up" { 0 } else { 1 }] = n,
            Err(e) => {
                warn!("[stream {}] {} relay failed: {}", id, direction, e);
                return Err(e);
            }
        }
        // the sibling may have finished concurrently; collect its count
        if let Ok((direction, result)) = err_rx.try_recv() {
            if let Ok(n) = normalize_close(result) {
                bytes[if direction == "up" { 0 } else { 1 }] = n;
            }
        }

        TRAFFIC_BYTES_UPLOADED.inc_by(bytes[0]);
        TRAFFIC_BYTES_DOWNLOADED.inc_by(bytes[1]);
        info!(
            "[stream {}] {} closed (↑{} ↓{})",
            id,
            address,
            format_bytes(bytes[0]),
            format_bytes(bytes[1])
        );
        Ok(())
    }
}

fn action_label(action: Action) -> &'static str {
    match action {
        Action::Direct => "direct",
        Action::Proxy => "proxy",
        Action::Block => "block",
        Action::Reject => "reject",
    }
}
