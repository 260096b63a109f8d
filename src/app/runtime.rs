//! Runtime - daemon lifecycle
//!
//! Builds the rule engine, geo databases, tunnel client and dispatcher
//! from configuration, then runs the local accept loops and the admin API
//! until ctrl-c. Shutdown fans out over a broadcast channel; every accept
//! loop selects on it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::common::IntoStream;
use crate::config::{ConfigManager, SessionConfig};
use crate::error::{Error, Result};
use crate::geo::{GeoIpDatabase, GeoSiteDatabase};
use crate::proxy::{HttpProxy, InboundProxy, Socks5Proxy};
use crate::rules::{Action, Rule, RuleEngine};
use crate::tunnel::TunnelClient;

use super::dispatcher::Dispatcher;
use super::metrics::{init_metrics, SESSIONS_ACTIVE, SESSIONS_TOTAL};
use super::stats_api::{self, ApiState};

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub session: SessionConfig,
    /// Admin API listen address
    pub api_listen: Option<String>,
    pub geoip_file: Option<PathBuf>,
    pub geosite_file: Option<PathBuf>,
    pub rules: Vec<Rule>,
    pub default_action: Action,
    /// Skip gateway certificate verification (testing only)
    pub allow_insecure: bool,
}

/// Runtime manages the daemon lifecycle.
pub struct Runtime {
    session: SessionConfig,
    dispatcher: Arc<Dispatcher>,
    tunnel: Arc<TunnelClient>,
    api_state: Arc<ApiState>,
    api_listen: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    /// Build the runtime from configuration.
    pub fn from_config(config: RuntimeConfig, manager: Option<ConfigManager>) -> Result<Self> {
        if config.session.url.is_empty() {
            return Err(Error::Config("tunnel URL is required".into()));
        }
        if config.session.psk.is_empty() {
            return Err(Error::Config("PSK is required".into()));
        }

        init_metrics();

        let engine = Arc::new(RuleEngine::new(config.default_action));
        engine.update_rules(config.rules)?;

        if let Some(path) = &config.geoip_file {
            match GeoIpDatabase::load(path) {
                Ok(db) => engine.set_geoip(Arc::new(db)),
                Err(e) => warn!("GeoIP database not loaded: {}", e),
            }
        }
        if let Some(path) = &config.geosite_file {
            match GeoSiteDatabase::load(path) {
                Ok(db) => engine.set_geosite(Arc::new(db)),
                Err(e) => warn!("GeoSite database not loaded: {}", e),
            }
        }

        let tunnel = Arc::new(TunnelClient::new(
            &config.session.url,
            config.allow_insecure,
        )?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&engine),
            Arc::clone(&tunnel),
            config.session.psk.clone(),
        ));

        let api_listen = config.api_listen.as_ref().and_then(|s| {
            s.parse::<SocketAddr>()
                .map_err(|_| warn!("Invalid API listen address: {}", s))
                .ok()
        });

        let api_state = Arc::new(ApiState {
            engine,
            tunnel: Arc::clone(&tunnel),
            config: parking_lot::RwLock::new(config.session.clone()),
            manager,
            geoip_file: config.geoip_file,
            geosite_file: config.geosite_file,
            started_at: Instant::now(),
        });

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            session: config.session,
            dispatcher,
            tunnel,
            api_state,
            api_listen,
            shutdown_tx,
        })
    }

    /// Run accept loops and the admin API until ctrl-c.
    pub async fn run(&self) -> Result<()> {
        let mut handles = Vec::new();

        {
            let listen = self.session.listen_addr.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let proxy: Arc<dyn InboundProxy> = Arc::new(Socks5Proxy::new());
                if let Err(e) = run_listener(listen, proxy, dispatcher, shutdown_rx).await {
                    error!("SOCKS5 listener error: {}", e);
                }
            }));
        }

        if !self.session.http_proxy_addr.is_empty() {
            let listen = self.session.http_proxy_addr.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                let proxy: Arc<dyn InboundProxy> = Arc::new(HttpProxy::new());
                if let Err(e) = run_listener(listen, proxy, dispatcher, shutdown_rx).await {
                    error!("HTTP listener error: {}", e);
                }
            }));
        }

        let api_handle = self.api_listen.map(|addr| {
            let state = Arc::clone(&self.api_state);
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                stats_api::start_api_server(addr, state, shutdown_rx).await;
            })
        });

        info!("Daemon started");

        tokio::signal::ctrl_c().await?;
        info!("Shutting down...");

        let _ = self.shutdown_tx.send(());
        for handle in handles {
            let _ = handle.await;
        }
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }
        self.tunnel.disconnect().await;

        Ok(())
    }
}

/// Accept connections on one local listener.
async fn run_listener(
    listen: String,
    proxy: Arc<dyn InboundProxy>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| Error::Transport(format!("bind {}: {}", listen, e)))?;
    info!("[{}] Listening on {}", proxy.name(), listen);

    let mut conn_count: u64 = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, source)) => {
                        conn_count += 1;
                        let conn_id = conn_count;
                        SESSIONS_TOTAL.inc();
                        SESSIONS_ACTIVE.inc();

                        let proxy = Arc::clone(&proxy);
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            let result = dispatcher
                                .dispatch(proxy.as_ref(), stream.into_stream())
                                .await;
                            SESSIONS_ACTIVE.dec();
                            if let Err(e) = result {
                                warn!("Connection #{} from {}: {}", conn_id, source, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("[{}] Accept error: {}", proxy.name(), e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("[{}] Shutting down (handled {} connections)", proxy.name(), conn_count);
                break;
            }
        }
    }

    Ok(())
}
