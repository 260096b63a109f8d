//! aetherd - Aether client daemon
//!
//! Local SOCKS5/HTTP proxy with a WebTransport tunnel backend and an HTTP
//! admin API for the GUI.

use std::path::PathBuf;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use aether::app::{Runtime, RuntimeConfig};
use aether::config::{ConfigManager, SessionConfig};
use aether::error::Result;
use aether::rules::Action;
use aether::util::FileLock;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    // Single instance protection
    let lock = match FileLock::acquire("aetherd") {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("Fatal: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    info!("Starting aetherd v{}...", env!("CARGO_PKG_VERSION"));

    // Load persisted config and combine with flags; flags win only when
    // explicitly provided
    let manager = match ConfigManager::new() {
        Ok(manager) => Some(manager),
        Err(e) => {
            warn!("Config persistence disabled: {}", e);
            None
        }
    };

    let mut session = SessionConfig::default();
    if let Some(manager) = &manager {
        match manager.load() {
            Ok(Some(loaded)) => {
                info!("Loaded configuration");
                session = loaded;
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring persisted config: {}", e),
        }
    }
    if let Some(listen) = args.listen {
        session.listen_addr = listen;
    }
    if let Some(http) = args.http {
        session.http_proxy_addr = http;
    }
    if let Some(url) = args.url {
        session.url = url;
    }
    if let Some(psk) = args.psk {
        session.psk = psk;
    }

    let rules = match manager.as_ref().map(|m| m.load_rules()) {
        Some(Ok(Some(rules))) => {
            info!("Loaded {} rules", rules.len());
            rules
        }
        Some(Err(e)) => {
            warn!("Ignoring persisted rules: {}", e);
            Vec::new()
        }
        _ => Vec::new(),
    };

    let runtime_config = RuntimeConfig {
        session,
        api_listen: Some(args.api),
        geoip_file: args.geoip,
        geosite_file: args.geosite,
        rules,
        default_action: Action::Proxy,
        allow_insecure: args.insecure,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(runtime_config, manager)?;
        runtime.run().await
    })?;

    lock.release();
    info!("Goodbye");
    Ok(())
}

/// Command line arguments
struct Args {
    listen: Option<String>,
    http: Option<String>,
    api: String,
    url: Option<String>,
    psk: Option<String>,
    geoip: Option<PathBuf>,
    geosite: Option<PathBuf>,
    insecure: bool,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut listen = None;
        let mut http = None;
        let mut api = "127.0.0.1:9880".to_string();
        let mut url = None;
        let mut psk = None;
        let mut geoip = None;
        let mut geosite = None;
        let mut insecure = false;
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--listen" => {
                    if i + 1 < args.len() {
                        listen = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--http" => {
                    if i + 1 < args.len() {
                        http = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--api" => {
                    if i + 1 < args.len() {
                        api = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--url" => {
                    if i + 1 < args.len() {
                        url = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--psk" => {
                    if i + 1 < args.len() {
                        psk = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--geoip" => {
                    if i + 1 < args.len() {
                        geoip = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--geosite" => {
                    if i + 1 < args.len() {
                        geosite = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "--insecure" => insecure = true,
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            listen,
            http,
            api,
            url,
            psk,
            geoip,
            geosite,
            insecure,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"aetherd - Aether client daemon

USAGE:
    aetherd [OPTIONS]

OPTIONS:
    --listen <ADDR>     SOCKS5 listen address (default: 127.0.0.1:1080)
    --http <ADDR>       HTTP proxy listen address (e.g. 127.0.0.1:1081)
    --api <ADDR>        Admin API listen address (default: 127.0.0.1:9880)
    --url <URL>         WebTransport endpoint URL
    --psk <KEY>         Pre-shared key
    --geoip <FILE>      GeoIP database (geoip.dat, raw or gzipped)
    --geosite <FILE>    GeoSite database (geosite.dat, raw or gzipped)
    --insecure          Skip gateway certificate verification (testing)
    -v, --version       Print version information
    -h, --help          Print help information

EXAMPLES:
    aetherd --url https://relay.example.com/v1/api/sync --psk secret
    aetherd --listen 127.0.0.1:1080 --http 127.0.0.1:1081 --geoip geoip.dat

Values from config.json next to the executable are used unless
overridden by flags. Rules are loaded from rules.json and managed over
the admin API.
"#
    );
}

fn print_version() {
    println!("aetherd v{}", env!("CARGO_PKG_VERSION"));
}
