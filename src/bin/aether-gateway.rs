//! aether-gateway - Aether edge relay
//!
//! Terminates WebTransport sessions, decrypts the record protocol and
//! dials the tunneled destinations.

use std::path::PathBuf;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use aether::error::Result;
use aether::gateway::{Gateway, GatewayConfig};

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("aether-gateway v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let Some(psk) = args.psk else {
        eprintln!("PSK is required (--psk)");
        std::process::exit(1);
    };

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

    let listen = args
        .listen
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("Invalid listen address {}: {}", args.listen, e);
            std::process::exit(1);
        });

    let config = GatewayConfig {
        listen,
        cert_file: args.cert,
        key_file: args.key,
        psk,
        path: args.path,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async { Gateway::new(config).run().await })
}

/// Command line arguments
struct Args {
    listen: String,
    cert: PathBuf,
    key: PathBuf,
    psk: Option<String>,
    path: String,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut listen = "0.0.0.0:4433".to_string();
        let mut cert = PathBuf::from("cert.pem");
        let mut key = PathBuf::from("key.pem");
        let mut psk = None;
        let mut path = "/v1/api/sync".to_string();
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--listen" => {
                    if i + 1 < args.len() {
                        listen = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--cert" => {
                    if i + 1 < args.len() {
                        cert = PathBuf::from(&args[i + 1]);
                        i += 1;
                    }
                }
                "--key" => {
                    if i + 1 < args.len() {
                        key = PathBuf::from(&args[i + 1]);
                        i += 1;
                    }
                }
                "--psk" => {
                    if i + 1 < args.len() {
                        psk = Some(args[i + 1].clone());
                        i += 1;
                    }
                }
                "--path" => {
                    if i + 1 < args.len() {
                        path = args[i + 1].clone();
                        i += 1;
                    }
                }
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
            cert,
            key,
            psk,
            path,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"aether-gateway - Aether edge relay

USAGE:
    aether-gateway --psk <KEY> [OPTIONS]

OPTIONS:
    --listen <ADDR>     Listen address (default: 0.0.0.0:4433)
    --cert <FILE>       TLS certificate file (default: cert.pem)
    --key <FILE>        TLS key file (default: key.pem)
    --psk <KEY>         Pre-shared key (required)
    --path <PATH>       WebTransport upgrade path (default: /v1/api/sync)
    -v, --version       Print version information
    -h, --help          Print help information
"#
    );
}
