//! Aether - an encrypted traffic-forwarding relay
//!
//! The daemon (`aetherd`) accepts application traffic on a local SOCKS5 or
//! HTTP CONNECT socket, routes each connection through a rule engine, and
//! either connects directly or tunnels the bytes as authenticated,
//! padded records over a WebTransport session. The gateway
//! (`aether-gateway`) terminates the records and dials the destination.
//!
//! ```text
//! app → SOCKS5/HTTP → rules (geoip/geosite) ─┬→ direct TCP
//!                                            └→ records over WebTransport → gateway → TCP
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/    # Core types: Stream, Address, relay loops
//! ├── crypto/    # Per-stream key derivation, AEAD primitives
//! ├── record/    # Wire codec, replay cache, record reader
//! ├── geo/       # GeoIP trie, GeoSite matcher, geodata parser
//! ├── rules/     # Rule engine
//! ├── proxy/     # Local SOCKS5 / HTTP CONNECT handshakes
//! ├── tunnel/    # WebTransport client
//! ├── gateway/   # Gateway session handler
//! └── app/       # Dispatcher, runtime, admin API, metrics
//! ```

pub mod common;
pub mod error;

pub mod app;
pub mod config;
pub mod crypto;
pub mod gateway;
pub mod geo;
pub mod proxy;
pub mod record;
pub mod rules;
pub mod tunnel;
pub mod util;

// Re-exports for convenience
pub use common::{Address, Stream};
pub use config::SessionConfig;
pub use error::{Error, Result};

pub use app::{Dispatcher, Runtime, RuntimeConfig};
pub use gateway::{Gateway, GatewayConfig};
pub use record::{RecordCodec, RecordReader, ReplayCache};
pub use rules::RuleEngine;
pub use tunnel::TunnelClient;
