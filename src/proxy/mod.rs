//! Local proxy protocols
//!
//! The daemon accepts application traffic through a local SOCKS5 listener
//! and, optionally, an HTTP CONNECT listener. A protocol implementation
//! parses the handshake into a destination address and later sends the
//! grant or refusal reply once the rule engine has decided the action.

mod http;
mod socks5;

pub use http::HttpProxy;
pub use socks5::Socks5Proxy;

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};

/// Outcome of rule evaluation, as answered to the local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed; the relay starts after this reply.
    Granted,
    /// Refuse with the protocol's error reply.
    Refused,
}

/// A local proxy handshake protocol.
#[async_trait]
pub trait InboundProxy: Send + Sync {
    /// Parse the inbound handshake up to, but not including, the reply.
    /// Returns the requested destination and the stream positioned at the
    /// start of application data.
    async fn read_request(&self, stream: Stream) -> Result<(Address, Stream)>;

    /// Send the reply for the verdict. Granted replies must be sent before
    /// any relayed bytes.
    async fn respond(&self, stream: &mut Stream, verdict: Verdict) -> Result<()>;

    /// Protocol name for logging
    fn name(&self) -> &'static str;
}
