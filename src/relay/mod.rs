//! Concurrent message-exchange engine
//!
//! The sender side owns one persistent outbound TCP connection per server
//! site, a shared send buffer drained by a single multiplexed send loop,
//! and a companion ack-receive loop that drives the per-site ack counters.
//! The server side accepts a fixed set of inbound connections and runs one
//! sequential worker per peer. The two directions of every connection are
//! serviced by independent loops so a stalled send never blocks ack
//! processing.

pub mod agent;
pub mod buffer;
pub mod counters;
pub mod sender;
pub mod server;
pub mod shutdown;
pub mod types;
pub mod wire;

use std::io;
use std::net::SocketAddr;

use crate::config::ConfigError;
use types::SiteId;

// Re-exports
pub use agent::{WanAgentSender, WanAgentServer};
pub use counters::AckCounters;
pub use sender::{MessageSender, SenderStats};
pub use server::RemoteMessageService;
pub use shutdown::Shutdown;
pub use types::{PredicateFn, ReadyNotifier, RemoteMessageCallback, ReportAckFn, SeqNo};
pub use wire::{RequestHeader, Response, REQUEST_HEADER_SIZE, RESPONSE_SIZE};

/// Errors raised by the relay cores.
///
/// Construction errors surface to the caller. In-loop I/O errors terminate
/// a single worker on the server side but are fatal for the sender core,
/// which has no reconnection logic. Ack ordering violations are fatal
/// protocol violations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind 0.0.0.0:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to site {site_id} at {addr}: {source}")]
    Connect {
        site_id: SiteId,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("connection to site {site_id} failed: {source}")]
    Connection {
        site_id: SiteId,
        #[source]
        source: io::Error,
    },

    #[error("payload of {size} bytes exceeds the maximum payload size {max}")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error("ack sequence out of order for site {site_id}: counter = {counter}, seqno = {seqno}")]
    AckOutOfOrder {
        site_id: SiteId,
        counter: u64,
        seqno: u64,
    },

    #[error("received ack from unknown site {site_id}")]
    UnknownAckSite { site_id: SiteId },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
