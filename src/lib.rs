//! WAN relay transport for geo-replicated deployments.
//!
//! A sender site pushes an ordered stream of opaque payloads to a fixed set
//! of server sites over persistent TCP connections, collects per-site
//! acknowledgements, and fires a user predicate whenever the ack vector
//! advances, so higher layers can decide when a write is stable enough.
//!
//! [`WanAgentSender`] and [`WanAgentServer`] are the two entry points; both
//! are built from a validated [`WanConfig`].

pub mod config;
pub mod relay;

pub use config::{ConfigError, SiteConfig, WanConfig};
pub use relay::types::SiteId;
pub use relay::{
    AckCounters, MessageSender, PredicateFn, RelayError, RemoteMessageCallback,
    RemoteMessageService, SenderStats, SeqNo, WanAgentSender, WanAgentServer,
};

/// Crate version, reported in logs by the driver binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
