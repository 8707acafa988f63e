//! Error taxonomy for the router core.
//!
//! Every failure that can happen inside the router is one of the kinds
//! below. Most of them never reach a caller directly -- they are turned
//! into a bounce (see [`crate::router::Router`]'s dispatch path) and the
//! caller only ever observes the bounced stanza. `XdbTimeout` and
//! `ResolverTimeout` are the only kinds surfaced synchronously.

use thiserror::Error;

/// Errors produced while constructing or routing a packet.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A mandatory attribute (`to`, `from`, `ns`, `type`, ...) was missing
    /// while building a [`crate::packet::DPacket`].
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Routing intersection produced no instance and there was no uplink.
    #[error("no route for host {host:?} kind {kind:?}")]
    NoRoute { host: String, kind: crate::packet::Kind },

    /// Routing intersection produced more than one candidate instance.
    #[error("ambiguous route for host {host:?} kind {kind:?}")]
    AmbiguousRoute { host: String, kind: crate::packet::Kind },

    /// A handler returned [`crate::instance::HandlerResult::Err`].
    #[error("handler internal error in instance {instance}: {reason}")]
    HandlerInternal { instance: String, reason: String },

    /// The target instance has no handlers registered at all.
    #[error("instance {0} has no handlers")]
    HandlerMissing(String),

    /// Double-bounce: a packet that already carried `type="error"` failed again.
    #[error("dropping already-bounced packet to {0:?}")]
    LoopGuard(Option<String>),

    /// A DNS pending entry aged out of the queue.
    #[error("dns resolution timed out for {0}")]
    ResolverTimeout(String),

    /// An in-flight XDB request aged past 30s without a reply.
    #[error("xdb request {0} timed out")]
    XdbTimeout(u64),

    /// Configuration failed to parse or validate.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, RouterError>;
