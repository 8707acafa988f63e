//! The logging facade: builds `<log/>` packets and hands them to the
//! router, and mirrors the same event through `tracing` for local
//! diagnostics that don't need to travel through the routing fabric.
//!
//! A `<log/>` packet's `from` attribute carries the host it's about
//! (`"-internal"` when there isn't one), and `type` is `notice`, `warn`,
//! `alert`, or `record`. Any LOG-table instance registered for that host
//! (or the wildcard `*` host) receives it -- typically a logfile writer or
//! an admin-alert component.

use std::sync::Arc;

use minidom::Element;

use crate::packet::DPacket;
use crate::router::Router;

const INTERNAL_HOST: &str = "-internal";

pub struct Logger {
    router: Arc<Router>,
}

impl Logger {
    pub fn new(router: Arc<Router>) -> Self {
        Logger { router }
    }

    pub async fn notice(&self, host: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(target: "stanzad::log", host = host.unwrap_or(INTERNAL_HOST), %message);
        self.send("notice", host, message).await;
    }

    pub async fn warn(&self, host: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(target: "stanzad::log", host = host.unwrap_or(INTERNAL_HOST), %message);
        self.send("warn", host, message).await;
    }

    pub async fn alert(&self, host: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(target: "stanzad::log", host = host.unwrap_or(INTERNAL_HOST), %message);
        self.send("alert", host, message).await;
    }

    /// A structured record: `"{kind} {action} {detail}"`, used for audit
    /// trails (message delivery counters, login records) rather than
    /// free-text diagnostics.
    pub async fn record(&self, host: Option<&str>, kind: &str, action: &str, detail: &str) {
        tracing::info!(target: "stanzad::log::record", host = host.unwrap_or(INTERNAL_HOST), kind, action, detail);
        let text = format!("{kind} {action} {detail}");
        self.send("record", host, text).await;
    }

    async fn send(&self, kind: &str, host: Option<&str>, message: String) {
        let element = Element::builder("log", "")
            .attr("type", kind)
            .attr("from", host.unwrap_or(INTERNAL_HOST))
            .append(message)
            .build();
        match DPacket::new(element) {
            Ok(packet) => self.router.deliver(packet).await,
            Err(e) => tracing::error!("failed to build log packet: {e}"),
        }
    }
}
