//! The router: host-keyed routing tables, intersection lookup, and bounce.
//!
//! Three independent tables -- NORM (which also carries ROUTE packets),
//! XDB, and LOG -- each map a host to a bag of registered instances. XDB
//! registrations additionally carry a namespace selector and LOG
//! registrations a log-type selector; a lookup intersects the host bag
//! against the requested selector, and an instance registered with no
//! selector matches any value (a wildcard sink). Either axis falls back to
//! a `"*"`-keyed bag when the requested host or selector has no entry of
//! its own, the same retry `deliver_hashmatch()` in the original C router
//! performs. Delivery to a single matching instance proceeds through its
//! handler chain; zero matches fall back to the uplink (or bounce), more
//! than one is an ambiguous-route bounce.
//!
//! A packet addressed to a host starting with `'-'` never reaches the
//! ordinary tables at all: it's intercepted by the internal-xdb dispatcher,
//! which handles dynamic (un)registration and config-subtree echo requests
//! components send to the router itself.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use minidom::Element;
use tokio::sync::Mutex;

use crate::error::RouterError;
use crate::instance::{DispatchOutcome, Instance};
use crate::packet::{DPacket, Kind};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which routing table a packet kind is dispatched through. ROUTE packets
/// share the NORM table; a packet classified `Kind::None` never reaches the
/// router (rejected at `DPacket::new`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Norm,
    Xdb,
    Log,
}

impl TableKind {
    fn from_packet_kind(kind: Kind) -> Option<TableKind> {
        match kind {
            Kind::Norm | Kind::Route => Some(TableKind::Norm),
            Kind::Xdb => Some(TableKind::Xdb),
            Kind::Log => Some(TableKind::Log),
            Kind::None => None,
        }
    }
}

struct Entry {
    instance: Arc<Instance>,
    /// XDB namespace or LOG type this registration is scoped to; `None`
    /// matches any selector requested against this host.
    selector: Option<String>,
    /// Statically declared instances (from the config tree) ignore
    /// `unregister` calls.
    is_static: bool,
}

enum StartupState {
    Buffering(Vec<DPacket>),
    Started,
}

/// The `"*"` sentinel host/selector key every lookup falls back to.
pub const WILDCARD: &str = "*";

/// The stanza router: owns every routing table and the uplink fallback.
pub struct Router {
    tables: Mutex<HashMap<TableKind, HashMap<String, Vec<Entry>>>>,
    uplink: Mutex<Option<Arc<Instance>>>,
    startup: Mutex<StartupState>,
    /// Every registered instance, keyed by id, for the internal-xdb
    /// dispatcher to look a sender up by its `from` address.
    instances: Mutex<HashMap<String, Arc<Instance>>>,
    /// Each instance's own `<service>`/`<xdb>`/`<log>` config subtree, for
    /// the internal-xdb `config` node to echo matching children back from.
    instance_configs: Mutex<HashMap<String, Element>>,
    /// Bare from-addresses whose traffic is silently dropped.
    null_source: Mutex<Vec<String>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            tables: Mutex::new(HashMap::new()),
            uplink: Mutex::new(None),
            startup: Mutex::new(StartupState::Buffering(Vec::new())),
            instances: Mutex::new(HashMap::new()),
            instance_configs: Mutex::new(HashMap::new()),
            null_source: Mutex::new(Vec::new()),
        }
    }

    /// Register an instance under `host` for the given table. `selector` is
    /// the XDB namespace or LOG type this registration answers for, and is
    /// ignored for the NORM table. `is_static` marks an instance declared in
    /// configuration, which `unregister` cannot remove.
    pub async fn register(
        &self,
        kind: TableKind,
        host: impl Into<String>,
        instance: Arc<Instance>,
        selector: Option<String>,
        is_static: bool,
    ) {
        self.instances
            .lock()
            .await
            .entry(instance.id.clone())
            .or_insert_with(|| instance.clone());
        let mut tables = self.tables.lock().await;
        tables
            .entry(kind)
            .or_default()
            .entry(host.into())
            .or_default()
            .push(Entry {
                instance,
                selector,
                is_static,
            });
    }

    /// Remove a dynamically registered instance. A no-op if the entry is
    /// static or not present.
    pub async fn unregister(&self, kind: TableKind, host: &str, instance_id: &str) {
        let mut tables = self.tables.lock().await;
        if let Some(bag) = tables.get_mut(&kind).and_then(|m| m.get_mut(host)) {
            bag.retain(|e| e.is_static || e.instance.id != instance_id);
        }
    }

    pub async fn set_uplink(&self, instance: Option<Arc<Instance>>) {
        *self.uplink.lock().await = instance;
    }

    /// Record `instance`'s own config subtree, for internal-xdb `config`
    /// requests to echo matching children back from.
    pub async fn set_instance_config(&self, instance_id: impl Into<String>, config: Element) {
        self.instance_configs.lock().await.insert(instance_id.into(), config);
    }

    /// Replace the null-source list: from-bare-addresses whose traffic is
    /// dropped at dispatch rather than routed.
    pub async fn set_null_source(&self, sources: Vec<String>) {
        *self.null_source.lock().await = sources;
    }

    /// Mark the router started and flush anything buffered while it wasn't.
    /// Packets that still can't be routed after the flush are bounced
    /// normally, same as any post-startup delivery failure.
    pub async fn start(&self) {
        let queued = {
            let mut startup = self.startup.lock().await;
            match std::mem::replace(&mut *startup, StartupState::Started) {
                StartupState::Buffering(q) => q,
                StartupState::Started => Vec::new(),
            }
        };
        for packet in queued {
            self.deliver(packet).await;
        }
    }

    /// Deliver a packet. Before startup, packets are queued rather than
    /// routed or bounced. Never fails to the caller: every failure mode is
    /// either a bounce or a logged drop performed internally.
    pub fn deliver<'a>(&'a self, packet: DPacket) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            {
                let mut startup = self.startup.lock().await;
                if let StartupState::Buffering(queue) = &mut *startup {
                    queue.push(packet);
                    return;
                }
            }
            self.dispatch(packet).await;
        })
    }

    async fn dispatch(&self, packet: DPacket) {
        if packet.kind == Kind::Xdb && packet.host.starts_with('-') {
            self.dispatch_internal_xdb(packet).await;
            return;
        }

        if self.is_null_source(&packet).await {
            tracing::debug!(host = %packet.host, from = ?packet.from, "dropping null-source packet");
            return;
        }

        let Some(table_kind) = TableKind::from_packet_kind(packet.kind) else {
            tracing::warn!("dropping packet with no routing table");
            return;
        };

        let selector = match table_kind {
            TableKind::Xdb => packet.element.attr("ns").map(str::to_string),
            TableKind::Log => packet.element.attr("type").map(str::to_string),
            TableKind::Norm => None,
        };

        let mut candidates = self.lookup(table_kind, &packet.host, selector.as_deref()).await;

        match candidates.len() {
            1 => {
                let instance = candidates.remove(0);
                self.dispatch_to_instance(instance, packet).await;
            }
            0 => {
                if !packet.host.starts_with('-') {
                    if let Some(uplink) = self.uplink.lock().await.clone() {
                        self.dispatch_to_instance(uplink, packet).await;
                        return;
                    }
                }
                let err = RouterError::NoRoute { host: packet.host.clone(), kind: packet.kind };
                tracing::debug!(error = %err);
                if let Some(bounce) = self.build_bounce(packet, &err.to_string()) {
                    self.deliver(bounce).await;
                }
            }
            _ => {
                let err = RouterError::AmbiguousRoute { host: packet.host.clone(), kind: packet.kind };
                tracing::warn!(error = %err, candidates = candidates.len());
                if let Some(bounce) = self.build_bounce(packet, &err.to_string()) {
                    self.deliver(bounce).await;
                }
            }
        }
    }

    /// Drop-and-free check for the configured null-source list: packets
    /// whose bare from-address is on the list never reach a routing table.
    async fn is_null_source(&self, packet: &DPacket) -> bool {
        let Some(from) = &packet.from else {
            return false;
        };
        let bare = from.bare();
        self.null_source.lock().await.iter().any(|blocked| blocked == &bare)
    }

    /// Intersect two bags per the intersection algorithm: `A` is the host
    /// table's bag (falling back to the `"*"` host), `B` is the namespace
    /// or log-type table's bag keyed by the requested selector (falling
    /// back to the `"*"` selector). If only one bag is non-empty it alone
    /// decides the match; if both are non-empty, only instances present in
    /// both count.
    pub(crate) async fn lookup(&self, kind: TableKind, host: &str, selector: Option<&str>) -> Vec<Arc<Instance>> {
        let tables = self.tables.lock().await;
        let Some(table) = tables.get(&kind) else {
            return Vec::new();
        };

        let a: Vec<Arc<Instance>> = match table.get(host).or_else(|| table.get(WILDCARD)) {
            Some(bag) => bag.iter().map(|e| e.instance.clone()).collect(),
            None => Vec::new(),
        };

        let Some(wanted) = selector else {
            return a;
        };

        let b = Self::selector_bag(table, wanted);

        if a.is_empty() {
            return b;
        }
        if b.is_empty() {
            return a;
        }
        a.into_iter()
            .filter(|inst| b.iter().any(|other| Arc::ptr_eq(inst, other)))
            .collect()
    }

    /// The namespace/log-type secondary bag: every instance, across every
    /// host bucket, registered with `selector == wanted` or no selector at
    /// all (a universal sink matches any ns/type), falling back to whatever
    /// registered the explicit `"*"` selector if nothing matched exactly.
    /// Host-independent, matching the separate ns/logtype table the
    /// intersection algorithm calls for.
    fn selector_bag(table: &HashMap<String, Vec<Entry>>, wanted: &str) -> Vec<Arc<Instance>> {
        let exact: Vec<Arc<Instance>> = table
            .values()
            .flatten()
            .filter(|e| e.selector.is_none() || e.selector.as_deref() == Some(wanted))
            .map(|e| e.instance.clone())
            .collect();
        if !exact.is_empty() {
            return exact;
        }
        table
            .values()
            .flatten()
            .filter(|e| e.selector.as_deref() == Some(WILDCARD))
            .map(|e| e.instance.clone())
            .collect()
    }

    async fn dispatch_internal_xdb(&self, packet: DPacket) {
        let Some(from) = packet.from.as_ref() else {
            tracing::warn!("internal xdb packet missing from address");
            return;
        };
        let from_id = from.domain.clone();

        let Some(node) = packet.element.children().next().map(|c| c.name().to_string()) else {
            tracing::warn!(from = %from_id, "internal xdb packet carries no resource node");
            return;
        };

        match node.as_str() {
            "config" => self.internal_xdb_config(packet, &from_id).await,
            "host" => self.internal_xdb_host(packet, &from_id, true).await,
            "unhost" => self.internal_xdb_host(packet, &from_id, false).await,
            other => tracing::warn!(node = other, from = %from_id, "unrecognized internal xdb node"),
        }
    }

    /// `-internal xdb config`: echo the sending instance's own config
    /// subtree (filtered to the requested namespace, if any) back as an
    /// xdb result, handed straight back to the sender's own handler chain
    /// rather than re-routed.
    async fn internal_xdb_config(&self, mut packet: DPacket, from_id: &str) {
        let requested_ns = packet.element.attr("ns").map(str::to_string);
        let subtree = self.instance_configs.lock().await.get(from_id).cloned();

        if let Some(subtree) = subtree {
            for child in subtree.children() {
                let matches_ns = requested_ns.as_deref().map(|ns| child.ns() == ns).unwrap_or(true);
                if matches_ns {
                    packet.element.append_child(child.clone());
                }
            }
        }

        packet.swap_to_from();
        packet.element.set_attr("type", "result");
        packet.kind = Kind::Norm;
        packet.host = packet.to.as_ref().map(|j| j.domain.clone()).unwrap_or_default();

        let Some(instance) = self.instances.lock().await.get(from_id).cloned() else {
            tracing::warn!(from = %from_id, "internal xdb config request from unregistered instance");
            return;
        };
        self.dispatch_to_instance(instance, packet).await;
    }

    /// `-internal xdb host`/`unhost`: dynamically register or unregister
    /// the sending instance for the domain named by the request's resource
    /// node, in the NORM table.
    async fn internal_xdb_host(&self, packet: DPacket, from_id: &str, register: bool) {
        let Some(domain) = packet.element.children().next().map(|c| c.text()) else {
            tracing::warn!(from = %from_id, "internal xdb host request has no domain");
            return;
        };
        let Some(instance) = self.instances.lock().await.get(from_id).cloned() else {
            tracing::warn!(from = %from_id, "internal xdb host request from unregistered instance");
            return;
        };
        if register {
            self.register(TableKind::Norm, domain, instance, None, false).await;
        } else {
            self.unregister(TableKind::Norm, &domain, from_id).await;
        }
    }

    async fn dispatch_to_instance(&self, instance: Arc<Instance>, packet: DPacket) {
        match instance.deliver(packet).await {
            DispatchOutcome::Consumed => {}
            DispatchOutcome::Dropped => {
                tracing::debug!(instance = %instance.id, "packet ran off the end of the handler chain");
            }
            DispatchOutcome::HandlerError(handler, maybe_packet) => {
                let err = RouterError::HandlerInternal {
                    instance: instance.id.clone(),
                    reason: handler,
                };
                match maybe_packet {
                    Some(packet) => {
                        if let Some(bounce) = self.build_bounce(packet, &err.to_string()) {
                            self.deliver(bounce).await;
                        }
                    }
                    None => {
                        tracing::warn!(error = %err, "handler reported an error after consuming the packet");
                    }
                }
            }
            DispatchOutcome::NoHandlers(packet) => {
                let err = RouterError::HandlerMissing(instance.id.clone());
                tracing::warn!(error = %err);
                if let Some(bounce) = self.build_bounce(packet, &err.to_string()) {
                    self.deliver(bounce).await;
                }
            }
        }
    }

    /// Build the bounce for an undeliverable packet, or `None` if it must
    /// just be dropped: LOG packets have no sender to bounce to, and a
    /// packet that already carries `type="error"` is a double-bounce,
    /// caught by the loop guard.
    fn build_bounce(&self, mut packet: DPacket, reason: &str) -> Option<DPacket> {
        if packet.kind == Kind::Log {
            tracing::warn!(host = %packet.host, reason, "dropping undeliverable log packet");
            return None;
        }
        if packet.element.attr("type") == Some("error") {
            let err = RouterError::LoopGuard(packet.to.as_ref().map(|j| j.to_string()));
            tracing::warn!(error = %err, reason, "dropping already-bounced packet");
            return None;
        }
        packet.swap_to_from();
        packet.element.set_attr("type", "error");
        packet.host = packet.to.as_ref().map(|j| j.domain.clone()).unwrap_or_default();
        // An xdb bounce rejoins ordinary stanza routing, same as a real
        // result/error reply would via `DPacket::new`'s promotion rule.
        if packet.kind == Kind::Xdb {
            packet.kind = Kind::Norm;
        }
        tracing::debug!(host = %packet.host, reason, "bouncing packet");
        Some(packet)
    }
}
