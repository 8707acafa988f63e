//! XDB request/response correlator.
//!
//! `XdbCache::get`/`set` build an `<xdb/>` request, hand it to the router,
//! and await the matching response by id through a oneshot channel. The
//! matching itself happens in [`XdbResponseHandler`], a PRECOND handler the
//! caller registers on its own instance so promoted xdb-result packets
//! (see `DPacket::new`'s result/error promotion) are intercepted before
//! anything else sees them. `sweep`, driven by the heartbeat, resends a
//! request once after 10s and gives up after 30s.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::{oneshot, Mutex};

use crate::error::{Result, RouterError};
use crate::instance::{Handler, HandlerResult};
use crate::packet::DPacket;
use crate::router::Router;

const RESEND_AFTER: Duration = Duration::from_secs(10);
const TIMEOUT_AFTER: Duration = Duration::from_secs(30);

struct Pending {
    sender: Option<oneshot::Sender<Result<DPacket>>>,
    request: DPacket,
    sent_at: Instant,
    resent: bool,
}

/// Tracks in-flight XDB requests and matches them against their replies.
pub struct XdbCache {
    router: Arc<Router>,
    pending: Mutex<BTreeMap<u64, Pending>>,
    next_id: AtomicU64,
}

impl XdbCache {
    pub fn new(router: Arc<Router>) -> Self {
        XdbCache {
            router,
            pending: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fetch data at `ns` from `host`, as `requester` (the `from` address
    /// responses will be routed back to).
    pub async fn get(&self, requester: &str, host: &str, ns: &str) -> Result<DPacket> {
        self.request(requester, host, ns, "get", None).await
    }

    /// Write `data` at `ns` on `host`.
    pub async fn set(&self, requester: &str, host: &str, ns: &str, data: Element) -> Result<DPacket> {
        self.request(requester, host, ns, "set", Some(data)).await
    }

    /// Perform a non-get/set action (e.g. a targeted delete) at `ns`.
    pub async fn act(&self, requester: &str, host: &str, ns: &str, action: &str, data: Option<Element>) -> Result<DPacket> {
        self.request(requester, host, ns, action, data).await
    }

    async fn request(
        &self,
        requester: &str,
        host: &str,
        ns: &str,
        action: &str,
        data: Option<Element>,
    ) -> Result<DPacket> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut builder = Element::builder("xdb", "jabber:xdb")
            .attr("type", action)
            .attr("to", host)
            .attr("from", requester)
            .attr("ns", ns)
            .attr("id", id.to_string());
        if let Some(child) = data {
            builder = builder.append(child);
        }
        let packet = DPacket::new(builder.build())?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                id,
                Pending {
                    sender: Some(tx),
                    request: packet.deep_clone(),
                    sent_at: Instant::now(),
                    resent: false,
                },
            );
        }

        self.router.deliver(packet).await;

        match tokio::time::timeout(TIMEOUT_AFTER, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouterError::XdbTimeout(id)),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(RouterError::XdbTimeout(id))
            }
        }
    }

    /// Resend requests that have waited past `RESEND_AFTER` without a
    /// reply (once), and give up on anything past `TIMEOUT_AFTER`. Meant
    /// to be called on every heartbeat tick.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut to_resend = Vec::new();
        let mut to_timeout = Vec::new();
        {
            let mut pending = self.pending.lock().await;
            for (&id, entry) in pending.iter_mut() {
                let age = now.duration_since(entry.sent_at);
                if age >= TIMEOUT_AFTER {
                    to_timeout.push(id);
                } else if age >= RESEND_AFTER && !entry.resent {
                    entry.resent = true;
                    to_resend.push(entry.request.deep_clone());
                }
            }
            for id in &to_timeout {
                pending.remove(id);
            }
        }
        for packet in to_resend {
            self.router.deliver(packet).await;
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// PRECOND handler that intercepts xdb replies addressed back to the
/// instance it's registered on, completing the matching in-flight request.
pub struct XdbResponseHandler {
    cache: Arc<XdbCache>,
}

impl XdbResponseHandler {
    pub fn new(cache: Arc<XdbCache>) -> Self {
        XdbResponseHandler { cache }
    }
}

#[async_trait]
impl Handler for XdbResponseHandler {
    async fn handle(&self, _instance: &str, packet: DPacket) -> (HandlerResult, Option<DPacket>) {
        let Some(id) = packet.element.attr("id").and_then(|v| v.parse::<u64>().ok()) else {
            return (HandlerResult::Pass, Some(packet));
        };

        let mut pending = self.cache.pending.lock().await;
        let Some(entry) = pending.get_mut(&id) else {
            drop(pending);
            return (HandlerResult::Pass, Some(packet));
        };
        let Some(sender) = entry.sender.take() else {
            drop(pending);
            return (HandlerResult::Pass, Some(packet));
        };
        pending.remove(&id);
        drop(pending);

        let is_error = packet.element.attr("type") == Some("error");
        let outcome = if is_error {
            Err(RouterError::HandlerInternal {
                instance: "xdbcache".into(),
                reason: "xdb request returned an error response".into(),
            })
        } else {
            Ok(packet)
        };
        let _ = sender.send(outcome);
        (HandlerResult::Done, None)
    }

    fn name(&self) -> &str {
        "xdb-response-handler"
    }
}
