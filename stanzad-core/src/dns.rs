//! Async DNS sub-resolver.
//!
//! Packets addressed to a host with no IP/route information yet are handed
//! to [`DnsResolver::resolve`], which coalesces concurrent lookups for the
//! same hostname, resolves an SRV-advertised service first (falling back to
//! plain A/AAAA), and caches the result -- positive entries for
//! `cache_timeout`, negative ones ten times faster, matching the historical
//! "cached failures expire quicker" behavior. A resolved packet is wrapped
//! in a ROUTE envelope carrying the resolved `ip` attribute and handed back
//! to the router; an unresolved one is bounced with a resolver error.
//!
//! Where the coprocess model used a fork/pipe child and its own xstream
//! parser, this is a single in-process task driven by `hickory-resolver`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_resolver::TokioResolver;
use rand::Rng;
use tokio::sync::Mutex;

use crate::packet::DPacket;
use crate::router::Router;

const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(60);

/// Failure to stand up the resolver itself (bad system config, no
/// nameservers reachable at startup) -- distinct from a per-lookup miss,
/// which is never an error, just a negative cache entry.
#[derive(Debug, thiserror::Error)]
#[error("failed to initialize dns resolver: {0}")]
pub struct DnsInitError(String);

/// One `<resend service="..."/>` entry: the SRV service to try, and the
/// weighted set of hosts a resolved packet should be routed back to.
pub struct ResendService {
    pub service: String,
    pub hosts: Vec<(String, u32)>,
}

impl ResendService {
    fn pick_host(&self) -> &str {
        let weight_sum: u32 = self.hosts.iter().map(|(_, w)| *w).sum();
        if weight_sum <= 1 || self.hosts.len() == 1 {
            return &self.hosts[0].0;
        }
        let mut die = rand::rng().random_range(0..weight_sum);
        for (host, weight) in &self.hosts {
            if die < *weight {
                return host;
            }
            die -= weight;
        }
        &self.hosts.last().unwrap().0
    }
}

#[derive(Clone)]
struct CacheEntry {
    /// `None` is a cached resolution failure.
    resolved: Option<(String, String)>,
    cached_at: Instant,
}

struct PendingEntry {
    packets: Vec<DPacket>,
    queued_at: Instant,
}

/// The DNS sub-resolver: hostname coalescing queue, TTL cache, and the
/// service/resend-host table used to pick where a resolved packet goes.
pub struct DnsResolver {
    router: Arc<Router>,
    resolver: TokioResolver,
    services: Vec<ResendService>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_timeout: Duration,
    queue_timeout: Duration,
}

impl DnsResolver {
    pub fn new(router: Arc<Router>, services: Vec<ResendService>) -> Result<Self, DnsInitError> {
        Ok(DnsResolver {
            router,
            resolver: TokioResolver::builder_tokio()
                .map_err(|e| DnsInitError(e.to_string()))?
                .build(),
            services,
            pending: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
        })
    }

    /// Resolve `packet.host` (already validated not to carry `ip`/`iperror`
    /// by the caller -- see the loop-guard note on [`crate::router::Router`]'s
    /// bounce logic) and hand the result back to the router. If a lookup
    /// for this hostname is already in flight, queue behind it instead of
    /// issuing a second one.
    pub async fn resolve(&self, packet: DPacket) {
        let host = packet.host.clone();

        {
            let mut pending = self.pending.lock().await;
            if let Some(entry) = pending.get_mut(&host) {
                entry.packets.insert(0, packet);
                return;
            }
        }

        if let Some(cached) = self.cache_lookup(&host).await {
            self.resend_all(vec![packet], cached).await;
            return;
        }

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                host.clone(),
                PendingEntry {
                    packets: vec![packet],
                    queued_at: Instant::now(),
                },
            );
        }

        let ascii_host = idna::domain_to_ascii(&host).unwrap_or_else(|_| host.clone());
        let result = self.lookup(&ascii_host).await;

        self.cache
            .lock()
            .await
            .insert(host.clone(), CacheEntry { resolved: result.clone(), cached_at: Instant::now() });

        let waiting = self.pending.lock().await.remove(&host);
        if let Some(entry) = waiting {
            self.resend_all(entry.packets, result).await;
        }
    }

    async fn cache_lookup(&self, host: &str) -> Option<Option<(String, String)>> {
        let mut cache = self.cache.lock().await;
        let entry = cache.get(host)?;
        let timeout = if entry.resolved.is_none() {
            self.cache_timeout / 10
        } else {
            self.cache_timeout
        };
        if entry.cached_at.elapsed() > timeout {
            cache.remove(host);
            return None;
        }
        Some(entry.resolved.clone())
    }

    async fn resend_all(&self, packets: Vec<DPacket>, result: Option<(String, String)>) {
        for mut packet in packets {
            match &result {
                Some((ip, resend_to)) => {
                    packet.element.set_attr("ip", ip.as_str());
                    wrap_as_route(&mut packet, resend_to);
                }
                None => {
                    packet.element.set_attr("iperror", "");
                    packet.element.set_attr("type", "error");
                }
            }
            if let Ok(wrapped) = DPacket::new(packet.element) {
                self.router.deliver(wrapped).await;
            }
        }
    }

    async fn lookup(&self, host: &str) -> Option<(String, String)> {
        for service in &self.services {
            if let Ok(srv) = self.resolver.srv_lookup(format!("{}.{}", service.service, host)).await {
                if let Some(record) = srv.iter().next() {
                    let target = record.target().to_utf8();
                    if let Ok(ips) = self.resolver.lookup_ip(target.trim_end_matches('.')).await {
                        if let Some(ip) = ips.iter().next() {
                            return Some((ip.to_string(), service.pick_host().to_string()));
                        }
                    }
                }
            }
        }

        let ips = self.resolver.lookup_ip(host).await.ok()?;
        let ip = ips.iter().next()?;
        Some((ip.to_string(), host.to_string()))
    }

    /// Drop any pending lookup that has waited past `queue_timeout`,
    /// bouncing every packet still queued behind it. Driven by the
    /// heartbeat, same cadence as the original's `queuetimeout` beat.
    pub async fn sweep_pending(&self) {
        let now = Instant::now();
        let timed_out: Vec<(String, Vec<DPacket>)> = {
            let mut pending = self.pending.lock().await;
            let expired: Vec<String> = pending
                .iter()
                .filter(|(_, e)| now.duration_since(e.queued_at) > self.queue_timeout)
                .map(|(host, _)| host.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|host| pending.remove(&host).map(|e| (host, e.packets)))
                .collect()
        };

        for (host, packets) in timed_out {
            tracing::warn!(host = %host, "dns lookup timed out, bouncing queued packets");
            self.resend_all(packets, None).await;
        }
    }
}

fn wrap_as_route(packet: &mut DPacket, resend_to: &str) {
    let inner = packet.element.clone();
    let wrapper = minidom::Element::builder("route", "")
        .attr("to", resend_to)
        .append(inner)
        .build();
    packet.element = wrapper;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_pick_returns_only_host_when_single() {
        let svc = ResendService {
            service: "_xmpp-server._tcp".into(),
            hosts: vec![("s2s-1".into(), 1)],
        };
        assert_eq!(svc.pick_host(), "s2s-1");
    }

    #[test]
    fn weighted_pick_stays_within_hosts() {
        let svc = ResendService {
            service: "_xmpp-server._tcp".into(),
            hosts: vec![("a".into(), 3), ("b".into(), 1)],
        };
        for _ in 0..50 {
            let pick = svc.pick_host();
            assert!(pick == "a" || pick == "b");
        }
    }
}
