//! Heartbeat: a repeating timer that drives every component's time-based
//! housekeeping -- xdb resend/timeout, dns pending-queue expiry, and the
//! client manager's auth-timeout/keepalive sweeps -- instead of each of
//! them running its own timer task.

use std::sync::Arc;
use std::time::Duration;

use crate::client::ClientManager;
use crate::dns::DnsResolver;
use crate::xdbcache::XdbCache;

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// What the heartbeat found worth telling the owning transport about on one
/// tick. Sweeps that only drop bookkeeping (xdb timeout, dns pending expiry)
/// don't need to surface anything -- they already bounced their packets.
#[derive(Debug, Default)]
pub struct HeartbeatTick {
    pub auth_timed_out_sessions: Vec<String>,
    pub idle_sessions: Vec<String>,
}

/// Owns references to every component with a periodic sweep and runs them
/// all on one shared tick.
pub struct Heartbeat {
    xdb: Option<Arc<XdbCache>>,
    dns: Option<Arc<DnsResolver>>,
    clients: Option<Arc<ClientManager>>,
    tick: Duration,
}

impl Heartbeat {
    pub fn new() -> Self {
        Heartbeat {
            xdb: None,
            dns: None,
            clients: None,
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_xdb(mut self, xdb: Arc<XdbCache>) -> Self {
        self.xdb = Some(xdb);
        self
    }

    pub fn with_dns(mut self, dns: Arc<DnsResolver>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn with_clients(mut self, clients: Arc<ClientManager>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run one sweep across every registered component.
    pub async fn tick_once(&self) -> HeartbeatTick {
        if let Some(xdb) = &self.xdb {
            xdb.sweep().await;
        }
        if let Some(dns) = &self.dns {
            dns.sweep_pending().await;
        }
        let mut result = HeartbeatTick::default();
        if let Some(clients) = &self.clients {
            result.auth_timed_out_sessions = clients.sweep_auth_timeouts().await;
            result.idle_sessions = clients.idle_authd_sessions().await;
        }
        result
    }

    /// Run forever, sweeping every `tick` until `shutdown` fires. Intended
    /// to be spawned as its own task; ticks are not re-entrant, so a slow
    /// sweep simply delays the next one rather than overlapping it.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let tick = self.tick_once().await;
                    for id in &tick.auth_timed_out_sessions {
                        tracing::info!(session = %id, "dropping session: auth timeout");
                    }
                    for id in &tick.idle_sessions {
                        tracing::debug!(session = %id, "session idle, keepalive due");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use std::collections::HashMap;

    #[tokio::test]
    async fn tick_with_no_components_is_a_no_op() {
        let heartbeat = Heartbeat::new();
        let tick = heartbeat.tick_once().await;
        assert!(tick.auth_timed_out_sessions.is_empty());
        assert!(tick.idle_sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_sweeps_xdb_and_reports_session_timeouts() {
        let router = Arc::new(Router::new());
        router.start().await;
        let xdb = Arc::new(XdbCache::new(router.clone()));
        let clients = Arc::new(ClientManager::new(router.clone(), HashMap::new()));

        let heartbeat = Heartbeat::new().with_xdb(xdb.clone()).with_clients(clients.clone());

        let _session = clients.open_session("1@c2s.example.org/a", "sm.example.org").await;
        tokio::time::sleep(Duration::from_secs(121)).await;

        let tick = heartbeat.tick_once().await;
        assert_eq!(tick.auth_timed_out_sessions, vec!["1@c2s.example.org/a".to_string()]);
    }
}
