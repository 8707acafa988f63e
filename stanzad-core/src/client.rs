//! Client connection manager: the routing-visible slice.
//!
//! The accept loop, raw socket I/O, TLS, and SASL/legacy-auth application
//! logic all live outside this crate. What belongs here is the session
//! state machine that decides, for each inbound stanza, whether it's
//! still waiting on authentication or can be wrapped and routed -- the
//! same decisions the original session manager's `c2s` glue made, just
//! without owning a file descriptor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::Mutex;

use crate::instance::{Handler, HandlerResult};
use crate::packet::DPacket;
use crate::router::Router;

pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unknown,
    AwaitingAuthReply,
    AwaitingSessionResult,
    Authd,
}

/// A client connection's routing-visible state. `id` is the session key,
/// shaped like a JID (`"<fd>@<mgr-host>/<cookie>"`) so it can be used
/// directly as a `from` address.
pub struct ClientSession {
    pub id: String,
    downstream_host: String,
    state: Mutex<State>,
    queued: Mutex<Vec<DPacket>>,
    session_id: Mutex<Option<String>>,
    connected_at: Instant,
    last_activity: Mutex<Instant>,
}

impl ClientSession {
    pub async fn is_authd(&self) -> bool {
        *self.state.lock().await == State::Authd
    }
}

/// Owns every live client session and the static host-alias table used to
/// map an advertised `to` onto a downstream session-manager domain.
pub struct ClientManager {
    router: Arc<Router>,
    aliases: HashMap<String, String>,
    sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    auth_timeout: Duration,
    heartbeat_period: Duration,
}

impl ClientManager {
    pub fn new(router: Arc<Router>, aliases: HashMap<String, String>) -> Self {
        ClientManager {
            router,
            aliases,
            sessions: Mutex::new(HashMap::new()),
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
        }
    }

    /// Register a new UNKNOWN session for connection `id`, resolving
    /// `advertised_to` through the alias table.
    pub async fn open_session(&self, id: impl Into<String>, advertised_to: &str) -> Arc<ClientSession> {
        let downstream_host = self
            .aliases
            .get(advertised_to)
            .cloned()
            .unwrap_or_else(|| advertised_to.to_string());
        let session = Arc::new(ClientSession {
            id: id.into(),
            downstream_host,
            state: Mutex::new(State::Unknown),
            queued: Mutex::new(Vec::new()),
            session_id: Mutex::new(None),
            connected_at: Instant::now(),
            last_activity: Mutex::new(Instant::now()),
        });
        self.sessions.lock().await.insert(session.id.clone(), session.clone());
        session
    }

    pub async fn close_session(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }

    /// Handle one inbound stanza from `session`. UNKNOWN sessions forward
    /// auth/register queries straight to the downstream host and queue
    /// everything else; AUTHD sessions wrap and route immediately.
    pub async fn handle_inbound(&self, session: &Arc<ClientSession>, packet: DPacket) {
        *session.last_activity.lock().await = Instant::now();

        let current = *session.state.lock().await;
        match current {
            State::Unknown => {
                if is_auth_or_register_query(&packet.element) {
                    self.forward_auth_query(session, packet).await;
                } else {
                    session.queued.lock().await.push(packet);
                }
            }
            State::AwaitingAuthReply | State::AwaitingSessionResult => {
                session.queued.lock().await.push(packet);
            }
            State::Authd => {
                self.wrap_and_route(session, packet).await;
            }
        }
    }

    async fn forward_auth_query(&self, session: &Arc<ClientSession>, mut packet: DPacket) {
        packet.element.set_attr("from", session.id.as_str());
        packet.element.set_attr("to", session.downstream_host.as_str());
        *session.state.lock().await = State::AwaitingAuthReply;
        if let Ok(rebuilt) = DPacket::new(packet.element) {
            self.router.deliver(rebuilt).await;
        }
    }

    async fn send_session_route(&self, session: &Arc<ClientSession>) {
        let element = Element::builder("route", "")
            .attr("type", "session")
            .attr("to", session.downstream_host.as_str())
            .attr("from", session.id.as_str())
            .build();
        if let Ok(packet) = DPacket::new(element) {
            self.router.deliver(packet).await;
        }
    }

    /// Called when a stanza addressed back to `session.id` arrives: either
    /// the auth query's reply or the session-route's reply, depending on
    /// where the session currently sits in the handshake.
    async fn on_downstream_reply(&self, session: &Arc<ClientSession>, packet: DPacket) {
        let result = packet.element.attr("type") == Some("result")
            || packet
                .element
                .children()
                .next()
                .map(|c| c.attr("type") == Some("result"))
                .unwrap_or(false);

        let current = *session.state.lock().await;
        match current {
            State::AwaitingAuthReply => {
                if result {
                    *session.state.lock().await = State::AwaitingSessionResult;
                    self.send_session_route(session).await;
                } else {
                    *session.state.lock().await = State::Unknown;
                    tracing::debug!(session = %session.id, "auth query rejected by downstream");
                }
            }
            State::AwaitingSessionResult => {
                if result {
                    let new_session_id = packet
                        .element
                        .attr("from")
                        .map(str::to_string)
                        .unwrap_or_else(|| session.id.clone());
                    *session.session_id.lock().await = Some(new_session_id);
                    *session.state.lock().await = State::Authd;
                    self.drain_queue(session).await;
                } else {
                    *session.state.lock().await = State::Unknown;
                    tracing::debug!(session = %session.id, "session route rejected by downstream");
                }
            }
            State::Unknown | State::Authd => {}
        }
    }

    async fn drain_queue(&self, session: &Arc<ClientSession>) {
        let queued = std::mem::take(&mut *session.queued.lock().await);
        for packet in queued {
            self.wrap_and_route(session, packet).await;
        }
    }

    async fn wrap_and_route(&self, session: &Arc<ClientSession>, packet: DPacket) {
        let session_id = session
            .session_id
            .lock()
            .await
            .clone()
            .unwrap_or_else(|| session.downstream_host.clone());
        let wrapper = Element::builder("route", "")
            .attr("to", session_id)
            .attr("from", session.id.as_str())
            .append(packet.element)
            .build();
        if let Ok(wrapped) = DPacket::new(wrapper) {
            self.router.deliver(wrapped).await;
        }
    }

    /// Sessions that never reached AUTHD within `auth_timeout`. The caller
    /// (the owning transport) is responsible for sending the stream error
    /// and closing the socket; this only identifies and drops the
    /// bookkeeping for them.
    pub async fn sweep_auth_timeouts(&self) -> Vec<String> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|id, session| {
            let expired = now.duration_since(session.connected_at) > self.auth_timeout
                && !matches!(*session.state.try_lock().map(|s| *s).unwrap_or(State::Unknown), State::Authd);
            if expired {
                timed_out.push(id.clone());
            }
            !expired
        });
        timed_out
    }

    /// AUTHD sessions idle for longer than `heartbeat_period`, so the
    /// caller can write a whitespace keepalive on their sockets.
    pub async fn idle_authd_sessions(&self) -> Vec<String> {
        let now = Instant::now();
        let mut idle = Vec::new();
        for session in self.sessions.lock().await.values() {
            if !session.is_authd().await {
                continue;
            }
            if now.duration_since(*session.last_activity.lock().await) > self.heartbeat_period {
                idle.push(session.id.clone());
            }
        }
        idle
    }
}

fn is_auth_or_register_query(element: &Element) -> bool {
    element
        .children()
        .next()
        .map(|child| matches!(child.ns().as_str(), "jabber:iq:auth" | "jabber:iq:register"))
        .unwrap_or(false)
}

/// PRECOND handler registered on the client manager's own routing host;
/// intercepts stanzas addressed back to a live session id and feeds them
/// through the handshake state machine instead of ordinary delivery.
pub struct SessionReplyHandler {
    manager: Arc<ClientManager>,
}

impl SessionReplyHandler {
    pub fn new(manager: Arc<ClientManager>) -> Self {
        SessionReplyHandler { manager }
    }
}

#[async_trait]
impl Handler for SessionReplyHandler {
    async fn handle(&self, _instance: &str, packet: DPacket) -> (HandlerResult, Option<DPacket>) {
        let Some(to) = packet.to.as_ref().map(|j| j.to_string()) else {
            return (HandlerResult::Pass, Some(packet));
        };
        let session = self.manager.sessions.lock().await.get(&to).cloned();
        let Some(session) = session else {
            return (HandlerResult::Pass, Some(packet));
        };
        self.manager.on_downstream_reply(&session, packet).await;
        (HandlerResult::Done, None)
    }

    fn name(&self) -> &str {
        "client-session-reply-handler"
    }
}
