//! End-to-end scenarios spanning router, instance dispatch, and the xdb
//! correlator together, as opposed to each module's own unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use stanzad_core::{DPacket, Handler, HandlerResult, Instance, Priority, Router, TableKind};

fn packet(xml: &str) -> DPacket {
    DPacket::new(xml.parse().unwrap()).unwrap()
}

struct Capturing {
    seen: Arc<tokio::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl Handler for Capturing {
    async fn handle(&self, _instance: &str, packet: DPacket) -> (HandlerResult, Option<DPacket>) {
        self.seen.lock().await.push(packet.element.attr("to").unwrap_or_default().to_string());
        (HandlerResult::Done, None)
    }
}

#[tokio::test]
async fn happy_path_norm_route_reaches_declared_instance() {
    let router = Arc::new(Router::new());
    router.start().await;

    let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sm = Arc::new(Instance::new("sm"));
    sm.register_handler(Priority::Deliver, Arc::new(Capturing { seen: seen.clone() }))
        .await;
    router.register(TableKind::Norm, "example.org", sm, None, true).await;

    router
        .deliver(packet(r#"<message to="a@example.org" from="b@cm.example.org">hi</message>"#))
        .await;

    assert_eq!(*seen.lock().await, vec!["a@example.org".to_string()]);
}

#[tokio::test]
async fn uplink_fallback_returns_packet_to_client_manager() {
    let router = Arc::new(Router::new());
    router.start().await;

    let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let cm = Arc::new(Instance::new("cm"));
    cm.register_handler(Priority::Deliver, Arc::new(Capturing { seen: seen.clone() }))
        .await;
    router.set_uplink(Some(cm)).await;

    router
        .deliver(packet(r#"<message to="a@other.net" from="b@cm.example.org"/>"#))
        .await;

    assert_eq!(*seen.lock().await, vec!["a@other.net".to_string()]);
}

#[tokio::test]
async fn ambiguous_xdb_route_bounces_to_requester_with_type_error() {
    let router = Arc::new(Router::new());
    router.start().await;

    let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let sm = Arc::new(Instance::new("sm"));
    sm.register_handler(Priority::Deliver, Arc::new(Capturing { seen: seen.clone() }))
        .await;
    router.register(TableKind::Norm, "sm.example.org", sm, None, true).await;

    let first = Arc::new(Instance::new("auth-db-1"));
    first.register_handler(Priority::Deliver, Arc::new(DeadEnd)).await;
    router
        .register(TableKind::Xdb, "host", first, Some("jabber:iq:auth".to_string()), true)
        .await;
    let second = Arc::new(Instance::new("auth-db-2"));
    second.register_handler(Priority::Deliver, Arc::new(DeadEnd)).await;
    router
        .register(TableKind::Xdb, "host", second, Some("jabber:iq:auth".to_string()), true)
        .await;

    router
        .deliver(packet(
            r#"<xdb type="get" to="a@host" from="sm@sm.example.org" ns="jabber:iq:auth" id="1"/>"#,
        ))
        .await;

    let bounced = seen.lock().await;
    assert_eq!(bounced.len(), 1);
    assert_eq!(bounced[0], "sm@sm.example.org");
}

struct DeadEnd;

#[async_trait]
impl Handler for DeadEnd {
    async fn handle(&self, _instance: &str, packet: DPacket) -> (HandlerResult, Option<DPacket>) {
        (HandlerResult::Done, Some(packet))
    }
}
