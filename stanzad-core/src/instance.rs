//! Instances and their handler chains: the unit of packet dispatch.
//!
//! An [`Instance`] is a named destination (a service, an xdb backend, a log
//! sink) with an ordered chain of [`Handler`]s. Delivering a packet to an
//! instance walks the chain in priority order -- PRECOND, COND, PREDELIVER,
//! DELIVER -- stopping as soon as a handler claims the packet.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::packet::DPacket;

/// The four priority classes a handler can be registered under. Ordered so
/// that `Priority::Precond < Priority::Deliver` -- this ordering is what the
/// chain-insertion logic relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Precond,
    Cond,
    Predeliver,
    Deliver,
}

/// What a handler did with the packet it was handed. Ordered least-to-most
/// terminal: `Unreg < None < Pass < Last < Err < Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerResult {
    /// Handler is no longer interested; splice it out of the chain and
    /// keep walking with whatever packet it handed back.
    Unreg,
    /// Handler had nothing to say; keep walking.
    None,
    /// Handler looked but deferred to the rest of the chain; keep walking.
    Pass,
    /// Handler wants the walk to stop here, without claiming the packet.
    Last,
    /// Handler failed; abort the walk and bounce the packet.
    Err,
    /// Handler claimed the packet; stop walking.
    Done,
}

/// A registered handler. `handle` takes ownership of the packet: returning
/// `Some` hands it back to the chain walker, returning `None` means the
/// handler consumed it (and implies `Done`, `Unreg`-while-consuming, or a
/// bounce already performed internally).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, instance: &str, packet: DPacket) -> (HandlerResult, Option<DPacket>);

    /// A short name for logging; defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

struct ChainEntry {
    priority: Priority,
    handler: Arc<dyn Handler>,
}

/// The outcome of walking an instance's handler chain, as seen by the
/// router. The router only needs to know whether it must bounce the packet
/// and why -- everything else was already handled inside the chain walk.
pub enum DispatchOutcome {
    /// A handler returned `Done`, or the chain ran off the end while a
    /// handler still held the packet and declined to return it (treated
    /// the same as a silent drop -- see the "ran off the end" edge case).
    Consumed,
    /// The chain ran off the end and nobody consumed the packet.
    Dropped,
    /// A handler returned `Err`; the packet (if still held) must be bounced.
    HandlerError(String, Option<DPacket>),
    /// The instance has no handlers at all; the packet must be bounced.
    NoHandlers(DPacket),
}

/// A named destination with an ordered handler chain.
pub struct Instance {
    pub id: String,
    chain: Mutex<Vec<ChainEntry>>,
}

impl Instance {
    pub fn new(id: impl Into<String>) -> Self {
        Instance {
            id: id.into(),
            chain: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler, inserting it at the correct position for its
    /// priority class:
    ///
    /// - PRECOND handlers go to the front, most-recently-registered first.
    /// - COND handlers go after the last PRECOND (and before any existing
    ///   COND), so registration order is preserved within the class.
    /// - PREDELIVER handlers go before the first DELIVER handler.
    /// - DELIVER handlers are appended.
    pub async fn register_handler(&self, priority: Priority, handler: Arc<dyn Handler>) {
        let mut chain = self.chain.lock().await;
        let entry = ChainEntry { priority, handler };
        let pos = match priority {
            Priority::Precond => 0,
            Priority::Cond => chain.iter().take_while(|e| e.priority == Priority::Precond).count(),
            Priority::Predeliver => chain
                .iter()
                .position(|e| e.priority == Priority::Deliver)
                .unwrap_or(chain.len()),
            Priority::Deliver => chain.len(),
        };
        chain.insert(pos, entry);
    }

    /// Walk the handler chain for this instance with the given packet.
    ///
    /// The chain is snapshotted (a cheap `Arc` clone per entry) before any
    /// handler runs, so a handler that registers or unregisters others
    /// mid-walk never perturbs the walk in progress; UNREG results are
    /// applied to the live chain as they're seen.
    pub async fn deliver(&self, mut packet: DPacket) -> DispatchOutcome {
        let snapshot: Vec<(usize, Priority, Arc<dyn Handler>)> = {
            let chain = self.chain.lock().await;
            if chain.is_empty() {
                return DispatchOutcome::NoHandlers(packet);
            }
            chain
                .iter()
                .enumerate()
                .map(|(i, e)| (i, e.priority, e.handler.clone()))
                .collect()
        };

        let mut idx = 0;
        while idx < snapshot.len() {
            let (_, priority, handler) = &snapshot[idx];
            let has_later = idx + 1 < snapshot.len();

            let backup = if *priority == Priority::Deliver && has_later {
                Some(packet.deep_clone())
            } else {
                None
            };

            let (result, returned) = handler.handle(&self.id, packet).await;

            match result {
                HandlerResult::Done => {
                    match backup {
                        Some(next_packet) => {
                            packet = next_packet;
                        }
                        None => return DispatchOutcome::Consumed,
                    }
                }
                HandlerResult::Err => {
                    return DispatchOutcome::HandlerError(handler.name().to_string(), returned);
                }
                HandlerResult::Last => {
                    return match returned {
                        Some(_) => DispatchOutcome::Dropped,
                        None => DispatchOutcome::Consumed,
                    };
                }
                HandlerResult::Unreg => {
                    self.unregister(handler).await;
                    match returned {
                        Some(p) => packet = p,
                        None => return DispatchOutcome::Consumed,
                    }
                }
                HandlerResult::None | HandlerResult::Pass => match returned {
                    Some(p) => packet = p,
                    None => return DispatchOutcome::Consumed,
                },
            }

            idx += 1;
        }

        DispatchOutcome::Dropped
    }

    async fn unregister(&self, handler: &Arc<dyn Handler>) {
        let mut chain = self.chain.lock().await;
        chain.retain(|e| !Arc::ptr_eq(&e.handler, handler));
    }

    pub async fn handler_count(&self) -> usize {
        self.chain.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn packet(xml: &str) -> DPacket {
        DPacket::new(xml.parse().unwrap()).unwrap()
    }

    struct Recorder {
        order: Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
        result: HandlerResult,
        consume: bool,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn handle(&self, _instance: &str, packet: DPacket) -> (HandlerResult, Option<DPacket>) {
            self.order.lock().await.push(self.tag);
            if self.consume {
                (self.result, None)
            } else {
                (self.result, Some(packet))
            }
        }
    }

    #[tokio::test]
    async fn priority_insertion_order() {
        let instance = Instance::new("sm");
        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, prio) in [
            ("deliver1", Priority::Deliver),
            ("precond1", Priority::Precond),
            ("cond1", Priority::Cond),
            ("predeliver1", Priority::Predeliver),
            ("precond2", Priority::Precond),
        ] {
            instance
                .register_handler(
                    prio,
                    Arc::new(Recorder {
                        order: order.clone(),
                        tag,
                        result: HandlerResult::Pass,
                        consume: false,
                    }),
                )
                .await;
        }

        let outcome = instance.deliver(packet(r#"<message to="a@h" from="b@h"/>"#)).await;
        assert!(matches!(outcome, DispatchOutcome::Dropped));

        let seen = order.lock().await.clone();
        assert_eq!(seen, vec!["precond2", "precond1", "cond1", "predeliver1", "deliver1"]);
    }

    #[test]
    fn result_ordering_is_least_to_most_terminal() {
        assert!(HandlerResult::Unreg < HandlerResult::None);
        assert!(HandlerResult::None < HandlerResult::Pass);
        assert!(HandlerResult::Pass < HandlerResult::Last);
        assert!(HandlerResult::Last < HandlerResult::Err);
        assert!(HandlerResult::Err < HandlerResult::Done);
    }

    struct Consumer {
        result: HandlerResult,
    }

    #[async_trait]
    impl Handler for Consumer {
        async fn handle(&self, _instance: &str, _packet: DPacket) -> (HandlerResult, Option<DPacket>) {
            (self.result, None)
        }
    }

    #[tokio::test]
    async fn done_stops_the_walk() {
        let instance = Instance::new("sm");
        let hits = Arc::new(AtomicUsize::new(0));
        instance
            .register_handler(Priority::Deliver, Arc::new(Consumer { result: HandlerResult::Done }))
            .await;

        struct Counting(Arc<AtomicUsize>);
        #[async_trait]
        impl Handler for Counting {
            async fn handle(&self, _i: &str, p: DPacket) -> (HandlerResult, Option<DPacket>) {
                self.0.fetch_add(1, Ordering::SeqCst);
                (HandlerResult::Pass, Some(p))
            }
        }
        instance
            .register_handler(Priority::Deliver, Arc::new(Counting(hits.clone())))
            .await;

        let outcome = instance.deliver(packet(r#"<message to="a@h" from="b@h"/>"#)).await;
        assert!(matches!(outcome, DispatchOutcome::Consumed));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn deliver_clones_packet_ahead_of_later_deliver_handlers() {
        let instance = Instance::new("sm");

        struct MutatingConsumer;
        #[async_trait]
        impl Handler for MutatingConsumer {
            async fn handle(&self, _i: &str, mut p: DPacket) -> (HandlerResult, Option<DPacket>) {
                p.element.set_attr("to", "mutated@h");
                (HandlerResult::Done, None)
            }
        }
        instance.register_handler(Priority::Deliver, Arc::new(MutatingConsumer)).await;

        let seen_to = Arc::new(Mutex::new(None));
        struct Observer(Arc<Mutex<Option<String>>>);
        #[async_trait]
        impl Handler for Observer {
            async fn handle(&self, _i: &str, p: DPacket) -> (HandlerResult, Option<DPacket>) {
                *self.0.lock().await = p.element.attr("to").map(str::to_string);
                (HandlerResult::Done, None)
            }
        }
        instance
            .register_handler(Priority::Deliver, Arc::new(Observer(seen_to.clone())))
            .await;

        let outcome = instance.deliver(packet(r#"<message to="a@h" from="b@h"/>"#)).await;
        assert!(matches!(outcome, DispatchOutcome::Consumed));
        assert_eq!(seen_to.lock().await.as_deref(), Some("a@h"));
    }

    #[tokio::test]
    async fn unreg_splices_handler_out_of_chain() {
        let instance = Instance::new("sm");
        instance
            .register_handler(
                Priority::Precond,
                Arc::new(Consumer { result: HandlerResult::Unreg }),
            )
            .await;
        assert_eq!(instance.handler_count().await, 1);

        let outcome = instance.deliver(packet(r#"<message to="a@h" from="b@h"/>"#)).await;
        assert!(matches!(outcome, DispatchOutcome::Consumed));
        assert_eq!(instance.handler_count().await, 0);
    }

    #[tokio::test]
    async fn no_handlers_returns_packet_for_bounce() {
        let instance = Instance::new("empty");
        let outcome = instance.deliver(packet(r#"<message to="a@h" from="b@h"/>"#)).await;
        assert!(matches!(outcome, DispatchOutcome::NoHandlers(_)));
    }
}
