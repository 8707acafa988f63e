//! Core stanza-routing engine: instances, handler chains, the router's
//! host-keyed tables, and the components built on top of `deliver` --
//! the xdb correlator, the dns sub-resolver, the client session manager,
//! ACL policy, and the logging facade. Everything here runs in-process;
//! the surrounding transport (sockets, TLS, SASL) lives in the binary
//! crate that wires this library up to a real network.

pub mod acl;
pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod heartbeat;
pub mod instance;
pub mod jid;
pub mod logging;
pub mod mtq;
pub mod packet;
pub mod router;
pub mod wiring;
pub mod xdbcache;

pub use error::{Result, RouterError};
pub use instance::{DispatchOutcome, Handler, HandlerResult, Instance, Priority};
pub use jid::StanzaJid;
pub use packet::{DPacket, Kind};
pub use router::{Router, TableKind};
