//! The dpacket envelope: a validated XML element plus its parsed addressing.
//!
//! A `DPacket` owns a `minidom::Element` and its two parsed `StanzaJid`s
//! directly, so dropping one frees everything without a backing pool.

use minidom::Element;

use crate::error::{Result, RouterError};
use crate::jid::StanzaJid;

/// Packet kind, derived from the first letter of the element's local name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Norm,
    Xdb,
    Log,
    Route,
    None,
}

impl Kind {
    fn from_local_name(name: &str) -> Kind {
        match name.chars().next() {
            Some('r') => Kind::Route,
            Some('x') => Kind::Xdb,
            Some('l') => Kind::Log,
            Some(_) => Kind::Norm,
            None => Kind::None,
        }
    }
}

/// A validated, owned XML stanza plus its parsed addressing.
#[derive(Debug, Clone)]
pub struct DPacket {
    pub element: Element,
    pub kind: Kind,
    pub to: Option<StanzaJid>,
    pub from: Option<StanzaJid>,
    /// The primary routing host: the server part of `to`, except for LOG
    /// packets where it is the server part of `from`.
    pub host: String,
}

impl DPacket {
    /// Build a dpacket from a raw element, validating the mandatory
    /// attributes for its kind.
    pub fn new(element: Element) -> Result<DPacket> {
        let mut kind = Kind::from_local_name(element.name());

        let to = element
            .attr("to")
            .map(StanzaJid::parse)
            .transpose()
            .map_err(|e| RouterError::InvalidEnvelope(e.to_string()))?;
        let from = element
            .attr("from")
            .map(StanzaJid::parse)
            .transpose()
            .map_err(|e| RouterError::InvalidEnvelope(e.to_string()))?;

        // An xdb result/error flowing back to its requester is reclassified
        // as NORM so it rejoins ordinary stanza routing.
        if kind == Kind::Xdb {
            if let Some(ty) = element.attr("type") {
                if ty.starts_with('r') || ty.starts_with('e') {
                    kind = Kind::Norm;
                }
            }
        }

        match kind {
            Kind::Log => {
                if element.attr("type").is_none() {
                    return Err(RouterError::InvalidEnvelope(
                        "log packet missing type attribute".into(),
                    ));
                }
            }
            Kind::Xdb => {
                if element.attr("ns").is_none() || to.is_none() || from.is_none() {
                    return Err(RouterError::InvalidEnvelope(
                        "xdb packet missing ns/to/from".into(),
                    ));
                }
            }
            Kind::Norm => {
                if to.is_none() || from.is_none() {
                    return Err(RouterError::InvalidEnvelope(
                        "normal packet missing to/from".into(),
                    ));
                }
            }
            Kind::Route => {
                if to.is_none() {
                    return Err(RouterError::InvalidEnvelope(
                        "route packet missing to".into(),
                    ));
                }
            }
            Kind::None => {
                return Err(RouterError::InvalidEnvelope(
                    "packet with empty local name".into(),
                ));
            }
        }

        let host = match kind {
            Kind::Log => from.as_ref().map(|j| j.domain.clone()).unwrap_or_default(),
            _ => to.as_ref().map(|j| j.domain.clone()).unwrap_or_default(),
        };

        Ok(DPacket {
            element,
            kind,
            to,
            from,
            host,
        })
    }

    /// A fresh, independent deep copy -- used when a handler chain has more
    /// than one DELIVER-class handler, so an earlier handler's mutation (or
    /// consumption) of the packet can't affect what later handlers see.
    pub fn deep_clone(&self) -> DPacket {
        DPacket {
            element: self.element.clone(),
            kind: self.kind,
            to: self.to.clone(),
            from: self.from.clone(),
            host: self.host.clone(),
        }
    }

    /// Swap `to`/`from` on the element and the parsed JIDs -- used by the
    /// ROUTE and NORM bounce paths.
    pub fn swap_to_from(&mut self) {
        let to_attr = self.element.attr("to").map(str::to_string);
        let from_attr = self.element.attr("from").map(str::to_string);
        if let Some(v) = from_attr.clone() {
            self.element.set_attr("to", v);
        } else {
            self.element.set_attr("to", "");
        }
        if let Some(v) = to_attr {
            self.element.set_attr("from", v);
        }
        std::mem::swap(&mut self.to, &mut self.from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elem(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    #[test]
    fn classifies_norm_default() {
        let p = DPacket::new(elem(
            r#"<message to="a@example.org" from="b@example.org"/>"#,
        ))
        .unwrap();
        assert_eq!(p.kind, Kind::Norm);
        assert_eq!(p.host, "example.org");
    }

    #[test]
    fn classifies_xdb_and_promotes_result() {
        let p = DPacket::new(elem(
            r#"<xdb type="get" to="a@h" from="sm" ns="jabber:iq:auth" id="1"/>"#,
        ))
        .unwrap();
        assert_eq!(p.kind, Kind::Xdb);

        let result = DPacket::new(elem(
            r#"<xdb type="result" to="sm" from="a@h" ns="jabber:iq:auth" id="1"/>"#,
        ))
        .unwrap();
        assert_eq!(result.kind, Kind::Norm);
    }

    #[test]
    fn log_host_comes_from_from_attribute() {
        let p = DPacket::new(elem(r#"<log type="notice" from="sm@log.example.org"/>"#)).unwrap();
        assert_eq!(p.host, "log.example.org");
    }

    #[test]
    fn rejects_missing_mandatory_attribute() {
        assert!(DPacket::new(elem(r#"<message from="a@h"/>"#)).is_err());
        assert!(DPacket::new(elem(r#"<log/>"#)).is_err());
        assert!(DPacket::new(elem(r#"<route/>"#)).is_err());
    }

    #[test]
    fn deep_clone_is_independent() {
        let p = DPacket::new(elem(r#"<message to="a@h" from="b@h"/>"#)).unwrap();
        let mut copy = p.deep_clone();
        copy.element.set_attr("to", "c@h");
        assert_eq!(p.element.attr("to"), Some("a@h"));
        assert_eq!(copy.element.attr("to"), Some("c@h"));
    }
}
