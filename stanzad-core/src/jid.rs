//! Thin wrapper around the external `jid` crate.
//!
//! Parsing and stringprep are delegated to `jid`; this module only adds
//! the small amount of router-specific convenience (bare-address
//! comparison, an owned representation free of `jid::Jid`'s lifetime)
//! that the routing core needs.

use std::fmt;
use std::str::FromStr;

/// A parsed JID, owned as plain strings so the router never has to care
/// about the lifetime of the backing `jid::Jid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StanzaJid {
    pub node: Option<String>,
    pub domain: String,
    pub resource: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid jid {input:?}: {source}")]
pub struct JidError {
    input: String,
    #[source]
    source: jid::Error,
}

impl StanzaJid {
    pub fn parse(input: &str) -> Result<Self, JidError> {
        let parsed = jid::Jid::from_str(input).map_err(|source| JidError {
            input: input.to_string(),
            source,
        })?;
        Ok(Self {
            node: parsed.node().map(|n| n.to_string()),
            domain: parsed.domain().to_string(),
            resource: parsed.resource().map(|r| r.to_string()),
        })
    }

    /// The bare (node@domain, no resource) form, as used by the null-source
    /// filter and the ACL policy's `<jid>` grant matching.
    pub fn bare(&self) -> String {
        match &self.node {
            Some(node) => format!("{node}@{}", self.domain),
            None => self.domain.clone(),
        }
    }
}

impl fmt::Display for StanzaJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@{}", self.domain)?;
        } else {
            write!(f, "{}", self.domain)?;
        }
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_jid() {
        let jid = StanzaJid::parse("a@example.org/work").unwrap();
        assert_eq!(jid.node.as_deref(), Some("a"));
        assert_eq!(jid.domain, "example.org");
        assert_eq!(jid.resource.as_deref(), Some("work"));
        assert_eq!(jid.bare(), "a@example.org");
    }

    #[test]
    fn parses_bare_server_jid() {
        let jid = StanzaJid::parse("example.org").unwrap();
        assert_eq!(jid.node, None);
        assert_eq!(jid.bare(), "example.org");
    }

    #[test]
    fn rejects_garbage() {
        assert!(StanzaJid::parse("").is_err());
    }
}
