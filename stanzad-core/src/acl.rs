//! ACL policy: feature-gated access grants by domain or bare JID.
//!
//! A grant names the feature it applies to (`None` matches every feature),
//! plus the domains and bare JIDs it admits. Access is granted if either
//! list matches; an empty grant set denies everything, matching the
//! provisional all-or-nothing policy the config tree builds.

use crate::jid::StanzaJid;

#[derive(Debug, Clone)]
pub struct AclGrant {
    pub feature: Option<String>,
    pub domains: Vec<String>,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AclPolicy {
    grants: Vec<AclGrant>,
}

impl AclPolicy {
    pub fn new(grants: Vec<AclGrant>) -> Self {
        AclPolicy { grants }
    }

    fn applies(grant: &AclGrant, feature: &str) -> bool {
        match &grant.feature {
            None => true,
            Some(f) => f == feature,
        }
    }

    /// Check whether `user` has access to `feature`, either by domain grant
    /// or an explicit bare-JID grant.
    pub fn check_access(&self, feature: &str, user: &StanzaJid) -> bool {
        let bare = user.bare();
        self.grants.iter().filter(|g| Self::applies(g, feature)).any(|g| {
            g.domains.iter().any(|d| d == &user.domain) || g.users.iter().any(|u| u == &bare)
        })
    }

    /// Every bare JID explicitly granted `feature` (domain grants are not
    /// expanded into a user list -- there is no finite one).
    pub fn users_for(&self, feature: &str) -> Vec<&str> {
        self.grants
            .iter()
            .filter(|g| Self::applies(g, feature))
            .flat_map(|g| g.users.iter().map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jid(s: &str) -> StanzaJid {
        StanzaJid::parse(s).unwrap()
    }

    #[test]
    fn domain_grant_admits_any_user_on_that_domain() {
        let policy = AclPolicy::new(vec![AclGrant {
            feature: Some("register".into()),
            domains: vec!["trusted.example.org".into()],
            users: vec![],
        }]);
        assert!(policy.check_access("register", &jid("anyone@trusted.example.org")));
        assert!(!policy.check_access("register", &jid("anyone@untrusted.example.org")));
    }

    #[test]
    fn user_grant_ignores_resource() {
        let policy = AclPolicy::new(vec![AclGrant {
            feature: Some("admin".into()),
            domains: vec![],
            users: vec!["root@example.org".into()],
        }]);
        assert!(policy.check_access("admin", &jid("root@example.org/console")));
        assert!(!policy.check_access("admin", &jid("guest@example.org")));
    }

    #[test]
    fn wildcard_feature_grant_applies_everywhere() {
        let policy = AclPolicy::new(vec![AclGrant {
            feature: None,
            domains: vec!["super.example.org".into()],
            users: vec![],
        }]);
        assert!(policy.check_access("register", &jid("a@super.example.org")));
        assert!(policy.check_access("admin", &jid("a@super.example.org")));
    }

    #[test]
    fn no_grants_denies_everything() {
        let policy = AclPolicy::default();
        assert!(!policy.check_access("register", &jid("a@example.org")));
    }
}
