//! Config-driven instance construction: the step between `config::load` and
//! `router.start()` that turns a parsed [`Config`] into live routing-table
//! entries. Each `Instance` comes back bare -- attaching the handlers that
//! make it a real service, xdb backend, or log sink is the caller's job
//! (loadable-module bootstrap is out of scope here); this only wires up the
//! routing-table side of startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::acl::AclPolicy;
use crate::config::{Config, InstanceConfig};
use crate::instance::Instance;
use crate::router::{Router, TableKind, WILDCARD};

/// The live instances and policy objects built from one [`Config`].
pub struct Wired {
    pub instances: HashMap<String, Arc<Instance>>,
    pub acl: AclPolicy,
}

/// Register every declared `<log>`/`<xdb>`/`<service>` instance against
/// `router`, set the uplink if one is declared, and apply the `<global>`
/// block's null-source filter.
pub async fn apply(router: &Router, config: &Config) -> Wired {
    let mut instances = HashMap::new();

    for xdb in &config.xdbs {
        let instance = register_instance(router, xdb, TableKind::Xdb, &xdb.ns).await;
        instances.insert(xdb.id.clone(), instance);
    }
    for log in &config.logs {
        let instance = register_instance(router, log, TableKind::Log, &log.logtypes).await;
        instances.insert(log.id.clone(), instance);
    }
    for service in &config.services {
        let instance = register_instance(router, service, TableKind::Norm, &[]).await;
        if service.is_uplink {
            router.set_uplink(Some(instance.clone())).await;
        }
        instances.insert(service.id.clone(), instance);
    }

    router.set_null_source(config.global.null_source.clone()).await;

    Wired {
        instances,
        acl: AclPolicy::new(config.global.acl_grants.clone()),
    }
}

async fn register_instance(
    router: &Router,
    config: &InstanceConfig,
    kind: TableKind,
    selectors: &[String],
) -> Arc<Instance> {
    let instance = Arc::new(Instance::new(config.id.clone()));
    router.set_instance_config(config.id.clone(), config.raw.clone()).await;

    let hosts: Vec<&str> = if config.hosts.is_empty() || config.hosts.iter().any(|h| h == WILDCARD) {
        vec![WILDCARD]
    } else {
        config.hosts.iter().map(String::as_str).collect()
    };

    for host in hosts {
        if selectors.is_empty() {
            router.register(kind, host, instance.clone(), None, true).await;
        } else {
            for selector in selectors {
                router
                    .register(kind, host, instance.clone(), Some(selector.clone()), true)
                    .await;
            }
        }
    }

    instance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use minidom::Element;

    fn instance_config(id: &str, hosts: Vec<&str>, ns: Vec<&str>) -> InstanceConfig {
        InstanceConfig {
            id: id.to_string(),
            hosts: hosts.into_iter().map(String::from).collect(),
            ns: ns.into_iter().map(String::from).collect(),
            logtypes: Vec::new(),
            is_uplink: false,
            raw: Element::builder("xdb", "").build(),
        }
    }

    #[tokio::test]
    async fn wires_services_xdbs_and_uplink() {
        let router = Router::new();
        router.start().await;

        let mut sm = instance_config("sm", vec!["example.org"], vec![]);
        sm.is_uplink = true;
        let auth = instance_config("auth-db", vec!["example.org"], vec!["jabber:iq:auth"]);

        let config = Config {
            services: vec![sm],
            xdbs: vec![auth],
            global: GlobalConfig {
                null_source: vec!["banned@example.org".to_string()],
                ..GlobalConfig::default()
            },
            ..Config::default()
        };

        let wired = apply(&router, &config).await;
        assert_eq!(wired.instances.len(), 2);

        let candidates = router.lookup(TableKind::Norm, "example.org", None).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "sm");

        let xdb_candidates = router
            .lookup(TableKind::Xdb, "example.org", Some("jabber:iq:auth"))
            .await;
        assert_eq!(xdb_candidates.len(), 1);
        assert_eq!(xdb_candidates[0].id, "auth-db");
    }

    #[tokio::test]
    async fn empty_hosts_register_under_the_wildcard() {
        let router = Router::new();
        router.start().await;

        let catch_all = instance_config("catch-all", vec![], vec![]);
        let config = Config {
            services: vec![catch_all],
            ..Config::default()
        };

        apply(&router, &config).await;
        let candidates = router.lookup(TableKind::Norm, "anything.example.org", None).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "catch-all");
    }
}
