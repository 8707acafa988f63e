//! Configuration loading: a purpose-built XML macro processor plus a typed
//! config tree, not a general-purpose config language.
//!
//! Loading a file expands `<jabberd:include>` elements (inlining another
//! file's children in place, capped at [`MAX_INCLUDE_DEPTH`] nested
//! levels) and substitutes `<jabberd:cmdline flag="x">fallback</jabberd:cmdline>`
//! with the `-x` command-line value when present, then walks the result
//! into a [`Config`]. Validation (duplicate instance ids, inconsistent
//! `<ns>`/`<logtype>` declarations) runs once, after the whole tree is
//! built and before any instance is constructed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use minidom::{Element, Node};
use thiserror::Error;

use crate::acl::AclGrant;

pub const MAX_INCLUDE_DEPTH: usize = 20;

const INCLUDE_NS: &str = "jabberd:configfile:replace";
const CMDLINE_NS: &str = "jabberd:configfile:replace";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration xml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: minidom::Error,
    },
    #[error("<jabberd:include> nesting exceeded {MAX_INCLUDE_DEPTH} levels at {0}")]
    IncludeTooDeep(String),
    #[error("duplicate instance id {0:?}")]
    DuplicateInstanceId(String),
    #[error("instance {0:?} has no <ns> declaration, but a sibling xdb instance declares one")]
    InconsistentNamespaceDeclaration(String),
    #[error("instance {0:?} has no <logtype> declaration, but a sibling log instance declares one")]
    InconsistentLogTypeDeclaration(String),
    #[error("more than one <uplink/> declared across the configuration")]
    MultipleUplinks,
}

#[derive(Debug, Clone, Default)]
pub struct DebugConfig {
    pub mask: u32,
    pub facility: Option<String>,
}

/// One declared `<log>`, `<xdb>`, or `<service>` instance.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub id: String,
    /// Declared hosts; an empty vector or the literal `"*"` means every host.
    pub hosts: Vec<String>,
    /// XDB namespaces this instance answers for; empty means every ns.
    pub ns: Vec<String>,
    /// LOG types this instance answers for; empty means every type.
    pub logtypes: Vec<String>,
    pub is_uplink: bool,
    /// The instance element, unexamined, for the component's own config handler.
    pub raw: Element,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub router_dump_filters: Vec<String>,
    pub null_source: Vec<String>,
    pub acl_grants: Vec<AclGrant>,
    pub locales: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pidfile: Option<PathBuf>,
    pub debug: DebugConfig,
    pub logs: Vec<InstanceConfig>,
    pub xdbs: Vec<InstanceConfig>,
    pub services: Vec<InstanceConfig>,
    pub global: GlobalConfig,
}

/// Parse and validate the configuration rooted at `path`, substituting
/// `cmdline` values for any `<jabberd:cmdline>` macros.
pub fn load(path: &Path, cmdline: &HashMap<String, String>) -> Result<Config, ConfigError> {
    let root = read_and_expand(path, 0, cmdline)?;
    let config = build(&root)?;
    validate(&config)?;
    Ok(config)
}

fn read_and_expand(path: &Path, depth: usize, cmdline: &HashMap<String, String>) -> Result<Element, ConfigError> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(ConfigError::IncludeTooDeep(path.display().to_string()));
    }
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let root: Element = text.parse().map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    expand_element(root, depth, base_dir, cmdline)
}

fn expand_element(element: Element, depth: usize, base_dir: &Path, cmdline: &HashMap<String, String>) -> Result<Element, ConfigError> {
    let mut builder = Element::builder(element.name(), element.ns());
    for (key, value) in element.attrs() {
        builder = builder.attr(key, value);
    }
    for node in element.nodes() {
        match node {
            Node::Element(child) if child.name() == "include" && child.ns() == INCLUDE_NS => {
                let file_name = child.text();
                let include_path = base_dir.join(file_name.trim());
                let expanded = read_and_expand(&include_path, depth + 1, cmdline)?;
                for inner in expanded.nodes() {
                    builder = builder.append(inner.clone());
                }
            }
            Node::Element(child) if child.name() == "cmdline" && child.ns() == CMDLINE_NS => {
                let flag = child.attr("flag").unwrap_or_default();
                let value = cmdline.get(flag).cloned().unwrap_or_else(|| child.text());
                builder = builder.append(Node::Text(value));
            }
            Node::Element(child) => {
                let expanded_child = expand_element(child.clone(), depth, base_dir, cmdline)?;
                builder = builder.append(expanded_child);
            }
            Node::Text(text) => {
                builder = builder.append(Node::Text(text.clone()));
            }
        }
    }
    Ok(builder.build())
}

fn build(root: &Element) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    if let Some(pidfile) = root.get_child("pidfile", root.ns()) {
        config.pidfile = Some(PathBuf::from(pidfile.text()));
    }

    if let Some(debug) = root.get_child("debug", root.ns()) {
        if let Some(mask) = debug.get_child("mask", root.ns()) {
            config.debug.mask = mask.text().trim().parse().unwrap_or(0);
        }
        if let Some(facility) = debug.get_child("facility", root.ns()) {
            config.debug.facility = Some(facility.text());
        }
    }

    for log in root.children().filter(|c| c.name() == "log") {
        config.logs.push(build_instance(log));
    }
    for xdb in root.children().filter(|c| c.name() == "xdb") {
        config.xdbs.push(build_instance(xdb));
    }
    for service in root.children().filter(|c| c.name() == "service") {
        config.services.push(build_instance(service));
    }

    if let Some(global) = root.get_child("global", root.ns()) {
        config.global = build_global(global);
    }

    Ok(config)
}

fn build_instance(element: &Element) -> InstanceConfig {
    let id = element.attr("id").unwrap_or_default().to_string();
    let hosts = element
        .children()
        .filter(|c| c.name() == "host")
        .map(|c| {
            let text = c.text();
            if text.trim().is_empty() {
                "*".to_string()
            } else {
                text
            }
        })
        .collect();
    let ns = element
        .children()
        .filter(|c| c.name() == "ns")
        .map(|c| c.text())
        .collect();
    let logtypes = element
        .children()
        .filter(|c| c.name() == "logtype")
        .map(|c| c.text())
        .collect();
    let is_uplink = element.children().any(|c| c.name() == "uplink");

    InstanceConfig {
        id,
        hosts,
        ns,
        logtypes,
        is_uplink,
        raw: element.clone(),
    }
}

fn build_global(global: &Element) -> GlobalConfig {
    let mut config = GlobalConfig::default();

    if let Some(router) = global.get_child("router", global.ns()) {
        config.router_dump_filters = router
            .children()
            .filter(|c| c.name() == "dump")
            .map(|c| c.text())
            .collect();
        config.null_source = router
            .children()
            .filter(|c| c.name() == "nullsource")
            .map(|c| c.text())
            .collect();
    }

    if let Some(acl) = global.get_child("acl", global.ns()) {
        for grant in acl.children().filter(|c| c.name() == "grant") {
            let feature = grant.attr("feature").map(str::to_string);
            let domains = grant
                .children()
                .filter(|c| c.name() == "domain")
                .map(|c| c.text())
                .collect();
            let users = grant
                .children()
                .filter(|c| c.name() == "jid")
                .map(|c| c.text())
                .collect();
            config.acl_grants.push(AclGrant { feature, domains, users });
        }
    }

    if let Some(locales) = global.get_child("locales", global.ns()) {
        for locale in locales.children().filter(|c| c.name() == "locale") {
            if let Some(lang) = locale.attr("lang") {
                config.locales.insert(lang.to_string(), locale.text());
            }
        }
    }

    config
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut seen_ids = std::collections::HashSet::new();
    for instance in config.logs.iter().chain(&config.xdbs).chain(&config.services) {
        if !seen_ids.insert(instance.id.clone()) {
            return Err(ConfigError::DuplicateInstanceId(instance.id.clone()));
        }
    }

    let any_xdb_has_ns = config.xdbs.iter().any(|i| !i.ns.is_empty());
    if any_xdb_has_ns {
        if let Some(bad) = config.xdbs.iter().find(|i| i.ns.is_empty()) {
            return Err(ConfigError::InconsistentNamespaceDeclaration(bad.id.clone()));
        }
    }

    let any_log_has_type = config.logs.iter().any(|i| !i.logtypes.is_empty());
    if any_log_has_type {
        if let Some(bad) = config.logs.iter().find(|i| i.logtypes.is_empty()) {
            return Err(ConfigError::InconsistentLogTypeDeclaration(bad.id.clone()));
        }
    }

    let uplink_count = config
        .logs
        .iter()
        .chain(&config.xdbs)
        .chain(&config.services)
        .filter(|i| i.is_uplink)
        .count();
    if uplink_count > 1 {
        return Err(ConfigError::MultipleUplinks);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> Config {
        let root: Element = xml.parse().unwrap();
        build(&root).unwrap()
    }

    #[test]
    fn parses_pidfile_and_debug() {
        let config = parse(
            r#"<jabberd><pidfile>/var/run/stanzad.pid</pidfile><debug><mask>7</mask><facility>local4</facility></debug></jabberd>"#,
        );
        assert_eq!(config.pidfile, Some(PathBuf::from("/var/run/stanzad.pid")));
        assert_eq!(config.debug.mask, 7);
        assert_eq!(config.debug.facility.as_deref(), Some("local4"));
    }

    #[test]
    fn parses_service_instance_with_hosts() {
        let config = parse(
            r#"<jabberd><service id="sm"><host>example.org</host></service></jabberd>"#,
        );
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].id, "sm");
        assert_eq!(config.services[0].hosts, vec!["example.org".to_string()]);
    }

    #[test]
    fn empty_host_element_maps_to_wildcard_sentinel() {
        let config = parse(r#"<jabberd><service id="sm"><host/></service></jabberd>"#);
        assert_eq!(config.services[0].hosts, vec!["*".to_string()]);
    }

    #[test]
    fn rejects_duplicate_instance_ids() {
        let config = parse(
            r#"<jabberd><service id="sm"/><xdb id="sm"/></jabberd>"#,
        );
        assert!(matches!(validate(&config), Err(ConfigError::DuplicateInstanceId(_))));
    }

    #[test]
    fn rejects_inconsistent_ns_declarations() {
        let config = parse(
            r#"<jabberd><xdb id="auth"><ns>jabber:iq:auth</ns></xdb><xdb id="other"/></jabberd>"#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InconsistentNamespaceDeclaration(_))
        ));
    }

    #[test]
    fn rejects_multiple_uplinks() {
        let config = parse(
            r#"<jabberd><service id="a"><uplink/></service><service id="b"><uplink/></service></jabberd>"#,
        );
        assert!(matches!(validate(&config), Err(ConfigError::MultipleUplinks)));
    }

    #[test]
    fn accepts_well_formed_config() {
        let config = parse(
            r#"<jabberd>
                <service id="sm"><host>example.org</host></service>
                <xdb id="auth-db"><host>example.org</host><ns>jabber:iq:auth</ns></xdb>
                <global><acl><grant feature="register"><domain>trusted.example.org</domain></grant></acl></global>
            </jabberd>"#,
        );
        assert!(validate(&config).is_ok());
        assert_eq!(config.global.acl_grants.len(), 1);
    }
}
