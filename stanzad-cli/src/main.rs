//! `stanzad`: daemon entrypoint wiring the core router up to configuration,
//! signal handling, and logging. Socket I/O and TLS are not this crate's
//! concern -- see `stanzad-core` for the routing-visible slice of the
//! client connection manager this binary would otherwise own a listener
//! for.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use stanzad_core::client::ClientManager;
use stanzad_core::config;
use stanzad_core::dns::DnsResolver;
use stanzad_core::heartbeat::Heartbeat;
use stanzad_core::router::Router;
use stanzad_core::wiring;
use stanzad_core::xdbcache::XdbCache;
use tracing_subscriber::EnvFilter;

/// XML stanza router daemon.
#[derive(Parser, Debug)]
#[command(name = "stanzad", version)]
struct Cli {
    /// Main configuration file.
    #[arg(short = 'c', long = "config", default_value = "stanzad.xml")]
    config: PathBuf,

    /// Additional configuration files, merged with `-c`'s (comma-separated).
    #[arg(short = 'i', long = "include", value_delimiter = ',')]
    include: Vec<PathBuf>,

    /// Debug mask (bitfield, passed through to the tracing filter).
    #[arg(short = 'd', long = "debug-mask")]
    debug_mask: Option<u32>,

    /// Enable every debug zone.
    #[arg(short = 'D', long = "debug-all")]
    debug_all: bool,

    /// Restrict debug output to these zones (comma-separated).
    #[arg(short = 'Z', long = "debug-zones", value_delimiter = ',')]
    debug_zones: Vec<String>,

    /// Drop privileges to this user after binding.
    #[arg(short = 'U', long = "user")]
    user: Option<String>,

    /// Change working directory before loading configuration.
    #[arg(short = 'H', long = "chdir")]
    chdir: Option<PathBuf>,

    /// Config substitution: `-x flag:value`, repeatable.
    #[arg(short = 'x', long = "cmdline", value_parser = parse_cmdline_kv)]
    cmdline: Vec<(String, String)>,

    /// Daemonize (detach from the controlling terminal).
    #[arg(short = 'B', long = "background")]
    background: bool,

    /// Override the configured hostname.
    #[arg(short = 'h', long = "hostname")]
    hostname: Option<String>,

    /// Override the configured spool directory.
    #[arg(short = 's', long = "spooldir")]
    spooldir: Option<String>,
}

fn parse_cmdline_kv(raw: &str) -> Result<(String, String), String> {
    raw.split_once(':')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected flag:value, got {raw:?}"))
}

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_EARLY_INIT_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    install_tracing(&cli);

    if let Some(dir) = &cli.chdir {
        if let Err(e) = std::env::set_current_dir(dir) {
            tracing::error!(dir = %dir.display(), error = %e, "failed to chdir");
            return ExitCode::from(EXIT_EARLY_INIT_FAILURE);
        }
    }

    let cmdline: HashMap<String, String> = cli.cmdline.iter().cloned().collect();

    let config = match config::load(&cli.config, &cmdline) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration load failed");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    for extra in &cli.include {
        if let Err(e) = config::load(extra, &cmdline) {
            tracing::error!(file = %extra.display(), error = %e, "additional configuration load failed");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    }

    tracing::info!(
        services = config.services.len(),
        xdbs = config.xdbs.len(),
        logs = config.logs.len(),
        "configuration loaded"
    );

    let router = Arc::new(Router::new());
    let wired = wiring::apply(&router, &config).await;
    tracing::info!(instances = wired.instances.len(), "instances registered");
    router.start().await;

    let xdb_cache = Arc::new(XdbCache::new(router.clone()));
    let client_manager = Arc::new(ClientManager::new(router.clone(), HashMap::new()));
    let mut heartbeat = Heartbeat::new().with_xdb(xdb_cache).with_clients(client_manager);
    match DnsResolver::new(router.clone(), Vec::new()) {
        Ok(resolver) => heartbeat = heartbeat.with_dns(Arc::new(resolver)),
        Err(e) => tracing::warn!(error = %e, "dns resolver unavailable, continuing without it"),
    }
    let heartbeat = Arc::new(heartbeat);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let heartbeat_task = tokio::spawn(heartbeat.run(shutdown_rx));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    let _ = heartbeat_task.await;

    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    let mut hup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .expect("failed to install SIGHUP handler");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = term.recv() => return,
            _ = hup.recv() => {
                tracing::info!("SIGHUP received; configuration reload is handled per-request, not here");
            }
        }
    }
}

fn install_tracing(cli: &Cli) {
    let mut filter = if cli.debug_all {
        EnvFilter::new("trace")
    } else if let Some(mask) = cli.debug_mask {
        EnvFilter::new(format!("stanzad_core={}", debug_mask_to_level(mask)))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    for zone in &cli.debug_zones {
        filter = filter.add_directive(
            format!("{zone}=trace")
                .parse()
                .unwrap_or_else(|_| "info".parse().unwrap()),
        );
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn debug_mask_to_level(mask: u32) -> &'static str {
    match mask {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}
