// Tunnel router daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wg_router::{
    config::{load_settings, validate_interface_name},
    dns::NetshDns,
    firewall::{FirewallReconciler, NetshFirewall},
    health::HealthRegistry,
    interface_config::NetshInterfaceConfig,
    killswitch::NetshKillswitch,
    route_monitor::PollingRouteMonitor,
    router::{Router, RouterDeps},
};

/// Bound on waiting for the firewall reconciler to finish removing rules at
/// shutdown.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "wg-router")]
#[command(about = "Host routing and firewall manager for a VPN tunnel endpoint", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/wg-router/config.toml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    // Small runtime: one thread for the main flow, one for the route
    // monitor and command spawns.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("wg-router")
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let settings = load_settings(&args.config)
        .with_context(|| format!("Failed to load settings from {:?}", args.config))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&settings.general.log_level),
    )
    .init();

    log::info!("Starting wg-router daemon");

    validate_interface_name(&settings.general.interface)
        .context("Configured interface has invalid name")?;
    let interface = settings.general.interface.clone();

    let tunnel_config = settings.tunnel_config().context("Invalid [tunnel] settings")?;
    log::info!("Tunnel interface: {}", interface);
    log::info!("Local addrs: {:?}", tunnel_config.local_addrs);
    log::info!("Routes: {:?}", tunnel_config.routes);
    log::info!("DNS servers: {:?}", tunnel_config.dns.nameservers);

    let health = HealthRegistry::new();
    let _health_watch = health.register_watcher(Arc::new(|key, err| match err {
        Some(err) => log::warn!("health: {} entered error state: {}", key, err),
        None => log::info!("health: {} recovered", key),
    }));

    // The daemon keeps its own reconciler handle so it can drain rule
    // removal at shutdown.
    let firewall = FirewallReconciler::new(Arc::new(NetshFirewall::new()));
    let deps = RouterDeps {
        firewall: firewall.clone(),
        killswitch: Arc::new(NetshKillswitch::new()),
        dns: Arc::new(NetshDns::new(interface.clone())),
        interface_config: Arc::new(NetshInterfaceConfig::new(interface.clone())),
        monitor: Arc::new(PollingRouteMonitor::new(Duration::from_secs(
            settings.general.route_poll_secs,
        ))),
    };
    let mut router = Router::new(interface, deps);

    router.up().await.context("router up")?;

    let result = router.set(Some(&tunnel_config)).await;
    health.set_health(
        "router",
        result.as_ref().err().map(|err| format!("{:#}", err)),
    );
    if let Err(err) = result {
        // With a static settings file there is no later set() to repair a
        // partial apply, so fail out after cleaning up.
        let _ = router.close().await;
        return Err(err.context("initial configuration"));
    }

    log::info!("Daemon started successfully");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    log::info!("Received shutdown signal");

    let close_result = router.close().await;
    health.set_health(
        "router",
        close_result.as_ref().err().map(|err| format!("{:#}", err)),
    );

    // Rule removal happens on the reconciler's background task; give it a
    // bounded window to finish before the process exits.
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, firewall.settled())
        .await
        .is_err()
    {
        log::warn!(
            "firewall rule removal still in progress after {:?}, exiting anyway",
            SHUTDOWN_DRAIN_TIMEOUT
        );
    }

    close_result?;
    log::info!("Shutdown complete");
    Ok(())
}
