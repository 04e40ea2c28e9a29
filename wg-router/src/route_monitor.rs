// Default-route change watcher

//! Default-route change detection
//!
//! The router needs to know when the host's default route moves between
//! interfaces, since that is what the killswitch decision rests on.
//! [`RouteMonitor`] is the subscription seam; [`PollingRouteMonitor`]
//! implements it by running the OS route dump on an interval and diffing
//! the set of default-route entries between polls.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Callback invoked with the new set of default-route table entries
/// whenever it changes.
pub type RouteChangeCallback = Box<dyn Fn(Vec<String>) + Send + Sync>;

/// Subscription seam for default-route change events.
#[async_trait]
pub trait RouteMonitor: Send + Sync {
    /// Start watching for default-route changes, invoking `on_change` for
    /// each observed change until the returned watch is unsubscribed.
    async fn subscribe(&self, interface: &str, on_change: RouteChangeCallback)
        -> Result<RouteWatch>;
}

/// Handle to an active route watch. Dropping it also stops the watcher.
pub struct RouteWatch {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RouteWatch {
    /// Build a handle from a shutdown channel and the watcher task.
    /// Monitors construct one of these from `subscribe`.
    pub fn new(shutdown: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Stop the watch and wait for the watcher task to finish.
    pub async fn unsubscribe(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Watches default routes by polling the route dump command.
pub struct PollingRouteMonitor {
    poll_interval: Duration,
}

impl PollingRouteMonitor {
    /// Create a monitor polling at `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Read the current default-route entries, one line per route.
    async fn default_routes() -> Result<Vec<String>> {
        let output = Command::new("netsh")
            .args(["interface", "ipv4", "show", "route"])
            .output()
            .await
            .context("failed to execute route dump command")?;
        anyhow::ensure!(output.status.success(), "route dump command failed");

        let mut routes = extract_default_routes(&String::from_utf8_lossy(&output.stdout));

        // Hosts without an IPv6 stack fail this one; treat it as empty.
        if let Ok(output) = Command::new("netsh")
            .args(["interface", "ipv6", "show", "route"])
            .output()
            .await
        {
            if output.status.success() {
                routes.extend(extract_default_routes(&String::from_utf8_lossy(
                    &output.stdout,
                )));
            }
        }

        Ok(routes)
    }
}

/// Pull the entries mentioning a default-route prefix out of a route dump.
/// Matches the prefix token only; the surrounding text is localized and is
/// not interpreted.
fn extract_default_routes(dump: &str) -> Vec<String> {
    dump.lines()
        .filter(|line| {
            line.split_whitespace()
                .any(|token| token == "0.0.0.0/0" || token == "::/0")
        })
        .map(|line| line.trim().to_string())
        .collect()
}

#[async_trait]
impl RouteMonitor for PollingRouteMonitor {
    async fn subscribe(
        &self,
        interface: &str,
        on_change: RouteChangeCallback,
    ) -> Result<RouteWatch> {
        // The initial snapshot doubles as a probe that the route dump
        // command works at all; failing here fails the subscription.
        let mut last = Self::default_routes()
            .await
            .context("initial route snapshot")?;
        log::debug!("route monitor: initial default routes {:?}", last);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let poll_interval = self.poll_interval;
        let interface = interface.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        log::debug!("route monitor for {} stopping", interface);
                        return;
                    }
                    _ = ticker.tick() => {
                        match Self::default_routes().await {
                            Ok(routes) => {
                                if routes != last {
                                    log::info!(
                                        "default routes changed: {:?} -> {:?}",
                                        last,
                                        routes
                                    );
                                    last = routes.clone();
                                    on_change(routes);
                                }
                            }
                            Err(err) => {
                                log::warn!("route poll failed: {:#}", err);
                            }
                        }
                    }
                }
            }
        });

        Ok(RouteWatch::new(shutdown_tx, task))
    }
}
