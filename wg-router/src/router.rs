// Router lifecycle controller

//! Tunnel router lifecycle
//!
//! [`Router`] owns the host routing and packet-filter state for one tunnel
//! interface. `up` subscribes to default-route changes, every `set`
//! reconciles the firewall allow-list, interface addressing, DNS, and the
//! killswitch against a [`RouterConfig`], and `close` tears the state back
//! down.
//!
//! The allow-list hand-off is non-blocking (the reconciler applies it in the
//! background); interface addressing and DNS are applied synchronously and
//! their failures propagate, leaving a partially-applied state that the next
//! `set` repairs. Killswitch toggling failures are logged but never fail a
//! `set`: the tunnel must stay functional even when the toggle does not
//! land, and the unchanged flag makes the next `set` re-attempt it.

use crate::dns::DnsConfigurator;
use crate::firewall::FirewallReconciler;
use crate::interface_config::InterfaceConfigurator;
use crate::killswitch::{has_default_route, KillswitchBackend};
use crate::route_monitor::{RouteMonitor, RouteWatch};
use crate::types::{RouterConfig, RouterPhase};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;

/// Collaborators the router drives. Injected at construction so tests can
/// substitute fakes.
pub struct RouterDeps {
    /// Allow-list reconciler.
    pub firewall: FirewallReconciler,
    /// Killswitch backend.
    pub killswitch: Arc<dyn KillswitchBackend>,
    /// DNS configurator.
    pub dns: Arc<dyn DnsConfigurator>,
    /// Interface address and route configurator.
    pub interface_config: Arc<dyn InterfaceConfigurator>,
    /// Default-route change monitor.
    pub monitor: Arc<dyn RouteMonitor>,
}

/// Host routing and packet-filter controller for one tunnel interface.
pub struct Router {
    interface: String,
    firewall: FirewallReconciler,
    killswitch: Arc<dyn KillswitchBackend>,
    dns: Arc<dyn DnsConfigurator>,
    interface_config: Arc<dyn InterfaceConfigurator>,
    monitor: Arc<dyn RouteMonitor>,
    route_watch: Option<RouteWatch>,
    killswitch_enabled: bool,
    phase: RouterPhase,
}

impl Router {
    /// Create a router for `interface` over the given collaborators.
    pub fn new(interface: String, deps: RouterDeps) -> Self {
        Self {
            interface,
            firewall: deps.firewall,
            killswitch: deps.killswitch,
            dns: deps.dns,
            interface_config: deps.interface_config,
            monitor: deps.monitor,
            route_watch: None,
            killswitch_enabled: false,
            phase: RouterPhase::Uninitialized,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> RouterPhase {
        self.phase
    }

    /// Whether the killswitch is currently enabled.
    pub fn killswitch_enabled(&self) -> bool {
        self.killswitch_enabled
    }

    /// Bring the router up: schedule removal of stale allow rules and
    /// subscribe to default-route changes. Fails if the subscription cannot
    /// be established, since killswitch decisions depend on default-route
    /// awareness.
    pub async fn up(&mut self) -> Result<()> {
        if self.phase != RouterPhase::Uninitialized {
            anyhow::bail!("router is {:?}, cannot bring up", self.phase);
        }

        self.firewall.clear();

        let t0 = Instant::now();
        let interface = self.interface.clone();
        let watch = self
            .monitor
            .subscribe(
                &self.interface,
                Box::new(move |routes| {
                    log::info!(
                        "router: default routes changed while managing {}: {:?}",
                        interface,
                        routes
                    );
                }),
            )
            .await
            .with_context(|| {
                format!(
                    "subscribing to default-route changes, after {:?}",
                    t0.elapsed()
                )
            })?;
        log::info!(
            "router: default-route monitor registered in {:?}",
            t0.elapsed()
        );

        self.route_watch = Some(watch);
        self.phase = RouterPhase::Up;
        Ok(())
    }

    /// Apply `config` to the host. `None` is treated as the shutdown
    /// configuration. Repeatable; valid only while the router is up.
    pub async fn set(&mut self, config: Option<&RouterConfig>) -> Result<()> {
        if self.phase != RouterPhase::Up {
            anyhow::bail!("router is {:?}, cannot apply configuration", self.phase);
        }

        let shutdown_config;
        let config = match config {
            Some(config) => config,
            None => {
                shutdown_config = RouterConfig::shutdown();
                &shutdown_config
            }
        };

        // Hand the allow-list to the reconciler first; it applies in the
        // background and never blocks this path.
        let allow = config
            .local_addrs
            .iter()
            .map(|addr| addr.to_string())
            .collect();
        self.firewall.set_desired(allow);

        if let Err(err) = self.interface_config.configure(config).await {
            log::warn!("router: interface configuration failed: {:#}", err);
            return Err(err);
        }

        self.dns.set(&config.dns).await.context("dns set")?;

        self.apply_killswitch(config).await;
        Ok(())
    }

    /// Evaluate the killswitch transition for `config`. The flag flips only
    /// on default-route presence changes, and only after the backend call
    /// succeeds; on failure it stays put so the next `set` retries the same
    /// transition.
    async fn apply_killswitch(&mut self, config: &RouterConfig) {
        let has_default = has_default_route(&config.routes);
        if has_default && !self.killswitch_enabled {
            log::info!("router: enabling default-route killswitch");
            match self
                .killswitch
                .enable(&self.interface, &config.local_addrs)
                .await
            {
                Ok(()) => self.killswitch_enabled = true,
                Err(err) => log::warn!("router: enabling killswitch failed: {:#}", err),
            }
        } else if !has_default && self.killswitch_enabled {
            log::info!("router: disabling default-route killswitch");
            match self.killswitch.disable().await {
                Ok(()) => self.killswitch_enabled = false,
                Err(err) => log::warn!("router: disabling killswitch failed: {:#}", err),
            }
        }
    }

    /// Tear down: schedule removal of all allow rules, retract DNS, and stop
    /// the route watch. Terminal; repeated calls are no-ops.
    pub async fn close(&mut self) -> Result<()> {
        if self.phase == RouterPhase::Closed {
            return Ok(());
        }

        self.firewall.clear();

        self.dns.down().await.context("dns down")?;

        if let Some(watch) = self.route_watch.take() {
            watch.unsubscribe().await;
        }

        self.phase = RouterPhase::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::FirewallCommands;
    use crate::route_monitor::RouteChangeCallback;
    use crate::types::DnsConfig;
    use async_trait::async_trait;
    use ipnet::IpNet;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::watch;

    /// Firewall backend that records applied rules without failures.
    #[derive(Default)]
    struct RecordingFirewall {
        rules: Mutex<Vec<String>>,
    }

    impl RecordingFirewall {
        fn applied(&self) -> Vec<String> {
            self.rules.lock().clone()
        }
    }

    #[async_trait]
    impl FirewallCommands for RecordingFirewall {
        async fn clear_allow_rules(&self) -> anyhow::Result<Duration> {
            self.rules.lock().clear();
            Ok(Duration::from_millis(1))
        }

        async fn delete_process_rule(&self) -> anyhow::Result<Duration> {
            Ok(Duration::from_millis(1))
        }

        async fn add_process_rule(&self, _program: &Path) -> anyhow::Result<Duration> {
            Ok(Duration::from_millis(1))
        }

        async fn add_allow_rule(&self, cidr: &str) -> anyhow::Result<Duration> {
            self.rules.lock().push(cidr.to_string());
            Ok(Duration::from_millis(1))
        }
    }

    #[derive(Default)]
    struct FakeKillswitch {
        enables: AtomicUsize,
        disables: AtomicUsize,
        fail_enable: AtomicBool,
    }

    #[async_trait]
    impl KillswitchBackend for FakeKillswitch {
        async fn enable(&self, _interface: &str, _tunnel_addrs: &[IpNet]) -> anyhow::Result<()> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            if self.fail_enable.load(Ordering::SeqCst) {
                anyhow::bail!("killswitch enable failed");
            }
            Ok(())
        }

        async fn disable(&self) -> anyhow::Result<()> {
            self.disables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDns {
        sets: AtomicUsize,
        downs: AtomicUsize,
        fail_set: AtomicBool,
        last: Mutex<Option<DnsConfig>>,
    }

    #[async_trait]
    impl DnsConfigurator for FakeDns {
        async fn set(&self, config: &DnsConfig) -> anyhow::Result<()> {
            if self.fail_set.load(Ordering::SeqCst) {
                anyhow::bail!("dns apply failed");
            }
            self.sets.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(config.clone());
            Ok(())
        }

        async fn down(&self) -> anyhow::Result<()> {
            self.downs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeInterfaceConfig {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl InterfaceConfigurator for FakeInterfaceConfig {
        async fn configure(&self, _config: &RouterConfig) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("interface configuration failed");
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeMonitor {
        subscribes: AtomicUsize,
        unsubscribed: Arc<AtomicBool>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl RouteMonitor for FakeMonitor {
        async fn subscribe(
            &self,
            _interface: &str,
            _on_change: RouteChangeCallback,
        ) -> anyhow::Result<RouteWatch> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("subscription failed");
            }
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let unsubscribed = self.unsubscribed.clone();
            let (tx, mut rx) = watch::channel(false);
            let task = tokio::spawn(async move {
                let _ = rx.changed().await;
                unsubscribed.store(true, Ordering::SeqCst);
            });
            Ok(RouteWatch::new(tx, task))
        }
    }

    struct Fixture {
        backend: Arc<RecordingFirewall>,
        firewall: FirewallReconciler,
        killswitch: Arc<FakeKillswitch>,
        dns: Arc<FakeDns>,
        interface_config: Arc<FakeInterfaceConfig>,
        monitor: Arc<FakeMonitor>,
    }

    fn fixture() -> (Router, Fixture) {
        let backend = Arc::new(RecordingFirewall::default());
        let firewall =
            FirewallReconciler::with_max_backoff(backend.clone(), Duration::from_millis(1));
        let killswitch = Arc::new(FakeKillswitch::default());
        let dns = Arc::new(FakeDns::default());
        let interface_config = Arc::new(FakeInterfaceConfig::default());
        let monitor = Arc::new(FakeMonitor::default());

        let router = Router::new(
            "tun0".to_string(),
            RouterDeps {
                firewall: firewall.clone(),
                killswitch: killswitch.clone(),
                dns: dns.clone(),
                interface_config: interface_config.clone(),
                monitor: monitor.clone(),
            },
        );

        (
            router,
            Fixture {
                backend,
                firewall,
                killswitch,
                dns,
                interface_config,
                monitor,
            },
        )
    }

    fn cfg(local: &[&str], routes: &[&str]) -> RouterConfig {
        RouterConfig {
            local_addrs: local.iter().map(|s| s.parse().unwrap()).collect(),
            routes: routes.iter().map(|s| s.parse().unwrap()).collect(),
            dns: DnsConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_up_subscribes_and_enters_up_phase() {
        let (mut router, fx) = fixture();
        assert_eq!(router.phase(), RouterPhase::Uninitialized);

        router.up().await.unwrap();
        assert_eq!(router.phase(), RouterPhase::Up);
        assert_eq!(fx.monitor.subscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_up_fails_when_subscription_fails() {
        let (mut router, fx) = fixture();
        fx.monitor.fail.store(true, Ordering::SeqCst);

        assert!(router.up().await.is_err());
        assert_eq!(router.phase(), RouterPhase::Uninitialized);
        // Configuration is still rejected afterwards.
        assert!(router.set(Some(&cfg(&[], &[]))).await.is_err());
    }

    #[tokio::test]
    async fn test_set_rejected_before_up() {
        let (mut router, fx) = fixture();
        assert!(router.set(Some(&cfg(&["10.0.0.1/32"], &[]))).await.is_err());
        assert_eq!(fx.interface_config.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_default_route_scenario() {
        let (mut router, fx) = fixture();
        router.up().await.unwrap();

        router
            .set(Some(&cfg(&["10.0.0.1/32"], &["0.0.0.0/0"])))
            .await
            .unwrap();
        fx.firewall.settled().await;

        assert_eq!(fx.backend.applied(), vec!["10.0.0.1/32"]);
        assert_eq!(fx.killswitch.enables.load(Ordering::SeqCst), 1);
        assert!(router.killswitch_enabled());

        // Same default-route presence again: no extra toggle.
        router
            .set(Some(&cfg(&["10.0.0.1/32"], &["0.0.0.0/0"])))
            .await
            .unwrap();
        assert_eq!(fx.killswitch.enables.load(Ordering::SeqCst), 1);
        assert_eq!(fx.killswitch.disables.load(Ordering::SeqCst), 0);

        // Dropping the default route disables exactly once and drains the
        // allow-list.
        router.set(Some(&cfg(&[], &[]))).await.unwrap();
        fx.firewall.settled().await;

        assert!(fx.backend.applied().is_empty());
        assert_eq!(fx.killswitch.disables.load(Ordering::SeqCst), 1);
        assert!(!router.killswitch_enabled());
    }

    #[tokio::test]
    async fn test_none_config_is_shutdown() {
        let (mut router, fx) = fixture();
        router.up().await.unwrap();

        router
            .set(Some(&cfg(&["10.0.0.1/32"], &["0.0.0.0/0"])))
            .await
            .unwrap();
        router.set(None).await.unwrap();
        fx.firewall.settled().await;

        assert!(fx.backend.applied().is_empty());
        assert!(!router.killswitch_enabled());
        let last = fx.dns.last.lock().clone().unwrap();
        assert!(last.nameservers.is_empty());
    }

    #[tokio::test]
    async fn test_killswitch_failure_is_not_fatal_and_retries() {
        let (mut router, fx) = fixture();
        router.up().await.unwrap();

        fx.killswitch.fail_enable.store(true, Ordering::SeqCst);
        router
            .set(Some(&cfg(&["10.0.0.1/32"], &["0.0.0.0/0"])))
            .await
            .unwrap();
        assert_eq!(fx.killswitch.enables.load(Ordering::SeqCst), 1);
        assert!(!router.killswitch_enabled());

        // The same transition is re-attempted once the backend recovers.
        fx.killswitch.fail_enable.store(false, Ordering::SeqCst);
        router
            .set(Some(&cfg(&["10.0.0.1/32"], &["0.0.0.0/0"])))
            .await
            .unwrap();
        assert_eq!(fx.killswitch.enables.load(Ordering::SeqCst), 2);
        assert!(router.killswitch_enabled());
    }

    #[tokio::test]
    async fn test_interface_failure_aborts_before_dns() {
        let (mut router, fx) = fixture();
        router.up().await.unwrap();

        fx.interface_config.fail.store(true, Ordering::SeqCst);
        assert!(router
            .set(Some(&cfg(&["10.0.0.1/32"], &["0.0.0.0/0"])))
            .await
            .is_err());
        assert_eq!(fx.dns.sets.load(Ordering::SeqCst), 0);
        assert_eq!(fx.killswitch.enables.load(Ordering::SeqCst), 0);

        // A later set repairs the partially-applied state.
        fx.interface_config.fail.store(false, Ordering::SeqCst);
        router
            .set(Some(&cfg(&["10.0.0.1/32"], &["0.0.0.0/0"])))
            .await
            .unwrap();
        assert_eq!(fx.dns.sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dns_failure_propagates_before_killswitch() {
        let (mut router, fx) = fixture();
        router.up().await.unwrap();

        fx.dns.fail_set.store(true, Ordering::SeqCst);
        assert!(router
            .set(Some(&cfg(&["10.0.0.1/32"], &["0.0.0.0/0"])))
            .await
            .is_err());
        assert_eq!(fx.interface_config.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.killswitch.enables.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_tears_down() {
        let (mut router, fx) = fixture();
        router.up().await.unwrap();
        router
            .set(Some(&cfg(&["10.0.0.1/32"], &[])))
            .await
            .unwrap();

        router.close().await.unwrap();
        fx.firewall.settled().await;

        assert_eq!(router.phase(), RouterPhase::Closed);
        assert!(fx.backend.applied().is_empty());
        assert_eq!(fx.dns.downs.load(Ordering::SeqCst), 1);
        assert!(fx.monitor.unsubscribed.load(Ordering::SeqCst));

        // Closed is terminal: set is rejected, another close is a no-op.
        assert!(router.set(Some(&cfg(&[], &[]))).await.is_err());
        router.close().await.unwrap();
        assert_eq!(fx.dns.downs.load(Ordering::SeqCst), 1);
    }
}
