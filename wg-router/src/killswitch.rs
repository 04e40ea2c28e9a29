// Default-route killswitch

//! Killswitch control for default-route tunneling
//!
//! When the tunnel takes over the default route, the host firewall has to
//! block outbound traffic through the old default route. The OS keeps
//! established connections stuck to the egress interface that was active
//! when they were created, so sockets that predate the switchover keep
//! bypassing the tunnel until they are reset. Blocking them forces a prompt
//! reconnect over the tunnel, and for a privacy VPN it is also what prevents
//! traffic from leaking around the tunnel.
//!
//! The decision is a pure predicate over the routes handed to
//! [`crate::router::Router::set`]; the mutation is delegated to a
//! [`KillswitchBackend`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::time::Instant;
use tokio::process::Command;

/// True when `routes` contains a default route (prefix length 0).
pub fn has_default_route(routes: &[IpNet]) -> bool {
    routes.iter().any(|r| r.prefix_len() == 0)
}

/// Toggles the "deny all but tunnel" firewall rule set.
#[async_trait]
pub trait KillswitchBackend: Send + Sync {
    /// Install the egress block for `interface`, carving out tunnel-bound
    /// traffic. `tunnel_addrs` are the prefixes currently assigned to the
    /// tunnel interface.
    async fn enable(&self, interface: &str, tunnel_addrs: &[IpNet]) -> Result<()>;

    /// Remove the egress block.
    async fn disable(&self) -> Result<()>;
}

const ALLOW_LOOPBACK_OUT: &str = "WgRouter-KS-LoopbackOut";
const ALLOW_DHCP: &str = "WgRouter-KS-Dhcp";
const ALLOW_PROCESS: &str = "WgRouter-KS-Process";
const ALLOW_TUNNEL_OUT: &str = "WgRouter-KS-TunnelOut";
const ALLOW_TUNNEL_IN: &str = "WgRouter-KS-TunnelIn";
const BLOCK_OUT: &str = "WgRouter-KS-BlockOut";

/// Every rule the killswitch may install, block rules first so removal
/// never leaves a window where the block exists without its carve-outs.
const ALL_RULES: [&str; 6] = [
    BLOCK_OUT,
    ALLOW_TUNNEL_IN,
    ALLOW_TUNNEL_OUT,
    ALLOW_PROCESS,
    ALLOW_DHCP,
    ALLOW_LOOPBACK_OUT,
];

/// `netsh advfirewall`-backed implementation of [`KillswitchBackend`].
#[derive(Debug, Default)]
pub struct NetshKillswitch;

impl NetshKillswitch {
    /// Create the netsh-backed killswitch.
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        let output = Command::new("netsh")
            .arg("advfirewall")
            .arg("firewall")
            .args(&args)
            .output()
            .await
            .context("failed to execute netsh")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "netsh advfirewall firewall {} failed: {}",
                args.join(" "),
                stderr.trim()
            );
        }
        Ok(())
    }

    async fn add_rule(&self, name: &str, mut params: Vec<String>) -> Result<()> {
        let mut args = vec!["add".to_string(), "rule".to_string(), format!("name={}", name)];
        args.append(&mut params);
        self.run(args)
            .await
            .with_context(|| format!("adding rule {}", name))
    }

    async fn delete_rule(&self, name: &str) {
        // Absence of the rule is the desired outcome; failures are dropped.
        let _ = self
            .run(vec![
                "delete".to_string(),
                "rule".to_string(),
                format!("name={}", name),
            ])
            .await;
    }

    async fn remove_rules(&self) {
        for name in ALL_RULES {
            self.delete_rule(name).await;
        }
    }
}

#[async_trait]
impl KillswitchBackend for NetshKillswitch {
    async fn enable(&self, interface: &str, tunnel_addrs: &[IpNet]) -> Result<()> {
        let t0 = Instant::now();

        // Drop any half-applied set from an earlier attempt.
        self.remove_rules().await;

        // Allow rules go in before the block rule so permitted traffic is
        // never dropped during the transition.
        self.add_rule(
            ALLOW_LOOPBACK_OUT,
            vec![
                "dir=out".into(),
                "action=allow".into(),
                "remoteip=127.0.0.0/8".into(),
                "enable=yes".into(),
            ],
        )
        .await?;

        self.add_rule(
            ALLOW_DHCP,
            vec![
                "dir=out".into(),
                "action=allow".into(),
                "protocol=udp".into(),
                "remoteport=67".into(),
                "enable=yes".into(),
            ],
        )
        .await?;

        if let Ok(exe) = std::env::current_exe() {
            self.add_rule(
                ALLOW_PROCESS,
                vec![
                    "dir=out".into(),
                    "action=allow".into(),
                    format!("program={}", exe.display()),
                    "enable=yes".into(),
                ],
            )
            .await?;
        }

        if !tunnel_addrs.is_empty() {
            let addrs = tunnel_addrs
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(",");
            self.add_rule(
                ALLOW_TUNNEL_OUT,
                vec![
                    "dir=out".into(),
                    "action=allow".into(),
                    format!("remoteip={}", addrs),
                    "enable=yes".into(),
                ],
            )
            .await?;
            self.add_rule(
                ALLOW_TUNNEL_IN,
                vec![
                    "dir=in".into(),
                    "action=allow".into(),
                    format!("remoteip={}", addrs),
                    "enable=yes".into(),
                ],
            )
            .await?;
        }

        self.add_rule(
            BLOCK_OUT,
            vec!["dir=out".into(), "action=block".into(), "enable=yes".into()],
        )
        .await?;

        log::info!("killswitch: enabled for {} in {:?}", interface, t0.elapsed());
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        let t0 = Instant::now();
        self.remove_rules().await;
        log::info!("killswitch: disabled in {:?}", t0.elapsed());
        Ok(())
    }
}
