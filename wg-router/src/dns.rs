// DNS configuration for the tunnel interface

//! DNS configuration management
//!
//! Applies and retracts per-interface resolver settings for the tunnel.
//! [`DnsConfigurator`] is the seam the router drives; [`NetshDns`] is the
//! netsh-backed implementation, which sets static resolvers while the
//! tunnel is up and hands the interface back to DHCP on teardown.

use crate::types::DnsConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use tokio::process::Command;

/// Applies DNS settings for the tunnel interface.
#[async_trait]
pub trait DnsConfigurator: Send + Sync {
    /// Apply resolvers for the tunnel interface. An empty nameserver list
    /// is equivalent to [`DnsConfigurator::down`].
    async fn set(&self, config: &DnsConfig) -> Result<()>;

    /// Retract tunnel DNS settings, reverting the interface to DHCP.
    async fn down(&self) -> Result<()>;
}

/// `netsh interface`-backed DNS configuration.
pub struct NetshDns {
    interface: String,
}

impl NetshDns {
    /// Create a DNS configurator for `interface`.
    pub fn new(interface: String) -> Self {
        Self { interface }
    }

    async fn run(&self, args: Vec<String>) -> Result<()> {
        let output = Command::new("netsh")
            .args(&args)
            .output()
            .await
            .context("failed to execute netsh")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("netsh {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(())
    }
}

fn family(addr: &IpAddr) -> &'static str {
    if addr.is_ipv4() {
        "ipv4"
    } else {
        "ipv6"
    }
}

/// Arguments replacing the resolver list of one address family with `addr`.
fn set_resolver_args(interface: &str, addr: &IpAddr) -> Vec<String> {
    vec![
        "interface".into(),
        family(addr).into(),
        "set".into(),
        "dnsservers".into(),
        format!("name={}", interface),
        "source=static".into(),
        format!("address={}", addr),
        "register=primary".into(),
        "validate=no".into(),
    ]
}

/// Arguments appending `addr` to a family's resolver list at `index`
/// (1-based).
fn add_resolver_args(interface: &str, addr: &IpAddr, index: usize) -> Vec<String> {
    vec![
        "interface".into(),
        family(addr).into(),
        "add".into(),
        "dnsservers".into(),
        format!("name={}", interface),
        format!("address={}", addr),
        format!("index={}", index),
        "validate=no".into(),
    ]
}

/// Arguments reverting one address family's resolvers to DHCP.
fn revert_resolver_args(interface: &str, fam: &str) -> Vec<String> {
    vec![
        "interface".into(),
        fam.into(),
        "set".into(),
        "dnsservers".into(),
        format!("name={}", interface),
        "source=dhcp".into(),
    ]
}

#[async_trait]
impl DnsConfigurator for NetshDns {
    async fn set(&self, config: &DnsConfig) -> Result<()> {
        if config.nameservers.is_empty() {
            return self.down().await;
        }
        if !config.search_domains.is_empty() {
            // Per-interface search lists are not expressible through this
            // backend's tool.
            log::debug!(
                "dns: search domains {:?} not supported by this backend, skipping",
                config.search_domains
            );
        }

        // The first resolver of each family replaces that family's list;
        // the rest append behind it.
        let mut v4_count = 0usize;
        let mut v6_count = 0usize;
        for addr in &config.nameservers {
            let count = if addr.is_ipv4() {
                &mut v4_count
            } else {
                &mut v6_count
            };
            *count += 1;
            let args = if *count == 1 {
                set_resolver_args(&self.interface, addr)
            } else {
                add_resolver_args(&self.interface, addr, *count)
            };
            self.run(args)
                .await
                .with_context(|| format!("configuring resolver {}", addr))?;
        }

        log::info!(
            "dns: configured {} resolvers on {}",
            config.nameservers.len(),
            self.interface
        );
        Ok(())
    }

    async fn down(&self) -> Result<()> {
        for fam in ["ipv4", "ipv6"] {
            self.run(revert_resolver_args(&self.interface, fam))
                .await
                .with_context(|| format!("reverting {} resolvers to dhcp", fam))?;
        }
        log::info!("dns: reverted {} to dhcp", self.interface);
        Ok(())
    }
}
