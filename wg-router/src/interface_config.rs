// Tunnel interface addressing

//! Interface address and route assignment
//!
//! Applies the addresses and routes from a [`RouterConfig`] to the tunnel
//! interface. [`InterfaceConfigurator`] is the seam the router drives;
//! [`NetshInterfaceConfig`] shells out to the OS interface tool per address
//! and route. Re-adding an address or route that already exists is an error
//! for the tool, so every add is preceded by a best-effort delete instead of
//! interpreting the tool's (localized) error text.

use crate::types::RouterConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use tokio::process::Command;

/// Applies interface addressing and routes for the tunnel.
#[async_trait]
pub trait InterfaceConfigurator: Send + Sync {
    /// Apply the addresses and routes in `config` to the tunnel interface.
    /// The empty (shutdown) configuration reverts the interface to DHCP
    /// addressing.
    async fn configure(&self, config: &RouterConfig) -> Result<()>;
}

/// `netsh interface`-backed implementation of [`InterfaceConfigurator`].
pub struct NetshInterfaceConfig {
    interface: String,
}

impl NetshInterfaceConfig {
    /// Create a configurator for `interface`.
    pub fn new(interface: String) -> Self {
        Self { interface }
    }

    /// The tunnel interface must exist before it can be configured.
    fn interface_exists(&self) -> Result<bool> {
        let addrs = if_addrs::get_if_addrs().context("failed to enumerate interfaces")?;
        Ok(addrs.iter().any(|iface| iface.name == self.interface))
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

    /// Best-effort variant of [`run`](Self::run) for speculative deletes.
    async fn run_best_effort(&self, args: Vec<String>) {
        let _ = self.run(args).await;
    }
}

fn route_family(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => "ipv4",
        IpNet::V6(_) => "ipv6",
    }
}

/// Arguments replacing the primary IPv4 address of `interface`.
fn v4_set_address_args(interface: &str, net: &Ipv4Net) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv4".into(),
        "set".into(),
        "address".into(),
        format!("name={}", interface),
        "source=static".into(),
        format!("address={}", net.addr()),
        format!("mask={}", net.netmask()),
    ]
}

/// Arguments adding a secondary IPv4 address.
fn v4_add_address_args(interface: &str, net: &Ipv4Net) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv4".into(),
        "add".into(),
        "address".into(),
        format!("name={}", interface),
        format!("address={}", net.addr()),
        format!("mask={}", net.netmask()),
    ]
}

/// Arguments removing an IPv4 address before re-adding it.
fn v4_delete_address_args(interface: &str, net: &Ipv4Net) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv4".into(),
        "delete".into(),
        "address".into(),
        format!("name={}", interface),
        format!("address={}", net.addr()),
    ]
}

/// Arguments reverting `interface` to DHCP addressing.
fn v4_dhcp_args(interface: &str) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv4".into(),
        "set".into(),
        "address".into(),
        format!("name={}", interface),
        "source=dhcp".into(),
    ]
}

/// Arguments adding an IPv6 address.
fn v6_add_address_args(interface: &str, net: &Ipv6Net) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv6".into(),
        "add".into(),
        "address".into(),
        format!("interface={}", interface),
        format!("address={}/{}", net.addr(), net.prefix_len()),
    ]
}

/// Arguments removing an IPv6 address before re-adding it.
fn v6_delete_address_args(interface: &str, net: &Ipv6Net) -> Vec<String> {
    vec![
        "interface".into(),
        "ipv6".into(),
        "delete".into(),
        "address".into(),
        format!("interface={}", interface),
        format!("address={}", net.addr()),
    ]
}

/// Arguments routing `net` through `interface`. Host bits are cleared so
/// the tool sees a proper network prefix.
fn route_add_args(interface: &str, net: &IpNet) -> Vec<String> {
    vec![
        "interface".into(),
        route_family(net).into(),
        "add".into(),
        "route".into(),
        format!("prefix={}", net.trunc()),
        format!("interface={}", interface),
        "store=active".into(),
    ]
}

/// Arguments removing the route for `net` before re-adding it.
fn route_delete_args(interface: &str, net: &IpNet) -> Vec<String> {
    vec![
        "interface".into(),
        route_family(net).into(),
        "delete".into(),
        "route".into(),
        format!("prefix={}", net.trunc()),
        format!("interface={}", interface),
    ]
}

#[async_trait]
impl InterfaceConfigurator for NetshInterfaceConfig {
    async fn configure(&self, config: &RouterConfig) -> Result<()> {
        anyhow::ensure!(
            self.interface_exists()?,
            "tunnel interface {} does not exist",
            self.interface
        );

        if config.local_addrs.is_empty() {
            // Shutdown configuration: hand addressing back to DHCP.
            self.run(v4_dhcp_args(&self.interface))
                .await
                .context("reverting interface to dhcp")?;
            log::info!("interface {} reverted to dhcp addressing", self.interface);
            return Ok(());
        }

        let mut first_v4 = true;
        for addr in &config.local_addrs {
            match addr {
                IpNet::V4(net) => {
                    let args = if first_v4 {
                        v4_set_address_args(&self.interface, net)
                    } else {
                        self.run_best_effort(v4_delete_address_args(&self.interface, net))
                            .await;
                        v4_add_address_args(&self.interface, net)
                    };
                    first_v4 = false;
                    self.run(args)
                        .await
                        .with_context(|| format!("assigning address {}", net))?;
                }
                IpNet::V6(net) => {
                    self.run_best_effort(v6_delete_address_args(&self.interface, net))
                        .await;
                    self.run(v6_add_address_args(&self.interface, net))
                        .await
                        .with_context(|| format!("assigning address {}", net))?;
                }
            }
        }

        for route in &config.routes {
            self.run_best_effort(route_delete_args(&self.interface, route))
                .await;
            self.run(route_add_args(&self.interface, route))
                .await
                .with_context(|| format!("adding route {}", route))?;
        }

        log::info!(
            "interface {} configured: {} addrs, {} routes",
            self.interface,
            config.local_addrs.len(),
            config.routes.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_set_address_args() {
        let net: Ipv4Net = "10.0.0.7/24".parse().unwrap();
        let args = v4_set_address_args("tun0", &net);
        assert!(args.contains(&"name=tun0".to_string()));
        assert!(args.contains(&"source=static".to_string()));
        assert!(args.contains(&"address=10.0.0.7".to_string()));
        assert!(args.contains(&"mask=255.255.255.0".to_string()));
    }

    #[test]
    fn test_v6_add_address_args_keep_prefix_length() {
        let net: Ipv6Net = "fd00::1/64".parse().unwrap();
        let args = v6_add_address_args("tun0", &net);
        assert!(args.contains(&"interface=tun0".to_string()));
        assert!(args.contains(&"address=fd00::1/64".to_string()));
    }

    #[test]
    fn test_route_args_clear_host_bits() {
        // A route given with host bits set is normalized to the network
        // prefix before being handed to the tool.
        let net: IpNet = "10.1.2.3/16".parse().unwrap();
        let args = route_add_args("tun0", &net);
        assert!(args.contains(&"prefix=10.1.0.0/16".to_string()));
        assert!(args.contains(&"store=active".to_string()));
    }

    #[test]
    fn test_route_family_selection() {
        let v4: IpNet = "0.0.0.0/0".parse().unwrap();
        let v6: IpNet = "::/0".parse().unwrap();
        assert_eq!(route_add_args("tun0", &v4)[1], "ipv4");
        assert_eq!(route_add_args("tun0", &v6)[1], "ipv6");
        assert_eq!(route_delete_args("tun0", &v6)[2], "delete");
    }

    #[test]
    fn test_v4_dhcp_args() {
        let args = v4_dhcp_args("tun0");
        assert!(args.contains(&"source=dhcp".to_string()));
    }
}
