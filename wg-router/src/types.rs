// Shared configuration types

//! Shared data structures
//!
//! This module defines the runtime tunnel configuration handed to the router
//! on every `set` call, the router lifecycle phases, and the daemon settings
//! file schema.

use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;

/// DNS configuration for the tunnel interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsConfig {
    /// Resolvers to use while the tunnel is up.
    pub nameservers: Vec<IpAddr>,
    /// Search domains, where the DNS backend supports them.
    pub search_domains: Vec<String>,
}

/// Tunnel configuration applied by [`crate::router::Router::set`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterConfig {
    /// Prefixes assigned to the tunnel interface. These become the firewall
    /// allow-list.
    pub local_addrs: Vec<IpNet>,
    /// Prefixes routed through the tunnel. A prefix length of 0 means the
    /// default route is being sent through the tunnel.
    pub routes: Vec<IpNet>,
    /// DNS settings for the tunnel interface.
    pub dns: DnsConfig,
}

impl RouterConfig {
    /// The all-empty configuration substituted when a caller passes `None`
    /// to `set`: no addresses, no routes, no DNS.
    pub fn shutdown() -> Self {
        Self::default()
    }
}

/// Router lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterPhase {
    /// Created but not yet brought up.
    Uninitialized,
    /// Up and accepting `set` calls.
    Up,
    /// Torn down. Terminal.
    Closed,
}

/// Daemon settings file schema.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// General daemon options.
    pub general: GeneralSettings,
    /// The tunnel configuration to apply at startup.
    #[serde(default)]
    pub tunnel: TunnelSettings,
}

/// General daemon options.
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralSettings {
    /// Name of the tunnel interface to manage.
    pub interface: String,
    /// Log filter passed to the logger at startup.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Interval in seconds between default-route polls.
    #[serde(default = "default_route_poll_secs")]
    pub route_poll_secs: u64,
}

/// The `[tunnel]` section: addresses, routes, and DNS, all as strings
/// validated at load time.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TunnelSettings {
    /// CIDR prefixes assigned to the tunnel interface.
    #[serde(default)]
    pub local_addrs: Vec<String>,
    /// CIDR prefixes routed through the tunnel. `0.0.0.0/0` or `::/0`
    /// sends the default route through it.
    #[serde(default)]
    pub routes: Vec<String>,
    /// Resolver addresses applied while the tunnel is up.
    #[serde(default)]
    pub dns_servers: Vec<String>,
    /// DNS search domains.
    #[serde(default)]
    pub search_domains: Vec<String>,
}

// Default values for settings
fn default_log_level() -> String {
    "info".to_string()
}

fn default_route_poll_secs() -> u64 {
    5
}
