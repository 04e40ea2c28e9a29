// Settings file parser

//! Settings file parsing and validation
//!
//! This module handles loading the TOML settings file and validating its
//! contents: the interface name must be safe to interpolate into OS
//! commands, and the tunnel addresses, routes, and resolvers must parse.

use crate::types::{DnsConfig, RouterConfig, Settings};
use anyhow::{Context, Result};
use ipnet::IpNet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

/// Load settings from a TOML file.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read settings file")?;

    let settings: Settings = toml::from_str(&contents).context("Failed to parse settings file")?;

    validate_settings(&settings)?;
    Ok(settings)
}

/// Validates that an interface name is safe to pass to OS commands.
/// Only alphanumeric characters, hyphens, and underscores are allowed to
/// prevent command injection.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("interface name cannot be empty");
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "interface name contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            name
        );
    }

    Ok(())
}

/// Validate settings values.
fn validate_settings(settings: &Settings) -> Result<()> {
    validate_interface_name(&settings.general.interface)?;

    if settings.general.route_poll_secs == 0 {
        anyhow::bail!("route_poll_secs must be > 0");
    }

    for addr in &settings.tunnel.local_addrs {
        addr.parse::<IpNet>()
            .with_context(|| format!("Invalid local address prefix: {}", addr))?;
    }

    for route in &settings.tunnel.routes {
        route
            .parse::<IpNet>()
            .with_context(|| format!("Invalid route prefix: {}", route))?;
    }

    for server in &settings.tunnel.dns_servers {
        server
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid DNS server address: {}", server))?;
    }

    Ok(())
}

impl Settings {
    /// Render the `[tunnel]` section into the runtime configuration handed
    /// to [`crate::router::Router::set`].
    pub fn tunnel_config(&self) -> Result<RouterConfig> {
        let local_addrs = self
            .tunnel
            .local_addrs
            .iter()
            .map(|a| {
                a.parse::<IpNet>()
                    .with_context(|| format!("Invalid local address prefix: {}", a))
            })
            .collect::<Result<Vec<_>>>()?;

        let routes = self
            .tunnel
            .routes
            .iter()
            .map(|r| {
                r.parse::<IpNet>()
                    .with_context(|| format!("Invalid route prefix: {}", r))
            })
            .collect::<Result<Vec<_>>>()?;

        let nameservers = self
            .tunnel
            .dns_servers
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .with_context(|| format!("Invalid DNS server address: {}", s))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RouterConfig {
            local_addrs,
            routes,
            dns: DnsConfig {
                nameservers,
                search_domains: self.tunnel.search_domains.clone(),
            },
        })
    }
}
