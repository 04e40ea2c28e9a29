// Host routing and firewall management for a VPN tunnel endpoint

#![warn(missing_docs)]

//! Host routing and firewall management for a VPN tunnel endpoint
//!
//! This library keeps the operating system's routing and packet-filter state
//! in line with a tunnel configuration: it brings the tunnel interface up,
//! watches for default-route changes, applies DNS settings, maintains a
//! dynamic firewall allow-list for the tunnel addresses, and toggles a
//! killswitch that blocks non-tunnel egress once the tunnel owns the default
//! route.
//!
//! The OS packet-filter tool is slow (usually tens of milliseconds, minutes
//! in the worst observed case) and occasionally fails, so allow-list changes
//! are never applied synchronously from the configuration path. Instead the
//! [`firewall::FirewallReconciler`] converges desired and applied state from
//! a background task with last-write-wins coalescing and retry-with-backoff.
//!
//! # Main Components
//!
//! - [`router`]: lifecycle controller orchestrating bring-up, reconfigure,
//!   and tear-down
//! - [`firewall`]: asynchronous allow-list reconciliation
//! - [`killswitch`]: default-route egress blocking
//! - [`route_monitor`]: default-route change detection
//! - [`dns`]: DNS configuration for the tunnel interface
//! - [`interface_config`]: interface address and route assignment
//! - [`backoff`]: exponential backoff policy for retry loops
//! - [`health`]: per-component error status registry
//! - [`config`]: settings file parsing and validation
//! - [`types`]: shared data structures

pub mod backoff;
pub mod config;
pub mod dns;
pub mod firewall;
pub mod health;
pub mod interface_config;
pub mod killswitch;
pub mod route_monitor;
pub mod router;
pub mod types;
