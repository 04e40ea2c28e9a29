// Firewall allow-list reconciler

//! Asynchronous firewall allow-list reconciliation
//!
//! Changing the OS packet filter would normally not be complicated, but the
//! management tool can be extremely slow for reasons not understood: usually
//! tens of milliseconds, sometimes minutes. It also fails occasionally. Rule
//! changes therefore cannot be applied synchronously from the configuration
//! path.
//!
//! [`FirewallReconciler`] tracks the desired allow-list separately from the
//! last list known to be applied and converges the two from a single
//! background task. Rapid updates coalesce (last write wins; superseded
//! intermediate lists are never durably applied) and failures retry
//! indefinitely with exponential backoff. The reconciler is the sole writer
//! of the managed rule set; no other component issues raw allow-rule
//! commands.

use crate::backoff::Backoff;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Name of the inbound allow rules covering the tunnel addresses.
const ALLOW_RULE: &str = "WgRouter-In";

/// Name of the one-time rule allowing this executable to receive UDP.
const PROCESS_RULE: &str = "WgRouter-Process";

/// Delay cap between convergence attempts when commands keep failing.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Executes individual packet-filter management operations.
///
/// Every call reports how long the underlying command took, since the tool
/// is known to stall and the latencies are worth logging. The tool reports
/// an error when a delete matches no rule; callers cleaning up speculatively
/// treat deletes as best-effort and ignore the result.
#[async_trait]
pub trait FirewallCommands: Send + Sync {
    /// Delete every inbound allow rule managed by the reconciler.
    async fn clear_allow_rules(&self) -> Result<Duration>;

    /// Delete a stale copy of the executable-allow rule.
    async fn delete_process_rule(&self) -> Result<Duration>;

    /// Install the rule allowing `program` to receive inbound tunnel UDP.
    async fn add_process_rule(&self, program: &Path) -> Result<Duration>;

    /// Install an inbound allow rule for one CIDR.
    async fn add_allow_rule(&self, cidr: &str) -> Result<Duration>;
}

/// `netsh advfirewall`-backed implementation of [`FirewallCommands`].
#[derive(Debug, Default)]
pub struct NetshFirewall;

impl NetshFirewall {
    /// Create the netsh-backed executor.
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: Vec<String>) -> Result<Duration> {
        let t0 = Instant::now();
        let output = Command::new("netsh")
            .arg("advfirewall")
            .arg("firewall")
            .args(&args)
            .output()
            .await
            .context("failed to execute netsh")?;
        let elapsed = t0.elapsed();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "netsh advfirewall firewall {} failed after {:?}: {}",
                args.join(" "),
                elapsed,
                stderr.trim()
            );
        }
        Ok(elapsed)
    }
}

#[async_trait]
impl FirewallCommands for NetshFirewall {
    async fn clear_allow_rules(&self) -> Result<Duration> {
        self.run(vec![
            "delete".into(),
            "rule".into(),
            format!("name={}", ALLOW_RULE),
            "dir=in".into(),
        ])
        .await
    }

    async fn delete_process_rule(&self) -> Result<Duration> {
        self.run(vec![
            "delete".into(),
            "rule".into(),
            format!("name={}", PROCESS_RULE),
            "dir=in".into(),
        ])
        .await
    }

    async fn add_process_rule(&self, program: &Path) -> Result<Duration> {
        self.run(vec![
            "add".into(),
            "rule".into(),
            format!("name={}", PROCESS_RULE),
            "dir=in".into(),
            "action=allow".into(),
            "edge=yes".into(),
            format!("program={}", program.display()),
            "protocol=udp".into(),
            "profile=any".into(),
            "enable=yes".into(),
        ])
        .await
    }

    async fn add_allow_rule(&self, cidr: &str) -> Result<Duration> {
        self.run(vec![
            "add".into(),
            "rule".into(),
            format!("name={}", ALLOW_RULE),
            "dir=in".into(),
            "action=allow".into(),
            format!("localip={}", cidr),
            "profile=private".into(),
            "enable=yes".into(),
        ])
        .await
    }
}

/// Desired and last-known-applied allow-list state. The convergence task
/// holds the lock only to read or write these fields, never across a command
/// or a backoff sleep.
#[derive(Debug, Default)]
struct ReconcilerState {
    /// Most recently requested allow-list; empty means remove all rules.
    want: Vec<String>,
    /// List actually applied, meaningful only when `known`.
    last_applied: Vec<String>,
    /// Whether `last_applied` accurately reflects OS state.
    known: bool,
    /// Whether a convergence task is currently active.
    running: bool,
    /// Whether the executable-allow rule has been installed. Installed at
    /// most once per process lifetime.
    did_process_rule: bool,
}

struct Inner {
    commands: Arc<dyn FirewallCommands>,
    max_backoff: Duration,
    state: Mutex<ReconcilerState>,
}

/// Asynchronous allow-list reconciler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FirewallReconciler {
    inner: Arc<Inner>,
}

impl FirewallReconciler {
    /// Create a reconciler driving `commands` with the default backoff cap.
    pub fn new(commands: Arc<dyn FirewallCommands>) -> Self {
        Self::with_max_backoff(commands, MAX_BACKOFF)
    }

    /// Like [`FirewallReconciler::new`] with an explicit backoff cap so
    /// tests can keep retries near-instant.
    pub fn with_max_backoff(commands: Arc<dyn FirewallCommands>, max_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                commands,
                max_backoff,
                state: Mutex::new(ReconcilerState::default()),
            }),
        }
    }

    /// Schedule removal of every managed allow rule.
    pub fn clear(&self) {
        self.set_desired(Vec::new());
    }

    /// Record the CIDRs that should be allowed inbound; an empty list
    /// removes all rules. Non-blocking: application happens on a background
    /// task and success or failure is observable only through logs and
    /// eventual OS state. If no convergence task is running, exactly one is
    /// started; a running task picks the new value up before it exits, so
    /// the latest request always wins.
    pub fn set_desired(&self, cidrs: Vec<String>) {
        let mut state = self.inner.state.lock();

        if cidrs.is_empty() {
            log::info!("firewall: marking allow rules for removal");
        } else {
            log::info!("firewall: marking allowed {:?}", cidrs);
        }
        state.want = cidrs;
        if state.running {
            // The convergence task re-reads `want` before returning.
            return;
        }
        state.running = true;
        drop(state);

        log::debug!("firewall: starting convergence task");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.converge().await });
    }

    /// Wait until no convergence task is active. An observer only, used by
    /// shutdown paths and tests; the task stops on its own once desired and
    /// applied state match.
    pub async fn settled(&self) {
        loop {
            if !self.inner.state.lock().running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Inner {
    /// Run until the applied rule set matches `want`. Invariant: at most one
    /// of these tasks exists per reconciler; `running` guards entry.
    async fn converge(self: Arc<Self>) {
        let mut backoff = Backoff::new("firewall", self.max_backoff);

        loop {
            let (val, need_clear, need_process_rule) = {
                let mut state = self.state.lock();
                let val = state.want.clone();
                if state.known && state.last_applied == val {
                    state.running = false;
                    log::debug!("firewall: converged, stopping convergence task");
                    return;
                }
                let need_clear =
                    !state.known || !state.last_applied.is_empty() || val.is_empty();
                (val, need_clear, !state.did_process_rule)
            };

            if need_clear {
                // The tool reports an error when no rule matches; absence of
                // the rule is exactly the state being requested, so the
                // result is ignored.
                log::debug!("firewall: clearing {} rules", ALLOW_RULE);
                if let Ok(elapsed) = self.commands.clear_allow_rules().await {
                    log::info!("firewall: cleared {} rules in {:?}", ALLOW_RULE, elapsed);
                }
            }

            if need_process_rule {
                self.install_process_rule().await;
            }

            let mut outcome = Ok(());
            for cidr in &val {
                match self.commands.add_allow_rule(cidr).await {
                    Ok(elapsed) => {
                        log::info!(
                            "firewall: added {} rule allowing {} in {:?}",
                            ALLOW_RULE,
                            cidr,
                            elapsed
                        );
                    }
                    Err(err) => {
                        log::warn!(
                            "firewall: adding {} rule allowing {} failed: {:#}",
                            ALLOW_RULE,
                            cidr,
                            err
                        );
                        outcome = Err(err);
                        break;
                    }
                }
            }

            backoff.wait(outcome.is_ok()).await;

            let mut state = self.state.lock();
            state.last_applied = val;
            state.known = outcome.is_ok();
        }
    }

    /// Install the one-time rule that lets this executable receive tunnel
    /// UDP. Failure does not block allow-list progress; the next round
    /// retries.
    async fn install_process_rule(&self) {
        // A stale copy from a previous process may point at an old
        // executable path; drop it first, best effort.
        if let Ok(elapsed) = self.commands.delete_process_rule().await {
            log::info!(
                "firewall: removed stale {} rule in {:?}",
                PROCESS_RULE,
                elapsed
            );
        }

        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(err) => {
                log::warn!(
                    "firewall: cannot determine executable for {} rule: {}",
                    PROCESS_RULE,
                    err
                );
                return;
            }
        };

        match self.commands.add_process_rule(&exe).await {
            Ok(elapsed) => {
                self.state.lock().did_process_rule = true;
                log::info!(
                    "firewall: added {} rule for {} in {:?}",
                    PROCESS_RULE,
                    exe.display(),
                    elapsed
                );
            }
            Err(err) => {
                log::warn!("firewall: adding {} rule failed: {:#}", PROCESS_RULE, err);
            }
        }
    }
}
