//! Exposes sandbox ports on a fixed external address.
//!
//! Each forwarded sandbox gets two relays: one inside its network namespace
//! (`vpeer:port -> guest:port`) and one on the host
//! (`external:external_port -> vpeer:port`). At most one pair exists per
//! sandbox; concurrent requests for the same sandbox are serialized.

pub mod mapping;
mod relay;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::types::ForwardingConfig;
use crate::error::{Result, SandgateError};
use mapping::{PlanFn, RelayTopology};
use relay::RelayProcess;

const RELAY_STOP_GRACE: Duration = Duration::from_secs(2);
const SWEEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Live forwarding for one sandbox.
#[derive(Debug)]
pub struct PortForwardEntry {
    pub sandbox_id: String,
    pub external_port: u16,
    pub internal_port: u16,
    pub private_ip: Ipv4Addr,
    relays: Vec<RelayProcess>,
}

impl PortForwardEntry {
    fn is_alive(&mut self) -> bool {
        !self.relays.is_empty() && self.relays.iter_mut().all(RelayProcess::is_alive)
    }

    pub fn relay_pids(&self) -> Vec<u32> {
        self.relays.iter().filter_map(RelayProcess::pid).collect()
    }
}

#[derive(Debug, Default)]
struct SlotState {
    entry: Option<PortForwardEntry>,
    /// Set by teardown; waiters that queued behind it must not rebuild.
    retired: bool,
}

type Slot = Arc<AsyncMutex<SlotState>>;

pub struct PortForwarder {
    config: ForwardingConfig,
    plan: PlanFn,
    slots: Mutex<HashMap<String, Slot>>,
}

impl PortForwarder {
    pub fn new(config: ForwardingConfig) -> Self {
        Self::with_plan(config, mapping::relay_plan)
    }

    /// Use a different relay command builder.
    pub fn with_plan(config: ForwardingConfig, plan: PlanFn) -> Self {
        Self {
            config,
            plan,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ForwardingConfig {
        &self.config
    }

    pub fn external_port(&self, sandbox_id: &str) -> u16 {
        mapping::external_port(sandbox_id, self.config.base_port, self.config.port_span)
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, sandbox_id: &str) -> Slot {
        Arc::clone(self.slots().entry(sandbox_id.to_string()).or_default())
    }

    /// Make `port` on the sandbox reachable, returning the external port.
    ///
    /// A live entry for the same target is reused. A dead one, or one for a
    /// different port or address, is torn down and replaced. On failure no
    /// relay from the attempt is left running. A request that was waiting
    /// on a teardown of the same sandbox fails with `UnknownSandbox`.
    pub async fn ensure(&self, sandbox_id: &str, private_ip: Ipv4Addr, port: u16) -> Result<u16> {
        let slot = self.slot(sandbox_id);
        let mut state = slot.lock().await;
        if state.retired {
            debug!(sandbox_id = %sandbox_id, "Forwarding was torn down while waiting");
            return Err(SandgateError::UnknownSandbox {
                id: sandbox_id.to_string(),
            });
        }

        if let Some(entry) = state.entry.as_mut() {
            if entry.internal_port == port && entry.private_ip == private_ip && entry.is_alive() {
                debug!(sandbox_id = %sandbox_id, external_port = entry.external_port, "Reusing relay");
                return Ok(entry.external_port);
            }
        }
        if let Some(stale) = state.entry.take() {
            info!(
                sandbox_id = %sandbox_id,
                old_port = stale.internal_port,
                new_port = port,
                "Replacing relay"
            );
            self.stop(stale.relays, Some(stale.private_ip)).await;
        }

        let external_port = self.external_port(sandbox_id);
        self.warn_on_collision(sandbox_id, external_port);

        let topology = RelayTopology::derive(private_ip, &self.config);
        info!(
            sandbox_id = %sandbox_id,
            namespace = %topology.namespace,
            vpeer = %topology.vpeer,
            external = %format!("{}:{}", self.config.external_address, external_port),
            port,
            "Setting up dual-layer relay"
        );

        let mut started = Vec::new();
        let limit = Duration::from_millis(self.config.setup_timeout_ms);
        let outcome = timeout(
            limit,
            self.establish(&topology, port, external_port, &mut started),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                state.entry = Some(PortForwardEntry {
                    sandbox_id: sandbox_id.to_string(),
                    external_port,
                    internal_port: port,
                    private_ip,
                    relays: started,
                });
                info!(sandbox_id = %sandbox_id, external_port, "Relay established");
                Ok(external_port)
            }
            Ok(Err(e)) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "Relay setup failed");
                self.stop(started, Some(private_ip)).await;
                Err(e)
            }
            Err(_) => {
                warn!(sandbox_id = %sandbox_id, timeout_ms = self.config.setup_timeout_ms, "Relay setup timed out");
                self.stop(started, Some(private_ip)).await;
                Err(SandgateError::RelayTimeout {
                    sandbox_id: sandbox_id.to_string(),
                    timeout_ms: self.config.setup_timeout_ms,
                })
            }
        }
    }

    async fn establish(
        &self,
        topology: &RelayTopology,
        port: u16,
        external_port: u16,
        started: &mut Vec<RelayProcess>,
    ) -> Result<()> {
        let settle = Duration::from_millis(self.config.settle_delay_ms);
        let plan = (self.plan)(&self.config, topology, port, external_port);

        // Leftovers from an earlier process would hold the listen addresses
        self.sweep(topology.vpeer).await;
        sleep(settle).await;

        started.push(RelayProcess::spawn("namespace", &plan.inner)?);
        sleep(settle).await;
        if let Some(inner) = started.last_mut() {
            inner.ensure_running()?;
        }

        started.push(RelayProcess::spawn("host", &plan.outer)?);
        sleep(settle).await;
        if let Some(outer) = started.last_mut() {
            outer.ensure_running()?;
        }
        Ok(())
    }

    /// Remove forwarding for a sandbox. Safe to call when none exists.
    ///
    /// When the relays are not tracked (another process started them),
    /// `private_ip` is used to find them by command line.
    pub async fn teardown(&self, sandbox_id: &str, private_ip: Option<Ipv4Addr>) {
        let slot = self.slots().get(sandbox_id).cloned();

        let Some(slot) = slot else {
            if let Some(ip) = private_ip {
                self.stop(Vec::new(), Some(ip)).await;
            }
            return;
        };

        let mut state = slot.lock().await;
        state.retired = true;
        match state.entry.take() {
            Some(entry) => {
                self.stop(entry.relays, Some(entry.private_ip)).await;
                info!(sandbox_id = %sandbox_id, external_port = entry.external_port, "Relay torn down");
            }
            None => {
                if let Some(ip) = private_ip {
                    self.stop(Vec::new(), Some(ip)).await;
                }
            }
        }
        drop(state);

        let mut slots = self.slots();
        if slots.get(sandbox_id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            slots.remove(sandbox_id);
        }
    }

    /// Number of sandboxes with an established relay.
    pub fn active(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot.try_lock(), Ok(state) if state.entry.is_some()))
            .count()
    }

    async fn stop(&self, mut relays: Vec<RelayProcess>, private_ip: Option<Ipv4Addr>) {
        for relay in relays.iter_mut() {
            relay.terminate();
        }
        if let Some(ip) = private_ip {
            let topology = RelayTopology::derive(ip, &self.config);
            self.sweep(topology.vpeer).await;
        }
        for relay in relays {
            relay.reap(RELAY_STOP_GRACE).await;
        }
    }

    /// Kill any relay whose command line targets `vpeer`.
    async fn sweep(&self, vpeer: Ipv4Addr) {
        let command = mapping::sweep_command(&self.config, vpeer);
        match relay::run_helper(&command, SWEEP_TIMEOUT).await {
            Ok(Some(0)) => debug!(vpeer = %vpeer, "Swept stale relays"),
            // pkill: 1 means nothing matched
            Ok(Some(1)) => {}
            Ok(code) => warn!(vpeer = %vpeer, code = ?code, command = %command, "Relay sweep failed"),
            Err(e) => warn!(vpeer = %vpeer, error = %e, "Relay sweep failed"),
        }
    }

    fn warn_on_collision(&self, sandbox_id: &str, external_port: u16) {
        let slots = self.slots();
        for (other_id, slot) in slots.iter() {
            if other_id == sandbox_id {
                continue;
            }
            if let Ok(state) = slot.try_lock() {
                if matches!(state.entry.as_ref(), Some(e) if e.external_port == external_port) {
                    warn!(
                        sandbox_id = %sandbox_id,
                        other = %other_id,
                        external_port,
                        "External port already used by another sandbox"
                    );
                }
            }
        }
    }
}
