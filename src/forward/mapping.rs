//! Deterministic address and port derivation for sandbox relays.
//!
//! The namespace and peer address scheme mirrors how the orchestrator
//! places sandboxes: the third and fourth octets of the private IP form a
//! slot index, the slot selects the `ns-<slot>` network namespace, and the
//! namespace's veth peer sits at `vpeer_base + slot * 2 + 1`.

use std::fmt;
use std::net::Ipv4Addr;

use reqwest::Url;

use crate::config::types::ForwardingConfig;
use crate::error::{Result, SandgateError};

/// Stable external port for a sandbox.
///
/// Sums the UTF-16 code units of the ID and folds the sum into
/// `[base, base + span)`. Distinct IDs may collide.
pub fn external_port(sandbox_id: &str, base: u16, span: u16) -> u16 {
    let sum: u64 = sandbox_id.encode_utf16().map(u64::from).sum();
    let offset = sum % u64::from(span.max(1));
    base.saturating_add(offset as u16)
}

/// Bare IPv4 address of an agent endpoint such as `http://10.11.0.100:49983`.
pub fn private_ip(endpoint: &str) -> Result<Ipv4Addr> {
    let invalid = || SandgateError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
    };
    let url = Url::parse(endpoint).map_err(|_| invalid())?;
    url.host_str()
        .and_then(|host| host.parse::<Ipv4Addr>().ok())
        .ok_or_else(invalid)
}

/// Where a sandbox's relays live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTopology {
    pub slot: u16,
    pub namespace: String,
    pub vpeer: Ipv4Addr,
}

impl RelayTopology {
    pub fn derive(private_ip: Ipv4Addr, config: &ForwardingConfig) -> Self {
        let [_, _, third, fourth] = private_ip.octets();
        let slot = u16::from(third) * 256 + u16::from(fourth);
        let offset = u32::from(slot) * 2 + 1;
        Self {
            slot,
            namespace: format!("{}{}", config.namespace_prefix, slot),
            vpeer: Ipv4Addr::from(u32::from(config.vpeer_base).wrapping_add(offset)),
        }
    }
}

/// A program invocation, kept structured so it can be spawned without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RelayCommand {
    fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Prefix with `sudo -n` when configured.
    fn elevated(self, use_sudo: bool) -> Self {
        if !use_sudo {
            return self;
        }
        let mut args = vec!["-n".to_string(), self.program];
        args.extend(self.args);
        Self {
            program: "sudo".to_string(),
            args,
        }
    }
}

impl fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// The two relays for one sandbox port: namespace side first, then host side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPlan {
    pub inner: RelayCommand,
    pub outer: RelayCommand,
}

pub type PlanFn = fn(&ForwardingConfig, &RelayTopology, u16, u16) -> RelayPlan;

/// `vpeer:port -> guest:port` inside the namespace, and
/// `external:external_port -> vpeer:port` on the host.
pub fn relay_plan(
    config: &ForwardingConfig,
    topology: &RelayTopology,
    port: u16,
    external_port: u16,
) -> RelayPlan {
    let inner = RelayCommand::new("ip")
        .arg("netns")
        .arg("exec")
        .arg(&topology.namespace)
        .arg(&config.relay_program)
        .arg(format!(
            "TCP4-LISTEN:{},bind={},reuseaddr,fork",
            port, topology.vpeer
        ))
        .arg(format!("TCP4:{}:{}", config.guest_address, port))
        .elevated(config.use_sudo);

    let outer = RelayCommand::new(&config.relay_program)
        .arg(format!(
            "TCP4-LISTEN:{},bind={},reuseaddr,fork",
            external_port, config.external_address
        ))
        .arg(format!("TCP4:{}:{}", topology.vpeer, port));

    RelayPlan { inner, outer }
}

/// `pkill -f` regex matching every relay that talks to `vpeer`.
pub fn sweep_pattern(relay_program: &str, vpeer: Ipv4Addr) -> String {
    format!(
        "{}.*{}([^0-9]|$)",
        relay_program,
        vpeer.to_string().replace('.', "\\.")
    )
}

pub fn sweep_command(config: &ForwardingConfig, vpeer: Ipv4Addr) -> RelayCommand {
    RelayCommand::new("pkill")
        .arg("-f")
        .arg(sweep_pattern(&config.relay_program, vpeer))
        .elevated(config.use_sudo)
}
