use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandgateConfig {
    pub api: ApiConfig,
    pub execution: ExecutionConfig,
    pub forwarding: ForwardingConfig,
}

/// Orchestration API connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the orchestration REST API
    pub url: String,
    /// API key sent as `X-API-Key` (usually supplied through `E2B_API_KEY`)
    pub api_key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Wall-clock limit for a single command
    pub default_timeout_ms: u64,
    /// Working directory used when a caller does not pass one
    pub default_cwd: String,
    /// Lifetime requested for new sandboxes
    pub sandbox_timeout_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 300_000,
            default_cwd: "/root".to_string(),
            sandbox_timeout_seconds: 300,
        }
    }
}

/// Settings for exposing sandbox ports on an externally reachable address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// When false, public URLs point straight at the sandbox's private IP
    pub enabled: bool,
    /// Host address the outer relay listens on
    pub external_address: Ipv4Addr,
    /// First external port of the deterministic range
    pub base_port: u16,
    /// Width of the external port range
    pub port_span: u16,
    /// Prefix of the network namespace name (`ns-<slot>`)
    pub namespace_prefix: String,
    /// Base of the veth peer addresses handed out per slot
    pub vpeer_base: Ipv4Addr,
    /// Fixed address of the sandbox VM inside its namespace
    pub guest_address: Ipv4Addr,
    /// Relay binary (socat-compatible argument syntax)
    pub relay_program: String,
    /// Prefix namespace commands with `sudo -n`
    pub use_sudo: bool,
    /// Delay between relay layers
    pub settle_delay_ms: u64,
    /// Upper bound for a complete relay setup
    pub setup_timeout_ms: u64,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            external_address: Ipv4Addr::new(100, 64, 0, 23),
            base_port: 30_000,
            port_span: 10_000,
            namespace_prefix: "ns-".to_string(),
            vpeer_base: Ipv4Addr::new(10, 12, 0, 0),
            guest_address: Ipv4Addr::new(169, 254, 0, 21),
            relay_program: "socat".to_string(),
            use_sudo: true,
            settle_delay_ms: 500,
            setup_timeout_ms: 10_000,
        }
    }
}
