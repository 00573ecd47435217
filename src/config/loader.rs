use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::types::SandgateConfig;
use crate::error::{Result, SandgateError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "sandgate", "sandgate") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".sandgate").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values,
/// then apply environment overrides.
pub fn load_config(config_path: Option<&Path>) -> Result<SandgateConfig> {
    let mut config = load_file(config_path)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &SandgateConfig) -> Result<()> {
    let forwarding = &config.forwarding;
    if forwarding.port_span == 0 {
        return Err(SandgateError::Config(
            "forwarding.port_span must be greater than zero".to_string(),
        ));
    }
    if u32::from(forwarding.base_port) + u32::from(forwarding.port_span) > 65_536 {
        return Err(SandgateError::Config(format!(
            "forwarding port range {}+{} exceeds 65535",
            forwarding.base_port, forwarding.port_span
        )));
    }
    Ok(())
}

fn load_file(config_path: Option<&Path>) -> Result<SandgateConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // An explicitly requested file must exist
        if config_path.is_some() {
            return Err(SandgateError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        return Ok(SandgateConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: SandgateConfig =
        toml::from_str(&content).map_err(|e| SandgateError::TomlParse(e.to_string()))?;

    debug!(path = %path.display(), "Loaded configuration file");
    Ok(config)
}

/// Overlay the environment variables the web front end has always honoured.
fn apply_env_overrides<F>(config: &mut SandgateConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("E2B_API_URL") {
        config.api.url = url;
    }
    if let Some(key) = lookup("E2B_API_KEY") {
        config.api.api_key = Some(key);
    }
    if let Some(ip) = lookup("TAILSCALE_IP") {
        config.forwarding.external_address = ip.parse().map_err(|_| {
            SandgateError::Config(format!("TAILSCALE_IP is not an IPv4 address: {}", ip))
        })?;
    }
    if let Some(flag) = lookup("USE_TAILSCALE_FORWARDING") {
        config.forwarding.enabled = flag != "false";
    }
    Ok(())
}
