use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::types::SandgateConfig;
use crate::error::{Result, SandgateError};
use crate::forward::{mapping, PortForwarder};
use crate::sandbox::{
    CreateOptions, EndpointCache, ExecOptions, ExecutionResult, LifecycleClient, ProcessExecutor,
    RemoteShell, SandboxHandle,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Entry point for the rest of an application.
///
/// Owns the endpoint cache and the forwarding table, so two clients never
/// share state. File and code operations come from [`RemoteShell`].
pub struct SandboxClient {
    lifecycle: LifecycleClient,
    executor: ProcessExecutor,
    forwarder: PortForwarder,
    sandbox_timeout_seconds: u64,
}

impl SandboxClient {
    pub fn new(config: &SandgateConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SandgateError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_http(http, config))
    }

    pub fn with_http(http: Client, config: &SandgateConfig) -> Self {
        Self::with_forwarder(http, config, PortForwarder::new(config.forwarding.clone()))
    }

    pub fn with_forwarder(http: Client, config: &SandgateConfig, forwarder: PortForwarder) -> Self {
        let cache = Arc::new(EndpointCache::new());
        Self {
            lifecycle: LifecycleClient::new(http.clone(), &config.api, cache),
            executor: ProcessExecutor::new(
                http,
                config.execution.default_cwd.clone(),
                Duration::from_millis(config.execution.default_timeout_ms),
            ),
            forwarder,
            sandbox_timeout_seconds: config.execution.sandbox_timeout_seconds,
        }
    }

    pub fn cache(&self) -> &EndpointCache {
        self.lifecycle.cache()
    }

    pub fn forwarder(&self) -> &PortForwarder {
        &self.forwarder
    }

    pub async fn create_sandbox(
        &self,
        template_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<SandboxHandle> {
        let mut options = CreateOptions::new(template_id, self.sandbox_timeout_seconds);
        options.metadata = metadata;
        self.lifecycle.create(&options).await
    }

    pub async fn get_sandbox(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        self.lifecycle.get(sandbox_id).await
    }

    /// Tear down forwarding, then delete the sandbox.
    ///
    /// The endpoint cache entry is gone when this returns, even on error.
    pub async fn delete_sandbox(&self, sandbox_id: &str) -> Result<()> {
        if self.forwarder.config().enabled {
            let private_ip = match self.lifecycle.resolve_endpoint(sandbox_id).await {
                Ok(endpoint) => mapping::private_ip(&endpoint).ok(),
                Err(e) => {
                    debug!(sandbox_id = %sandbox_id, error = %e, "No endpoint for relay cleanup");
                    None
                }
            };
            self.forwarder.teardown(sandbox_id, private_ip).await;
        }
        self.lifecycle.delete(sandbox_id).await
    }

    pub async fn execute_command(
        &self,
        sandbox_id: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecutionResult> {
        let endpoint = self.lifecycle.resolve_endpoint(sandbox_id).await?;
        self.executor.execute(&endpoint, command, options).await
    }

    /// URL under which `port` inside the sandbox is reachable.
    pub async fn get_sandbox_url(&self, sandbox_id: &str, port: u16) -> Result<String> {
        let endpoint = self.lifecycle.resolve_endpoint(sandbox_id).await?;
        let private_ip = mapping::private_ip(&endpoint)?;

        let config = self.forwarder.config();
        if !config.enabled {
            return Ok(format!("http://{}:{}", private_ip, port));
        }

        let external_port = self.forwarder.ensure(sandbox_id, private_ip, port).await?;
        let url = format!("http://{}:{}", config.external_address, external_port);
        info!(sandbox_id = %sandbox_id, port, url = %url, "Sandbox port exposed");
        Ok(url)
    }
}

#[async_trait]
impl RemoteShell for SandboxClient {
    async fn execute(
        &self,
        sandbox_id: &str,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecutionResult> {
        self.execute_command(sandbox_id, command, &options).await
    }
}
