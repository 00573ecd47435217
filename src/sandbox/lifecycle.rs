use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::types::ApiConfig;
use crate::error::{Result, SandgateError};
use crate::sandbox::{EndpointCache, SandboxHandle};

const API_KEY_HEADER: &str = "X-API-Key";

/// Parameters for `POST /sandboxes`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateOptions {
    #[serde(rename = "templateID")]
    pub template_id: String,
    /// Sandbox lifetime in seconds
    pub timeout: u64,
    pub metadata: HashMap<String, String>,
}

impl CreateOptions {
    pub fn new(template_id: impl Into<String>, timeout: u64) -> Self {
        Self {
            template_id: template_id.into(),
            timeout,
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "templateID", default)]
    template_id: Option<String>,
    #[serde(rename = "envdURL", default)]
    envd_url: Option<String>,
    #[serde(rename = "startedAt", default)]
    started_at: Option<DateTime<Utc>>,
}

impl SandboxResponse {
    fn into_handle(self, fallback_template: &str) -> SandboxHandle {
        SandboxHandle {
            id: self.sandbox_id,
            template_id: self
                .template_id
                .unwrap_or_else(|| fallback_template.to_string()),
            private_endpoint: self.envd_url,
            created_at: self.started_at.unwrap_or_else(Utc::now),
        }
    }
}

/// REST client for the orchestration service.
///
/// Owns the endpoint cache: every successful create or get that reports
/// an envd URL populates it, and delete always clears it.
pub struct LifecycleClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    cache: Arc<EndpointCache>,
}

impl LifecycleClient {
    pub fn new(http: Client, config: &ApiConfig, cache: Arc<EndpointCache>) -> Self {
        Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<EndpointCache> {
        &self.cache
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    /// Create a sandbox from a template.
    pub async fn create(&self, options: &CreateOptions) -> Result<SandboxHandle> {
        debug!(template = %options.template_id, timeout = options.timeout, "Creating sandbox");

        let response = self
            .authorized(self.http.post(self.url("/sandboxes")))
            .json(options)
            .send()
            .await?;
        let response = check_status(response, None).await?;

        let body: SandboxResponse = response.json().await?;
        let handle = body.into_handle(&options.template_id);

        if let Some(endpoint) = &handle.private_endpoint {
            self.cache.insert(&handle.id, endpoint);
        }

        info!(
            sandbox_id = %handle.id,
            endpoint = handle.private_endpoint.as_deref().unwrap_or("-"),
            "Created sandbox"
        );
        Ok(handle)
    }

    /// Fetch current sandbox state, refreshing the endpoint cache.
    pub async fn get(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let response = self
            .authorized(self.http.get(self.url(&format!("/sandboxes/{}", sandbox_id))))
            .send()
            .await?;
        let response = check_status(response, Some(sandbox_id)).await?;

        let body: SandboxResponse = response.json().await?;
        let handle = body.into_handle("");

        if let Some(endpoint) = &handle.private_endpoint {
            self.cache.insert(sandbox_id, endpoint);
        }
        Ok(handle)
    }

    /// Issue the remote delete. The cache entry is dropped whatever the outcome.
    pub async fn delete(&self, sandbox_id: &str) -> Result<()> {
        let outcome = self.delete_remote(sandbox_id).await;
        self.cache.remove(sandbox_id);

        match &outcome {
            Ok(()) => info!(sandbox_id = %sandbox_id, "Deleted sandbox"),
            Err(e) => warn!(sandbox_id = %sandbox_id, error = %e, "Remote delete failed"),
        }
        outcome
    }

    async fn delete_remote(&self, sandbox_id: &str) -> Result<()> {
        let response = self
            .authorized(
                self.http
                    .delete(self.url(&format!("/sandboxes/{}", sandbox_id))),
            )
            .send()
            .await?;
        check_status(response, Some(sandbox_id)).await?;
        Ok(())
    }

    /// Private endpoint for a sandbox, from the cache or a fresh lookup.
    pub async fn resolve_endpoint(&self, sandbox_id: &str) -> Result<String> {
        if let Some(endpoint) = self.cache.get(sandbox_id) {
            return Ok(endpoint);
        }

        debug!(sandbox_id = %sandbox_id, "Endpoint not cached, fetching sandbox");
        // A 404 already maps to UnknownSandbox; auth and service errors pass through
        let handle = self.get(sandbox_id).await?;

        handle
            .private_endpoint
            .ok_or_else(|| SandgateError::UnknownSandbox {
                id: sandbox_id.to_string(),
            })
    }
}

async fn check_status(response: Response, sandbox_id: Option<&str>) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(SandgateError::from_status(
        sandbox_id,
        status.as_u16(),
        message,
    ))
}
