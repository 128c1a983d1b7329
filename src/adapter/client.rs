use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::warn;

use super::error::AdapterError;
use super::types::{ToolOutput, ToolRequest, into_output};
use super::ToolAdapter;
use crate::catalog::{ToolCatalog, ToolDescriptor};

/// JSON-over-HTTP adapter: POSTs the [`ToolRequest`] to the tool's endpoint.
pub struct HttpToolAdapter {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpToolAdapter {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key,
            client,
        })
    }

    /// Builds an adapter from the descriptor's endpoint, reading the API key
    /// from the environment variable it names.
    pub fn from_descriptor(tool: &ToolDescriptor) -> Result<Self, AdapterError> {
        let endpoint = tool
            .endpoint
            .as_deref()
            .ok_or_else(|| AdapterError::Other(format!("tool '{}' has no endpoint", tool.name)))?;
        let api_key = tool
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        Self::new(endpoint, api_key, tool.timeout_duration())
    }

    /// One adapter per catalog tool that has an endpoint and, if it names
    /// one, a key in the environment. Tools left out are logged.
    pub fn for_catalog(catalog: &ToolCatalog) -> HashMap<String, Arc<dyn ToolAdapter>> {
        let mut adapters: HashMap<String, Arc<dyn ToolAdapter>> = HashMap::new();
        for tool in catalog.iter() {
            if let Some(var) = tool.api_key_env.as_deref() {
                if std::env::var(var).map(|k| k.is_empty()).unwrap_or(true) {
                    warn!(tool = %tool.name, env = var, "no API key found, tool disabled");
                    continue;
                }
            }
            match Self::from_descriptor(tool) {
                Ok(adapter) => {
                    adapters.insert(tool.name.clone(), Arc::new(adapter));
                }
                Err(e) => warn!(tool = %tool.name, error = %e, "tool disabled"),
            }
        }
        adapters
    }
}

#[async_trait]
impl ToolAdapter for HttpToolAdapter {
    async fn call(&self, request: &ToolRequest) -> Result<ToolOutput, AdapterError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(1000);
            return Err(AdapterError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AdapterError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;
        Ok(into_output(body))
    }
}
