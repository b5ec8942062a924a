use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use vaultsync_core::rpc::{Method, RpcClient};
use vaultsync_core::SessionError;

use crate::config::ServiceConfig;

#[derive(Clone)]
pub struct HttpRpcClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRpcClient {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("vaultsync-service/0.1")
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url()?.to_string(),
            token: config.api_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        authenticated: bool,
        return_response: bool,
    ) -> vaultsync_core::Result<Option<Value>> {
        let verb = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut request = self.client.request(verb, self.url(path));
        if authenticated {
            let token = self
                .token
                .as_deref()
                .ok_or_else(|| SessionError::Transport("no API token configured".to_string()))?;
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let res = request
            .send()
            .await
            .map_err(|e| SessionError::Transport(format!("{method} {path}: {e}")))?;
        let status = res.status();
        debug!(%method, path, %status, "api call");
        if !status.is_success() {
            return Err(SessionError::Transport(format!("{method} {path} failed: {status}")));
        }
        if !return_response {
            return Ok(None);
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| SessionError::Transport(format!("{method} {path}: {e}")))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}
