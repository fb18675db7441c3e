//! Remote tool-server client
//!
//! Each remote server advertises a list of tools with JSON-schema parameters
//! and executes calls against the standard result envelope. The executor in
//! the services crate fans out by tool-name prefix.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ToolServerError {
    #[error("Tool server request failed: {0}")]
    RequestFailed(String),
    #[error("Tool server returned status {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("Failed to parse tool server response: {0}")]
    ParseError(String),
}

/// A tool advertised by a remote server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the parameters.
    #[serde(default)]
    pub parameters: Value,
}

/// The standard result envelope every tool call returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub action_taken: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub empty_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ToolCallResult {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            action_taken: false,
            data: None,
            empty_result: false,
            error_code: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            action_taken: true,
            data: None,
            empty_result: false,
            error_code: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

/// Contract required of a remote tool-providing server.
#[async_trait]
pub trait ToolServerClient: Send + Sync {
    /// The namespace prefix tools of this server are addressed with.
    fn name(&self) -> &str;

    /// List the tools the server advertises.
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolServerError>;

    /// Execute a tool by its unprefixed name.
    async fn call_tool(&self, tool: &str, args: &Value) -> Result<ToolCallResult, ToolServerError>;
}

/// HTTP client for a remote tool server.
pub struct HttpToolServer {
    client: reqwest::Client,
    name: String,
    base_url: String,
    token: Option<String>,
}

impl HttpToolServer {
    pub fn new(config: &config::ToolServerConfig) -> Result<Self, ToolServerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ToolServerError::RequestFailed(format!("Failed to build HTTP client: {e}"))
            })?;

        tracing::info!(
            server = %config.name,
            base_url = %config.base_url,
            "Tool server client initialized"
        );

        Ok(Self {
            client,
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            token: config.token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn check_response(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ToolServerError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            Err(ToolServerError::ApiError {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ToolServerClient for HttpToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolServerError> {
        let response = self
            .request(reqwest::Method::GET, "/tools")
            .send()
            .await
            .map_err(|e| ToolServerError::RequestFailed(e.to_string()))?;

        let response = Self::check_response(response).await?;
        response
            .json::<Vec<RemoteToolSpec>>()
            .await
            .map_err(|e| ToolServerError::ParseError(e.to_string()))
    }

    async fn call_tool(&self, tool: &str, args: &Value) -> Result<ToolCallResult, ToolServerError> {
        let response = self
            .request(reqwest::Method::POST, &format!("/tools/{tool}"))
            .json(args)
            .send()
            .await
            .map_err(|e| ToolServerError::RequestFailed(e.to_string()))?;

        let response = Self::check_response(response).await?;
        response
            .json::<ToolCallResult>()
            .await
            .map_err(|e| ToolServerError::ParseError(e.to_string()))
    }
}
