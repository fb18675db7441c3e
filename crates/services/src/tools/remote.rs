//! Remote tool-server executor
//!
//! Wraps one remote tool-providing server as a [`ToolExecutor`]. Tools are
//! addressed as `{server}.{tool}`; the prefix picks the executor, the bare
//! name goes over the wire.

use super::executor::{ParamSpec, ParamType, ToolCall, ToolContext, ToolExecutor, ToolSpec};
use async_trait::async_trait;
use integrations::{ToolCallResult, ToolServerClient};
use std::sync::Arc;
use tracing::warn;

pub struct RemoteTools {
    client: Arc<dyn ToolServerClient>,
    prefix: String,
}

impl RemoteTools {
    pub fn new(client: Arc<dyn ToolServerClient>) -> Self {
        let prefix = format!("{}.", client.name());
        Self { client, prefix }
    }

    /// Map a JSON-schema parameter object to the validator's spec list.
    fn params_from_schema(schema: &serde_json::Value) -> Vec<ParamSpec> {
        let mut params = Vec::new();
        let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
            return params;
        };
        let required: Vec<&str> = schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();

        for (name, prop) in properties {
            let param_type = match prop.get("type").and_then(|t| t.as_str()) {
                Some("number") | Some("integer") => ParamType::Number,
                Some("boolean") => ParamType::Boolean,
                Some("array") => ParamType::Array,
                Some("object") => ParamType::Object,
                _ => ParamType::String,
            };
            // Remote schemas are dynamic, so the static-str constraints of
            // ParamSpec cannot carry their enums; the server re-validates.
            params.push(ParamSpec {
                name: Box::leak(name.clone().into_boxed_str()),
                param_type,
                required: required.contains(&name.as_str()),
                allowed_values: None,
                pattern: None,
            });
        }
        params
    }
}

#[async_trait]
impl ToolExecutor for RemoteTools {
    fn name(&self) -> &str {
        self.client.name()
    }

    fn can_handle(&self, tool_name: &str) -> bool {
        tool_name.starts_with(&self.prefix)
    }

    async fn specs(&self) -> Vec<ToolSpec> {
        match self.client.list_tools().await {
            Ok(tools) => tools
                .into_iter()
                .map(|tool| ToolSpec {
                    name: format!("{}{}", self.prefix, tool.name),
                    description: tool.description,
                    params: Self::params_from_schema(&tool.parameters),
                    required_permission: None,
                    rate_limit_per_min: None,
                })
                .collect(),
            Err(e) => {
                warn!(server = self.client.name(), error = %e, "Failed to list remote tools");
                Vec::new()
            }
        }
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolCallResult {
        let bare = call.tool.strip_prefix(&self.prefix).unwrap_or(&call.tool);
        match self.client.call_tool(bare, &call.args).await {
            Ok(result) => result,
            Err(e) => {
                warn!(server = self.client.name(), tool = bare, error = %e, "Remote tool failed");
                ToolCallResult::failure(format!("Tool call failed: {e}"))
                    .with_error_code("remote_error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use integrations::MockToolServer;
    use serde_json::json;

    #[tokio::test]
    async fn test_prefix_dispatch_and_strip() {
        let server = MockToolServer::new("media").with_tool("search", "search the library");
        server.set_result("search", ToolCallResult::success("found 3 albums"));
        let server = Arc::new(server);
        let tools = RemoteTools::new(server.clone());

        assert!(tools.can_handle("media.search"));
        assert!(!tools.can_handle("documents.search"));

        let result = tools
            .execute(
                &ToolCall {
                    tool: "media.search".to_string(),
                    args: json!({"query": "jazz"}),
                },
                &ToolContext::default(),
            )
            .await;
        assert!(result.success);
        let calls = server.calls.lock().unwrap();
        assert_eq!(calls[0].0, "search");
    }

    #[tokio::test]
    async fn test_specs_are_prefixed() {
        let server = Arc::new(MockToolServer::new("media").with_tool("search", "search"));
        let tools = RemoteTools::new(server);
        let specs = tools.specs().await;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "media.search");
    }

    #[tokio::test]
    async fn test_server_error_becomes_failure_envelope() {
        let server = Arc::new(MockToolServer::new("media").with_tool("search", "search"));
        let tools = RemoteTools::new(server);
        // No scripted result → the mock raises
        let result = tools
            .execute(
                &ToolCall {
                    tool: "media.search".to_string(),
                    args: json!({}),
                },
                &ToolContext::default(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("remote_error"));
    }
}
