//! Tool executor framework
//!
//! Trait-based dispatch over tool sources with one uniform call surface.
//! The registry validates parameters against the tool's declared schema,
//! enforces per-tool rate limits and the caller's permissions, and scrubs
//! credentials from every result message before it can reach a log line,
//! the LLM or a client frame.

use crate::common::redact_credentials;
use crate::rooms::RoomContext;
use async_trait::async_trait;
use integrations::ToolCallResult;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// One tool invocation as produced by the agent loop or the intent path.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub args: Value,
}

/// Read-only execution context.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub room: RoomContext,
    pub user_id: Option<String>,
    /// When present, tools with a `required_permission` outside this list
    /// are denied.
    pub permissions: Option<Vec<String>>,
}

/// Parameter value types accepted by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// Declared parameter of a tool.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    /// Enum constraint.
    pub allowed_values: Option<Vec<&'static str>>,
    /// Regex constraint for string parameters.
    pub pattern: Option<&'static str>,
}

impl ParamSpec {
    pub fn required_string(name: &'static str) -> Self {
        Self {
            name,
            param_type: ParamType::String,
            required: true,
            allowed_values: None,
            pattern: None,
        }
    }

    pub fn optional(name: &'static str, param_type: ParamType) -> Self {
        Self {
            name,
            param_type,
            required: false,
            allowed_values: None,
            pattern: None,
        }
    }
}

/// Description of a tool as exposed to the agent.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub required_permission: Option<&'static str>,
    pub rate_limit_per_min: Option<u32>,
}

impl ToolSpec {
    /// Render the parameter schema for the agent prompt.
    pub fn schema_line(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let mut part = format!("{}", p.name);
                if let Some(values) = &p.allowed_values {
                    part.push_str(&format!(" ({})", values.join("|")));
                }
                if !p.required {
                    part.push('?');
                }
                part
            })
            .collect();
        format!("- {}({}): {}", self.name, params.join(", "), self.description)
    }
}

/// A tool source: the in-process internal tools or one remote server.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Source name, used for logging and whitelist filtering.
    fn name(&self) -> &str;

    /// Whether this source owns the given (namespaced) tool name.
    fn can_handle(&self, tool_name: &str) -> bool;

    /// The tools this source advertises.
    async fn specs(&self) -> Vec<ToolSpec>;

    /// Execute a tool. Failures are folded into the result envelope so the
    /// agent loop always gets something it can show the LLM.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult;
}

/// Validate call arguments against the declared parameter schema.
pub fn validate_params(spec: &ToolSpec, args: &Value) -> Result<(), String> {
    let obj = match args {
        Value::Object(map) => map,
        Value::Null => {
            if spec.params.iter().any(|p| p.required) {
                return Err("Arguments object is required".to_string());
            }
            return Ok(());
        }
        _ => return Err("Arguments must be a JSON object".to_string()),
    };

    for param in &spec.params {
        let value = obj.get(param.name);
        let Some(value) = value else {
            if param.required {
                return Err(format!("Parameter '{}' is required", param.name));
            }
            continue;
        };
        if value.is_null() {
            if param.required {
                return Err(format!("Parameter '{}' is required", param.name));
            }
            continue;
        }

        let type_ok = match param.param_type {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean() || value.is_string(),
            ParamType::Array => value.is_array() || value.is_string(),
            ParamType::Object => value.is_object(),
        };
        if !type_ok {
            return Err(format!(
                "Parameter '{}' has the wrong type (expected {:?})",
                param.name, param.param_type
            ));
        }

        if let (Some(allowed), Some(s)) = (&param.allowed_values, value.as_str()) {
            if !allowed.contains(&s) {
                return Err(format!(
                    "Parameter '{}' must be one of: {}",
                    param.name,
                    allowed.join(", ")
                ));
            }
        }

        if let (Some(pattern), Some(s)) = (param.pattern, value.as_str()) {
            match regex::Regex::new(pattern) {
                Ok(re) => {
                    if !re.is_match(s) {
                        return Err(format!("Parameter '{}' has an invalid format", param.name));
                    }
                }
                Err(_) => {
                    tracing::warn!(pattern, "Invalid parameter pattern in tool spec");
                }
            }
        }
    }
    Ok(())
}

struct RateWindow {
    count: u32,
    window_start: Instant,
}

/// Registry over all tool sources with the shared call pipeline.
pub struct ToolRegistry {
    executors: Vec<std::sync::Arc<dyn ToolExecutor>>,
    rate_windows: Mutex<HashMap<String, RateWindow>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            executors: Vec::new(),
            rate_windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, executor: std::sync::Arc<dyn ToolExecutor>) {
        self.executors.push(executor);
    }

    /// Tool specs filtered by a role's whitelists: `internal_filter` names
    /// internal tools (unprefixed), `server_filter` names remote sources.
    /// `["*"]` means everything from that source class.
    pub async fn specs_filtered(
        &self,
        server_filter: &[String],
        internal_filter: &[String],
    ) -> Vec<ToolSpec> {
        let mut specs = Vec::new();
        for executor in &self.executors {
            let is_internal = executor.name() == "internal";
            for spec in executor.specs().await {
                let include = if is_internal {
                    let bare = spec.name.strip_prefix("internal.").unwrap_or(&spec.name);
                    internal_filter.iter().any(|f| f == "*" || f == bare)
                } else {
                    server_filter
                        .iter()
                        .any(|f| f == "*" || f == executor.name())
                };
                if include {
                    specs.push(spec);
                }
            }
        }
        specs
    }

    /// Execute one call through validation, permission and rate checks.
    /// Always returns the envelope; the `message` is credential-scrubbed.
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolCallResult {
        if call.tool.trim().is_empty() {
            return ToolCallResult::failure("Tool name is empty")
                .with_error_code("unknown_tool");
        }

        let Some(executor) = self.executors.iter().find(|e| e.can_handle(&call.tool)) else {
            return ToolCallResult::failure(format!("Unknown tool: {}", call.tool))
                .with_error_code("unknown_tool");
        };

        let spec = executor
            .specs()
            .await
            .into_iter()
            .find(|s| s.name == call.tool);

        if let Some(spec) = &spec {
            if let Err(message) = validate_params(spec, &call.args) {
                return ToolCallResult::failure(message).with_error_code("invalid_params");
            }

            if let Some(required) = spec.required_permission {
                if let Some(permissions) = &ctx.permissions {
                    if !permissions.iter().any(|p| p == required || p == "*") {
                        return ToolCallResult::failure(format!(
                            "Permission '{required}' required for {}",
                            call.tool
                        ))
                        .with_error_code("permission_denied");
                    }
                }
            }

            if let Some(limit) = spec.rate_limit_per_min {
                if !self.within_rate_limit(&call.tool, limit) {
                    return ToolCallResult::failure(format!(
                        "Rate limit exceeded for {}",
                        call.tool
                    ))
                    .with_error_code("rate_limited");
                }
            }
        }

        tracing::debug!(tool = %call.tool, source = executor.name(), "Executing tool");
        let mut result = executor.execute(call, ctx).await;
        result.message = redact_credentials(&result.message);
        result
    }

    fn within_rate_limit(&self, tool: &str, limit: u32) -> bool {
        let mut windows = self.rate_windows.lock().unwrap();
        let window = windows.entry(tool.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: Instant::now(),
        });
        if window.window_start.elapsed().as_secs() >= 60 {
            window.count = 0;
            window.window_start = Instant::now();
        }
        window.count += 1;
        window.count <= limit
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StaticExecutor {
        name: &'static str,
        specs: Vec<ToolSpec>,
    }

    #[async_trait]
    impl ToolExecutor for StaticExecutor {
        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, tool_name: &str) -> bool {
            self.specs.iter().any(|s| s.name == tool_name)
        }

        async fn specs(&self) -> Vec<ToolSpec> {
            self.specs.clone()
        }

        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolCallResult {
            ToolCallResult::success(format!("ran {} with password=supersecret", call.tool))
        }
    }

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: "test tool".to_string(),
            params: vec![
                ParamSpec::required_string("room_name"),
                ParamSpec {
                    name: "action",
                    param_type: ParamType::String,
                    required: false,
                    allowed_values: Some(vec!["stop", "pause"]),
                    pattern: None,
                },
            ],
            required_permission: None,
            rate_limit_per_min: None,
        }
    }

    fn registry_with(specs: Vec<ToolSpec>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticExecutor {
            name: "internal",
            specs,
        }));
        registry
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_with_code() {
        let registry = registry_with(vec![]);
        let result = registry
            .execute(
                &ToolCall {
                    tool: "nope.nothing".to_string(),
                    args: Value::Null,
                },
                &ToolContext::default(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn test_missing_required_param_rejected() {
        let registry = registry_with(vec![spec("internal.play_in_room")]);
        let result = registry
            .execute(
                &ToolCall {
                    tool: "internal.play_in_room".to_string(),
                    args: serde_json::json!({}),
                },
                &ToolContext::default(),
            )
            .await;
        assert_eq!(result.error_code.as_deref(), Some("invalid_params"));
        assert!(result.message.contains("room_name"));
    }

    #[tokio::test]
    async fn test_enum_constraint_enforced() {
        let registry = registry_with(vec![spec("internal.media_control")]);
        let result = registry
            .execute(
                &ToolCall {
                    tool: "internal.media_control".to_string(),
                    args: serde_json::json!({"room_name": "Kitchen", "action": "explode"}),
                },
                &ToolContext::default(),
            )
            .await;
        assert_eq!(result.error_code.as_deref(), Some("invalid_params"));
    }

    #[tokio::test]
    async fn test_result_message_is_redacted() {
        let registry = registry_with(vec![spec("internal.play_in_room")]);
        let result = registry
            .execute(
                &ToolCall {
                    tool: "internal.play_in_room".to_string(),
                    args: serde_json::json!({"room_name": "Kitchen"}),
                },
                &ToolContext::default(),
            )
            .await;
        assert!(result.success);
        assert!(!result.message.contains("supersecret"));
    }

    #[tokio::test]
    async fn test_permission_check() {
        let mut tool_spec = spec("internal.play_in_room");
        tool_spec.required_permission = Some("media.play");
        let registry = registry_with(vec![tool_spec]);

        let call = ToolCall {
            tool: "internal.play_in_room".to_string(),
            args: serde_json::json!({"room_name": "Kitchen"}),
        };

        // Restricted user without the permission
        let ctx = ToolContext {
            permissions: Some(vec!["lights.toggle".to_string()]),
            ..Default::default()
        };
        let result = registry.execute(&call, &ctx).await;
        assert_eq!(result.error_code.as_deref(), Some("permission_denied"));

        // Unrestricted context (no permission list) is allowed
        let result = registry.execute(&call, &ToolContext::default()).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_rate_limit() {
        let mut tool_spec = spec("internal.play_in_room");
        tool_spec.rate_limit_per_min = Some(2);
        let registry = registry_with(vec![tool_spec]);

        let call = ToolCall {
            tool: "internal.play_in_room".to_string(),
            args: serde_json::json!({"room_name": "Kitchen"}),
        };
        assert!(registry.execute(&call, &ToolContext::default()).await.success);
        assert!(registry.execute(&call, &ToolContext::default()).await.success);
        let third = registry.execute(&call, &ToolContext::default()).await;
        assert_eq!(third.error_code.as_deref(), Some("rate_limited"));
    }

    #[tokio::test]
    async fn test_specs_filtered_by_whitelists() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StaticExecutor {
            name: "internal",
            specs: vec![spec("internal.play_in_room"), spec("internal.knowledge_search")],
        }));
        registry.register(Arc::new(StaticExecutor {
            name: "media",
            specs: vec![spec("media.search")],
        }));
        registry.register(Arc::new(StaticExecutor {
            name: "documents",
            specs: vec![spec("documents.find")],
        }));

        let specs = registry
            .specs_filtered(
                &["media".to_string()],
                &["play_in_room".to_string()],
            )
            .await;
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["internal.play_in_room", "media.search"]);

        let all = registry
            .specs_filtered(&["*".to_string()], &["*".to_string()])
            .await;
        assert_eq!(all.len(), 4);
    }
}
