//! Agent loop
//!
//! A bounded tool-use REPL: each iteration asks the LLM to either emit one
//! tool call as JSON or a final plain-text answer. Tool results are fed back
//! into the loop history, every step is surfaced to the device as a frame,
//! and the loop observes cancellation plus per-tool and wall-clock bounds.

use super::roles::Role;
use crate::rooms::RoomContext;
use crate::tools::{ToolCall, ToolContext, ToolRegistry};
use integrations::{ChatMessage, ChatOptions, LlmClient, ToolCallResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Canned reply when the loop exhausts its step budget.
pub const EXHAUSTED_APOLOGY: &str =
    "Sorry, I couldn't finish that request. Could you rephrase or break it into smaller steps?";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("LLM call failed: {0}")]
    Llm(String),
}

/// One observable step of the loop, forwarded to the device as a frame.
#[derive(Debug, Clone)]
pub enum AgentStep {
    ToolCall {
        tool: String,
        args: Value,
    },
    ToolResult {
        tool: String,
        success: bool,
        message: String,
        data: Option<Value>,
    },
    FinalChunk(String),
}

/// Loop result for the caller.
#[derive(Debug, Default)]
pub struct AgentOutcome {
    pub final_answer: String,
    /// tool_call + tool_result steps taken.
    pub steps: u32,
    /// Successful tool results, for history enrichment.
    pub tool_results: Vec<(String, Value)>,
    pub cancelled: bool,
}

#[derive(Deserialize)]
struct ParsedToolCall {
    tool: String,
    #[serde(default)]
    args: Value,
}

/// Extract a tool call from an LLM reply. Accepts a bare JSON object or one
/// wrapped in a code fence; anything else is a final answer.
pub fn parse_tool_call(reply: &str) -> Option<ToolCall> {
    let trimmed = reply.trim();
    let candidate = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.trim().strip_suffix("```").unwrap_or(rest).trim()
    } else {
        trimmed
    };
    if !candidate.starts_with('{') {
        return None;
    }
    let parsed: ParsedToolCall = serde_json::from_str(candidate).ok()?;
    if parsed.tool.trim().is_empty() {
        return None;
    }
    Some(ToolCall {
        tool: parsed.tool,
        args: if parsed.args.is_null() {
            json!({})
        } else {
            parsed.args
        },
    })
}

pub struct AgentService {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    max_steps: u32,
    tool_timeout: Duration,
    wall_clock: Duration,
}

pub struct AgentRequest<'a> {
    pub utterance: &'a str,
    pub role: &'a Role,
    pub history: &'a [ChatMessage],
    pub room: &'a RoomContext,
    pub memory_context: Option<&'a str>,
    pub document_context: Option<&'a str>,
    pub tool_ctx: &'a ToolContext,
}

impl AgentService {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        config: &config::AgentConfig,
    ) -> Self {
        Self {
            llm,
            tools,
            max_steps: config.max_steps,
            tool_timeout: Duration::from_secs(config.tool_timeout_secs),
            wall_clock: Duration::from_secs(config.wall_clock_secs),
        }
    }

    async fn build_system_prompt(&self, request: &AgentRequest<'_>) -> String {
        let specs = self
            .tools
            .specs_filtered(&request.role.mcp_servers, &request.role.internal_tools)
            .await;
        let tool_lines: Vec<String> = specs.iter().map(|s| s.schema_line()).collect();

        let mut prompt = String::from(request.role.system_prompt);
        prompt.push_str("\n\nAvailable tools:\n");
        prompt.push_str(&tool_lines.join("\n"));
        prompt.push_str(
            "\n\nTo use a tool, respond with ONLY a JSON object: \
             {\"tool\": \"<name>\", \"args\": {...}}. \
             When you have everything you need, respond with the final answer as plain text \
             (no JSON). One tool call per response.",
        );

        if let Some(room) = &request.room.room_name {
            prompt.push_str(&format!("\n\nThe user is in the room: {room}."));
        }
        if let Some(speaker) = &request.room.speaker_name {
            prompt.push_str(&format!(" The speaker was identified as {speaker}."));
        }
        if let Some(memory) = request.memory_context {
            prompt.push_str(&format!("\n\n{memory}"));
        }
        if let Some(document) = request.document_context {
            prompt.push_str(&format!("\n\nAttached document context:\n{document}"));
        }
        prompt
    }

    /// Run the loop. Steps are surfaced through `emit`; the returned outcome
    /// carries the final answer (or the canned apology after exhaustion).
    pub async fn run(
        &self,
        request: AgentRequest<'_>,
        cancel: &CancellationToken,
        emit: &(dyn Fn(AgentStep) + Send + Sync),
    ) -> Result<AgentOutcome, AgentError> {
        let started = tokio::time::Instant::now();
        let system_prompt = self.build_system_prompt(&request).await;

        let mut messages = vec![ChatMessage::system(system_prompt)];
        messages.extend_from_slice(request.history);
        messages.push(ChatMessage::user(request.utterance.to_string()));

        let mut outcome = AgentOutcome::default();
        let options = ChatOptions::default();

        for step in 0..self.max_steps {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                return Ok(outcome);
            }
            if started.elapsed() > self.wall_clock {
                warn!("Agent loop exceeded wall-clock bound");
                break;
            }

            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    return Ok(outcome);
                }
                result = self.llm.chat(&messages, &options) => {
                    result.map_err(|e| AgentError::Llm(e.to_string()))?
                }
            };

            let Some(call) = parse_tool_call(&reply) else {
                // Final answer
                let answer = reply.trim().to_string();
                emit(AgentStep::FinalChunk(answer.clone()));
                outcome.final_answer = answer;
                info!(steps = outcome.steps, "Agent loop finished with final answer");
                return Ok(outcome);
            };

            debug!(tool = %call.tool, step, "Agent tool call");
            emit(AgentStep::ToolCall {
                tool: call.tool.clone(),
                args: call.args.clone(),
            });
            outcome.steps += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    return Ok(outcome);
                }
                result = tokio::time::timeout(
                    self.tool_timeout,
                    self.tools.execute(&call, request.tool_ctx),
                ) => {
                    result.unwrap_or_else(|_| {
                        ToolCallResult::failure(format!("Tool {} timed out", call.tool))
                            .with_error_code("timeout")
                    })
                }
            };

            emit(AgentStep::ToolResult {
                tool: call.tool.clone(),
                success: result.success,
                message: result.message.clone(),
                data: result.data.clone(),
            });
            outcome.steps += 1;

            if result.success {
                if let Some(data) = &result.data {
                    outcome.tool_results.push((call.tool.clone(), data.clone()));
                }
            }

            // Feed the exchange back for the next iteration
            messages.push(ChatMessage::assistant(reply));
            let mut result_payload = json!({
                "tool": call.tool,
                "success": result.success,
                "message": result.message,
            });
            if let Some(data) = &result.data {
                result_payload["data"] = data.clone();
            }
            // Busy precondition failure: tell the model how to proceed
            let busy = result
                .data
                .as_ref()
                .and_then(|d| d.get("status"))
                .and_then(Value::as_str)
                == Some("busy");
            if busy {
                result_payload["hint"] = json!(
                    "The device is busy. Ask the user whether to interrupt; if they confirm, \
                     call the tool again with force=true."
                );
            }
            messages.push(ChatMessage::user(format!(
                "Tool result: {result_payload}"
            )));
        }

        // Step budget exhausted without a final answer
        warn!(max_steps = self.max_steps, "Agent loop exhausted");
        emit(AgentStep::FinalChunk(EXHAUSTED_APOLOGY.to_string()));
        outcome.final_answer = EXHAUSTED_APOLOGY.to_string();
        Ok(outcome)
    }
}
