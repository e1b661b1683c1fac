// Claude CLI adapter
// Spawns `claude --print --output-format stream-json` and maps its
// newline-delimited JSON onto provider events.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cadence_core::Result;

use crate::credentials::{AuthMode, Credentials};
use crate::process::{stream_cli, CliInvocation};
use crate::{InvokeParams, ProviderAdapter, ProviderEvent, ProviderStream};

const TOOL_RESULT_SUMMARY_CHARS: usize = 400;

pub struct ClaudeAdapter {
    id: String,
    binary: String,
}

impl ClaudeAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            binary: "claude".to_string(),
        }
    }

    /// Override the binary path, used by tests and packaged installs.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn build_invocation(
        &self,
        credentials: &Credentials,
        prompt: &str,
        params: &InvokeParams,
    ) -> CliInvocation {
        let model = if params.wide_context {
            format!("{}[1m]", params.model)
        } else {
            params.model.clone()
        };
        let args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--model".to_string(),
            model,
        ];
        let mut env = Vec::new();
        if credentials.mode == AuthMode::ApiKey {
            if let Some(key) = &credentials.api_key {
                env.push(("ANTHROPIC_API_KEY".to_string(), key.clone()));
            }
        }
        CliInvocation {
            program: self.binary.clone(),
            args,
            env,
            prompt: prompt.to_string(),
            stage_timeout_ms: params.stage_timeout_ms,
        }
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        credentials: &Credentials,
        prompt: &str,
        params: &InvokeParams,
        cancel: CancellationToken,
    ) -> Result<ProviderStream> {
        let invocation = self.build_invocation(credentials, prompt, params);
        Ok(stream_cli(invocation, cancel, parse_line))
    }
}

/// Map one stream-json line to provider events. Unknown lines pass through as
/// raw text so plain-output fallbacks still reach the run.
pub fn parse_line(line: &str) -> Vec<ProviderEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return vec![ProviderEvent::Chunk {
            text: trimmed.to_string(),
            meta: Value::Null,
        }];
    };

    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let mut events = Vec::new();
            let content = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in content {
                match item.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            events.push(ProviderEvent::Chunk {
                                text: text.to_string(),
                                meta: value.clone(),
                            });
                        }
                    }
                    Some("tool_use") => {
                        let tool = item
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string();
                        let command = item
                            .pointer("/input/command")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        let cwd = item
                            .pointer("/input/cwd")
                            .or_else(|| item.pointer("/input/directory"))
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        events.push(ProviderEvent::ToolCall { tool, command, cwd });
                    }
                    _ => {}
                }
            }
            events
        }
        Some("user") => {
            let mut events = Vec::new();
            let content = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in content {
                if item.get("type").and_then(Value::as_str) == Some("tool_result") {
                    let summary = match item.get("content") {
                        Some(Value::String(text)) => text.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    let summary: String = summary.chars().take(TOOL_RESULT_SUMMARY_CHARS).collect();
                    events.push(ProviderEvent::ToolResult {
                        tool: String::new(),
                        summary,
                    });
                }
            }
            events
        }
        Some("result") => {
            let status = value
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            vec![ProviderEvent::FinalStatus { status }]
        }
        // init frames and other system traffic carry no user-facing content.
        _ => vec![ProviderEvent::Chunk {
            text: String::new(),
            meta: value,
        }],
    }
}
