// Codex CLI adapter
// Spawns `codex exec --format stream-json` and maps its newline-delimited
// JSON onto provider events.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cadence_core::Result;

use crate::credentials::{AuthMode, Credentials};
use crate::process::{stream_cli, CliInvocation};
use crate::{InvokeParams, ProviderAdapter, ProviderEvent, ProviderStream};

pub struct CodexAdapter {
    id: String,
    binary: String,
}

impl CodexAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            binary: "codex".to_string(),
        }
    }

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
        let mut args = vec![
            "exec".to_string(),
            "--model".to_string(),
            params.model.clone(),
            "--format".to_string(),
            "stream-json".to_string(),
        ];
        // Fast mode wins over an explicit effort setting.
        let effort = if params.fast_mode {
            Some("minimal")
        } else {
            params.reasoning_effort.as_deref()
        };
        if let Some(effort) = effort {
            args.push("--reasoning-effort".to_string());
            args.push(effort.to_string());
        }
        let mut env = Vec::new();
        if credentials.mode == AuthMode::ApiKey {
            if let Some(key) = &credentials.api_key {
                env.push(("OPENAI_API_KEY".to_string(), key.clone()));
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
impl ProviderAdapter for CodexAdapter {
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
        Some("item.completed") => {
            let Some(item) = value.get("item") else {
                return Vec::new();
            };
            match item.get("type").and_then(Value::as_str) {
                Some("agent_message") => item
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| {
                        vec![ProviderEvent::Chunk {
                            text: text.to_string(),
                            meta: value.clone(),
                        }]
                    })
                    .unwrap_or_default(),
                Some("command_execution") => {
                    let command = item
                        .get("command")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let cwd = item.get("cwd").and_then(Value::as_str).map(str::to_string);
                    let mut events = vec![ProviderEvent::ToolCall {
                        tool: "Bash".to_string(),
                        command,
                        cwd,
                    }];
                    if let Some(exit_code) = item.get("exit_code").and_then(Value::as_i64) {
                        events.push(ProviderEvent::ToolResult {
                            tool: "Bash".to_string(),
                            summary: format!("exit {exit_code}"),
                        });
                    }
                    events
                }
                Some("reasoning") => item
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| vec![ProviderEvent::ModelSummary { text: text.to_string() }])
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        }
        Some("turn.completed") => vec![ProviderEvent::FinalStatus {
            status: "completed".to_string(),
        }],
        Some("turn.failed") => {
            let message = value
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("turn failed")
                .to_string();
            vec![ProviderEvent::Error { message }]
        }
        Some("error") => {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("provider error")
                .to_string();
            vec![ProviderEvent::Error { message }]
        }
        // thread.started and friends are heartbeat traffic.
        _ => vec![ProviderEvent::Chunk {
            text: String::new(),
            meta: value,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::is_metadata_only;

    #[test]
    fn agent_messages_become_chunks() {
        let events = parse_line(
            r#"{"type":"item.completed","item":{"type":"agent_message","text":"hi"}}"#,
        );
        assert!(matches!(
            &events[0],
            ProviderEvent::Chunk { text, .. } if text == "hi"
        ));
    }

    #[test]
    fn command_execution_yields_tool_call_and_result() {
        let events = parse_line(
            r#"{"type":"item.completed","item":{"type":"command_execution","command":"ls","cwd":"/tmp","exit_code":0}}"#,
        );
        assert_eq!(
            events[0],
            ProviderEvent::ToolCall {
                tool: "Bash".to_string(),
                command: Some("ls".to_string()),
                cwd: Some("/tmp".to_string()),
            }
        );
        assert_eq!(
            events[1],
            ProviderEvent::ToolResult {
                tool: "Bash".to_string(),
                summary: "exit 0".to_string(),
            }
        );
    }

    #[test]
    fn thread_started_is_heartbeat_traffic() {
        let events = parse_line(r#"{"type":"thread.started","thread_id":"t1"}"#);
        match &events[0] {
            ProviderEvent::Chunk { text, meta } => {
                assert!(text.is_empty());
                assert!(is_metadata_only(meta));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn turn_failed_surfaces_error_message() {
        let events =
            parse_line(r#"{"type":"turn.failed","error":{"message":"model overloaded"}}"#);
        assert_eq!(
            events[0],
            ProviderEvent::Error {
                message: "model overloaded".to_string()
            }
        );
    }

    #[test]
    fn fast_mode_forces_minimal_effort() {
        let adapter = CodexAdapter::new("codex");
        let params = InvokeParams {
            model: "gpt-5".to_string(),
            reasoning_effort: Some("high".to_string()),
            fast_mode: true,
            stage_timeout_ms: 1000,
            ..Default::default()
        };
        let invocation = adapter.build_invocation(&Credentials::default(), "p", &params);
        let joined = invocation.args.join(" ");
        assert!(joined.contains("--reasoning-effort minimal"));
    }
}
