// Step runner
// Renders the prompt, dispatches to a provider adapter, consumes the event
// stream, and extracts the structured workflow outcome. Delegation fans the
// same prompt out to parallel sub-invocations and aggregates their results.

use futures::StreamExt;
use regex::RegexBuilder;
use tokio_util::sync::CancellationToken;

use cadence_providers::credentials::is_auth_error;
use cadence_providers::{
    is_metadata_only, Credentials, InvokeParams, ProviderAdapter, ProviderEvent,
};
use cadence_types::{Step, WorkflowOutcome};

/// Stdout tail kept for run logs after each dispatch.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Fixed instructions appended to every prompt.
const POSTAMBLE: &str = "When you are done, end your reply with a final line of exactly \
`WORKFLOW_STATUS: PASS` or `WORKFLOW_STATUS: FAIL`.";

const JSON_POSTAMBLE: &str = "Return your result as a single fenced ```json code block \
containing one JSON object.";

/// Result of one step dispatch (including delegation aggregation).
#[derive(Debug, Clone, Default)]
pub struct StepDispatch {
    pub output: String,
    pub outcome: Option<WorkflowOutcome>,
    pub subagent_notes: Vec<String>,
    /// Lifecycle, tool, and progress lines in arrival order. Never part of
    /// the accumulated output.
    pub logs: Vec<String>,
    pub error: Option<String>,
    /// 401-classified provider errors observed across sub-invocations.
    pub auth_failures: u32,
}

impl StepDispatch {
    pub fn outcome_or_neutral(&self) -> WorkflowOutcome {
        self.outcome.unwrap_or(WorkflowOutcome::Neutral)
    }

    pub fn output_tail(&self) -> String {
        let chars: Vec<char> = self.output.chars().collect();
        if chars.len() <= OUTPUT_TAIL_CHARS {
            self.output.clone()
        } else {
            chars[chars.len() - OUTPUT_TAIL_CHARS..].iter().collect()
        }
    }
}

/// Assemble the full prompt for a step: step prompt, rendered context, MCP
/// server enumeration, required-output directives, and the fixed postamble.
pub fn assemble_prompt(step: &Step, rendered_context: &str, mcp_names: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str(step.prompt.trim_end());
    if !rendered_context.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(rendered_context.trim_end());
    }
    if !mcp_names.is_empty() {
        prompt.push_str("\n\nAvailable MCP servers:\n");
        for name in mcp_names {
            prompt.push_str("- ");
            prompt.push_str(name);
            prompt.push('\n');
        }
    }
    if !step.required_output_fields.is_empty() {
        prompt.push_str(&format!(
            "\n\nYour output must include these fields: {}.",
            step.required_output_fields.join(", ")
        ));
    }
    if !step.required_output_files.is_empty() {
        prompt.push_str(&format!(
            "\n\nYou must produce these files: {}.",
            step.required_output_files.join(", ")
        ));
    }
    prompt.push_str("\n\n");
    if step.output_format == cadence_types::OutputFormat::Json {
        prompt.push_str(JSON_POSTAMBLE);
        prompt.push(' ');
    }
    prompt.push_str(POSTAMBLE);
    prompt
}

/// Render a context template: `{{task}}`, `{{previous_output}}`, and any
/// `{{key}}` found in the merged inputs.
pub fn render_context(
    template: &str,
    task: &str,
    previous_output: &str,
    inputs: &std::collections::HashMap<String, String>,
) -> String {
    let mut rendered = template
        .replace("{{task}}", task)
        .replace("{{previous_output}}", previous_output);
    for (key, value) in inputs {
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
    }
    rendered
}

/// Find the last case-insensitive `WORKFLOW_STATUS:` line in model output.
pub fn parse_workflow_status(output: &str) -> Option<WorkflowOutcome> {
    let pattern = RegexBuilder::new(r"(?m)^\s*WORKFLOW_STATUS:\s*(PASS|FAIL)\s*$")
        .case_insensitive(true)
        .build()
        .unwrap();
    pattern
        .captures_iter(output)
        .last()
        .map(|c| match c[1].to_ascii_uppercase().as_str() {
            "PASS" => WorkflowOutcome::Pass,
            _ => WorkflowOutcome::Fail,
        })
}

fn outcome_from_final_status(status: &str) -> Option<WorkflowOutcome> {
    match status.to_ascii_uppercase().as_str() {
        "PASS" => Some(WorkflowOutcome::Pass),
        "FAIL" => Some(WorkflowOutcome::Fail),
        _ => None,
    }
}

/// Consume one provider stream into an aggregated sub-result.
async fn consume_stream(
    mut stream: cadence_providers::ProviderStream,
    tag: Option<&str>,
) -> StepDispatch {
    let mut result = StepDispatch::default();
    let mut final_status: Option<WorkflowOutcome> = None;
    let prefix = tag.map(|t| format!("[{t}] ")).unwrap_or_default();

    while let Some(event) = stream.next().await {
        match event {
            Ok(ProviderEvent::Chunk { text, meta }) => {
                // Metadata-only frames are heartbeats, not output.
                if is_metadata_only(&meta) {
                    continue;
                }
                if !text.is_empty() {
                    if !result.output.is_empty() {
                        result.output.push('\n');
                    }
                    result.output.push_str(&text);
                }
            }
            Ok(ProviderEvent::ToolCall { tool, command, cwd }) => {
                if tool == "Bash" {
                    let cwd = cwd.unwrap_or_default();
                    result.logs.push(format!(
                        "{prefix}modelShellCommand: {} (cwd: {})",
                        command.unwrap_or_default(),
                        if cwd.is_empty() { "." } else { &cwd }
                    ));
                } else {
                    result.logs.push(format!("{prefix}modelToolAction: {tool}"));
                }
            }
            Ok(ProviderEvent::ToolResult { tool, summary }) => {
                let tool = if tool.is_empty() { "tool" } else { tool.as_str() };
                result
                    .logs
                    .push(format!("{prefix}{tool} result: {}", summary.trim()));
            }
            Ok(ProviderEvent::ModelSummary { text }) => {
                result.logs.push(format!("{prefix}model: {}", text.trim()));
            }
            Ok(ProviderEvent::Progress { elapsed_ms, pid }) => {
                result.logs.push(format!(
                    "{prefix}command_progress elapsed={elapsed_ms}ms pid={}",
                    pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
                ));
            }
            Ok(ProviderEvent::FinalStatus { status }) => {
                if let Some(outcome) = outcome_from_final_status(&status) {
                    final_status = Some(outcome);
                }
            }
            Ok(ProviderEvent::Error { message }) => {
                if is_auth_error(&message) {
                    result.auth_failures += 1;
                }
                result.error = Some(message);
            }
            Err(err) => {
                let message = err.to_string();
                if is_auth_error(&message) {
                    result.auth_failures += 1;
                }
                result.error = Some(message);
                break;
            }
        }
    }

    // The in-text marker wins; a FinalStatus event covers adapters whose
    // terminal frame carries the verdict directly.
    result.outcome = parse_workflow_status(&result.output).or(final_status);
    result
}

/// Dispatch a step once. With delegation enabled this launches
/// `delegation_count` parallel sub-invocations and aggregates: the primary
/// output is the first PASS, otherwise the last completed; every sub output
/// is recorded as a subagent note.
pub async fn dispatch_step(
    adapter: std::sync::Arc<dyn ProviderAdapter>,
    credentials: &Credentials,
    step: &Step,
    rendered_context: &str,
    mcp_names: &[String],
    stage_timeout_ms: u64,
    cancel: CancellationToken,
) -> StepDispatch {
    let prompt = assemble_prompt(step, rendered_context, mcp_names);
    let base_params = InvokeParams {
        model: step.model.clone(),
        reasoning_effort: step.reasoning_effort.clone(),
        fast_mode: step.fast_mode,
        wide_context: step.wide_context,
        stage_timeout_ms,
        tag: None,
    };

    let fan_out = if step.enable_delegation {
        step.delegation_count.clamp(1, 8)
    } else {
        1
    };

    if fan_out == 1 {
        let stream = match adapter
            .invoke(credentials, &prompt, &base_params, cancel.clone())
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                let message = err.to_string();
                return StepDispatch {
                    auth_failures: is_auth_error(&message) as u32,
                    error: Some(message),
                    ..Default::default()
                };
            }
        };
        return consume_stream(stream, None).await;
    }

    let mut futures = Vec::with_capacity(fan_out as usize);
    for i in 0..fan_out {
        let tag = format!("sub-{}/{}", i + 1, fan_out);
        let mut params = base_params.clone();
        params.tag = Some(tag.clone());
        let adapter = adapter.clone();
        let credentials = credentials.clone();
        let prompt = prompt.clone();
        let cancel = cancel.clone();
        futures.push(async move {
            let stream = match adapter.invoke(&credentials, &prompt, &params, cancel).await {
                Ok(stream) => stream,
                Err(err) => {
                    let message = err.to_string();
                    return (
                        tag,
                        StepDispatch {
                            auth_failures: is_auth_error(&message) as u32,
                            error: Some(message),
                            ..Default::default()
                        },
                    );
                }
            };
            (tag.clone(), consume_stream(stream, Some(&tag)).await)
        });
    }

    let subs = futures::future::join_all(futures).await;

    let mut aggregated = StepDispatch::default();
    let mut primary: Option<&StepDispatch> = None;
    for (tag, sub) in &subs {
        aggregated.logs.extend(sub.logs.iter().cloned());
        aggregated.auth_failures += sub.auth_failures;
        aggregated
            .subagent_notes
            .push(format!("[{tag}] {}", sub.output.trim()));
        if primary
            .map(|p| p.outcome != Some(WorkflowOutcome::Pass))
            .unwrap_or(true)
        {
            if sub.outcome == Some(WorkflowOutcome::Pass) || sub.error.is_none() {
                primary = Some(sub);
            }
        }
    }
    // Fall back to the last sub-invocation when none completed cleanly.
    let primary = primary.or_else(|| subs.last().map(|(_, s)| s));
    if let Some(primary) = primary {
        aggregated.output = primary.output.clone();
        aggregated.outcome = primary.outcome;
        aggregated.error = primary.error.clone();
    }
    aggregated
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cadence_core::Result;
    use cadence_providers::{ProviderStream, ProviderRegistry};
    use cadence_types::{OutputFormat, StepRole};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn step() -> Step {
        Step {
            id: "s1".to_string(),
            name: "build".to_string(),
            role: StepRole::Executor,
            prompt: "Build the project".to_string(),
            provider_id: "claude".to_string(),
            model: "sonnet".to_string(),
            reasoning_effort: None,
            fast_mode: false,
            wide_context: false,
            context_window_tokens: None,
            context_template: "Task:\n{{task}}".to_string(),
            enable_delegation: false,
            delegation_count: 1,
            store_isolated: false,
            store_shared: false,
            mcp_server_ids: Vec::new(),
            output_format: OutputFormat::Markdown,
            required_output_fields: Vec::new(),
            required_output_files: Vec::new(),
        }
    }

    /// Adapter that replays a fixed script per invocation, round-robin.
    pub struct ScriptedAdapter {
        scripts: std::sync::Mutex<Vec<Vec<ProviderEvent>>>,
    }

    impl ScriptedAdapter {
        pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
            Self {
                scripts: std::sync::Mutex::new(scripts),
            }
        }
    }

    #[async_trait]
    impl cadence_providers::ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn invoke(
            &self,
            _credentials: &Credentials,
            _prompt: &str,
            _params: &InvokeParams,
            _cancel: CancellationToken,
        ) -> Result<ProviderStream> {
            let mut scripts = self.scripts.lock().unwrap();
            let events = if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                scripts.first().cloned().unwrap_or_default()
            };
            Ok(Box::pin(futures::stream::iter(
                events.into_iter().map(Ok),
            )))
        }
    }

    fn chunk(text: &str) -> ProviderEvent {
        ProviderEvent::Chunk {
            text: text.to_string(),
            meta: json!({"type": "assistant", "text": text}),
        }
    }

    #[test]
    fn prompt_contains_context_mcp_and_postamble() {
        let mut s = step();
        s.required_output_fields = vec!["summary".to_string()];
        s.output_format = OutputFormat::Json;
        let prompt = assemble_prompt(&s, "Task:\nship it", &["github".to_string()]);
        assert!(prompt.starts_with("Build the project"));
        assert!(prompt.contains("Task:\nship it"));
        assert!(prompt.contains("- github"));
        assert!(prompt.contains("summary"));
        assert!(prompt.contains("```json"));
        assert!(prompt.contains("WORKFLOW_STATUS: PASS"));
    }

    #[test]
    fn context_rendering_substitutes_placeholders() {
        let mut inputs = HashMap::new();
        inputs.insert("BRANCH".to_string(), "main".to_string());
        let rendered = render_context(
            "Task:\n{{task}}\nPrev:\n{{previous_output}}\nBranch: {{BRANCH}}",
            "deploy",
            "built ok",
            &inputs,
        );
        assert_eq!(rendered, "Task:\ndeploy\nPrev:\nbuilt ok\nBranch: main");
    }

    #[test]
    fn workflow_status_is_case_insensitive_and_last_wins() {
        assert_eq!(
            parse_workflow_status("workflow_status: pass\nWORKFLOW_STATUS: FAIL"),
            Some(WorkflowOutcome::Fail)
        );
        assert_eq!(
            parse_workflow_status("no marker here"),
            None
        );
        assert_eq!(
            parse_workflow_status("  Workflow_Status:   PASS  "),
            Some(WorkflowOutcome::Pass)
        );
    }

    #[tokio::test]
    async fn heartbeats_and_progress_stay_out_of_output() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![vec![
            ProviderEvent::Chunk {
                text: String::new(),
                meta: json!({"session_id": "s", "uuid": "u"}),
            },
            ProviderEvent::Progress {
                elapsed_ms: 30_000,
                pid: Some(42),
            },
            chunk("real output"),
            ProviderEvent::FinalStatus {
                status: "PASS".to_string(),
            },
        ]]));
        let dispatch = dispatch_step(
            adapter,
            &Credentials::default(),
            &step(),
            "ctx",
            &[],
            5_000,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(dispatch.output, "real output");
        assert_eq!(dispatch.outcome, Some(WorkflowOutcome::Pass));
        assert!(dispatch
            .logs
            .iter()
            .any(|l| l.contains("command_progress elapsed=30000ms pid=42")));
    }

    #[tokio::test]
    async fn bash_tool_calls_become_shell_command_logs() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![vec![
            ProviderEvent::ToolCall {
                tool: "Bash".to_string(),
                command: Some("cargo test".to_string()),
                cwd: Some("/repo".to_string()),
            },
            ProviderEvent::ToolCall {
                tool: "Edit".to_string(),
                command: None,
                cwd: None,
            },
            chunk("done\nWORKFLOW_STATUS: PASS"),
        ]]));
        let dispatch = dispatch_step(
            adapter,
            &Credentials::default(),
            &step(),
            "",
            &[],
            5_000,
            CancellationToken::new(),
        )
        .await;
        assert!(dispatch
            .logs
            .iter()
            .any(|l| l.contains("modelShellCommand: cargo test (cwd: /repo)")));
        assert!(dispatch.logs.iter().any(|l| l.contains("modelToolAction: Edit")));
    }

    #[tokio::test]
    async fn delegation_prefers_first_pass_and_keeps_all_notes() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            vec![chunk("attempt one\nWORKFLOW_STATUS: FAIL")],
            vec![chunk("attempt two\nWORKFLOW_STATUS: PASS")],
            vec![chunk("attempt three\nWORKFLOW_STATUS: FAIL")],
        ]));
        let mut s = step();
        s.enable_delegation = true;
        s.delegation_count = 3;
        let dispatch = dispatch_step(
            adapter,
            &Credentials::default(),
            &s,
            "",
            &[],
            5_000,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(dispatch.outcome, Some(WorkflowOutcome::Pass));
        assert!(dispatch.output.contains("attempt two"));
        assert_eq!(dispatch.subagent_notes.len(), 3);
        assert!(dispatch.subagent_notes[0].starts_with("[sub-1/3]"));
    }

    #[tokio::test]
    async fn auth_errors_are_counted() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![vec![ProviderEvent::Error {
            message: "HTTP 401 unauthorized".to_string(),
        }]]));
        let dispatch = dispatch_step(
            adapter,
            &Credentials::default(),
            &step(),
            "",
            &[],
            5_000,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(dispatch.auth_failures, 1);
        assert!(dispatch.error.is_some());
    }

    #[tokio::test]
    async fn registry_roundtrip_with_scripted_adapter() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(ScriptedAdapter::new(vec![vec![chunk("ok")]])))
            .await;
        assert!(registry.get("scripted").await.is_some());
    }
}
