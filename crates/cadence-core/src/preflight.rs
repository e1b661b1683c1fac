// Smart run plan evaluation
// Static and dynamic checks that gate run dispatch. A failing check rejects
// manual launches with a conflict and makes the scheduler skip the firing.

use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};

use cadence_types::{McpServerRecord, OutputFormat, Pipeline, RunMode, StepRole};

use crate::cron::{resolve_timezone, CronExpr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub id: String,
    pub title: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Check {
    fn pass(id: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: CheckStatus::Pass,
            message: message.into(),
            details: None,
        }
    }

    fn warn(id: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: CheckStatus::Warn,
            message: message.into(),
            details: None,
        }
    }

    fn fail(id: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: CheckStatus::Fail,
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SmartRunPlan {
    pub checks: Vec<Check>,
}

impl SmartRunPlan {
    pub fn failed_checks(&self) -> Vec<&Check> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        self.checks.iter().any(|c| c.status == CheckStatus::Fail)
    }
}

/// Credential availability for one provider, as reported by the resolver.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialHealth {
    pub can_use_api: bool,
    pub can_use_cli: bool,
    pub logged_in: bool,
}

impl CredentialHealth {
    pub fn usable(&self) -> bool {
        self.can_use_api || self.can_use_cli || self.logged_in
    }
}

/// Everything the evaluator needs, gathered by the caller.
pub struct PreflightContext<'a> {
    pub pipeline: &'a Pipeline,
    pub inputs: &'a HashMap<String, String>,
    pub secure_keys: &'a [String],
    pub credentials: &'a HashMap<String, CredentialHealth>,
    pub mcp_servers: &'a [McpServerRecord],
    pub run_mode: RunMode,
}

/// Keys referenced as `{{key}}` in any step prompt or context template,
/// excluding the built-in task/previous_output placeholders.
pub fn referenced_input_keys(pipeline: &Pipeline) -> BTreeSet<String> {
    let placeholder = Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.-]*)\s*\}\}").unwrap();
    let mut keys = BTreeSet::new();
    for step in &pipeline.steps {
        for source in [&step.prompt, &step.context_template] {
            for capture in placeholder.captures_iter(source) {
                let key = capture[1].to_string();
                if key != "task" && key != "previous_output" {
                    keys.insert(key);
                }
            }
        }
    }
    keys
}

pub fn evaluate(ctx: &PreflightContext<'_>) -> SmartRunPlan {
    let mut checks = Vec::new();
    let pipeline = ctx.pipeline;

    // Structural checks.
    let missing_models: Vec<&str> = pipeline
        .steps
        .iter()
        .filter(|s| s.model.trim().is_empty())
        .map(|s| s.name.as_str())
        .collect();
    if pipeline.steps.is_empty() {
        checks.push(Check::fail(
            "structure.steps",
            "Steps",
            "pipeline has no steps",
        ));
    } else if missing_models.is_empty() {
        checks.push(Check::pass(
            "structure.models",
            "Models",
            "every step has a model",
        ));
    } else {
        checks.push(Check::fail(
            "structure.models",
            "Models",
            format!("steps without a model: {}", missing_models.join(", ")),
        ));
    }

    let structural_issues = pipeline.validate();
    if structural_issues.is_empty() {
        checks.push(Check::pass(
            "structure.links",
            "Graph",
            "all link endpoints resolve",
        ));
    } else {
        let mut check = Check::fail(
            "structure.links",
            "Graph",
            format!("{} structural issue(s)", structural_issues.len()),
        );
        check.details = serde_json::to_value(&structural_issues).ok();
        checks.push(check);
    }

    let orchestrators = pipeline
        .steps
        .iter()
        .filter(|s| s.role == StepRole::Orchestrator)
        .count();
    if orchestrators > 1 {
        checks.push(Check::fail(
            "structure.orchestrators",
            "Orchestrator",
            format!("{orchestrators} orchestrator steps; at most one is allowed"),
        ));
    }

    for step in &pipeline.steps {
        if step.output_format == OutputFormat::Json && step.required_output_fields.is_empty() {
            checks.push(Check::fail(
                format!("structure.output.{}", step.id),
                "Output contract",
                format!(
                    "step '{}' requests JSON output but lists no required fields",
                    step.name
                ),
            ));
        }
    }

    // Credential checks, one per distinct provider. Quick mode trusts the
    // last known state and skips these.
    if ctx.run_mode == RunMode::Smart {
        let mut providers: Vec<&str> = pipeline
            .steps
            .iter()
            .map(|s| s.provider_id.as_str())
            .collect();
        providers.sort_unstable();
        providers.dedup();
        for provider_id in providers {
            match ctx.credentials.get(provider_id) {
                Some(health) if health.usable() => checks.push(Check::pass(
                    format!("credentials.{provider_id}"),
                    "Credentials",
                    format!("provider '{provider_id}' is usable"),
                )),
                Some(_) => checks.push(Check::fail(
                    format!("credentials.{provider_id}"),
                    "Credentials",
                    format!("provider '{provider_id}' has no usable credential"),
                )),
                None => checks.push(Check::fail(
                    format!("credentials.{provider_id}"),
                    "Credentials",
                    format!("provider '{provider_id}' is not configured"),
                )),
            }
        }
    }

    // Input checks: every referenced placeholder must come from somewhere.
    let referenced = referenced_input_keys(pipeline);
    let mut missing = Vec::new();
    for key in &referenced {
        let in_inputs = ctx
            .inputs
            .get(key)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
        let in_secure = ctx.secure_keys.iter().any(|k| k == key);
        if in_inputs || in_secure {
            continue;
        }
        missing.push(key.clone());
        checks.push(Check::fail(
            format!("inputs.{key}"),
            "Inputs",
            format!("'{{{{{key}}}}}' is referenced but not provided"),
        ));
    }
    if !referenced.is_empty() && missing.is_empty() {
        checks.push(Check::pass(
            "inputs",
            "Inputs",
            format!("{} referenced input(s) satisfied", referenced.len()),
        ));
    }

    // MCP checks.
    if ctx.run_mode == RunMode::Smart {
        let mut mcp_ids: Vec<&str> = pipeline
            .steps
            .iter()
            .flat_map(|s| s.mcp_server_ids.iter().map(String::as_str))
            .collect();
        mcp_ids.sort_unstable();
        mcp_ids.dedup();
        for id in mcp_ids {
            match ctx.mcp_servers.iter().find(|m| m.id == id) {
                Some(server) if server.healthy => checks.push(Check::pass(
                    format!("mcp.{id}"),
                    "MCP",
                    format!("server '{}' is healthy", server.name),
                )),
                Some(server) => checks.push(Check::fail(
                    format!("mcp.{id}"),
                    "MCP",
                    format!("server '{}' is not healthy", server.name),
                )),
                None => checks.push(Check::fail(
                    format!("mcp.{id}"),
                    "MCP",
                    format!("unknown MCP server '{id}'"),
                )),
            }
        }
    }

    // Schedule checks.
    if let Some(schedule) = pipeline.schedule.as_ref().filter(|s| s.enabled) {
        match CronExpr::parse(&schedule.cron) {
            Ok(_) => checks.push(Check::pass(
                "schedule.cron",
                "Schedule",
                "cron expression parses",
            )),
            Err(err) => checks.push(Check::fail(
                "schedule.cron",
                "Schedule",
                err.to_string(),
            )),
        }
        if resolve_timezone(&schedule.timezone).is_some() {
            checks.push(Check::pass(
                "schedule.timezone",
                "Schedule",
                format!("timezone '{}' resolves", schedule.timezone),
            ));
        } else {
            checks.push(Check::fail(
                "schedule.timezone",
                "Schedule",
                format!("unknown timezone '{}'", schedule.timezone),
            ));
        }
    } else if pipeline.schedule.is_some() {
        checks.push(Check::warn(
            "schedule.disabled",
            "Schedule",
            "schedule is configured but disabled",
        ));
    }

    SmartRunPlan { checks }
}
