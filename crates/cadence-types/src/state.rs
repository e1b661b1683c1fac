// Persisted state snapshot types
// Providers, MCP servers, and storage settings that live in state.json
// alongside pipelines and runs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Mask applied to sensitive values on every egress path.
pub const MASK_SENTINEL: &str = "•••";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Codex,
    Claude,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Codex => "codex",
            ProviderKind::Claude => "claude",
        }
    }
}

/// Configured provider entry. The API key is masked on every read path except
/// the runtime credential resolution path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub id: String,
    pub kind: ProviderKind,
    pub label: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl ProviderRecord {
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        if out.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false) {
            out.api_key = Some(MASK_SENTINEL.to_string());
        }
        out
    }
}

/// Registered MCP server. Env and headers may carry secrets, so both are
/// masked on egress.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerRecord {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub healthy: bool,
}

impl McpServerRecord {
    pub fn masked(&self) -> Self {
        let mut out = self.clone();
        for value in out.env.values_mut() {
            *value = MASK_SENTINEL.to_string();
        }
        for value in out.headers.values_mut() {
            *value = MASK_SENTINEL.to_string();
        }
        out
    }
}

/// Where run artifacts land on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageSettings {
    /// Per-run isolated folders are created under this root.
    #[serde(default)]
    pub isolated_root: Option<String>,
    /// Shared folder visible to every run of a pipeline.
    #[serde(default)]
    pub shared_root: Option<String>,
}
