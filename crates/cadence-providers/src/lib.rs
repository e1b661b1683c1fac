// Provider adapters
// Subprocess-based drivers translating between the run executor and the
// vendor CLIs (codex, claude). Each invocation spawns one CLI process and
// yields a lazy stream of parsed events.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use cadence_core::Result;

mod claude;
mod codex;
pub mod credentials;
pub mod process;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use credentials::{
    AuthMode, CredentialGate, CredentialResolver, Credentials, ProviderOAuthStatus,
    StoreCredentialResolver,
};

/// One parsed event from a provider CLI stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Model output text. `meta` is the decoded wire object the text came
    /// from, so callers can classify metadata-only frames.
    Chunk { text: String, meta: Value },
    /// The model invoked a tool.
    ToolCall {
        tool: String,
        command: Option<String>,
        cwd: Option<String>,
    },
    ToolResult { tool: String, summary: String },
    /// Provider-side summary text (token usage, turn notes).
    ModelSummary { text: String },
    /// Terminal stream marker with the provider's notion of the outcome.
    FinalStatus { status: String },
    /// Liveness pulse while the subprocess produces no terminal event.
    /// Surfaced as a run log line, never as model output.
    Progress { elapsed_ms: u64, pid: Option<u32> },
    Error { message: String },
}

/// Keys that never carry user-facing content on their own.
const METADATA_KEYS: &[&str] = &["session_id", "uuid", "statusline", "type", "subtype", "thread_id"];

/// Whether a decoded wire object is a metadata-only frame (heartbeat).
pub fn is_metadata_only(value: &Value) -> bool {
    match value.as_object() {
        Some(map) => map.keys().all(|k| METADATA_KEYS.contains(&k.as_str())),
        None => false,
    }
}

/// Per-invocation parameters resolved from the step definition.
#[derive(Debug, Clone, Default)]
pub struct InvokeParams {
    pub model: String,
    pub reasoning_effort: Option<String>,
    pub fast_mode: bool,
    pub wide_context: bool,
    pub stage_timeout_ms: u64,
    /// Delegation tag (`sub-{i}/{n}`) carried into logs.
    pub tag: Option<String>,
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Spawn one CLI invocation. The returned stream owns the subprocess;
    /// dropping it or cancelling the token kills the process.
    async fn invoke(
        &self,
        credentials: &Credentials,
        prompt: &str,
        params: &InvokeParams,
        cancel: CancellationToken,
    ) -> Result<ProviderStream>;
}

/// Registry of configured adapters, keyed by provider id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: Arc<RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters
            .write()
            .await
            .insert(adapter.id().to_string(), adapter);
    }

    pub async fn get(&self, provider_id: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.read().await.get(provider_id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
