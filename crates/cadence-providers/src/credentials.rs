// Credential resolution
// The core never sees raw keying flows; it consumes an opaque resolver.
// Resolution may trigger CLI-side token refresh, so calls are serialized per
// provider to keep refresh idempotent under concurrency.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use cadence_core::{CadenceError, Result, StateStore};
use cadence_types::ProviderKind;

/// Which credential path an invocation should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    ApiKey,
    OAuth,
}

/// Material handed to an adapter just before spawn.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    /// The CLI holds a refreshable OAuth session.
    pub oauth_available: bool,
    pub mode: AuthMode,
}

impl Credentials {
    pub fn with_mode(mut self, mode: AuthMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderOAuthStatus {
    pub logged_in: bool,
    pub can_use_api: bool,
    pub can_use_cli: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, provider_id: &str) -> Result<Credentials>;
    async fn status(&self, provider_id: &str, deep: bool) -> Result<ProviderOAuthStatus>;
}

/// Classify provider errors that should trigger the OAuth fallback.
pub fn is_auth_error(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("401") || lowered.contains("unauthorized") || lowered.contains("invalid api key")
}

// ============================================================================
// Per-provider serialization
// ============================================================================

/// Wraps a resolver so concurrent resolves for the same provider run one at a
/// time. Different providers resolve in parallel.
pub struct CredentialGate {
    inner: Arc<dyn CredentialResolver>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialGate {
    pub fn new(inner: Arc<dyn CredentialResolver>) -> Self {
        Self {
            inner,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, provider_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl CredentialResolver for CredentialGate {
    async fn resolve(&self, provider_id: &str) -> Result<Credentials> {
        let lock = self.lock_for(provider_id).await;
        let _guard = lock.lock().await;
        self.inner.resolve(provider_id).await
    }

    async fn status(&self, provider_id: &str, deep: bool) -> Result<ProviderOAuthStatus> {
        self.inner.status(provider_id, deep).await
    }
}

// ============================================================================
// Store-backed resolver
// ============================================================================

/// Resolver backed by the state store's provider records plus a PATH probe
/// for the vendor CLI binary.
pub struct StoreCredentialResolver {
    store: Arc<dyn StateStore>,
}

impl StoreCredentialResolver {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

fn cli_binary_name(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Codex => "codex",
        ProviderKind::Claude => "claude",
    }
}

/// Whether the named binary is reachable on PATH.
pub fn cli_on_path(binary: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(binary);
        #[cfg(windows)]
        let candidate = candidate.with_extension("exe");
        candidate.is_file()
    })
}

#[async_trait]
impl CredentialResolver for StoreCredentialResolver {
    async fn resolve(&self, provider_id: &str) -> Result<Credentials> {
        let record = self
            .store
            .get_provider(provider_id)
            .await
            .ok_or_else(|| CadenceError::NotFound(format!("provider {provider_id}")))?;
        let cli = cli_on_path(cli_binary_name(record.kind));
        let api_key = record.api_key.filter(|k| !k.is_empty());
        let mode = if api_key.is_some() {
            AuthMode::ApiKey
        } else {
            AuthMode::OAuth
        };
        Ok(Credentials {
            api_key,
            oauth_available: cli,
            mode,
        })
    }

    async fn status(&self, provider_id: &str, _deep: bool) -> Result<ProviderOAuthStatus> {
        let record = self
            .store
            .get_provider(provider_id)
            .await
            .ok_or_else(|| CadenceError::NotFound(format!("provider {provider_id}")))?;
        let cli = cli_on_path(cli_binary_name(record.kind));
        Ok(ProviderOAuthStatus {
            logged_in: cli,
            can_use_api: record.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false),
            can_use_cli: cli,
            account: None,
        })
    }
}
