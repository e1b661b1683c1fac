// Cadence server
// HTTP boundary over the run queue, scheduler, and state store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use uuid::Uuid;

use cadence_core::{EnvConfig, SecureInputVault, StateStore};
use cadence_providers::CredentialResolver;
use cadence_runtime::{RunEnvironment, RunQueue};

mod http;

pub use http::{router, serve};

/// Pairing codes stay claimable for this long.
pub const PAIRING_TTL_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Pending,
    Approved,
    Claimed,
}

#[derive(Debug, Clone)]
pub struct PairingSession {
    pub id: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PairingStatus,
    pub claim_token: Option<String>,
}

impl PairingSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// In-memory registry of remote pairing sessions.
#[derive(Clone, Default)]
pub struct PairingRegistry {
    sessions: Arc<Mutex<HashMap<String, PairingSession>>>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> PairingSession {
        let now = Utc::now();
        let session = PairingSession {
            id: Uuid::new_v4().to_string(),
            code: format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32)),
            created_at: now,
            expires_at: now + Duration::seconds(PAIRING_TTL_SECS),
            status: PairingStatus::Pending,
            claim_token: None,
        };
        self.sessions
            .lock()
            .await
            .insert(session.id.clone(), session.clone());
        session
    }

    pub async fn get(&self, id: &str) -> Option<PairingSession> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn update<F>(&self, id: &str, mutate: F) -> Option<PairingSession>
    where
        F: FnOnce(&mut PairingSession),
    {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id)?;
        mutate(session);
        Some(session.clone())
    }

    pub async fn prune_expired(&self) {
        let now = Utc::now();
        self.sessions
            .lock()
            .await
            .retain(|_, s| !s.is_expired(now) || s.status == PairingStatus::Claimed);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EnvConfig>,
    pub env: Arc<RunEnvironment>,
    pub queue: RunQueue,
    pub pairing: PairingRegistry,
}

impl AppState {
    pub fn new(config: EnvConfig, env: Arc<RunEnvironment>, queue: RunQueue) -> Self {
        Self {
            config: Arc::new(config),
            env,
            queue,
            pairing: PairingRegistry::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.env.store.clone()
    }

    pub fn vault(&self) -> Arc<SecureInputVault> {
        self.env.vault.clone()
    }

    pub fn credentials(&self) -> Arc<dyn CredentialResolver> {
        self.env.credentials.clone()
    }
}

/// Lexicographic-by-segment version compare for the desktop update gate.
pub fn version_lt(candidate: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|part| {
                part.chars()
                    .take_while(|c| c.is_ascii_digit())
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    let a = parse(candidate);
    let b = parse(minimum);
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x < y;
        }
    }
    false
}
