use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use cadence_core::{AesGcmEncryptor, EnvConfig, JsonStateStore, SecureInputVault, StateStore};
use cadence_providers::{
    ClaudeAdapter, CodexAdapter, CredentialGate, ProviderRegistry, StoreCredentialResolver,
};
use cadence_runtime::{RunEnvironment, RunQueue};
use cadence_server::{serve, AppState};
use cadence_types::ProviderKind;

#[derive(Parser, Debug)]
#[command(name = "cadence-engine")]
#[command(about = "Local orchestration server for AI agent pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server, scheduler, and recovery sweep.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        /// Overrides the PORT environment variable.
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let mut config = EnvConfig::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(dir) = state_dir {
                config.state_dir = dir.into();
            }
            let addr: SocketAddr = format!("{hostname}:{}", config.port)
                .parse()
                .context("invalid hostname or port")?;
            let state = build_state(config).await?;
            log_startup_paths(&state, &addr);
            serve(addr, state).await?;
        }
    }

    Ok(())
}

fn log_startup_paths(state: &AppState, addr: &SocketAddr) {
    info!("starting cadence-engine on http://{addr}");
    info!(
        "state dir: {} (catch-up window {}m)",
        state.config.state_dir.display(),
        state.config.catchup_window_minutes
    );
}

async fn build_state(config: EnvConfig) -> anyhow::Result<AppState> {
    let store = Arc::new(JsonStateStore::new(&config.state_dir).await?);
    let encryptor = Arc::new(AesGcmEncryptor::from_salt_file(
        store.secure_inputs_dir().join(".salt"),
    )?);
    let vault = Arc::new(SecureInputVault::new(
        store.secure_inputs_dir(),
        encryptor,
    )?);

    let providers = ProviderRegistry::new();
    for record in store.list_providers().await {
        match record.kind {
            ProviderKind::Codex => {
                providers
                    .register(Arc::new(CodexAdapter::new(record.id.clone())))
                    .await
            }
            ProviderKind::Claude => {
                providers
                    .register(Arc::new(ClaudeAdapter::new(record.id.clone())))
                    .await
            }
        }
    }
    // Default adapters so fresh installs can run without provider records.
    if providers.get("codex").await.is_none() {
        providers.register(Arc::new(CodexAdapter::new("codex"))).await;
    }
    if providers.get("claude").await.is_none() {
        providers.register(Arc::new(ClaudeAdapter::new("claude"))).await;
    }

    let credentials = Arc::new(CredentialGate::new(Arc::new(StoreCredentialResolver::new(
        store.clone(),
    ))));

    let env = Arc::new(RunEnvironment {
        store,
        providers,
        credentials,
        vault,
    });
    let queue = RunQueue::new(env.clone());
    Ok(AppState::new(config, env, queue))
}
