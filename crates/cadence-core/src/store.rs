// State store
// Append-only snapshot persistence for pipelines, runs, providers, and MCP
// servers. One JSON document on disk, every write temp-file + rename, reads
// served from an in-memory copy behind a RwLock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use cadence_types::{McpServerRecord, Pipeline, PipelineRun, ProviderRecord, StorageSettings};

use crate::error::{CadenceError, Result};

/// Runs kept in the snapshot; older runs are dropped on insert.
pub const RUN_RETENTION_LIMIT: usize = 200;

const STATE_FILE: &str = "state.json";
const MARKERS_FILE: &str = "scheduler-markers.json";

/// Closure applied to a run under the store's write lock.
pub type RunMutator = Box<dyn FnOnce(&mut PipelineRun) + Send>;

/// Write `content` to `path` atomically (temp file in the same directory,
/// then rename).
pub async fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CadenceError::Internal(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent).await?;
    let tmp = parent.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "state".to_string()),
        uuid::Uuid::new_v4().simple()
    ));
    fs::write(&tmp, content).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

// ============================================================================
// StateStore interface
// ============================================================================

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn list_pipelines(&self) -> Vec<Pipeline>;
    async fn get_pipeline(&self, id: &str) -> Option<Pipeline>;
    async fn create_pipeline(&self, pipeline: Pipeline) -> Result<Pipeline>;
    async fn update_pipeline(&self, pipeline: Pipeline) -> Result<Pipeline>;
    /// Removes the pipeline and its scheduler marker. Secure inputs are
    /// cascaded by the caller, which owns the vault.
    async fn delete_pipeline(&self, id: &str) -> Result<()>;

    async fn create_run(&self, run: PipelineRun) -> Result<PipelineRun>;
    async fn get_run(&self, id: &str) -> Option<PipelineRun>;
    /// Newest first.
    async fn list_runs(&self, limit: Option<usize>) -> Vec<PipelineRun>;
    /// Apply a mutation under the single-writer lock and persist the result.
    async fn update_run(&self, id: &str, mutate: RunMutator) -> Result<PipelineRun>;

    async fn list_providers(&self) -> Vec<ProviderRecord>;
    async fn get_provider(&self, id: &str) -> Option<ProviderRecord>;
    async fn upsert_provider(&self, record: ProviderRecord) -> Result<ProviderRecord>;

    async fn list_mcp_servers(&self) -> Vec<McpServerRecord>;
    async fn get_mcp_server(&self, id: &str) -> Option<McpServerRecord>;

    async fn storage_settings(&self) -> StorageSettings;

    /// True when the referenced artifact exists in the run's isolated folder
    /// or the pipeline's shared folder.
    async fn artifact_exists(&self, pipeline_id: &str, run_id: &str, relative: &str) -> bool;
    async fn write_artifact(
        &self,
        pipeline_id: &str,
        run_id: &str,
        relative: &str,
        contents: &str,
        shared: bool,
    ) -> Result<PathBuf>;

    async fn load_scheduler_markers(&self) -> HashMap<String, String>;
    async fn save_scheduler_markers(&self, markers: HashMap<String, String>) -> Result<()>;
}

// ============================================================================
// JSON-backed implementation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedState {
    #[serde(default)]
    pipelines: Vec<Pipeline>,
    #[serde(default)]
    runs: Vec<PipelineRun>,
    #[serde(default)]
    providers: Vec<ProviderRecord>,
    #[serde(default)]
    mcp_servers: Vec<McpServerRecord>,
    #[serde(default)]
    storage: StorageSettings,
}

pub struct JsonStateStore {
    base: PathBuf,
    state: RwLock<PersistedState>,
}

impl JsonStateStore {
    pub async fn new(base: impl AsRef<Path>) -> Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let state_path = base.join(STATE_FILE);
        let state = match fs::read_to_string(&state_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!("state file unreadable, starting empty: {err}");
                PersistedState::default()
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            base,
            state: RwLock::new(state),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn secure_inputs_dir(&self) -> PathBuf {
        self.base.join("secure-inputs")
    }

    fn run_artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.base.join("runs").join(run_id).join("artifacts")
    }

    fn shared_artifacts_dir(&self, pipeline_id: &str) -> PathBuf {
        self.base.join("shared").join(pipeline_id)
    }

    async fn persist(&self, state: &PersistedState) -> Result<()> {
        let serialized = serde_json::to_string_pretty(state)?;
        atomic_write(&self.base.join(STATE_FILE), &serialized).await
    }
}

/// Reject artifact paths that could escape the artifact roots.
fn safe_relative(relative: &str) -> Option<PathBuf> {
    let path = Path::new(relative);
    if path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::Normal(part) => out.push(part),
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn list_pipelines(&self) -> Vec<Pipeline> {
        self.state.read().await.pipelines.clone()
    }

    async fn get_pipeline(&self, id: &str) -> Option<Pipeline> {
        self.state
            .read()
            .await
            .pipelines
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    async fn create_pipeline(&self, mut pipeline: Pipeline) -> Result<Pipeline> {
        pipeline.normalize();
        let issues = pipeline.validate();
        if !issues.is_empty() {
            return Err(CadenceError::validation(issues));
        }
        let mut state = self.state.write().await;
        if state.pipelines.iter().any(|p| p.id == pipeline.id) {
            return Err(CadenceError::conflict(
                "pipeline_exists",
                format!("pipeline {} already exists", pipeline.id),
            ));
        }
        state.pipelines.push(pipeline.clone());
        self.persist(&state).await?;
        Ok(pipeline)
    }

    async fn update_pipeline(&self, mut pipeline: Pipeline) -> Result<Pipeline> {
        pipeline.normalize();
        let issues = pipeline.validate();
        if !issues.is_empty() {
            return Err(CadenceError::validation(issues));
        }
        let mut state = self.state.write().await;
        let slot = state
            .pipelines
            .iter_mut()
            .find(|p| p.id == pipeline.id)
            .ok_or_else(|| CadenceError::NotFound(format!("pipeline {}", pipeline.id)))?;
        pipeline.created_at = slot.created_at;
        pipeline.updated_at = chrono::Utc::now();
        *slot = pipeline.clone();
        self.persist(&state).await?;
        Ok(pipeline)
    }

    async fn delete_pipeline(&self, id: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let before = state.pipelines.len();
            state.pipelines.retain(|p| p.id != id);
            if state.pipelines.len() == before {
                return Err(CadenceError::NotFound(format!("pipeline {id}")));
            }
            self.persist(&state).await?;
        }
        // Cascade the scheduler marker so a recreated pipeline starts fresh.
        let mut markers = self.load_scheduler_markers().await;
        if markers.remove(id).is_some() {
            self.save_scheduler_markers(markers).await?;
        }
        Ok(())
    }

    async fn create_run(&self, run: PipelineRun) -> Result<PipelineRun> {
        let mut state = self.state.write().await;
        state.runs.insert(0, run.clone());
        if state.runs.len() > RUN_RETENTION_LIMIT {
            state.runs.truncate(RUN_RETENTION_LIMIT);
        }
        self.persist(&state).await?;
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> Option<PipelineRun> {
        self.state
            .read()
            .await
            .runs
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    async fn list_runs(&self, limit: Option<usize>) -> Vec<PipelineRun> {
        let state = self.state.read().await;
        let take = limit.unwrap_or(state.runs.len()).min(state.runs.len());
        state.runs[..take].to_vec()
    }

    async fn update_run(&self, id: &str, mutate: RunMutator) -> Result<PipelineRun> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| CadenceError::NotFound(format!("run {id}")))?;
        mutate(run);
        let updated = run.clone();
        self.persist(&state).await?;
        Ok(updated)
    }

    async fn list_providers(&self) -> Vec<ProviderRecord> {
        self.state.read().await.providers.clone()
    }

    async fn get_provider(&self, id: &str) -> Option<ProviderRecord> {
        self.state
            .read()
            .await
            .providers
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    async fn upsert_provider(&self, record: ProviderRecord) -> Result<ProviderRecord> {
        let mut state = self.state.write().await;
        match state.providers.iter_mut().find(|p| p.id == record.id) {
            Some(slot) => *slot = record.clone(),
            None => state.providers.push(record.clone()),
        }
        self.persist(&state).await?;
        Ok(record)
    }

    async fn list_mcp_servers(&self) -> Vec<McpServerRecord> {
        self.state.read().await.mcp_servers.clone()
    }

    async fn get_mcp_server(&self, id: &str) -> Option<McpServerRecord> {
        self.state
            .read()
            .await
            .mcp_servers
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    async fn storage_settings(&self) -> StorageSettings {
        self.state.read().await.storage.clone()
    }

    async fn artifact_exists(&self, pipeline_id: &str, run_id: &str, relative: &str) -> bool {
        let Some(safe) = safe_relative(relative) else {
            return false;
        };
        self.run_artifacts_dir(run_id).join(&safe).exists()
            || self.shared_artifacts_dir(pipeline_id).join(&safe).exists()
    }

    async fn write_artifact(
        &self,
        pipeline_id: &str,
        run_id: &str,
        relative: &str,
        contents: &str,
        shared: bool,
    ) -> Result<PathBuf> {
        let safe = safe_relative(relative).ok_or_else(|| {
            CadenceError::Internal(format!("unsafe artifact path '{relative}'"))
        })?;
        let root = if shared {
            self.shared_artifacts_dir(pipeline_id)
        } else {
            self.run_artifacts_dir(run_id)
        };
        let path = root.join(safe);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, contents).await?;
        Ok(path)
    }

    async fn load_scheduler_markers(&self) -> HashMap<String, String> {
        match fs::read_to_string(self.base.join(MARKERS_FILE)).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    async fn save_scheduler_markers(&self, markers: HashMap<String, String>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&markers)?;
        atomic_write(&self.base.join(MARKERS_FILE), &serialized).await
    }
}
