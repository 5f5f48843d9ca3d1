use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use sg_core::context::RunContext;
use sg_core::definition::Cursor;
use sg_core::types::{ApprovalRecord, Artifact, RunId, RunStatus, StepId};

use crate::coordinator::CoordinatorSnapshot;
use crate::escalation::EscalationLog;
use crate::gate::{GatePolicy, PendingGate};
use crate::orchestrator::RunOptions;
use crate::run_state::{RunStateMachine, StepStage};

pub const MANIFEST_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported manifest version {0}")]
    Version(u32),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

// ---------------------------------------------------------------------------
// RunManifest
// ---------------------------------------------------------------------------

/// Everything needed to resume a run from its last committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub version: u32,
    pub run_id: RunId,
    pub workflow_type: String,
    pub options: RunOptions,
    pub policy: GatePolicy,
    pub context: RunContext,
    pub state: RunStateMachine,
    pub cursor: Cursor,
    pub stage: StepStage,
    #[serde(default)]
    pub pending_gate: Option<PendingGate>,
    #[serde(default)]
    pub coordinator: CoordinatorSnapshot,
    /// This run's approval records, in sequence order.
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
    #[serde(default)]
    pub escalations: EscalationLog,
    /// Artifacts of finished steps, oldest first.
    #[serde(default)]
    pub accumulated: Vec<Artifact>,
    #[serde(default)]
    pub completed_steps: Vec<StepId>,
    /// Last run-local sequence number handed out.
    pub last_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunManifest {
    pub fn status(&self) -> RunStatus {
        self.state.state()
    }
}

// ---------------------------------------------------------------------------
// ManifestStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn save(&self, manifest: &RunManifest) -> Result<()>;
    async fn load(&self, run_id: RunId) -> Result<Option<RunManifest>>;
    /// All stored manifests, most recently updated first.
    async fn list(&self) -> Result<Vec<RunManifest>>;
}

/// One pretty-printed JSON file per run under `<base>/runs/`. Writes go to a
/// temporary file that is renamed over the old manifest, so a crash leaves
/// either the previous or the new transaction on disk.
pub struct FileManifestStore {
    base_dir: PathBuf,
}

impl FileManifestStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    fn manifest_path(&self, run_id: RunId) -> PathBuf {
        self.runs_dir().join(format!("{}.json", run_id))
    }
}

#[async_trait]
impl ManifestStore for FileManifestStore {
    async fn save(&self, manifest: &RunManifest) -> Result<()> {
        tokio::fs::create_dir_all(self.runs_dir()).await?;
        let path = self.manifest_path(manifest.run_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(manifest)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::trace!(run_id = %manifest.run_id, path = %path.display(), "manifest saved");
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<RunManifest>> {
        let path = self.manifest_path(run_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest: RunManifest = serde_json::from_str(&data)?;
        if manifest.version != MANIFEST_VERSION {
            return Err(ManifestError::Version(manifest.version));
        }
        Ok(Some(manifest))
    }

    async fn list(&self) -> Result<Vec<RunManifest>> {
        let dir = self.runs_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut manifests = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(data) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            match serde_json::from_str::<RunManifest>(&data) {
                Ok(m) if m.version == MANIFEST_VERSION => manifests.push(m),
                Ok(m) => {
                    tracing::warn!(path = %path.display(), version = m.version, "skipping manifest with unsupported version")
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable manifest")
                }
            }
        }
        manifests.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(manifests)
    }
}

/// Keeps manifests in memory; for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryManifestStore {
    manifests: DashMap<RunId, RunManifest>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn save(&self, manifest: &RunManifest) -> Result<()> {
        self.manifests.insert(manifest.run_id, manifest.clone());
        Ok(())
    }

    async fn load(&self, run_id: RunId) -> Result<Option<RunManifest>> {
        Ok(self.manifests.get(&run_id).map(|m| m.clone()))
    }

    async fn list(&self) -> Result<Vec<RunManifest>> {
        let mut all: Vec<RunManifest> = self.manifests.iter().map(|m| m.clone()).collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }
}
