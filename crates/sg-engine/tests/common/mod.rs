//! Shared doubles for the engine integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use sg_core::clock::ManualClock;
use sg_core::config::Config;
use sg_core::types::{Artifact, ConflictRecord, RunId, StepId};
use sg_engine::content::{
    AcceptanceCheck, AdapterRequest, ContentError, ContentGenerator, ContentRequest,
    GeneratedContent, TemplateGenerator,
};
use sg_engine::coordinator::TaskSpec;
use sg_engine::manifest::{ManifestError, ManifestStore, MemoryManifestStore, RunManifest};
use sg_engine::orchestrator::Orchestrator;

/// Generator whose behaviour per step is set by the test.
#[derive(Default)]
pub struct ScriptedGenerator {
    failing: Mutex<BTreeSet<StepId>>,
    graphs: BTreeMap<StepId, Vec<TaskSpec>>,
    adapters_fail: bool,
    calls: Mutex<Vec<StepId>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(self, step: &str) -> Self {
        self.failing.lock().unwrap().insert(step.to_string());
        self
    }

    pub fn with_tasks(mut self, step: &str, tasks: Vec<TaskSpec>) -> Self {
        self.graphs.insert(step.to_string(), tasks);
        self
    }

    pub fn without_adapters(mut self) -> Self {
        self.adapters_fail = true;
        self
    }

    /// Stop failing on `step`.
    pub fn heal(&self, step: &str) {
        self.failing.lock().unwrap().remove(step);
    }

    pub fn calls(&self) -> Vec<StepId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent, ContentError> {
        self.calls.lock().unwrap().push(request.step_id.clone());
        if self.failing.lock().unwrap().contains(&request.step_id) {
            return Err(ContentError::Failed(format!(
                "scripted failure for step {}",
                request.step_id
            )));
        }
        let tasks = if request.fans_out {
            self.graphs
                .get(&request.step_id)
                .cloned()
                .unwrap_or_else(TemplateGenerator::default_graph)
        } else {
            Vec::new()
        };
        Ok(GeneratedContent {
            artifacts: vec![Artifact::new(
                format!("{}.md", request.content_id),
                format!("# {}\n", request.content_id),
            )],
            tasks,
        })
    }

    async fn generate_adapter(&self, request: &AdapterRequest) -> Result<Vec<Artifact>, ContentError> {
        if self.adapters_fail {
            return Err(ContentError::Failed("no adapter".into()));
        }
        Ok(vec![Artifact::new(
            "adapter.md",
            format!("bridges {}", request.conflict.tasks.join(" and ")),
        )])
    }
}

/// Refuses every adapter.
pub struct RejectAll;

impl AcceptanceCheck for RejectAll {
    fn accept(&self, _conflict: &ConflictRecord, _adapter: &[Artifact]) -> bool {
        false
    }
}

/// Manifest store that refuses to save the runs it is told to.
pub struct FailingStore {
    inner: MemoryManifestStore,
    refused: Mutex<BTreeSet<RunId>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryManifestStore::new(),
            refused: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn refuse(&self, run_id: RunId) {
        self.refused.lock().unwrap().insert(run_id);
    }
}

#[async_trait]
impl ManifestStore for FailingStore {
    async fn save(&self, manifest: &RunManifest) -> Result<(), ManifestError> {
        if self.refused.lock().unwrap().contains(&manifest.run_id) {
            return Err(ManifestError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(manifest).await
    }

    async fn load(&self, run_id: RunId) -> Result<Option<RunManifest>, ManifestError> {
        self.inner.load(run_id).await
    }

    async fn list(&self) -> Result<Vec<RunManifest>, ManifestError> {
        self.inner.list().await
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryManifestStore>,
    pub generator: Arc<ScriptedGenerator>,
}

pub fn harness(generator: ScriptedGenerator) -> Harness {
    harness_with(Config::default(), generator)
}

pub fn harness_with(config: Config, generator: ScriptedGenerator) -> Harness {
    let clock = ManualClock::shared();
    let store = Arc::new(MemoryManifestStore::new());
    let generator = Arc::new(generator);
    let orchestrator = Orchestrator::new(config, generator.clone(), store.clone())
        .with_clock(clock.clone());
    Harness {
        orchestrator,
        clock,
        store,
        generator,
    }
}
