//! The content collaborator: whatever produces the artifacts and task graphs
//! behind each step. The engine treats it as an opaque call with a timeout
//! and a bounded number of retries.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use sg_core::types::{Artifact, ConflictRecord, RunId, StepId};

use crate::coordinator::TaskSpec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentError {
    #[error("content generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("content generation failed: {0}")]
    Failed(String),
    #[error("generator does not support {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, ContentError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRequest {
    pub run_id: RunId,
    pub workflow_type: String,
    pub step_id: StepId,
    pub content_id: String,
    /// Artifacts produced by earlier steps of the run, oldest first.
    pub context: Vec<Artifact>,
    /// Whether the step expects a task graph back.
    pub fans_out: bool,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

/// Input for an automatic adapter between incompatible task outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterRequest {
    pub run_id: RunId,
    pub conflict: ConflictRecord,
    /// Artifacts of the tasks involved in the conflict.
    pub artifacts: Vec<Artifact>,
    pub attempt: u32,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent>;

    async fn generate_adapter(&self, _request: &AdapterRequest) -> Result<Vec<Artifact>> {
        Err(ContentError::Unsupported("adapter generation"))
    }
}

/// Acceptance tests an adapter must pass before a conflict counts as
/// resolved.
pub trait AcceptanceCheck: Send + Sync {
    fn accept(&self, conflict: &ConflictRecord, adapter: &[Artifact]) -> bool;
}

/// Accepts any non-empty adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyAdapter;

impl AcceptanceCheck for NonEmptyAdapter {
    fn accept(&self, _conflict: &ConflictRecord, adapter: &[Artifact]) -> bool {
        !adapter.is_empty() && adapter.iter().all(|a| !a.body.trim().is_empty())
    }
}

/// Call the generator with a timeout, retrying up to `retries` more times.
pub async fn generate_with_retry(
    generator: &dyn ContentGenerator,
    request: &ContentRequest,
    timeout: Duration,
    retries: u32,
) -> Result<GeneratedContent> {
    let mut request = request.clone();
    let mut last_error = ContentError::Failed("no attempt made".into());
    for attempt in 0..=retries {
        request.attempt = attempt + 1;
        let outcome = match tokio::time::timeout(timeout, generator.generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ContentError::Timeout(timeout)),
        };
        match outcome {
            Ok(content) => return Ok(content),
            Err(e) => {
                tracing::warn!(
                    run_id = %request.run_id,
                    step_id = %request.step_id,
                    attempt = request.attempt,
                    error = %e,
                    "content generation attempt failed"
                );
                last_error = e;
            }
        }
    }
    Err(last_error)
}

// ---------------------------------------------------------------------------
// TemplateGenerator
// ---------------------------------------------------------------------------

/// Offline generator used by the CLI. Produces a placeholder document per
/// step and, for fan-out steps, a configured task graph.
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator {
    graphs: BTreeMap<StepId, Vec<TaskSpec>>,
}

impl TemplateGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(mut self, step_id: impl Into<StepId>, tasks: Vec<TaskSpec>) -> Self {
        self.graphs.insert(step_id.into(), tasks);
        self
    }

    /// Three tasks: a foundation and two pieces of work built on it.
    pub fn default_graph() -> Vec<TaskSpec> {
        vec![
            TaskSpec::new("T1").with_priority(0.9),
            TaskSpec::new("T2").after("T1").with_priority(0.6),
            TaskSpec::new("T3").after("T1").with_priority(0.5),
        ]
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(&self, request: &ContentRequest) -> Result<GeneratedContent> {
        let mut body = format!("# {}\n\n", request.content_id);
        for previous in &request.context {
            body.push_str(&format!("- builds on `{}`\n", previous.name));
        }
        let tasks = if request.fans_out {
            self.graphs
                .get(&request.step_id)
                .cloned()
                .unwrap_or_else(Self::default_graph)
        } else {
            Vec::new()
        };
        Ok(GeneratedContent {
            artifacts: vec![Artifact::new(format!("{}.md", request.content_id), body)],
            tasks,
        })
    }

    async fn generate_adapter(&self, request: &AdapterRequest) -> Result<Vec<Artifact>> {
        Ok(vec![Artifact::new(
            format!("adapter-{}.md", request.conflict.id),
            format!("adapter for: {}\n", request.conflict.description),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ContentGenerator for Flaky {
        async fn generate(&self, _request: &ContentRequest) -> Result<GeneratedContent> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(ContentError::Failed(format!("call {call}")))
            } else {
                Ok(GeneratedContent::default())
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl ContentGenerator for Slow {
        async fn generate(&self, _request: &ContentRequest) -> Result<GeneratedContent> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(GeneratedContent::default())
        }
    }

    fn request() -> ContentRequest {
        ContentRequest {
            run_id: Uuid::new_v4(),
            workflow_type: "feature".into(),
            step_id: "02".into(),
            content_id: "02-generate-prd".into(),
            context: Vec::new(),
            fans_out: false,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn retries_once_then_succeeds() {
        let gen = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 1,
        };
        let result = generate_with_retry(&gen, &request(), Duration::from_secs(1), 1).await;
        assert!(result.is_ok());
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_after_the_retry_budget() {
        let gen = Flaky {
            calls: AtomicU32::new(0),
            fail_first: 10,
        };
        let result = generate_with_retry(&gen, &request(), Duration::from_secs(1), 1).await;
        assert_eq!(result.unwrap_err(), ContentError::Failed("call 1".into()));
        assert_eq!(gen.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_generator_times_out() {
        let result = generate_with_retry(&Slow, &request(), Duration::from_millis(10), 0).await;
        assert!(matches!(result, Err(ContentError::Timeout(_))));
    }

    #[tokio::test]
    async fn template_generator_emits_graph_for_fan_out_steps() {
        let gen = TemplateGenerator::new();
        let mut req = request();
        assert!(gen.generate(&req).await.unwrap().tasks.is_empty());
        req.fans_out = true;
        let content = gen.generate(&req).await.unwrap();
        assert_eq!(content.tasks.len(), 3);
        assert_eq!(content.artifacts[0].name, "02-generate-prd.md");
    }
}
