//! File-backed manifest store.

mod common;

use std::sync::Arc;

use common::ScriptedGenerator;
use sg_core::config::Config;
use sg_core::types::{HumanResponse, Mode, RunStatus};
use sg_engine::manifest::{FileManifestStore, ManifestError, ManifestStore, MANIFEST_VERSION};
use sg_engine::orchestrator::{Orchestrator, RunOptions};
use sg_engine::run_state::StepStage;
use uuid::Uuid;

fn orchestrator(dir: &std::path::Path) -> Orchestrator {
    Orchestrator::new(
        Config::default(),
        Arc::new(ScriptedGenerator::new()),
        Arc::new(FileManifestStore::new(dir)),
    )
}

#[tokio::test]
async fn test_every_transaction_is_written_to_disk() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let report = orch
        .start_run("feature", RunOptions::new(Mode::Guided))
        .await
        .unwrap();
    let run_id = report.run_id;

    let store = FileManifestStore::new(dir.path());
    let manifest = store.load(run_id).await.unwrap().unwrap();
    assert_eq!(manifest.version, MANIFEST_VERSION);
    assert_eq!(manifest.status(), RunStatus::PausedForGate);
    assert!(manifest.pending_gate.is_some());
    assert!(store.runs_dir().join(format!("{run_id}.json")).exists());

    orch.respond_to_gate(run_id, HumanResponse::Approve)
        .await
        .unwrap();
    let manifest = store.load(run_id).await.unwrap().unwrap();
    assert_eq!(manifest.completed_steps, vec!["01".to_string()]);
    assert_eq!(manifest.approvals.len(), 1);
    assert_eq!(manifest.last_seq, 1);
    assert!(matches!(manifest.stage, StepStage::AwaitingApproval { .. }));
}

#[tokio::test]
async fn test_missing_directory_and_run_are_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileManifestStore::new(dir.path().join("never-created"));
    assert!(store.list().await.unwrap().is_empty());
    assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_list_skips_unreadable_and_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let first = orch
        .start_run("feature", RunOptions::new(Mode::Guided))
        .await
        .unwrap();
    let second = orch
        .start_run("enterprise", RunOptions::new(Mode::Autonomous))
        .await
        .unwrap();

    let store = FileManifestStore::new(dir.path());
    std::fs::write(store.runs_dir().join("broken.json"), "{ not json").unwrap();
    std::fs::write(store.runs_dir().join("notes.txt"), "ignore me").unwrap();

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    let mut ids: Vec<Uuid> = listed.iter().map(|m| m.run_id).collect();
    ids.sort();
    let mut expected = vec![first.run_id, second.run_id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_unsupported_version_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(dir.path());
    let report = orch
        .start_run("feature", RunOptions::new(Mode::Guided))
        .await
        .unwrap();

    let store = FileManifestStore::new(dir.path());
    let path = store.runs_dir().join(format!("{}.json", report.run_id));
    let mut raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    raw["version"] = serde_json::json!(MANIFEST_VERSION + 1);
    std::fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

    assert!(matches!(
        store.load(report.run_id).await,
        Err(ManifestError::Version(v)) if v == MANIFEST_VERSION + 1
    ));
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let run_id = {
        let orch = orchestrator(dir.path());
        let report = orch
            .start_run("feature", RunOptions::new(Mode::Guided))
            .await
            .unwrap();
        orch.respond_to_gate(report.run_id, HumanResponse::Reject)
            .await
            .unwrap();
        report.run_id
    };

    let orch = orchestrator(dir.path());
    assert_eq!(orch.resume_all().await.unwrap(), vec![run_id]);
    let report = orch.status(run_id).await.unwrap();
    assert!(report.stage.is_blocked());
    assert_eq!(report.approvals, 1);
    assert!(!report.open_escalations.is_empty());

    let report = orch.reopen_gate(run_id).await.unwrap();
    assert!(report.pending_gate.is_some());
}
