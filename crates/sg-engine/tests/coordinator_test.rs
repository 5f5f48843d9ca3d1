//! Task claiming, dependency release, lease expiry and conflict handling.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RejectAll, ScriptedGenerator};
use sg_core::clock::{ManualClock, SequenceCounter};
use sg_core::config::CoordinatorConfig;
use sg_core::types::{
    Artifact, ConflictKind, ConflictStatus, ResolutionStrategy, TaskStatus,
};
use sg_engine::content::NonEmptyAdapter;
use sg_engine::coordinator::{
    ClaimOutcome, ClaimRequest, ConflictSignal, Coordinator, CoordinatorError, RejectReason,
    TaskSpec,
};
use uuid::Uuid;

fn coordinator(clock: Arc<ManualClock>) -> Coordinator {
    Coordinator::new(
        Uuid::new_v4(),
        CoordinatorConfig::default(),
        clock,
        Arc::new(SequenceCounter::new()),
    )
}

async fn with_agents(c: &Coordinator, agents: &[&str]) {
    for agent in agents {
        c.register_agent(*agent, Vec::<String>::new()).await;
    }
}

// ===========================================================================
// Claims
// ===========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_claims_have_one_winner() {
    let c = Arc::new(coordinator(ManualClock::shared()));
    c.load_graph(vec![TaskSpec::new("T1")]).await.unwrap();
    let agents: Vec<String> = (0..16).map(|i| format!("agent-{i:02}")).collect();
    for agent in &agents {
        c.register_agent(agent.clone(), Vec::<String>::new()).await;
    }

    let handles: Vec<_> = agents
        .iter()
        .map(|agent| {
            let c = c.clone();
            let request = ClaimRequest::new(agent.clone(), "T1");
            tokio::spawn(async move { c.claim(request).await })
        })
        .collect();
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let granted: Vec<&ClaimOutcome> = outcomes.iter().filter(|o| o.is_granted()).collect();
    assert_eq!(granted.len(), 1);
    assert!(outcomes
        .iter()
        .filter(|o| !o.is_granted())
        .all(|o| o.reject_reason() == Some(RejectReason::AlreadyClaimed)));
    let ClaimOutcome::Granted(grant) = granted[0] else {
        unreachable!()
    };
    assert_eq!(c.holder("T1").await, Some(grant.agent.clone()));
}

#[tokio::test]
async fn test_contention_goes_to_the_higher_priority_request() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("T1")]).await.unwrap();
    with_agents(&c, &["A1", "A2"]).await;

    let results = c
        .claim_batch(vec![
            ClaimRequest::new("A2", "T1").with_priority(0.6),
            ClaimRequest::new("A1", "T1").with_priority(0.9),
        ])
        .await;
    assert_eq!(results.len(), 2);
    for (request, outcome) in &results {
        match request.agent.as_str() {
            "A1" => assert!(outcome.is_granted()),
            "A2" => assert_eq!(outcome.reject_reason(), Some(RejectReason::AlreadyClaimed)),
            other => panic!("unexpected agent {other}"),
        }
    }

    let conflicts = c.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.kind, ConflictKind::ClaimContention);
    assert_eq!(conflict.strategy, Some(ResolutionStrategy::PriorityScore));
    assert_eq!(conflict.status, ConflictStatus::Resolved);
    assert_eq!(conflict.agents, vec!["A1".to_string(), "A2".to_string()]);
}

#[tokio::test]
async fn test_equal_scores_fall_back_to_agent_id() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("T1")]).await.unwrap();
    with_agents(&c, &["B", "A"]).await;
    let at = chrono::Utc::now();

    let results = c
        .claim_batch(vec![
            ClaimRequest::new("B", "T1").at(at),
            ClaimRequest::new("A", "T1").at(at),
        ])
        .await;
    let winner = results.iter().find(|(_, o)| o.is_granted()).unwrap();
    assert_eq!(winner.0.agent, "A");
}

#[tokio::test]
async fn test_claim_rejections() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("X"), TaskSpec::new("Y").after("X")])
        .await
        .unwrap();
    with_agents(&c, &["A1"]).await;

    let reject = |o: ClaimOutcome| o.reject_reason();
    assert_eq!(
        reject(c.claim(ClaimRequest::new("ghost", "X")).await),
        Some(RejectReason::UnknownAgent)
    );
    assert_eq!(
        reject(c.claim(ClaimRequest::new("A1", "nope")).await),
        Some(RejectReason::UnknownTask)
    );
    assert_eq!(
        reject(c.claim(ClaimRequest::new("A1", "Y")).await),
        Some(RejectReason::DependenciesPending)
    );
}

// ===========================================================================
// Dependencies
// ===========================================================================

#[tokio::test]
async fn test_completion_unblocks_dependents_in_the_same_transaction() {
    let c = coordinator(ManualClock::shared());
    let summary = c
        .load_graph(vec![TaskSpec::new("X"), TaskSpec::new("Y").after("X")])
        .await
        .unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.available, 1);
    with_agents(&c, &["A1"]).await;

    assert!(c.claim(ClaimRequest::new("A1", "X")).await.is_granted());
    let completion = c
        .complete("A1", "X", vec![Artifact::new("x.rs", "fn x() {}")])
        .await
        .unwrap();
    assert_eq!(completion.unblocked, vec!["Y".to_string()]);
    assert_eq!(c.task_status("Y").await, Some(TaskStatus::Available));
    assert!(c.claim(ClaimRequest::new("A1", "Y")).await.is_granted());
}

#[tokio::test]
async fn test_only_the_holder_can_complete() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("X")]).await.unwrap();
    with_agents(&c, &["A1", "A2"]).await;
    assert!(c.claim(ClaimRequest::new("A1", "X")).await.is_granted());

    assert!(matches!(
        c.complete("A2", "X", vec![]).await,
        Err(CoordinatorError::NotHolder { .. })
    ));
    assert_eq!(c.task_status("X").await, Some(TaskStatus::Claimed));
}

#[tokio::test]
async fn test_unknown_dependency_is_rejected() {
    let c = coordinator(ManualClock::shared());
    assert!(matches!(
        c.load_graph(vec![TaskSpec::new("Y").after("missing")]).await,
        Err(CoordinatorError::Validation(_))
    ));
    assert!(c.available_tasks().await.is_empty());
}

#[tokio::test]
async fn test_cycle_is_escalated() {
    let c = coordinator(ManualClock::shared());
    let err = c
        .load_graph(vec![
            TaskSpec::new("A").after("C"),
            TaskSpec::new("B").after("A"),
            TaskSpec::new("C").after("B"),
        ])
        .await
        .unwrap_err();
    let CoordinatorError::CyclicDependency { cycle, conflict_id } = err else {
        panic!("expected a cycle, got {err:?}");
    };
    assert!(cycle.len() >= 3);
    let conflict = c.conflict(conflict_id).await.unwrap();
    assert_eq!(conflict.kind, ConflictKind::CyclicDependency);
    assert_eq!(conflict.status, ConflictStatus::Escalated);
}

// ===========================================================================
// Leases
// ===========================================================================

#[tokio::test]
async fn test_expired_lease_without_waiters_is_recycled_silently() {
    let clock = ManualClock::shared();
    let c = coordinator(clock.clone());
    c.load_graph(vec![TaskSpec::new("Z")]).await.unwrap();
    with_agents(&c, &["A1"]).await;
    assert!(c
        .claim(ClaimRequest::new("A1", "Z").with_estimate(Duration::from_secs(60)))
        .await
        .is_granted());

    // Estimate plus the default one-minute grace.
    clock.advance(Duration::from_secs(119));
    assert!(c.expire_leases().await.is_empty());
    clock.advance(Duration::from_secs(2));
    let expired = c.expire_leases().await;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].reassigned_to, None);

    assert_eq!(c.task_status("Z").await, Some(TaskStatus::Available));
    assert!(c.conflicts().await.is_empty());
}

#[tokio::test]
async fn test_expired_lease_goes_to_waiting_agent() {
    let clock = ManualClock::shared();
    let c = coordinator(clock.clone());
    c.load_graph(vec![TaskSpec::new("Z")]).await.unwrap();
    with_agents(&c, &["A1", "A2"]).await;
    assert!(c
        .claim(ClaimRequest::new("A1", "Z").with_estimate(Duration::from_secs(60)))
        .await
        .is_granted());
    assert_eq!(
        c.claim(ClaimRequest::new("A2", "Z")).await.reject_reason(),
        Some(RejectReason::AlreadyClaimed)
    );

    clock.advance(Duration::from_secs(121));
    let expired = c.expire_leases().await;
    assert_eq!(expired[0].reassigned_to.as_deref(), Some("A2"));
    assert_eq!(c.holder("Z").await.as_deref(), Some("A2"));

    let conflicts = c.conflicts().await;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].kind, ConflictKind::ClaimContention);
    assert_eq!(conflicts[0].status, ConflictStatus::Resolved);
}

#[tokio::test]
async fn test_released_task_goes_to_waiting_agent() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("Z")]).await.unwrap();
    with_agents(&c, &["A1", "A2"]).await;
    assert!(c.claim(ClaimRequest::new("A1", "Z")).await.is_granted());
    assert_eq!(
        c.claim(ClaimRequest::new("A2", "Z")).await.reject_reason(),
        Some(RejectReason::AlreadyClaimed)
    );

    let next = c.release("A1", "Z").await.unwrap();
    assert_eq!(next.as_deref(), Some("A2"));
    assert_eq!(c.holder("Z").await.as_deref(), Some("A2"));
    assert_eq!(c.task_status("Z").await, Some(TaskStatus::Claimed));

    // The wait list was consumed: releasing again returns the task to the pool.
    assert_eq!(c.release("A2", "Z").await.unwrap(), None);
    assert_eq!(c.task_status("Z").await, Some(TaskStatus::Available));
    assert!(c.conflicts().await.is_empty());
}

// ===========================================================================
// Conflicts
// ===========================================================================

#[tokio::test]
async fn test_exhausted_agent_is_throttled_and_task_reassigned() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("T1"), TaskSpec::new("T2")])
        .await
        .unwrap();
    with_agents(&c, &["A1", "A2"]).await;
    assert!(c.claim(ClaimRequest::new("A1", "T1")).await.is_granted());
    c.claim(ClaimRequest::new("A2", "T1")).await;

    let conflict = c.report_exhaustion("A1", "rate limited").await.unwrap();
    assert_eq!(conflict.kind, ConflictKind::ResourceExhaustion);
    assert_eq!(conflict.strategy, Some(ResolutionStrategy::ThrottleAndRedistribute));
    assert_eq!(conflict.status, ConflictStatus::Resolved);
    assert_eq!(c.holder("T1").await.as_deref(), Some("A2"));

    assert_eq!(
        c.claim(ClaimRequest::new("A1", "T2")).await.reject_reason(),
        Some(RejectReason::Throttled)
    );
    c.unthrottle("A1").await.unwrap();
    assert!(c.claim(ClaimRequest::new("A1", "T2")).await.is_granted());
}

#[tokio::test]
async fn test_accepted_adapter_resolves_incompatibility() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("T1"), TaskSpec::new("T2")])
        .await
        .unwrap();
    let reported = c
        .report_incompatibility(vec!["T1".into(), "T2".into()], vec![], "date formats differ")
        .await
        .unwrap();
    assert_eq!(reported.status, ConflictStatus::Open);
    assert_eq!(c.task_status("T2").await, Some(TaskStatus::Conflicted));

    let generator = ScriptedGenerator::new();
    let resolved = c
        .resolve_incompatibility(reported.id, &generator, &NonEmptyAdapter)
        .await
        .unwrap();
    assert_eq!(resolved.status, ConflictStatus::Resolved);
    assert_eq!(resolved.strategy, Some(ResolutionStrategy::AdapterGeneration));
    assert_eq!(resolved.attempts, 1);
    assert_eq!(c.task_status("T2").await, Some(TaskStatus::Available));
}

#[tokio::test]
async fn test_refused_adapter_escalates_incompatibility() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("T1"), TaskSpec::new("T2")])
        .await
        .unwrap();
    let reported = c
        .report_incompatibility(vec!["T1".into(), "T2".into()], vec![], "enum mismatch")
        .await
        .unwrap();

    let generator = ScriptedGenerator::new();
    let escalated = c
        .resolve_incompatibility(reported.id, &generator, &RejectAll)
        .await
        .unwrap();
    assert_eq!(escalated.status, ConflictStatus::Escalated);
    assert_eq!(c.unresolved_conflicts().await.len(), 1);
    assert_eq!(c.task_status("T1").await, Some(TaskStatus::Conflicted));

    let closed = c.resolve_conflict(reported.id, "use the v2 enum").await.unwrap();
    assert_eq!(closed.strategy, Some(ResolutionStrategy::HumanOverride));
    assert_eq!(c.task_status("T1").await, Some(TaskStatus::Available));
    assert!(matches!(
        c.resolve_conflict(reported.id, "again").await,
        Err(CoordinatorError::ConflictClosed(_))
    ));
}

#[tokio::test]
async fn test_simultaneous_signals_are_handled_in_policy_order() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("T1"), TaskSpec::new("T2")])
        .await
        .unwrap();
    with_agents(&c, &["A1"]).await;
    assert!(c.claim(ClaimRequest::new("A1", "T1")).await.is_granted());

    let results = c
        .apply_signals(
            vec![
                ConflictSignal::Exhaustion {
                    agent: "A1".into(),
                    description: "out of tokens".into(),
                },
                ConflictSignal::Incompatibility {
                    tasks: vec!["T2".into()],
                    agents: vec!["A1".into()],
                    description: "header mismatch".into(),
                },
            ],
            &ScriptedGenerator::new(),
            &NonEmptyAdapter,
        )
        .await;
    let records: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(records[0].kind, ConflictKind::InterfaceIncompatibility);
    assert_eq!(records[1].kind, ConflictKind::ResourceExhaustion);
    assert!(records[0].seq < records[1].seq);
}

// ===========================================================================
// Snapshots
// ===========================================================================

#[tokio::test]
async fn test_restored_graph_drops_live_claims() {
    let c = coordinator(ManualClock::shared());
    c.load_graph(vec![TaskSpec::new("X"), TaskSpec::new("Y").after("X")])
        .await
        .unwrap();
    with_agents(&c, &["A1"]).await;
    assert!(c.claim(ClaimRequest::new("A1", "X")).await.is_granted());
    let snapshot = c.snapshot().await;

    let restored = coordinator(ManualClock::shared());
    restored.restore(snapshot).await;
    assert_eq!(restored.task_status("X").await, Some(TaskStatus::Available));
    assert_eq!(restored.task_status("Y").await, Some(TaskStatus::Blocked));
    assert_eq!(restored.holder("X").await, None);
    assert!(restored.claim(ClaimRequest::new("A1", "X")).await.is_granted());
}
