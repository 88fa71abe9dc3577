//! Scenario: a limit of one gates admission across poll cycles.
//!
//! # Invariants under test
//!
//! - admission is earliest-deadline-first and stops at the first refusal
//!   instead of skipping ahead
//! - a run id never enters the in-flight set twice
//! - the slot frees only when the infrastructure run actually finishes

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;

#[tokio::test]
async fn limit_of_one_admits_one_run_at_a_time() {
    let journal = journal();
    let api = Arc::new(MockOrchestration::new(journal.clone()));
    let infra = Arc::new(MockInfrastructure::new(
        journal.clone(),
        InfraBehavior::HoldUntilReleased {
            identifier: "infra-hold".to_string(),
            status_code: 0,
        },
    ));

    let deployment = sample_deployment();
    let flow = sample_flow();
    let r1 = scheduled_run("r1", &deployment, &flow, chrono::Duration::seconds(1));
    let r2 = scheduled_run("r2", &deployment, &flow, chrono::Duration::seconds(2));
    let r3 = scheduled_run("r3", &deployment, &flow, chrono::Duration::seconds(3));
    api.set_pool(default_pool());
    api.insert_deployment(deployment);
    api.insert_flow(flow);
    // Deliberately out of order; the worker must sort by scheduled time.
    api.set_scheduled(vec![r3.clone(), r1.clone(), r2.clone()]);

    let mut worker = build_worker(&api, &infra, Some(1));
    worker.setup().await;

    let admitted = worker.get_and_submit_flow_runs().await.unwrap();
    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0].id, r1.id, "earliest-scheduled run goes first");

    // A second cycle while the first run is still executing admits nothing.
    let admitted = worker.get_and_submit_flow_runs().await.unwrap();
    assert!(admitted.is_empty(), "no admission while the slot is taken");

    // Let r1 finish; the next admission must be r2, the earliest remaining.
    infra.gate.add_permits(1);
    let mut admitted = Vec::new();
    for _ in 0..200 {
        admitted = worker.get_and_submit_flow_runs().await.unwrap();
        if !admitted.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0].id, r2.id);

    infra.gate.add_permits(1);
    worker.teardown().await;

    let run_entries: Vec<String> = journal
        .lock()
        .unwrap()
        .iter()
        .filter(|entry| entry.starts_with("run:"))
        .cloned()
        .collect();
    assert_eq!(
        run_entries,
        vec![format!("run:{}", r1.id), format!("run:{}", r2.id)],
        "each admitted run starts exactly once, in scheduled order"
    );
}
