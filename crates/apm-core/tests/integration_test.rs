// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use apm_core::agent::Agent;
use apm_core::clock::ManualClock;
use apm_core::config::CoreConfig;
use apm_core::context;
use apm_core::errors::ExportError;
use apm_core::events::EventType;
use apm_core::harvest::HarvestOutcome;
use apm_core::trace_node::NodeKind;
use apm_core::transaction::{ErrorInfo, TransactionKind};
use common::mocks::MockExporter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn agent() -> (Agent, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let config = CoreConfig {
        sampling_seed: Some(1),
        max_harvest_retries: 1,
        ..CoreConfig::default()
    };
    (Agent::with_clock(config, clock.clone()), clock)
}

fn checkout(agent: &Agent, clock: &ManualClock) {
    let txn = agent.begin_transaction(TransactionKind::Web, "Uri/checkout");
    let current = agent.current_transaction().unwrap();
    let node = current.start_node(NodeKind::datastore("select", Some("carts")));
    clock.advance(Duration::from_millis(40));
    node.end();
    current.notice_error(ErrorInfo::new("PaymentDeclined", "card declined"));
    clock.advance(Duration::from_millis(10));
    txn.end();
    assert!(agent.current_transaction().is_none());
}

#[tokio::test]
async fn retriable_failure_carries_interval_into_the_next() {
    let (agent, clock) = agent();
    let exporter = Arc::new(MockExporter::default());
    let (scheduler, handle) =
        agent.harvest_scheduler(Arc::clone(&exporter), CancellationToken::new());
    let task = tokio::spawn(scheduler.run());

    checkout(&agent, &clock);
    checkout(&agent, &clock);
    exporter.fail_next(ExportError::Retriable("503 Service Unavailable".to_string()));
    assert_eq!(
        handle.flush().await.unwrap(),
        HarvestOutcome::Retrying {
            attempt: 1,
            dropped: 0
        }
    );

    checkout(&agent, &clock);
    assert_eq!(handle.flush().await.unwrap(), HarvestOutcome::Exported);

    let delivered = exporter.delivered();
    assert_eq!(delivered.len(), 1);
    let snapshot = &delivered[0];
    assert_eq!(snapshot.metrics.get("WebTransaction").unwrap().call_count, 3);
    assert_eq!(snapshot.metrics.get("Errors/all").unwrap().call_count, 3);
    assert_eq!(
        snapshot
            .metrics
            .get_scoped("Database/carts/select", "WebTransaction/Uri/checkout")
            .unwrap()
            .call_count,
        3
    );
    assert_eq!(snapshot.events(EventType::Transaction).seen, 3);
    assert_eq!(snapshot.events(EventType::Error).items.len(), 3);

    handle.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn repeated_failures_drop_the_interval() {
    let (agent, clock) = agent();
    let exporter = Arc::new(MockExporter::default());
    let (scheduler, handle) =
        agent.harvest_scheduler(Arc::clone(&exporter), CancellationToken::new());
    let task = tokio::spawn(scheduler.run());

    checkout(&agent, &clock);
    exporter.fail_next(ExportError::Retriable("timeout".to_string()));
    exporter.fail_next(ExportError::Retriable("timeout".to_string()));
    assert_eq!(
        handle.flush().await.unwrap(),
        HarvestOutcome::Retrying {
            attempt: 1,
            dropped: 0
        }
    );
    assert_eq!(handle.flush().await.unwrap(), HarvestOutcome::Dropped);
    assert_eq!(handle.flush().await.unwrap(), HarvestOutcome::Exported);

    exporter.fail_next(ExportError::NonRetriable("401 Unauthorized".to_string()));
    checkout(&agent, &clock);
    assert_eq!(handle.flush().await.unwrap(), HarvestOutcome::Rejected);

    handle.shutdown().unwrap();
    task.await.unwrap();

    assert_eq!(exporter.attempts(), 5);
    assert_eq!(exporter.delivered_count("WebTransaction"), 0);
    assert_eq!(
        exporter.delivered_count("Supportability/Harvest/Dropped"),
        1
    );
    assert_eq!(
        exporter.delivered_count("Supportability/Harvest/Rejected"),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_are_counted_once() {
    let (agent, _clock) = agent();
    let exporter = Arc::new(MockExporter::default());
    let (scheduler, handle) =
        agent.harvest_scheduler(Arc::clone(&exporter), CancellationToken::new());
    let task = tokio::spawn(scheduler.run());

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let agent = agent.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let txn =
                        agent.begin_detached(TransactionKind::Background, "Function/worker");
                    context::scope(txn, async {
                        let current = context::current().unwrap();
                        current.trace(NodeKind::function(format!("step{}", i % 3)), || ());
                        current.record_custom_metric("Jobs/processed", 0.001);
                        if worker == 0 {
                            tokio::task::yield_now().await;
                        }
                        current.end();
                    })
                    .await;
                }
            })
        })
        .collect();

    let mut flushes = Vec::new();
    for _ in 0..10 {
        flushes.push(handle.flush().await.unwrap());
        tokio::task::yield_now().await;
    }
    for worker in workers {
        worker.await.unwrap();
    }
    handle.shutdown().unwrap();
    task.await.unwrap();

    assert!(flushes
        .iter()
        .all(|o| matches!(o, HarvestOutcome::Exported | HarvestOutcome::Empty)));
    assert_eq!(exporter.delivered_count("OtherTransaction/all"), 400);
    assert_eq!(exporter.delivered_count("Custom/Jobs/processed"), 400);
}

#[tokio::test(start_paused = true)]
async fn events_harvest_runs_more_often_than_metrics() {
    let (agent, clock) = agent();
    let exporter = Arc::new(MockExporter::default());
    let (scheduler, handle) =
        agent.harvest_scheduler(Arc::clone(&exporter), CancellationToken::new());
    let task = tokio::spawn(scheduler.run());

    checkout(&agent, &clock);
    tokio::time::sleep(Duration::from_secs(6)).await;

    let delivered = exporter.delivered();
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].metrics.is_empty());
    assert_eq!(delivered[0].events(EventType::Transaction).items.len(), 1);

    tokio::time::sleep(Duration::from_secs(55)).await;
    let delivered = exporter.delivered();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].metrics.get("WebTransaction").unwrap().call_count, 1);
    assert_eq!(delivered[1].event_count(), 0);
    assert_eq!(delivered[1].traces.len(), 1);

    handle.cancellation_token().cancel();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_requests_are_merged_and_never_leak() {
    let (agent, clock) = agent();
    let exporter = Arc::new(MockExporter::default());
    let (scheduler, handle) =
        agent.harvest_scheduler(Arc::clone(&exporter), CancellationToken::new());
    let task = tokio::spawn(scheduler.run());

    let requests: Vec<_> = (0..4)
        .map(|_| {
            let agent = agent.clone();
            let clock = Arc::clone(&clock);
            tokio::spawn(context::isolate(async move {
                let txn = agent.begin_transaction(TransactionKind::Web, "Uri/aborted");
                let node = txn.start_node(NodeKind::external("payments", "reqwest", "POST"));
                clock.advance(Duration::from_millis(5));
                tokio::task::yield_now().await;
                drop(node);
                drop(txn);
                context::current().is_none()
            }))
        })
        .collect();
    for request in requests {
        assert!(request.await.unwrap());
    }

    handle.shutdown().unwrap();
    task.await.unwrap();
    assert_eq!(exporter.delivered_count("WebTransaction/Uri/aborted"), 4);
    assert_eq!(exporter.delivered_count("External/payments/all"), 4);
}
