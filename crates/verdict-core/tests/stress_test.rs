//! Stress Test - 1,000 parameters across a wide hierarchy
//!
//! Run with: cargo test --package verdict-core --test stress_test

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use verdict_core::prelude::*;
use verdict_core::ScopeRef;
use verdict_test_utils::{page, sql_param, tab, FolderConfig, Harness, InMemoryConfigStore, MockConnector};

const PAGES: usize = 20;
const TABS: usize = 5;
const PARAMS: usize = 10;

fn wide_folder() -> (InMemoryConfigStore, MockConnector, usize) {
    let mut connector = MockConnector::new().with_delay(Duration::from_millis(1));
    let mut folder = FolderConfig::new();
    let mut deferred = 0;
    let mut n = 0;

    for p in 0..PAGES {
        let mut tabs = Vec::new();
        for t in 0..TABS {
            let mut params = Vec::new();
            for i in 0..PARAMS {
                let query = format!("q-{n}");
                let mut param = sql_param(&format!("p{i}"), &query).expect(json!(n));
                match n % 7 {
                    0 => {
                        param = ParameterConfig::new(format!("p{i}"), "logs", query).deferred();
                        deferred += 1;
                    }
                    1 => {
                        param = param.synchronous();
                        connector = connector.respond(&query, json!(n));
                    }
                    // No response configured: the connector fails.
                    2 => {}
                    _ => connector = connector.respond(&query, json!(n)),
                }
                params.push(param);
                n += 1;
            }
            tabs.push(tab(&format!("t{t}"), params));
        }
        folder = folder.page(page(&format!("page{p}"), tabs));
    }

    (InMemoryConfigStore::new().with_folder("wide", folder), connector, deferred)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_test_wide_hierarchy_resolves_exactly_once() {
    println!("\n[STRESS TEST] Executing {} parameters...", PAGES * TABS * PARAMS);
    let start = Instant::now();

    let (store, connector, deferred) = wide_folder();
    let h = Harness::new(store, Arc::new(connector));
    let orch = h.orchestrator.clone();

    let id = orch.create_session(SessionRequest::new("wide")).await.unwrap();
    orch.execute(id, ExecutionConfig::new()).await.unwrap();
    assert!(h.wait_for_pending(deferred, Duration::from_secs(20)).await);
    println!("  {deferred} deferred requests parked");

    // Answer every request from its own task while a sweep races them.
    let mut answers = Vec::new();
    for (request, _) in h.search.started() {
        let orch = orch.clone();
        answers.push(tokio::spawn(async move {
            orch.on_deferred_result(&request, DeferredOutcome::Value(json!("late")))
                .await
        }));
    }
    let ttl = chrono::Duration::from_std(orch.config().deferred_ttl()).unwrap();
    let swept = orch.sweep_deferred(Utc::now() + ttl).await;

    let mut answered = 0;
    for answer in answers {
        if answer.await.unwrap() {
            answered += 1;
        }
    }
    assert_eq!(answered + swept, deferred, "each deferred request claimed exactly once");

    let settled = orch
        .wait_until_settled(id, Duration::from_secs(20))
        .await
        .unwrap()
        .expect("session settles");
    let duration = start.elapsed();
    println!("  Completed in {:.2}s", duration.as_secs_f64());

    assert_eq!(settled.state, SessionState::Resolved);
    // Failing connectors degrade, and nothing is worse than that here.
    assert_eq!(settled.status, Some(ValidationStatus::Degraded));

    let mut per_path: HashMap<String, usize> = HashMap::new();
    for resolved in h.sink.resolved() {
        *per_path.entry(resolved.path).or_default() += 1;
    }
    assert_eq!(per_path.len(), PAGES * TABS * PARAMS);
    assert!(per_path.values().all(|&count| count == 1), "a parameter resolved twice");

    let events = h.sink.events();
    let count = |f: fn(&ScopeRef) -> bool| {
        events
            .iter()
            .filter(|e| matches!(e, OrchestratorEvent::ScopeAggregated(a) if f(&a.scope)))
            .count()
    };
    assert_eq!(count(|s| matches!(s, ScopeRef::Tab(_))), PAGES * TABS);
    assert_eq!(count(|s| matches!(s, ScopeRef::Page(_))), PAGES);
    assert_eq!(count(|s| matches!(s, ScopeRef::Session)), 1);

    let [collection, validation] = orch.pool_stats();
    println!(
        "  collection: {} jobs, validation: {} jobs",
        collection.submitted, validation.submitted
    );
    assert!(collection.submitted > 0);
    assert_eq!(collection.failed + validation.failed, 0);

    orch.shutdown().await;
    println!("  ✓ Stress test passed\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_test_many_sessions_in_parallel() {
    let connector = MockConnector::new().respond("q", json!(1)).failing("backend down");
    let store = InMemoryConfigStore::new().with_folder(
        "small",
        FolderConfig::new().page(page(
            "P",
            vec![
                tab("A", vec![sql_param("x", "q"), sql_param("y", "q")]),
                tab("B", vec![sql_param("z", "q").synchronous()]),
            ],
        )),
    );
    let h = Harness::new(store, Arc::new(connector));

    let mut runs = Vec::new();
    for _ in 0..100 {
        let orch = h.orchestrator.clone();
        runs.push(tokio::spawn(async move {
            let id = orch.create_session(SessionRequest::new("small")).await.unwrap();
            orch.execute(id, ExecutionConfig::new()).await.unwrap();
            orch.wait_until_settled(id, Duration::from_secs(20)).await.unwrap()
        }));
    }

    for run in runs {
        let settled = run.await.unwrap().expect("session settles");
        assert_eq!(settled.status, Some(ValidationStatus::Degraded));
    }
    assert_eq!(h.sink.aggregated(ScopeRef::Session).len(), 100);
}
