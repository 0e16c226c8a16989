//! Session lifecycle: creation, execution modes, re-execution and expiry

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use verdict_core::prelude::*;
use verdict_core::{spawn_sweeper, ScopeRef};
use verdict_test_utils::{
    deferred_param, optional_key, page, required_key, sql_param, tab, test_config, FolderConfig,
    Harness, InMemoryConfigStore, MockConnector,
};

const WAIT: Duration = Duration::from_secs(5);

fn orders_folder() -> FolderConfig {
    FolderConfig::new()
        .key(required_key("account"))
        .key(optional_key("region", "eu"))
        .common(sql_param(
            "customer_id",
            "select id from customers where acc = ${account} and region = '${region}'",
        )
        .expect(json!("C-7")))
        .page(page(
            "Orders",
            vec![tab(
                "Open",
                vec![sql_param("state", "select state from orders where customer = '${customer_id}'")
                    .expect(json!("open"))],
            )],
        ))
        .page(page(
            "Invoices",
            vec![tab(
                "Paid",
                vec![ParameterConfig::preconfigured("currency", json!("EUR")).expect(json!("EUR"))],
            )],
        ))
}

fn orders_connector() -> Arc<MockConnector> {
    Arc::new(
        MockConnector::new()
            .respond(
                "select id from customers where acc = 42 and region = 'eu'",
                json!("C-7"),
            )
            .respond("select state from orders where customer = 'C-7'", json!("open")),
    )
}

async fn settle(h: &Harness, id: SessionId) -> SessionSnapshot {
    h.orchestrator
        .wait_until_settled(id, WAIT)
        .await
        .unwrap()
        .expect("session settles")
}

#[tokio::test]
async fn common_values_feed_page_queries() {
    let connector = orders_connector();
    let h = Harness::new(
        InMemoryConfigStore::new().with_folder("orders", orders_folder()),
        connector.clone(),
    );
    let orch = &h.orchestrator;

    let id = orch
        .create_session(SessionRequest::new("orders").with_key("account", "42"))
        .await
        .unwrap();
    orch.execute(id, ExecutionConfig::new()).await.unwrap();

    let settled = settle(&h, id).await;
    assert_eq!(settled.status, Some(ValidationStatus::Passed));
    assert_eq!(settled.common_status, Some(ValidationStatus::Passed));
    assert_eq!(settled.variables.get("customer_id").map(String::as_str), Some("C-7"));
    assert_eq!(settled.variables.get("region").map(String::as_str), Some("eu"));

    let queries: Vec<String> = connector.calls().into_iter().map(|c| c.query).collect();
    assert!(queries.contains(&"select state from orders where customer = 'C-7'".to_string()));
    assert_eq!(h.sink.aggregated(ScopeRef::Common).len(), 1);
}

#[tokio::test]
async fn missing_required_key_is_rejected() {
    let h = Harness::new(
        InMemoryConfigStore::new().with_folder("orders", orders_folder()),
        orders_connector(),
    );

    let err = h
        .orchestrator
        .create_session(SessionRequest::new("orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, VerdictError::InvalidRequest(_)));
    assert!(err.is_surfaced());
}

#[tokio::test]
async fn unknown_folder_session_and_page_surface() {
    let h = Harness::new(
        InMemoryConfigStore::new().with_folder("orders", orders_folder()),
        orders_connector(),
    );
    let orch = &h.orchestrator;

    let err = orch.create_session(SessionRequest::new("nowhere")).await.unwrap_err();
    assert!(matches!(err, VerdictError::NotFound { .. }));

    let err = orch.execute(SessionId::new(), ExecutionConfig::new()).await.unwrap_err();
    assert!(matches!(err, VerdictError::NotFound { .. }));

    let id = orch
        .create_session(SessionRequest::new("orders").with_key("account", "42"))
        .await
        .unwrap();
    let err = orch
        .execute(id, ExecutionConfig::new().with_pages(["Shipping"]))
        .await
        .unwrap_err();
    assert!(matches!(err, VerdictError::InvalidRequest(_)));
    assert_eq!(orch.snapshot(id).unwrap().state, SessionState::Created);
}

#[tokio::test]
async fn preconfigured_only_runs_inline_without_connectors() {
    let connector = orders_connector();
    let h = Harness::new(
        InMemoryConfigStore::new().with_folder("orders", orders_folder()),
        connector.clone(),
    );
    let orch = &h.orchestrator;

    let id = orch
        .create_session(SessionRequest::new("orders").with_key("account", "42"))
        .await
        .unwrap();
    orch.execute(id, ExecutionConfig::new().preconfigured_only())
        .await
        .unwrap();

    // Everything ran on the caller: resolved without waiting.
    let snapshot = orch.snapshot(id).unwrap();
    assert_eq!(snapshot.state, SessionState::Resolved);
    assert_eq!(connector.call_count(), 0);

    let invoices = snapshot.page("Invoices").unwrap();
    assert_eq!(invoices.status, Some(ValidationStatus::Passed));
    let orders = snapshot.page("Orders").unwrap();
    assert!(orders.tab("Open").unwrap().parameters.is_empty());
    assert_eq!(orders.status, Some(ValidationStatus::None));
}

#[tokio::test]
async fn selected_pages_and_common_only() {
    let connector = orders_connector();
    let h = Harness::new(
        InMemoryConfigStore::new().with_folder("orders", orders_folder()),
        connector.clone(),
    );
    let orch = &h.orchestrator;
    let id = orch
        .create_session(SessionRequest::new("orders").with_key("account", "42"))
        .await
        .unwrap();

    orch.execute(id, ExecutionConfig::new().common_only()).await.unwrap();
    let settled = settle(&h, id).await;
    assert!(settled.pages.is_empty());
    assert_eq!(settled.status, Some(ValidationStatus::Passed));
    assert_eq!(connector.call_count(), 1);

    orch.execute(id, ExecutionConfig::new().with_pages(["Invoices"]))
        .await
        .unwrap();
    let settled = settle(&h, id).await;
    assert_eq!(settled.pages.len(), 1);
    assert_eq!(settled.pages[0].name, "Invoices");
    // Common parameters were already loaded.
    assert_eq!(connector.call_count(), 1);
}

#[tokio::test]
async fn pot_generation_collects_every_page() {
    let h = Harness::new(
        InMemoryConfigStore::new().with_folder("orders", orders_folder()),
        orders_connector(),
    );
    let orch = &h.orchestrator;
    let id = orch
        .create_session(SessionRequest::new("orders").with_key("account", "42"))
        .await
        .unwrap();

    orch.execute(id, ExecutionConfig::new().with_pages(["Invoices"]).pot_generation())
        .await
        .unwrap();
    let settled = settle(&h, id).await;
    assert_eq!(settled.pages.len(), 2);
}

#[tokio::test]
async fn re_execution_and_forced_reload() {
    let connector = orders_connector();
    let h = Harness::new(
        InMemoryConfigStore::new().with_folder("orders", orders_folder()),
        connector.clone(),
    );
    let orch = &h.orchestrator;
    let id = orch
        .create_session(SessionRequest::new("orders").with_key("account", "42"))
        .await
        .unwrap();

    orch.execute(id, ExecutionConfig::new()).await.unwrap();
    settle(&h, id).await;
    assert_eq!(connector.call_count(), 2);

    orch.execute(id, ExecutionConfig::new()).await.unwrap();
    let settled = settle(&h, id).await;
    assert_eq!(settled.status, Some(ValidationStatus::Passed));
    assert_eq!(connector.call_count(), 3);

    orch.execute(id, ExecutionConfig::new().forced_reload())
        .await
        .unwrap();
    settle(&h, id).await;
    assert_eq!(connector.call_count(), 5);
    assert_eq!(h.sink.aggregated(ScopeRef::Session).len(), 3);
}

fn waiting_folder() -> InMemoryConfigStore {
    InMemoryConfigStore::new().with_folder(
        "logs",
        FolderConfig::new().page(page(
            "Audit",
            vec![tab("Trail", vec![deferred_param("entries", "trail")])],
        )),
    )
}

#[tokio::test]
async fn executing_a_running_session_is_busy() {
    let h = Harness::new(waiting_folder(), Arc::new(MockConnector::new()));
    let orch = &h.orchestrator;
    let id = orch.create_session(SessionRequest::new("logs")).await.unwrap();

    orch.execute(id, ExecutionConfig::new()).await.unwrap();
    assert!(h.wait_for_pending(1, WAIT).await);

    let err = orch.execute(id, ExecutionConfig::new()).await.unwrap_err();
    assert!(matches!(err, VerdictError::DuplicateRequest(_)));
}

#[tokio::test]
async fn expiry_cancels_outstanding_requests() {
    let h = Harness::new(waiting_folder(), Arc::new(MockConnector::new()));
    let orch = &h.orchestrator;
    let id = orch.create_session(SessionRequest::new("logs")).await.unwrap();
    let mut events = orch.subscribe();

    orch.execute(id, ExecutionConfig::new()).await.unwrap();
    assert!(h.wait_for_pending(1, WAIT).await);
    let request = h.search.request_for("Audit/Trail/entries").unwrap();
    let session = orch.session(id).unwrap();

    // Not idle long enough yet.
    assert!(orch.sweep_sessions(Utc::now()).await.is_empty());

    let ttl = chrono::Duration::from_std(orch.config().session_ttl()).unwrap();
    let expired = orch
        .sweep_sessions(Utc::now() + ttl + chrono::Duration::seconds(1))
        .await;
    assert_eq!(expired, vec![id]);

    assert_eq!(h.search.cancelled(), vec![request.clone()]);
    assert_eq!(orch.pending_deferred(), 0);
    assert!(matches!(orch.snapshot(id), Err(VerdictError::NotFound { .. })));
    assert!(!orch.on_deferred_result(&request, DeferredOutcome::Value(json!(1))).await);
    assert!(
        h.sink
            .wait_for(
                |e| matches!(e, OrchestratorEvent::SessionExpired { session } if *session == id),
                WAIT,
            )
            .await
    );

    let mut saw_expiry = false;
    while let Ok(event) = events.try_recv() {
        saw_expiry |= event == OrchestratorEvent::SessionExpired { session: id };
    }
    assert!(saw_expiry);

    // The forced resolution never passes for a verdict.
    assert_eq!(session.state(), SessionState::Expired);
    assert_eq!(session.status(), None);
    assert!(h.sink.aggregated(ScopeRef::Session).is_empty());
    let tabs: Vec<_> = h
        .sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, OrchestratorEvent::ScopeAggregated(a) if matches!(a.scope, ScopeRef::Tab(_))))
        .collect();
    assert_eq!(tabs.len(), 1);
    assert_eq!(
        h.sink.events().last(),
        Some(&OrchestratorEvent::SessionExpired { session: id })
    );
}

#[tokio::test]
async fn touch_postpones_expiry() {
    let h = Harness::new(waiting_folder(), Arc::new(MockConnector::new()));
    let orch = &h.orchestrator;
    let id = orch.create_session(SessionRequest::new("logs")).await.unwrap();

    let ttl = chrono::Duration::from_std(orch.config().session_ttl()).unwrap();
    let almost = Utc::now() + ttl - chrono::Duration::seconds(5);
    assert!(orch.sweep_sessions(almost).await.is_empty());

    orch.touch(id).unwrap();
    assert!(orch.session_ids().contains(&id));
}

#[tokio::test]
async fn refused_search_degrades_parameter() {
    let h = Harness::new(waiting_folder(), Arc::new(MockConnector::new()));
    h.search.refuse("search cluster unavailable");
    let orch = &h.orchestrator;
    let id = orch.create_session(SessionRequest::new("logs")).await.unwrap();

    orch.execute(id, ExecutionConfig::new()).await.unwrap();
    let settled = settle(&h, id).await;
    assert_eq!(settled.status, Some(ValidationStatus::Degraded));
    assert_eq!(orch.pending_deferred(), 0);
}

fn fast_sweeping() -> OrchestratorConfig {
    let mut config = test_config();
    config.sweep_interval_ms = 20;
    config
}

#[tokio::test]
async fn background_sweeper_times_out_deferred_requests() {
    let config = fast_sweeping().with_deferred_ttl(Duration::from_secs(1));
    let h = Harness::with_config(waiting_folder(), Arc::new(MockConnector::new()), config);
    let orch = &h.orchestrator;
    let sweeper = spawn_sweeper(orch.clone());

    let id = orch.create_session(SessionRequest::new("logs")).await.unwrap();
    orch.execute(id, ExecutionConfig::new()).await.unwrap();
    assert!(h.wait_for_pending(1, WAIT).await);

    let settled = settle(&h, id).await;
    assert_eq!(settled.state, SessionState::Resolved);
    assert_eq!(settled.status, Some(ValidationStatus::Degraded));
    assert_eq!(orch.pending_deferred(), 0);
    assert_eq!(h.search.cancelled().len(), 1);

    sweeper.shutdown().await;
}

#[tokio::test]
async fn background_sweeper_expires_idle_sessions() {
    let config = fast_sweeping().with_session_ttl(Duration::from_secs(1));
    let h = Harness::with_config(waiting_folder(), Arc::new(MockConnector::new()), config);
    let orch = &h.orchestrator;
    let sweeper = spawn_sweeper(orch.clone());

    let id = orch.create_session(SessionRequest::new("logs")).await.unwrap();
    orch.execute(id, ExecutionConfig::new()).await.unwrap();
    assert!(h.wait_for_pending(1, WAIT).await);

    assert!(
        h.sink
            .wait_for(
                |e| matches!(e, OrchestratorEvent::SessionExpired { session } if *session == id),
                WAIT,
            )
            .await
    );
    assert!(matches!(orch.snapshot(id), Err(VerdictError::NotFound { .. })));
    assert_eq!(orch.pending_deferred(), 0);
    assert_eq!(h.search.cancelled().len(), 1);

    sweeper.shutdown().await;
}
