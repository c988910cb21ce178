//! End-to-end query execution: handles, previews, pagination, staleness.

mod common;

use ado_mcp::executor::{QueryExecutor, WiqlQueryRequest};
use ado_mcp::handles::QueryHandleStore;
use ado_mcp::selector::ItemSelector;
use ado_mcp::{AdoGateway, Error};
use common::{FakeAdo, test_config, work_item};
use serde_json::json;
use std::sync::Arc;

fn setup(ids: Vec<i64>) -> (Arc<FakeAdo>, Arc<QueryHandleStore>, QueryExecutor) {
    let gateway = Arc::new(FakeAdo::new());
    for id in &ids {
        gateway.insert_item(work_item(
            *id,
            &format!("Item {id}"),
            "Active",
            "Bug",
            "",
        ));
    }
    gateway.set_wiql_ids(ids);

    let config = Arc::new(test_config());
    let store = Arc::new(QueryHandleStore::new(std::time::Duration::from_secs(3600)));
    let executor = QueryExecutor::new(
        gateway.clone() as Arc<dyn AdoGateway>,
        store.clone(),
        config,
    );
    (gateway, store, executor)
}

#[tokio::test]
async fn query_with_handle_returns_preview_and_stores_context() {
    let (_gateway, store, executor) = setup(vec![101, 102, 103]);

    let mut request = WiqlQueryRequest::new(
        "SELECT [System.Id] FROM WorkItems WHERE [System.State] = 'Active'",
    );
    request.return_query_handle = true;

    let output = executor.run_wiql(&request).await.unwrap();
    let handle_id = output.data["queryHandle"].as_str().unwrap().to_string();

    assert!(handle_id.starts_with("qh_"));
    assert_eq!(output.data["workItemCount"], 3);
    assert_eq!(output.data["items"][0]["index"], 0);
    assert_eq!(output.data["items"][0]["id"], 101);
    assert_eq!(output.data["items"][0]["title"], "Item 101");
    assert_eq!(output.data["items"][0]["state"], "Active");

    // getIds and resolveSelector("all") agree, in order.
    let ids = store.get_ids(&handle_id).unwrap();
    assert_eq!(ids, vec![101, 102, 103]);
    assert_eq!(
        store.resolve_selector(&handle_id, &ItemSelector::All).unwrap(),
        ids
    );

    let handle = store.get_data(&handle_id).unwrap();
    assert_eq!(handle.item_context.len(), 3);
    assert_eq!(handle.metadata.project, "Fabrikam");
}

#[tokio::test]
async fn handle_only_suppresses_items_but_stores_context() {
    let (_gateway, store, executor) = setup(vec![1, 2, 3, 4, 5]);

    let mut request = WiqlQueryRequest::new("SELECT [System.Id] FROM WorkItems");
    request.return_query_handle = true;
    request.handle_only = true;

    let output = executor.run_wiql(&request).await.unwrap();

    assert!(output.data.get("items").is_none());
    assert_eq!(output.data["workItemCount"], 5);

    // Context was still fetched and stored for later selection.
    let handle_id = output.data["queryHandle"].as_str().unwrap();
    let handle = store.get_data(handle_id).unwrap();
    assert_eq!(handle.item_context.len(), 5);
}

#[tokio::test]
async fn pagination_reports_total_and_next_skip() {
    let (_gateway, _store, executor) = setup((1..=25).collect());

    let mut request = WiqlQueryRequest::new("SELECT [System.Id] FROM WorkItems");
    request.top = Some(10);
    request.skip = Some(10);

    let output = executor.run_wiql(&request).await.unwrap();
    assert_eq!(output.data["totalCount"], 25);
    assert_eq!(output.data["workItemCount"], 10);
    assert_eq!(output.data["hasNextPage"], true);
    assert_eq!(output.data["nextSkip"], 20);

    // Items are the requested page.
    assert_eq!(output.data["items"][0]["id"], 11);
}

#[tokio::test]
async fn last_page_has_no_next() {
    let (_gateway, _store, executor) = setup((1..=25).collect());

    let mut request = WiqlQueryRequest::new("SELECT [System.Id] FROM WorkItems");
    request.top = Some(10);
    request.skip = Some(20);

    let output = executor.run_wiql(&request).await.unwrap();
    assert_eq!(output.data["workItemCount"], 5);
    assert_eq!(output.data["hasNextPage"], false);
    assert!(output.data.get("nextSkip").is_none());
}

#[tokio::test]
async fn substantive_change_enrichment_feeds_criteria_selection() {
    let (gateway, store, executor) = setup(vec![1, 2]);
    let days_ago = |days: i64| (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();

    // Item 1: human edit 90 days ago, then only a tag-only heartbeat.
    gateway.set_revisions(
        1,
        vec![
            common::revision(json!({
                "System.Title": "Item 1",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": days_ago(90)
            })),
            common::revision(json!({
                "System.Title": "Item 1",
                "System.Tags": "swept",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": days_ago(2)
            })),
        ],
    );
    // Item 2: fresh human edit.
    gateway.set_revisions(
        2,
        vec![common::revision(json!({
            "System.Title": "Item 2 edited",
            "System.ChangedBy": "Dana",
            "System.ChangedDate": days_ago(2)
        }))],
    );

    let mut request = WiqlQueryRequest::new("SELECT [System.Id] FROM WorkItems");
    request.return_query_handle = true;
    request.include_substantive_change = true;

    let output = executor.run_wiql(&request).await.unwrap();
    let handle_id = output.data["queryHandle"].as_str().unwrap();

    // Only item 1 has been substantively inactive for 30+ days.
    let selector = ItemSelector::from_value(&json!({ "daysInactiveMin": 30 })).unwrap();
    assert_eq!(store.resolve_selector(handle_id, &selector).unwrap(), vec![1]);
}

#[tokio::test]
async fn revision_failures_degrade_to_warnings() {
    let (gateway, _store, executor) = setup(vec![1, 2]);
    gateway.set_revisions(
        1,
        vec![common::revision(json!({
            "System.Title": "Item 1",
            "System.ChangedBy": "Dana",
            "System.ChangedDate": "2026-07-01T00:00:00Z"
        }))],
    );
    // Item 2 has no revisions recorded: daysInactive stays unknown but the
    // query itself succeeds.
    let mut request = WiqlQueryRequest::new("SELECT [System.Id] FROM WorkItems");
    request.return_query_handle = true;
    request.include_substantive_change = true;

    let output = executor.run_wiql(&request).await.unwrap();
    assert_eq!(output.data["workItemCount"], 2);
}

#[tokio::test]
async fn inactivity_filter_without_staleness_is_a_validation_error() {
    let (_gateway, _store, executor) = setup(vec![1]);

    let mut request = WiqlQueryRequest::new("SELECT [System.Id] FROM WorkItems");
    request.filter_days_inactive_min = Some(30);

    let err = executor.run_wiql(&request).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn malformed_wiql_is_an_upstream_error() {
    let (_gateway, _store, executor) = setup(vec![1]);

    let request = WiqlQueryRequest::new("SELEKT things FROM stuff");
    let err = executor.run_wiql(&request).await.unwrap_err();
    assert!(matches!(err, Error::Upstream { status: 400, .. }));
}

#[tokio::test]
async fn concurrent_queries_produce_independent_handles() {
    let (_gateway, store, executor) = setup(vec![1, 2, 3]);

    let mut request_a = WiqlQueryRequest::new("SELECT [System.Id] FROM WorkItems");
    request_a.return_query_handle = true;
    let request_b = request_a.clone();

    let (a, b) = tokio::join!(executor.run_wiql(&request_a), executor.run_wiql(&request_b));
    let handle_a = a.unwrap().data["queryHandle"].as_str().unwrap().to_string();
    let handle_b = b.unwrap().data["queryHandle"].as_str().unwrap().to_string();

    assert_ne!(handle_a, handle_b);
    assert_eq!(store.get_ids(&handle_a).unwrap(), store.get_ids(&handle_b).unwrap());
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn placeholder_title_filter_narrows_results() {
    let gateway = Arc::new(FakeAdo::new());
    gateway.insert_item(work_item(1, "TBD", "New", "Task", ""));
    gateway.insert_item(work_item(2, "Implement retry backoff", "New", "Task", ""));
    gateway.insert_item(work_item(3, "todo: decide owner", "New", "Task", ""));
    gateway.set_wiql_ids(vec![1, 2, 3]);

    let config = Arc::new(test_config());
    let store = Arc::new(QueryHandleStore::new(std::time::Duration::from_secs(3600)));
    let executor = QueryExecutor::new(
        gateway.clone() as Arc<dyn AdoGateway>,
        store.clone(),
        config,
    );

    let mut request = WiqlQueryRequest::new("SELECT [System.Id] FROM WorkItems");
    request.return_query_handle = true;
    request.filter_patterns = vec!["placeholder_titles".parse().unwrap()];

    let output = executor.run_wiql(&request).await.unwrap();
    assert_eq!(output.data["workItemCount"], 2);

    let handle_id = output.data["queryHandle"].as_str().unwrap();
    assert_eq!(store.get_ids(handle_id).unwrap(), vec![1, 3]);
}
