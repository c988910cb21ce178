//! Undo laws: inverse writes restore pre-images, third-party changes are
//! skipped, deletes restore through the recycle bin, forensic windows.

mod common;

use ado_mcp::bulk::{BulkEngine, BulkRequest};
use ado_mcp::handles::{HandleMetadata, QueryHandleStore};
use ado_mcp::models::ItemContext;
use ado_mcp::selector::ItemSelector;
use ado_mcp::undo::{UndoEngine, UndoJournal};
use ado_mcp::{AdoGateway, Error, QueryKind};
use common::{FakeAdo, test_config, work_item};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Rig {
    gateway: Arc<FakeAdo>,
    engine: BulkEngine,
    undo: UndoEngine,
    journal: Arc<UndoJournal>,
    handle_id: String,
}

fn rig(ids: &[i64]) -> Rig {
    let gateway = Arc::new(FakeAdo::new());
    let mut context = HashMap::new();
    for id in ids {
        let item = work_item(*id, &format!("Item {id}"), "Active", "Bug", "original");
        context.insert(*id, ItemContext::from_work_item(&item, &[]));
        gateway.insert_item(item);
    }

    let store = Arc::new(QueryHandleStore::new(Duration::from_secs(3600)));
    let journal = Arc::new(UndoJournal::new());
    let engine = BulkEngine::new(
        gateway.clone() as Arc<dyn AdoGateway>,
        store.clone(),
        journal.clone(),
        Arc::new(test_config()),
    );
    let undo = UndoEngine::new(gateway.clone() as Arc<dyn AdoGateway>, journal.clone());

    let handle_id = store.store(
        ids.to_vec(),
        "SELECT [System.Id] FROM WorkItems",
        HandleMetadata {
            project: "Fabrikam".into(),
            query_type: QueryKind::Flat,
            filter_criteria: None,
            created_by: None,
        },
        None,
        context,
    );

    Rig {
        gateway,
        engine,
        undo,
        journal,
        handle_id,
    }
}

async fn run_bulk(rig: &Rig, actions: serde_json::Value) {
    let request = BulkRequest {
        query_handle: rig.handle_id.clone(),
        item_selector: ItemSelector::All,
        actions: serde_json::from_value(actions).unwrap(),
        dry_run: false,
    };
    let execution = rig
        .engine
        .execute(&request, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(execution.failed, 0, "setup bulk op must succeed");
}

#[tokio::test]
async fn undo_restores_pre_images() {
    let rig = rig(&[10, 30]);
    run_bulk(
        &rig,
        json!([{ "type": "transition-state", "state": "Resolved" }]),
    )
    .await;
    assert_eq!(rig.gateway.field(10, "System.State"), Some(json!("Resolved")));

    let outcome = rig
        .undo
        .undo_operation(None, Some(&rig.handle_id))
        .await
        .unwrap();

    let mut restored: Vec<i64> = outcome["restored"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    restored.sort();
    assert_eq!(restored, vec![10, 30]);
    assert_eq!(rig.gateway.field(10, "System.State"), Some(json!("Active")));
    assert_eq!(rig.gateway.field(30, "System.State"), Some(json!("Active")));
}

#[tokio::test]
async fn undo_skips_third_party_changes() {
    let rig = rig(&[10, 30]);
    run_bulk(&rig, json!([{ "type": "assign", "assignedTo": "sweep@contoso.com" }])).await;

    // A third party reassigns item 30 after our write.
    rig.gateway
        .update_work_item(
            30,
            &[ado_mcp::models::JsonPatchOp::set_field(
                "System.AssignedTo",
                json!("human@contoso.com"),
            )],
        )
        .await
        .unwrap();

    let outcome = rig
        .undo
        .undo_operation(None, Some(&rig.handle_id))
        .await
        .unwrap();

    assert_eq!(outcome["restored"], json!([10]));
    let skipped = outcome["skipped"].as_array().unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0]["id"], 30);
    assert_eq!(skipped[0]["field"], "System.AssignedTo");
    assert_eq!(skipped[0]["expected"], "sweep@contoso.com");
    assert_eq!(skipped[0]["found"], "human@contoso.com");

    // The third-party value is preserved.
    assert_eq!(
        rig.gateway.field(30, "System.AssignedTo"),
        Some(json!("human@contoso.com"))
    );
}

#[tokio::test]
async fn undo_is_safe_to_rerun() {
    let rig = rig(&[10]);
    run_bulk(
        &rig,
        json!([{ "type": "transition-state", "state": "Resolved" }]),
    )
    .await;

    let first = rig
        .undo
        .undo_operation(None, Some(&rig.handle_id))
        .await
        .unwrap();
    assert_eq!(first["restored"], json!([10]));

    // Second undo finds the current value no longer matches the recorded
    // post-image and skips instead of flapping the field back.
    let second = rig
        .undo
        .undo_operation(None, Some(&rig.handle_id))
        .await
        .unwrap();
    assert_eq!(second["restored"], json!([]));
    assert_eq!(second["skipped"].as_array().unwrap().len(), 1);
    assert_eq!(rig.gateway.field(10, "System.State"), Some(json!("Active")));
}

#[tokio::test]
async fn undo_restores_deleted_items_via_recycle_bin() {
    let rig = rig(&[77]);
    run_bulk(&rig, json!([{ "type": "remove" }])).await;
    assert!(rig.gateway.is_deleted(77));

    let outcome = rig
        .undo
        .undo_operation(None, Some(&rig.handle_id))
        .await
        .unwrap();

    assert_eq!(outcome["restored"], json!([77]));
    assert!(!rig.gateway.is_deleted(77));
}

#[tokio::test]
async fn undo_reports_unrecoverable_restores() {
    let rig = rig(&[77]);
    run_bulk(&rig, json!([{ "type": "remove" }])).await;

    // The item is destroyed for good (e.g. recycle bin emptied).
    rig.gateway.deleted.lock().unwrap().remove(&77);
    rig.gateway.items.lock().unwrap().remove(&77);

    let outcome = rig
        .undo
        .undo_operation(None, Some(&rig.handle_id))
        .await
        .unwrap();

    assert_eq!(outcome["restored"], json!([]));
    let unrecoverable = outcome["unrecoverable"].as_array().unwrap();
    assert_eq!(unrecoverable.len(), 1);
    assert_eq!(unrecoverable[0]["id"], 77);
    assert!(
        unrecoverable[0]["reason"]
            .as_str()
            .unwrap()
            .contains("manual")
    );
}

#[tokio::test]
async fn undo_by_operation_id() {
    let rig = rig(&[10]);
    run_bulk(&rig, json!([{ "type": "add-tag", "tags": "first" }])).await;
    run_bulk(&rig, json!([{ "type": "add-tag", "tags": "second" }])).await;

    assert_eq!(rig.journal.len(), 2);
    let first_op = rig.journal.latest_for_handle(&rig.handle_id).unwrap();

    // Undo the most recent operation explicitly by id.
    let outcome = rig
        .undo
        .undo_operation(Some(&first_op.operation_id), None)
        .await
        .unwrap();
    assert_eq!(outcome["operationId"], first_op.operation_id.as_str());
    assert_eq!(outcome["restored"], json!([10]));

    // Tags are back to the state before the second operation.
    let tags = rig.gateway.tags_of(10);
    assert!(tags.contains(&"first".to_string()));
    assert!(!tags.contains(&"second".to_string()));
}

#[tokio::test]
async fn undo_unknown_operation_is_a_validation_error() {
    let rig = rig(&[10]);
    let err = rig
        .undo
        .undo_operation(Some("op_missing"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = rig.undo.undo_operation(None, None).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn forensic_window_reverts_matching_operations_newest_first() {
    let rig = rig(&[10]);
    run_bulk(&rig, json!([{ "type": "transition-state", "state": "Resolved" }])).await;
    run_bulk(&rig, json!([{ "type": "transition-state", "state": "Closed" }])).await;

    let now = chrono::Utc::now();
    let outcome = rig
        .undo
        .undo_window("mcp-client", now - chrono::Duration::hours(1), now)
        .await
        .unwrap();

    assert_eq!(outcome["operations"], 2);
    // Unwinding newest-first lands back on the original state.
    assert_eq!(rig.gateway.field(10, "System.State"), Some(json!("Active")));
}

#[tokio::test]
async fn forensic_window_with_no_matches_errors() {
    let rig = rig(&[10]);
    let now = chrono::Utc::now();
    let err = rig
        .undo
        .undo_window("nobody", now - chrono::Duration::hours(1), now)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
