//! Shared test fixtures: an in-memory [`AdoGateway`] and item builders.
#![allow(dead_code)]

use ado_mcp::models::{AdoWorkItem, JsonPatchOp, WiqlOutcome, WorkItemRevision};
use ado_mcp::{AdoGateway, Error, Result, ServerConfig};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory Azure DevOps stand-in. Counts reads and writes so tests can
/// assert the dry-run and batching laws.
#[derive(Default)]
pub struct FakeAdo {
    pub items: Mutex<HashMap<i64, AdoWorkItem>>,
    pub revisions: Mutex<HashMap<i64, Vec<WorkItemRevision>>>,
    pub wiql_ids: Mutex<Vec<i64>>,
    pub analytics_response: Mutex<Value>,
    pub deleted: Mutex<HashSet<i64>>,
    pub comments: Mutex<Vec<(i64, String)>>,
    /// Updates against these ids fail with a 404.
    pub fail_update_ids: Mutex<HashSet<i64>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl FakeAdo {
    pub fn new() -> Self {
        Self {
            analytics_response: Mutex::new(json!({ "value": [] })),
            ..Self::default()
        }
    }

    pub fn insert_item(&self, item: AdoWorkItem) {
        self.items.lock().unwrap().insert(item.id, item);
    }

    pub fn set_wiql_ids(&self, ids: Vec<i64>) {
        *self.wiql_ids.lock().unwrap() = ids;
    }

    pub fn set_revisions(&self, id: i64, revisions: Vec<WorkItemRevision>) {
        self.revisions.lock().unwrap().insert(id, revisions);
    }

    pub fn field(&self, id: i64, name: &str) -> Option<Value> {
        self.items
            .lock()
            .unwrap()
            .get(&id)
            .and_then(|item| item.fields.get(name).cloned())
    }

    pub fn tags_of(&self, id: i64) -> Vec<String> {
        self.items
            .lock()
            .unwrap()
            .get(&id)
            .map(|item| item.tags())
            .unwrap_or_default()
    }

    pub fn is_deleted(&self, id: i64) -> bool {
        self.deleted.lock().unwrap().contains(&id)
    }
}

#[async_trait]
impl AdoGateway for FakeAdo {
    async fn query_wiql(&self, wiql: &str) -> Result<WiqlOutcome> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let upper = wiql.trim_start().to_uppercase();
        if !upper.starts_with("SELECT") {
            return Err(Error::upstream(400, "WIQL parse error near start of query"));
        }
        Ok(WiqlOutcome {
            query_type: "flat".to_string(),
            ids: self.wiql_ids.lock().unwrap().clone(),
        })
    }

    async fn get_work_items(
        &self,
        ids: &[i64],
        _fields: Option<&[String]>,
        _expand_relations: bool,
    ) -> Result<Vec<AdoWorkItem>> {
        // One "API call" per 200-id batch, matching the real client.
        let batches = ids.len().div_ceil(200).max(1) as u64;
        self.reads.fetch_add(batches, Ordering::SeqCst);

        let items = self.items.lock().unwrap();
        let deleted = self.deleted.lock().unwrap();
        Ok(ids
            .iter()
            .filter(|id| !deleted.contains(id))
            .filter_map(|id| items.get(id).cloned())
            .collect())
    }

    async fn get_revisions(&self, id: i64) -> Result<Vec<WorkItemRevision>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .revisions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_work_item(&self, id: i64, ops: &[JsonPatchOp]) -> Result<AdoWorkItem> {
        self.writes.fetch_add(1, Ordering::SeqCst);

        if self.fail_update_ids.lock().unwrap().contains(&id)
            || self.deleted.lock().unwrap().contains(&id)
        {
            return Err(Error::upstream(404, format!("work item {id} does not exist")));
        }

        let mut items = self.items.lock().unwrap();
        let item = items
            .get_mut(&id)
            .ok_or_else(|| Error::upstream(404, format!("work item {id} does not exist")))?;

        for op in ops {
            if let Some(field) = op.path.strip_prefix("/fields/") {
                match op.op.as_str() {
                    "add" | "replace" => {
                        if let Some(value) = &op.value {
                            item.fields.insert(field.to_string(), value.clone());
                        }
                    }
                    "remove" => {
                        item.fields.remove(field);
                    }
                    _ => {}
                }
            }
        }
        item.rev = Some(item.rev.unwrap_or(1) + 1);
        Ok(item.clone())
    }

    async fn add_comment(&self, id: i64, text: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.deleted.lock().unwrap().contains(&id)
            || !self.items.lock().unwrap().contains_key(&id)
        {
            return Err(Error::upstream(404, format!("work item {id} does not exist")));
        }
        self.comments.lock().unwrap().push((id, text.to_string()));
        Ok(())
    }

    async fn delete_work_item(&self, id: i64) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if !self.items.lock().unwrap().contains_key(&id) {
            return Err(Error::upstream(404, format!("work item {id} does not exist")));
        }
        self.deleted.lock().unwrap().insert(id);
        Ok(())
    }

    async fn restore_work_item(&self, id: i64) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if !self.deleted.lock().unwrap().remove(&id) {
            return Err(Error::upstream(
                404,
                format!("work item {id} is not in the recycle bin"),
            ));
        }
        Ok(())
    }

    async fn query_analytics(&self, _query: &str) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.analytics_response.lock().unwrap().clone())
    }

    fn read_calls(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn write_calls(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

/// A work item with the usual fields populated.
pub fn work_item(id: i64, title: &str, state: &str, item_type: &str, tags: &str) -> AdoWorkItem {
    serde_json::from_value(json!({
        "id": id,
        "rev": 1,
        "fields": {
            "System.Title": title,
            "System.State": state,
            "System.WorkItemType": item_type,
            "System.Tags": tags,
            "System.AreaPath": "Fabrikam\\Platform",
            "System.IterationPath": "Fabrikam\\Sprint 1",
            "System.ChangedDate": "2026-07-01T00:00:00Z",
            "System.Description": "A description"
        }
    }))
    .unwrap()
}

/// Standard test configuration: org `contoso`, project `Fabrikam`.
pub fn test_config() -> ServerConfig {
    ServerConfig::builder()
        .organization("contoso")
        .area_path(r"Fabrikam\Platform")
        .build()
        .unwrap()
}

/// A revision with the given fields, changed by a person.
pub fn revision(fields: Value) -> WorkItemRevision {
    serde_json::from_value(json!({ "rev": 1, "fields": fields })).unwrap()
}
