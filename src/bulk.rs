//! Bulk operations over a (handle, selector) pair.
//!
//! The engine never accepts raw work-item ids. A call names a query handle
//! and a selector; the resolved id list is the only thing written to.
//!
//! `dryRun` defaults to true everywhere this engine is exposed. The dry-run
//! path builds its plan entirely from the handle's snapshot and issues no
//! HTTP at all, so agents can preview cheaply and safely.
//!
//! The live path is API-call frugal: one batched pre-image read per call
//! (which also feeds the undo journal), then one PATCH per item covering
//! every field-shaped action, plus separate calls only where the API
//! demands them (comments, deletes). Tag writes are computed from the
//! batched pre-images — never a per-item read-then-write pair.

use crate::ado::AdoGateway;
use crate::config::ServerConfig;
use crate::handles::{self, QueryHandle, QueryHandleStore};
use crate::models::{self, AdoWorkItem, ItemContext, JsonPatchOp, join_tags};
use crate::sampling::{SamplingClient, SamplingMessage, SamplingRequest};
use crate::selector::{self, ItemSelector};
use crate::undo::{AffectedItem, UndoEntry, UndoJournal};
use crate::{Error, Result};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const RELATED_LINK_TYPE: &str = "System.LinkTypes.Related";

fn default_link_type() -> String {
    RELATED_LINK_TYPE.to_string()
}

fn default_true() -> bool {
    true
}

/// One action inside a bulk call. All kinds can be combined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum BulkAction {
    /// Set named fields to values.
    UpdateFields { fields: Map<String, Value> },

    /// Add tags (semicolon- or comma-separated in one string).
    AddTag { tags: String },

    /// Remove tags.
    RemoveTag { tags: String },

    /// Append a discussion comment. `{{id}}`, `{{title}}`, `{{state}}`,
    /// `{{type}}`, `{{assignedTo}}`, and `{{daysInactive}}` are substituted
    /// from the item's snapshot.
    Comment { comment: String },

    /// Set the assignee.
    Assign { assigned_to: String },

    /// Set the state, optionally with a reason.
    TransitionState {
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Add a relation to another work item.
    Link {
        target_id: i64,
        #[serde(default = "default_link_type")]
        link_type: String,
        #[serde(default = "default_true")]
        skip_if_exists: bool,
    },

    /// Delete the work item. Destructive; dry-run first.
    Remove,

    /// Set the iteration path.
    MoveToIteration { iteration_path: String },

    /// AI-assisted description rewrite via host sampling.
    EnhanceDescription {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
}

impl BulkAction {
    pub fn kind(&self) -> &'static str {
        match self {
            BulkAction::UpdateFields { .. } => "update-fields",
            BulkAction::AddTag { .. } => "add-tag",
            BulkAction::RemoveTag { .. } => "remove-tag",
            BulkAction::Comment { .. } => "comment",
            BulkAction::Assign { .. } => "assign",
            BulkAction::TransitionState { .. } => "transition-state",
            BulkAction::Link { .. } => "link",
            BulkAction::Remove => "remove",
            BulkAction::MoveToIteration { .. } => "move-to-iteration",
            BulkAction::EnhanceDescription { .. } => "enhance-description",
        }
    }

    /// Field reference names this action writes, for pre-image capture.
    fn touched_fields(&self) -> Vec<String> {
        match self {
            BulkAction::UpdateFields { fields } => fields.keys().cloned().collect(),
            BulkAction::AddTag { .. } | BulkAction::RemoveTag { .. } => {
                vec![models::FIELD_TAGS.to_string()]
            }
            BulkAction::Assign { .. } => vec![models::FIELD_ASSIGNED_TO.to_string()],
            BulkAction::TransitionState { reason, .. } => {
                let mut fields = vec![models::FIELD_STATE.to_string()];
                if reason.is_some() {
                    fields.push(models::FIELD_STATE_REASON.to_string());
                }
                fields
            }
            BulkAction::MoveToIteration { .. } => {
                vec![models::FIELD_ITERATION_PATH.to_string()]
            }
            BulkAction::EnhanceDescription { .. } => {
                vec![models::FIELD_DESCRIPTION.to_string()]
            }
            BulkAction::Comment { .. } | BulkAction::Link { .. } | BulkAction::Remove => {
                Vec::new()
            }
        }
    }
}

/// One bulk call.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub query_handle: String,
    pub item_selector: ItemSelector,
    pub actions: Vec<BulkAction>,
    pub dry_run: bool,
}

/// Per-item result in the live path.
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub id: i64,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Engine output: the payload plus warnings and the failure count the
/// caller folds into the envelope.
#[derive(Debug)]
pub struct BulkExecution {
    pub data: Value,
    pub warnings: Vec<String>,
    pub failed: usize,
}

struct ItemPlan {
    patch_ops: Vec<JsonPatchOp>,
    comments: Vec<String>,
    delete: bool,
    previous_values: Map<String, Value>,
    new_values: Map<String, Value>,
}

/// Applies action sequences to handle-selected items.
pub struct BulkEngine {
    gateway: Arc<dyn AdoGateway>,
    store: Arc<QueryHandleStore>,
    journal: Arc<UndoJournal>,
    config: Arc<ServerConfig>,
}

impl BulkEngine {
    pub fn new(
        gateway: Arc<dyn AdoGateway>,
        store: Arc<QueryHandleStore>,
        journal: Arc<UndoJournal>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            gateway,
            store,
            journal,
            config,
        }
    }

    pub async fn execute(
        &self,
        request: &BulkRequest,
        sampling: Option<Arc<dyn SamplingClient>>,
        cancel: &CancellationToken,
    ) -> Result<BulkExecution> {
        if request.actions.is_empty() {
            return Err(Error::validation("actions must not be empty"));
        }

        let handle = self.store.get_data(&request.query_handle)?;
        let target_ids = selector::resolve(&handle, &request.item_selector)?;

        if request.dry_run {
            return Ok(self.plan_only(&handle, &target_ids, &request.actions));
        }
        self.apply(&handle, &target_ids, request, sampling, cancel)
            .await
    }

    /// Dry run: resolve the plan from the snapshot, no HTTP.
    fn plan_only(
        &self,
        handle: &QueryHandle,
        target_ids: &[i64],
        actions: &[BulkAction],
    ) -> BulkExecution {
        let plan: Vec<Value> = target_ids
            .iter()
            .map(|id| {
                let ctx = handle.item_context.get(id);
                let planned: Vec<Value> = actions
                    .iter()
                    .map(|action| describe_action(action, *id, ctx))
                    .collect();
                json!({
                    "id": id,
                    "title": ctx.map(|c| c.title.clone()),
                    "actions": planned,
                })
            })
            .collect();

        let mut warnings = Vec::new();
        if actions.iter().any(|a| matches!(a, BulkAction::Remove)) {
            warnings.push(
                "plan includes remove: re-run with dryRun=false to permanently delete these items"
                    .to_string(),
            );
        }

        BulkExecution {
            data: json!({
                "dryRun": true,
                "queryHandle": handle.id,
                "targetCount": target_ids.len(),
                "plan": plan,
            }),
            warnings,
            failed: 0,
        }
    }

    async fn apply(
        &self,
        handle: &QueryHandle,
        target_ids: &[i64],
        request: &BulkRequest,
        sampling: Option<Arc<dyn SamplingClient>>,
        cancel: &CancellationToken,
    ) -> Result<BulkExecution> {
        let mut warnings = Vec::new();

        // One batched read captures pre-images for the undo journal and
        // current tags/relations for merge-style actions.
        let needs_relations = request
            .actions
            .iter()
            .any(|a| matches!(a, BulkAction::Link { .. }));
        let touched: Vec<String> = request
            .actions
            .iter()
            .flat_map(|a| a.touched_fields())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let pre_images: HashMap<i64, AdoWorkItem> = if touched.is_empty() && !needs_relations {
            HashMap::new()
        } else {
            let fields = if needs_relations { None } else { Some(&touched[..]) };
            self.gateway
                .get_work_items(target_ids, fields, needs_relations)
                .await?
                .into_iter()
                .map(|item| (item.id, item))
                .collect()
        };

        let mut results: Vec<ItemResult> = Vec::with_capacity(target_ids.len());
        let mut affected: Vec<AffectedItem> = Vec::new();
        let mut cancelled = false;

        let mut stream = futures::stream::iter(target_ids.iter().copied().map(|id| {
            let pre = pre_images.get(&id);
            let ctx = handle.item_context.get(&id);
            let sampling = sampling.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (id, Err(Error::Cancelled), None);
                }
                match self
                    .apply_one(id, pre, ctx, &request.actions, sampling)
                    .await
                {
                    Ok(record) => (id, Ok(()), record),
                    Err(err) => (id, Err(err), None),
                }
            }
        }))
        .buffered(self.config.bulk_concurrency);

        while let Some((id, outcome, record)) = stream.next().await {
            match outcome {
                Ok(()) => {
                    results.push(ItemResult {
                        id,
                        success: true,
                        error: None,
                    });
                    if let Some(record) = record {
                        affected.push(record);
                    }
                }
                Err(Error::Cancelled) => {
                    cancelled = true;
                    results.push(ItemResult {
                        id,
                        success: false,
                        error: Some("cancelled before execution".to_string()),
                    });
                }
                Err(err) => results.push(ItemResult {
                    id,
                    success: false,
                    error: Some(err.to_string()),
                }),
            }
        }
        drop(stream);

        if cancelled {
            warnings.push("operation cancelled; some items were not attempted".to_string());
        }

        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        let kind = request
            .actions
            .iter()
            .map(BulkAction::kind)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .join(", ");

        // Journal whatever was applied, even under cancellation, so the
        // partial write remains undoable.
        let operation_id = if affected.is_empty() {
            None
        } else {
            let operation_id = handles::generate_operation_id();
            self.journal.append(UndoEntry {
                operation_id: operation_id.clone(),
                timestamp: Utc::now(),
                actor: "mcp-client".to_string(),
                kind,
                handle_id: handle.id.clone(),
                affected,
            });
            Some(operation_id)
        };

        if request.actions.iter().any(|a| matches!(a, BulkAction::Remove)) {
            warnings.push(format!(
                "destructive remove executed on {successful} item(s) without dry run"
            ));
        }

        Ok(BulkExecution {
            data: json!({
                "dryRun": false,
                "queryHandle": handle.id,
                "operationId": operation_id,
                "successful": successful,
                "failed": failed,
                "results": results,
            }),
            warnings,
            failed,
        })
    }

    /// Apply the full action sequence to one item: at most one PATCH, then
    /// comments, then delete.
    async fn apply_one(
        &self,
        id: i64,
        pre_image: Option<&AdoWorkItem>,
        ctx: Option<&ItemContext>,
        actions: &[BulkAction],
        sampling: Option<Arc<dyn SamplingClient>>,
    ) -> Result<Option<AffectedItem>> {
        let plan = self
            .build_item_plan(id, pre_image, ctx, actions, sampling)
            .await?;

        if !plan.patch_ops.is_empty() {
            self.gateway.update_work_item(id, &plan.patch_ops).await?;
        }
        for comment in &plan.comments {
            self.gateway.add_comment(id, comment).await?;
        }
        if plan.delete {
            // Deletes are terminal: no retry beyond the client's transient
            // policy, and the undo record marks the item restore-only.
            self.gateway.delete_work_item(id).await?;
        }

        let record = (!plan.new_values.is_empty() || plan.delete).then(|| AffectedItem {
            id,
            previous_values: plan.previous_values,
            new_values: plan.new_values,
            deleted: plan.delete,
        });
        Ok(record)
    }

    /// Walk the action list, folding field writes into one JSON-patch
    /// document and recording pre/post images as we go.
    async fn build_item_plan(
        &self,
        id: i64,
        pre_image: Option<&AdoWorkItem>,
        ctx: Option<&ItemContext>,
        actions: &[BulkAction],
        sampling: Option<Arc<dyn SamplingClient>>,
    ) -> Result<ItemPlan> {
        let mut plan = ItemPlan {
            patch_ops: Vec::new(),
            comments: Vec::new(),
            delete: false,
            previous_values: Map::new(),
            new_values: Map::new(),
        };

        // Tag state evolves across add/remove actions before one write.
        let mut tags: Vec<String> = pre_image.map(|p| p.tags()).unwrap_or_default();
        let mut tags_dirty = false;

        let set_field = |plan: &mut ItemPlan, field: &str, value: Value| {
            let previous = pre_image
                .and_then(|p| p.fields.get(field).cloned())
                .unwrap_or(Value::Null);
            plan.previous_values.insert(field.to_string(), previous);
            plan.new_values.insert(field.to_string(), value.clone());
            plan.patch_ops.push(JsonPatchOp::set_field(field, value));
        };

        for action in actions {
            match action {
                BulkAction::UpdateFields { fields } => {
                    for (field, value) in fields {
                        set_field(&mut plan, field, value.clone());
                    }
                }
                BulkAction::AddTag { tags: raw } => {
                    for tag in parse_tag_argument(raw) {
                        if !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                            tags.push(tag);
                            tags_dirty = true;
                        }
                    }
                }
                BulkAction::RemoveTag { tags: raw } => {
                    let remove = parse_tag_argument(raw);
                    let before = tags.len();
                    tags.retain(|t| !remove.iter().any(|r| r.eq_ignore_ascii_case(t)));
                    tags_dirty |= tags.len() != before;
                }
                BulkAction::Comment { comment } => {
                    plan.comments.push(resolve_template(comment, id, ctx));
                }
                BulkAction::Assign { assigned_to } => {
                    set_field(
                        &mut plan,
                        models::FIELD_ASSIGNED_TO,
                        json!(assigned_to),
                    );
                }
                BulkAction::TransitionState { state, reason } => {
                    set_field(&mut plan, models::FIELD_STATE, json!(state));
                    if let Some(reason) = reason {
                        set_field(&mut plan, models::FIELD_STATE_REASON, json!(reason));
                    }
                }
                BulkAction::Link {
                    target_id,
                    link_type,
                    skip_if_exists,
                } => {
                    let url = format!(
                        "https://dev.azure.com/{}/{}/_apis/wit/workItems/{target_id}",
                        self.config.organization, self.config.project
                    );
                    let exists = pre_image
                        .and_then(|p| p.relations.as_ref())
                        .map(|rels| {
                            rels.iter()
                                .any(|r| r.rel == *link_type && r.url.ends_with(&format!("/{target_id}")))
                        })
                        .unwrap_or(false);
                    if !(*skip_if_exists && exists) {
                        plan.patch_ops.push(JsonPatchOp::add_relation(link_type, &url));
                    }
                }
                BulkAction::Remove => {
                    plan.delete = true;
                }
                BulkAction::MoveToIteration { iteration_path } => {
                    set_field(
                        &mut plan,
                        models::FIELD_ITERATION_PATH,
                        json!(iteration_path),
                    );
                }
                BulkAction::EnhanceDescription { instructions } => {
                    let sampling = sampling.clone().ok_or_else(|| {
                        Error::sampling_unavailable(
                            "enhance-description requires a sampling-capable MCP host",
                        )
                    })?;
                    let enhanced = self
                        .enhance_description(&sampling, id, pre_image, ctx, instructions.as_deref())
                        .await?;
                    set_field(&mut plan, models::FIELD_DESCRIPTION, json!(enhanced));
                }
            }
        }

        if tags_dirty {
            set_field(&mut plan, models::FIELD_TAGS, json!(join_tags(&tags)));
        }

        Ok(plan)
    }

    async fn enhance_description(
        &self,
        sampling: &Arc<dyn SamplingClient>,
        id: i64,
        pre_image: Option<&AdoWorkItem>,
        ctx: Option<&ItemContext>,
        instructions: Option<&str>,
    ) -> Result<String> {
        let title = ctx
            .map(|c| c.title.clone())
            .or_else(|| pre_image.and_then(|p| p.title().map(str::to_string)))
            .unwrap_or_else(|| format!("work item {id}"));
        let current = pre_image
            .and_then(|p| p.description())
            .unwrap_or("")
            .to_string();

        let mut prompt = format!(
            "Rewrite the description of the work item titled {title:?} so it is clear, specific, and actionable. \
             Keep factual content, remove filler, use HTML paragraphs. Return only the new description.\n\nCurrent description:\n{current}"
        );
        if let Some(extra) = instructions {
            prompt.push_str(&format!("\n\nAdditional instructions: {extra}"));
        }

        let request = SamplingRequest::new(vec![SamplingMessage::user(prompt)])
            .with_system_prompt(
                "You improve Azure DevOps work-item descriptions. Output only the description body.",
            )
            .with_max_tokens(800);
        let text = sampling.complete(request).await?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(Error::sampling_unavailable(
                "host returned an empty description",
            ));
        }
        Ok(trimmed.to_string())
    }
}

/// Split a tag argument that may be semicolon- or comma-separated.
fn parse_tag_argument(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Substitute `{{variable}}` placeholders from the item's snapshot.
fn resolve_template(template: &str, id: i64, ctx: Option<&ItemContext>) -> String {
    let mut resolved = template.replace("{{id}}", &id.to_string());
    if let Some(ctx) = ctx {
        resolved = resolved
            .replace("{{title}}", &ctx.title)
            .replace("{{state}}", &ctx.state)
            .replace("{{type}}", &ctx.item_type)
            .replace(
                "{{assignedTo}}",
                ctx.assigned_to.as_deref().unwrap_or("unassigned"),
            )
            .replace(
                "{{daysInactive}}",
                &ctx.days_inactive
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            );
    }
    resolved
}

/// Human-readable plan line for one action against one item.
fn describe_action(action: &BulkAction, id: i64, ctx: Option<&ItemContext>) -> Value {
    let detail = match action {
        BulkAction::UpdateFields { fields } => json!({ "fields": fields }),
        BulkAction::AddTag { tags } => json!({ "add": parse_tag_argument(tags) }),
        BulkAction::RemoveTag { tags } => json!({ "remove": parse_tag_argument(tags) }),
        BulkAction::Comment { comment } => {
            json!({ "comment": resolve_template(comment, id, ctx) })
        }
        BulkAction::Assign { assigned_to } => json!({ "assignedTo": assigned_to }),
        BulkAction::TransitionState { state, reason } => {
            json!({ "state": state, "reason": reason })
        }
        BulkAction::Link {
            target_id,
            link_type,
            skip_if_exists,
        } => json!({
            "targetId": target_id,
            "linkType": link_type,
            "skipIfExists": skip_if_exists,
        }),
        BulkAction::Remove => json!({ "permanent": true }),
        BulkAction::MoveToIteration { iteration_path } => {
            json!({ "iterationPath": iteration_path })
        }
        BulkAction::EnhanceDescription { instructions } => {
            json!({ "instructions": instructions })
        }
    };
    json!({ "type": action.kind(), "detail": detail })
}
