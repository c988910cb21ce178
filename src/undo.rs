//! Undo journal and recovery engine.
//!
//! Every mutating bulk operation appends one journal entry capturing, per
//! item, the pre-image and post-image of each touched field. Undo builds
//! inverse writes from that record — but only applies them to items whose
//! current value still equals the recorded post-image. Anything a third
//! party changed since is reported as skipped, never overwritten.

use crate::ado::AdoGateway;
use crate::models::JsonPatchOp;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Per-item record inside an [`UndoEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedItem {
    pub id: i64,

    /// Field reference name → value before the write. A `null` value means
    /// the field did not exist and undo removes it.
    pub previous_values: Map<String, Value>,

    /// Field reference name → value after the write.
    pub new_values: Map<String, Value>,

    /// The item was deleted by the operation; undo attempts a recycle-bin
    /// restore instead of a field patch.
    #[serde(default)]
    pub deleted: bool,
}

/// One journaled operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoEntry {
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,

    /// Short description of the action mix, e.g. `add-tag, comment`.
    pub kind: String,

    pub handle_id: String,
    pub affected: Vec<AffectedItem>,
}

/// Append-only in-memory journal. Writes serialized, reads concurrent.
#[derive(Default)]
pub struct UndoJournal {
    entries: RwLock<Vec<UndoEntry>>,
}

impl UndoJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: UndoEntry) {
        self.entries
            .write()
            .expect("undo journal lock poisoned")
            .push(entry);
    }

    pub fn by_operation(&self, operation_id: &str) -> Option<UndoEntry> {
        self.entries
            .read()
            .expect("undo journal lock poisoned")
            .iter()
            .find(|e| e.operation_id == operation_id)
            .cloned()
    }

    /// Most recent entry recorded for a handle.
    pub fn latest_for_handle(&self, handle_id: &str) -> Option<UndoEntry> {
        self.entries
            .read()
            .expect("undo journal lock poisoned")
            .iter()
            .rev()
            .find(|e| e.handle_id == handle_id)
            .cloned()
    }

    /// Entries by one actor inside a time window, oldest first.
    pub fn in_window(
        &self,
        actor: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<UndoEntry> {
        self.entries
            .read()
            .expect("undo journal lock poisoned")
            .iter()
            .filter(|e| e.actor == actor && e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("undo journal lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of applying one entry's inverse.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoOutcome {
    pub operation_id: String,
    pub restored: Vec<i64>,

    /// Items left alone because a third party changed them after us.
    pub skipped: Vec<SkippedItem>,

    /// Items whose inverse failed or is not automatable.
    pub unrecoverable: Vec<UnrecoverableItem>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedItem {
    pub id: i64,
    pub field: String,
    pub expected: Value,
    pub found: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnrecoverableItem {
    pub id: i64,
    pub reason: String,
}

/// Applies inverse writes from journal entries.
pub struct UndoEngine {
    gateway: Arc<dyn AdoGateway>,
    journal: Arc<UndoJournal>,
}

impl UndoEngine {
    pub fn new(gateway: Arc<dyn AdoGateway>, journal: Arc<UndoJournal>) -> Self {
        Self { gateway, journal }
    }

    /// Undo one operation, named explicitly or the most recent for a
    /// handle.
    pub async fn undo_operation(
        &self,
        operation_id: Option<&str>,
        handle_id: Option<&str>,
    ) -> Result<Value> {
        let entry = match (operation_id, handle_id) {
            (Some(op), _) => self.journal.by_operation(op).ok_or_else(|| {
                Error::validation(format!("no journal entry for operation {op}"))
            })?,
            (None, Some(handle)) => self.journal.latest_for_handle(handle).ok_or_else(|| {
                Error::validation(format!("no journal entry recorded for handle {handle}"))
            })?,
            (None, None) => {
                return Err(Error::validation(
                    "specify operationId or queryHandle to undo",
                ));
            }
        };

        let outcome = self.apply_inverse(&entry).await?;
        Ok(serde_json::to_value(outcome)?)
    }

    /// Forensic undo: invert every entry by an actor inside a window, most
    /// recent first.
    pub async fn undo_window(
        &self,
        actor: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Value> {
        let mut entries = self.journal.in_window(actor, from, to);
        if entries.is_empty() {
            return Err(Error::validation(format!(
                "no journal entries for actor {actor:?} in the given window"
            )));
        }
        entries.reverse();

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in &entries {
            outcomes.push(self.apply_inverse(entry).await?);
        }
        Ok(json!({
            "actor": actor,
            "operations": outcomes.len(),
            "results": outcomes,
        }))
    }

    async fn apply_inverse(&self, entry: &UndoEntry) -> Result<UndoOutcome> {
        let mut outcome = UndoOutcome {
            operation_id: entry.operation_id.clone(),
            restored: Vec::new(),
            skipped: Vec::new(),
            unrecoverable: Vec::new(),
        };

        // One batched read covers the divergence checks for every item.
        let patchable: Vec<&AffectedItem> = entry
            .affected
            .iter()
            .filter(|a| !a.deleted && !a.new_values.is_empty())
            .collect();
        let fields: Vec<String> = patchable
            .iter()
            .flat_map(|a| a.new_values.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let ids: Vec<i64> = patchable.iter().map(|a| a.id).collect();

        let current = if ids.is_empty() {
            Vec::new()
        } else {
            self.gateway.get_work_items(&ids, Some(&fields), false).await?
        };
        let current_by_id: std::collections::HashMap<i64, &Map<String, Value>> =
            current.iter().map(|item| (item.id, &item.fields)).collect();

        // Inverse writes run in reverse of the recorded order.
        for affected in entry.affected.iter().rev() {
            if affected.deleted {
                match self.gateway.restore_work_item(affected.id).await {
                    Ok(()) => outcome.restored.push(affected.id),
                    Err(err) => outcome.unrecoverable.push(UnrecoverableItem {
                        id: affected.id,
                        reason: format!("restore failed, manual recovery required: {err}"),
                    }),
                }
                continue;
            }
            if affected.new_values.is_empty() {
                continue;
            }

            let Some(current_fields) = current_by_id.get(&affected.id) else {
                outcome.unrecoverable.push(UnrecoverableItem {
                    id: affected.id,
                    reason: "item no longer readable".to_string(),
                });
                continue;
            };

            // Divergence check: every recorded post-image must still hold.
            let diverged = affected.new_values.iter().find(|(field, expected)| {
                let found = current_fields.get(*field).unwrap_or(&Value::Null);
                &found != expected
            });
            if let Some((field, expected)) = diverged {
                let found = current_fields.get(field).cloned().unwrap_or(Value::Null);
                outcome.skipped.push(SkippedItem {
                    id: affected.id,
                    field: field.clone(),
                    expected: expected.clone(),
                    found,
                });
                continue;
            }

            let ops: Vec<JsonPatchOp> = affected
                .previous_values
                .iter()
                .map(|(field, previous)| {
                    if previous.is_null() {
                        JsonPatchOp::remove_field(field)
                    } else {
                        JsonPatchOp::set_field(field, previous.clone())
                    }
                })
                .collect();

            match self.gateway.update_work_item(affected.id, &ops).await {
                Ok(_) => outcome.restored.push(affected.id),
                Err(err) => outcome.unrecoverable.push(UnrecoverableItem {
                    id: affected.id,
                    reason: err.to_string(),
                }),
            }
        }

        Ok(outcome)
    }
}
