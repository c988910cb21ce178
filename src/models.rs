//! Azure DevOps wire shapes and the per-item context snapshot.
//!
//! Work items come off the REST API as an id plus a flat `fields` map keyed
//! by reference names (`System.Title`, `System.State`, …). [`AdoWorkItem`]
//! keeps that raw map and layers typed accessors on top; [`ItemContext`] is
//! the subset snapshotted into a query handle so selectors and previews can
//! run without re-fetching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Field reference names the core reads. Callers can request arbitrary
// extension fields on top; those travel in the raw map.
pub const FIELD_TITLE: &str = "System.Title";
pub const FIELD_STATE: &str = "System.State";
pub const FIELD_TYPE: &str = "System.WorkItemType";
pub const FIELD_TAGS: &str = "System.Tags";
pub const FIELD_ASSIGNED_TO: &str = "System.AssignedTo";
pub const FIELD_AREA_PATH: &str = "System.AreaPath";
pub const FIELD_ITERATION_PATH: &str = "System.IterationPath";
pub const FIELD_CREATED_DATE: &str = "System.CreatedDate";
pub const FIELD_CHANGED_DATE: &str = "System.ChangedDate";
pub const FIELD_CHANGED_BY: &str = "System.ChangedBy";
pub const FIELD_DESCRIPTION: &str = "System.Description";
pub const FIELD_STATE_REASON: &str = "System.Reason";

/// A work item as returned by `wit/workitems`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdoWorkItem {
    pub id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<i64>,

    #[serde(default)]
    pub fields: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<WorkItemRelation>>,
}

/// A relation entry under a work item's `relations` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemRelation {
    pub rel: String,
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
}

/// One revision from `wit/workitems/{id}/revisions`. Same shape as a work
/// item: a revision number plus the full field map at that revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItemRevision {
    #[serde(default)]
    pub rev: i64,

    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl AdoWorkItem {
    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn title(&self) -> Option<&str> {
        self.string_field(FIELD_TITLE)
    }

    pub fn state(&self) -> Option<&str> {
        self.string_field(FIELD_STATE)
    }

    pub fn work_item_type(&self) -> Option<&str> {
        self.string_field(FIELD_TYPE)
    }

    /// Tags split out of the semicolon-delimited `System.Tags` value.
    pub fn tags(&self) -> Vec<String> {
        split_tags(self.string_field(FIELD_TAGS).unwrap_or_default())
    }

    /// Assignee identity, preferring the unique name (email) over the
    /// display name. `System.AssignedTo` is an identity object on the wire.
    pub fn assigned_to(&self) -> Option<String> {
        identity_name(self.fields.get(FIELD_ASSIGNED_TO))
    }

    pub fn area_path(&self) -> Option<&str> {
        self.string_field(FIELD_AREA_PATH)
    }

    pub fn iteration_path(&self) -> Option<&str> {
        self.string_field(FIELD_ITERATION_PATH)
    }

    pub fn description(&self) -> Option<&str> {
        self.string_field(FIELD_DESCRIPTION)
    }

    pub fn created_date(&self) -> Option<DateTime<Utc>> {
        date_field(&self.fields, FIELD_CREATED_DATE)
    }

    pub fn changed_date(&self) -> Option<DateTime<Utc>> {
        date_field(&self.fields, FIELD_CHANGED_DATE)
    }
}

impl WorkItemRevision {
    pub fn changed_date(&self) -> Option<DateTime<Utc>> {
        date_field(&self.fields, FIELD_CHANGED_DATE)
    }

    /// Identity that produced this revision.
    pub fn changed_by(&self) -> Option<String> {
        identity_name(self.fields.get(FIELD_CHANGED_BY))
    }

    pub fn tags(&self) -> Vec<String> {
        split_tags(
            self.fields
                .get(FIELD_TAGS)
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )
    }
}

/// Split a semicolon-delimited ADO tag string into trimmed, non-empty tags.
pub fn split_tags(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join tags back into ADO's `; `-delimited wire format.
pub fn join_tags(tags: &[String]) -> String {
    tags.join("; ")
}

/// Extract a display/unique name from an ADO identity value, which may be a
/// plain string (old API versions) or an identity object.
fn identity_name(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj
            .get("uniqueName")
            .or_else(|| obj.get("displayName"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn date_field(fields: &Map<String, Value>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// The per-item snapshot stored inside a query handle.
///
/// Criteria selection, previews, and comment templates read only from this
/// snapshot, never from live ADO. `days_inactive` and
/// `last_substantive_change_date` are present only when the query requested
/// substantive-change analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemContext {
    pub title: String,
    pub state: String,

    #[serde(rename = "type")]
    pub item_type: String,

    pub tags: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_date: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_inactive: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_substantive_change_date: Option<DateTime<Utc>>,

    /// Whether the item had a non-trivial description at snapshot time.
    pub has_description: bool,

    /// Extra caller-requested fields, keyed by reference name.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl ItemContext {
    /// Snapshot a fetched work item, carrying along any caller-requested
    /// extension fields.
    pub fn from_work_item(item: &AdoWorkItem, extra_fields: &[String]) -> Self {
        let mut fields = Map::new();
        for name in extra_fields {
            if let Some(value) = item.fields.get(name) {
                fields.insert(name.clone(), value.clone());
            }
        }

        Self {
            title: item.title().unwrap_or_default().to_string(),
            state: item.state().unwrap_or_default().to_string(),
            item_type: item.work_item_type().unwrap_or_default().to_string(),
            tags: item.tags(),
            assigned_to: item.assigned_to(),
            area_path: item.area_path().map(str::to_string),
            iteration_path: item.iteration_path().map(str::to_string),
            changed_date: item.changed_date(),
            days_inactive: None,
            last_substantive_change_date: None,
            has_description: item
                .description()
                .map(|d| !d.trim().is_empty())
                .unwrap_or(false),
            fields,
        }
    }
}

/// Outcome of a WIQL query: the declared query type plus the ordered,
/// deduplicated id list.
#[derive(Debug, Clone)]
pub struct WiqlOutcome {
    pub query_type: String,
    pub ids: Vec<i64>,
}

/// One JSON-patch operation for `wit/workitems/{id}` PATCH calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonPatchOp {
    pub op: String,
    pub path: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl JsonPatchOp {
    /// Set a field regardless of whether it already has a value.
    pub fn set_field(field: &str, value: Value) -> Self {
        Self {
            op: "add".to_string(),
            path: format!("/fields/{field}"),
            value: Some(value),
        }
    }

    /// Remove a field entirely.
    pub fn remove_field(field: &str) -> Self {
        Self {
            op: "remove".to_string(),
            path: format!("/fields/{field}"),
            value: None,
        }
    }

    /// Append a relation.
    pub fn add_relation(rel: &str, url: &str) -> Self {
        Self {
            op: "add".to_string(),
            path: "/relations/-".to_string(),
            value: Some(serde_json::json!({ "rel": rel, "url": url })),
        }
    }
}
