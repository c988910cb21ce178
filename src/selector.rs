//! Item selectors: choosing a subset of a query handle's items.
//!
//! A selector arrives as one of three JSON shapes — the literal `"all"`, a
//! list of zero-based indices into the handle's stored order, or a criteria
//! object matched against the snapshotted item context. Parsing is strict:
//! unknown criteria keys and out-of-range indices are hard errors, never
//! silently ignored, because a silently-empty selection followed by a bulk
//! write is how agents destroy the wrong items.

use crate::handles::QueryHandle;
use crate::models::ItemContext;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;

/// A parsed item selector.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemSelector {
    All,
    Indices(Vec<usize>),
    Criteria(SelectionCriteria),
}

/// Criteria matched with AND across keys. Within `tags`, membership is
/// any-of.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,

    #[serde(rename = "types", skip_serializing_if = "Option::is_none")]
    pub item_types: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_contains: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_inactive_min: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_inactive_max: Option<i64>,
}

const KNOWN_CRITERIA_KEYS: &[&str] = &[
    "states",
    "tags",
    "types",
    "titleContains",
    "daysInactiveMin",
    "daysInactiveMax",
];

impl ItemSelector {
    /// Parse a selector from its JSON argument form.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if s == "all" => Ok(ItemSelector::All),
            Value::String(other) => Err(Error::invalid_selection(format!(
                "unknown selector string {other:?}; expected \"all\", an index list, or a criteria object"
            ))),
            Value::Array(entries) => {
                let mut indices = Vec::with_capacity(entries.len());
                for (position, entry) in entries.iter().enumerate() {
                    let index = entry.as_u64().ok_or_else(|| {
                        Error::invalid_selection(format!(
                            "selector index at position {position} is not a non-negative integer: {entry}"
                        ))
                    })?;
                    indices.push(index as usize);
                }
                Ok(ItemSelector::Indices(indices))
            }
            Value::Object(_) => Ok(ItemSelector::Criteria(SelectionCriteria::from_value(value)?)),
            other => Err(Error::invalid_selection(format!(
                "selector must be \"all\", an index list, or a criteria object; got {other}"
            ))),
        }
    }
}

impl SelectionCriteria {
    /// Parse a criteria object, rejecting unknown keys with the full list
    /// of offenders.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::invalid_selection("criteria selector must be an object"))?;

        let unknown: Vec<&str> = obj
            .keys()
            .map(String::as_str)
            .filter(|k| !KNOWN_CRITERIA_KEYS.contains(k))
            .collect();
        if !unknown.is_empty() {
            return Err(Error::invalid_selection(format!(
                "unknown criteria keys: {}; supported keys: {}",
                unknown.join(", "),
                KNOWN_CRITERIA_KEYS.join(", ")
            )));
        }

        let criteria = Self {
            states: string_list(obj.get("states"), "states")?,
            tags: string_list(obj.get("tags"), "tags")?,
            item_types: string_list(obj.get("types"), "types")?,
            title_contains: match obj.get("titleContains") {
                None => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => {
                    return Err(Error::invalid_selection(format!(
                        "titleContains must be a string, got {other}"
                    )));
                }
            },
            days_inactive_min: int_bound(obj.get("daysInactiveMin"), "daysInactiveMin")?,
            days_inactive_max: int_bound(obj.get("daysInactiveMax"), "daysInactiveMax")?,
        };

        if criteria == Self::default() {
            return Err(Error::invalid_selection(
                "criteria selector is empty; specify at least one criterion",
            ));
        }
        Ok(criteria)
    }

    fn needs_days_inactive(&self) -> bool {
        self.days_inactive_min.is_some() || self.days_inactive_max.is_some()
    }

    /// Whether one item's context satisfies every specified criterion.
    /// Items lacking `daysInactive` never match an inactivity bound.
    pub fn matches(&self, ctx: &ItemContext) -> bool {
        if let Some(states) = &self.states {
            if !states.iter().any(|s| s == &ctx.state) {
                return false;
            }
        }
        if let Some(types) = &self.item_types {
            if !types.iter().any(|t| t == &ctx.item_type) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            // any-of within the key
            let has_any = tags.iter().any(|wanted| {
                ctx.tags
                    .iter()
                    .any(|have| have.eq_ignore_ascii_case(wanted))
            });
            if !has_any {
                return false;
            }
        }
        if let Some(needle) = &self.title_contains {
            if !ctx
                .title
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if self.needs_days_inactive() {
            let Some(days) = ctx.days_inactive else {
                return false;
            };
            if let Some(min) = self.days_inactive_min {
                if days < min {
                    return false;
                }
            }
            if let Some(max) = self.days_inactive_max {
                if days > max {
                    return false;
                }
            }
        }
        true
    }
}

fn string_list(value: Option<&Value>, key: &str) -> Result<Option<Vec<String>>> {
    match value {
        None => Ok(None),
        Some(Value::Array(entries)) => {
            let mut out = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => {
                        return Err(Error::invalid_selection(format!(
                            "{key} entries must be strings, got {entry}"
                        )));
                    }
                }
            }
            Ok(Some(out))
        }
        // A bare string is accepted as a single-element list.
        Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
        Some(other) => Err(Error::invalid_selection(format!(
            "{key} must be an array of strings, got {other}"
        ))),
    }
}

fn int_bound(value: Option<&Value>, key: &str) -> Result<Option<i64>> {
    match value {
        None => Ok(None),
        Some(v) => v
            .as_i64()
            .filter(|n| *n >= 0)
            .map(Some)
            .ok_or_else(|| {
                Error::invalid_selection(format!(
                    "{key} must be a non-negative integer, got {v}"
                ))
            }),
    }
}

/// Resolve a selector against a handle, returning the ordered id subset.
pub fn resolve(handle: &QueryHandle, selector: &ItemSelector) -> Result<Vec<i64>> {
    match selector {
        ItemSelector::All => Ok(handle.work_item_ids.clone()),

        ItemSelector::Indices(indices) => {
            let len = handle.work_item_ids.len();
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::with_capacity(indices.len());
            for &index in indices {
                if index >= len {
                    return Err(Error::invalid_selection(format!(
                        "index {index} out of range; handle has {len} items (valid: 0..={})",
                        len.saturating_sub(1)
                    )));
                }
                let id = handle.work_item_ids[index];
                if seen.insert(id) {
                    out.push(id);
                }
            }
            Ok(out)
        }

        ItemSelector::Criteria(criteria) => {
            if criteria.needs_days_inactive() {
                let any_has_days = handle
                    .item_context
                    .values()
                    .any(|ctx| ctx.days_inactive.is_some());
                if !any_has_days {
                    return Err(Error::context_unavailable(
                        "daysInactive criteria require staleness data; re-run the query with includeSubstantiveChange enabled",
                    ));
                }
            }

            let matched = handle
                .work_item_ids
                .iter()
                .copied()
                .filter(|id| {
                    handle
                        .item_context
                        .get(id)
                        .map(|ctx| criteria.matches(ctx))
                        .unwrap_or(false)
                })
                .collect();
            Ok(matched)
        }
    }
}
