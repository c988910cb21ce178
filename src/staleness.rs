//! Substantive-change analysis and hygiene patterns.
//!
//! `daysInactive` is not "time since last revision": automation constantly
//! touches work items (build services re-tagging, bots bumping a
//! last-reviewed field), and that noise must not make an abandoned item
//! look alive. A revision counts as substantive only when it was made by a
//! person and changed something beyond tags and activity-tracking fields.

use crate::models::{FIELD_TAGS, WorkItemRevision};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

/// Field keys that change on every revision regardless of content.
const BOOKKEEPING_FIELDS: &[&str] = &[
    "System.Rev",
    "System.ChangedDate",
    "System.ChangedBy",
    "System.AuthorizedDate",
    "System.AuthorizedAs",
    "System.RevisedDate",
    "System.Watermark",
    "System.CommentCount",
    "System.PersonId",
];

/// Classifier for automation identities and heartbeat-only field changes.
pub struct AutomationPatterns {
    identity_patterns: Vec<Regex>,
    heartbeat_field_pattern: Regex,
}

impl AutomationPatterns {
    /// Build the default pattern set, optionally extended with the Copilot
    /// service-account GUID from configuration.
    pub fn new(copilot_guid: Option<&str>) -> Self {
        let mut sources = vec![
            r"(?i)\bbot\b".to_string(),
            r"(?i)project collection build service".to_string(),
            r"(?i)azure pipelines".to_string(),
            r"(?i)\bvsts\b".to_string(),
            r"(?i)github enterprise importer".to_string(),
        ];
        if let Some(guid) = copilot_guid {
            sources.push(regex::escape(guid));
        }

        Self {
            identity_patterns: sources
                .iter()
                .filter_map(|s| Regex::new(s).ok())
                .collect(),
            heartbeat_field_pattern: Regex::new(r"(?i)(last[-_.]?reviewed|last[-_.]?checked|heartbeat|automation)")
                .expect("valid heartbeat pattern"),
        }
    }

    /// Whether an identity string looks like an automation account.
    pub fn is_automation_identity(&self, identity: &str) -> bool {
        self.identity_patterns.iter().any(|re| re.is_match(identity))
    }

    /// Whether a field key is tag-state or activity bookkeeping rather than
    /// real content.
    fn is_heartbeat_field(&self, field: &str) -> bool {
        field == FIELD_TAGS || self.heartbeat_field_pattern.is_match(field)
    }
}

impl Default for AutomationPatterns {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Fields that differ between two consecutive revisions, bookkeeping
/// excluded.
fn changed_fields<'a>(
    previous: &'a WorkItemRevision,
    current: &'a WorkItemRevision,
) -> BTreeSet<&'a str> {
    let keys: BTreeSet<&str> = previous
        .fields
        .keys()
        .chain(current.fields.keys())
        .map(String::as_str)
        .filter(|k| !BOOKKEEPING_FIELDS.contains(k))
        .collect();

    keys.into_iter()
        .filter(|key| {
            let before = previous.fields.get(*key).unwrap_or(&Value::Null);
            let after = current.fields.get(*key).unwrap_or(&Value::Null);
            before != after
        })
        .collect()
}

/// The changed date of the most recent substantive revision, scanning
/// newest to oldest. `revisions` must be in API order (oldest first).
///
/// A revision is skipped when its author matches an automation identity, or
/// when every changed field is tags/heartbeat bookkeeping. The creation
/// revision counts as substantive unless bot-authored. Returns `None` when
/// no revision qualifies.
pub fn last_substantive_change(
    revisions: &[WorkItemRevision],
    patterns: &AutomationPatterns,
) -> Option<DateTime<Utc>> {
    for (index, revision) in revisions.iter().enumerate().rev() {
        if let Some(author) = revision.changed_by() {
            if patterns.is_automation_identity(&author) {
                continue;
            }
        }

        if index > 0 {
            let changed = changed_fields(&revisions[index - 1], revision);
            if changed.is_empty() || changed.iter().all(|f| patterns.is_heartbeat_field(f)) {
                continue;
            }
        }

        return revision.changed_date();
    }
    None
}

/// Whole days between a timestamp and now.
pub fn days_between(last: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - last).num_days().max(0)
}

/// Hygiene check: titles that are placeholders rather than descriptions of
/// work (`TBD`, `TODO`, `test`, `placeholder`, `WIP`, `fixme`, `xxx`,
/// `temp`, bare punctuation, or trivially short).
pub fn is_placeholder_title(title: &str) -> bool {
    let trimmed = title.trim();
    if trimmed.len() < 4 {
        return true;
    }
    let pattern = Regex::new(r"(?i)^(tbd|todo|test|placeholder|wip|fixme|xxx|temp|untitled|new (bug|task|item))\b")
        .expect("valid placeholder pattern");
    pattern.is_match(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revision(rev: i64, fields: Value) -> WorkItemRevision {
        serde_json::from_value(json!({ "rev": rev, "fields": fields })).unwrap()
    }

    #[test]
    fn test_automation_identity_detection() {
        let patterns = AutomationPatterns::new(Some("d3adbeef-0000-4000-8000-000000000001"));

        assert!(patterns.is_automation_identity("Project Collection Build Service (contoso)"));
        assert!(patterns.is_automation_identity("DependencyBot bot@contoso.com"));
        assert!(patterns.is_automation_identity("d3adbeef-0000-4000-8000-000000000001"));
        assert!(!patterns.is_automation_identity("Dana Developer <dana@contoso.com>"));
        // "bot" must be a standalone word
        assert!(!patterns.is_automation_identity("Abbot Costello"));
    }

    #[test]
    fn test_latest_human_content_change_wins() {
        let patterns = AutomationPatterns::default();
        let revisions = vec![
            revision(1, json!({
                "System.Title": "A",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": "2026-01-01T00:00:00Z"
            })),
            revision(2, json!({
                "System.Title": "A better title",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": "2026-02-01T00:00:00Z"
            })),
        ];

        let last = last_substantive_change(&revisions, &patterns).unwrap();
        assert_eq!(last.to_rfc3339(), "2026-02-01T00:00:00+00:00");
    }

    #[test]
    fn test_tag_only_revision_is_heartbeat() {
        let patterns = AutomationPatterns::default();
        let revisions = vec![
            revision(1, json!({
                "System.Title": "A",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": "2026-01-01T00:00:00Z"
            })),
            revision(2, json!({
                "System.Title": "A",
                "System.Tags": "stale-candidate",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": "2026-03-01T00:00:00Z"
            })),
        ];

        // The tag-only change at rev 2 is skipped; creation is the last
        // substantive revision.
        let last = last_substantive_change(&revisions, &patterns).unwrap();
        assert_eq!(last.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_bot_revision_is_skipped() {
        let patterns = AutomationPatterns::default();
        let revisions = vec![
            revision(1, json!({
                "System.Title": "A",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": "2026-01-01T00:00:00Z"
            })),
            revision(2, json!({
                "System.Title": "A",
                "System.State": "Active",
                "System.ChangedBy": "Project Collection Build Service",
                "System.ChangedDate": "2026-04-01T00:00:00Z"
            })),
        ];

        let last = last_substantive_change(&revisions, &patterns).unwrap();
        assert_eq!(last.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_activity_field_revision_is_heartbeat() {
        let patterns = AutomationPatterns::default();
        let revisions = vec![
            revision(1, json!({
                "System.Title": "A",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": "2026-01-01T00:00:00Z"
            })),
            revision(2, json!({
                "System.Title": "A",
                "Custom.LastReviewedDate": "2026-05-01",
                "System.ChangedBy": "Dana",
                "System.ChangedDate": "2026-05-01T00:00:00Z"
            })),
        ];

        let last = last_substantive_change(&revisions, &patterns).unwrap();
        assert_eq!(last.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_all_bot_history_yields_none() {
        let patterns = AutomationPatterns::default();
        let revisions = vec![revision(1, json!({
            "System.Title": "A",
            "System.ChangedBy": "ImportBot bot",
            "System.ChangedDate": "2026-01-01T00:00:00Z"
        }))];

        assert!(last_substantive_change(&revisions, &patterns).is_none());
    }

    #[test]
    fn test_days_between() {
        let last = "2026-07-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let now = "2026-07-31T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(days_between(last, now), 30);
        // Clock skew never yields negative inactivity.
        assert_eq!(days_between(now, last), 0);
    }

    #[test]
    fn test_placeholder_titles() {
        assert!(is_placeholder_title("TBD"));
        assert!(is_placeholder_title("todo: fill in"));
        assert!(is_placeholder_title("Test"));
        assert!(is_placeholder_title("New Bug"));
        assert!(is_placeholder_title("x"));
        assert!(!is_placeholder_title("Fix login timeout on retry"));
        assert!(!is_placeholder_title("Testing framework migration to nextest"));
    }
}
