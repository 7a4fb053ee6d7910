//! Multi-criterion issue search over an already-fetched list.
//!
//! Lists are small (a few hundred issues at most), so this is a linear
//! filter followed by a comparator sort.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::db::{DateRange, Issue, IssueType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSort {
    #[default]
    NewestFirst,
    OldestFirst,
    BySite,
    ByType,
}

impl IssueSort {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "newest" | "newest_first" => Some(IssueSort::NewestFirst),
            "oldest" | "oldest_first" => Some(IssueSort::OldestFirst),
            "site" | "by_site" => Some(IssueSort::BySite),
            "type" | "by_type" => Some(IssueSort::ByType),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueSearch {
    /// Case-insensitive; matches description, ticket, site name or type
    pub text: Option<String>,
    pub site_id: Option<String>,
    pub issue_type: Option<IssueType>,
    pub resolved: Option<bool>,
    pub submitted_by: Option<String>,
    pub range: Option<DateRange>,
    #[serde(default)]
    pub sort: IssueSort,
}

impl IssueSearch {
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().map_or(true, |t| t.trim().is_empty())
            && self.site_id.is_none()
            && self.issue_type.is_none()
            && self.resolved.is_none()
            && self.submitted_by.is_none()
            && self.range.is_none()
    }

    pub fn matches(&self, issue: &Issue, site_names: &HashMap<String, String>) -> bool {
        if let Some(site) = &self.site_id {
            if &issue.site_id != site {
                return false;
            }
        }
        if let Some(kind) = self.issue_type {
            if issue.issue_type != kind {
                return false;
            }
        }
        if let Some(resolved) = self.resolved {
            if issue.resolved != resolved {
                return false;
            }
        }
        if let Some(user) = &self.submitted_by {
            if &issue.user_submitted != user {
                return false;
            }
        }
        if let Some(range) = &self.range {
            if !range.contains(issue.timestamp) {
                return false;
            }
        }

        let needle = match self.text.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_lowercase(),
            _ => return true,
        };
        let site_name = site_names.get(&issue.site_id).map(String::as_str).unwrap_or("");
        [
            issue.description.as_str(),
            issue.ticket.as_deref().unwrap_or(""),
            site_name,
            issue.issue_type.label(),
        ]
        .iter()
        .any(|hay| hay.to_lowercase().contains(&needle))
    }

    /// Filter and sort. `site_names` maps site id to display name for text
    /// matching and site ordering.
    pub fn apply(&self, issues: &[Issue], site_names: &HashMap<String, String>) -> Vec<Issue> {
        let mut out: Vec<Issue> = issues
            .iter()
            .filter(|i| self.matches(i, site_names))
            .cloned()
            .collect();

        let newest = |a: &Issue, b: &Issue| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id));
        let site_name = |i: &Issue| -> String {
            site_names
                .get(&i.site_id)
                .cloned()
                .unwrap_or_else(|| i.site_id.clone())
                .to_lowercase()
        };

        out.sort_by(|a, b| match self.sort {
            IssueSort::NewestFirst => newest(a, b),
            IssueSort::OldestFirst => a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)),
            IssueSort::BySite => match site_name(a).cmp(&site_name(b)) {
                Ordering::Equal => newest(a, b),
                ord => ord,
            },
            IssueSort::ByType => match a.issue_type.label().cmp(b.issue_type.label()) {
                Ordering::Equal => newest(a, b),
                ord => ord,
            },
        });
        out
    }
}
