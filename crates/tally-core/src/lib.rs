//! Core domain model for tally: projects, posts, and external activity.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tally-core";

/// Lowercases and trims a project name. This is the single normalization
/// rule for matching external activity entries against known projects;
/// two names refer to the same project iff their normalized forms are equal.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// An internal project. Owned by the post-management system; the sync engine
/// only ever writes `total_seconds` back onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_seconds: Option<f64>,
}

/// One or many external-user ids. Upstream records carry either a single
/// comma-delimited string or a proper list; both shapes deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalUsers {
    Many(Vec<String>),
    One(String),
}

impl ExternalUsers {
    /// Individual ids, trimmed, with empty fragments dropped.
    pub fn ids(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            Self::Many(items) => items.iter().map(String::as_str).collect(),
            Self::One(joined) => joined.split(',').collect(),
        };
        raw.iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// An internal work unit whose time is reconciled against external activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub last_post: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_users: Option<ExternalUsers>,
    #[serde(default)]
    pub project_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_seconds: Option<f64>,
}

/// Date range scoping one external stats query for one post/user pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributionWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Post {
    /// The window whose activity is attributed to this post.
    ///
    /// Start comes from `last_post` and end from `created_at`. The mapping
    /// reads backwards but matches how the post store records the two
    /// boundaries; do not swap it.
    pub fn attribution_window(&self) -> Option<AttributionWindow> {
        Some(AttributionWindow {
            start: self.last_post?.date_naive(),
            end: self.created_at?.date_naive(),
        })
    }

    pub fn external_user_ids(&self) -> Vec<String> {
        self.external_users
            .as_ref()
            .map(ExternalUsers::ids)
            .unwrap_or_default()
    }
}

/// One project entry as reported by the external stats API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectTime {
    pub name: String,
    pub total_seconds: f64,
}

/// Per-user, per-window activity payload. Fetched fresh every run and never
/// persisted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserActivity {
    pub projects: Vec<ProjectTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).single().unwrap()
    }

    #[test]
    fn normalization_trims_and_lowercases() {
        assert_eq!(normalize_name("  Foo Bar "), "foo bar");
        assert_eq!(normalize_name("FOO"), "foo");
        assert_eq!(normalize_name("foo"), "foo");
    }

    #[test]
    fn external_users_accept_both_shapes() {
        let one: ExternalUsers = serde_json::from_str("\"U1, U2 ,,U3\"").unwrap();
        assert_eq!(one.ids(), vec!["U1", "U2", "U3"]);

        let many: ExternalUsers = serde_json::from_str("[\" U1\", \"U2\"]").unwrap();
        assert_eq!(many.ids(), vec!["U1", "U2"]);
    }

    #[test]
    fn window_uses_last_post_as_start_and_created_at_as_end() {
        let post = Post {
            id: "p1".into(),
            last_post: Some(ts(2026, 8, 1)),
            created_at: Some(ts(2026, 8, 14)),
            external_users: Some(ExternalUsers::One("U1".into())),
            project_ids: vec!["proj1".into()],
            total_seconds: None,
        };
        let window = post.attribution_window().unwrap();
        assert_eq!(window.start, NaiveDate::from_ymd_opt(2026, 8, 1).unwrap());
        assert_eq!(window.end, NaiveDate::from_ymd_opt(2026, 8, 14).unwrap());
    }

    #[test]
    fn window_requires_both_boundaries() {
        let post = Post {
            id: "p1".into(),
            last_post: None,
            created_at: Some(ts(2026, 8, 14)),
            external_users: None,
            project_ids: vec![],
            total_seconds: None,
        };
        assert!(post.attribution_window().is_none());
        assert!(post.external_user_ids().is_empty());
    }
}
