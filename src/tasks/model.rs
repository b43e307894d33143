//! Forwarding task data model.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::rules::{Rule, RuleKind};

/// How a task receives messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Forward new messages as they arrive.
    #[default]
    Live,
    /// Replay the source's past messages through the backfill worker.
    History,
}

impl TaskMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::History => "history",
        }
    }
}

impl FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Self::Live),
            "history" => Ok(Self::History),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task processing flags. Unknown keys in stored JSON are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Remove URLs from the body after rules ran.
    #[serde(default)]
    pub strip_links: bool,
    /// Forward media without its caption.
    #[serde(default)]
    pub strip_captions: bool,
}

/// One forwarding task: source channel → target channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub source_id: String,
    pub target_id: String,
    pub source_title: String,
    pub target_title: String,
    pub mode: TaskMode,
    pub is_active: bool,
    /// Canonical ordered task-local rules.
    pub rules: Vec<Rule>,
    pub config: TaskConfig,
    /// Highest message ID forwarded so far. `0` = never.
    pub last_processed_id: i64,
    pub error_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// One-line summary for `/list`.
    pub fn summary(&self) -> String {
        let state = if self.is_active { "active" } else { "paused" };
        format!(
            "#{} {} -> {} [{}, {}] rules: {}, last: {}, errors: {}",
            self.id,
            display_or(&self.source_title, &self.source_id),
            display_or(&self.target_title, &self.target_id),
            self.mode,
            state,
            self.rules.len(),
            self.last_processed_id,
            self.error_count,
        )
    }
}

fn display_or<'a>(title: &'a str, fallback: &'a str) -> &'a str {
    if title.trim().is_empty() { fallback } else { title }
}

/// Fields supplied when creating a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub source_id: String,
    pub target_id: String,
    pub source_title: String,
    pub target_title: String,
    pub mode: TaskMode,
    pub is_active: bool,
    pub rules: Vec<Rule>,
    pub config: TaskConfig,
}

impl NewTask {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        let source_id = source_id.into();
        let target_id = target_id.into();
        Self {
            source_title: source_id.clone(),
            target_title: target_id.clone(),
            source_id,
            target_id,
            mode: TaskMode::Live,
            is_active: true,
            rules: Vec::new(),
            config: TaskConfig::default(),
        }
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_titles(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.source_title = source.into();
        self.target_title = target.into();
        self
    }
}

// ── Stored rule shapes ──────────────────────────────────────────────

/// Fixed legacy rule columns: one mention pair and one link pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyRules {
    pub find_user: Option<String>,
    pub replace_user: Option<String>,
    pub find_link: Option<String>,
    pub replace_link: Option<String>,
}

impl LegacyRules {
    fn pair(find: Option<&str>, replace: Option<&str>, kind: RuleKind) -> Option<Rule> {
        let find = find.map(str::trim).filter(|s| !s.is_empty())?;
        let replace = replace.filter(|s| !s.trim().is_empty())?;
        Some(Rule::new(find, replace).with_kind(kind))
    }

    /// Legacy pairs only fire when both halves are set.
    pub fn to_rules(&self) -> Vec<Rule> {
        [
            Self::pair(
                self.find_user.as_deref(),
                self.replace_user.as_deref(),
                RuleKind::Mention,
            ),
            Self::pair(
                self.find_link.as_deref(),
                self.replace_link.as_deref(),
                RuleKind::Link,
            ),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

/// Rules as found in a task row, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredRules {
    pub legacy: LegacyRules,
    pub typed: Vec<Rule>,
}

impl StoredRules {
    /// Single ordered list: legacy user rule, legacy link rule, typed rules.
    pub fn normalize(self) -> Vec<Rule> {
        let mut rules = self.legacy.to_rules();
        rules.extend(self.typed);
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_rules_come_first() {
        let stored = StoredRules {
            legacy: LegacyRules {
                find_user: Some("@old".into()),
                replace_user: Some("@new".into()),
                find_link: Some("t.me/old".into()),
                replace_link: Some("t.me/new".into()),
            },
            typed: vec![Rule::new("promo", "SKIP_MESSAGE")],
        };
        let rules = stored.normalize();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].kind, RuleKind::Mention);
        assert_eq!(rules[1].kind, RuleKind::Link);
        assert_eq!(rules[2].find, "promo");
    }

    #[test]
    fn half_set_legacy_pair_is_dropped() {
        let stored = StoredRules {
            legacy: LegacyRules {
                find_user: Some("@old".into()),
                replace_user: Some("".into()),
                find_link: None,
                replace_link: Some("t.me/new".into()),
            },
            typed: vec![],
        };
        assert!(stored.normalize().is_empty());
    }

    #[test]
    fn config_ignores_unknown_flags() {
        let config: TaskConfig =
            serde_json::from_str(r#"{"strip_links": true, "translate": "fr"}"#).unwrap();
        assert!(config.strip_links);
        assert!(!config.strip_captions);
    }

    #[test]
    fn mode_parses() {
        assert_eq!("History".parse::<TaskMode>().unwrap(), TaskMode::History);
        assert!("replay".parse::<TaskMode>().is_err());
    }
}
