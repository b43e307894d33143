//! Global settings: the shared rule list and the audit log channel.
//!
//! Both live in the key/value `settings` table as JSON and are read fresh
//! on every forward, so operator edits apply to the next message.

use serde_json::Value;
use tracing::warn;

use crate::error::DatabaseError;
use crate::pipeline::rules::Rule;
use crate::store::Database;

pub const REPLACEMENTS_KEY: &str = "replacements";
pub const LOG_CHANNEL_KEY: &str = "log_channel";

/// Snapshot of the global settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalSettings {
    /// Applied after each task's own rules.
    pub rules: Vec<Rule>,
    /// Where forward reports go. `None` disables reporting.
    pub log_channel: Option<String>,
}

impl GlobalSettings {
    pub async fn load(store: &dyn Database) -> Result<Self, DatabaseError> {
        Ok(Self {
            rules: load_rules(store).await?,
            log_channel: load_log_channel(store).await?,
        })
    }

    /// Append a rule to the global list. Returns the new list.
    pub async fn append_rule(store: &dyn Database, rule: Rule) -> Result<Vec<Rule>, DatabaseError> {
        let mut rules = load_rules(store).await?;
        rules.push(rule);
        save_rules(store, &rules).await?;
        Ok(rules)
    }

    /// Remove the rule at 1-based `position`. `None` if out of range.
    pub async fn remove_rule(
        store: &dyn Database,
        position: usize,
    ) -> Result<Option<Rule>, DatabaseError> {
        let mut rules = load_rules(store).await?;
        if position == 0 || position > rules.len() {
            return Ok(None);
        }
        let removed = rules.remove(position - 1);
        save_rules(store, &rules).await?;
        Ok(Some(removed))
    }

    pub async fn set_log_channel(
        store: &dyn Database,
        channel: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let value = match channel.map(str::trim).filter(|c| !c.is_empty()) {
            Some(c) => Value::from(c),
            None => Value::Null,
        };
        store.set_setting(LOG_CHANNEL_KEY, &value).await
    }
}

/// Stored rules. Entries that do not parse are dropped with a warning so
/// one bad rule cannot stop forwarding.
async fn load_rules(store: &dyn Database) -> Result<Vec<Rule>, DatabaseError> {
    let entries = match store.get_setting(REPLACEMENTS_KEY).await? {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            warn!(key = REPLACEMENTS_KEY, value = %other, "Global rules are not a list; ignoring");
            return Ok(Vec::new());
        }
    };

    Ok(entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| match serde_json::from_value::<Rule>(entry) {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!(position = i + 1, "Ignoring malformed global rule: {e}");
                None
            }
        })
        .collect())
}

async fn save_rules(store: &dyn Database, rules: &[Rule]) -> Result<(), DatabaseError> {
    let value =
        serde_json::to_value(rules).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    store.set_setting(REPLACEMENTS_KEY, &value).await
}

async fn load_log_channel(store: &dyn Database) -> Result<Option<String>, DatabaseError> {
    Ok(store
        .get_setting(LOG_CHANNEL_KEY)
        .await?
        .and_then(|v| v.as_str().map(str::trim).map(String::from))
        .filter(|c| !c.is_empty()))
}
