//! Rewrite rules engine.
//!
//! Applies an ordered list of find/replace rules to a message body:
//! task-local rules first, then global rules, each operating on the output
//! of the previous one. Two reserved replacement values act as directives:
//! - `SKIP_MESSAGE` → drop the whole message if the pattern occurs
//! - `DELETE_LINE` → drop only the lines containing the pattern
//!
//! Pure: no I/O, no shared state.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::error::RuleError;
use crate::tasks::model::TaskConfig;

/// Replacement value that discards the whole message.
pub const SKIP_MESSAGE: &str = "SKIP_MESSAGE";

/// Replacement value that removes matching lines.
pub const DELETE_LINE: &str = "DELETE_LINE";

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://\S+|www\.\S+").expect("URL pattern is valid")
});

/// Boundary behaviour of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// `@username`: no word char before, word boundary after.
    #[serde(alias = "user")]
    Mention,
    /// URL or `t.me/...` link: no word char on either side.
    Link,
    /// Plain substring.
    #[default]
    #[serde(alias = "generic")]
    Text,
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mention" | "user" => Ok(Self::Mention),
            "link" => Ok(Self::Link),
            "text" | "generic" | "" => Ok(Self::Text),
            other => Err(format!("unknown rule kind '{other}'")),
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mention => "mention",
            Self::Link => "link",
            Self::Text => "text",
        };
        f.write_str(s)
    }
}

/// A single find/replace or filter directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Literal pattern, matched case-insensitively. Empty → rule ignored.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub find: String,
    /// Replacement text or a reserved directive. Absent → empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub replace: String,
    #[serde(default, alias = "target_type")]
    pub kind: RuleKind,
}

impl Rule {
    pub fn new(find: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            find: find.into(),
            replace: replace.into(),
            kind: RuleKind::Text,
        }
    }

    pub fn with_kind(mut self, kind: RuleKind) -> Self {
        self.kind = kind;
        self
    }

    /// Interpret the replacement field.
    pub fn directive(&self) -> Directive<'_> {
        match self.replace.trim() {
            SKIP_MESSAGE => Directive::SkipMessage,
            DELETE_LINE => Directive::DeleteLine,
            _ => Directive::Replace(&self.replace),
        }
    }

    fn compile(&self) -> Result<Regex, RuleError> {
        RegexBuilder::new(&regex::escape(&self.find))
            .case_insensitive(true)
            .build()
            .map_err(|e| RuleError::InvalidPattern {
                find: self.find.clone(),
                reason: e.to_string(),
            })
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parsed meaning of a rule's `replace` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive<'a> {
    SkipMessage,
    DeleteLine,
    Replace(&'a str),
}

/// Final decision for a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Forward(String),
    Skip { pattern: String },
}

/// Outcome plus the human-readable change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transformation {
    pub outcome: RuleOutcome,
    pub changes: Vec<String>,
}

/// Apply `task_rules ++ global_rules` to `text`, then link stripping.
pub fn apply(
    text: &str,
    task_rules: &[Rule],
    global_rules: &[Rule],
    config: &TaskConfig,
) -> Transformation {
    let mut changes = Vec::new();

    if text.is_empty() {
        return Transformation {
            outcome: RuleOutcome::Forward(String::new()),
            changes,
        };
    }

    let mut current = text.to_string();

    for rule in task_rules.iter().chain(global_rules) {
        if rule.find.is_empty() {
            continue;
        }

        let regex = match rule.compile() {
            Ok(re) => re,
            Err(e) => {
                warn!(error = %e, "Skipping rule");
                continue;
            }
        };

        match rule.directive() {
            Directive::SkipMessage => {
                if regex.is_match(&current) {
                    debug!(pattern = %rule.find, "Skip rule matched");
                    changes.push(format!("Skipped: matched '{}'", rule.find));
                    return Transformation {
                        outcome: RuleOutcome::Skip {
                            pattern: rule.find.clone(),
                        },
                        changes,
                    };
                }
            }
            Directive::DeleteLine => {
                let total = current.split('\n').count();
                let kept: Vec<&str> = current.split('\n').filter(|l| !regex.is_match(l)).collect();
                let removed = total - kept.len();
                if removed > 0 {
                    current = kept.join("\n");
                    changes.push(format!("Deleted {removed} line(s) containing '{}'", rule.find));
                }
            }
            Directive::Replace(replacement) => {
                let (next, count) = replace_all(&current, &regex, replacement, rule.kind);
                if count > 0 {
                    current = next;
                    changes.push(format!("Replaced '{}' -> '{}'", rule.find, replacement));
                }
            }
        }
    }

    if config.strip_links {
        let count = URL_PATTERN.find_iter(&current).count();
        if count > 0 {
            current = URL_PATTERN.replace_all(&current, "").into_owned();
            changes.push(format!("Stripped {count} links."));
        }
    }

    Transformation {
        outcome: RuleOutcome::Forward(current.trim().to_string()),
        changes,
    }
}

/// Replace every boundary-respecting match. Returns the new text and the count.
///
/// A candidate rejected by the boundary check consumes only its first char,
/// so an overlapping later candidate is still considered.
fn replace_all(text: &str, regex: &Regex, replacement: &str, kind: RuleKind) -> (String, usize) {
    if kind == RuleKind::Text {
        let count = regex.find_iter(text).count();
        if count == 0 {
            return (text.to_string(), 0);
        }
        return (regex.replace_all(text, NoExpand(replacement)).into_owned(), count);
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut pos = 0;
    let mut count = 0;

    while pos <= text.len() {
        let Some(m) = regex.find_at(text, pos) else {
            break;
        };
        if boundaries_hold(text, m.start(), m.end(), kind) {
            out.push_str(&text[last..m.start()]);
            out.push_str(replacement);
            last = m.end();
            count += 1;
            pos = m.end().max(next_char(text, m.start()));
        } else {
            pos = next_char(text, m.start());
        }
    }

    out.push_str(&text[last..]);
    (out, count)
}

fn next_char(text: &str, i: usize) -> usize {
    text[i..]
        .chars()
        .next()
        .map_or(text.len() + 1, |c| i + c.len_utf8())
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn boundaries_hold(text: &str, start: usize, end: usize, kind: RuleKind) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    let clear_before = before.is_none_or(|c| !is_word(c));

    match kind {
        RuleKind::Text => true,
        RuleKind::Link => clear_before && after.is_none_or(|c| !is_word(c)),
        RuleKind::Mention => {
            let last = text[start..end].chars().next_back();
            clear_before && last.is_some_and(is_word) != after.is_some_and(is_word)
        }
    }
}
