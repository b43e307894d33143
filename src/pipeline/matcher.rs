//! Source matching.
//!
//! Decides whether an inbound chat is the source a task was configured
//! with. Identifiers drift in practice (`@name` vs bare id vs `-100`-prefixed
//! id), so matching goes from strict to loose and reports which branch hit.

use tracing::debug;

use crate::pipeline::types::ChannelRef;

/// Which branch matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMatch {
    Username,
    ExactId,
    /// One numeric form is a suffix of the other (`123` vs `-100123`).
    SuffixFallback,
    NoMatch,
}

impl SourceMatch {
    pub fn is_match(self) -> bool {
        !matches!(self, Self::NoMatch)
    }
}

/// Normalized form used as the index key.
pub fn normalize(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}

/// Canonical form of an operator-supplied identifier: signed integers stay
/// as they are, `t.me/name` links and bare names become `@name`.
pub fn canonical_identifier(identifier: &str) -> String {
    let trimmed = identifier.trim();
    if trimmed.is_empty() || is_signed_integer(trimmed) {
        return trimmed.to_string();
    }

    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let name = without_scheme
        .strip_prefix("t.me/")
        .or_else(|| without_scheme.strip_prefix("telegram.me/"))
        .unwrap_or(without_scheme)
        .trim_end_matches('/')
        .trim_start_matches('@');

    format!("@{name}")
}

fn is_signed_integer(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Match `task_source` against an inbound chat.
///
/// Steps, strictest first: `@username`, exact numeric id, then numeric
/// suffix containment. The suffix step only runs when `task_source` is a
/// signed integer literal, so a username or link never suffix-matches an id.
/// Store identifiers through [`canonical_identifier`] or a resolved
/// `ChannelRef::identifier()`; a raw `t.me/` link never matches.
pub fn source_matches(task_source: &str, incoming: &ChannelRef) -> SourceMatch {
    let wanted = normalize(task_source);
    if wanted.is_empty() {
        return SourceMatch::NoMatch;
    }

    if wanted.starts_with('@') {
        return match incoming.username.as_deref() {
            Some(username) if format!("@{}", username.to_lowercase()) == wanted => {
                SourceMatch::Username
            }
            _ => SourceMatch::NoMatch,
        };
    }

    let incoming_id = incoming.id.to_string();
    if wanted == incoming_id {
        return SourceMatch::ExactId;
    }

    if is_signed_integer(&wanted)
        && (incoming_id.ends_with(&wanted) || wanted.ends_with(&incoming_id))
    {
        debug!(
            source = %wanted,
            chat_id = incoming.id,
            fallback = true,
            "Source matched by id suffix"
        );
        return SourceMatch::SuffixFallback;
    }

    SourceMatch::NoMatch
}
