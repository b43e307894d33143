//! Error types for the relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transport-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to resolve {identifier} on channel {name}: {reason}")]
    ResolveFailed {
        name: String,
        identifier: String,
        reason: String,
    },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Rate limited on channel {name}, retry after {retry_after:?}")]
    RateLimited {
        name: String,
        retry_after: Option<Duration>,
    },

    #[error("Channel {name} call timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("History unavailable on channel {name}: {reason}")]
    HistoryUnavailable { name: String, reason: String },
}

/// Errors raised while compiling a single rewrite rule.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid pattern '{find}': {reason}")]
    InvalidPattern { find: String, reason: String },
}

/// Operator command failures. The display string is what the operator sees.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Usage: {0}")]
    Usage(String),

    #[error("`{0}` is required.")]
    MissingField(String),

    #[error("Invalid value for `{field}`: {value}")]
    InvalidField { field: String, value: String },

    #[error("Invalid task ID: {0}")]
    InvalidTaskId(String),

    #[error("Task {0} not found.")]
    TaskNotFound(i64),

    #[error("No global rule at position {0}.")]
    RuleNotFound(usize),

    #[error("Could not resolve {identifier}: {reason}")]
    Resolve { identifier: String, reason: String },

    #[error("Storage failure: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_read_as_operator_replies() {
        assert_eq!(
            CommandError::MissingField("target".into()).to_string(),
            "`target` is required."
        );
        assert_eq!(CommandError::TaskNotFound(4).to_string(), "Task 4 not found.");
    }

    #[test]
    fn sub_errors_convert_into_top_level() {
        let err: Error = ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "chat not found".into(),
        }
        .into();
        assert!(matches!(err, Error::Channel(_)));
        assert!(err.to_string().contains("chat not found"));
    }
}
