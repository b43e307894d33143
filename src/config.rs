//! Configuration types.
//!
//! Everything is read from the environment once at startup. A missing bot
//! token or a malformed number is a fatal `ConfigError`.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Send retry policy used by the forwarding coordinator.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total send attempts per forward (first try included).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
    /// Upper bound on a single transport call.
    pub send_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(6);
        self.base_delay.saturating_mul(1 << shift)
    }
}

/// History backfill worker pacing.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Interval between polls while there is work.
    pub poll_interval: Duration,
    /// Sleep when no history task is active.
    pub idle_interval: Duration,
    /// Pause between two forwarded historical messages.
    pub message_delay: Duration,
    /// Page size for a task that was never processed.
    pub first_page_size: usize,
    /// Page size once a checkpoint exists.
    pub page_size: usize,
    /// Consecutive task failures before the worker cools down.
    pub max_consecutive_failures: u32,
    /// Cooldown after repeated failures.
    pub failure_cooldown: Duration,
    /// Upper bound on a single resolve or history call.
    pub request_timeout: Duration,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            idle_interval: Duration::from_secs(10),
            message_delay: Duration::from_millis(2000),
            first_page_size: 100,
            page_size: 50,
            max_consecutive_failures: 3,
            failure_cooldown: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Telegram Bot API token.
    pub bot_token: SecretString,
    /// Chat that may issue operator commands. `None` disables commands.
    pub admin_chat_id: Option<i64>,
    /// SQLite database file.
    pub db_path: PathBuf,
    pub retry: RetryPolicy,
    pub backfill: BackfillConfig,
}

impl RelayConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("TELEGRAM_BOT_TOKEN")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        let admin_chat_id = parse_opt::<i64>(&lookup, "RELAY_ADMIN_CHAT_ID")?;

        let db_path = lookup("RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/relay.db"));

        let retry_defaults = RetryPolicy::default();
        let max_attempts = parse_opt::<u32>(&lookup, "RELAY_SEND_ATTEMPTS")?
            .unwrap_or(retry_defaults.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_SEND_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }
        let retry = RetryPolicy {
            max_attempts,
            base_delay: parse_opt::<u64>(&lookup, "RELAY_BACKOFF_BASE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(retry_defaults.base_delay),
            send_timeout: parse_opt::<u64>(&lookup, "RELAY_SEND_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(retry_defaults.send_timeout),
        };

        let bf = BackfillConfig::default();
        let backfill = BackfillConfig {
            poll_interval: parse_opt::<u64>(&lookup, "RELAY_BACKFILL_POLL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(bf.poll_interval),
            idle_interval: parse_opt::<u64>(&lookup, "RELAY_BACKFILL_IDLE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(bf.idle_interval),
            message_delay: parse_opt::<u64>(&lookup, "RELAY_BACKFILL_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(bf.message_delay),
            failure_cooldown: parse_opt::<u64>(&lookup, "RELAY_BACKFILL_COOLDOWN_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(bf.failure_cooldown),
            max_consecutive_failures: parse_opt::<u32>(&lookup, "RELAY_BACKFILL_MAX_FAILURES")?
                .unwrap_or(bf.max_consecutive_failures),
            request_timeout: retry.send_timeout,
            ..bf
        };

        Ok(Self {
            bot_token: SecretString::from(bot_token),
            admin_chat_id,
            db_path,
            retry,
            backfill,
        })
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_token_is_fatal() {
        let err = RelayConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn defaults_apply() {
        let config = RelayConfig::from_lookup(lookup_from(&[("TELEGRAM_BOT_TOKEN", "123:abc")])).unwrap();
        assert_eq!(config.bot_token.expose_secret(), "123:abc");
        assert_eq!(config.admin_chat_id, None);
        assert_eq!(config.db_path, PathBuf::from("./data/relay.db"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.backfill.page_size, 50);
        assert_eq!(config.backfill.first_page_size, 100);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("RELAY_ADMIN_CHAT_ID", "-42"),
            ("RELAY_SEND_ATTEMPTS", "5"),
            ("RELAY_BACKFILL_DELAY_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.admin_chat_id, Some(-42));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.backfill.message_delay, Duration::from_millis(250));
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = RelayConfig::from_lookup(lookup_from(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("RELAY_SEND_ATTEMPTS", "three"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RELAY_SEND_ATTEMPTS"));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = RelayConfig::from_lookup(lookup_from(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("RELAY_SEND_ATTEMPTS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
    }
}
