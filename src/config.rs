//! Configuration types.
//!
//! Every tunable has a default and can be overridden from the environment.
//! Retry counts, timeouts and rate-limit windows are deployment decisions, so
//! nothing here is hard-coded at the call sites.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default Gemini model used for report classification.
pub const DEFAULT_CLASSIFIER_MODEL: &str = "gemini-2.5-pro";

/// Classifier adapter configuration.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// API key for the remote classifier. `None` disables remote classification.
    pub api_key: Option<SecretString>,
    /// Model identifier.
    pub model: String,
    /// Upper bound on a single classification call.
    pub timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_CLASSIFIER_MODEL.to_string(),
            timeout: Duration::from_secs(8),
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .map(SecretString::from),
            model: std::env::var("CRISIS_CLASSIFIER_MODEL").unwrap_or(defaults.model),
            timeout: env_nonzero_secs("CRISIS_CLASSIFIER_TIMEOUT_SECS", defaults.timeout)?,
        })
    }
}

/// Exponential backoff for retriable dispatch failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total send attempts per intent, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Stretch each delay by a random amount of up to its own length.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_attempts: env_parse("CRISIS_DISPATCH_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: env_millis("CRISIS_DISPATCH_BASE_DELAY_MS", defaults.base_delay)?,
            multiplier: env_parse("CRISIS_DISPATCH_BACKOFF_MULTIPLIER", defaults.multiplier)?,
            max_delay: env_millis("CRISIS_DISPATCH_MAX_DELAY_MS", defaults.max_delay)?,
            jitter: env_parse("CRISIS_DISPATCH_JITTER", defaults.jitter)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("CRISIS_DISPATCH_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.multiplier < 1.0 {
            return Err(invalid("CRISIS_DISPATCH_BACKOFF_MULTIPLIER", "must be >= 1.0"));
        }
        Ok(())
    }
}

/// Per-channel send rate limit.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Sends admitted per window.
    pub max_per_window: u32,
    pub window: Duration,
    /// Waiting intents beyond this depth are shed, lowest severity first.
    pub max_queue_depth: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_per_window: 10,
            window: Duration::from_secs(1),
            max_queue_depth: 500,
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self, key: &str) -> Result<(), ConfigError> {
        if self.max_per_window == 0 {
            return Err(invalid(key, "rate must be at least 1 per window"));
        }
        if self.window.is_zero() {
            return Err(invalid(key, "window must be non-zero"));
        }
        Ok(())
    }
}

/// Dispatch coordinator configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub retry: RetryConfig,
    /// Upper bound on a single channel `send`.
    pub send_timeout: Duration,
    pub direct: ThrottleConfig,
    pub broadcast: ThrottleConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            send_timeout: Duration::from_secs(10),
            direct: ThrottleConfig {
                max_per_window: 5,
                ..ThrottleConfig::default()
            },
            broadcast: ThrottleConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let window = env_secs("CRISIS_RATE_WINDOW_SECS", defaults.broadcast.window)?;
        let depth = env_parse("CRISIS_MAX_QUEUE_DEPTH", defaults.broadcast.max_queue_depth)?;

        let direct = ThrottleConfig {
            max_per_window: env_parse("CRISIS_SMS_RATE", defaults.direct.max_per_window)?,
            window,
            max_queue_depth: depth,
        };
        direct.validate("CRISIS_SMS_RATE")?;

        let broadcast = ThrottleConfig {
            max_per_window: env_parse("CRISIS_BROADCAST_RATE", defaults.broadcast.max_per_window)?,
            window,
            max_queue_depth: depth,
        };
        broadcast.validate("CRISIS_BROADCAST_RATE")?;

        Ok(Self {
            retry: RetryConfig::from_env()?,
            send_timeout: env_nonzero_secs("CRISIS_SEND_TIMEOUT_SECS", defaults.send_timeout)?,
            direct,
            broadcast,
        })
    }
}

/// Triage pipeline configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// After this long a cycle is marked completed even if sends are outstanding.
    pub deadline: Duration,
    /// Re-classification attempts before falling back (0 or 1).
    pub classification_retries: u32,
    /// Lifetime of a public-area alert raised by the pipeline.
    pub alert_ttl: Duration,
    /// How often expired alerts are swept.
    pub sweep_interval: Duration,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            classification_retries: 1,
            alert_ttl: Duration::from_secs(6 * 3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl TriageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let classification_retries: u32 =
            env_parse("CRISIS_CLASSIFICATION_RETRIES", defaults.classification_retries)?;
        if classification_retries > 1 {
            return Err(invalid("CRISIS_CLASSIFICATION_RETRIES", "at most one retry is allowed"));
        }
        Ok(Self {
            deadline: env_nonzero_secs("CRISIS_TRIAGE_DEADLINE_SECS", defaults.deadline)?,
            classification_retries,
            alert_ttl: env_nonzero_secs("CRISIS_ALERT_TTL_SECS", defaults.alert_ttl)?,
            sweep_interval: env_nonzero_secs("CRISIS_ALERT_SWEEP_SECS", defaults.sweep_interval)?,
        })
    }
}

/// HTTP surface configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory for the rolling log file; stdout only when unset.
    pub log_dir: Option<String>,
    /// Local notification log used when SMS/Slack are not configured.
    pub notification_log: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: env_parse("CRISIS_HTTP_PORT", 8080)?,
            log_dir: std::env::var("CRISIS_LOG_DIR").ok(),
            notification_log: std::env::var("CRISIS_NOTIFICATION_LOG")
                .unwrap_or_else(|_| "./data/notifications.log".to_string()),
        })
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Parse an env var, falling back to `default` when unset. A set but
/// unparseable value is an error rather than a silent default.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("cannot parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

/// Like `env_secs`, but zero is rejected.
fn env_nonzero_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let value = env_secs(key, default)?;
    if value.is_zero() {
        return Err(invalid(key, "must be at least 1 second"));
    }
    Ok(value)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_defaults_match_documented_policy() {
        let retry = RetryConfig::default();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(8));
        assert!(retry.validate().is_ok());
    }

    #[test]
    fn retry_rejects_zero_attempts() {
        let retry = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(retry.validate().is_err());
    }

    #[test]
    fn throttle_rejects_zero_rate() {
        let throttle = ThrottleConfig {
            max_per_window: 0,
            ..ThrottleConfig::default()
        };
        assert!(throttle.validate("TEST").is_err());
    }

    #[test]
    fn env_parse_reports_garbage() {
        // SAFETY: test-local variable name, not read by any other test.
        unsafe { std::env::set_var("CRISIS_TEST_GARBAGE_PORT", "eighty") };
        let result: Result<u16, _> = env_parse("CRISIS_TEST_GARBAGE_PORT", 80);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        unsafe { std::env::remove_var("CRISIS_TEST_GARBAGE_PORT") };
    }

    #[test]
    fn zero_sweep_interval_is_rejected() {
        // SAFETY: only this test reads the sweep interval from the environment.
        unsafe { std::env::set_var("CRISIS_ALERT_SWEEP_SECS", "0") };
        let result = TriageConfig::from_env();
        unsafe { std::env::remove_var("CRISIS_ALERT_SWEEP_SECS") };
        assert!(matches!(result, Err(ConfigError::InvalidValue { key, .. }) if key == "CRISIS_ALERT_SWEEP_SECS"));
    }

    #[test]
    fn zero_send_timeout_is_rejected() {
        // SAFETY: test-local variable name, not read by any other test.
        unsafe { std::env::set_var("CRISIS_TEST_ZERO_TIMEOUT", "0") };
        let result = env_nonzero_secs("CRISIS_TEST_ZERO_TIMEOUT", Duration::from_secs(10));
        unsafe { std::env::remove_var("CRISIS_TEST_ZERO_TIMEOUT") };
        assert!(result.is_err());
        assert_eq!(
            env_nonzero_secs("CRISIS_TEST_UNSET_TIMEOUT", Duration::from_secs(10)).unwrap(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn env_parse_defaults_when_unset() {
        let value: u32 = env_parse("CRISIS_TEST_DEFINITELY_UNSET", 42).unwrap();
        assert_eq!(value, 42);
    }
}
