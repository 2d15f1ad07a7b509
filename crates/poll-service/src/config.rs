//! Poll service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use base64::Engine;
use common::secret::{ExposeSecret, SecretBox, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP API bind address.
pub const DEFAULT_HTTP_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default deadline for a single poll operation in milliseconds.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 5000;

/// Default interval between lifecycle sweeps in seconds.
pub const DEFAULT_LIFECYCLE_SWEEP_INTERVAL_SECONDS: u64 = 30;

/// Default idle period after which an unwatched ephemeral poll is abandoned.
pub const DEFAULT_EPHEMERAL_IDLE_TIMEOUT_SECONDS: u64 = 600;

/// Default cap on live polls held in memory.
pub const DEFAULT_MAX_ACTIVE_POLLS: usize = 10_000;

/// Default per-subscriber outbound event buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

/// Minimum decoded length of the voting-token master secret.
pub const MIN_VOTING_TOKEN_SECRET_BYTES: usize = 32;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "poll";

/// Poll service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL. Unset means ephemeral mode: polls live only in
    /// memory and disappear when retired.
    pub redis_url: Option<SecretString>,

    /// HTTP API bind address (default: "0.0.0.0:8080").
    pub http_bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this instance.
    pub instance_id: String,

    /// Master secret for anonymous voting tokens (base64-encoded).
    pub voting_token_secret: SecretString,

    /// Deadline for one poll operation in milliseconds.
    pub operation_timeout_ms: u64,

    /// Interval between lifecycle sweeps in seconds.
    pub lifecycle_sweep_interval_seconds: u64,

    /// Idle period before an unwatched ephemeral poll is abandoned.
    pub ephemeral_idle_timeout_seconds: u64,

    /// Maximum live polls held in memory.
    pub max_active_polls: usize,

    /// Outbound event buffer per live subscriber.
    pub subscriber_buffer: usize,

    /// Emit JSON log lines instead of human-readable ones.
    pub log_json: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "redis_url",
                &self.redis_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("http_bind_address", &self.http_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("voting_token_secret", &"[REDACTED]")
            .field("operation_timeout_ms", &self.operation_timeout_ms)
            .field(
                "lifecycle_sweep_interval_seconds",
                &self.lifecycle_sweep_interval_seconds,
            )
            .field(
                "ephemeral_idle_timeout_seconds",
                &self.ephemeral_idle_timeout_seconds,
            )
            .field("max_active_polls", &self.max_active_polls)
            .field("subscriber_buffer", &self.subscriber_buffer)
            .field("log_json", &self.log_json)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required variable is missing or a value
    /// does not parse.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = vars
            .get("REDIS_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| SecretString::from(url.clone()));

        let voting_token_secret = SecretString::from(
            vars.get("POLL_VOTING_TOKEN_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("POLL_VOTING_TOKEN_SECRET".to_string()))?
                .clone(),
        );

        let http_bind_address = vars
            .get("POLL_HTTP_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HTTP_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("POLL_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let operation_timeout_ms = parse_positive(
            vars,
            "POLL_OPERATION_TIMEOUT_MS",
            DEFAULT_OPERATION_TIMEOUT_MS,
        )?;

        let lifecycle_sweep_interval_seconds = parse_positive(
            vars,
            "POLL_LIFECYCLE_SWEEP_INTERVAL_SECONDS",
            DEFAULT_LIFECYCLE_SWEEP_INTERVAL_SECONDS,
        )?;

        let ephemeral_idle_timeout_seconds = parse_positive(
            vars,
            "POLL_EPHEMERAL_IDLE_TIMEOUT_SECONDS",
            DEFAULT_EPHEMERAL_IDLE_TIMEOUT_SECONDS,
        )?;

        let max_active_polls =
            parse_positive(vars, "POLL_MAX_ACTIVE_POLLS", DEFAULT_MAX_ACTIVE_POLLS)?;

        let subscriber_buffer =
            parse_positive(vars, "POLL_SUBSCRIBER_BUFFER", DEFAULT_SUBSCRIBER_BUFFER)?;

        let log_json = match vars.get("POLL_LOG_JSON").map(String::as_str) {
            None | Some("" | "0" | "false") => false,
            Some("1" | "true") => true,
            Some(other) => {
                return Err(ConfigError::InvalidValue(format!(
                    "POLL_LOG_JSON must be true or false, got '{other}'"
                )))
            }
        };

        // Generate instance ID
        let instance_id = vars.get("POLL_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            http_bind_address,
            health_bind_address,
            instance_id,
            voting_token_secret,
            operation_timeout_ms,
            lifecycle_sweep_interval_seconds,
            ephemeral_idle_timeout_seconds,
            max_active_polls,
            subscriber_buffer,
            log_json,
        })
    }

    /// Deadline for one poll operation.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Interval between lifecycle sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle_sweep_interval_seconds)
    }

    /// Idle period before an unwatched ephemeral poll is abandoned.
    #[must_use]
    pub fn ephemeral_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ephemeral_idle_timeout_seconds)
    }

    /// Decode the voting-token master secret.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the secret is not base64 or
    /// decodes to fewer than [`MIN_VOTING_TOKEN_SECRET_BYTES`] bytes.
    pub fn voting_token_master_secret(&self) -> Result<SecretBox<Vec<u8>>, ConfigError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.voting_token_secret.expose_secret())
            .map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "POLL_VOTING_TOKEN_SECRET is not valid base64: {e}"
                ))
            })?;

        if bytes.len() < MIN_VOTING_TOKEN_SECRET_BYTES {
            return Err(ConfigError::InvalidValue(format!(
                "POLL_VOTING_TOKEN_SECRET must decode to at least \
                 {MIN_VOTING_TOKEN_SECRET_BYTES} bytes, got {}",
                bytes.len()
            )));
        }

        Ok(SecretBox::new(Box::new(bytes)))
    }
}

/// Parse an optional numeric variable that must be greater than zero.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };

    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidValue(format!(
            "{name} must be a positive integer, got '{raw}'"
        ))),
    }
}
