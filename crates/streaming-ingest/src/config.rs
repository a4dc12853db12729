// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven configuration for an ingestion run.
//!
//! Values are read once from the process environment (or an iterator of
//! pairs in tests), sanitised, and validated before any network call.
//! Identifiers such as database, schema and pipe names are treated as opaque
//! strings and only used to compose request paths.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::IngestError;
use crate::generator::GeneratorConfig;
use crate::http::{default_retryable_status, BackoffPolicy, HttpClientOptions};
use crate::orchestrator::OrchestratorConfig;
use crate::token::{Credentials, DEFAULT_TOKEN_TTL, MAX_TOKEN_TTL};

const ENV_ACCOUNT: &str = "SNOWFLAKE_ACCOUNT";
const ENV_USER: &str = "SNOWFLAKE_USER";
const ENV_PRIVATE_KEY_PATH: &str = "SNOWFLAKE_PRIVATE_KEY_PATH";
const ENV_PRIVATE_KEY_PASSPHRASE: &str = "SNOWFLAKE_PRIVATE_KEY_PASSPHRASE";
const ENV_PUBLIC_KEY_FP: &str = "SNOWFLAKE_PUBLIC_KEY_FP";
/// Overrides the control-plane URL derived from the account.
const ENV_ACCOUNT_URL: &str = "SNOWFLAKE_ACCOUNT_URL";
const ENV_DATABASE: &str = "SNOWFLAKE_DATABASE";
const ENV_SCHEMA: &str = "SNOWFLAKE_SCHEMA";
const ENV_PIPE: &str = "SNOWFLAKE_PIPE";
const ENV_CHANNEL_NAME: &str = "SNOWFLAKE_CHANNEL_NAME";
const ENV_ALLOW_PLAINTEXT: &str = "INGEST_ALLOW_PLAINTEXT";
const ENV_ACCEPT_INVALID_CERTS: &str = "INGEST_ACCEPT_INVALID_CERTS";
const ENV_REQUEST_TIMEOUT: &str = "INGEST_REQUEST_TIMEOUT_SECONDS";
const ENV_MAX_ATTEMPTS: &str = "INGEST_MAX_ATTEMPTS";
const ENV_LOG_LEVEL: &str = "INGEST_LOG_LEVEL";
const ENV_EVENTS_PER_SECOND: &str = "RFID_EVENTS_PER_SECOND";
const ENV_DURATION: &str = "RFID_DURATION_SECONDS";
const ENV_CONTINUOUS: &str = "RFID_CONTINUOUS";
const ENV_BATCH_SIZE: &str = "RFID_BATCH_SIZE";
const ENV_SEED: &str = "RFID_SEED";
const ENV_CHANNEL_COUNT: &str = "RFID_CHANNEL_COUNT";

const DEFAULT_DATABASE: &str = "RFID_BADGE_TRACKING";
const DEFAULT_SCHEMA: &str = "STAGE_BADGE_TRACKING";
const DEFAULT_PIPE: &str = "BADGE_EVENTS_PIPE";
const DEFAULT_CHANNEL: &str = "rfid_channel_1";
const DEFAULT_EVENTS_PER_SECOND: f64 = 10.0;
/// Per-channel rate floor, one event every ~17 minutes.
const MIN_EVENTS_PER_SECOND: f64 = 0.001;
const MAX_EVENTS_PER_SECOND: f64 = 100_000.0;
const DEFAULT_BATCH_SIZE: usize = 100;
const MAX_BATCH_SIZE: usize = 10_000;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Database/schema/pipe triple addressed by every request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeTarget {
    pub database: String,
    pub schema: String,
    pub pipe: String,
}

impl PipeTarget {
    fn prefix(&self) -> String {
        format!(
            "databases/{}/schemas/{}/pipes/{}",
            self.database, self.schema, self.pipe
        )
    }

    /// Path used to open (or reopen) `channel`.
    pub fn channel_path(&self, channel: &str) -> String {
        format!("/v2/streaming/{}/channels/{channel}", self.prefix())
    }

    /// Path rows for `channel` are appended to.
    pub fn rows_path(&self, channel: &str) -> String {
        format!("/v2/streaming/data/{}/channels/{channel}/rows", self.prefix())
    }

    /// Path of the bulk channel status call.
    pub fn bulk_status_path(&self) -> String {
        format!("/v2/streaming/{}:bulk-channel-status", self.prefix())
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub account: String,
    pub user: String,
    pub private_key_path: Option<String>,
    pub private_key_passphrase: Option<String>,
    pub public_key_fingerprint: Option<String>,
    pub account_url: Option<String>,
    pub target: PipeTarget,
    pub channel_name: String,
    pub allow_plaintext: bool,
    /// Skips TLS certificate validation, for local endpoints with self-signed certs.
    pub accept_invalid_certs: bool,
    pub token_ttl: Duration,
    /// Lifetime assumed for scoped tokens when the endpoint does not say.
    pub scoped_token_ttl: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub events_per_second: f64,
    pub duration: Option<Duration>,
    pub continuous: bool,
    pub seed: Option<u64>,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    pub flush_interval: Duration,
    pub channel_count: usize,
    pub max_reopen_attempts: u32,
    pub verify_on_finish: bool,
    pub log_level: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            user: String::new(),
            private_key_path: None,
            private_key_passphrase: None,
            public_key_fingerprint: None,
            account_url: None,
            target: PipeTarget {
                database: DEFAULT_DATABASE.to_string(),
                schema: DEFAULT_SCHEMA.to_string(),
                pipe: DEFAULT_PIPE.to_string(),
            },
            channel_name: DEFAULT_CHANNEL.to_string(),
            allow_plaintext: false,
            accept_invalid_certs: false,
            token_ttl: DEFAULT_TOKEN_TTL,
            scoped_token_ttl: Duration::from_secs(30 * 60),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            events_per_second: DEFAULT_EVENTS_PER_SECOND,
            duration: None,
            continuous: false,
            seed: None,
            batch_size: DEFAULT_BATCH_SIZE,
            buffer_capacity: DEFAULT_BATCH_SIZE * 10,
            flush_interval: Duration::from_secs(1),
            channel_count: 1,
            max_reopen_attempts: 3,
            verify_on_finish: true,
            log_level: "info".to_string(),
        }
    }
}

impl IngestConfig {
    /// Builds and validates configuration from the process environment.
    pub fn from_os_env() -> Result<Self, IngestError> {
        let config = Self::from_env_iter(env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Builds configuration from key/value pairs without validating it.
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let get = |key: &str| map.get(key).and_then(|value| sanitize_non_empty(value));
        let defaults = Self::default();

        let events_per_second = get(ENV_EVENTS_PER_SECOND)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(defaults.events_per_second);
        let batch_size = get(ENV_BATCH_SIZE)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.batch_size);

        Self {
            account: get(ENV_ACCOUNT).unwrap_or_default(),
            user: get(ENV_USER).unwrap_or_default(),
            private_key_path: get(ENV_PRIVATE_KEY_PATH),
            private_key_passphrase: get(ENV_PRIVATE_KEY_PASSPHRASE),
            public_key_fingerprint: get(ENV_PUBLIC_KEY_FP),
            account_url: get(ENV_ACCOUNT_URL),
            target: PipeTarget {
                database: get(ENV_DATABASE).unwrap_or(defaults.target.database),
                schema: get(ENV_SCHEMA).unwrap_or(defaults.target.schema),
                pipe: get(ENV_PIPE).unwrap_or(defaults.target.pipe),
            },
            channel_name: get(ENV_CHANNEL_NAME).unwrap_or(defaults.channel_name),
            allow_plaintext: parse_bool(get(ENV_ALLOW_PLAINTEXT).as_deref(), false),
            accept_invalid_certs: parse_bool(get(ENV_ACCEPT_INVALID_CERTS).as_deref(), false),
            request_timeout: get(ENV_REQUEST_TIMEOUT)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_attempts: get(ENV_MAX_ATTEMPTS)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_attempts),
            events_per_second,
            duration: get(ENV_DURATION)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs),
            continuous: parse_bool(get(ENV_CONTINUOUS).as_deref(), false),
            seed: get(ENV_SEED).and_then(|v| v.parse::<u64>().ok()),
            batch_size,
            buffer_capacity: batch_size.saturating_mul(10).max(1),
            channel_count: get(ENV_CHANNEL_COUNT)
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.channel_count),
            log_level: get(ENV_LOG_LEVEL)
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or(defaults.log_level),
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        for (name, value) in [
            (ENV_ACCOUNT, &self.account),
            (ENV_USER, &self.user),
            (ENV_DATABASE, &self.target.database),
            (ENV_SCHEMA, &self.target.schema),
            (ENV_PIPE, &self.target.pipe),
            (ENV_CHANNEL_NAME, &self.channel_name),
        ] {
            if value.trim().is_empty() {
                return Err(IngestError::InvalidConfig(format!("{name} cannot be empty")));
            }
        }

        if !(MIN_EVENTS_PER_SECOND..=MAX_EVENTS_PER_SECOND).contains(&self.events_per_second) {
            return Err(IngestError::InvalidConfig(format!(
                "{ENV_EVENTS_PER_SECOND} must be between {MIN_EVENTS_PER_SECOND} and {MAX_EVENTS_PER_SECOND}, got {}",
                self.events_per_second
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(IngestError::InvalidConfig(format!(
                "{ENV_BATCH_SIZE} must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.token_ttl.is_zero() || self.token_ttl > MAX_TOKEN_TTL {
            return Err(IngestError::InvalidConfig(
                "token ttl must be between 1 second and 60 minutes".to_string(),
            ));
        }
        if self.channel_count == 0 {
            return Err(IngestError::InvalidConfig(format!(
                "{ENV_CHANNEL_COUNT} must be at least 1"
            )));
        }
        let per_channel = self.events_per_second / self.channel_count as f64;
        if per_channel < MIN_EVENTS_PER_SECOND {
            return Err(IngestError::InvalidConfig(format!(
                "{ENV_EVENTS_PER_SECOND} split over {} channels is {per_channel}/s, below {MIN_EVENTS_PER_SECOND}",
                self.channel_count
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(IngestError::InvalidConfig(
                "request timeout must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(IngestError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Control-plane base URL, derived from the account unless overridden.
    pub fn control_plane_url(&self) -> String {
        match &self.account_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "https://{}.snowflakecomputing.com",
                self.account.trim().to_ascii_lowercase()
            ),
        }
    }

    /// Loads the configured private key into [`Credentials`].
    pub fn credentials(&self) -> Result<Credentials, IngestError> {
        let path = self.private_key_path.as_deref().ok_or_else(|| {
            IngestError::InvalidConfig(format!("{ENV_PRIVATE_KEY_PATH} is not set"))
        })?;
        Credentials::from_pem_file(
            self.account.clone(),
            self.user.clone(),
            path,
            self.private_key_passphrase.clone(),
            self.public_key_fingerprint.clone(),
        )
    }

    pub fn http_options(&self) -> HttpClientOptions {
        HttpClientOptions {
            allow_plaintext: self.allow_plaintext,
            accept_invalid_certs: self.accept_invalid_certs,
            request_timeout: self.request_timeout,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.max_attempts,
            retryable_status: default_retryable_status,
            ..BackoffPolicy::default()
        }
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            rate_per_second: self.events_per_second,
            duration: self.duration,
            continuous: self.continuous,
            seed: self.seed,
            ..GeneratorConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            audience: crate::token::normalize_account(&self.account),
            channel_name: self.channel_name.clone(),
            token_ttl: self.token_ttl,
            batch_size: self.batch_size,
            buffer_capacity: self.buffer_capacity,
            flush_interval: self.flush_interval,
            max_reopen_attempts: self.max_reopen_attempts,
            verify_on_finish: self.verify_on_finish,
            generator: self.generator_config(),
        }
    }
}

fn sanitize_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parses boolean values from strings, falling back to the provided default.
fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value.map(|s| s.trim().to_ascii_lowercase()) {
        Some(ref v) if ["1", "true", "t", "yes", "y"].contains(&v.as_str()) => true,
        Some(ref v) if ["0", "false", "f", "no", "n"].contains(&v.as_str()) => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_env() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_ACCOUNT, "xy12345.us-east-1"),
            (ENV_USER, "rfid_ingest"),
            (ENV_PRIVATE_KEY_PATH, "config/keys/rsa_key.p8"),
        ]
    }

    #[test]
    fn defaults_from_minimal_env() {
        let config = IngestConfig::from_env_iter(minimal_env());
        assert!(config.validate().is_ok());
        assert_eq!(config.target.database, DEFAULT_DATABASE);
        assert_eq!(config.channel_name, DEFAULT_CHANNEL);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.buffer_capacity, 1000);
        assert_eq!(config.events_per_second, 10.0);
        assert!(!config.continuous);
        assert!(!config.http_options().accept_invalid_certs);
        assert_eq!(
            config.control_plane_url(),
            "https://xy12345.us-east-1.snowflakecomputing.com"
        );
    }

    #[test]
    fn reads_overrides() {
        let mut env = minimal_env();
        env.extend([
            (ENV_ACCOUNT_URL, "http://127.0.0.1:8080/"),
            (ENV_ALLOW_PLAINTEXT, "yes"),
            (ENV_ACCEPT_INVALID_CERTS, "true"),
            (ENV_EVENTS_PER_SECOND, "250.5"),
            (ENV_DURATION, "30"),
            (ENV_BATCH_SIZE, "50"),
            (ENV_SEED, "99"),
            (ENV_CHANNEL_COUNT, "4"),
            (ENV_PIPE, "OTHER_PIPE"),
            (ENV_LOG_LEVEL, "DEBUG"),
        ]);
        let config = IngestConfig::from_env_iter(env);
        assert!(config.validate().is_ok());
        assert_eq!(config.control_plane_url(), "http://127.0.0.1:8080");
        assert!(config.allow_plaintext);
        assert!(config.http_options().accept_invalid_certs);
        assert_eq!(config.events_per_second, 250.5);
        assert_eq!(config.duration, Some(Duration::from_secs(30)));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.buffer_capacity, 500);
        assert_eq!(config.seed, Some(99));
        assert_eq!(config.channel_count, 4);
        assert_eq!(config.target.pipe, "OTHER_PIPE");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let mut env = minimal_env();
        env.push((ENV_SCHEMA, "   "));
        let config = IngestConfig::from_env_iter(env);
        assert_eq!(config.target.schema, DEFAULT_SCHEMA);
    }

    #[test]
    fn validate_rejects_missing_identity() {
        let config = IngestConfig::from_env_iter(Vec::<(String, String)>::new());
        assert!(matches!(
            config.validate(),
            Err(IngestError::InvalidConfig(msg)) if msg.contains(ENV_ACCOUNT)
        ));
    }

    #[test]
    fn validate_rejects_bad_rate_and_batch() {
        let base = IngestConfig::from_env_iter(minimal_env());
        for rate in [0.0, -1.0, 1e-20, f64::NAN, f64::INFINITY, 1e9] {
            let config = IngestConfig {
                events_per_second: rate,
                ..base.clone()
            };
            assert!(config.validate().is_err(), "rate {rate}");
        }
        let config = IngestConfig {
            events_per_second: MIN_EVENTS_PER_SECOND,
            ..base.clone()
        };
        assert!(config.validate().is_ok());
        assert!(config.generator_config().interval().is_ok());
        let config = IngestConfig {
            events_per_second: MIN_EVENTS_PER_SECOND,
            channel_count: 4,
            ..base.clone()
        };
        assert!(config.validate().is_err());
        let config = IngestConfig {
            batch_size: 0,
            ..base.clone()
        };
        assert!(config.validate().is_err());
        let config = IngestConfig {
            batch_size: MAX_BATCH_SIZE + 1,
            ..base
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_long_token_ttl_and_bad_log_level() {
        let base = IngestConfig::from_env_iter(minimal_env());
        let config = IngestConfig {
            token_ttl: Duration::from_secs(61 * 60),
            ..base.clone()
        };
        assert!(config.validate().is_err());
        let config = IngestConfig {
            log_level: "verbose".to_string(),
            ..base
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_bool_permits_common_variants() {
        assert!(parse_bool(Some("true"), false));
        assert!(parse_bool(Some("Yes"), false));
        assert!(!parse_bool(Some("0"), true));
        assert!(parse_bool(Some("maybe"), true));
        assert!(!parse_bool(None, false));
    }

    #[test]
    fn pipe_target_paths() {
        let target = PipeTarget {
            database: "DB".into(),
            schema: "SC".into(),
            pipe: "P".into(),
        };
        assert_eq!(
            target.channel_path("ch"),
            "/v2/streaming/databases/DB/schemas/SC/pipes/P/channels/ch"
        );
        assert_eq!(
            target.rows_path("ch"),
            "/v2/streaming/data/databases/DB/schemas/SC/pipes/P/channels/ch/rows"
        );
        assert_eq!(
            target.bulk_status_path(),
            "/v2/streaming/databases/DB/schemas/SC/pipes/P:bulk-channel-status"
        );
    }

    #[test]
    fn missing_key_path_is_config_error() {
        let config = IngestConfig::from_env_iter(vec![(ENV_ACCOUNT, "a"), (ENV_USER, "u")]);
        assert!(matches!(
            config.credentials(),
            Err(IngestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unreadable_key_file_is_key_error() {
        let mut env = minimal_env();
        env.retain(|(k, _)| *k != ENV_PRIVATE_KEY_PATH);
        env.push((ENV_PRIVATE_KEY_PATH, "/nonexistent/rsa_key.p8"));
        let config = IngestConfig::from_env_iter(env);
        assert!(matches!(config.credentials(), Err(IngestError::Key(_))));
    }
}
