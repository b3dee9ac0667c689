//! Consumer configuration.
//!
//! - [`ConsumerProperties`]: raw key-value configuration
//! - [`ConfigKeySpec`]: specification for a configuration key
//! - [`ConsumerConfig`]: typed configuration read by the fetcher and coordinator
//! - [`OffsetResetStrategy`]: where to start when a partition has no position

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::ConsumerError;

/// Maximum records requested from one partition per fetch call.
pub const KEY_MAX_PARTITION_FETCH_RECORDS: &str = "max.partition.fetch.records";

/// Maximum number of concurrent outstanding fetch calls.
pub const KEY_MAX_FETCH_THREADS: &str = "max.fetch.threads";

/// Error codes meaning the cursor or group session is no longer valid.
pub const DEFAULT_SESSION_INVALID_CODES: &[&str] = &["DIS.4319", "DIS.4302"];

/// Offset reset policy for partitions without a committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetResetStrategy {
    /// Start from the earliest available offset.
    Earliest,
    /// Start from the latest offset (only new records).
    Latest,
    /// Fail if no committed offset exists.
    None,
}

impl OffsetResetStrategy {
    /// Returns the configuration value string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetResetStrategy::Earliest => "earliest",
            OffsetResetStrategy::Latest => "latest",
            OffsetResetStrategy::None => "none",
        }
    }
}

impl std::str::FromStr for OffsetResetStrategy {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" | "beginning" => Ok(OffsetResetStrategy::Earliest),
            "latest" | "end" => Ok(OffsetResetStrategy::Latest),
            "none" | "error" => Ok(OffsetResetStrategy::None),
            other => Err(ConsumerError::ConfigurationError(format!(
                "invalid auto.offset.reset: '{other}' (expected earliest/latest/none)"
            ))),
        }
    }
}

impl fmt::Display for OffsetResetStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw consumer configuration as a string key-value map.
#[derive(Debug, Clone, Default)]
pub struct ConsumerProperties {
    properties: HashMap<String, String>,
}

impl ConsumerProperties {
    /// Creates an empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a property set from an existing map.
    #[must_use]
    pub fn with_properties(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Gets a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Gets a required property.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::MissingConfig` if the key is not set.
    pub fn require(&self, key: &str) -> Result<&str, ConsumerError> {
        self.get(key)
            .ok_or_else(|| ConsumerError::MissingConfig(key.to_string()))
    }

    /// Gets a property parsed as the given type.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::ConfigurationError` if the value cannot be parsed.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConsumerError>
    where
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(v) => v.trim().parse::<T>().map(Some).map_err(|e| {
                ConsumerError::ConfigurationError(format!("invalid value for '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Returns all properties.
    #[must_use]
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Checks that every required key is present.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::MissingConfig` for the first missing required key.
    pub fn validate(&self, specs: &[ConfigKeySpec]) -> Result<(), ConsumerError> {
        for spec in specs {
            if spec.required && self.get(&spec.key).is_none() {
                return Err(ConsumerError::MissingConfig(spec.key.clone()));
            }
        }
        Ok(())
    }
}

/// Specification for a configuration key.
#[derive(Debug, Clone)]
pub struct ConfigKeySpec {
    /// The configuration key name.
    pub key: String,
    /// Human-readable description.
    pub description: String,
    /// Whether this key is required.
    pub required: bool,
    /// Default value if not provided.
    pub default: Option<String>,
}

impl ConfigKeySpec {
    /// Creates a required configuration key spec.
    #[must_use]
    pub fn required(key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            required: true,
            default: None,
        }
    }

    /// Creates an optional configuration key spec with a default value.
    #[must_use]
    pub fn optional(
        key: impl Into<String>,
        description: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            required: false,
            default: Some(default.into()),
        }
    }
}

/// Returns the configuration key specifications understood by the consumer.
#[must_use]
pub fn consumer_config_keys() -> Vec<ConfigKeySpec> {
    vec![
        ConfigKeySpec::required("group.id", "Consumer group identifier"),
        ConfigKeySpec::optional(
            "auto.offset.reset",
            "Fallback when no committed offset (earliest/latest/none)",
            "latest",
        ),
        ConfigKeySpec::optional("enable.auto.commit", "Commit positions periodically", "true"),
        ConfigKeySpec::optional("auto.commit.interval.ms", "Offset commit interval", "5000"),
        ConfigKeySpec::optional(
            KEY_MAX_PARTITION_FETCH_RECORDS,
            "Max records per partition per fetch call",
            "1000",
        ),
        ConfigKeySpec::optional(
            KEY_MAX_FETCH_THREADS,
            "Max concurrent outstanding fetch calls",
            "100",
        ),
        ConfigKeySpec::optional("cursor.ttl.ms", "Local validity window of a cursor", "240000"),
        ConfigKeySpec::optional(
            "cursor.refresh.timeout.ms",
            "Max wait for cursor refreshes per fetch cycle",
            "30000",
        ),
        ConfigKeySpec::optional(
            "session.invalid.error.codes",
            "Comma-separated error codes that trigger a rebalance",
            DEFAULT_SESSION_INVALID_CODES.join(","),
        ),
    ]
}

/// Typed consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer group identifier.
    pub group_id: String,
    /// Where to start reading when no committed offset exists.
    pub auto_offset_reset: OffsetResetStrategy,
    /// Whether positions are committed periodically from `poll`.
    pub enable_auto_commit: bool,
    /// How often to auto-commit.
    pub auto_commit_interval: Duration,
    /// Record limit per partition per fetch call.
    pub max_partition_fetch_records: usize,
    /// Bound on concurrent outstanding fetch calls.
    pub max_fetch_threads: usize,
    /// Cursors older than this are refreshed before the next fetch.
    pub cursor_ttl: Duration,
    /// Bound on the cursor refresh wait in each fetch cycle.
    pub cursor_refresh_timeout: Duration,
    /// Remote error codes classified as session/cursor invalid.
    pub session_invalid_codes: Vec<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            auto_offset_reset: OffsetResetStrategy::Latest,
            enable_auto_commit: true,
            auto_commit_interval: Duration::from_secs(5),
            max_partition_fetch_records: 1000,
            max_fetch_threads: 100,
            cursor_ttl: Duration::from_secs(240),
            cursor_refresh_timeout: Duration::from_secs(30),
            session_invalid_codes: DEFAULT_SESSION_INVALID_CODES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl ConsumerConfig {
    /// Parses a [`ConsumerConfig`] from raw properties.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError` if required keys are missing or values are invalid.
    pub fn from_properties(props: &ConsumerProperties) -> Result<Self, ConsumerError> {
        props.validate(&consumer_config_keys())?;
        let mut config = Self {
            group_id: props.require("group.id")?.to_string(),
            ..Self::default()
        };

        if let Some(reset) = props.get_parsed::<OffsetResetStrategy>("auto.offset.reset")? {
            config.auto_offset_reset = reset;
        }
        if let Some(enabled) = props.get_parsed::<bool>("enable.auto.commit")? {
            config.enable_auto_commit = enabled;
        }
        if let Some(ms) = props.get_parsed::<u64>("auto.commit.interval.ms")? {
            config.auto_commit_interval = Duration::from_millis(ms);
        }
        if let Some(n) = props.get_parsed::<usize>(KEY_MAX_PARTITION_FETCH_RECORDS)? {
            config.max_partition_fetch_records = n;
        }
        if let Some(n) = props.get_parsed::<usize>(KEY_MAX_FETCH_THREADS)? {
            config.max_fetch_threads = n;
        }
        if let Some(ms) = props.get_parsed::<u64>("cursor.ttl.ms")? {
            config.cursor_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = props.get_parsed::<u64>("cursor.refresh.timeout.ms")? {
            config.cursor_refresh_timeout = Duration::from_millis(ms);
        }
        if let Some(codes) = props.get("session.invalid.error.codes") {
            config.session_invalid_codes = codes
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::ConfigurationError` for zero limits or a
    /// fetch concurrency above [`Semaphore::MAX_PERMITS`].
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.max_partition_fetch_records == 0 {
            return Err(ConsumerError::ConfigurationError(format!(
                "{KEY_MAX_PARTITION_FETCH_RECORDS} must be greater than 0"
            )));
        }
        if self.max_fetch_threads == 0 {
            return Err(ConsumerError::ConfigurationError(format!(
                "{KEY_MAX_FETCH_THREADS} must be greater than 0"
            )));
        }
        if self.max_fetch_threads > Semaphore::MAX_PERMITS {
            return Err(ConsumerError::ConfigurationError(format!(
                "{KEY_MAX_FETCH_THREADS} must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.cursor_refresh_timeout.is_zero() {
            return Err(ConsumerError::ConfigurationError(
                "cursor.refresh.timeout.ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
