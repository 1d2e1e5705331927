use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use reclaim_memory::{MemoryOptions, ThresholdOptions};
use thiserror::Error;

mod logging;
mod schema;

pub use logging::{init_tracing, LoggingConfig};
pub use schema::json_schema;

/// Top-level `reclaim.toml`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct ReclaimConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A byte size which supports both raw byte counts and human-friendly suffixes
/// (`"256MiB"`, `"1.5G"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Human(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(value) => Ok(ByteSize(value)),
            Repr::Human(value) => reclaim_memory::parse_byte_size(&value)
                .map(ByteSize)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl JsonSchema for ByteSize {
    fn schema_name() -> String {
        "ByteSize".to_owned()
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        schemars::schema::SchemaObject {
            metadata: Some(Box::new(schemars::schema::Metadata {
                description: Some(
                    "Byte count, or a string with a binary suffix such as \"64MiB\" or \"1.5G\"."
                        .to_owned(),
                ),
                ..Default::default()
            })),
            subschemas: Some(Box::new(schemars::schema::SubschemaValidation {
                any_of: Some(vec![
                    generator.subschema_for::<u64>(),
                    generator.subschema_for::<String>(),
                ]),
                ..Default::default()
            })),
            ..Default::default()
        }
        .into()
    }
}

/// Activation thresholds for `Warning`, `Critical` and `Emergency`.
/// `critical` is required; the other two levels are optional.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum ThresholdsConfig {
    /// Fractions of `memory.max_budget`, each in `(0, 1]`.
    Percentage {
        #[serde(default)]
        warning: Option<f64>,
        critical: f64,
        #[serde(default)]
        emergency: Option<f64>,
    },
    /// Absolute resident sizes.
    Absolute {
        #[serde(default)]
        warning: Option<ByteSize>,
        critical: ByteSize,
        #[serde(default)]
        emergency: Option<ByteSize>,
    },
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        ThresholdsConfig::Percentage {
            warning: Some(0.70),
            critical: 0.85,
            emergency: Some(0.95),
        }
    }
}

impl ThresholdsConfig {
    fn to_options(&self) -> ThresholdOptions {
        match *self {
            ThresholdsConfig::Percentage {
                warning,
                critical,
                emergency,
            } => ThresholdOptions::Percentage {
                warning,
                critical,
                emergency,
            },
            ThresholdsConfig::Absolute {
                warning,
                critical,
                emergency,
            } => ThresholdOptions::Absolute {
                warning: warning.map(|size| size.0),
                critical: critical.0,
                emergency: emergency.map(|size| size.0),
            },
        }
    }
}

/// `[memory]`: budget, thresholds, sampling cadence and pool sizing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[schemars(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Total memory ceiling percentage thresholds are relative to.
    #[serde(default = "MemoryConfig::default_max_budget")]
    pub max_budget: ByteSize,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    /// Seconds between usage samples.
    #[serde(default = "MemoryConfig::default_sampling_interval_secs")]
    #[schemars(range(min = 1))]
    pub sampling_interval_secs: u64,

    /// Minimum seconds between the end of one cleanup pass and the next
    /// automatic pass.
    #[serde(default = "MemoryConfig::default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Minimum seconds between two high-pressure advisories.
    #[serde(default = "MemoryConfig::default_advisory_cooldown_secs")]
    pub advisory_cooldown_secs: u64,

    /// Upper bound on a single cleanup handler, in milliseconds. Unset means
    /// handlers may run indefinitely.
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub handler_timeout_ms: Option<u64>,

    /// Capacity for pools without an entry in `[memory.pools]`.
    #[serde(default = "MemoryConfig::default_pool_capacity")]
    pub default_pool_capacity: ByteSize,

    /// Per-pool capacities keyed by pool name.
    #[serde(default)]
    pub pools: BTreeMap<String, ByteSize>,

    /// Pool entries idle for longer than this many seconds are released by
    /// routine cleanup.
    #[serde(default = "MemoryConfig::default_idle_window_secs")]
    pub idle_window_secs: u64,

    /// Tighter idle window used under critical pressure.
    #[serde(default = "MemoryConfig::default_aggressive_idle_window_secs")]
    pub aggressive_idle_window_secs: u64,
}

impl MemoryConfig {
    fn default_max_budget() -> ByteSize {
        ByteSize(reclaim_memory::GB)
    }

    fn default_sampling_interval_secs() -> u64 {
        5
    }

    fn default_cooldown_secs() -> u64 {
        30
    }

    fn default_advisory_cooldown_secs() -> u64 {
        120
    }

    fn default_pool_capacity() -> ByteSize {
        ByteSize(64 * reclaim_memory::MB)
    }

    fn default_idle_window_secs() -> u64 {
        300
    }

    fn default_aggressive_idle_window_secs() -> u64 {
        30
    }

    /// Semantic problems that the TOML types cannot express.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.sampling_interval_secs == 0 {
            errors.push("memory.sampling_interval_secs must be greater than zero".to_owned());
        }
        if self.handler_timeout_ms == Some(0) {
            errors.push("memory.handler_timeout_ms must be greater than zero when set".to_owned());
        }
        if self.aggressive_idle_window_secs > self.idle_window_secs {
            errors.push(format!(
                "memory.aggressive_idle_window_secs ({}) must not exceed memory.idle_window_secs ({})",
                self.aggressive_idle_window_secs, self.idle_window_secs
            ));
        }
        if self.default_pool_capacity.0 == 0 {
            errors.push("memory.default_pool_capacity must be greater than zero".to_owned());
        }
        for (name, capacity) in &self.pools {
            if capacity.0 == 0 {
                errors.push(format!("memory.pools.{name} must be greater than zero"));
            }
        }

        if let ThresholdsConfig::Percentage {
            warning,
            critical,
            emergency,
        } = self.thresholds
        {
            let fractions = [
                ("warning", warning),
                ("critical", Some(critical)),
                ("emergency", emergency),
            ];
            for (level, fraction) in fractions {
                if let Some(fraction) = fraction {
                    if !(fraction > 0.0 && fraction <= 1.0) {
                        errors.push(format!(
                            "memory.thresholds.{level} must be in (0, 1], got {fraction}"
                        ));
                    }
                }
            }
        }

        if let Err(err) = self.thresholds.to_options().resolve(self.max_budget.0) {
            errors.push(err.to_string());
        }

        errors
    }

    /// Convert to the runtime options. Does not validate; see
    /// [`ReclaimConfig::memory_options`].
    pub fn to_options(&self) -> MemoryOptions {
        MemoryOptions {
            max_budget_bytes: self.max_budget.0,
            thresholds: self.thresholds.to_options(),
            sampling_interval: Duration::from_secs(self.sampling_interval_secs),
            cooldown: Duration::from_secs(self.cooldown_secs),
            advisory_cooldown: Duration::from_secs(self.advisory_cooldown_secs),
            handler_timeout: self.handler_timeout_ms.map(Duration::from_millis),
            default_pool_capacity_bytes: self.default_pool_capacity.0,
            pool_capacities: self
                .pools
                .iter()
                .map(|(name, capacity)| (name.clone(), capacity.0))
                .collect(),
            idle_window: Duration::from_secs(self.idle_window_secs),
            aggressive_idle_window: Duration::from_secs(self.aggressive_idle_window_secs),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_budget: Self::default_max_budget(),
            thresholds: ThresholdsConfig::default(),
            sampling_interval_secs: Self::default_sampling_interval_secs(),
            cooldown_secs: Self::default_cooldown_secs(),
            advisory_cooldown_secs: Self::default_advisory_cooldown_secs(),
            handler_timeout_ms: None,
            default_pool_capacity: Self::default_pool_capacity(),
            pools: BTreeMap::new(),
            idle_window_secs: Self::default_idle_window_secs(),
            aggressive_idle_window_secs: Self::default_aggressive_idle_window_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // `Display` embeds a source snippet; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

/// Non-fatal findings from loading a config.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigDiagnostics {
    /// Keys present in the TOML that `ReclaimConfig` does not recognize,
    /// as dotted paths (`memory.sampling_intervall_secs`).
    pub unknown_keys: Vec<String>,
}

impl ConfigDiagnostics {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unknown_keys.is_empty()
    }
}

impl ReclaimConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_from_path_with_diagnostics(path).map(|(config, _)| config)
    }

    /// Load a config file and report unknown keys. Unknown keys are ignored,
    /// not rejected.
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let (config, diagnostics) = Self::load_from_str_with_diagnostics(&text)?;
        tracing::debug!(
            target: "reclaim.config",
            path = %path.display(),
            unknown_keys = diagnostics.unknown_keys.len(),
            "loaded config"
        );
        Ok((config, diagnostics))
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (config, unknown_keys) = deserialize_toml_with_unknown_keys(text)?;
        for key in &unknown_keys {
            tracing::warn!(target: "reclaim.config", key = %key, "ignoring unknown config key");
        }
        Ok((config, ConfigDiagnostics { unknown_keys }))
    }

    /// Check semantic constraints (increasing thresholds, non-zero
    /// intervals, fractions in `(0, 1]`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let errors = self.memory.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Validated runtime options for `reclaim_memory::MemorySystem`.
    pub fn memory_options(&self) -> Result<MemoryOptions, ConfigError> {
        self.validate()?;
        Ok(self.memory.to_options())
    }
}

fn deserialize_toml_with_unknown_keys<T: DeserializeOwned>(
    text: &str,
) -> Result<(T, Vec<String>), toml::de::Error> {
    let mut unknown = Vec::<String>::new();
    let deserializer = toml::de::Deserializer::new(text);
    let value = serde_ignored::deserialize(deserializer, |path| {
        unknown.push(path.to_string().trim_start_matches('.').to_owned());
    })?;
    unknown.sort();
    unknown.dedup();
    Ok((value, unknown))
}
