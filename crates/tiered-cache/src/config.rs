use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A byte size which supports both raw byte counts and human-friendly suffixes.
///
/// This is used for config values where TOML integer literals would be unwieldy.
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

        let repr = Repr::deserialize(deserializer)?;
        match repr {
            Repr::Bytes(value) => Ok(ByteSize(value)),
            Repr::Human(value) => parse_byte_size(&value)
                .map(ByteSize)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl From<u64> for ByteSize {
    fn from(value: u64) -> Self {
        ByteSize(value)
    }
}

/// Parses sizes like `"4096"`, `"512 KiB"`, `"2MB"` or `"1g"`.
///
/// Decimal and binary spellings are both treated as powers of 1024.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty byte size".to_owned());
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, suffix) = trimmed.split_at(split);
    if digits.is_empty() {
        return Err(format!("byte size {trimmed:?} does not start with a number"));
    }
    let value: u64 = digits
        .parse()
        .map_err(|err| format!("invalid byte size {trimmed:?}: {err}"))?;

    let multiplier: u64 = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        "t" | "tb" | "tib" => 1 << 40,
        other => return Err(format!("unknown byte size suffix {other:?}")),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size {trimmed:?} overflows u64"))
}

/// Settings consumed by [`crate::CacheService`].
///
/// ```toml
/// cache_dir = "/var/lib/engine/cloud_cache"
/// max_cache_size = "20GiB"
/// check_interval_ms = 30000
/// # Sweep down to 90% of the budget once it is exceeded.
/// low_water_mark = 0.9
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Root of the on-disk cache tree.
    pub cache_dir: PathBuf,

    /// Disk budget for cached content.
    pub max_cache_size: ByteSize,

    /// Delay between eviction sweeps.
    #[serde(default = "CacheConfig::default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// Fraction of `max_cache_size` a sweep reclaims down to once the budget
    /// is exceeded. `1.0` sweeps exactly to the budget.
    #[serde(default = "CacheConfig::default_low_water_mark")]
    pub low_water_mark: f64,

    /// Minimum delay between background saves of a modified access-time index.
    #[serde(default = "CacheConfig::default_index_save_interval_ms")]
    pub index_save_interval_ms: u64,
}

impl CacheConfig {
    fn default_check_interval_ms() -> u64 {
        30_000
    }

    fn default_low_water_mark() -> f64 {
        1.0
    }

    fn default_index_save_interval_ms() -> u64 {
        60_000
    }

    pub fn new(cache_dir: impl Into<PathBuf>, max_cache_size: u64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_cache_size: ByteSize(max_cache_size),
            check_interval_ms: Self::default_check_interval_ms(),
            low_water_mark: Self::default_low_water_mark(),
            index_save_interval_ms: Self::default_index_save_interval_ms(),
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = duration_to_millis(interval);
        self
    }

    pub fn with_low_water_mark(mut self, fraction: f64) -> Self {
        self.low_water_mark = fraction;
        self
    }

    pub fn with_index_save_interval(mut self, interval: Duration) -> Self {
        self.index_save_interval_ms = duration_to_millis(interval);
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn index_save_interval(&self) -> Duration {
        Duration::from_millis(self.index_save_interval_ms)
    }

    /// Usage a sweep reclaims down to once `max_cache_size` is exceeded.
    pub fn target_size(&self) -> u64 {
        let budget = self.max_cache_size.0;
        if self.low_water_mark >= 1.0 {
            return budget;
        }
        (budget as f64 * self.low_water_mark).floor() as u64
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(config_error("cache_dir must not be empty"));
        }
        if self.max_cache_size.0 == 0 {
            return Err(config_error("max_cache_size must be greater than zero"));
        }
        if self.check_interval_ms == 0 {
            return Err(config_error("check_interval_ms must be greater than zero"));
        }
        if !(self.low_water_mark > 0.0 && self.low_water_mark <= 1.0) {
            return Err(config_error(format!(
                "low_water_mark must be in (0, 1], found {}",
                self.low_water_mark
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(text: &str) -> Result<Self, CacheError> {
        let config: CacheConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CacheError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

fn duration_to_millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}

fn config_error(message: impl Into<String>) -> CacheError {
    CacheError::Config {
        message: message.into(),
    }
}
