use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::pager::{validate_page_size, DEFAULT_PAGE_SIZE};

/// How commits are flushed to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DurabilityMode {
    /// Every commit syncs the WAL before returning.
    FsyncPerCommit,
    /// Commits sync every `batched_sync_commits` commits; a crash may lose
    /// the most recent unsynced commits, never a prefix of them.
    Batched,
}

impl DurabilityMode {
    /// Returns the string representation of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            DurabilityMode::FsyncPerCommit => "fsync-per-commit",
            DurabilityMode::Batched => "batched",
        }
    }

    /// Parses a durability mode (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fsync-per-commit" | "full" => Some(DurabilityMode::FsyncPerCommit),
            "batched" | "normal" => Some(DurabilityMode::Batched),
            _ => None,
        }
    }
}

impl fmt::Display for DurabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for DurabilityMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DurabilityMode::parse(&value).ok_or_else(|| format!("unknown durability mode '{value}'"))
    }
}

impl From<DurabilityMode> for String {
    fn from(mode: DurabilityMode) -> Self {
        mode.as_str().to_string()
    }
}

/// Errors raised while loading or validating a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The TOML did not match the config schema.
    #[error("failed to parse config: {source}")]
    Parse {
        /// Underlying TOML error.
        #[from]
        source: toml::de::Error,
    },
    /// A field holds an unusable value.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Database configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Commit flushing policy.
    pub durability: DurabilityMode,
    /// Committed WAL frames that trigger a background checkpoint; 0 disables
    /// the frame trigger.
    pub checkpoint_interval_frames: u64,
    /// Page size for newly created databases. Existing files keep theirs.
    pub page_size: u32,
    /// How long `begin_write` waits for the writer slot.
    #[serde(rename = "busy_timeout_ms", with = "millis")]
    pub busy_timeout: Duration,
    /// In batched mode, number of commits between WAL syncs.
    pub batched_sync_commits: u32,
    /// Optional timer for background checkpoints.
    #[serde(rename = "checkpoint_interval_ms", with = "option_millis")]
    pub checkpoint_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::FsyncPerCommit,
            checkpoint_interval_frames: 1000,
            page_size: DEFAULT_PAGE_SIZE,
            busy_timeout: Duration::from_secs(5),
            batched_sync_commits: 32,
            checkpoint_interval: None,
        }
    }
}

impl Config {
    /// Every commit is durable when it returns.
    pub fn durable() -> Self {
        Self::default()
    }

    /// Batched syncs and less frequent checkpoints.
    pub fn fast() -> Self {
        Self {
            durability: DurabilityMode::Batched,
            checkpoint_interval_frames: 5000,
            page_size: DEFAULT_PAGE_SIZE,
            busy_timeout: Duration::from_secs(1),
            batched_sync_commits: 64,
            checkpoint_interval: Some(Duration::from_secs(1)),
        }
    }

    /// Parses a TOML document; unspecified fields keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Checks field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_page_size(self.page_size).map_err(|_| ConfigError::Invalid {
            field: "page_size",
            reason: "must be a power of two between 512 and 65536",
        })?;
        if self.batched_sync_commits == 0 {
            return Err(ConfigError::Invalid {
                field: "batched_sync_commits",
                reason: "must be at least 1",
            });
        }
        if matches!(self.checkpoint_interval, Some(interval) if interval.is_zero()) {
            return Err(ConfigError::Invalid {
                field: "checkpoint_interval_ms",
                reason: "must be positive when set",
            });
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
