//! # Configuration
//!
//! [`Settings`] collects everything needed to run a compactor: the event loop's
//! [`CompactorOptions`] and the [`SizeTieredCompactionSchedulerOptions`] that steer
//! which compactions get proposed.
//!
//! Settings can be loaded from a JSON, TOML or YAML file, from environment
//! variables, or from a layered combination of both with [`Settings::load`].
//! Durations are written as human readable strings such as `"5s"` or `"100ms"`.
//!
//! ```no_run
//! use lsm_compactor::Settings;
//!
//! let settings = Settings::from_file("Compactor.toml").expect("failed to load settings");
//! ```

use std::path::Path;
use std::time::Duration;

use duration_str::deserialize_duration;
use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::{Figment, Metadata, Provider};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::CompactorError;

/// Top level configuration of a compactor process.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Settings {
    pub compactor_options: CompactorOptions,
    pub scheduler_options: SizeTieredCompactionSchedulerOptions,
}

impl Settings {
    /// Loads settings from a file. The format is picked from the extension, and
    /// any option the file leaves out keeps its default.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Settings, CompactorError> {
        let path = path.as_ref();
        let Some(ext) = path.extension() else {
            return Err(CompactorError::UnknownConfigurationFormat(path.into()));
        };

        let mut builder = Figment::from(Settings::default());
        match ext.to_str().unwrap_or_default() {
            "json" => builder = builder.merge(Json::file(path)),
            "toml" => builder = builder.merge(Toml::file(path)),
            "yaml" | "yml" => builder = builder.merge(Yaml::file(path)),
            _ => return Err(CompactorError::UnknownConfigurationFormat(path.into())),
        }
        builder
            .extract()
            .map_err(|e| CompactorError::InvalidConfigurationFormat(Box::new(e)))
    }

    /// Loads settings from environment variables starting with `prefix`. Nested
    /// options are separated by a dot, so `COMPACTOR_COMPACTOR_OPTIONS.POLL_INTERVAL`
    /// sets `compactor_options.poll_interval` for the prefix `COMPACTOR_`.
    pub fn from_env(prefix: &str) -> Result<Settings, CompactorError> {
        Figment::from(Settings::default())
            .merge(Env::prefixed(prefix))
            .extract()
            .map_err(|e| CompactorError::InvalidConfigurationFormat(Box::new(e)))
    }

    /// Loads settings from, in increasing priority: the defaults,
    /// `Compactor.json`, `Compactor.toml`, `Compactor.yaml`, `Compactor.yml` and
    /// environment variables prefixed with `COMPACTOR_`.
    pub fn load() -> Result<Settings, CompactorError> {
        Figment::from(Settings::default())
            .merge(Json::file("Compactor.json"))
            .merge(Toml::file("Compactor.toml"))
            .merge(Yaml::file("Compactor.yaml"))
            .merge(Yaml::file("Compactor.yml"))
            .admerge(Env::prefixed("COMPACTOR_"))
            .extract()
            .map_err(|e| CompactorError::InvalidConfigurationFormat(Box::new(e)))
    }
}

impl Provider for Settings {
    fn metadata(&self) -> Metadata {
        Metadata::named("compactor configuration options")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        figment::providers::Serialized::defaults(self).data()
    }
}

/// Options for the compactor event loop.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CompactorOptions {
    /// How often the compactor reloads the manifest and looks for new work.
    #[serde(deserialize_with = "deserialize_duration")]
    #[serde(serialize_with = "serialize_duration")]
    pub poll_interval: Duration,

    /// How long a manifest write is retried on version conflicts before giving up.
    #[serde(deserialize_with = "deserialize_duration")]
    #[serde(serialize_with = "serialize_duration")]
    pub manifest_update_timeout: Duration,

    /// The maximum number of compactions in flight at once.
    pub max_concurrent_compactions: usize,
}

impl Default for CompactorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            manifest_update_timeout: Duration::from_secs(300),
            max_concurrent_compactions: 4,
        }
    }
}

/// Options for the size-tiered compaction scheduler.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SizeTieredCompactionSchedulerOptions {
    /// The minimum number of sources to include together in a single compaction step.
    pub min_compaction_sources: usize,

    /// The maximum number of sources to include together in a single compaction step.
    pub max_compaction_sources: usize,

    /// A sorted run S joins a compaction C if S's size is at most this value
    /// times the smallest run already in C.
    pub include_size_threshold: f32,
}

impl Default for SizeTieredCompactionSchedulerOptions {
    fn default() -> Self {
        Self {
            min_compaction_sources: 4,
            max_compaction_sources: 8,
            include_size_threshold: 4.0,
        }
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    let duration_str = if secs > 0 && millis > 0 {
        format!("{secs}s+{millis:03}ms")
    } else if millis > 0 {
        format!("{millis}ms")
    } else {
        format!("{secs}s")
    };
    serializer.serialize_str(&duration_str)
}
