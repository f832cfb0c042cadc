//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::pool::SizeClass;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between scheduler ticks when driven by `spawn_tick_loop`.
    pub tick_interval: Duration,
    /// How often a dispatched request is polled for status.
    pub poll_interval: Duration,
    /// Fixed backoff applied when a backend signals rate limiting.
    pub rate_limit_backoff: Duration,
    /// Rate-limit retries allowed for a single step before it fails the queue.
    pub max_rate_limit_retries: u32,
    /// Maximum number of archived steps kept per work item.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            poll_interval: Duration::from_millis(250),
            rate_limit_backoff: Duration::from_secs(5),
            max_rate_limit_retries: 3,
            history_limit: 200,
        }
    }
}

impl SchedulerConfig {
    /// Build a config from `GENQUEUE_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            tick_interval: env_millis("GENQUEUE_TICK_MS")?.unwrap_or(defaults.tick_interval),
            poll_interval: env_millis("GENQUEUE_POLL_MS")?.unwrap_or(defaults.poll_interval),
            rate_limit_backoff: env_millis("GENQUEUE_RATE_LIMIT_BACKOFF_MS")?
                .unwrap_or(defaults.rate_limit_backoff),
            max_rate_limit_retries: env_parse("GENQUEUE_MAX_RATE_LIMIT_RETRIES")?
                .unwrap_or(defaults.max_rate_limit_retries),
            history_limit: env_parse("GENQUEUE_HISTORY_LIMIT")?
                .unwrap_or(defaults.history_limit),
        })
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

/// One compute-backend slot (an image-generation server).
#[derive(Debug, Clone, Deserialize)]
pub struct ComputeSlotConfig {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// One model-instance slot and the job-size classes it accepts.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSlotConfig {
    pub name: String,
    #[serde(default = "default_accepts")]
    pub accepts: Vec<SizeClass>,
}

fn default_accepts() -> Vec<SizeClass> {
    vec![SizeClass::Small, SizeClass::Large]
}

/// Resource pool layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub compute_backends: Vec<ComputeSlotConfig>,
    #[serde(default)]
    pub model_instances: Vec<ModelSlotConfig>,
}

impl PoolConfig {
    /// Load a pool layout from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Parse a pool layout from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// A single local compute backend and a single model instance serving both size classes.
    pub fn local() -> Self {
        Self {
            compute_backends: vec![ComputeSlotConfig {
                name: "local".to_string(),
                url: Some("http://127.0.0.1:8188".to_string()),
            }],
            model_instances: vec![ModelSlotConfig {
                name: "local-model".to_string(),
                accepts: default_accepts(),
            }],
        }
    }
}

/// Where workflow templates and their compiled artifacts live.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    pub template_dir: PathBuf,
    pub artifact_dir: PathBuf,
    /// Remote conversion endpoint; when unset, sources are used as-is.
    pub converter_url: Option<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("./templates"),
            artifact_dir: PathBuf::from("./data/compiled"),
            converter_url: None,
        }
    }
}

impl CompilerConfig {
    /// `GENQUEUE_TEMPLATE_DIR`, `GENQUEUE_ARTIFACT_DIR` and
    /// `GENQUEUE_CONVERTER_URL`, with defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            template_dir: std::env::var("GENQUEUE_TEMPLATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.template_dir),
            artifact_dir: std::env::var("GENQUEUE_ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            converter_url: std::env::var("GENQUEUE_CONVERTER_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_from_json() {
        let config = PoolConfig::from_json(
            r#"{
                "compute_backends": [{"name": "gpu0", "url": "http://gpu0:8188"}, {"name": "gpu1"}],
                "model_instances": [{"name": "llm-small", "accepts": ["small"]}, {"name": "llm"}]
            }"#,
        )
        .unwrap();

        assert_eq!(config.compute_backends.len(), 2);
        assert_eq!(config.compute_backends[1].url, None);
        assert_eq!(config.model_instances[0].accepts, vec![SizeClass::Small]);
        assert_eq!(
            config.model_instances[1].accepts,
            vec![SizeClass::Small, SizeClass::Large]
        );
    }

    #[test]
    fn pool_config_rejects_garbage() {
        let result = PoolConfig::from_json("{ not json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.history_limit, 200);
        assert_eq!(config.max_rate_limit_retries, 3);
    }
}
