use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration, assembled from defaults and `GRAPHWRIGHT_*` variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphwrightConfig {
    pub database: DatabaseConfig,
    pub executor: ExecutorConfig,
    pub resolution: ResolutionConfig,
    pub claims: ClaimConfig,
}

impl GraphwrightConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            database: DatabaseConfig::from_env(),
            executor: ExecutorConfig::from_env(),
            resolution: ResolutionConfig::from_env(),
            claims: ClaimConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "graphwright.db".to_string(),
        }
    }
}

impl DatabaseConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("GRAPHWRIGHT_DB") {
            config.path = path;
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Stop scheduling later levels once a stage in the current level fails.
    pub stop_on_error: bool,
    /// Upper bound on stages running at the same time.
    pub max_concurrency: usize,
    /// Applied to stages that do not declare their own timeout.
    pub default_stage_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stop_on_error: true,
            max_concurrency: 4,
            default_stage_timeout_secs: 600,
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_bool("GRAPHWRIGHT_STOP_ON_ERROR") {
            config.stop_on_error = v;
        }
        if let Some(v) = env_parse("GRAPHWRIGHT_MAX_CONCURRENCY") {
            config.max_concurrency = v;
        }
        if let Some(v) = env_parse("GRAPHWRIGHT_STAGE_TIMEOUT_SECS") {
            config.default_stage_timeout_secs = v;
        }
        config
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_stage_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// DBSCAN neighbourhood radius, in cosine distance.
    pub cluster_eps: f32,
    pub cluster_min_samples: usize,
    /// Existing entities offered to the oracle per cluster.
    pub candidate_k: usize,
    /// Decisions below this confidence fall back to creating a new entity.
    pub min_decision_confidence: f64,
    /// Minimum mention confidence for trusting an extractor-supplied entity link.
    pub link_confidence: f64,
    pub oracle_concurrency: usize,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            cluster_eps: 0.25,
            cluster_min_samples: 1,
            candidate_k: 5,
            min_decision_confidence: 0.6,
            link_confidence: 0.9,
            oracle_concurrency: 4,
        }
    }
}

impl ResolutionConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("GRAPHWRIGHT_CLUSTER_EPS") {
            config.cluster_eps = v;
        }
        if let Some(v) = env_parse("GRAPHWRIGHT_CLUSTER_MIN_SAMPLES") {
            config.cluster_min_samples = v;
        }
        if let Some(v) = env_parse("GRAPHWRIGHT_CANDIDATE_K") {
            config.candidate_k = v;
        }
        if let Some(v) = env_parse("GRAPHWRIGHT_MIN_CONFIDENCE") {
            config.min_decision_confidence = v;
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimConfig {
    pub conflict_detection: bool,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            conflict_detection: true,
        }
    }
}

impl ClaimConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            conflict_detection: env_bool("GRAPHWRIGHT_CONFLICT_DETECTION").unwrap_or(true),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GraphwrightConfig::default();
        assert!(config.executor.stop_on_error);
        assert!((config.resolution.cluster_eps - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.resolution.cluster_min_samples, 1);
        assert!(config.claims.conflict_detection);
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: GraphwrightConfig =
            serde_json::from_str(r#"{"resolution": {"cluster_eps": 0.4}}"#).unwrap();
        assert!((config.resolution.cluster_eps - 0.4).abs() < f32::EPSILON);
        assert_eq!(config.resolution.candidate_k, 5);
        assert_eq!(config.executor.max_concurrency, 4);
    }
}
