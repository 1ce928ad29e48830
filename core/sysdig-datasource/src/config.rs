//! Configuration of a datasource instance.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::Backend;

pub const DEFAULT_URL: &str = "https://app.sysdigcloud.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasourceConfig {
    /// Base url of the Sysdig Monitor API.
    pub url: String,
    pub api_token: String,
    /// Maximum duration of an API call. Without it, a call can stay pending forever.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<Duration>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub metrics_cache: CacheConfig,
}

/// Batching of the data queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BatchConfig {
    /// Maximum number of requests per call to `api/data/batch`.
    pub max_requests_per_batch: usize,
    /// How long to wait for more queries before sending a batch.
    /// Zero sends the queries issued before the scheduler gets to run.
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
}

/// Cache of the metric and label descriptors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub max_count: usize,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub expiration: Option<Duration>,
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            url: String::from(DEFAULT_URL),
            api_token: String::new(),
            request_timeout: Some(Duration::from_secs(30)),
            batch: BatchConfig::default(),
            metrics_cache: CacheConfig::default(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_requests_per_batch: 20,
            debounce: Duration::ZERO,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_count: 10,
            expiration: Some(Duration::from_secs(60)),
        }
    }
}

impl DatasourceConfig {
    pub fn backend(&self) -> Backend {
        Backend::new(&self.url, &self.api_token)
    }
}
