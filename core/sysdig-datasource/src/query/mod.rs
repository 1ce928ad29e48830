//! Logical queries, as issued by the panels, and their time windows.

use serde::{Deserialize, Serialize};

pub mod request;

pub use request::DataRequest;

pub const DEFAULT_METRIC: &str = "net.bytes.total";
pub const DEFAULT_TIME_AGGREGATION: &str = "timeAvg";
pub const DEFAULT_GROUP_AGGREGATION: &str = "avg";
pub const DEFAULT_PAGE_LIMIT: u32 = 10;

/// Time window requested by the user, in epoch seconds.
///
/// `sampling` is set when the caller wants a time series, and absent when it wants a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserTime {
    pub from: i64,
    pub to: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<i64>,
}

impl UserTime {
    /// Converts a Grafana range (epoch milliseconds) and its optional interval (milliseconds).
    pub fn from_millis(from_ms: i64, to_ms: i64, interval_ms: Option<i64>) -> Self {
        Self {
            from: from_ms / 1000,
            to: to_ms / 1000,
            sampling: interval_ms.filter(|ms| *ms > 0).map(|ms| ms / 1000),
        }
    }
}

/// Aligned time window that the backend accepts, in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTime {
    pub from: i64,
    pub to: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// The metric query of one panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Id of the metric, e.g. `cpu.used.percent`.
    #[serde(rename = "target")]
    pub metric: String,
    pub time_aggregation: String,
    pub group_aggregation: String,
    /// Labels to segment the metric by, in order.
    #[serde(default)]
    pub segment_by: Vec<String>,
    /// Scope expression, already resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub sort_direction: SortDirection,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    /// Series name template, see [`crate::alias`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub is_single_data_point: bool,
    #[serde(default)]
    pub is_tabular_format: bool,
}

fn default_page_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl Default for Target {
    /// The query sent for a panel that has not been configured yet.
    fn default() -> Self {
        Self {
            metric: String::from(DEFAULT_METRIC),
            time_aggregation: String::from(DEFAULT_TIME_AGGREGATION),
            group_aggregation: String::from(DEFAULT_GROUP_AGGREGATION),
            segment_by: Vec::new(),
            filter: None,
            sort_direction: SortDirection::default(),
            page_limit: DEFAULT_PAGE_LIMIT,
            alias: None,
            is_single_data_point: false,
            is_tabular_format: false,
        }
    }
}

impl Target {
    /// Creates a target for `metric` with the default aggregations.
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            ..Default::default()
        }
    }

    /// Alias of the request key that carries the `i`-th segmentation label.
    ///
    /// Time series reserve `k0` for the timestamp.
    pub fn segment_key(&self, i: usize) -> String {
        let offset = if self.is_single_data_point { 0 } else { 1 };
        format!("k{}", i + offset)
    }

    /// Aliases of all the segmentation keys, in order.
    pub fn segment_keys(&self) -> Vec<String> {
        (0..self.segment_by.len()).map(|i| self.segment_key(i)).collect()
    }
}

/// A panel query: the targets that must be fetched together.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    pub targets: Vec<Target>,
}

impl Query {
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }

    /// True if the results must be merged into one table.
    pub fn is_tabular(&self) -> bool {
        self.targets.first().is_some_and(|t| t.is_tabular_format)
    }
}
