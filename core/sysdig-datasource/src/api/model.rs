//! Serde types of the backend API payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query::request::DataRequest;

/// Answer of `GET api/history/timelines`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Timelines {
    pub agents: Vec<Timeline>,
}

/// A continuous span of available data, in microseconds.
///
/// `from` and `to` are `null` when the timeline has no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub sampling: i64,
}

/// One element of `GET api/v2/history/timelines/alignments`, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alignment {
    /// Largest time span that can be requested with this alignment.
    pub max: i64,
    pub sampling: i64,
    pub align_to: i64,
}

/// Body of `POST api/data/batch`.
#[derive(Debug, Serialize)]
pub struct BatchRequest<'a> {
    pub requests: &'a [DataRequest],
}

/// Answer of `POST api/data/batch`, one response per request, in the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub responses: Vec<DataResponse>,
}

/// A row of a data response. Keys are the aliases of the request (`k0`, `v0`, ...).
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<ResponseTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<BackendError>,
}

impl DataResponse {
    /// A successful response without any row.
    pub fn empty() -> Self {
        Self {
            data: Some(Vec::new()),
            ..Default::default()
        }
    }
}

/// Time window of a data response, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseTime {
    pub from: i64,
    pub to: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling: Option<i64>,
}

/// An error reported by the backend for one request of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendError {
    pub reason: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Metric descriptor, as returned by `api/v2/metrics/descriptors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDescriptor {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub time_aggregations: Vec<String>,
    #[serde(default)]
    pub group_aggregations: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MetricDescriptorsPage {
    pub metric_descriptors: Vec<MetricDescriptor>,
}

/// Metric descriptor of the legacy `api/data/metrics` listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LegacyMetricDescriptor {
    pub id: String,
    #[serde(default)]
    pub metric_type: Option<String>,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub aggregations: Vec<String>,
    #[serde(default)]
    pub group_aggregations: Vec<String>,
}

/// Label descriptor, as returned by `api/v2/labels/descriptors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDescriptor {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LabelDescriptorsPage {
    pub label_descriptors: Vec<LabelDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LegacySegmentations {
    #[serde(default)]
    pub segmentation_metrics: Option<Vec<String>>,
}

/// Answer of `POST api/data/entity/metadata`: one row per label value.
#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct EntityMetadata {
    #[serde(default)]
    pub data: Vec<Row>,
}
