//! Lookup of the metric and label descriptors, with caching.

use std::{collections::BTreeMap, sync::Arc};

use indexmap::IndexMap;

use crate::{
    api::{
        ApiRequest, Backend, Transport, TransportError,
        model::{
            LabelDescriptor, LabelDescriptorsPage, LegacyMetricDescriptor, LegacySegmentations, MetricDescriptor,
            MetricDescriptorsPage,
        },
    },
    cache::{Cache, Clock, SystemClock},
    config::CacheConfig,
    error::DatasourceError,
};

/// Value types that can be plotted.
pub const PLOTTABLE_METRIC_TYPES: [&str; 6] = ["%", "byte", "date", "int", "number", "relativeTime"];

/// Metric types that can be aggregated over time and groups.
const AGGREGATED_METRIC_TYPES: [&str; 3] = ["counter", "gauge", "histogram"];

const DEFAULT_GROUP_AGGREGATIONS: [&str; 4] = ["avg", "sum", "min", "max"];

/// Options of a metric descriptor lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsQuery {
    /// Only return the metrics whose id contains this text.
    pub match_text: Option<String>,
    /// Include the labels, that are not plottable, in the result.
    pub are_labels_included: bool,
    pub plottable_metric_types: Vec<String>,
}

impl Default for MetricsQuery {
    fn default() -> Self {
        Self {
            match_text: None,
            are_labels_included: false,
            plottable_metric_types: PLOTTABLE_METRIC_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl MetricsQuery {
    pub fn matching(text: impl Into<String>) -> Self {
        Self {
            match_text: Some(text.into()),
            ..Default::default()
        }
    }

    fn options(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("match", self.match_text.clone().unwrap_or_default()),
            ("areLabelsIncluded", self.are_labels_included.to_string()),
            ("plottableMetricTypes", self.plottable_metric_types.join(",")),
        ])
    }

    fn metric_types(&self) -> Vec<&'static str> {
        if self.are_labels_included {
            Vec::new()
        } else {
            AGGREGATED_METRIC_TYPES.to_vec()
        }
    }
}

/// Options of a label descriptor lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelsQuery {
    /// Only return the labels available for this metric.
    pub metric: Option<String>,
    pub match_text: Option<String>,
}

impl LabelsQuery {
    pub fn for_metric(metric: impl Into<String>) -> Self {
        Self {
            metric: Some(metric.into()),
            match_text: None,
        }
    }

    fn options(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("metric", self.metric.clone().unwrap_or_default()),
            ("match", self.match_text.clone().unwrap_or_default()),
        ])
    }
}

/// Key of a cached lookup: the backend and the options, in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    backend: Backend,
    options: BTreeMap<&'static str, String>,
}

/// Finds metric and label descriptors.
///
/// Results are cached per backend and per lookup options, and concurrent identical lookups
/// share the same backend request.
pub struct MetricsService {
    transport: Arc<dyn Transport>,
    metrics: Cache<LookupKey, Arc<Vec<MetricDescriptor>>, DatasourceError>,
    labels: Cache<LookupKey, Arc<Vec<LabelDescriptor>>, DatasourceError>,
}

impl MetricsService {
    pub fn new(transport: Arc<dyn Transport>, config: &CacheConfig) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    pub fn with_clock(transport: Arc<dyn Transport>, config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            metrics: Cache::with_clock(config.max_count, config.expiration, clock.clone()),
            labels: Cache::with_clock(config.max_count, config.expiration, clock),
        }
    }

    pub async fn find_metrics(
        &self,
        backend: &Backend,
        query: &MetricsQuery,
    ) -> Result<Vec<MetricDescriptor>, DatasourceError> {
        let key = LookupKey {
            backend: backend.clone(),
            options: query.options(),
        };
        let transport = self.transport.clone();
        let backend = backend.clone();
        let query = query.clone();
        let descriptors = self
            .metrics
            .get_or_load(key, move || async move {
                fetch_metric_descriptors(&transport, &backend, &query).await.map(Arc::new)
            })
            .await?;
        Ok(descriptors.as_ref().clone())
    }

    pub async fn find_labels(
        &self,
        backend: &Backend,
        query: &LabelsQuery,
    ) -> Result<Vec<LabelDescriptor>, DatasourceError> {
        let key = LookupKey {
            backend: backend.clone(),
            options: query.options(),
        };
        let transport = self.transport.clone();
        let backend = backend.clone();
        let query = query.clone();
        let descriptors = self
            .labels
            .get_or_load(key, move || async move {
                fetch_label_descriptors(&transport, &backend, &query).await.map(Arc::new)
            })
            .await?;
        Ok(descriptors.as_ref().clone())
    }
}

async fn fetch_metric_descriptors(
    transport: &Arc<dyn Transport>,
    backend: &Backend,
    query: &MetricsQuery,
) -> Result<Vec<MetricDescriptor>, DatasourceError> {
    let metric_types = query.metric_types();
    let types = if query.are_labels_included {
        String::new()
    } else {
        query.plottable_metric_types.join(",")
    };
    let request = ApiRequest::get("api/v2/metrics/descriptors")
        .with_query("offset", "0")
        .with_query("limit", "100")
        .with_query("filter", query.match_text.clone().unwrap_or_default())
        .with_query("types", types)
        .with_query("metricTypes", metric_types.join(","));

    match transport.send(backend, request).await {
        Ok(response) => Ok(response.decode::<MetricDescriptorsPage>()?.metric_descriptors),
        Err(TransportError::Status { status: 500, .. }) => {
            log::debug!("metric descriptors not supported by {}, using the legacy listing", backend.url);
            let request = ApiRequest::get("api/data/metrics").with_query("light", "true");
            let legacy: IndexMap<String, LegacyMetricDescriptor> = transport.send(backend, request).await?.decode()?;
            Ok(legacy
                .into_values()
                .map(|d| upgrade_legacy_descriptor(d, &metric_types))
                .collect())
        }
        Err(e) => Err(e.into()),
    }
}

fn upgrade_legacy_descriptor(legacy: LegacyMetricDescriptor, metric_types: &[&str]) -> MetricDescriptor {
    let group_aggregations = if !legacy.group_aggregations.is_empty() {
        legacy.group_aggregations
    } else if legacy
        .metric_type
        .as_deref()
        .is_some_and(|t| metric_types.contains(&t))
    {
        DEFAULT_GROUP_AGGREGATIONS.iter().map(|a| a.to_string()).collect()
    } else {
        Vec::new()
    };
    MetricDescriptor {
        id: legacy.id,
        metric_type: legacy.metric_type,
        value_type: legacy.value_type,
        time_aggregations: legacy.aggregations,
        group_aggregations,
    }
}

async fn fetch_label_descriptors(
    transport: &Arc<dyn Transport>,
    backend: &Backend,
    query: &LabelsQuery,
) -> Result<Vec<LabelDescriptor>, DatasourceError> {
    let request = ApiRequest::get("api/v2/labels/descriptors")
        .with_query("offset", "0")
        .with_query("limit", "100")
        .with_query("filter", query.match_text.clone().unwrap_or_default())
        .with_query("pids", query.metric.clone().unwrap_or_default())
        .with_query("scope", "");

    match transport.send(backend, request).await {
        Ok(response) => Ok(response.decode::<LabelDescriptorsPage>()?.label_descriptors),
        Err(TransportError::Status { status: 404, .. }) => {
            let Some(metric) = &query.metric else {
                return Ok(Vec::new());
            };
            log::debug!("label descriptors not supported by {}, using the legacy listing", backend.url);
            let request = ApiRequest::get(format!("api/data/metrics/{metric}/segmentationMetrics"));
            let legacy = match transport.send(backend, request).await {
                Ok(response) => response.decode::<LegacySegmentations>()?,
                Err(e) => {
                    log::warn!("could not list the segmentations of {metric}: {e}");
                    return Ok(Vec::new());
                }
            };
            let mut labels = legacy.segmentation_metrics.unwrap_or_default();
            labels.sort();
            Ok(labels.into_iter().map(|id| LabelDescriptor { id }).collect())
        }
        Err(e) => Err(e.into()),
    }
}
