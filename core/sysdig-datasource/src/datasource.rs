//! Entry point of the host: one [`Datasource`] per configured Sysdig backend.

use std::{cmp::Ordering, sync::Arc, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    alias::format_label_value,
    api::{
        ApiRequest, Backend, HttpTransport, Transport,
        model::{EntityMetadata, LabelDescriptor, MetricDescriptor},
    },
    batch::BatchScheduler,
    config::DatasourceConfig,
    error::DatasourceError,
    metrics::{LabelsQuery, MetricsQuery, MetricsService},
    query::{
        DEFAULT_GROUP_AGGREGATION, DEFAULT_PAGE_LIMIT, DEFAULT_TIME_AGGREGATION, Query, SortDirection, Target,
        UserTime,
    },
    reshape::QueryResult,
    time_window::TimeService,
};

/// Metric of the targets that the user has not configured yet.
pub const PLACEHOLDER_METRIC: &str = "select metric";

/// Maximum number of label values returned by a template variable query.
const LABEL_VALUES_LIMIT: u32 = 100;

static LABEL_VALUES_QUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^label_values\(([A-Za-z][A-Za-z0-9]*(?:[\._\-:][a-zA-Z0-9]+)*)\)$")
        .expect("the label_values regex should be valid")
});

/// Time range of a Grafana request, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub from: i64,
    pub to: i64,
}

/// A panel request, as sent by Grafana.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    pub range: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub targets: Vec<PanelTarget>,
}

/// A target, as configured in the panel editor. Every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PanelTarget {
    pub target: Option<String>,
    pub time_aggregation: Option<String>,
    pub group_aggregation: Option<String>,
    pub segment_by: Vec<String>,
    pub filter: Option<String>,
    pub sort_direction: Option<SortDirection>,
    pub page_limit: Option<i64>,
    pub alias: Option<String>,
    pub is_single_data_point: bool,
    pub is_tabular_format: bool,
    pub hide: bool,
}

impl PanelTarget {
    fn is_placeholder(&self) -> bool {
        self.target.as_deref() == Some(PLACEHOLDER_METRIC)
    }

    fn into_target(self) -> Target {
        let page_limit = self
            .page_limit
            .filter(|limit| *limit > 0)
            .and_then(|limit| u32::try_from(limit).ok())
            .unwrap_or(DEFAULT_PAGE_LIMIT);

        let base = Target {
            segment_by: self.segment_by,
            sort_direction: self.sort_direction.unwrap_or_default(),
            page_limit,
            alias: self.alias,
            is_single_data_point: self.is_single_data_point,
            is_tabular_format: self.is_tabular_format,
            ..Target::default()
        };
        match self.target {
            // a new panel, not configured yet: query the default metric
            None => Target {
                page_limit: DEFAULT_PAGE_LIMIT,
                ..base
            },
            Some(metric) => Target {
                metric,
                time_aggregation: self
                    .time_aggregation
                    .unwrap_or_else(|| String::from(DEFAULT_TIME_AGGREGATION)),
                group_aggregation: self
                    .group_aggregation
                    .unwrap_or_else(|| String::from(DEFAULT_GROUP_AGGREGATION)),
                filter: self.filter.filter(|f| !f.is_empty()),
                ..base
            },
        }
    }
}

/// Result of [`Datasource::test_datasource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub status: String,
    pub message: String,
    pub title: String,
}

/// A value of a template variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindValue {
    pub text: String,
}

/// Sort modes of the template variables, numbered like in Grafana.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelValuesSort {
    /// Keep the order of the backend.
    #[default]
    Disabled,
    AlphabeticalAsc,
    AlphabeticalDesc,
    NumericalAsc,
    NumericalDesc,
    AlphabeticalCaseInsensitiveAsc,
    AlphabeticalCaseInsensitiveDesc,
}

impl From<u8> for LabelValuesSort {
    fn from(mode: u8) -> Self {
        match mode {
            1 => LabelValuesSort::AlphabeticalAsc,
            2 => LabelValuesSort::AlphabeticalDesc,
            3 => LabelValuesSort::NumericalAsc,
            4 => LabelValuesSort::NumericalDesc,
            5 => LabelValuesSort::AlphabeticalCaseInsensitiveAsc,
            6 => LabelValuesSort::AlphabeticalCaseInsensitiveDesc,
            _ => LabelValuesSort::Disabled,
        }
    }
}

impl LabelValuesSort {
    /// Sorts label values. Nulls always come first.
    pub fn sort(self, values: &mut [Value]) {
        if self == LabelValuesSort::Disabled {
            return;
        }
        values.sort_by(|a, b| match (a, b) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (a, b) => self.compare(a, b),
        });
    }

    fn compare(self, a: &Value, b: &Value) -> Ordering {
        match self {
            LabelValuesSort::Disabled => Ordering::Equal,
            LabelValuesSort::AlphabeticalAsc => text(a).cmp(&text(b)),
            LabelValuesSort::AlphabeticalDesc => text(b).cmp(&text(a)),
            LabelValuesSort::NumericalAsc => number(a).total_cmp(&number(b)),
            LabelValuesSort::NumericalDesc => number(b).total_cmp(&number(a)),
            LabelValuesSort::AlphabeticalCaseInsensitiveAsc => text(a).to_lowercase().cmp(&text(b).to_lowercase()),
            LabelValuesSort::AlphabeticalCaseInsensitiveDesc => text(b).to_lowercase().cmp(&text(a).to_lowercase()),
        }
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric value of a label, NaN if it is not a number.
fn number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// A Sysdig Monitor datasource.
pub struct Datasource {
    backend: Backend,
    transport: Arc<dyn Transport>,
    scheduler: BatchScheduler,
    metrics: MetricsService,
    time: TimeService,
}

impl Datasource {
    /// Creates a datasource that talks to the backend over HTTP.
    pub fn new(config: &DatasourceConfig) -> Result<Self, DatasourceError> {
        let transport = HttpTransport::new(config.request_timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: &DatasourceConfig, transport: Arc<dyn Transport>) -> Self {
        let scheduler = BatchScheduler::new(transport.clone(), config.batch.clone());
        Self::with_scheduler(config, transport, scheduler)
    }

    /// Creates a datasource that shares its batch scheduler with other datasources.
    ///
    /// The queries of different backends are never batched together.
    pub fn with_scheduler(config: &DatasourceConfig, transport: Arc<dyn Transport>, scheduler: BatchScheduler) -> Self {
        Self {
            backend: config.backend(),
            metrics: MetricsService::new(transport.clone(), &config.metrics_cache),
            time: TimeService::new(transport.clone()),
            transport,
            scheduler,
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Runs the query of a panel.
    ///
    /// The targets of all the panels queried at the same time are sent together.
    pub async fn query(&self, options: QueryOptions) -> Result<QueryResult, DatasourceError> {
        let targets: Vec<Target> = options
            .targets
            .into_iter()
            .filter(|t| !t.hide && !t.is_placeholder())
            .map(PanelTarget::into_target)
            .collect();
        if targets.is_empty() {
            return Ok(QueryResult::empty());
        }

        let range = options
            .range
            .ok_or_else(|| DatasourceError::InvalidQuery(String::from("missing time range")))?;
        let user_time = UserTime::from_millis(range.from, range.to, options.interval_ms);
        self.scheduler
            .fetch(&self.backend, Query::new(targets), user_time)
            .await
    }

    /// Checks that the backend accepts the configured token.
    pub async fn test_datasource(&self) -> Result<TestResult, DatasourceError> {
        let response = self.transport.send(&self.backend, ApiRequest::get("api/login")).await?;
        if response.status == 200 {
            Ok(TestResult {
                status: String::from("success"),
                message: String::from("Data source is working"),
                title: String::from("Success"),
            })
        } else {
            Err(DatasourceError::InvalidResponse(format!(
                "unexpected status {} from api/login",
                response.status
            )))
        }
    }

    /// Runs the query of a template variable.
    ///
    /// - An empty query lists the metrics.
    /// - `label_values(<label>)` lists the values of a label in the time range.
    /// - Anything else returns nothing.
    pub async fn metric_find_query(
        &self,
        query: &str,
        range: Option<Range>,
        sort: LabelValuesSort,
    ) -> Result<Vec<FindValue>, DatasourceError> {
        let query = query.trim();
        if query.is_empty() {
            let metrics = self.find_metrics(&MetricsQuery::default()).await?;
            return Ok(metrics.into_iter().map(|m| FindValue { text: m.id }).collect());
        }

        let Some(label) = LABEL_VALUES_QUERY.captures(query).map(|caps| caps[1].to_owned()) else {
            log::debug!("unsupported variable query: {query}");
            return Ok(Vec::new());
        };
        let user_time = range
            .map(|r| UserTime::from_millis(r.from, r.to, None))
            .ok_or(DatasourceError::TimeWindowUnavailable)?;
        let mut values = self.label_values(&label, &user_time).await?;

        // the backend does not support scope expressions with null values
        values.retain(|v| !v.is_null());
        sort.sort(&mut values);
        Ok(values
            .iter()
            .map(|v| FindValue {
                text: format_label_value(v),
            })
            .collect())
    }

    async fn label_values(&self, label: &str, user_time: &UserTime) -> Result<Vec<Value>, DatasourceError> {
        let request_time = self.time.validate_time_window(&self.backend, user_time).await?;
        let body = json!({
            "time": {"from": request_time.from * 1_000_000, "to": request_time.to * 1_000_000},
            "metrics": [label],
            "filter": null,
            "paging": {"from": 0, "to": LABEL_VALUES_LIMIT - 1},
        });
        let metadata: EntityMetadata = self
            .transport
            .send(&self.backend, ApiRequest::post("api/data/entity/metadata", body))
            .await?
            .decode()?;
        Ok(metadata
            .data
            .into_iter()
            .map(|mut row| row.remove(label).unwrap_or(Value::Null))
            .collect())
    }

    pub async fn find_metrics(&self, query: &MetricsQuery) -> Result<Vec<MetricDescriptor>, DatasourceError> {
        self.metrics.find_metrics(&self.backend, query).await
    }

    /// Lists the labels that a metric can be segmented by.
    pub async fn find_segment_by(&self, metric: Option<&str>) -> Result<Vec<LabelDescriptor>, DatasourceError> {
        let query = match metric {
            Some(metric) if metric != PLACEHOLDER_METRIC => LabelsQuery::for_metric(metric),
            _ => LabelsQuery::default(),
        };
        self.metrics.find_labels(&self.backend, &query).await
    }
}
