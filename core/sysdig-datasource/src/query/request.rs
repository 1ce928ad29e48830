//! Wire-level aggregation queries of `api/data/batch`.
//!
//! The backend addresses the columns of a query by alias: `v0` is the value of the metric,
//! `k0`, `k1`, ... are the grouping keys. In a time series `k0` is the timestamp.

use indexmap::IndexMap;
use serde::Serialize;

use super::{RequestTime, SortDirection, Target};

const MICROS: i64 = 1_000_000;
const VALUE_KEY: &str = "v0";
const TIMESTAMP_KEY: &str = "k0";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub format: Format,
    pub time: TimeRange,
    /// Alias to metric id, in the order of the keys.
    pub metrics: IndexMap<String, String>,
    /// One single-entry map per sorted column.
    pub sort: Vec<IndexMap<String, SortDirection>>,
    pub paging: Paging,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub group: Group,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Format {
    #[serde(rename = "type")]
    pub format_type: String,
}

/// Time window of a request, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub from: i64,
    pub to: i64,
    pub sampling: i64,
}

/// Rows `from..=to` of the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Paging {
    pub from: u32,
    pub to: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub aggregations: IndexMap<String, String>,
    pub group_aggregations: IndexMap<String, String>,
    pub by: Vec<GroupBy>,
    pub configuration: GroupConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupBy {
    pub metric: String,
    /// Width of the time buckets, in microseconds. Only set on the timestamp key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GroupConfiguration {
    pub groups: Vec<serde_json::Value>,
}

impl DataRequest {
    /// Builds the backend request of a target.
    ///
    /// Returns `None` if the time window is not available: the caller should not send anything
    /// to the backend for this target, and treat it as an empty result.
    pub fn build(target: &Target, request_time: Option<&RequestTime>) -> Option<DataRequest> {
        let time = request_time?;
        let span = time.to - time.from;
        let direction = target.sort_direction;
        let segment_keys = target.segment_keys();

        let sampling = if target.is_single_data_point {
            span
        } else {
            time.sampling.unwrap_or(span)
        };

        let mut metrics = IndexMap::new();
        let mut by = Vec::with_capacity(segment_keys.len() + 1);
        if !target.is_single_data_point {
            metrics.insert(TIMESTAMP_KEY.to_owned(), String::from("timestamp"));
            by.push(GroupBy {
                metric: TIMESTAMP_KEY.to_owned(),
                value: Some(sampling * MICROS),
            });
        }
        metrics.insert(VALUE_KEY.to_owned(), target.metric.clone());
        for (key, label) in segment_keys.iter().zip(&target.segment_by) {
            metrics.insert(key.clone(), label.clone());
            by.push(GroupBy {
                metric: key.clone(),
                value: None,
            });
        }

        let sort = if target.is_tabular_format {
            // the table does the final ordering
            let first_key = metrics
                .keys()
                .find(|alias| alias.starts_with('k'))
                .map(String::as_str)
                .unwrap_or(VALUE_KEY);
            vec![sort_by(first_key, direction)]
        } else {
            let keys = metrics.keys().filter(|alias| alias.starts_with('k'));
            std::iter::once(VALUE_KEY)
                .chain(keys.map(String::as_str))
                .map(|alias| sort_by(alias, direction))
                .collect()
        };

        Some(DataRequest {
            format: Format {
                format_type: String::from("data"),
            },
            time: TimeRange {
                from: time.from * MICROS,
                to: time.to * MICROS,
                sampling: sampling * MICROS,
            },
            metrics,
            sort,
            paging: Paging {
                from: 0,
                to: target.page_limit.max(1) - 1,
            },
            scope: target.filter.clone(),
            group: Group {
                aggregations: IndexMap::from([(VALUE_KEY.to_owned(), target.time_aggregation.clone())]),
                group_aggregations: IndexMap::from([(VALUE_KEY.to_owned(), target.group_aggregation.clone())]),
                by,
                configuration: GroupConfiguration::default(),
            },
        })
    }
}

fn sort_by(alias: &str, direction: SortDirection) -> IndexMap<String, SortDirection> {
    IndexMap::from([(alias.to_owned(), direction)])
}
