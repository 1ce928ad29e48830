//! Conversion of the backend responses into the series and tables that the panels display.

use std::cmp::Ordering;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    alias::{self, format_label_value},
    api::model::{BackendError, DataResponse, Row},
    error::DatasourceError,
    query::{Query, SortDirection, Target},
};

/// Result of a panel query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub data: Vec<ResultEntry>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Iterates on the time series of the result.
    pub fn series(&self) -> impl Iterator<Item = &TimeSeries> {
        self.data.iter().filter_map(|entry| match entry {
            ResultEntry::Series(series) => Some(series),
            _ => None,
        })
    }

    /// Iterates on the per-target errors of the result.
    pub fn errors(&self) -> impl Iterator<Item = &TargetError> {
        self.data.iter().filter_map(|entry| match entry {
            ResultEntry::Error(error) => Some(error),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultEntry {
    Series(TimeSeries),
    Table(Table),
    Error(TargetError),
}

/// `(value, timestamp in milliseconds)`
pub type Datapoint = (Option<f64>, i64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Name of the series.
    pub target: String,
    pub datapoints: Vec<Datapoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Always `"table"`.
    #[serde(rename = "type")]
    pub table_type: String,
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub text: String,
}

/// Failure of one target, reported next to the results of the other targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetError {
    /// Metric of the failed target.
    pub target: String,
    pub error: BackendError,
}

/// Turns the responses of the targets of `query` (in the same order) into a query result.
///
/// Returns [`DatasourceError::QueryFailed`] if every target failed.
pub fn parse_responses(query: &Query, responses: Vec<DataResponse>) -> Result<QueryResult, DatasourceError> {
    if responses.len() != query.targets.len() {
        return Err(DatasourceError::InvalidResponse(format!(
            "expected {} responses, got {}",
            query.targets.len(),
            responses.len()
        )));
    }

    let mut outcomes = Vec::with_capacity(responses.len());
    for (target, response) in query.targets.iter().zip(responses) {
        match response.data {
            Some(rows) => outcomes.push(Ok((target, rows, response.time.map(|t| t.from)))),
            None => outcomes.push(Err(TargetError {
                target: target.metric.clone(),
                error: response.errors.into_iter().next().unwrap_or_else(|| BackendError {
                    reason: String::from("Invalid response"),
                    message: String::from("the response has neither data nor errors"),
                    field: None,
                }),
            })),
        }
    }

    if outcomes.iter().all(Result::is_err) {
        return match outcomes.into_iter().next() {
            Some(Err(TargetError { error, .. })) => Err(DatasourceError::QueryFailed {
                reason: error.reason,
                message: error.message,
            }),
            _ => Ok(QueryResult::empty()),
        };
    }

    let mut data = Vec::new();
    if query.is_tabular() {
        let mut tables = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok((target, rows, _)) => tables.push((target, rows)),
                Err(error) => data.push(ResultEntry::Error(error)),
            }
        }
        if let Some(table) = build_table(&tables) {
            data.insert(0, ResultEntry::Table(table));
        }
    } else {
        for outcome in outcomes {
            match outcome {
                Ok((target, rows, time_from)) => {
                    let series = if target.is_single_data_point {
                        single_values(target, &rows, time_from.unwrap_or_default() / 1000)
                    } else {
                        time_series(target, &rows)
                    };
                    data.extend(series.into_iter().map(ResultEntry::Series));
                }
                Err(error) => data.push(ResultEntry::Error(error)),
            }
        }
    }
    Ok(QueryResult { data })
}

fn value_of(row: &Row) -> Option<f64> {
    row.get("v0").and_then(Value::as_f64)
}

/// Groups the rows by segment values, in order of appearance, and names each group.
fn group_rows<'a>(target: &Target, rows: &'a [Row]) -> Vec<(String, Vec<&'a Row>)> {
    let keys = target.segment_keys();
    let mut groups: IndexMap<Vec<String>, Vec<&Row>> = IndexMap::new();
    for row in rows {
        // raw JSON of each label, so that null and "" stay distinct
        let segment = keys
            .iter()
            .map(|key| row.get(key).map(Value::to_string).unwrap_or_default())
            .collect();
        groups.entry(segment).or_default().push(row);
    }
    groups
        .into_values()
        .map(|rows| (alias::series_name(rows[0], target, false, &keys), rows))
        .collect()
}

fn time_series(target: &Target, rows: &[Row]) -> Vec<TimeSeries> {
    let mut series: Vec<TimeSeries> = group_rows(target, rows)
        .into_iter()
        .map(|(name, rows)| {
            let mut datapoints: Vec<Datapoint> = rows
                .iter()
                .map(|row| {
                    let timestamp_us = row.get("k0").and_then(Value::as_i64).unwrap_or_default();
                    (value_of(row), timestamp_us / 1000)
                })
                .collect();
            datapoints.sort_by_key(|(_, timestamp)| *timestamp);
            TimeSeries {
                target: name,
                datapoints,
            }
        })
        .collect();
    series.sort_by(|a, b| a.target.cmp(&b.target));
    series
}

fn single_values(target: &Target, rows: &[Row], timestamp_ms: i64) -> Vec<TimeSeries> {
    let mut series: Vec<TimeSeries> = group_rows(target, rows)
        .into_iter()
        .map(|(name, rows)| TimeSeries {
            target: name,
            datapoints: rows.iter().map(|row| (value_of(row), timestamp_ms)).collect(),
        })
        .collect();
    series.sort_by(|a, b| {
        let by_value = compare_values(first_value(a), first_value(b));
        let by_value = match target.sort_direction {
            SortDirection::Asc => by_value,
            SortDirection::Desc => by_value.reverse(),
        };
        by_value.then_with(|| a.target.cmp(&b.target))
    });
    series
}

fn first_value(series: &TimeSeries) -> Option<f64> {
    series.datapoints.first().and_then(|(value, _)| *value)
}

/// Orders missing values first.
fn compare_values(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (a, b) => a.is_some().cmp(&b.is_some()),
    }
}

/// Key used to join the rows of different targets: the formatted label values.
fn join_key(keys: &[String], row: &Row) -> String {
    keys.iter()
        .map(|key| format_label_value(row.get(key).unwrap_or(&Value::Null)))
        .collect::<Vec<_>>()
        .join(" - ")
}

/// Builds one table: the rows of the first target, plus one value column per successful target.
///
/// The values of the other targets are looked up by label values. A row that has no
/// counterpart in another target gets `null` for that target, the label sets are not merged.
fn build_table(targets: &[(&Target, Vec<Row>)]) -> Option<Table> {
    let (reference, reference_rows) = targets.first()?;

    let mut columns: Vec<Column> = reference
        .segment_by
        .iter()
        .map(|label| Column { text: label.clone() })
        .collect();
    columns.extend(targets.iter().map(|(target, _)| Column {
        text: target.alias.clone().filter(|a| !a.is_empty()).unwrap_or_else(|| target.metric.clone()),
    }));

    // first value of each label set, for every target
    let lookups: Vec<IndexMap<String, Value>> = targets
        .iter()
        .map(|(target, rows)| {
            let keys = target.segment_keys();
            let mut values = IndexMap::new();
            for row in rows {
                values
                    .entry(join_key(&keys, row))
                    .or_insert_with(|| row.get("v0").cloned().unwrap_or(Value::Null));
            }
            values
        })
        .collect();

    let reference_keys = reference.segment_keys();
    let mut seen = std::collections::HashSet::new();
    let mut rows = Vec::new();
    for row in reference_rows {
        let key = join_key(&reference_keys, row);
        if !seen.insert(key.clone()) {
            continue;
        }
        let mut cells: Vec<Value> = reference_keys
            .iter()
            .map(|k| Value::String(format_label_value(row.get(k).unwrap_or(&Value::Null))))
            .collect();
        cells.extend(lookups.iter().map(|values| values.get(&key).cloned().unwrap_or(Value::Null)));
        rows.push(cells);
    }

    Some(Table {
        table_type: String::from("table"),
        columns,
        rows,
    })
}
