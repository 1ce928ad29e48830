//! Series names, computed from alias templates.
//!
//! A template is free text with tokens between double braces:
//!
//! - `{{metric}}`: id of the metric
//! - `{{segment_name}}`: labels the metric is segmented by
//! - `{{segment_value}}`: label values of the current row
//!
//! A token can be shortened with `{{token:start}}`, `{{token::end}}` or `{{token:start:end}}`,
//! then reduced to the groups captured by a regular expression with `{{token /regex/}}`.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::{api::model::Row, query::Target};

/// Text of a missing label value.
pub const NULL_TEXT: &str = "n/a";

/// Text of the segment tokens when the metric is not segmented.
const ALL_TEXT: &str = "[all]";

const SEGMENT_SEPARATOR: &str = " - ";

static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{(metric|segment_name|segment_value)(?::(\d*))?(?::(\d*))?(?:\s/([^/]+)/)?\}\}")
        .expect("the alias token regex should be valid")
});

/// Formats a label value for display.
pub fn format_label_value(value: &Value) -> String {
    match value {
        Value::Null => String::from(NULL_TEXT),
        Value::String(s) if s.is_empty() => String::from(NULL_TEXT),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Computes the name of the series of `row`.
///
/// `keys` are the aliases of the segmentation keys of `target` (see [`Target::segment_keys`]).
pub fn series_name(row: &Row, target: &Target, is_tabular: bool, keys: &[String]) -> String {
    let alias = match target.alias.as_deref() {
        Some(alias) if !alias.is_empty() => alias,
        _ if target.segment_by.is_empty() => "{{metric}}",
        _ if !is_tabular => "{{metric}} ({{segment_value}})",
        _ => "{{segment_name}}",
    };

    TOKEN_PATTERN
        .replace_all(alias, |caps: &Captures| {
            let output = match &caps[1] {
                "metric" => target.metric.clone(),
                _ if target.segment_by.is_empty() => return String::from(ALL_TEXT),
                "segment_name" => target.segment_by.join(SEGMENT_SEPARATOR),
                _ => keys
                    .iter()
                    .map(|key| format_label_value(row.get(key).unwrap_or(&Value::Null)))
                    .collect::<Vec<_>>()
                    .join(SEGMENT_SEPARATOR),
            };
            let output = shorten(output, trim_len(caps.get(2)), trim_len(caps.get(3)));
            match caps.get(4) {
                Some(pattern) => extract(output, pattern.as_str()),
                None => output,
            }
        })
        .into_owned()
}

/// Parses a trim length, zero or empty meaning "no trim".
fn trim_len(m: Option<regex::Match>) -> Option<usize> {
    m.and_then(|m| m.as_str().parse().ok()).filter(|n| *n > 0)
}

fn shorten(text: String, start: Option<usize>, end: Option<usize>) -> String {
    if start.is_none() && end.is_none() {
        return text;
    }
    let chars: Vec<char> = text.chars().collect();
    let head: String = start.map(|n| chars.iter().take(n).collect()).unwrap_or_default();
    let tail: String = end
        .map(|n| chars[chars.len().saturating_sub(n)..].iter().collect())
        .unwrap_or_default();
    format!("{head}..{tail}")
}

/// Keeps the groups captured by `pattern`. Leaves the text unchanged if the pattern is invalid,
/// does not match, or has no group.
fn extract(text: String, pattern: &str) -> String {
    let Ok(regex) = Regex::new(pattern) else {
        log::debug!("ignoring invalid alias regex /{pattern}/");
        return text;
    };
    match regex.captures(&text) {
        Some(caps) if caps.len() > 1 => caps.iter().skip(1).flatten().map(|m| m.as_str()).collect(),
        _ => text,
    }
}
