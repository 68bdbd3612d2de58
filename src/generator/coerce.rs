//! Value Coercion
//!
//! Turns cleaned cell tokens into typed attribute values. Coercion never fails
//! past this boundary: an uncoercible token yields `None` and the caller
//! records one column-type issue.

use crate::config::OwnershipSpec;
use crate::generator::{ColumnTypeIssue, RowContext};
use crate::query::{Value, ValueType};
use crate::reader::clean_token;
use chrono::{NaiveDate, NaiveDateTime};

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];

pub fn coerce(token: &str, value_type: ValueType) -> Option<Value> {
    match value_type {
        ValueType::String => Some(Value::String(token.to_string())),
        ValueType::Long => token.parse::<i64>().ok().map(Value::Long),
        ValueType::Double => token
            .parse::<f64>()
            .ok()
            .filter(|d| d.is_finite())
            .map(Value::Double),
        ValueType::Boolean => {
            if token.eq_ignore_ascii_case("true") {
                Some(Value::Boolean(true))
            } else if token.eq_ignore_ascii_case("false") {
                Some(Value::Boolean(false))
            } else {
                None
            }
        }
        ValueType::DateTime => parse_datetime(token).map(Value::DateTime),
    }
}

/// ISO-8601 local date, optionally followed by `T` and a time of day
pub fn parse_datetime(token: &str) -> Option<NaiveDateTime> {
    if !token.contains('T') {
        return NaiveDate::parse_from_str(token, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0));
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(token, fmt).ok())
}

/// Typed values of one ownership for a row: clean, explode, clean, preprocess, coerce
pub fn ownership_values(
    spec: &OwnershipSpec,
    row: &RowContext<'_>,
    issues: &mut Vec<ColumnTypeIssue>,
) -> Vec<Value> {
    let Some(raw) = row.cell(&spec.column) else {
        return Vec::new();
    };
    let cleaned = clean_token(raw);
    if cleaned.is_empty() {
        return Vec::new();
    }
    let parts: Vec<&str> = match spec.list_separator.as_deref() {
        Some(separator) if !separator.is_empty() => cleaned.split(separator).collect(),
        _ => vec![cleaned.as_str()],
    };
    // resolved before loading; plain strings if a caller skipped that step
    let value_type = spec.value_type().unwrap_or(ValueType::String);

    let mut values = Vec::with_capacity(parts.len());
    for part in parts {
        let token = clean_token(part);
        if token.is_empty() {
            continue;
        }
        let token = match &spec.preprocessor {
            Some(pre) => pre.apply(&token),
            None => token,
        };
        match coerce(&token, value_type) {
            Some(value) => values.push(value),
            None => issues.push(ColumnTypeIssue {
                column: spec.column.clone(),
                attribute: spec.attribute.clone(),
                value_type,
                token,
            }),
        }
    }
    values
}
