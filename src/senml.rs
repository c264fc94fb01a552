//! Sensor Measurement Lists (RFC 8428) for the save-measurements output.
//!
//! Script results destined for the writers are normalized (base fields
//! folded into each record) and validated before they are republished.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation failures for a SenML pack.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SenmlError {
    /// The pack has no records.
    #[error("empty pack")]
    Empty,

    /// A record resolved to an empty or invalid name.
    #[error("invalid record name: {name:?}")]
    BadName {
        /// The offending resolved name.
        name: String,
    },

    /// A record carries more than one value field.
    #[error("record {index} has multiple value fields")]
    TooManyValues {
        /// Position in the pack.
        index: usize,
    },

    /// A record carries neither a value nor a sum.
    #[error("record {index} has no value")]
    NoValue {
        /// Position in the pack.
        index: usize,
    },
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// One SenML record; base fields may appear on any record and apply to the
/// remainder of the pack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Base name prepended to `n` of this and following records.
    #[serde(rename = "bn", default, skip_serializing_if = "String::is_empty")]
    pub base_name: String,
    /// Base time added to `t` of this and following records.
    #[serde(rename = "bt", default, skip_serializing_if = "is_zero")]
    pub base_time: f64,
    /// Base unit for records without a unit of their own.
    #[serde(rename = "bu", default, skip_serializing_if = "String::is_empty")]
    pub base_unit: String,
    /// Base value added to numeric values.
    #[serde(rename = "bv", default, skip_serializing_if = "Option::is_none")]
    pub base_value: Option<f64>,
    /// Base sum added to sums.
    #[serde(rename = "bs", default, skip_serializing_if = "Option::is_none")]
    pub base_sum: Option<f64>,
    /// Record name.
    #[serde(rename = "n", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Record unit.
    #[serde(rename = "u", default, skip_serializing_if = "String::is_empty")]
    pub unit: String,
    /// Record time, seconds relative to base time (or absolute).
    #[serde(rename = "t", default, skip_serializing_if = "is_zero")]
    pub time: f64,
    /// Maximum time before the next update.
    #[serde(rename = "ut", default, skip_serializing_if = "is_zero")]
    pub update_time: f64,
    /// Numeric value.
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// String value.
    #[serde(rename = "vs", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    /// Boolean value.
    #[serde(rename = "vb", default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    /// Base64 data value.
    #[serde(rename = "vd", default, skip_serializing_if = "Option::is_none")]
    pub data_value: Option<String>,
    /// Integrated sum.
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
}

impl Record {
    fn value_field_count(&self) -> usize {
        [
            self.value.is_some(),
            self.string_value.is_some(),
            self.bool_value.is_some(),
            self.data_value.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }
}

/// Resolves base fields into every record, producing a pack where each
/// record stands alone.
pub fn normalize(records: &[Record]) -> Vec<Record> {
    let mut base_name = String::new();
    let mut base_time = 0.0;
    let mut base_unit = String::new();
    let mut base_value: Option<f64> = None;
    let mut base_sum: Option<f64> = None;

    let mut resolved = Vec::with_capacity(records.len());
    for record in records {
        if !record.base_name.is_empty() {
            base_name = record.base_name.clone();
        }
        if record.base_time != 0.0 {
            base_time = record.base_time;
        }
        if !record.base_unit.is_empty() {
            base_unit = record.base_unit.clone();
        }
        if record.base_value.is_some() {
            base_value = record.base_value;
        }
        if record.base_sum.is_some() {
            base_sum = record.base_sum;
        }

        let mut out = Record {
            name: format!("{base_name}{}", record.name),
            unit: if record.unit.is_empty() {
                base_unit.clone()
            } else {
                record.unit.clone()
            },
            time: base_time + record.time,
            update_time: record.update_time,
            value: record.value.map(|v| v + base_value.unwrap_or(0.0)),
            string_value: record.string_value.clone(),
            bool_value: record.bool_value,
            data_value: record.data_value.clone(),
            sum: record.sum.map(|s| s + base_sum.unwrap_or(0.0)),
            ..Record::default()
        };
        if out.value.is_none() {
            out.value = base_value;
        }
        resolved.push(out);
    }
    resolved
}

/// Validates a normalized pack: non-empty, well-formed names, exactly one
/// value field (or a sum) per record.
pub fn validate(records: &[Record]) -> Result<(), SenmlError> {
    if records.is_empty() {
        return Err(SenmlError::Empty);
    }
    for (index, record) in records.iter().enumerate() {
        if !name_is_valid(&record.name) {
            return Err(SenmlError::BadName {
                name: record.name.clone(),
            });
        }
        match record.value_field_count() {
            0 if record.sum.is_none() => return Err(SenmlError::NoValue { index }),
            0 | 1 => {}
            _ => return Err(SenmlError::TooManyValues { index }),
        }
    }
    Ok(())
}

fn name_is_valid(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | ':' | '.' | '/' | '_'))
}
