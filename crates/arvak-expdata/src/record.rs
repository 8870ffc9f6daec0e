//! Raw experiment data records.

use std::ops::Range;

use arvak_hal::{HalResult, JobId, JobResult};
use serde_json::{Map, Value};

use crate::error::{ExpDataError, ExpDataResult};

/// One raw data record: field name to value.
pub type Datum = Map<String, Value>;

/// Field linking a record back to the job that produced it.
pub const JOB_ID_FIELD: &str = "job_id";

/// An item accepted by `add_data`.
#[derive(Debug, Clone)]
pub enum DataItem {
    /// A ready-made record.
    Record(Datum),
    /// A job result; every circuit becomes one record.
    Result(JobResult),
    /// An arbitrary JSON value, which must be an object.
    Json(Value),
}

impl From<Datum> for DataItem {
    fn from(record: Datum) -> Self {
        DataItem::Record(record)
    }
}

impl From<JobResult> for DataItem {
    fn from(result: JobResult) -> Self {
        DataItem::Result(result)
    }
}

impl From<Value> for DataItem {
    fn from(value: Value) -> Self {
        DataItem::Json(value)
    }
}

/// A validated [`DataItem`].
pub(crate) enum Validated {
    Record(Datum),
    Result(JobResult),
}

impl DataItem {
    pub(crate) fn validate(self) -> ExpDataResult<Validated> {
        match self {
            DataItem::Record(record) => Ok(Validated::Record(record)),
            DataItem::Result(result) => Ok(Validated::Result(result)),
            DataItem::Json(Value::Object(record)) => Ok(Validated::Record(record)),
            DataItem::Json(other) => Err(ExpDataError::InvalidArgument(format!(
                "invalid data type {}: expected a record object",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Job id a record refers to.
pub fn record_job_id(record: &Datum) -> Option<JobId> {
    record.get(JOB_ID_FIELD).and_then(Value::as_str).map(JobId::from)
}

/// Flatten a job result into one record per circuit.
///
/// Each record carries the job id, decoded counts, circuit metadata, shot
/// count, measurement level and (if reported) measurement return mode.
pub fn records_from_result(result: &JobResult) -> HalResult<Vec<Datum>> {
    let mut records = Vec::with_capacity(result.results.len());
    for (i, circuit) in result.results.iter().enumerate() {
        let mut record = result.data(i)?;
        record.insert(JOB_ID_FIELD.into(), Value::from(result.job_id.as_str()));
        if record.contains_key("counts") {
            record.insert("counts".into(), serde_json::to_value(result.counts(i)?)?);
        }
        if let Some(metadata) = circuit.metadata() {
            record.insert("metadata".into(), Value::Object(metadata.clone()));
        }
        record.insert("shots".into(), Value::from(circuit.shots));
        record.insert("meas_level".into(), Value::from(circuit.meas_level));
        if let Some(meas_return) = circuit.meas_return {
            record.insert("meas_return".into(), serde_json::to_value(meas_return)?);
        }
        records.push(record);
    }
    Ok(records)
}

/// Selector for `ExperimentData::data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataIndex {
    /// Every record.
    All,
    /// The record at one position.
    Position(usize),
    /// Records in a range of positions.
    Range(Range<usize>),
    /// Records produced by one job.
    Job(JobId),
}

impl From<usize> for DataIndex {
    fn from(i: usize) -> Self {
        DataIndex::Position(i)
    }
}

impl From<Range<usize>> for DataIndex {
    fn from(r: Range<usize>) -> Self {
        DataIndex::Range(r)
    }
}

impl From<&str> for DataIndex {
    fn from(job_id: &str) -> Self {
        DataIndex::Job(JobId::from(job_id))
    }
}

impl From<JobId> for DataIndex {
    fn from(job_id: JobId) -> Self {
        DataIndex::Job(job_id)
    }
}
