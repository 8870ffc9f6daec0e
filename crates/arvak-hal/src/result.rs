//! Job result types.
//!
//! Backends report measurement histograms with hexadecimal keys (`"0x3"`).
//! [`JobResult::counts`] decodes them into bitstrings where the rightmost bit
//! corresponds to the lowest-indexed classical bit.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{HalError, HalResult};
use crate::job::JobId;

/// Measurement counts from circuit execution.
///
/// Maps bitstrings to occurrence counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Counts {
    counts: FxHashMap<String, u64>,
}

impl Counts {
    /// Create empty counts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create counts from an iterator of (bitstring, count) pairs.
    /// Duplicate bitstrings are accumulated.
    pub fn from_pairs(iter: impl IntoIterator<Item = (impl Into<String>, u64)>) -> Self {
        let mut counts = Self::new();
        for (k, v) in iter {
            counts.insert(k, v);
        }
        counts
    }

    /// Insert a count for a bitstring.
    pub fn insert(&mut self, bitstring: impl Into<String>, count: u64) {
        *self.counts.entry(bitstring.into()).or_default() += count;
    }

    /// Get the count for a bitstring.
    pub fn get(&self, bitstring: &str) -> u64 {
        self.counts.get(bitstring).copied().unwrap_or(0)
    }

    /// Iterate over (bitstring, count) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.counts.iter()
    }

    /// Get the total number of shots.
    pub fn total_shots(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Get the number of unique bitstrings.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Check if counts are empty.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl FromIterator<(String, u64)> for Counts {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

/// How single-shot measurements were returned for level 1 data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasReturn {
    /// One entry per shot.
    Single,
    /// Averaged over shots.
    Avg,
}

/// Per-circuit header attached by the submitter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultHeader {
    /// Circuit name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Number of classical bits measured into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_slots: Option<u32>,
    /// Free-form circuit metadata set by the experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Result of a single circuit within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitResult {
    /// Number of shots executed.
    pub shots: u64,
    /// Measurement level (0 raw, 1 kerneled, 2 discriminated).
    #[serde(default = "default_meas_level")]
    pub meas_level: u8,
    /// Return mode for level 1 data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meas_return: Option<MeasReturn>,
    /// Raw experiment data (`counts`, `memory`, ...).
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Circuit header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<ResultHeader>,
}

fn default_meas_level() -> u8 {
    2
}

impl CircuitResult {
    /// Create a level 2 circuit result from a counts histogram.
    pub fn from_counts(counts: &Counts, shots: u64) -> Self {
        let mut data = Map::new();
        data.insert(
            "counts".into(),
            Value::Object(
                counts
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(*v)))
                    .collect(),
            ),
        );
        Self {
            shots,
            meas_level: default_meas_level(),
            meas_return: None,
            data,
            header: None,
        }
    }

    /// Attach circuit metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.header.get_or_insert_with(ResultHeader::default).metadata = Some(metadata);
        self
    }

    /// Set the number of memory slots used to pad decoded bitstrings.
    pub fn with_memory_slots(mut self, slots: u32) -> Self {
        self.header.get_or_insert_with(ResultHeader::default).memory_slots = Some(slots);
        self
    }

    /// Circuit metadata from the header, if any.
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.header.as_ref().and_then(|h| h.metadata.as_ref())
    }
}

/// Result of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// Job the result belongs to.
    pub job_id: JobId,
    /// Backend that produced the result.
    pub backend_name: String,
    /// Whether every circuit executed successfully.
    #[serde(default = "default_success")]
    pub success: bool,
    /// Per-circuit results in submission order.
    pub results: Vec<CircuitResult>,
}

fn default_success() -> bool {
    true
}

impl JobResult {
    /// Create a successful result.
    pub fn new(
        job_id: impl Into<JobId>,
        backend_name: impl Into<String>,
        results: Vec<CircuitResult>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            backend_name: backend_name.into(),
            success: true,
            results,
        }
    }

    fn circuit(&self, index: usize) -> HalResult<&CircuitResult> {
        self.results.get(index).ok_or_else(|| {
            HalError::InvalidResult(format!(
                "result {} has no circuit at index {index}",
                self.job_id
            ))
        })
    }

    /// Raw data of circuit `index`.
    pub fn data(&self, index: usize) -> HalResult<Map<String, Value>> {
        Ok(self.circuit(index)?.data.clone())
    }

    /// Decoded counts histogram of circuit `index`.
    pub fn counts(&self, index: usize) -> HalResult<Counts> {
        let circuit = self.circuit(index)?;
        let raw = circuit
            .data
            .get("counts")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                HalError::InvalidResult(format!(
                    "no counts for circuit {index} of job {}",
                    self.job_id
                ))
            })?;
        let width = circuit
            .header
            .as_ref()
            .and_then(|h| h.memory_slots)
            .map(|w| w as usize);

        let mut counts = Counts::new();
        for (key, value) in raw {
            let count = value.as_u64().ok_or_else(|| {
                HalError::InvalidResult(format!("non-integer count for outcome '{key}'"))
            })?;
            counts.insert(decode_outcome(key, width), count);
        }
        Ok(counts)
    }
}

/// Decode a hexadecimal outcome key into a bitstring.
///
/// Keys that are not hexadecimal are assumed to already be bitstrings and
/// are returned unchanged.
pub fn decode_outcome(key: &str, width: Option<usize>) -> String {
    let Some(hex) = key.strip_prefix("0x") else {
        return key.to_string();
    };
    match u128::from_str_radix(hex, 16) {
        Ok(value) => {
            let bits = format!("{value:b}");
            match width {
                Some(w) if w > bits.len() => format!("{bits:0>w$}"),
                _ => bits,
            }
        }
        Err(e) => {
            warn!(key, error = %e, "Undecodable outcome key kept verbatim");
            key.to_string()
        }
    }
}
