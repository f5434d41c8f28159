/*!
The raw measurement record types and their persisted forms.

A `Sample` is one measured iteration of one cell. A `SampleBatch` is the
ordered sequence of samples for one cell together with its terminal status.
`RawReport` is the raw.json document: every batch of the run in completion
order. `RunMeta` is the meta.json document.

Elapsed times are carried as integer nanoseconds so that serializing a run
and reading it back is exact: the round trip must yield bit-identical
statistics.
*/

use std::{collections::BTreeMap, time::Duration};

use crate::format::spec::{CellId, GlobalParams};

/// Why a cell (or one of its iterations) failed.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The run specification failed validation. Never attached to a cell;
    /// it aborts the run before any cell exists.
    ConfigInvalid,
    /// No artifact exists for a declared cell. Also aborts before
    /// execution.
    ArtifactMissing,
    /// The execution environment could not be constructed.
    EnvironmentInitFailed,
    /// The module bytes did not instantiate.
    ArtifactLoadFailed,
    /// An iteration produced a digest different from the reference.
    ResultMismatch,
    /// A single iteration exceeded the per-iteration budget.
    IterationTimeout,
    /// The cell exceeded the orchestrator's per-cell budget.
    CellTimeout,
    /// Cancellation was honored between iterations.
    #[serde(rename = "CELL_CANCELLED")]
    Cancelled,
    /// The guest trapped during an iteration.
    RuntimeTrap,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match *self {
            ErrorKind::ConfigInvalid => "CONFIG_INVALID",
            ErrorKind::ArtifactMissing => "ARTIFACT_MISSING",
            ErrorKind::EnvironmentInitFailed => "ENVIRONMENT_INIT_FAILED",
            ErrorKind::ArtifactLoadFailed => "ARTIFACT_LOAD_FAILED",
            ErrorKind::ResultMismatch => "RESULT_MISMATCH",
            ErrorKind::IterationTimeout => "ITERATION_TIMEOUT",
            ErrorKind::CellTimeout => "CELL_TIMEOUT",
            ErrorKind::Cancelled => "CELL_CANCELLED",
            ErrorKind::RuntimeTrap => "RUNTIME_TRAP",
        };
        write!(f, "{}", name)
    }
}

/// The terminal status of a cell: OK, or the error kind that ended it.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    Ok,
    ResultMismatch,
    IterationTimeout,
    CellTimeout,
    Cancelled,
    EnvironmentInitFailed,
    ArtifactLoadFailed,
    /// More than the configured fraction of measured iterations trapped.
    RuntimeTrap,
}

impl TerminalStatus {
    pub fn is_ok(&self) -> bool {
        matches!(*self, TerminalStatus::Ok)
    }

    /// The error kind corresponding to this status, if it is a failure.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        Some(match *self {
            TerminalStatus::Ok => return None,
            TerminalStatus::ResultMismatch => ErrorKind::ResultMismatch,
            TerminalStatus::IterationTimeout => ErrorKind::IterationTimeout,
            TerminalStatus::CellTimeout => ErrorKind::CellTimeout,
            TerminalStatus::Cancelled => ErrorKind::Cancelled,
            TerminalStatus::EnvironmentInitFailed => {
                ErrorKind::EnvironmentInitFailed
            }
            TerminalStatus::ArtifactLoadFailed => {
                ErrorKind::ArtifactLoadFailed
            }
            TerminalStatus::RuntimeTrap => ErrorKind::RuntimeTrap,
        })
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.error_kind() {
            None => write!(f, "OK"),
            Some(kind) => write!(f, "{}", kind),
        }
    }
}

/// One measured iteration of one cell.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
pub struct Sample {
    /// The zero-based index of this iteration within its cell.
    pub iter: u32,
    /// The elapsed wall clock time of the measured invocation, from the
    /// cell's monotonic timer.
    pub elapsed_ns: u64,
    /// The memory accessor reading immediately before the timed region.
    pub memory_before: u64,
    /// The memory accessor reading immediately after the timed region.
    pub memory_after: u64,
    /// The digest returned by the iteration. Zero when the iteration
    /// failed before producing one.
    pub digest: u32,
    /// Whether the iteration completed and verified.
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl Sample {
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    /// The difference of the memory readings bracketing the timed region.
    /// With a high-water-mark accessor this is the iteration's memory
    /// growth.
    pub fn memory_delta(&self) -> i64 {
        self.memory_after as i64 - self.memory_before as i64
    }
}

/// The ordered samples of one cell, with its terminal status. This is what
/// a measurement context hands back and what the record store holds.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SampleBatch {
    pub cell: CellId,
    pub status: TerminalStatus,
    /// Human readable failure detail, when there is any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub samples: Vec<Sample>,
}

impl SampleBatch {
    /// A batch for a cell that failed before producing any samples.
    pub fn failed(
        cell: CellId,
        status: TerminalStatus,
        error: impl Into<String>,
    ) -> SampleBatch {
        SampleBatch {
            cell,
            status,
            error: Some(error.into()),
            samples: vec![],
        }
    }
}

/// The raw.json document: every batch of the run, in completion order.
///
/// The comparison pair is included so a persisted run can be re-analyzed
/// without its run specification file.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RawReport {
    pub languages: [crate::format::spec::Language; 2],
    pub cells: Vec<SampleBatch>,
}

impl RawReport {
    pub fn from_reader<R: std::io::Read>(rdr: R) -> anyhow::Result<RawReport> {
        Ok(serde_json::from_reader(rdr)?)
    }
}

/// The meta.json document.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct RunMeta {
    pub harness_version: String,
    pub started: chrono::DateTime<chrono::Local>,
    pub finished: chrono::DateTime<chrono::Local>,
    /// Opaque toolchain version strings from the run specification.
    pub toolchains: BTreeMap<String, String>,
    pub global: GlobalParams,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::spec::{Language, Task};

    fn cell() -> CellId {
        CellId {
            task: Task::Mandelbrot,
            language: Language::Rust,
            scale: "small".to_string(),
        }
    }

    #[test]
    fn raw_report_round_trip_is_exact() {
        let report = RawReport {
            languages: [Language::Rust, Language::TinyGo],
            cells: vec![SampleBatch {
                cell: cell(),
                status: TerminalStatus::Ok,
                error: None,
                samples: vec![
                    Sample {
                        iter: 0,
                        elapsed_ns: 1_234_567,
                        memory_before: 65536,
                        memory_after: 131072,
                        digest: 0xDEAD_BEEF,
                        ok: true,
                        error: None,
                    },
                    Sample {
                        iter: 1,
                        elapsed_ns: 1_234_568,
                        memory_before: 131072,
                        memory_after: 131072,
                        digest: 0xDEAD_BEEF,
                        ok: true,
                        error: None,
                    },
                ],
            }],
        };
        let json = serde_json::to_string_pretty(&report).unwrap();
        let back = RawReport::from_reader(json.as_bytes()).unwrap();
        assert_eq!(report, back);
    }

    #[test]
    fn status_strings_match_the_error_taxonomy() {
        let json = serde_json::to_string(&TerminalStatus::ResultMismatch)
            .unwrap();
        assert_eq!(json, "\"RESULT_MISMATCH\"");
        let json = serde_json::to_string(&ErrorKind::IterationTimeout)
            .unwrap();
        assert_eq!(json, "\"ITERATION_TIMEOUT\"");
        // The error kind for a cancelled iteration uses the taxonomy name,
        // not the terminal status name.
        let json = serde_json::to_string(&ErrorKind::Cancelled).unwrap();
        assert_eq!(json, "\"CELL_CANCELLED\"");
        let back: TerminalStatus =
            serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(back, TerminalStatus::Cancelled);
    }

    #[test]
    fn failed_sample_keeps_its_error_kind() {
        let sample = Sample {
            iter: 3,
            elapsed_ns: 500,
            memory_before: 0,
            memory_after: 0,
            digest: 0,
            ok: false,
            error: Some(ErrorKind::RuntimeTrap),
        };
        let json = serde_json::to_string(&sample).unwrap();
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, Some(ErrorKind::RuntimeTrap));
        assert!(!back.ok);
    }
}
