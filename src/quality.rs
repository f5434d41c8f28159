/*!
The quality filter: turns each sample batch into a clean cell with a
stability verdict.

The pipeline per cell: drop failed samples (retained in the raw record,
excluded from statistics), remove outliers with a single interquartile
range pass over the elapsed times, derive summary statistics from whatever
survived, then gate. A cell whose terminal status is not OK is rejected
outright no matter what its samples look like; a cell with too few
surviving samples is rejected; a cell whose coefficient of variation is too
high is accepted with a warning so downstream comparison still runs.

The IQR fence is computed once, from the quartiles of all surviving
samples. Values inside the fence are never re-filtered against quartiles of
the reduced set.
*/

use crate::{
    format::{
        records::SampleBatch,
        spec::{CellId, QualityParams},
    },
    stats,
};

/// The stability verdict for one cell.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
pub enum Stability {
    #[serde(rename = "ACCEPT")]
    Accept,
    #[serde(rename = "ACCEPT-WITH-WARNING")]
    AcceptWithWarning,
    #[serde(rename = "REJECT")]
    Reject,
}

impl Stability {
    /// Whether a comparison may use this cell.
    pub fn usable(&self) -> bool {
        !matches!(*self, Stability::Reject)
    }
}

/// Why a cell got a verdict other than plain ACCEPT.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StabilityReason {
    InsufficientSamples,
    HighVariance,
    /// The cell's terminal status was not OK.
    CellFailed,
}

/// Summary statistics over the surviving elapsed times, in seconds.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SummaryStats {
    pub n: usize,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    /// Coefficient of variation, stddev / mean.
    pub cv: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub q3: f64,
    /// Mean of the per-sample memory deltas, in bytes. Opaque: the value
    /// only means anything relative to other iterations of the same cell.
    pub mean_memory_delta: f64,
}

/// A sample batch after quality filtering.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CleanCell {
    pub cell: CellId,
    pub status: crate::format::records::TerminalStatus,
    pub verdict: Stability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StabilityReason>,
    /// Samples recorded for the cell, including failed ones.
    pub n_raw: usize,
    /// Samples dropped because the iteration failed.
    pub n_failed: usize,
    /// Samples dropped by the IQR fence.
    pub n_outliers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<SummaryStats>,
}

/// The summary.json document.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SummaryReport {
    pub cells: Vec<CleanCell>,
}

/// Filter one batch.
pub fn clean(batch: &SampleBatch, params: &QualityParams) -> CleanCell {
    let n_raw = batch.samples.len();
    let ok_samples: Vec<&crate::format::records::Sample> =
        batch.samples.iter().filter(|s| s.ok).collect();
    let n_failed = n_raw - ok_samples.len();

    let mut elapsed: Vec<f64> =
        ok_samples.iter().map(|s| s.elapsed_secs()).collect();
    elapsed.sort_unstable_by(|x, y| x.total_cmp(y));

    // Outlier fence from the quartiles of all surviving samples. One pass.
    let (kept, n_outliers) = match (
        stats::percentile(&elapsed, 0.25),
        stats::percentile(&elapsed, 0.75),
    ) {
        (Some(q1), Some(q3)) => {
            let iqr = q3 - q1;
            let lo = q1 - 1.5 * iqr;
            let hi = q3 + 1.5 * iqr;
            let kept: Vec<&crate::format::records::Sample> = ok_samples
                .iter()
                .filter(|s| {
                    let x = s.elapsed_secs();
                    lo <= x && x <= hi
                })
                .copied()
                .collect();
            let outliers = ok_samples.len() - kept.len();
            (kept, outliers)
        }
        _ => (vec![], 0),
    };

    let stats = summarize(&kept);
    let (verdict, reason) = gate(batch, &stats, params);
    CleanCell {
        cell: batch.cell.clone(),
        status: batch.status,
        verdict,
        reason,
        n_raw,
        n_failed,
        n_outliers,
        stats,
    }
}

/// Filter every batch of a run.
pub fn clean_all(
    batches: &[SampleBatch],
    params: &QualityParams,
) -> Vec<CleanCell> {
    batches.iter().map(|b| clean(b, params)).collect()
}

fn summarize(
    kept: &[&crate::format::records::Sample],
) -> Option<SummaryStats> {
    let mut xs: Vec<f64> = kept.iter().map(|s| s.elapsed_secs()).collect();
    xs.sort_unstable_by(|x, y| x.total_cmp(y));
    let n = xs.len();
    let mean = stats::mean(&xs)?;
    let stddev = stats::stddev(&xs)?;
    let cv = if mean > 0.0 { stddev / mean } else { 0.0 };
    let deltas: Vec<f64> =
        kept.iter().map(|s| s.memory_delta() as f64).collect();
    Some(SummaryStats {
        n,
        mean,
        // Unwraps below are fine: n > 0 or `mean` above already bailed.
        median: stats::percentile(&xs, 0.5)?,
        stddev,
        cv,
        min: xs[0],
        max: xs[n - 1],
        q1: stats::percentile(&xs, 0.25)?,
        q3: stats::percentile(&xs, 0.75)?,
        mean_memory_delta: stats::mean(&deltas).unwrap_or(0.0),
    })
}

fn gate(
    batch: &SampleBatch,
    stats: &Option<SummaryStats>,
    params: &QualityParams,
) -> (Stability, Option<StabilityReason>) {
    if !batch.status.is_ok() {
        return (Stability::Reject, Some(StabilityReason::CellFailed));
    }
    let n = stats.as_ref().map_or(0, |s| s.n);
    if n < params.n_min {
        return (
            Stability::Reject,
            Some(StabilityReason::InsufficientSamples),
        );
    }
    // n >= n_min >= 1 means stats is present.
    match stats {
        Some(s) if s.cv > params.cv_max => (
            Stability::AcceptWithWarning,
            Some(StabilityReason::HighVariance),
        ),
        _ => (Stability::Accept, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{
        records::{ErrorKind, Sample, SampleBatch, TerminalStatus},
        spec::{CellId, Language, Task},
    };

    fn params() -> QualityParams {
        QualityParams { n_min: 30, cv_max: 0.15 }
    }

    fn cell_id() -> CellId {
        CellId {
            task: Task::Mandelbrot,
            language: Language::Rust,
            scale: "small".to_string(),
        }
    }

    fn batch_of(millis: &[f64]) -> SampleBatch {
        let samples = millis
            .iter()
            .enumerate()
            .map(|(i, &ms)| Sample {
                iter: i as u32,
                elapsed_ns: (ms * 1_000_000.0) as u64,
                memory_before: 1000,
                memory_after: 1100,
                digest: 1,
                ok: true,
                error: None,
            })
            .collect();
        SampleBatch {
            cell: cell_id(),
            status: TerminalStatus::Ok,
            error: None,
            samples,
        }
    }

    #[test]
    fn identical_samples_accept_with_zero_cv() {
        let batch = batch_of(&[10.0; 40]);
        let clean = clean(&batch, &params());
        assert_eq!(clean.verdict, Stability::Accept);
        assert_eq!(clean.reason, None);
        let stats = clean.stats.unwrap();
        assert_eq!(stats.n, 40);
        assert_eq!(stats.cv, 0.0);
        assert_eq!(stats.mean, 0.010);
        assert_eq!(stats.median, 0.010);
        assert_eq!(clean.n_outliers, 0);
    }

    #[test]
    fn too_few_samples_reject() {
        let batch = batch_of(&[10.0; 20]);
        let clean = clean(&batch, &params());
        assert_eq!(clean.verdict, Stability::Reject);
        assert_eq!(clean.reason, Some(StabilityReason::InsufficientSamples));
        // Statistics are still derived for the record.
        assert!(clean.stats.is_some());
    }

    #[test]
    fn high_variance_accepts_with_warning() {
        // Mean 50ms, half at 40 and half at 60: CV just above 0.20.
        let mut ms = vec![40.0; 50];
        ms.extend(vec![60.0; 50]);
        let batch = batch_of(&ms);
        let clean = clean(&batch, &params());
        assert_eq!(clean.verdict, Stability::AcceptWithWarning);
        assert_eq!(clean.reason, Some(StabilityReason::HighVariance));
        let stats = clean.stats.unwrap();
        assert!(stats.cv > 0.15, "cv = {}", stats.cv);
        assert_eq!(clean.n_outliers, 0);
    }

    #[test]
    fn iqr_fence_excludes_the_outlier() {
        let mut ms = vec![10.0; 39];
        ms.push(100.0);
        let batch = batch_of(&ms);
        let clean = clean(&batch, &params());
        assert_eq!(clean.n_outliers, 1);
        let stats = clean.stats.unwrap();
        assert_eq!(stats.n, 39);
        assert_eq!(stats.cv, 0.0);
        assert_eq!(clean.verdict, Stability::Accept);
        assert_eq!(stats.max, 0.010);
    }

    #[test]
    fn failed_samples_leave_statistics_but_stay_counted() {
        let mut batch = batch_of(&[10.0; 60]);
        for sample in batch.samples.iter_mut().take(30) {
            sample.ok = false;
            sample.error = Some(ErrorKind::RuntimeTrap);
        }
        let clean = clean(&batch, &params());
        assert_eq!(clean.n_raw, 60);
        assert_eq!(clean.n_failed, 30);
        let stats = clean.stats.unwrap();
        assert_eq!(stats.n, 30);
        // 30 surviving identical samples still meet n_min.
        assert_eq!(clean.verdict, Stability::Accept);
    }

    #[test]
    fn failed_cell_is_rejected_regardless_of_samples() {
        let mut batch = batch_of(&[10.0; 60]);
        batch.status = TerminalStatus::IterationTimeout;
        let clean = clean(&batch, &params());
        assert_eq!(clean.verdict, Stability::Reject);
        assert_eq!(clean.reason, Some(StabilityReason::CellFailed));
        // The raw record is preserved: statistics still describe it.
        assert!(clean.stats.is_some());
    }

    #[test]
    fn empty_batch_rejects_without_stats() {
        let batch = SampleBatch {
            cell: cell_id(),
            status: TerminalStatus::Ok,
            error: None,
            samples: vec![],
        };
        let clean = clean(&batch, &params());
        assert_eq!(clean.verdict, Stability::Reject);
        assert_eq!(clean.reason, Some(StabilityReason::InsufficientSamples));
        assert!(clean.stats.is_none());
    }

    #[test]
    fn memory_delta_is_averaged_over_kept_samples() {
        let batch = batch_of(&[10.0; 40]);
        let clean = clean(&batch, &params());
        let stats = clean.stats.unwrap();
        assert_eq!(stats.mean_memory_delta, 100.0);
    }
}
