/*!
The statistical engine: pairwise comparison of the two languages at each
(task, scale), with multiple-comparison control across the run.

Per pair: Welch's two-sample t test on the clean cells' elapsed-time
statistics, the Welch-Satterthwaite degrees of freedom, a 95% confidence
interval on the mean difference, and Cohen's d with the pooled standard
deviation. Raw p-values then go through Benjamini-Hochberg adjustment as a
single family (the elapsed-time metric is the only tested metric, so there
is exactly one family per run).

The verdict table: an adjusted p at or above the configured q is a tie, as
is any significant result with a negligible effect size. Otherwise the sign
of d picks the winner; negative d means language A took less time.

All of this is pure arithmetic over the clean cells, so identical inputs
produce bit-identical comparisons.
*/

use crate::{
    format::spec::{Language, Task},
    quality::CleanCell,
    stats,
};

/// Cohen's d magnitude classes.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EffectClass {
    Negligible,
    Small,
    Medium,
    Large,
}

impl EffectClass {
    fn from_d(d: f64) -> EffectClass {
        let d = d.abs();
        if d < 0.2 {
            EffectClass::Negligible
        } else if d < 0.5 {
            EffectClass::Small
        } else if d < 0.8 {
            EffectClass::Medium
        } else {
            EffectClass::Large
        }
    }
}

/// The categorical outcome of one comparison.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize,
)]
pub enum Verdict {
    #[serde(rename = "LANG-A-WINS")]
    LangAWins,
    #[serde(rename = "LANG-B-WINS")]
    LangBWins,
    #[serde(rename = "TIE")]
    Tie,
    #[serde(rename = "INCONCLUSIVE")]
    Inconclusive,
}

/// The numeric test results. Absent on inconclusive comparisons.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TestResult {
    pub mean_a: f64,
    pub mean_b: f64,
    /// Signed difference of means, a minus b, in seconds. Negative means
    /// language A was faster.
    pub mean_diff: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub t: f64,
    pub df: f64,
    pub p: f64,
    pub p_adjusted: f64,
    pub cohen_d: f64,
    pub effect: EffectClass,
}

/// One (task, scale) comparison between the two languages.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comparison {
    pub task: Task,
    pub scale: String,
    pub lang_a: Language,
    pub lang_b: Language,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestResult>,
}

/// The comparisons.json document.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ComparisonReport {
    pub comparisons: Vec<Comparison>,
}

/// Compare every (task, scale) pair found among the clean cells and apply
/// Benjamini-Hochberg correction across the testable ones.
///
/// Pairs where either side is missing or rejected yield INCONCLUSIVE
/// entries with no test numbers. Pairs where the pooled degrees of freedom
/// are not positive yield nothing at all.
pub fn compare_all(
    clean: &[CleanCell],
    languages: [Language; 2],
    fdr_q: f64,
) -> Vec<Comparison> {
    let [lang_a, lang_b] = languages;

    // (task, scale) keys in order of first appearance, so output order is
    // a deterministic function of input order.
    let mut keys: Vec<(Task, String)> = vec![];
    for cc in clean.iter() {
        let key = (cc.cell.task, cc.cell.scale.clone());
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    let find = |task: Task, scale: &str, language: Language| {
        clean.iter().find(|cc| {
            cc.cell.task == task
                && cc.cell.scale == scale
                && cc.cell.language == language
        })
    };

    let mut comparisons: Vec<Comparison> = vec![];
    for (task, scale) in keys {
        let a = find(task, &scale, lang_a);
        let b = find(task, &scale, lang_b);
        let comparison = match (usable_stats(a), usable_stats(b)) {
            (Some(sa), Some(sb)) => {
                match welch(task, &scale, lang_a, lang_b, sa, sb) {
                    Some(c) => c,
                    // Degenerate degrees of freedom: nothing to emit.
                    None => continue,
                }
            }
            _ => Comparison {
                task,
                scale: scale.clone(),
                lang_a,
                lang_b,
                verdict: Verdict::Inconclusive,
                winner: None,
                test: None,
            },
        };
        comparisons.push(comparison);
    }

    adjust_and_judge(&mut comparisons, fdr_q);
    comparisons
}

/// The summary statistics of a clean cell, if its verdict permits
/// comparison.
fn usable_stats(
    cc: Option<&CleanCell>,
) -> Option<&crate::quality::SummaryStats> {
    let cc = cc?;
    if !cc.verdict.usable() {
        return None;
    }
    cc.stats.as_ref()
}

/// Welch's test plus effect size for one pair. Returns `None` when the
/// pooled degrees of freedom are not positive.
fn welch(
    task: Task,
    scale: &str,
    lang_a: Language,
    lang_b: Language,
    sa: &crate::quality::SummaryStats,
    sb: &crate::quality::SummaryStats,
) -> Option<Comparison> {
    let (na, nb) = (sa.n as f64, sb.n as f64);
    if na + nb - 2.0 <= 0.0 {
        return None;
    }
    let mean_diff = sa.mean - sb.mean;
    let pooled_var = ((na - 1.0) * sa.stddev.powi(2)
        + (nb - 1.0) * sb.stddev.powi(2))
        / (na + nb - 2.0);
    let s_p = pooled_var.sqrt();

    let test = if s_p == 0.0 {
        // Both cells constant: no variance to test against.
        TestResult {
            mean_a: sa.mean,
            mean_b: sb.mean,
            mean_diff,
            ci_low: mean_diff,
            ci_high: mean_diff,
            t: 0.0,
            df: na + nb - 2.0,
            p: 1.0,
            p_adjusted: 1.0,
            cohen_d: 0.0,
            effect: EffectClass::Negligible,
        }
    } else {
        let var_a = sa.stddev.powi(2) / na;
        let var_b = sb.stddev.powi(2) / nb;
        let se = (var_a + var_b).sqrt();
        let t = mean_diff / se;
        // Welch-Satterthwaite. The denominators need n >= 2 on both
        // sides; with n == 1 somewhere the pooled variance above was the
        // only defined quantity, and se is zero-variance-safe because
        // s_p > 0 implies at least one side has spread.
        let df = (var_a + var_b).powi(2)
            / (var_a.powi(2) / (na - 1.0).max(1.0)
                + var_b.powi(2) / (nb - 1.0).max(1.0));
        let p = stats::two_sided_p(t, df);
        let half_width = stats::t_critical(df, 0.025) * se;
        let d = mean_diff / s_p;
        TestResult {
            mean_a: sa.mean,
            mean_b: sb.mean,
            mean_diff,
            ci_low: mean_diff - half_width,
            ci_high: mean_diff + half_width,
            t,
            df,
            p,
            p_adjusted: p,
            cohen_d: d,
            effect: EffectClass::from_d(d),
        }
    };
    Some(Comparison {
        task,
        scale: scale.to_string(),
        lang_a,
        lang_b,
        verdict: Verdict::Tie,
        winner: None,
        test: Some(test),
    })
}

/// Benjamini-Hochberg over the testable comparisons, then the verdict
/// table.
fn adjust_and_judge(comparisons: &mut [Comparison], fdr_q: f64) {
    let testable: Vec<usize> = comparisons
        .iter()
        .enumerate()
        .filter(|(_, c)| c.test.is_some())
        .map(|(i, _)| i)
        .collect();
    let raw: Vec<f64> = testable
        .iter()
        .map(|&i| comparisons[i].test.as_ref().map(|t| t.p).unwrap_or(1.0))
        .collect();
    let adjusted = stats::benjamini_hochberg(&raw);

    for (&i, &p_adjusted) in testable.iter().zip(adjusted.iter()) {
        let comparison = &mut comparisons[i];
        let (lang_a, lang_b) = (comparison.lang_a, comparison.lang_b);
        let test = match comparison.test.as_mut() {
            Some(test) => test,
            None => continue,
        };
        test.p_adjusted = p_adjusted;
        let significant = p_adjusted < fdr_q;
        let (verdict, winner) = if !significant {
            (Verdict::Tie, None)
        } else if test.effect == EffectClass::Negligible {
            (Verdict::Tie, None)
        } else if test.cohen_d < 0.0 {
            (Verdict::LangAWins, Some(lang_a))
        } else {
            (Verdict::LangBWins, Some(lang_b))
        };
        comparison.verdict = verdict;
        comparison.winner = winner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::{records::TerminalStatus, spec::CellId},
        quality::{CleanCell, Stability, StabilityReason, SummaryStats},
    };

    const LANGS: [Language; 2] = [Language::Rust, Language::TinyGo];

    fn clean_cell(
        task: Task,
        scale: &str,
        language: Language,
        n: usize,
        mean: f64,
        stddev: f64,
    ) -> CleanCell {
        CleanCell {
            cell: CellId { task, language, scale: scale.to_string() },
            status: TerminalStatus::Ok,
            verdict: Stability::Accept,
            reason: None,
            n_raw: n,
            n_failed: 0,
            n_outliers: 0,
            stats: Some(SummaryStats {
                n,
                mean,
                median: mean,
                stddev,
                cv: if mean > 0.0 { stddev / mean } else { 0.0 },
                min: mean - stddev,
                max: mean + stddev,
                q1: mean - stddev,
                q3: mean + stddev,
                mean_memory_delta: 0.0,
            }),
        }
    }

    fn rejected(task: Task, scale: &str, language: Language) -> CleanCell {
        CleanCell {
            cell: CellId { task, language, scale: scale.to_string() },
            status: TerminalStatus::Ok,
            verdict: Stability::Reject,
            reason: Some(StabilityReason::InsufficientSamples),
            n_raw: 5,
            n_failed: 0,
            n_outliers: 0,
            stats: None,
        }
    }

    #[test]
    fn clear_winner_is_large_and_significant() {
        // Mean 10ms sd 0.5 versus mean 20ms sd 1.0, n = 100 each. Cohen's
        // d lands around -12.6 and the p-value is indistinguishable from
        // zero.
        let clean = vec![
            clean_cell(
                Task::Mandelbrot, "small", Language::Rust, 100, 0.010, 0.0005,
            ),
            clean_cell(
                Task::Mandelbrot, "small", Language::TinyGo, 100, 0.020, 0.001,
            ),
        ];
        let cs = compare_all(&clean, LANGS, 0.05);
        assert_eq!(cs.len(), 1);
        let c = &cs[0];
        assert_eq!(c.verdict, Verdict::LangAWins);
        assert_eq!(c.winner, Some(Language::Rust));
        let t = c.test.as_ref().unwrap();
        assert_eq!(t.effect, EffectClass::Large);
        assert!((t.cohen_d + 12.6).abs() < 0.1, "d = {}", t.cohen_d);
        assert!(t.p < 1e-10);
        assert!(t.p_adjusted < 1e-10);
        assert!(t.ci_high < 0.0);
        assert!(t.mean_diff < 0.0);
    }

    #[test]
    fn identical_distributions_tie() {
        let clean = vec![
            clean_cell(
                Task::MatMul, "small", Language::Rust, 100, 0.015, 0.001,
            ),
            clean_cell(
                Task::MatMul, "small", Language::TinyGo, 100, 0.015, 0.001,
            ),
        ];
        let cs = compare_all(&clean, LANGS, 0.05);
        assert_eq!(cs[0].verdict, Verdict::Tie);
        assert_eq!(cs[0].winner, None);
        let t = cs[0].test.as_ref().unwrap();
        assert_eq!(t.t, 0.0);
        assert!((t.p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn negligible_effect_ties_despite_significance() {
        // Huge n makes a trivial difference significant; the effect class
        // gate turns it into a tie anyway.
        let clean = vec![
            clean_cell(
                Task::JsonParse, "large", Language::Rust, 10000, 1.000, 0.010,
            ),
            clean_cell(
                Task::JsonParse, "large", Language::TinyGo, 10000, 1.001,
                0.010,
            ),
        ];
        let cs = compare_all(&clean, LANGS, 0.05);
        let t = cs[0].test.as_ref().unwrap();
        assert!(t.p_adjusted < 0.05, "p_adj = {}", t.p_adjusted);
        assert_eq!(t.effect, EffectClass::Negligible);
        assert_eq!(cs[0].verdict, Verdict::Tie);
    }

    #[test]
    fn rejected_cell_makes_the_pair_inconclusive() {
        let clean = vec![
            clean_cell(
                Task::Mandelbrot, "small", Language::Rust, 100, 0.010, 0.001,
            ),
            rejected(Task::Mandelbrot, "small", Language::TinyGo),
        ];
        let cs = compare_all(&clean, LANGS, 0.05);
        assert_eq!(cs.len(), 1);
        assert_eq!(cs[0].verdict, Verdict::Inconclusive);
        assert!(cs[0].test.is_none());
    }

    #[test]
    fn missing_cell_makes_the_pair_inconclusive() {
        let clean = vec![clean_cell(
            Task::Mandelbrot, "small", Language::Rust, 100, 0.010, 0.001,
        )];
        let cs = compare_all(&clean, LANGS, 0.05);
        assert_eq!(cs[0].verdict, Verdict::Inconclusive);
    }

    #[test]
    fn both_constant_cells_tie_with_unit_p() {
        let clean = vec![
            clean_cell(
                Task::MatMul, "small", Language::Rust, 50, 0.010, 0.0,
            ),
            clean_cell(
                Task::MatMul, "small", Language::TinyGo, 50, 0.012, 0.0,
            ),
        ];
        let cs = compare_all(&clean, LANGS, 0.05);
        let t = cs[0].test.as_ref().unwrap();
        assert_eq!(t.cohen_d, 0.0);
        assert_eq!(t.p, 1.0);
        assert_eq!(cs[0].verdict, Verdict::Tie);
    }

    #[test]
    fn bh_adjustment_spans_the_whole_run() {
        // Three pairs: one overwhelming, one moderate, one null. The
        // moderate raw p gets scaled by the family size.
        let mut clean = vec![
            clean_cell(
                Task::Mandelbrot, "small", Language::Rust, 100, 0.010, 0.0005,
            ),
            clean_cell(
                Task::Mandelbrot, "small", Language::TinyGo, 100, 0.020,
                0.001,
            ),
            clean_cell(
                Task::JsonParse, "small", Language::Rust, 30, 0.0100, 0.001,
            ),
            clean_cell(
                Task::JsonParse, "small", Language::TinyGo, 30, 0.0106, 0.001,
            ),
            clean_cell(
                Task::MatMul, "small", Language::Rust, 50, 0.015, 0.001,
            ),
            clean_cell(
                Task::MatMul, "small", Language::TinyGo, 50, 0.015, 0.001,
            ),
        ];
        let cs = compare_all(&clean, LANGS, 0.05);
        assert_eq!(cs.len(), 3);
        let by_task = |task: Task| {
            cs.iter().find(|c| c.task == task).unwrap()
        };
        let moderate = by_task(Task::JsonParse).test.as_ref().unwrap();
        assert!(moderate.p_adjusted >= moderate.p);
        let null = by_task(Task::MatMul);
        assert_eq!(null.verdict, Verdict::Tie);

        // Bit-identical reruns on identical input.
        clean.shrink_to_fit();
        let cs2 = compare_all(&clean, LANGS, 0.05);
        assert_eq!(cs, cs2);
    }

    #[test]
    fn report_round_trips_through_json() {
        let clean = vec![
            clean_cell(
                Task::Mandelbrot, "small", Language::Rust, 100, 0.010, 0.0005,
            ),
            clean_cell(
                Task::Mandelbrot, "small", Language::TinyGo, 100, 0.020,
                0.001,
            ),
        ];
        let report =
            ComparisonReport { comparisons: compare_all(&clean, LANGS, 0.05) };
        let json = serde_json::to_string_pretty(&report).unwrap();
        assert!(json.contains("\"LANG-A-WINS\""));
        let back: ComparisonReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report, back);
    }
}
