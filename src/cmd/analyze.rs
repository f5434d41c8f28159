use std::{io::Write, path::PathBuf};

use anyhow::Context;

use crate::{
    analysis::{self, ComparisonReport},
    args::{self, Usage},
    format::records::RawReport,
    quality::{self, SummaryReport},
};

const USAGES: &[Usage] = &[
    Usage::new(
        "--cv-max <ratio>",
        "Maximum coefficient of variation before warning.",
        r#"
The maximum coefficient of variation before a cell is flagged as high
variance (default: 0.15).

Cells above this get verdict ACCEPT-WITH-WARNING: their comparisons still
run, but the variance says the host was noisy (or the workload isn't steady
state yet), so treat the verdicts with suspicion.
"#,
    ),
    Usage::new(
        "--fdr-q <q>",
        "False discovery rate for the BH correction.",
        r#"
The false discovery rate used by the Benjamini-Hochberg correction across
all comparisons of the run (default: 0.05).
"#,
    ),
    Usage::new(
        "--n-min <number>",
        "Minimum surviving samples per cell.",
        r#"
The minimum number of surviving samples a cell needs to support comparison
(default: 30).

Cells below this get verdict REJECT with reason INSUFFICIENT_SAMPLES, and
every comparison involving them becomes INCONCLUSIVE.
"#,
    ),
    Usage::new(
        "-o, --out <directory>",
        "Where to write summary.json and comparisons.json.",
        r#"
Where to write summary.json and comparisons.json.

By default both are written next to the raw.json input, overwriting the
files the measure command wrote there.
"#,
    ),
];

fn usage_short() -> String {
    format!(
        "\
Re-run quality filtering and statistics on a persisted run.

USAGE:
    wasmgauge analyze [OPTIONS] <raw-json-path>

TIP:
    use -h for short docs and --help for long docs

OPTIONS:
{options}
",
        options = Usage::short(USAGES),
    )
    .trim()
    .to_string()
}

fn usage_long() -> String {
    format!(
        "\
Re-run quality filtering and statistics on a persisted run.

This reads a raw.json written by 'wasmgauge measure' and recomputes
summary.json and comparisons.json from it, optionally with different
quality thresholds. The raw samples are never modified; running this twice
with the same inputs produces identical outputs.

This is the escape hatch for the thresholds being wrong for your host: if a
noisy machine pushed every cell into ACCEPT-WITH-WARNING, or a fast
workload needs a larger sample floor, adjust the thresholds here without
re-measuring anything.

USAGE:
    wasmgauge analyze [OPTIONS] <raw-json-path>

TIP:
    use -h for short docs and --help for long docs

OPTIONS:
{options}
",
        options = Usage::long(USAGES),
    )
    .trim()
    .to_string()
}

pub fn run(p: &mut lexopt::Parser) -> anyhow::Result<i32> {
    let config = Config::parse(p)?;
    let raw_path = match config.raw_path {
        Some(ref path) => path.clone(),
        None => anyhow::bail!("no raw.json path given"),
    };
    let file = std::fs::File::open(&raw_path).with_context(|| {
        format!("failed to open {}", raw_path.display())
    })?;
    let report = RawReport::from_reader(std::io::BufReader::new(file))
        .with_context(|| {
            format!("failed to parse {}", raw_path.display())
        })?;

    let params = crate::format::spec::QualityParams {
        n_min: config.n_min,
        cv_max: config.cv_max,
    };
    let clean = quality::clean_all(&report.cells, &params);
    let comparisons =
        analysis::compare_all(&clean, report.languages, config.fdr_q);

    let out_dir = match config.out_dir {
        Some(ref dir) => dir.clone(),
        None => raw_path
            .parent()
            .map(|d| d.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    std::fs::create_dir_all(&out_dir).with_context(|| {
        format!("failed to create {}", out_dir.display())
    })?;

    let summary_path = out_dir.join("summary.json");
    let file = std::fs::File::create(&summary_path).with_context(|| {
        format!("failed to create {}", summary_path.display())
    })?;
    serde_json::to_writer_pretty(file, &SummaryReport { cells: clean })?;

    let comparisons_path = out_dir.join("comparisons.json");
    let file = std::fs::File::create(&comparisons_path).with_context(|| {
        format!("failed to create {}", comparisons_path.display())
    })?;
    serde_json::to_writer_pretty(file, &ComparisonReport { comparisons })?;

    let mut wtr = std::io::stdout();
    writeln!(wtr, "wrote {}", summary_path.display())?;
    writeln!(wtr, "wrote {}", comparisons_path.display())?;
    Ok(0)
}

/// The CLI arguments parsed from the 'analyze' sub-command.
#[derive(Clone, Debug)]
struct Config {
    raw_path: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    n_min: usize,
    cv_max: f64,
    fdr_q: f64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            raw_path: None,
            out_dir: None,
            n_min: 30,
            cv_max: 0.15,
            fdr_q: 0.05,
        }
    }
}

impl Config {
    fn parse(p: &mut lexopt::Parser) -> anyhow::Result<Config> {
        use lexopt::Arg;

        let mut c = Config::default();
        while let Some(arg) = p.next()? {
            match arg {
                Arg::Value(v) => {
                    anyhow::ensure!(
                        c.raw_path.is_none(),
                        "expected exactly one raw.json path",
                    );
                    c.raw_path = Some(PathBuf::from(v));
                }
                Arg::Short('h') => anyhow::bail!("{}", usage_short()),
                Arg::Long("help") => anyhow::bail!("{}", usage_long()),
                Arg::Long("cv-max") => {
                    c.cv_max = args::parse(p, "--cv-max")?;
                    anyhow::ensure!(
                        c.cv_max > 0.0,
                        "--cv-max must be positive",
                    );
                }
                Arg::Long("fdr-q") => {
                    c.fdr_q = args::parse(p, "--fdr-q")?;
                    anyhow::ensure!(
                        0.0 < c.fdr_q && c.fdr_q < 1.0,
                        "--fdr-q must be in (0, 1)",
                    );
                }
                Arg::Long("n-min") => {
                    c.n_min = args::parse(p, "--n-min")?;
                }
                Arg::Short('o') | Arg::Long("out") => {
                    c.out_dir =
                        Some(PathBuf::from(p.value().context("-o/--out")?));
                }
                _ => return Err(arg.unexpected().into()),
            }
        }
        Ok(c)
    }
}
