use std::{io::Write, path::PathBuf};

use anyhow::Context;
use unicode_width::UnicodeWidthStr;

use crate::{
    analysis::{ComparisonReport, Verdict},
    args::{self, Color, Usage},
    util::{write_divider, ShortHumanDuration},
};

const USAGES: &[Usage] = &[Color::USAGE];

fn usage_short() -> String {
    format!(
        "\
Print a comparison table from benchmark results.

USAGE:
    wasmgauge cmp [OPTIONS] <comparisons-json-path>

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
Print a comparison table from benchmark results.

This command takes the comparisons.json written by 'wasmgauge measure' (or
re-derived by 'wasmgauge analyze') and renders one row per (task, scale)
pair: the two means, the difference with its confidence interval, the
effect size and the verdict. The winning language, when there is one, is
colorized.

A TIE verdict means either no significant difference, or a difference too
small to matter (negligible effect size). INCONCLUSIVE means at least one
side's data could not support a comparison; check summary.json for the
stability verdicts and reasons.

USAGE:
    wasmgauge cmp [OPTIONS] <comparisons-json-path>

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
    let path = match config.path {
        Some(ref path) => path.clone(),
        None => anyhow::bail!("no comparisons.json path given"),
    };
    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let report: ComparisonReport =
        serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("failed to parse {}", path.display()))?;

    let mut wtr = config.color.elastic_stdout();
    if report.comparisons.is_empty() {
        writeln!(wtr, "no comparisons")?;
        wtr.flush()?;
        return Ok(0);
    }

    let (lang_a, lang_b) =
        (report.comparisons[0].lang_a, report.comparisons[0].lang_b);
    write!(wtr, "benchmark\t{}\t{}\tdiff (95% CI)\td\tp-adj\tverdict", lang_a, lang_b)?;
    writeln!(wtr, "")?;
    write_divider(&mut wtr, '-', "benchmark".width())?;
    for head in [
        lang_a.as_str().to_string(),
        lang_b.as_str().to_string(),
        "diff (95% CI)".to_string(),
        "d".to_string(),
        "p-adj".to_string(),
        "verdict".to_string(),
    ] {
        write!(wtr, "\t")?;
        write_divider(&mut wtr, '-', head.width())?;
    }
    writeln!(wtr, "")?;

    for c in report.comparisons.iter() {
        write!(wtr, "{}/{}", c.task, c.scale)?;
        match c.test {
            None => {
                write!(wtr, "\t-\t-\t-\t-\t-")?;
            }
            Some(ref t) => {
                let highlight_a = c.verdict == Verdict::LangAWins;
                let highlight_b = c.verdict == Verdict::LangBWins;
                write!(wtr, "\t")?;
                write_mean(&mut wtr, t.mean_a, highlight_a)?;
                write!(wtr, "\t")?;
                write_mean(&mut wtr, t.mean_b, highlight_b)?;
                write!(
                    wtr,
                    "\t{} [{}, {}]\t{:+.2}\t{:.4}",
                    signed_duration(t.mean_diff),
                    signed_duration(t.ci_low),
                    signed_duration(t.ci_high),
                    t.cohen_d,
                    t.p_adjusted,
                )?;
            }
        }
        let verdict = match c.verdict {
            Verdict::LangAWins | Verdict::LangBWins => match c.winner {
                Some(winner) => format!("{} wins", winner),
                None => "wins".to_string(),
            },
            Verdict::Tie => "tie".to_string(),
            Verdict::Inconclusive => "inconclusive".to_string(),
        };
        writeln!(wtr, "\t{}", verdict)?;
    }
    wtr.flush()?;
    Ok(0)
}

fn write_mean<W: termcolor::WriteColor>(
    mut wtr: W,
    secs: f64,
    highlight: bool,
) -> anyhow::Result<()> {
    if highlight {
        let mut spec = termcolor::ColorSpec::new();
        spec.set_fg(Some(termcolor::Color::Green)).set_bold(true);
        wtr.set_color(&spec)?;
    }
    write!(
        wtr,
        "{}",
        ShortHumanDuration::from(std::time::Duration::from_secs_f64(
            secs.max(0.0),
        )),
    )?;
    if highlight {
        wtr.reset()?;
    }
    Ok(())
}

/// Format a possibly-negative duration in seconds as a short human string.
fn signed_duration(secs: f64) -> String {
    let magnitude = ShortHumanDuration::from(
        std::time::Duration::from_secs_f64(secs.abs()),
    );
    if secs < 0.0 {
        format!("-{}", magnitude)
    } else {
        format!("{}", magnitude)
    }
}

/// The CLI arguments parsed from the 'cmp' sub-command.
#[derive(Debug, Default)]
struct Config {
    path: Option<PathBuf>,
    color: Color,
}

impl Config {
    fn parse(p: &mut lexopt::Parser) -> anyhow::Result<Config> {
        use lexopt::Arg;

        let mut c = Config::default();
        while let Some(arg) = p.next()? {
            match arg {
                Arg::Value(v) => {
                    anyhow::ensure!(
                        c.path.is_none(),
                        "expected exactly one comparisons.json path",
                    );
                    c.path = Some(PathBuf::from(v));
                }
                Arg::Short('h') => anyhow::bail!("{}", usage_short()),
                Arg::Long("help") => anyhow::bail!("{}", usage_long()),
                Arg::Long("color") => {
                    c.color = args::parse(p, "--color")?;
                }
                _ => return Err(arg.unexpected().into()),
            }
        }
        Ok(c)
    }
}
