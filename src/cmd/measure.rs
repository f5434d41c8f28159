use std::{
    io::Write,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;

use crate::{
    analysis::{self, ComparisonReport},
    args::{self, Filter, Filters, Usage},
    artifact::DirArtifacts,
    context::MeasurementContext,
    format::{records::RunMeta, spec::RunSpec},
    orchestrator::Orchestrator,
    quality::{self, SummaryReport},
    sink::{Event, EventSink, Level, LogSink, Phase},
    store::RecordStore,
    util::{self, ShortHumanDuration},
    wasm::WasmtimeProvider,
};

const USAGES: &[Usage] = &[
    Usage::ARTIFACTS,
    Usage::CONFIG,
    Usage::CONCURRENCY,
    Usage::DIGESTS,
    Filter::USAGE_LANG,
    Filter::USAGE_LANG_NOT,
    Filter::USAGE_CELL,
    Filter::USAGE_CELL_NOT,
    Usage::ITER_TIMEOUT,
    Usage::new(
        "--list",
        "List cells, but don't run them.",
        r#"
List the cells that would be measured, but don't measure them.

This does all of the work to load and cross-validate the run specification,
the digest file and the artifact directory, then prints one line per cell
that passed the filters. It is useful for seeing what work will be done
without doing any of it.
"#,
    ),
    Usage::MEASURE_ITERS,
    Usage::OUT_DIR,
    Usage::RUN_TIMEOUT,
    Filter::USAGE_SCALE,
    Filter::USAGE_SCALE_NOT,
    Usage::new(
        "-t/--test",
        "Alias for --verify --verbose.",
        r#"
An alias for --verify --verbose. The combination of --verify and --verbose
is quite common for being able to confirm that cells run successfully and
being able to see the full error messages if anything goes wrong.
"#,
    ),
    Usage::new(
        "--verbose",
        "Print extra information in some cases.",
        r#"
Print extra information where possible.

Where possible, this prints extra information. e.g., When using --verify,
this will print each cell that is being checked as it happens, as a way to
see progress.
"#,
    ),
    Usage::new(
        "--verify",
        "Verify that cells run correctly.",
        r#"
Verify that all selected cells run successfully.

This checks that every selected cell can bring up its execution environment
and run one iteration that reproduces the reference digest. Nothing is
measured and nothing is persisted. This is useful for quickly debugging a
new artifact or scale where the digests aren't lining up.

This collects all errors reported and prints them. If no errors occurred,
then this prints nothing and exits successfully.
"#,
    ),
    Usage::WARMUP_ITERS,
];

fn usage_short() -> String {
    format!(
        "\
Execute a run specification and write measurements.

USAGE:
    wasmgauge measure [OPTIONS]

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
Execute a run specification and write measurements.

Every selected cell is dispatched to an isolated measurement context, up to
the configured concurrency bound. Each cell produces one sample per measured
iteration. At the end of the run, one run directory is created containing
raw.json (every sample), summary.json (per-cell statistics and stability
verdicts), comparisons.json (the per-task statistical verdicts) and
meta.json.

The exit code is 0 on a clean run, 1 when the run aborted because the cell
failure rate exceeded the configured threshold, and 2 when the run
specification, digest file or artifact directory were invalid before any
cell ran.

To inspect results, use 'wasmgauge cmp' on the comparisons.json, or rerun
the statistics with different thresholds using 'wasmgauge analyze' on the
raw.json.

USAGE:
    wasmgauge measure [OPTIONS]

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
    let sink: Arc<dyn EventSink> = Arc::new(LogSink);

    // Everything that can fail before a cell runs maps to exit code 2.
    let loaded = match config.load(&*sink) {
        Ok(loaded) => loaded,
        Err(err) => {
            writeln!(&mut std::io::stderr(), "{:#}", err)?;
            return Ok(2);
        }
    };
    let (spec, artifacts) = loaded;
    let spec = Arc::new(spec);
    let artifacts = Arc::new(artifacts);

    if config.list {
        let mut wtr = std::io::stdout();
        for cell in spec.cells() {
            writeln!(
                wtr,
                "{},size={},iters={},seed={},digest={}",
                cell.id.name(),
                cell.params.size,
                cell.params.iters,
                cell.params.seed,
                cell.reference
                    .map(|d| format!("{:#010x}", d))
                    .unwrap_or_else(|| "exempt".to_string()),
            )?;
        }
        return Ok(0);
    }

    let envs = Arc::new(WasmtimeProvider::new());
    if config.verify {
        return verify(&spec, &*artifacts, &*envs, config.verbose);
    }

    let started = chrono::Local::now();
    let run_dir = config
        .out_dir
        .join(started.format("%Y%m%dT%H%M%S").to_string());
    std::fs::create_dir_all(&run_dir).with_context(|| {
        format!("failed to create run directory {}", run_dir.display())
    })?;

    let store = Arc::new(RecordStore::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&spec),
        artifacts,
        envs,
        Arc::clone(&store),
        Arc::clone(&sink),
    );
    let outcome = orchestrator.run();
    let finished = chrono::Local::now();

    // Persist all four documents, even for aborted runs: partial data with
    // INCONCLUSIVE verdicts beats no data.
    sink.emit(Event::run(
        Level::Info,
        Phase::Persist,
        format!(
            "writing {} batches to {}",
            store.len(),
            run_dir.display(),
        ),
    ));
    let write = |name: &str, go: &dyn Fn(std::fs::File) -> anyhow::Result<()>| {
        let path = run_dir.join(name);
        let file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        go(file).with_context(|| format!("failed to write {}", path.display()))
    };
    write("raw.json", &|f| store.persist(spec.languages, f))?;

    let batches = store.snapshot();
    let clean = quality::clean_all(&batches, &spec.global().quality);
    write("summary.json", &|f| {
        let report = SummaryReport { cells: clean.clone() };
        Ok(serde_json::to_writer_pretty(f, &report)?)
    })?;

    let comparisons =
        analysis::compare_all(&clean, spec.languages, spec.global().fdr_q);
    write("comparisons.json", &|f| {
        let report = ComparisonReport { comparisons: comparisons.clone() };
        Ok(serde_json::to_writer_pretty(f, &report)?)
    })?;

    write("meta.json", &|f| {
        let meta = RunMeta {
            harness_version: util::version(),
            started,
            finished,
            toolchains: spec.toolchains.clone(),
            global: spec.global().clone(),
        };
        Ok(serde_json::to_writer_pretty(f, &meta)?)
    })?;

    let mut wtr = std::io::stdout();
    writeln!(
        wtr,
        "{} cells: {} ok, {} failed, {} cancelled, {} skipped \
         (total {})",
        outcome.dispatched,
        outcome.completed,
        outcome.failed,
        outcome.cancelled,
        outcome.skipped,
        ShortHumanDuration::from(
            (finished - started).to_std().unwrap_or(Duration::ZERO),
        ),
    )?;
    if outcome.aborted_by_failure_rate {
        writeln!(wtr, "run aborted: failure rate exceeded the threshold")?;
    } else if outcome.aborted_by_run_timeout {
        writeln!(wtr, "run aborted: run timeout exceeded")?;
    }
    writeln!(wtr, "results written to {}", run_dir.display())?;

    Ok(if outcome.aborted_by_failure_rate { 1 } else { 0 })
}

/// Run one digest-verified iteration per cell and report every failure.
fn verify(
    spec: &RunSpec,
    artifacts: &DirArtifacts,
    envs: &WasmtimeProvider,
    verbose: bool,
) -> anyhow::Result<i32> {
    let ctx = MeasurementContext::new(artifacts, envs);
    let mut wtr = std::io::stdout();
    let mut errored = false;
    for cell in spec.cells() {
        match ctx.verify(cell, spec.global()) {
            Ok(()) => {
                if verbose {
                    writeln!(wtr, "{},OK", cell.id.name())?;
                }
            }
            Err(err) => {
                errored = true;
                writeln!(wtr, "{},{:#}", cell.id.name(), err)?;
            }
        }
        wtr.flush()?;
    }
    Ok(if errored { 1 } else { 0 })
}

/// The CLI arguments parsed from the 'measure' sub-command.
#[derive(Clone, Debug)]
struct Config {
    /// The run specification file.
    config_path: PathBuf,
    /// The reference digest file.
    digests_path: PathBuf,
    /// The directory holding compiled WASM artifacts.
    artifacts_dir: PathBuf,
    /// The directory run directories are created under.
    out_dir: PathBuf,
    /// The cell name, language and scale filters.
    filters: Filters,
    /// Whether to just list the cells that would run and quit.
    list: bool,
    /// Whether to just verify all of the cells without measuring anything.
    verify: bool,
    /// When enabled, print extra stuff where appropriate.
    verbose: bool,
    /// Command line overrides for the [run] table.
    warmup_iters: Option<u32>,
    measure_iters: Option<u32>,
    iter_timeout: Option<Duration>,
    concurrency: Option<usize>,
    run_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            config_path: PathBuf::from("wasmgauge.toml"),
            digests_path: PathBuf::from("digests.toml"),
            artifacts_dir: PathBuf::from("artifacts"),
            out_dir: PathBuf::from("runs"),
            filters: Filters::default(),
            list: false,
            verify: false,
            verbose: false,
            warmup_iters: None,
            measure_iters: None,
            iter_timeout: None,
            concurrency: None,
            run_timeout: None,
        }
    }
}

impl Config {
    /// Parse 'measure' args from the given CLI parser.
    fn parse(p: &mut lexopt::Parser) -> anyhow::Result<Config> {
        use lexopt::Arg;

        let mut c = Config::default();
        while let Some(arg) = p.next()? {
            match arg {
                Arg::Short('h') => anyhow::bail!("{}", usage_short()),
                Arg::Long("help") => anyhow::bail!("{}", usage_long()),
                Arg::Short('a') | Arg::Long("artifacts") => {
                    c.artifacts_dir =
                        PathBuf::from(p.value().context("-a/--artifacts")?);
                }
                Arg::Short('c') | Arg::Long("config") => {
                    c.config_path =
                        PathBuf::from(p.value().context("-c/--config")?);
                }
                Arg::Long("digests") => {
                    c.digests_path =
                        PathBuf::from(p.value().context("--digests")?);
                }
                Arg::Short('e') | Arg::Long("lang") => {
                    c.filters.lang.arg_whitelist(p, "-e/--lang")?;
                }
                Arg::Short('E') | Arg::Long("lang-not") => {
                    c.filters.lang.arg_blacklist(p, "-E/--lang-not")?;
                }
                Arg::Short('f') | Arg::Long("filter") => {
                    c.filters.name.arg_whitelist(p, "-f/--filter")?;
                }
                Arg::Short('F') | Arg::Long("filter-not") => {
                    c.filters.name.arg_blacklist(p, "-F/--filter-not")?;
                }
                Arg::Short('j') | Arg::Long("concurrency") => {
                    c.concurrency =
                        Some(args::parse(p, "-j/--concurrency")?);
                }
                Arg::Long("iter-timeout") => {
                    let hdur = args::parse::<ShortHumanDuration>(
                        p,
                        "--iter-timeout",
                    )?;
                    c.iter_timeout = Some(Duration::from(hdur));
                }
                Arg::Long("list") => {
                    c.list = true;
                }
                Arg::Long("measure-iters") => {
                    c.measure_iters =
                        Some(args::parse(p, "--measure-iters")?);
                }
                Arg::Short('o') | Arg::Long("out") => {
                    c.out_dir = PathBuf::from(p.value().context("-o/--out")?);
                }
                Arg::Long("run-timeout") => {
                    let hdur = args::parse::<ShortHumanDuration>(
                        p,
                        "--run-timeout",
                    )?;
                    c.run_timeout = Some(Duration::from(hdur));
                }
                Arg::Short('s') | Arg::Long("scale") => {
                    c.filters.scale.arg_whitelist(p, "-s/--scale")?;
                }
                Arg::Short('S') | Arg::Long("scale-not") => {
                    c.filters.scale.arg_blacklist(p, "-S/--scale-not")?;
                }
                Arg::Short('t') | Arg::Long("test") => {
                    c.verbose = true;
                    c.verify = true;
                }
                Arg::Long("verbose") => {
                    c.verbose = true;
                }
                Arg::Long("verify") => {
                    c.verify = true;
                }
                Arg::Long("warmup-iters") => {
                    c.warmup_iters = Some(args::parse(p, "--warmup-iters")?);
                }
                _ => return Err(arg.unexpected().into()),
            }
        }
        Ok(c)
    }

    /// Load and cross-validate everything the run needs, applying the
    /// filters and the command line overrides.
    fn load(
        &self,
        sink: &dyn EventSink,
    ) -> anyhow::Result<(RunSpec, DirArtifacts)> {
        let artifacts = DirArtifacts::scan(&self.artifacts_dir)?;
        let mut spec = RunSpec::load(
            &self.config_path,
            &self.digests_path,
            &artifacts,
            sink,
        )?;
        spec.retain_cells(&self.filters);
        anyhow::ensure!(
            !spec.cells().is_empty(),
            "no cells selected (check the filters)",
        );
        let global = spec.global_mut();
        if let Some(n) = self.warmup_iters {
            global.warmup_iters = n;
        }
        if let Some(n) = self.measure_iters {
            anyhow::ensure!(n >= 1, "--measure-iters must be at least 1");
            global.measure_iters = n;
        }
        if let Some(timeout) = self.iter_timeout {
            anyhow::ensure!(
                timeout > Duration::ZERO,
                "--iter-timeout must be positive",
            );
            global.iter_timeout = timeout;
        }
        if let Some(n) = self.concurrency {
            anyhow::ensure!(n >= 1, "--concurrency must be at least 1");
            global.concurrency = n;
        }
        if let Some(timeout) = self.run_timeout {
            global.run_timeout = Some(timeout);
        }
        Ok((spec, artifacts))
    }
}
