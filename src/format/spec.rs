/*!
The run specification: the frozen, validated description of everything a run
will execute.

The specification is declared in two TOML files. The main file lists the
tasks, the two languages under comparison, the scales (with their parameter
blocks) and the global measurement parameters. The digest file maps each
(task, scale, seed) triple to the 32-bit result digest a correct workload
must produce, or marks the triple as exempt from digest checking.

Loading cross-validates the two files against each other and against the
artifact provider, and produces an immutable `RunSpec`. Cells come out in a
deterministic order (task-major, then scale, then language, all in declared
order) that never depends on map iteration order.
*/

use std::{collections::BTreeMap, path::Path, time::Duration};

use {anyhow::Context, once_cell::sync::Lazy};

use crate::{
    artifact::ArtifactProvider,
    sink::{Event, EventSink, Level, Phase},
};

/// One of the three fixed computational workloads.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    serde::Deserialize,
    serde::Serialize,
)]
pub enum Task {
    #[serde(rename = "mandelbrot")]
    Mandelbrot,
    #[serde(rename = "json-parse")]
    JsonParse,
    #[serde(rename = "matmul")]
    MatMul,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Task::Mandelbrot => "mandelbrot",
            Task::JsonParse => "json-parse",
            Task::MatMul => "matmul",
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Task {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Task> {
        Ok(match s {
            "mandelbrot" => Task::Mandelbrot,
            "json-parse" => Task::JsonParse,
            "matmul" => Task::MatMul,
            unknown => anyhow::bail!(
                "unrecognized task '{}', must be one of \
                 mandelbrot, json-parse or matmul",
                unknown,
            ),
        })
    }
}

/// One of the two code generators under comparison.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    serde::Deserialize,
    serde::Serialize,
)]
pub enum Language {
    #[serde(rename = "rust")]
    Rust,
    #[serde(rename = "tinygo")]
    TinyGo,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match *self {
            Language::Rust => "rust",
            Language::TinyGo => "tinygo",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Language> {
        Ok(match s {
            "rust" => Language::Rust,
            "tinygo" => Language::TinyGo,
            unknown => anyhow::bail!(
                "unrecognized language '{}', must be one of rust or tinygo",
                unknown,
            ),
        })
    }
}

/// The identity of one cell: the (task, language, scale) triple that is the
/// atomic unit of scheduling and measurement.
#[derive(
    Clone,
    Debug,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    serde::Deserialize,
    serde::Serialize,
)]
pub struct CellId {
    pub task: Task,
    pub language: Language,
    pub scale: String,
}

impl CellId {
    /// The full display name, which is also what the -f/--filter flag
    /// matches on.
    pub fn name(&self) -> String {
        format!("{}/{}/{}", self.task, self.scale, self.language)
    }

    /// The file stem the artifact provider looks for.
    pub fn artifact_stem(&self) -> String {
        format!("{}-{}-{}", self.task, self.language, self.scale)
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One cell, immutable after construction. Everything a measurement context
/// needs to execute it is in here.
#[derive(Clone, Debug)]
pub struct Cell {
    pub id: CellId,
    /// The parameter block written into guest memory, including the seed
    /// that `init` is called with.
    pub params: abi::ParamsBlock,
    /// The reference digest every iteration must reproduce, or `None` when
    /// the cell is digest-exempt.
    pub reference: Option<u32>,
}

/// The quality filter thresholds.
#[derive(Clone, Copy, Debug, serde::Deserialize, serde::Serialize)]
pub struct QualityParams {
    /// The minimum number of surviving samples a cell needs to support
    /// comparison.
    pub n_min: usize,
    /// The maximum coefficient of variation before a cell is flagged as
    /// high variance.
    pub cv_max: f64,
}

/// Global parameters applying to every cell of the run.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct GlobalParams {
    pub warmup_iters: u32,
    pub measure_iters: u32,
    #[serde(with = "crate::util::humandur")]
    pub iter_timeout: Duration,
    pub concurrency: usize,
    /// Abort the run when, after at least `failure_min_cells` cells have
    /// settled, the fraction of failed cells exceeds this.
    pub failure_rate_threshold: f64,
    pub failure_min_cells: usize,
    /// Fail a cell when more than this fraction of its measured iterations
    /// trap.
    pub iter_failure_rate: f64,
    /// Multiplier on the per-cell wall clock budget enforced by the
    /// orchestrator as a backstop.
    pub cell_timeout_factor: f64,
    #[serde(with = "crate::util::humandur_opt")]
    pub run_timeout: Option<Duration>,
    pub quality: QualityParams,
    /// The false discovery rate for Benjamini-Hochberg correction.
    pub fdr_q: f64,
}

impl GlobalParams {
    /// The per-cell wall clock budget: every iteration (warmup included) at
    /// its own timeout, scaled by the safety factor. The per-iteration
    /// timeout inside the context is the primary enforcement; this is the
    /// orchestrator's backstop against a wedged context.
    pub fn cell_timeout(&self) -> Duration {
        let iters = u64::from(self.warmup_iters + self.measure_iters).max(1);
        let budget = self.iter_timeout.as_secs_f64()
            * (iters as f64)
            * self.cell_timeout_factor;
        Duration::from_secs_f64(budget)
    }

    /// How long the orchestrator waits for a cancelled cell to settle before
    /// giving up on its worker. A cancelled cell finishes its current
    /// iteration, which is itself bounded by the iteration timeout, so twice
    /// that timeout is already generous.
    pub fn grace(&self) -> Duration {
        std::cmp::max(2 * self.iter_timeout, Duration::from_millis(250))
    }
}

/// A frozen, validated run specification.
#[derive(Clone, Debug)]
pub struct RunSpec {
    /// The comparison pair, in declared order. Comparisons report language A
    /// versus language B in exactly this order.
    pub languages: [Language; 2],
    /// Opaque toolchain version strings, echoed into meta.json.
    pub toolchains: BTreeMap<String, String>,
    cells: Vec<Cell>,
    global: GlobalParams,
}

impl RunSpec {
    /// Load and validate a run specification from the two declared TOML
    /// files, checking every declared cell against the artifact provider.
    ///
    /// Cells whose (task, scale, seed) triple has no digest entry are
    /// flagged through the sink and run digest-exempt. Cells with no
    /// artifact reject the whole specification.
    pub fn load(
        spec_path: &Path,
        digests_path: &Path,
        artifacts: &dyn ArtifactProvider,
        sink: &dyn EventSink,
    ) -> anyhow::Result<RunSpec> {
        let spec_data =
            std::fs::read_to_string(spec_path).with_context(|| {
                format!("failed to read run spec {}", spec_path.display())
            })?;
        let digest_data =
            std::fs::read_to_string(digests_path).with_context(|| {
                format!("failed to read digests {}", digests_path.display())
            })?;
        RunSpec::from_slices(&spec_data, &digest_data, artifacts, sink)
            .with_context(|| {
                format!("invalid run spec {}", spec_path.display())
            })
    }

    /// Like `load`, but from in-memory TOML data. This is what the tests
    /// use.
    pub fn from_slices(
        spec_data: &str,
        digest_data: &str,
        artifacts: &dyn ArtifactProvider,
        sink: &dyn EventSink,
    ) -> anyhow::Result<RunSpec> {
        let wire: WireSpec = toml::from_str(spec_data)
            .context("error decoding run spec TOML")?;
        let digests: WireDigests = toml::from_str(digest_data)
            .context("error decoding digest TOML")?;
        let digests = digests.into_map()?;
        wire.validate()?;

        let mut tasks: Vec<Task> = vec![];
        for name in wire.tasks.iter() {
            let task: Task = name.parse()?;
            anyhow::ensure!(
                !tasks.contains(&task),
                "task '{}' is declared more than once",
                task,
            );
            tasks.push(task);
        }
        let mut languages: Vec<Language> = vec![];
        for name in wire.languages.iter() {
            let language: Language = name.parse()?;
            anyhow::ensure!(
                !languages.contains(&language),
                "language '{}' is declared more than once",
                language,
            );
            languages.push(language);
        }
        anyhow::ensure!(
            languages.len() == 2,
            "expected exactly 2 languages to compare, got {}",
            languages.len(),
        );

        // Scale names end up in artifact file stems and cell names, so
        // they are restricted to the same shape as everything else there.
        static RE_SCALE: Lazy<regex_lite::Regex> = Lazy::new(|| {
            regex_lite::Regex::new(r"^[-A-Za-z0-9]+$").unwrap()
        });
        let mut seen_scales: Vec<&str> = vec![];
        for scale in wire.scales.iter() {
            anyhow::ensure!(
                RE_SCALE.is_match(&scale.name),
                "scale name '{}' does not match format '{}'",
                scale.name,
                RE_SCALE.as_str(),
            );
            anyhow::ensure!(
                !seen_scales.contains(&&*scale.name),
                "scale '{}' is declared more than once",
                scale.name,
            );
            seen_scales.push(&scale.name);
        }
        anyhow::ensure!(!wire.scales.is_empty(), "no scales declared");

        // Cell order is the published contract: task-major, then scale,
        // then language, all in declared order.
        let mut cells = vec![];
        let mut missing = vec![];
        for &task in tasks.iter() {
            for scale in wire.scales.iter() {
                for &language in languages.iter() {
                    let id = CellId {
                        task,
                        language,
                        scale: scale.name.clone(),
                    };
                    let reference = match digests
                        .get(&(task, scale.name.clone(), scale.seed))
                    {
                        Some(&DigestEntry::Value(v)) => Some(v),
                        Some(&DigestEntry::Exempt) => None,
                        None => {
                            sink.emit(Event::cell(
                                Level::Warn,
                                &id,
                                Phase::Config,
                                format!(
                                    "no reference digest for \
                                     (task={}, scale={}, seed={}); \
                                     digest checking disabled for this cell",
                                    task, scale.name, scale.seed,
                                ),
                            ));
                            None
                        }
                    };
                    if !artifacts.exists(&id) {
                        missing.push(id.clone());
                    }
                    cells.push(Cell {
                        id,
                        params: abi::ParamsBlock {
                            size: scale.size,
                            iters: scale.iters,
                            seed: scale.seed,
                        },
                        reference,
                    });
                }
            }
        }
        if !missing.is_empty() {
            let names: Vec<String> =
                missing.iter().map(|id| id.artifact_stem()).collect();
            anyhow::bail!(
                "missing artifacts for {} cell(s): {}",
                missing.len(),
                names.join(", "),
            );
        }

        let global = wire.run.into_global();
        Ok(RunSpec {
            languages: [languages[0], languages[1]],
            toolchains: wire.toolchains,
            cells,
            global,
        })
    }

    /// The cells of this run, in deterministic dispatch order.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// The global parameters of this run.
    pub fn global(&self) -> &GlobalParams {
        &self.global
    }

    /// Retain only cells passing the given filters. Used by the measure
    /// command; the relative order of surviving cells is unchanged.
    pub fn retain_cells(&mut self, filters: &crate::args::Filters) {
        self.cells.retain(|c| {
            filters.include(
                &c.id.name(),
                c.id.language.as_str(),
                &c.id.scale,
            )
        });
    }

    /// Override selected global parameters from the command line.
    pub fn global_mut(&mut self) -> &mut GlobalParams {
        &mut self.global
    }
}

/// The wire representation of the main run specification file.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct WireSpec {
    tasks: Vec<String>,
    languages: Vec<String>,
    run: WireRun,
    #[serde(rename = "scale")]
    #[serde(default)]
    scales: Vec<WireScale>,
    #[serde(default)]
    toolchains: BTreeMap<String, String>,
}

impl WireSpec {
    fn validate(&self) -> anyhow::Result<()> {
        let run = &self.run;
        anyhow::ensure!(
            run.measure_iters >= 1,
            "measure-iters must be at least 1",
        );
        anyhow::ensure!(
            Duration::from(run.iter_timeout) > Duration::ZERO,
            "iter-timeout must be positive",
        );
        anyhow::ensure!(
            run.concurrency.map_or(true, |n| n >= 1),
            "concurrency must be at least 1",
        );
        anyhow::ensure!(
            0.0 < run.failure_rate_threshold
                && run.failure_rate_threshold <= 1.0,
            "failure-rate-threshold must be in (0, 1]",
        );
        anyhow::ensure!(
            0.0 < run.iter_failure_rate && run.iter_failure_rate <= 1.0,
            "iter-failure-rate must be in (0, 1]",
        );
        anyhow::ensure!(
            run.cell_timeout_factor >= 1.0,
            "cell-timeout-factor must be at least 1",
        );
        anyhow::ensure!(run.cv_max > 0.0, "cv-max must be positive");
        anyhow::ensure!(
            0.0 < run.fdr_q && run.fdr_q < 1.0,
            "fdr-q must be in (0, 1)",
        );
        Ok(())
    }
}

/// The `[run]` table of the main file. Everything optional defaults to a
/// value that is reasonable on an ordinary workstation.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct WireRun {
    warmup_iters: u32,
    measure_iters: u32,
    iter_timeout: crate::util::ShortHumanDuration,
    concurrency: Option<usize>,
    #[serde(default = "default_failure_rate")]
    failure_rate_threshold: f64,
    #[serde(default = "default_failure_min_cells")]
    failure_min_cells: usize,
    #[serde(default = "default_iter_failure_rate")]
    iter_failure_rate: f64,
    #[serde(default = "default_cell_timeout_factor")]
    cell_timeout_factor: f64,
    run_timeout: Option<crate::util::ShortHumanDuration>,
    #[serde(default = "default_n_min")]
    n_min: usize,
    #[serde(default = "default_cv_max")]
    cv_max: f64,
    #[serde(default = "default_fdr_q")]
    fdr_q: f64,
}

impl WireRun {
    fn into_global(self) -> GlobalParams {
        GlobalParams {
            warmup_iters: self.warmup_iters,
            measure_iters: self.measure_iters,
            iter_timeout: Duration::from(self.iter_timeout),
            concurrency: self.concurrency.unwrap_or_else(num_cpus::get),
            failure_rate_threshold: self.failure_rate_threshold,
            failure_min_cells: self.failure_min_cells,
            iter_failure_rate: self.iter_failure_rate,
            cell_timeout_factor: self.cell_timeout_factor,
            run_timeout: self.run_timeout.map(Duration::from),
            quality: QualityParams { n_min: self.n_min, cv_max: self.cv_max },
            fdr_q: self.fdr_q,
        }
    }
}

fn default_failure_rate() -> f64 {
    0.3
}

fn default_failure_min_cells() -> usize {
    4
}

fn default_iter_failure_rate() -> f64 {
    0.5
}

fn default_cell_timeout_factor() -> f64 {
    1.5
}

fn default_n_min() -> usize {
    30
}

fn default_cv_max() -> f64 {
    0.15
}

fn default_fdr_q() -> f64 {
    0.05
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct WireScale {
    name: String,
    size: u32,
    #[serde(default)]
    iters: u32,
    seed: u32,
}

/// A reference digest entry: either the expected value, or an explicit
/// exemption for (task, scale, seed) triples whose digests differ across
/// code generators for floating point reasons.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DigestEntry {
    Value(u32),
    Exempt,
}

#[derive(Clone, Debug, serde::Deserialize)]
struct WireDigests {
    #[serde(rename = "digest")]
    #[serde(default)]
    digests: Vec<WireDigest>,
}

impl WireDigests {
    fn into_map(
        self,
    ) -> anyhow::Result<BTreeMap<(Task, String, u32), DigestEntry>> {
        let mut map = BTreeMap::new();
        for d in self.digests {
            let task: Task = d.task.parse()?;
            let entry = match (d.value, d.exempt) {
                (Some(v), false) => DigestEntry::Value(v),
                (None, true) => DigestEntry::Exempt,
                (Some(_), true) => anyhow::bail!(
                    "digest for (task={}, scale={}, seed={}) sets both \
                     'value' and 'exempt'",
                    d.task,
                    d.scale,
                    d.seed,
                ),
                (None, false) => anyhow::bail!(
                    "digest for (task={}, scale={}, seed={}) needs either \
                     'value' or 'exempt = true'",
                    d.task,
                    d.scale,
                    d.seed,
                ),
            };
            let key = (task, d.scale.clone(), d.seed);
            anyhow::ensure!(
                !map.contains_key(&key),
                "duplicate digest for (task={}, scale={}, seed={})",
                d.task,
                d.scale,
                d.seed,
            );
            map.insert(key, entry);
        }
        Ok(map)
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct WireDigest {
    task: String,
    scale: String,
    seed: u32,
    #[serde(default)]
    value: Option<u32>,
    #[serde(default)]
    exempt: bool,
}

/// An artifact provider for tests that pretends every artifact exists (or
/// none do).
#[cfg(test)]
pub struct AllArtifacts(pub bool);

#[cfg(test)]
impl ArtifactProvider for AllArtifacts {
    fn fetch(
        &self,
        _: &CellId,
    ) -> anyhow::Result<Option<std::sync::Arc<[u8]>>> {
        Ok(if self.0 {
            Some(std::sync::Arc::from(&b"\0asm"[..]))
        } else {
            None
        })
    }

    fn exists(&self, _: &CellId) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    const SPEC: &str = r#"
tasks = ["mandelbrot", "matmul"]
languages = ["rust", "tinygo"]

[run]
warmup-iters = 2
measure-iters = 40
iter-timeout = "500ms"
concurrency = 2

[[scale]]
name = "small"
size = 64
seed = 7

[[scale]]
name = "large"
size = 512
iters = 32
seed = 7

[toolchains]
rust = "rustc 1.78.0"
tinygo = "tinygo 0.31.2"
"#;

    const DIGESTS: &str = r#"
[[digest]]
task = "mandelbrot"
scale = "small"
seed = 7
value = 123456

[[digest]]
task = "mandelbrot"
scale = "large"
seed = 7
exempt = true

[[digest]]
task = "matmul"
scale = "small"
seed = 7
value = 99
"#;

    fn load(spec: &str, digests: &str) -> anyhow::Result<RunSpec> {
        RunSpec::from_slices(spec, digests, &AllArtifacts(true), &MemorySink::new())
    }

    #[test]
    fn basic() {
        let spec = load(SPEC, DIGESTS).unwrap();
        // 2 tasks x 2 scales x 2 languages.
        assert_eq!(spec.cells().len(), 8);
        assert_eq!(spec.global().measure_iters, 40);
        assert_eq!(spec.global().concurrency, 2);
        assert_eq!(spec.global().quality.n_min, 30);
        assert_eq!(spec.languages, [Language::Rust, Language::TinyGo]);
        assert_eq!(spec.toolchains["rust"], "rustc 1.78.0");
    }

    #[test]
    fn cell_order_is_task_major_and_deterministic() {
        let spec = load(SPEC, DIGESTS).unwrap();
        let names: Vec<String> =
            spec.cells().iter().map(|c| c.id.name()).collect();
        assert_eq!(
            names,
            vec![
                "mandelbrot/small/rust",
                "mandelbrot/small/tinygo",
                "mandelbrot/large/rust",
                "mandelbrot/large/tinygo",
                "matmul/small/rust",
                "matmul/small/tinygo",
                "matmul/large/rust",
                "matmul/large/tinygo",
            ],
        );
    }

    #[test]
    fn digests_resolve_and_exempt() {
        let spec = load(SPEC, DIGESTS).unwrap();
        let cell = |name: &str| {
            spec.cells().iter().find(|c| c.id.name() == name).unwrap()
        };
        assert_eq!(cell("mandelbrot/small/rust").reference, Some(123456));
        // Explicitly exempt.
        assert_eq!(cell("mandelbrot/large/rust").reference, None);
        // No entry at all: flagged, digest checking disabled.
        assert_eq!(cell("matmul/large/tinygo").reference, None);
    }

    #[test]
    fn missing_digest_is_flagged_through_the_sink() {
        let sink = MemorySink::new();
        RunSpec::from_slices(SPEC, DIGESTS, &AllArtifacts(true), &sink)
            .unwrap();
        // matmul/large has no digest entry, for both languages.
        assert_eq!(sink.count(crate::sink::Phase::Config), 2);
    }

    #[test]
    fn missing_artifact_rejects() {
        let err = RunSpec::from_slices(
            SPEC,
            DIGESTS,
            &AllArtifacts(false),
            &MemorySink::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing artifacts"));
    }

    #[test]
    fn rejects_bad_measure_iters() {
        let spec = SPEC.replace("measure-iters = 40", "measure-iters = 0");
        assert!(load(&spec, DIGESTS).is_err());
    }

    #[test]
    fn rejects_unknown_task() {
        let spec = SPEC.replace("\"matmul\"", "\"fibonacci\"");
        assert!(load(&spec, DIGESTS).is_err());
    }

    #[test]
    fn rejects_single_language() {
        let spec =
            SPEC.replace("languages = [\"rust\", \"tinygo\"]", "languages = [\"rust\"]");
        assert!(load(&spec, DIGESTS).is_err());
    }

    #[test]
    fn rejects_duplicate_scale() {
        let spec = SPEC.replace("name = \"large\"", "name = \"small\"");
        assert!(load(&spec, DIGESTS).is_err());
    }

    #[test]
    fn rejects_digest_with_value_and_exempt() {
        let digests = DIGESTS.replace(
            "exempt = true",
            "exempt = true\nvalue = 1",
        );
        assert!(load(SPEC, &digests).is_err());
    }

    #[test]
    fn cell_timeout_scales_with_iterations() {
        let spec = load(SPEC, DIGESTS).unwrap();
        // (2 warmup + 40 measured) iterations x 500ms x 1.5.
        assert_eq!(
            spec.global().cell_timeout(),
            Duration::from_secs_f64(42.0 * 0.5 * 1.5),
        );
    }
}
