/*!
The orchestrator: drives every cell of a run to a terminal status under a
concurrency bound.

The shape is a bounded worker pool. Workers block on a rendezvous channel;
the supervising thread offers cells in run specification order, so dispatch
order is deterministic while completion order is whatever it is. Because
the dispatch channel has no capacity, a cell is only handed out when a
worker is actually free, which is also what keeps the number of live
measurement environments at or below the bound.

The supervisor never busy-waits: it sleeps until either a completion
arrives, a worker becomes free to accept the next cell, or the nearest
deadline (per-cell budget, cancellation grace, global run timeout) passes.

Failure policy: once at least `failure_min_cells` cells have settled, the
run aborts if the fraction of failed cells exceeds the configured
threshold. Aborting stops dispatch and cancels in-flight cells; they settle
at their next iteration boundary. A cell that blows through its budget is
cancelled, and if it still does not settle within the grace period its
worker is written off: the supervisor records a CELL_TIMEOUT batch itself,
drops any late result, and never dispatches to that worker again (the
rendezvous channel makes that automatic, since a wedged worker never asks
for work).
*/

use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{
    bounded, select, unbounded, Receiver, RecvTimeoutError, Sender,
};

use crate::{
    artifact::ArtifactProvider,
    context::{CancelToken, MeasurementContext},
    format::{
        records::{SampleBatch, TerminalStatus},
        spec::{Cell, CellId, GlobalParams, RunSpec},
    },
    sink::{Event, EventSink, Level, Phase},
    store::RecordStore,
    wasm::EnvironmentProvider,
};

/// How long to sleep when no deadline is pending. Purely a liveness
/// backstop; every interesting wakeup comes from a channel operation or a
/// computed deadline.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// What happened to the run as a whole.
#[derive(Clone, Debug, Default)]
pub struct RunOutcome {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Cells never dispatched because the run aborted first.
    pub skipped: usize,
    /// Cells whose worker was written off by the grace period backstop.
    pub force_closed: usize,
    pub aborted_by_failure_rate: bool,
    pub aborted_by_run_timeout: bool,
}

struct Work {
    cell: Cell,
    cancel: CancelToken,
}

struct Done {
    batch: SampleBatch,
}

struct Inflight {
    cell: CellId,
    cancel: CancelToken,
    deadline: Instant,
    cancelled_at: Option<Instant>,
    timed_out: bool,
}

pub struct Orchestrator {
    spec: Arc<RunSpec>,
    artifacts: Arc<dyn ArtifactProvider>,
    envs: Arc<dyn EnvironmentProvider>,
    store: Arc<RecordStore>,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(
        spec: Arc<RunSpec>,
        artifacts: Arc<dyn ArtifactProvider>,
        envs: Arc<dyn EnvironmentProvider>,
        store: Arc<RecordStore>,
        sink: Arc<dyn EventSink>,
    ) -> Orchestrator {
        Orchestrator { spec, artifacts, envs, store, sink }
    }

    /// Execute every cell of the run specification and return the overall
    /// outcome. Batches land in the record store in completion order.
    pub fn run(&self) -> RunOutcome {
        let global = self.spec.global().clone();
        let cells: Vec<Cell> = self.spec.cells().to_vec();
        if cells.is_empty() {
            return RunOutcome::default();
        }
        let workers = global.concurrency.min(cells.len());
        let (work_tx, work_rx) = bounded::<Work>(0);
        let (done_tx, done_rx) = unbounded::<Done>();

        let mut handles = vec![];
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let artifacts = Arc::clone(&self.artifacts);
            let envs = Arc::clone(&self.envs);
            let global = global.clone();
            handles.push(std::thread::spawn(move || {
                let ctx = MeasurementContext::new(&*artifacts, &*envs);
                while let Ok(work) = work_rx.recv() {
                    let batch = ctx.run(&work.cell, &global, &work.cancel);
                    if done_tx.send(Done { batch }).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(work_rx);
        drop(done_tx);

        let outcome = self.supervise(cells, &global, work_tx, done_rx);

        if outcome.force_closed == 0 {
            for handle in handles {
                let _ = handle.join();
            }
        }
        // Otherwise at least one worker is wedged inside a cell and will
        // never see the disconnected channel; it is left to die with the
        // process rather than hang the run.
        outcome
    }

    fn supervise(
        &self,
        cells: Vec<Cell>,
        global: &GlobalParams,
        work_tx: Sender<Work>,
        done_rx: Receiver<Done>,
    ) -> RunOutcome {
        let total = cells.len();
        let mut sv = Supervision {
            global,
            store: &*self.store,
            sink: &*self.sink,
            inflight: vec![],
            force_closed: BTreeSet::new(),
            settled: 0,
            policy_failures: 0,
            aborting: false,
            run_deadline: global.run_timeout.map(|t| Instant::now() + t),
            cell_budget: global.cell_timeout(),
            grace: global.grace(),
            outcome: RunOutcome::default(),
        };
        let mut pending = cells.into_iter();
        let mut next = pending.next();

        loop {
            if sv.inflight.is_empty() && (sv.aborting || next.is_none()) {
                break;
            }
            let timeout = sv.next_wake();
            let candidate = if sv.aborting { None } else { next.clone() };
            match candidate {
                Some(cell) => {
                    let cancel = CancelToken::new();
                    let work =
                        Work { cell: cell.clone(), cancel: cancel.clone() };
                    select! {
                        send(work_tx, work) -> res => {
                            if res.is_err() {
                                // Every worker is gone. Nothing more can
                                // settle, so stop supervising.
                                break;
                            }
                            sv.dispatched(&cell.id, cancel);
                            next = pending.next();
                        }
                        recv(done_rx) -> msg => match msg {
                            Ok(done) => sv.handle_done(done.batch),
                            Err(_) => break,
                        },
                        default(timeout) => {}
                    }
                }
                None => match done_rx.recv_timeout(timeout) {
                    Ok(done) => sv.handle_done(done.batch),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                },
            }
            sv.enforce_deadlines();
        }

        let mut outcome = sv.outcome;
        outcome.skipped = total - outcome.dispatched;
        outcome
    }
}

/// The supervisor's mutable state, separated out so the bookkeeping reads
/// as a handful of small transitions instead of one giant loop body.
struct Supervision<'a> {
    global: &'a GlobalParams,
    store: &'a RecordStore,
    sink: &'a dyn EventSink,
    inflight: Vec<Inflight>,
    force_closed: BTreeSet<String>,
    settled: usize,
    /// Failures that count toward the failure-rate policy. Cancellations do
    /// not: they are consequences of an abort, not causes for one.
    policy_failures: usize,
    aborting: bool,
    run_deadline: Option<Instant>,
    cell_budget: Duration,
    grace: Duration,
    outcome: RunOutcome,
}

impl<'a> Supervision<'a> {
    fn dispatched(&mut self, cell: &CellId, cancel: CancelToken) {
        self.inflight.push(Inflight {
            cell: cell.clone(),
            cancel,
            deadline: Instant::now() + self.cell_budget,
            cancelled_at: None,
            timed_out: false,
        });
        self.outcome.dispatched += 1;
        self.sink.emit(Event::cell(
            Level::Info,
            cell,
            Phase::Dispatch,
            "dispatched",
        ));
    }

    fn handle_done(&mut self, batch: SampleBatch) {
        let name = batch.cell.name();
        if self.force_closed.contains(&name) {
            // The supervisor already recorded a terminal status for this
            // cell; the straggler's late result is dropped so the store
            // sees exactly one batch per cell.
            log::debug!("dropping late batch for force-closed cell {}", name);
            return;
        }
        self.inflight.retain(|inf| inf.cell.name() != name);
        self.settled += 1;
        match batch.status {
            TerminalStatus::Ok => {
                self.outcome.completed += 1;
                self.sink.emit(Event::cell(
                    Level::Info,
                    &batch.cell,
                    Phase::Complete,
                    format!("completed with {} samples", batch.samples.len()),
                ));
            }
            TerminalStatus::Cancelled => {
                self.outcome.cancelled += 1;
                self.sink.emit(Event::cell(
                    Level::Warn,
                    &batch.cell,
                    Phase::Cancel,
                    format!(
                        "cancelled with {} samples retained",
                        batch.samples.len(),
                    ),
                ));
            }
            status => {
                self.outcome.failed += 1;
                self.policy_failures += 1;
                self.sink.emit(Event::cell(
                    Level::Error,
                    &batch.cell,
                    Phase::Fail,
                    format!(
                        "{}: {}",
                        status,
                        batch.error.as_deref().unwrap_or("no detail"),
                    ),
                ));
            }
        }
        self.store.append_batch(batch);

        if !self.aborting && self.settled >= self.global.failure_min_cells {
            let rate = self.policy_failures as f64 / self.settled as f64;
            if rate > self.global.failure_rate_threshold {
                self.outcome.aborted_by_failure_rate = true;
                self.abort(format!(
                    "failure rate {:.2} exceeds threshold {:.2} \
                     after {} cells",
                    rate, self.global.failure_rate_threshold, self.settled,
                ));
            }
        }
    }

    fn abort(&mut self, reason: String) {
        self.aborting = true;
        self.sink.emit(Event::run(Level::Error, Phase::Cancel, reason));
        let now = Instant::now();
        for inf in self.inflight.iter_mut() {
            if inf.cancelled_at.is_none() {
                inf.cancel.cancel();
                inf.cancelled_at = Some(now);
            }
        }
    }

    fn enforce_deadlines(&mut self) {
        let now = Instant::now();
        if !self.aborting {
            if let Some(deadline) = self.run_deadline {
                if now >= deadline {
                    self.outcome.aborted_by_run_timeout = true;
                    self.abort("run timeout exceeded".to_string());
                }
            }
        }
        for inf in self.inflight.iter_mut() {
            if inf.cancelled_at.is_none() && now >= inf.deadline {
                inf.cancel.cancel();
                inf.cancelled_at = Some(now);
                inf.timed_out = true;
                self.sink.emit(Event::cell(
                    Level::Warn,
                    &inf.cell,
                    Phase::Cancel,
                    "cell budget exceeded, cancelling",
                ));
            }
        }
        // Write off anything that did not settle within the grace period.
        let grace = self.grace;
        let mut expired: Vec<(CellId, bool)> = vec![];
        self.inflight.retain(|inf| match inf.cancelled_at {
            Some(at) if now >= at + grace => {
                expired.push((inf.cell.clone(), inf.timed_out));
                false
            }
            _ => true,
        });
        for (cell, timed_out) in expired {
            // The worker is wedged, so its partial samples are
            // unreachable; the terminal status is all that can be
            // recorded.
            let status = if timed_out {
                TerminalStatus::CellTimeout
            } else {
                TerminalStatus::Cancelled
            };
            let batch = SampleBatch::failed(
                cell.clone(),
                status,
                "context did not settle within the grace period",
            );
            self.settled += 1;
            self.outcome.force_closed += 1;
            match status {
                TerminalStatus::Cancelled => self.outcome.cancelled += 1,
                _ => {
                    self.outcome.failed += 1;
                    self.policy_failures += 1;
                }
            }
            self.force_closed.insert(cell.name());
            self.sink.emit(Event::cell(
                Level::Error,
                &cell,
                Phase::Fail,
                format!("{}: worker abandoned", status),
            ));
            self.store.append_batch(batch);
        }
    }

    /// The shortest sleep that cannot miss a deadline.
    fn next_wake(&self) -> Duration {
        let now = Instant::now();
        let mut nearest: Option<Instant> = None;
        let mut consider = |when: Instant| match nearest {
            Some(cur) if cur <= when => {}
            _ => nearest = Some(when),
        };
        for inf in self.inflight.iter() {
            match inf.cancelled_at {
                None => consider(inf.deadline),
                Some(at) => consider(at + self.grace),
            }
        }
        if !self.aborting {
            if let Some(deadline) = self.run_deadline {
                consider(deadline);
            }
        }
        match nearest {
            None => IDLE_WAIT,
            Some(when) => {
                when.saturating_duration_since(now).max(Duration::from_millis(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::spec::{AllArtifacts, RunSpec},
        sink::MemorySink,
        wasm::mock::{Behavior, MockProvider},
    };

    const DIGEST: u32 = 7;

    /// Builds a spec with the given number of tasks x scales x 2 languages
    /// cells and the given overrides applied to the [run] table.
    fn spec(run_table: &str) -> RunSpec {
        let spec_data = format!(
            r#"
tasks = ["mandelbrot", "json-parse", "matmul"]
languages = ["rust", "tinygo"]

[run]
{}

[[scale]]
name = "small"
size = 8
seed = 1

[[scale]]
name = "large"
size = 64
seed = 1
"#,
            run_table,
        );
        // Every (task, scale, seed) gets the same digest the mock returns.
        let mut digest_data = String::new();
        for task in ["mandelbrot", "json-parse", "matmul"] {
            for scale in ["small", "large"] {
                digest_data.push_str(&format!(
                    "[[digest]]\ntask = \"{}\"\nscale = \"{}\"\n\
                     seed = 1\nvalue = {}\n\n",
                    task, scale, DIGEST,
                ));
            }
        }
        RunSpec::from_slices(
            &spec_data,
            &digest_data,
            &AllArtifacts(true),
            &MemorySink::new(),
        )
        .unwrap()
    }

    fn orchestrate(
        spec: RunSpec,
        envs: MockProvider,
    ) -> (RunOutcome, Arc<RecordStore>, Arc<MemorySink>, Arc<MockProvider>) {
        let store = Arc::new(RecordStore::new());
        let sink = Arc::new(MemorySink::new());
        let envs = Arc::new(envs);
        let orchestrator = Orchestrator::new(
            Arc::new(spec),
            Arc::new(AllArtifacts(true)),
            Arc::clone(&envs) as Arc<dyn EnvironmentProvider>,
            Arc::clone(&store),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        );
        let outcome = orchestrator.run();
        (outcome, store, sink, envs)
    }

    #[test]
    fn all_cells_complete_within_the_concurrency_bound() {
        let spec = spec(
            "warmup-iters = 1\nmeasure-iters = 3\n\
             iter-timeout = \"1s\"\nconcurrency = 4",
        );
        let envs = MockProvider::new(Behavior {
            digest: DIGEST,
            delay: Duration::from_millis(5),
            ..Behavior::default()
        });
        let (outcome, store, sink, envs) = orchestrate(spec, envs);
        assert_eq!(outcome.dispatched, 12);
        assert_eq!(outcome.completed, 12);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.cancelled, 0);
        assert_eq!(outcome.force_closed, 0);
        assert!(!outcome.aborted_by_failure_rate);
        assert!(!outcome.aborted_by_run_timeout);
        assert_eq!(store.len(), 12);
        // Exactly one environment per cell, never more than the bound
        // alive at once.
        assert!(envs.max_alive() <= 4, "alive={}", envs.max_alive());
        assert_eq!(
            envs.spawned.load(std::sync::atomic::Ordering::SeqCst),
            12,
        );
        assert_eq!(sink.count(Phase::Dispatch), 12);
        assert_eq!(sink.count(Phase::Complete), 12);
        for batch in store.snapshot() {
            assert_eq!(batch.status, TerminalStatus::Ok);
            assert_eq!(batch.samples.len(), 3);
            assert!(batch.samples.iter().all(|s| s.ok));
        }
    }

    #[test]
    fn dispatch_order_is_spec_order_when_serial() {
        let spec = spec(
            "warmup-iters = 0\nmeasure-iters = 1\n\
             iter-timeout = \"1s\"\nconcurrency = 1",
        );
        let expected: Vec<String> =
            spec.cells().iter().map(|c| c.id.name()).collect();
        let envs = MockProvider::new(Behavior {
            digest: DIGEST,
            ..Behavior::default()
        });
        let (outcome, store, _, _) = orchestrate(spec, envs);
        assert_eq!(outcome.completed, 12);
        // Serial execution also makes completion order deterministic.
        let got: Vec<String> =
            store.snapshot().iter().map(|b| b.cell.name()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn one_bad_cell_does_not_abort_the_run() {
        let spec = spec(
            "warmup-iters = 0\nmeasure-iters = 2\n\
             iter-timeout = \"1s\"\nconcurrency = 2",
        );
        let bad = spec.cells()[3].id.clone();
        let envs = MockProvider::new(Behavior {
            digest: DIGEST,
            ..Behavior::default()
        });
        envs.set(
            &bad,
            Behavior { digest: DIGEST + 1, ..Behavior::default() },
        );
        let (outcome, store, _, _) = orchestrate(spec, envs);
        assert_eq!(outcome.dispatched, 12);
        assert_eq!(outcome.completed, 11);
        assert_eq!(outcome.failed, 1);
        assert!(!outcome.aborted_by_failure_rate);
        let statuses: Vec<TerminalStatus> = store
            .snapshot()
            .iter()
            .filter(|b| b.cell == bad)
            .map(|b| b.status)
            .collect();
        assert_eq!(statuses, vec![TerminalStatus::ResultMismatch]);
    }

    #[test]
    fn failure_rate_threshold_aborts_the_run() {
        let spec = spec(
            "warmup-iters = 0\nmeasure-iters = 2\n\
             iter-timeout = \"1s\"\nconcurrency = 1\n\
             failure-min-cells = 2\nfailure-rate-threshold = 0.3\n\
             iter-failure-rate = 0.4",
        );
        // Every iteration traps, so every settled cell fails.
        let envs = MockProvider::new(Behavior {
            always_trap: true,
            ..Behavior::default()
        });
        let (outcome, store, _, _) = orchestrate(spec, envs);
        assert!(outcome.aborted_by_failure_rate);
        // Serial run: the abort lands right after the second failure.
        assert_eq!(store.len(), 2);
        assert_eq!(outcome.skipped, 10);
        assert!(store
            .snapshot()
            .iter()
            .all(|b| b.status == TerminalStatus::RuntimeTrap));
    }

    #[test]
    fn run_timeout_cancels_in_flight_cells_and_keeps_partial_batches() {
        let spec = spec(
            "warmup-iters = 0\nmeasure-iters = 1000\n\
             iter-timeout = \"1s\"\nconcurrency = 1\n\
             run-timeout = \"100ms\"",
        );
        let envs = MockProvider::new(Behavior {
            digest: DIGEST,
            delay: Duration::from_millis(5),
            ..Behavior::default()
        });
        let (outcome, store, _, _) = orchestrate(spec, envs);
        assert!(outcome.aborted_by_run_timeout);
        assert_eq!(outcome.cancelled, 1);
        assert!(outcome.skipped >= 10);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, TerminalStatus::Cancelled);
        // The iterations measured before the abort are retained.
        assert!(!snapshot[0].samples.is_empty());
    }

    #[test]
    fn wedged_context_is_written_off_after_the_grace_period() {
        // One cell, and the mock ignores cancellation and sleeps far past
        // the cell budget: iter-timeout 20ms, one iteration, factor 1.0
        // gives a 20ms budget, with a 250ms grace floor.
        let spec_data = r#"
tasks = ["mandelbrot"]
languages = ["rust", "tinygo"]

[run]
warmup-iters = 0
measure-iters = 1
iter-timeout = "20ms"
concurrency = 2
cell-timeout-factor = 1.0
failure-min-cells = 100

[[scale]]
name = "small"
size = 8
seed = 1
"#;
        let digests = r#"
[[digest]]
task = "mandelbrot"
scale = "small"
seed = 1
value = 7
"#;
        let spec = RunSpec::from_slices(
            spec_data,
            digests,
            &AllArtifacts(true),
            &MemorySink::new(),
        )
        .unwrap();
        let envs = MockProvider::new(Behavior {
            digest: DIGEST,
            delay: Duration::from_secs(30),
            ..Behavior::default()
        });
        let start = Instant::now();
        let (outcome, store, _, _) = orchestrate(spec, envs);
        // The run returns promptly instead of waiting out the wedge.
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.force_closed, 2);
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot
            .iter()
            .all(|b| b.status == TerminalStatus::CellTimeout));
    }
}
