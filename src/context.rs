/*!
The measurement context: the protocol that turns one cell into one sample
batch.

The sequence for a cell is: fetch the artifact, bring up a fresh execution
environment, run the warmup iterations (digest-verified, no samples), then
run the measured iterations. Each measured iteration is: re-seed guest
state, quiescence hint, read memory, start the monotonic timer, invoke,
stop the timer, read memory again, verify the digest, emit a sample.

The timed region contains exactly the invocation. Setup, re-seeding, digest
verification and memory reads all happen outside it, and nothing in the
loop logs or does I/O between the timer start and stop.

Cancellation is honored between iterations only; the iteration in flight
finishes (or hits its own timeout) first.
*/

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::{
    artifact::ArtifactProvider,
    format::{
        records::{ErrorKind, Sample, SampleBatch, TerminalStatus},
        spec::{Cell, GlobalParams},
    },
    wasm::{Environment, EnvironmentProvider, InvokeError, SpawnError},
};

/// A cooperative cancellation flag, shared between the orchestrator and the
/// contexts it dispatches.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs cells. The struct itself is a stateless facade over the two
/// providers; the per-cell isolation lives in the environment each `run`
/// call creates and drops.
pub struct MeasurementContext<'a> {
    artifacts: &'a dyn ArtifactProvider,
    envs: &'a dyn EnvironmentProvider,
}

impl<'a> MeasurementContext<'a> {
    pub fn new(
        artifacts: &'a dyn ArtifactProvider,
        envs: &'a dyn EnvironmentProvider,
    ) -> MeasurementContext<'a> {
        MeasurementContext { artifacts, envs }
    }

    /// Execute one cell to completion (or failure, or cancellation) and
    /// return its batch. This never panics on guest misbehavior; every
    /// failure mode is folded into the batch's terminal status.
    pub fn run(
        &self,
        cell: &Cell,
        global: &GlobalParams,
        cancel: &CancelToken,
    ) -> SampleBatch {
        let image = match self.artifacts.fetch(&cell.id) {
            Ok(Some(image)) => image,
            Ok(None) => {
                return SampleBatch::failed(
                    cell.id.clone(),
                    TerminalStatus::ArtifactLoadFailed,
                    format!("no artifact named '{}'", cell.id.artifact_stem()),
                );
            }
            Err(err) => {
                return SampleBatch::failed(
                    cell.id.clone(),
                    TerminalStatus::ArtifactLoadFailed,
                    format!("{:#}", err),
                );
            }
        };
        let mut env =
            match self.envs.spawn(cell, &image, global.iter_timeout) {
                Ok(env) => env,
                Err(SpawnError::Init(err)) => {
                    return SampleBatch::failed(
                        cell.id.clone(),
                        TerminalStatus::EnvironmentInitFailed,
                        format!("{:#}", err),
                    );
                }
                Err(SpawnError::Load(err)) => {
                    return SampleBatch::failed(
                        cell.id.clone(),
                        TerminalStatus::ArtifactLoadFailed,
                        format!("{:#}", err),
                    );
                }
            };

        // Warmup: execute and verify, record nothing.
        for i in 0..global.warmup_iters {
            if cancel.is_cancelled() {
                return SampleBatch::failed(
                    cell.id.clone(),
                    TerminalStatus::Cancelled,
                    format!("cancelled before warmup iteration {}", i),
                );
            }
            match self.one_iteration(&mut *env, cell) {
                Ok(_) => {}
                Err(failure) => {
                    return SampleBatch::failed(
                        cell.id.clone(),
                        failure.status,
                        format!("warmup iteration {}: {}", i, failure.detail),
                    );
                }
            }
        }

        // Measured iterations.
        let mut samples: Vec<Sample> = vec![];
        let mut trapped: u32 = 0;
        let trap_budget = (global.iter_failure_rate
            * f64::from(global.measure_iters))
        .floor() as u32;
        for i in 0..global.measure_iters {
            if cancel.is_cancelled() {
                return SampleBatch {
                    cell: cell.id.clone(),
                    status: TerminalStatus::Cancelled,
                    error: Some(format!(
                        "cancelled before iteration {}",
                        i
                    )),
                    samples,
                };
            }
            if let Err(err) = env.reseed() {
                let (status, detail) = match err {
                    InvokeError::Timeout => (
                        TerminalStatus::IterationTimeout,
                        format!("re-seed before iteration {} timed out", i),
                    ),
                    InvokeError::Trap(msg) => (
                        TerminalStatus::EnvironmentInitFailed,
                        format!("re-seed before iteration {}: {}", i, msg),
                    ),
                };
                return SampleBatch {
                    cell: cell.id.clone(),
                    status,
                    error: Some(detail),
                    samples,
                };
            }
            env.quiesce();
            let memory_before = env.memory_usage();
            let start = Instant::now();
            let result = env.invoke();
            let elapsed = start.elapsed();
            let memory_after = env.memory_usage();
            let elapsed_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
            match result {
                Ok(digest) => {
                    if let Some(want) = cell.reference {
                        if digest != want {
                            samples.push(Sample {
                                iter: i,
                                elapsed_ns,
                                memory_before,
                                memory_after,
                                digest,
                                ok: false,
                                error: Some(ErrorKind::ResultMismatch),
                            });
                            return SampleBatch {
                                cell: cell.id.clone(),
                                status: TerminalStatus::ResultMismatch,
                                error: Some(format!(
                                    "iteration {} produced digest {:#010x}, \
                                     expected {:#010x}",
                                    i, digest, want,
                                )),
                                samples,
                            };
                        }
                    }
                    samples.push(Sample {
                        iter: i,
                        elapsed_ns,
                        memory_before,
                        memory_after,
                        digest,
                        ok: true,
                        error: None,
                    });
                }
                Err(InvokeError::Timeout) => {
                    return SampleBatch {
                        cell: cell.id.clone(),
                        status: TerminalStatus::IterationTimeout,
                        error: Some(format!(
                            "iteration {} exceeded {:?}",
                            i, global.iter_timeout,
                        )),
                        samples,
                    };
                }
                Err(InvokeError::Trap(msg)) => {
                    samples.push(Sample {
                        iter: i,
                        elapsed_ns,
                        memory_before,
                        memory_after,
                        digest: 0,
                        ok: false,
                        error: Some(ErrorKind::RuntimeTrap),
                    });
                    trapped += 1;
                    if trapped > trap_budget {
                        return SampleBatch {
                            cell: cell.id.clone(),
                            status: TerminalStatus::RuntimeTrap,
                            error: Some(format!(
                                "{} of {} iterations trapped \
                                 (budget {}); last: {}",
                                trapped, global.measure_iters, trap_budget,
                                msg,
                            )),
                            samples,
                        };
                    }
                    log::debug!(
                        "{}: iteration {} trapped: {}",
                        cell.id,
                        i,
                        msg,
                    );
                }
            }
        }
        SampleBatch {
            cell: cell.id.clone(),
            status: TerminalStatus::Ok,
            error: None,
            samples,
        }
    }

    /// One unmeasured, digest-verified execution. Used for warmup and for
    /// the measure command's --verify mode.
    fn one_iteration(
        &self,
        env: &mut dyn Environment,
        cell: &Cell,
    ) -> Result<u32, IterationFailure> {
        if let Err(err) = env.reseed() {
            return Err(match err {
                InvokeError::Timeout => IterationFailure {
                    status: TerminalStatus::IterationTimeout,
                    detail: "re-seed timed out".to_string(),
                },
                InvokeError::Trap(msg) => IterationFailure {
                    status: TerminalStatus::EnvironmentInitFailed,
                    detail: format!("re-seed failed: {}", msg),
                },
            });
        }
        let digest = match env.invoke() {
            Ok(digest) => digest,
            Err(InvokeError::Timeout) => {
                return Err(IterationFailure {
                    status: TerminalStatus::IterationTimeout,
                    detail: "iteration timed out".to_string(),
                });
            }
            Err(InvokeError::Trap(msg)) => {
                return Err(IterationFailure {
                    status: TerminalStatus::RuntimeTrap,
                    detail: format!("guest trapped: {}", msg),
                });
            }
        };
        if let Some(want) = cell.reference {
            if digest != want {
                return Err(IterationFailure {
                    status: TerminalStatus::ResultMismatch,
                    detail: format!(
                        "digest {:#010x} != expected {:#010x}",
                        digest, want,
                    ),
                });
            }
        }
        Ok(digest)
    }

    /// Run a single verification pass for one cell: bring up an
    /// environment and check that one iteration completes with the right
    /// digest. Used by the measure command's --verify mode.
    pub fn verify(
        &self,
        cell: &Cell,
        global: &GlobalParams,
    ) -> anyhow::Result<()> {
        let image = self
            .artifacts
            .fetch(&cell.id)?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no artifact named '{}'",
                    cell.id.artifact_stem(),
                )
            })?;
        let mut env = match self.envs.spawn(cell, &image, global.iter_timeout)
        {
            Ok(env) => env,
            Err(SpawnError::Init(err)) => {
                anyhow::bail!("environment init failed: {:#}", err)
            }
            Err(SpawnError::Load(err)) => {
                anyhow::bail!("artifact load failed: {:#}", err)
            }
        };
        match self.one_iteration(&mut *env, cell) {
            Ok(_) => Ok(()),
            Err(failure) => {
                anyhow::bail!("{}: {}", failure.status, failure.detail)
            }
        }
    }
}

struct IterationFailure {
    status: TerminalStatus,
    detail: String,
}
