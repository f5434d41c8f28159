/*!
The execution environment: where guest code actually runs.

The measurement context talks to an `Environment` trait so that the protocol
logic stays independent of the engine. The real implementation is wasmtime.
Every cell gets a fresh engine, store and instance; reuse across cells is
forbidden because JIT caches, allocator state and (for the garbage collected
language) heap shape would bias later cells.

The per-iteration timeout must hold even when the guest is stuck in an
infinite loop, so the wasmtime engine is built with epoch interruption
enabled and each environment owns a small watchdog thread. Before an entry
point is invoked the watchdog is armed with a deadline; if the deadline
passes it bumps the engine epoch, which makes the running guest trap with
`Trap::Interrupt`. The bump is harmless when the guest already returned,
because the store's epoch deadline is re-armed before every invocation.
*/

use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::format::spec::Cell;

/// Why an environment could not be brought up for a cell.
#[derive(Debug)]
pub enum SpawnError {
    /// The engine or store could not be constructed, or per-cell setup
    /// (parameter block placement) failed.
    Init(anyhow::Error),
    /// The module bytes did not compile, instantiate, or export the ABI
    /// entry points.
    Load(anyhow::Error),
}

/// Why a single entry point invocation failed.
#[derive(Debug)]
pub enum InvokeError {
    /// The invocation exceeded the per-iteration timeout.
    Timeout,
    /// The guest trapped for any other reason.
    Trap(String),
}

/// One isolated execution environment, owned by exactly one cell.
///
/// Environments are not `Send`: they are created, used and dropped on the
/// worker thread that runs their cell.
pub trait Environment {
    /// Re-seed the guest's mutable state by calling the `init` entry point
    /// with the cell's seed. Called before every iteration (warmup and
    /// measured) so that iterations are independent.
    fn reseed(&mut self) -> Result<(), InvokeError>;

    /// Run one iteration of the workload and return its digest. This is the
    /// only call that may appear inside a timed region.
    fn invoke(&mut self) -> Result<u32, InvokeError>;

    /// The memory accessor. The value is opaque; only within-cell
    /// differences mean anything, and only under the same accessor.
    fn memory_usage(&mut self) -> u64;

    /// Best-effort quiescence hint before a measured iteration. Engines
    /// without one do nothing.
    fn quiesce(&mut self);
}

/// Creates environments. Safe for concurrent calls from multiple workers.
pub trait EnvironmentProvider: Send + Sync {
    fn spawn(
        &self,
        cell: &Cell,
        wasm: &[u8],
        iter_timeout: Duration,
    ) -> Result<Box<dyn Environment>, SpawnError>;
}

/// The wasmtime-backed provider.
#[derive(Debug, Default)]
pub struct WasmtimeProvider;

impl WasmtimeProvider {
    pub fn new() -> WasmtimeProvider {
        WasmtimeProvider
    }
}

impl EnvironmentProvider for WasmtimeProvider {
    fn spawn(
        &self,
        cell: &Cell,
        wasm: &[u8],
        iter_timeout: Duration,
    ) -> Result<Box<dyn Environment>, SpawnError> {
        let env = WasmtimeEnv::new(cell, wasm, iter_timeout)?;
        Ok(Box::new(env))
    }
}

struct WasmtimeEnv {
    store: wasmtime::Store<()>,
    init: wasmtime::TypedFunc<u32, ()>,
    run_task: wasmtime::TypedFunc<u32, u32>,
    memory: wasmtime::Memory,
    params: abi::ParamsBlock,
    params_ptr: u32,
    iter_timeout: Duration,
    watchdog: Watchdog,
}

impl WasmtimeEnv {
    fn new(
        cell: &Cell,
        wasm: &[u8],
        iter_timeout: Duration,
    ) -> Result<WasmtimeEnv, SpawnError> {
        let mut config = wasmtime::Config::new();
        config.epoch_interruption(true);
        let engine =
            wasmtime::Engine::new(&config).map_err(SpawnError::Init)?;
        let module = wasmtime::Module::new(&engine, wasm)
            .map_err(SpawnError::Load)?;
        let mut store = wasmtime::Store::new(&engine, ());
        // The epoch only advances when the watchdog fires, so one tick of
        // headroom is all any invocation ever gets.
        store.set_epoch_deadline(1);
        let linker = wasmtime::Linker::new(&engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(SpawnError::Load)?;
        let memory = instance
            .get_memory(&mut store, abi::MEMORY)
            .ok_or_else(|| {
                SpawnError::Load(anyhow::anyhow!(
                    "module does not export linear memory '{}'",
                    abi::MEMORY,
                ))
            })?;
        let init = instance
            .get_typed_func::<u32, ()>(&mut store, abi::INIT)
            .map_err(SpawnError::Load)?;
        let alloc = instance
            .get_typed_func::<u32, u32>(&mut store, abi::ALLOC)
            .map_err(SpawnError::Load)?;
        let run_task = instance
            .get_typed_func::<u32, u32>(&mut store, abi::RUN_TASK)
            .map_err(SpawnError::Load)?;

        // Place the parameter block into guest memory once. Iterations
        // re-read it from the same offset.
        let params = cell.params;
        let params_ptr = alloc
            .call(&mut store, abi::ParamsBlock::LEN as u32)
            .map_err(|err| SpawnError::Init(anyhow::anyhow!("{:#}", err)))?;
        memory
            .write(&mut store, params_ptr as usize, &params.to_bytes())
            .map_err(|err| {
                SpawnError::Init(anyhow::anyhow!(
                    "failed to write parameter block at guest offset {}: {}",
                    params_ptr,
                    err,
                ))
            })?;

        let watchdog = Watchdog::spawn(engine);
        Ok(WasmtimeEnv {
            store,
            init,
            run_task,
            memory,
            params,
            params_ptr,
            iter_timeout,
            watchdog,
        })
    }

    /// Run a guest call under the iteration timeout.
    fn guarded_call<T>(
        &mut self,
        call: impl FnOnce(
            &mut wasmtime::Store<()>,
        ) -> Result<T, wasmtime::Error>,
    ) -> Result<T, InvokeError> {
        self.store.set_epoch_deadline(1);
        self.watchdog.arm(Instant::now() + self.iter_timeout);
        let result = call(&mut self.store);
        self.watchdog.disarm();
        result.map_err(|err| {
            let interrupted = err
                .downcast_ref::<wasmtime::Trap>()
                .map_or(false, |trap| *trap == wasmtime::Trap::Interrupt);
            if interrupted {
                InvokeError::Timeout
            } else {
                InvokeError::Trap(format!("{:#}", err))
            }
        })
    }
}

impl Environment for WasmtimeEnv {
    fn reseed(&mut self) -> Result<(), InvokeError> {
        let (init, seed, ptr, params) =
            (self.init.clone(), self.params.seed, self.params_ptr, self.params);
        self.guarded_call(|store| init.call(store, seed))?;
        // Re-assert the parameter block in case the guest scribbled on it.
        let memory = self.memory;
        memory
            .write(&mut self.store, ptr as usize, &params.to_bytes())
            .map_err(|err| InvokeError::Trap(err.to_string()))?;
        Ok(())
    }

    fn invoke(&mut self) -> Result<u32, InvokeError> {
        let (run_task, ptr) = (self.run_task.clone(), self.params_ptr);
        self.guarded_call(|store| run_task.call(store, ptr))
    }

    fn memory_usage(&mut self) -> u64 {
        // Linear memory never shrinks, so this is a high-water mark.
        self.memory.data_size(&self.store) as u64
    }

    fn quiesce(&mut self) {
        // wasmtime exposes no collector hint for a guest-managed heap, and
        // the guest's own collector (if any) is not addressable through the
        // ABI. Nothing to do.
    }
}

enum WatchMsg {
    Arm(Instant),
    Disarm,
}

/// The timeout watchdog for one environment.
///
/// A dedicated thread sleeps until the armed deadline and bumps the engine
/// epoch when it passes. Correctness of the arm/disarm protocol rests on
/// two things: the caller enqueues `Disarm` before it re-arms the store's
/// epoch deadline, and the watchdog drains its queue after waking but
/// before bumping. Together these ensure a bump can never land on a later
/// invocation than the one it was armed for.
struct Watchdog {
    tx: Option<Sender<WatchMsg>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Watchdog {
    fn spawn(engine: wasmtime::Engine) -> Watchdog {
        let (tx, rx) = crossbeam_channel::unbounded::<WatchMsg>();
        let handle = std::thread::spawn(move || {
            let mut deadline: Option<Instant> = None;
            loop {
                let msg = match deadline {
                    None => match rx.recv() {
                        Ok(msg) => Some(msg),
                        Err(_) => break,
                    },
                    Some(when) => match rx.recv_deadline(when) {
                        Ok(msg) => Some(msg),
                        Err(RecvTimeoutError::Timeout) => {
                            // Deadline passed. Drain anything enqueued
                            // before deciding the guest is actually stuck.
                            let mut armed = true;
                            while let Ok(msg) = rx.try_recv() {
                                match msg {
                                    WatchMsg::Arm(when) => {
                                        deadline = Some(when);
                                        armed = true;
                                    }
                                    WatchMsg::Disarm => {
                                        deadline = None;
                                        armed = false;
                                    }
                                }
                            }
                            if armed
                                && deadline
                                    .map_or(true, |d| Instant::now() >= d)
                            {
                                engine.increment_epoch();
                                deadline = None;
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    },
                };
                match msg {
                    Some(WatchMsg::Arm(when)) => deadline = Some(when),
                    Some(WatchMsg::Disarm) => deadline = None,
                    None => break,
                }
            }
        });
        Watchdog { tx: Some(tx), handle: Some(handle) }
    }

    fn arm(&self, deadline: Instant) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(WatchMsg::Arm(deadline));
        }
    }

    fn disarm(&self) {
        if let Some(ref tx) = self.tx {
            let _ = tx.send(WatchMsg::Disarm);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel, which ends the
        // thread at its next wakeup.
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A scriptable environment for tests. Behaviors are attached per cell by
/// the mock provider, which also tracks how many environments are alive so
/// tests can assert the concurrency bound.
#[cfg(test)]
pub mod mock {
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use super::*;
    use crate::format::spec::CellId;

    /// What a mock environment should do for one cell.
    #[derive(Clone, Debug)]
    pub struct Behavior {
        /// How long every invocation takes.
        pub delay: Duration,
        /// The digest every invocation returns.
        pub digest: u32,
        /// Trap on every invocation.
        pub always_trap: bool,
        /// Pretend the invocation at this zero-based index (warmup
        /// invocations included) exceeded the timeout.
        pub timeout_at: Option<u32>,
        /// Fail environment creation outright.
        pub refuse_spawn: bool,
    }

    impl Default for Behavior {
        fn default() -> Behavior {
            Behavior {
                delay: Duration::ZERO,
                digest: 0,
                always_trap: false,
                timeout_at: None,
                refuse_spawn: false,
            }
        }
    }

    #[derive(Default)]
    pub struct MockProvider {
        behaviors: Mutex<BTreeMap<String, Behavior>>,
        fallback: Behavior,
        alive: Arc<AtomicUsize>,
        max_alive: Arc<AtomicUsize>,
        pub spawned: Arc<AtomicUsize>,
    }

    impl MockProvider {
        pub fn new(fallback: Behavior) -> MockProvider {
            MockProvider { fallback, ..MockProvider::default() }
        }

        pub fn set(&self, cell: &CellId, behavior: Behavior) {
            self.behaviors
                .lock()
                .unwrap()
                .insert(cell.name(), behavior);
        }

        /// The largest number of environments that were ever alive at once.
        pub fn max_alive(&self) -> usize {
            self.max_alive.load(Ordering::SeqCst)
        }
    }

    impl EnvironmentProvider for MockProvider {
        fn spawn(
            &self,
            cell: &Cell,
            _wasm: &[u8],
            _iter_timeout: Duration,
        ) -> Result<Box<dyn Environment>, SpawnError> {
            let behavior = self
                .behaviors
                .lock()
                .unwrap()
                .get(&cell.id.name())
                .cloned()
                .unwrap_or_else(|| self.fallback.clone());
            if behavior.refuse_spawn {
                return Err(SpawnError::Init(anyhow::anyhow!(
                    "mock refused to spawn",
                )));
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_alive.fetch_max(alive, Ordering::SeqCst);
            Ok(Box::new(MockEnv {
                behavior,
                invocations: 0,
                memory: 65536,
                alive: Arc::clone(&self.alive),
            }))
        }
    }

    struct MockEnv {
        behavior: Behavior,
        invocations: u32,
        memory: u64,
        alive: Arc<AtomicUsize>,
    }

    impl Environment for MockEnv {
        fn reseed(&mut self) -> Result<(), InvokeError> {
            Ok(())
        }

        fn invoke(&mut self) -> Result<u32, InvokeError> {
            let iter = self.invocations;
            self.invocations += 1;
            if !self.behavior.delay.is_zero() {
                std::thread::sleep(self.behavior.delay);
            }
            if self.behavior.always_trap {
                return Err(InvokeError::Trap(
                    "mock trap: unreachable executed".to_string(),
                ));
            }
            if self.behavior.timeout_at.map_or(false, |at| iter >= at) {
                return Err(InvokeError::Timeout);
            }
            self.memory += 1024;
            Ok(self.behavior.digest)
        }

        fn memory_usage(&mut self) -> u64 {
            self.memory
        }

        fn quiesce(&mut self) {}
    }

    impl Drop for MockEnv {
        fn drop(&mut self) {
            self.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
