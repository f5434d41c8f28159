/*!
The observability sink that run progress is reported through.

The orchestrator and measurement contexts emit one structured event per cell
transition (dispatched, completed, failed, cancelled) and for noteworthy
configuration findings. The transport is pluggable: the default sink routes
events into the `log` crate, and tests use an in-memory sink to assert on
the exact event stream.

Events must never be emitted from inside a timed region.
*/

#[cfg(test)]
use std::sync::Mutex;

use crate::format::spec::CellId;

/// The severity of an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// The part of the run lifecycle an event belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Run specification loading and validation.
    Config,
    /// A cell was handed to a measurement context.
    Dispatch,
    /// A cell finished with terminal status OK.
    Complete,
    /// A cell finished with a failure terminal status.
    Fail,
    /// A cell was cancelled, or the run began aborting.
    Cancel,
    /// Output files are being written.
    Persist,
}

/// A single structured progress event.
#[derive(Clone, Debug)]
pub struct Event {
    pub level: Level,
    /// The cell this event concerns, if any. Run-wide events have none.
    pub cell: Option<CellId>,
    pub phase: Phase,
    pub message: String,
}

impl Event {
    pub fn run(level: Level, phase: Phase, message: impl Into<String>) -> Event {
        Event { level, cell: None, phase, message: message.into() }
    }

    pub fn cell(
        level: Level,
        cell: &CellId,
        phase: Phase,
        message: impl Into<String>,
    ) -> Event {
        Event {
            level,
            cell: Some(cell.clone()),
            phase,
            message: message.into(),
        }
    }
}

/// A pluggable destination for progress events.
///
/// Implementations must tolerate concurrent emission from multiple threads.
/// Emission should be cheap; anything expensive belongs behind a channel in
/// the sink implementation, not in the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// The default sink. Routes events into the `log` crate, so visibility is
/// controlled with the usual RUST_LOG filter.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        let cell = match event.cell {
            Some(ref cell) => cell.to_string(),
            None => "-".to_string(),
        };
        match event.level {
            Level::Info => {
                log::info!("[{:?}] {}: {}", event.phase, cell, event.message)
            }
            Level::Warn => {
                log::warn!("[{:?}] {}: {}", event.phase, cell, event.message)
            }
            Level::Error => {
                log::error!("[{:?}] {}: {}", event.phase, cell, event.message)
            }
        }
    }
}

/// A sink that remembers every event. Only really useful for tests that
/// assert on the event stream.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    /// Returns the number of events with the given phase.
    pub fn count(&self, phase: Phase) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.phase == phase).count()
    }
}

#[cfg(test)]
impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
