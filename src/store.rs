/*!
The sample record store: the append-only record of everything a run
measured.

The store is the one shared mutable resource in the whole system. Multiple
measurement contexts complete concurrently and their batches are appended
under a single mutex, which both serializes appends and gives batches a
total order by completion time. Nothing is ever deleted or reordered; the
quality filter works from an immutable snapshot, and `persist` writes the
snapshot out as the raw.json interchange document.
*/

use std::sync::Mutex;

use crate::format::records::{RawReport, SampleBatch};

#[derive(Debug, Default)]
pub struct RecordStore {
    batches: Mutex<Vec<SampleBatch>>,
}

impl RecordStore {
    pub fn new() -> RecordStore {
        RecordStore::default()
    }

    /// Append one completed batch. Atomic with respect to `snapshot`.
    pub fn append_batch(&self, batch: SampleBatch) {
        self.batches.lock().unwrap().push(batch);
    }

    /// An immutable view of every batch whose append completed before this
    /// call, in completion order.
    pub fn snapshot(&self) -> Vec<SampleBatch> {
        self.batches.lock().unwrap().clone()
    }

    /// The number of batches appended so far.
    pub fn len(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Emit the snapshot as the raw.json document.
    pub fn persist<W: std::io::Write>(
        &self,
        languages: [crate::format::spec::Language; 2],
        wtr: W,
    ) -> anyhow::Result<()> {
        let report = RawReport { languages, cells: self.snapshot() };
        serde_json::to_writer_pretty(wtr, &report)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{
        records::{Sample, TerminalStatus},
        spec::{CellId, Language, Task},
    };

    fn batch(scale: &str, n: usize) -> SampleBatch {
        let samples = (0..n)
            .map(|i| Sample {
                iter: i as u32,
                elapsed_ns: 1000 + i as u64,
                memory_before: 0,
                memory_after: 0,
                digest: 42,
                ok: true,
                error: None,
            })
            .collect();
        SampleBatch {
            cell: CellId {
                task: Task::MatMul,
                language: Language::Rust,
                scale: scale.to_string(),
            },
            status: TerminalStatus::Ok,
            error: None,
            samples,
        }
    }

    #[test]
    fn appends_preserve_order_and_content() {
        let store = RecordStore::new();
        store.append_batch(batch("small", 3));
        store.append_batch(batch("large", 2));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].cell.scale, "small");
        assert_eq!(snapshot[1].cell.scale, "large");
        assert_eq!(snapshot[0].samples.len(), 3);
        // Sample order within a batch is untouched.
        let iters: Vec<u32> =
            snapshot[0].samples.iter().map(|s| s.iter).collect();
        assert_eq!(iters, vec![0, 1, 2]);
    }

    #[test]
    fn snapshot_is_isolated_from_later_appends() {
        let store = RecordStore::new();
        store.append_batch(batch("small", 1));
        let snapshot = store.snapshot();
        store.append_batch(batch("large", 1));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn concurrent_appends_all_land() {
        let store = std::sync::Arc::new(RecordStore::new());
        let mut handles = vec![];
        for t in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    store.append_batch(batch(&format!("{}-{}", t, i), 1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 8 * 50);
    }

    #[test]
    fn persist_round_trips() {
        let store = RecordStore::new();
        store.append_batch(batch("small", 2));
        let mut buf = vec![];
        store
            .persist([Language::Rust, Language::TinyGo], &mut buf)
            .unwrap();
        let report =
            crate::format::records::RawReport::from_reader(&buf[..]).unwrap();
        assert_eq!(report.cells, store.snapshot());
        assert_eq!(report.languages, [Language::Rust, Language::TinyGo]);
    }

    #[test]
    fn round_trip_preserves_clean_cells() {
        // The quality filter must see the same thing whether it reads the
        // in-memory snapshot or a persisted and re-read raw.json.
        let store = RecordStore::new();
        store.append_batch(batch("small", 40));
        store.append_batch(batch("large", 35));
        let mut buf = vec![];
        store
            .persist([Language::Rust, Language::TinyGo], &mut buf)
            .unwrap();
        let report =
            crate::format::records::RawReport::from_reader(&buf[..]).unwrap();
        let params = crate::format::spec::QualityParams {
            n_min: 30,
            cv_max: 0.15,
        };
        let direct = crate::quality::clean_all(&store.snapshot(), &params);
        let reread = crate::quality::clean_all(&report.cells, &params);
        assert_eq!(direct, reread);
    }
}
