/*!
The artifact provider: where compiled WASM modules come from.

Compilation itself is someone else's job. By the time this harness runs, a
directory of `{task}-{language}-{scale}.wasm` files exists, produced by the
two toolchains under comparison. The provider maps cell identities to module
byte images and is safe for concurrent reads, since several measurement
contexts fetch artifacts at once.
*/

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context;

use crate::format::spec::CellId;

/// Maps a cell identity to the byte image of its compiled WASM module.
///
/// Implementations are stateless from the caller's perspective and must be
/// safe for concurrent calls. A `None` from `fetch` means the artifact is
/// missing, which the run specification treats as fatal before execution.
pub trait ArtifactProvider: Send + Sync {
    fn fetch(&self, id: &CellId) -> anyhow::Result<Option<Arc<[u8]>>>;

    /// Cheap existence check used during run specification validation.
    fn exists(&self, id: &CellId) -> bool {
        self.fetch(id).map_or(false, |image| image.is_some())
    }
}

/// An artifact provider backed by a directory scan.
///
/// The directory is walked once at construction. Files with a `.wasm`
/// extension are keyed by their file stem; byte images are loaded lazily on
/// first fetch and cached, so that concurrent cells measuring the same
/// artifact read the file only once.
#[derive(Debug)]
pub struct DirArtifacts {
    by_stem: BTreeMap<String, PathBuf>,
    cache: Mutex<BTreeMap<String, Arc<[u8]>>>,
}

impl DirArtifacts {
    pub fn scan<P: AsRef<Path>>(dir: P) -> anyhow::Result<DirArtifacts> {
        let dir = dir.as_ref();
        let mut by_stem = BTreeMap::new();
        for result in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let dent = result?;
            if !dent.file_type().is_file() {
                continue;
            }
            if dent.path().extension().map_or(true, |ext| ext != "wasm") {
                continue;
            }
            let stem = match dent.path().file_stem().and_then(|s| s.to_str())
            {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            if let Some(old) = by_stem.insert(stem.clone(), dent.into_path())
            {
                anyhow::bail!(
                    "duplicate artifact name '{}' (also at {})",
                    stem,
                    old.display(),
                );
            }
        }
        log::debug!(
            "scanned {} for artifacts, found {}",
            dir.display(),
            by_stem.len(),
        );
        Ok(DirArtifacts { by_stem, cache: Mutex::new(BTreeMap::new()) })
    }
}

impl ArtifactProvider for DirArtifacts {
    fn fetch(&self, id: &CellId) -> anyhow::Result<Option<Arc<[u8]>>> {
        let stem = id.artifact_stem();
        let path = match self.by_stem.get(&stem) {
            Some(path) => path,
            None => return Ok(None),
        };
        let mut cache = self.cache.lock().unwrap();
        if let Some(image) = cache.get(&stem) {
            return Ok(Some(Arc::clone(image)));
        }
        let bytes = std::fs::read(path).with_context(|| {
            format!("failed to read artifact {}", path.display())
        })?;
        let image: Arc<[u8]> = Arc::from(bytes);
        cache.insert(stem, Arc::clone(&image));
        Ok(Some(image))
    }

    fn exists(&self, id: &CellId) -> bool {
        self.by_stem.contains_key(&id.artifact_stem())
    }
}
