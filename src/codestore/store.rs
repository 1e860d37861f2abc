//! Code Store
//!
//! Owns the current bindings, the deprecation index and the set of live generations.
//!
//! ## Locking
//! - `index` (read/write) guards the file layout: readers hold it shared while they
//!   locate and read an artifact, rebinding holds it exclusively. Garbage collection
//!   holds it exclusively only to unlink boundaries; directories are deleted after.
//! - `generations` guards only the counter and the live set. It is never held during
//!   file I/O. When both are needed the order is `index` then `generations`.

use super::error::StoreError;
use super::generation::{Generation, GenerationGuard};
use super::layout::{self, StoreLayout};
use super::types::{ArtifactDigest, ArtifactName, GenerationId, WriteOutcome};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Boundaries recorded per name, ascending.
#[derive(Debug, Default)]
pub(crate) struct DeprecationIndex {
    boundaries: HashMap<ArtifactName, Vec<GenerationId>>,
}

#[derive(Debug, Default)]
struct GenerationSet {
    next: GenerationId,
    active: BTreeSet<GenerationId>,
}

pub(crate) struct StoreInner {
    layout: StoreLayout,
    index: RwLock<DeprecationIndex>,
    generations: Mutex<GenerationSet>,
}

/// Handle to a generational artifact store. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CodeStore {
    inner: Arc<StoreInner>,
}

impl CodeStore {
    /// Opens (or initialises) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let layout = StoreLayout::open(root.as_ref())?;
        tracing::info!("Opened code store at {}", layout.root.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                layout,
                index: RwLock::new(DeprecationIndex::default()),
                generations: Mutex::new(GenerationSet::default()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.layout.root
    }

    /// Digest of the current binding.
    pub fn get_digest(&self, name: &str) -> Result<Option<ArtifactDigest>, StoreError> {
        let name = ArtifactName::parse(name)?;
        let _index = self.inner.index.read();
        layout::read_digest(&self.inner.layout.current, &name)
    }

    /// Bytes of the current binding.
    pub fn get_definition(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let name = ArtifactName::parse(name)?;
        let _index = self.inner.index.read();
        layout::read_definition(&self.inner.layout.current, &name)
    }

    /// Rebinds `name` to `bytes`.
    ///
    /// Writing the bytes that are already current is a no-op. Otherwise, if any
    /// generation is live, the previous bytes are archived under the id the next
    /// generation will receive, so every live generation keeps its view.
    pub fn set_definition(&self, name: &str, bytes: &[u8]) -> Result<WriteOutcome, StoreError> {
        let name = ArtifactName::parse(name)?;
        let digest = ArtifactDigest::compute(bytes);
        let current = &self.inner.layout.current;

        let mut index = self.inner.index.write();
        let mut outcome = WriteOutcome::Installed;

        if layout::artifact_exists(current, &name) {
            if layout::read_digest(current, &name)?.as_ref() == Some(&digest) {
                tracing::trace!("Artifact {} unchanged ({})", name, digest);
                return Ok(WriteOutcome::Unchanged);
            }

            let (boundary, any_live) = {
                let generations = self.inner.generations.lock();
                (generations.next, !generations.active.is_empty())
            };

            // A second rebinding before the next generation exists replaces bytes no
            // generation ever saw, so the first archive for this boundary is kept.
            let archive = self.inner.layout.boundary_dir(boundary);
            if any_live && !layout::artifact_exists(&archive, &name) {
                layout::move_artifact(current, &name, &archive)?;
                index
                    .boundaries
                    .entry(name.clone())
                    .or_default()
                    .push(boundary);
                outcome = WriteOutcome::Archived { boundary };
            }
        }

        layout::write_artifact(current, &name, bytes, &digest)?;
        tracing::info!("Bound artifact {} to {} ({:?})", name, digest, outcome);

        Ok(outcome)
    }

    /// Allocates the next generation and registers it as live.
    pub fn create_generation(&self) -> Generation {
        // Shared index lock: a rebinding in progress finishes before the new id exists.
        let _index = self.inner.index.read();
        let id = {
            let mut generations = self.inner.generations.lock();
            let id = generations.next;
            generations.next += 1;
            generations.active.insert(id);
            id
        };

        tracing::debug!("Created generation {}", id);
        Generation::new(id, self.inner.clone())
    }

    /// Like `create_generation`, released automatically when the guard drops.
    pub fn scoped_generation(&self) -> GenerationGuard {
        GenerationGuard::new(self.create_generation())
    }

    pub fn release_generation(&self, generation: &Generation) -> Result<(), StoreError> {
        if !generation.belongs_to(&self.inner) {
            return Err(StoreError::UnknownGeneration(generation.id()));
        }
        generation.release()
    }

    /// Ids of all live generations, ascending.
    pub fn active_generations(&self) -> Vec<GenerationId> {
        self.inner.generations.lock().active.iter().copied().collect()
    }

    /// Boundaries currently archived for `name`, ascending.
    pub fn archived_boundaries(&self, name: &str) -> Result<Vec<GenerationId>, StoreError> {
        let name = ArtifactName::parse(name)?;
        Ok(self
            .inner
            .index
            .read()
            .boundaries
            .get(&name)
            .cloned()
            .unwrap_or_default())
    }

    pub fn boundary_dir(&self, boundary: GenerationId) -> PathBuf {
        self.inner.layout.boundary_dir(boundary)
    }
}

impl StoreInner {
    /// Directory holding the bytes generation `id` must see for `name`.
    fn locate(
        &self,
        index: &DeprecationIndex,
        id: GenerationId,
        name: &ArtifactName,
    ) -> Result<PathBuf, StoreError> {
        let child = self.layout.child_dir(id);
        if layout::artifact_exists(&child, name) {
            return Ok(child);
        }

        if let Some(boundaries) = index.boundaries.get(name) {
            // Archive at boundary b holds what was current for every generation below b.
            let position = boundaries.partition_point(|boundary| *boundary <= id);
            if let Some(&boundary) = boundaries.get(position) {
                let archive = self.layout.boundary_dir(boundary);
                if !layout::artifact_exists(&archive, name) {
                    return Err(StoreError::MissingArchive {
                        name: name.to_string(),
                        boundary,
                    });
                }
                return Ok(archive);
            }
        }

        Ok(self.layout.current.clone())
    }

    pub(crate) fn read_definition(
        &self,
        id: GenerationId,
        released: &AtomicBool,
        name: &ArtifactName,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let index = self.index.read();
        check_live(id, released)?;
        let dir = self.locate(&index, id, name)?;
        layout::read_definition(&dir, name)
    }

    pub(crate) fn read_digest(
        &self,
        id: GenerationId,
        released: &AtomicBool,
        name: &ArtifactName,
    ) -> Result<Option<ArtifactDigest>, StoreError> {
        let index = self.index.read();
        check_live(id, released)?;
        let dir = self.locate(&index, id, name)?;
        layout::read_digest(&dir, name)
    }

    pub(crate) fn write_override(
        &self,
        id: GenerationId,
        released: &AtomicBool,
        name: &ArtifactName,
        bytes: &[u8],
    ) -> Result<(), StoreError> {
        // Shared lock: release removes the child directory under the exclusive lock.
        let _index = self.index.read();
        check_live(id, released)?;
        let digest = ArtifactDigest::compute(bytes);
        layout::write_artifact(&self.layout.child_dir(id), name, bytes, &digest)?;
        tracing::debug!("Generation {} overrides {} with {}", id, name, digest);
        Ok(())
    }

    pub(crate) fn release(&self, id: GenerationId, released: &AtomicBool) -> Result<(), StoreError> {
        if released.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Released(id));
        }

        let threshold = {
            let mut generations = self.generations.lock();
            if !generations.active.remove(&id) {
                return Err(StoreError::UnknownGeneration(id));
            }
            let was_oldest = generations
                .active
                .first()
                .is_none_or(|oldest| id < *oldest);
            was_oldest.then(|| generations.active.first().copied().unwrap_or(generations.next))
        };

        // The exclusive lock waits out in-flight override writes and unlinks reclaimed
        // boundaries from the index. Files are deleted after it is dropped.
        let mut doomed = vec![self.layout.child_dir(id)];
        let reclaimed = {
            let mut index = self.index.write();
            threshold.map(|threshold| (threshold, prune(&mut index, threshold)))
        };

        if let Some((_, boundaries)) = &reclaimed {
            doomed.extend(boundaries.iter().map(|b| self.layout.boundary_dir(*b)));
        }
        for dir in &doomed {
            layout::remove_directory(dir)?;
        }
        tracing::debug!("Released generation {}", id);

        if let Some((threshold, boundaries)) = reclaimed
            && !boundaries.is_empty()
        {
            tracing::info!(
                "Reclaimed {} archived boundaries up to generation {}",
                boundaries.len(),
                threshold
            );
        }

        Ok(())
    }
}

/// Unlinks every boundary <= `threshold` and returns them. All live generations are
/// at least `threshold`, and an archive is only read by generations below its boundary.
/// Later archives always land above `threshold`, so the returned directories can be
/// deleted without the lock.
fn prune(index: &mut DeprecationIndex, threshold: GenerationId) -> BTreeSet<GenerationId> {
    let mut reclaimed = BTreeSet::new();

    index.boundaries.retain(|_, boundaries| {
        boundaries.retain(|boundary| {
            if *boundary <= threshold {
                reclaimed.insert(*boundary);
                false
            } else {
                true
            }
        });
        !boundaries.is_empty()
    });

    reclaimed
}

fn check_live(id: GenerationId, released: &AtomicBool) -> Result<(), StoreError> {
    if released.load(Ordering::SeqCst) {
        Err(StoreError::Released(id))
    } else {
        Ok(())
    }
}
