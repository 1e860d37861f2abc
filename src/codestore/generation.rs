use super::error::StoreError;
use super::store::StoreInner;
use super::types::{ArtifactDigest, ArtifactName, GenerationId};

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A numbered, stable view into a `CodeStore`.
///
/// For any name it returns, in order of preference: its own private override, the
/// version archived for it when the name was rebound after it was created, or the
/// current binding. Clones share the release flag.
#[derive(Clone)]
pub struct Generation {
    id: GenerationId,
    store: Arc<StoreInner>,
    released: Arc<AtomicBool>,
}

impl Generation {
    pub(crate) fn new(id: GenerationId, store: Arc<StoreInner>) -> Self {
        Self {
            id,
            store,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn belongs_to(&self, store: &Arc<StoreInner>) -> bool {
        Arc::ptr_eq(&self.store, store)
    }

    pub fn get_definition(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let name = ArtifactName::parse(name)?;
        self.store.read_definition(self.id, &self.released, &name)
    }

    pub fn get_digest(&self, name: &str) -> Result<Option<ArtifactDigest>, StoreError> {
        let name = ArtifactName::parse(name)?;
        self.store.read_digest(self.id, &self.released, &name)
    }

    /// Writes a private override. Never touches the current binding or other generations.
    pub fn set_definition(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let name = ArtifactName::parse(name)?;
        self.store
            .write_override(self.id, &self.released, &name, bytes)
    }

    /// Removes this generation from the live set. Fails if already released.
    pub fn release(&self) -> Result<(), StoreError> {
        self.store.release(self.id, &self.released)
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Releases its generation when dropped, whatever path the owner exits through.
#[derive(Debug)]
pub struct GenerationGuard {
    generation: Generation,
}

impl GenerationGuard {
    pub(crate) fn new(generation: Generation) -> Self {
        Self { generation }
    }
}

impl Deref for GenerationGuard {
    type Target = Generation;

    fn deref(&self) -> &Generation {
        &self.generation
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if self.generation.is_released() {
            return;
        }
        if let Err(e) = self.generation.release() {
            tracing::warn!("Failed to release generation {}: {}", self.generation.id, e);
        }
    }
}
