//! Generational Code Store Module
//!
//! Durable store of named executable artifacts where several versions of the same
//! name may be valid at once. Readers never talk to the store directly; they hold a
//! `Generation`, a numbered view that keeps returning the bytes that were current
//! when it was created.
//!
//! ## Core Concepts
//! - **Current binding**: the latest bytes of every name, seen by new generations.
//! - **Boundaries**: when a name is rebound while generations are live, the old bytes
//!   are archived under the number the *next* generation will receive. Every live
//!   generation below that number keeps reading the archive.
//! - **Overrides**: a generation may write private bytes that only it can see.
//! - **Epoch reclamation**: archives are deleted only once the oldest live generation
//!   has moved past their boundary.
//!
//! ## Submodules
//! - **`types`**: artifact names, digests and write outcomes.
//! - **`error`**: the store's error taxonomy.
//! - **`layout`**: on-disk layout (`current`, `deprecated/<boundary>`, `children/<generation>`).
//! - **`store`**: the `CodeStore` itself, versioned lookup and garbage collection.
//! - **`generation`**: `Generation` handles and the scoped `GenerationGuard`.

pub mod error;
pub mod generation;
pub mod layout;
pub mod store;
pub mod types;

pub use error::StoreError;
pub use generation::{Generation, GenerationGuard};
pub use store::CodeStore;
pub use types::{ArtifactDigest, ArtifactName, GenerationId, WriteOutcome};
