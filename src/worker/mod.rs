//! Worker Module
//!
//! The process that actually computes tasks. It only ever talks to the coordinator
//! through `CoordinatorService`, fetching each job's worker code on demand and
//! keeping it cached for as long as its digest does not change.
//!
//! ## Submodules
//! - **`client`**: `CoordinatorService` with HTTP and in-process implementations.
//! - **`registry`**: module kinds to task functions.
//! - **`cache`**: content-addressed artifact cache and per-job worker cache.
//! - **`runtime`**: the slot pool driving everything.

pub mod cache;
pub mod client;
pub mod registry;
pub mod runtime;

pub use cache::{ArtifactCache, CacheStats, WorkerCache};
pub use client::{ClientError, CoordinatorService, HttpCoordinatorClient, InProcessCoordinator};
pub use registry::{TaskInput, TaskWorkerHandle, TaskWorkerRegistry};
pub use runtime::{SlotOutcome, WorkerRuntime, WorkerStatsSnapshot};

#[cfg(test)]
mod tests;
