//! Job Coordinator Module
//!
//! Central service of the platform. Clients create and submit jobs, workers pull tasks
//! and push results, and every job reads its code through a private generation of the
//! code store.
//!
//! ## Submodules
//! - **`types`**: job and task identifiers, task descriptions, job states.
//! - **`job`**: the `ParallelizableJob` contract and the registry of job factories.
//! - **`scheduler`**: the `TaskScheduler` contract and `PrioritySerialScheduler`.
//! - **`coordinator`**: `JobCoordinator`, the job lifecycle and task pipelining.
//! - **`auth`**: permission checks wrapped around every remote operation.
//! - **`protocol`** / **`handlers`**: the HTTP surface.

pub mod auth;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod job;
pub mod protocol;
pub mod scheduler;
pub mod types;

pub use auth::{AccessPolicy, AllowAll, Permission, SecuredCoordinator, TokenPolicy};
pub use coordinator::{DEFAULT_FINISHED_CAPACITY, DEFAULT_IDLE_SECONDS, JobCoordinator};
pub use error::CoordinatorError;
pub use job::{JobExecutionError, JobFactoryRegistry, ParallelizableJob};
pub use scheduler::{PrioritySerialScheduler, TaskScheduler};
pub use types::*;
