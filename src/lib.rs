//! Distributed Compute Platform Library
//!
//! Core modules of a platform that runs parallel jobs on a pool of workers, with job
//! and worker code loaded from a versioned artifact store at runtime. The binary
//! (`main.rs`) wires them into a coordinator node, a worker node and a few client
//! commands.
//!
//! ## Architecture Modules
//! - **`codestore`**: generational artifact store. Every job reads its code through
//!   its own generation, so rebinding an artifact never changes a running job.
//! - **`coordinator`**: job lifecycle, task issuance and result collection, behind a
//!   permission check and an HTTP surface.
//! - **`worker`**: the slot pool that pulls tasks, caches job code by digest and
//!   reports results.
//! - **`module`** / **`jobs`**: the JSON module format and the built-in job and
//!   worker implementations it can name.
//! - **`sync`**: mirrors a directory of artifacts into a store.
//! - **`config`**: TOML configuration of both node roles.

pub mod codestore;
pub mod config;
pub mod coordinator;
pub mod jobs;
pub mod module;
pub mod sync;
pub mod worker;
