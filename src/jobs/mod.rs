//! Built-in Modules
//!
//! Job and worker implementations linked into every node. Each module pair is
//! installed into the code store under well-known artifact names and registered with
//! the job factory and task worker registries under its kinds.

pub mod range_sum;

use crate::codestore::{CodeStore, WriteOutcome};
use crate::coordinator::JobFactoryRegistry;
use crate::worker::registry::TaskWorkerRegistry;

use anyhow::Result;

pub fn register_job_factories(registry: &JobFactoryRegistry) {
    registry.register(range_sum::JOB_KIND, range_sum::RangeSumJob::from_module);
}

pub fn register_task_workers(registry: &TaskWorkerRegistry) {
    registry.register(range_sum::WORKER_KIND, range_sum::sum_chunk);
}

/// Writes the built-in module definitions into the store. Idempotent: unchanged
/// definitions are left alone.
pub fn install_builtin_modules(store: &CodeStore) -> Result<()> {
    let modules = [
        (range_sum::JOB_ARTIFACT, range_sum::job_module()),
        (range_sum::WORKER_ARTIFACT, range_sum::worker_module()),
    ];

    for (name, module) in modules {
        let outcome = store.set_definition(name, &module.to_bytes()?)?;
        if outcome != WriteOutcome::Unchanged {
            tracing::info!("Installed built-in module {}", name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
