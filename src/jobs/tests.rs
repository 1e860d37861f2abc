//! Built-in Module Tests

#[cfg(test)]
mod tests {
    use crate::codestore::{CodeStore, WriteOutcome};
    use crate::coordinator::{JobId, ParallelizableJob, TaskId};
    use crate::jobs::range_sum::*;
    use crate::jobs::{install_builtin_modules, register_task_workers};
    use crate::module::ModuleDefinition;
    use crate::worker::registry::{TaskInput, TaskWorkerRegistry};
    use serde_json::json;

    fn job(start: u64, end: u64, chunk: u64) -> Box<dyn ParallelizableJob> {
        RangeSumJob::from_module(
            &job_module(),
            &json!({ "start": start, "end": end, "chunk": chunk }),
        )
        .unwrap()
    }

    // ============================================================
    // DECOMPOSITION
    // ============================================================

    #[test]
    fn test_range_is_split_into_chunks() {
        let mut job = job(0, 25, 10);

        let mut chunks = Vec::new();
        while let Some(task) = job.next_task().unwrap() {
            chunks.push(serde_json::from_value::<RangeChunk>(task).unwrap());
        }

        assert_eq!(
            chunks,
            vec![
                RangeChunk { from: 0, to: 10, power: 1 },
                RangeChunk { from: 10, to: 20, power: 1 },
                RangeChunk { from: 20, to: 25, power: 1 },
            ]
        );
        assert!(!job.is_complete());
    }

    #[test]
    fn test_job_completes_after_all_results() {
        let mut job = job(0, 20, 10);
        let t1 = job.next_task().unwrap().unwrap();
        let t2 = job.next_task().unwrap().unwrap();

        job.submit_task_results(t1, json!({ "sum": 45 })).unwrap();
        assert!(!job.is_complete());
        job.submit_task_results(t2, json!({ "sum": 145 })).unwrap();
        assert!(job.is_complete());

        assert_eq!(job.finish().unwrap(), json!({ "sum": 190, "chunks": 2 }));
    }

    #[test]
    fn test_empty_range_is_complete_immediately() {
        let mut job = job(5, 5, 10);
        assert_eq!(job.next_task().unwrap(), None);
        assert!(job.is_complete());
    }

    #[test]
    fn test_worker_artifact_comes_from_module_params() {
        let module = ModuleDefinition::new(JOB_KIND, json!({ "worker": "custom.Worker" }));
        let job = RangeSumJob::from_module(&module, &json!({ "start": 0, "end": 1 })).unwrap();
        assert_eq!(job.worker_artifact().as_str(), "custom.Worker");

        let default = RangeSumJob::from_module(
            &ModuleDefinition::new(JOB_KIND, json!({})),
            &json!({ "start": 0, "end": 1 }),
        )
        .unwrap();
        assert_eq!(default.worker_artifact().as_str(), WORKER_ARTIFACT);
    }

    #[test]
    fn test_invalid_parameters_are_rejected() {
        let module = job_module();
        assert!(RangeSumJob::from_module(&module, &json!({ "start": 0, "end": 5, "chunk": 0 })).is_err());
        assert!(RangeSumJob::from_module(&module, &json!({ "start": 9, "end": 5 })).is_err());
        assert!(RangeSumJob::from_module(&module, &json!({ "end": 5 })).is_err());
    }

    #[test]
    fn test_malformed_results_are_rejected() {
        let mut job = job(0, 10, 10);
        let task = job.next_task().unwrap().unwrap();
        assert!(job.submit_task_results(task, json!({ "total": 1 })).is_err());
    }

    // ============================================================
    // TASK FUNCTION
    // ============================================================

    #[tokio::test]
    async fn test_sum_chunk_computes_powers() {
        let input = TaskInput {
            job_id: JobId::new(),
            task_id: TaskId(1),
            params: json!({}),
            payload: json!({ "from": 1, "to": 4, "power": 2 }),
        };

        let result = sum_chunk(input).await.unwrap();
        assert_eq!(result, json!({ "sum": 14 }));
    }

    #[tokio::test]
    async fn test_sum_chunk_reports_overflow() {
        let input = TaskInput {
            job_id: JobId::new(),
            task_id: TaskId(1),
            params: json!({}),
            payload: json!({ "from": 1u64 << 40, "to": (1u64 << 40) + 2, "power": 3 }),
        };

        assert!(sum_chunk(input).await.is_err());
    }

    #[tokio::test]
    async fn test_registered_worker_resolves_from_module() {
        let registry = TaskWorkerRegistry::new();
        register_task_workers(&registry);

        let bytes = worker_module().to_bytes().unwrap();
        let module = ModuleDefinition::from_bytes(&bytes).unwrap();
        let handle = registry
            .resolve(module, crate::codestore::ArtifactDigest::compute(&bytes))
            .unwrap();

        let result = handle
            .perform(JobId::new(), TaskId(1), json!({ "from": 0, "to": 5, "power": 1 }))
            .await
            .unwrap();
        assert_eq!(result, json!({ "sum": 10 }));
    }

    // ============================================================
    // INSTALLATION
    // ============================================================

    #[test]
    fn test_install_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CodeStore::open(dir.path()).unwrap();

        install_builtin_modules(&store).unwrap();
        let digest = store.get_digest(JOB_ARTIFACT).unwrap();
        assert!(digest.is_some());

        let _generation = store.create_generation();
        install_builtin_modules(&store).unwrap();

        assert_eq!(store.get_digest(JOB_ARTIFACT).unwrap(), digest);
        assert!(store.archived_boundaries(JOB_ARTIFACT).unwrap().is_empty());
        assert_eq!(
            store
                .set_definition(WORKER_ARTIFACT, &worker_module().to_bytes().unwrap())
                .unwrap(),
            WriteOutcome::Unchanged
        );
    }
}
