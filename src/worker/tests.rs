//! Worker Module Tests
//!
//! ## Test Scopes
//! - **Artifact Cache**: digest-keyed hits, refetch on change, verification.
//! - **Worker Cache**: single-flight resolution and failure cleanup.
//! - **Runtime**: slot outcomes against an in-process coordinator, the pool and shutdown.

#[cfg(test)]
mod tests {
    use crate::codestore::{ArtifactDigest, ArtifactName, CodeStore};
    use crate::config::WorkerConfig;
    use crate::coordinator::*;
    use crate::jobs::range_sum::{JOB_ARTIFACT, WORKER_ARTIFACT, WORKER_KIND, sum_chunk, worker_module};
    use crate::jobs::{install_builtin_modules, register_job_factories, register_task_workers};
    use crate::module::ModuleDefinition;
    use crate::worker::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    // ============================================================
    // FIXTURES
    // ============================================================

    #[derive(Default)]
    struct FakeState {
        artifacts: HashMap<String, Vec<u8>>,
        /// Digest advertised instead of the real one.
        advertised: HashMap<String, ArtifactDigest>,
        definition_calls: usize,
        unavailable: bool,
        /// Pings fail too, so reconnecting never succeeds.
        unreachable: bool,
        pings: usize,
    }

    /// Scriptable coordinator for cache and failure tests.
    #[derive(Default)]
    struct FakeCoordinator {
        state: Mutex<FakeState>,
    }

    impl FakeCoordinator {
        fn with_artifact(name: &str, bytes: &[u8]) -> Self {
            let fake = Self::default();
            fake.put(name, bytes);
            fake
        }

        fn put(&self, name: &str, bytes: &[u8]) {
            self.state
                .lock()
                .artifacts
                .insert(name.to_string(), bytes.to_vec());
        }

        fn definition_calls(&self) -> usize {
            self.state.lock().definition_calls
        }
    }

    #[async_trait]
    impl CoordinatorService for FakeCoordinator {
        async fn request_task(&self) -> Result<Option<TaskDescription>, ClientError> {
            if self.state.lock().unavailable {
                return Err(ClientError::Remote {
                    status: 503,
                    message: "down".to_string(),
                });
            }
            Ok(None)
        }

        async fn submit_task_results(
            &self,
            _job_id: JobId,
            _task_id: TaskId,
            _results: Value,
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn get_task_worker(&self, _job_id: JobId) -> Result<WorkerSpec, ClientError> {
            Ok(WorkerSpec {
                artifact: ArtifactName::parse(WORKER_ARTIFACT).unwrap(),
            })
        }

        async fn get_artifact_digest(
            &self,
            name: &ArtifactName,
            _job_id: JobId,
        ) -> Result<Option<ArtifactDigest>, ClientError> {
            let state = self.state.lock();
            if let Some(digest) = state.advertised.get(name.as_str()) {
                return Ok(Some(digest.clone()));
            }
            Ok(state
                .artifacts
                .get(name.as_str())
                .map(|bytes| ArtifactDigest::compute(bytes)))
        }

        async fn get_artifact_definition(
            &self,
            name: &ArtifactName,
            _job_id: JobId,
        ) -> Result<Vec<u8>, ClientError> {
            let mut state = self.state.lock();
            state.definition_calls += 1;
            state
                .artifacts
                .get(name.as_str())
                .cloned()
                .ok_or_else(|| ClientError::Remote {
                    status: 404,
                    message: "missing".to_string(),
                })
        }

        async fn ping(&self) -> Result<(), ClientError> {
            let mut state = self.state.lock();
            state.pings += 1;
            if state.unreachable {
                return Err(ClientError::Remote {
                    status: 503,
                    message: "down".to_string(),
                });
            }
            state.unavailable = false;
            Ok(())
        }
    }

    fn name(s: &str) -> ArtifactName {
        ArtifactName::parse(s).unwrap()
    }

    fn registry() -> Arc<TaskWorkerRegistry> {
        let registry = TaskWorkerRegistry::new();
        register_task_workers(&registry);
        registry
    }

    fn test_config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            idle_seconds: 0,
            reconnect_initial_ms: 1,
            reconnect_max_ms: 5,
            ..WorkerConfig::default()
        }
    }

    fn setup_coordinator() -> (TempDir, Arc<SecuredCoordinator>) {
        let dir = tempfile::tempdir().unwrap();
        let store = CodeStore::open(dir.path()).unwrap();
        install_builtin_modules(&store).unwrap();

        let factories = JobFactoryRegistry::new();
        register_job_factories(&factories);

        let coordinator = JobCoordinator::new(
            store,
            factories,
            Box::new(PrioritySerialScheduler::new()),
        );
        coordinator.set_idle_time(0);
        (dir, SecuredCoordinator::new(coordinator, Arc::new(AllowAll)))
    }

    fn in_process_runtime(coordinator: &Arc<SecuredCoordinator>, concurrency: usize) -> Arc<WorkerRuntime> {
        WorkerRuntime::new(
            Arc::new(InProcessCoordinator::new(coordinator.clone(), None)),
            registry(),
            test_config(concurrency),
        )
    }

    fn submit_range_sum(coordinator: &SecuredCoordinator, end: u64, chunk: u64) -> JobId {
        coordinator
            .submit_job(
                None,
                &JobSubmission::new(JOB_ARTIFACT, json!({ "start": 0, "end": end, "chunk": chunk })),
                SubmitTarget::New {
                    description: "sum".to_string(),
                },
            )
            .unwrap()
    }

    /// Runs single slot executions until the job leaves the active set.
    async fn run_to_completion(runtime: &WorkerRuntime, coordinator: &SecuredCoordinator, job_id: JobId) {
        for _ in 0..100 {
            if !coordinator.coordinator().active_jobs().contains(&job_id) {
                return;
            }
            runtime.run_once().await;
        }
        panic!("job {} did not complete", job_id);
    }

    // ============================================================
    // ARTIFACT CACHE
    // ============================================================

    #[tokio::test]
    async fn test_unchanged_digest_transfers_no_bytes() {
        let fake = FakeCoordinator::with_artifact("a.B", b"version one");
        let cache = ArtifactCache::new(8);
        let job_id = JobId::new();

        let (first_digest, first) = cache.fetch(&fake, &name("a.B"), job_id).await.unwrap();
        let fetched = cache.stats().bytes_fetched;
        let (second_digest, second) = cache.fetch(&fake, &name("a.B"), job_id).await.unwrap();

        assert_eq!(first_digest, second_digest);
        assert_eq!(first.as_slice(), b"version one");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fake.definition_calls(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes_fetched, fetched);
    }

    #[tokio::test]
    async fn test_changed_digest_forces_refetch() {
        let fake = FakeCoordinator::with_artifact("a.B", b"version one");
        let cache = ArtifactCache::new(8);
        let job_id = JobId::new();

        cache.fetch(&fake, &name("a.B"), job_id).await.unwrap();
        fake.put("a.B", b"version two");
        let (digest, bytes) = cache.fetch(&fake, &name("a.B"), job_id).await.unwrap();

        assert_eq!(bytes.as_slice(), b"version two");
        assert_eq!(digest, ArtifactDigest::compute(b"version two"));
        assert_eq!(fake.definition_calls(), 2);
        assert_eq!(cache.stats().entries, 2);
    }

    #[tokio::test]
    async fn test_digest_mismatch_is_not_cached() {
        let fake = FakeCoordinator::with_artifact("a.B", b"real bytes");
        fake.state
            .lock()
            .advertised
            .insert("a.B".to_string(), ArtifactDigest::compute(b"other bytes"));
        let cache = ArtifactCache::new(8);

        let err = cache.fetch(&fake, &name("a.B"), JobId::new()).await.unwrap_err();

        assert!(err.to_string().contains("digest mismatch"));
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_an_error() {
        let fake = FakeCoordinator::default();
        let cache = ArtifactCache::new(8);

        assert!(cache.fetch(&fake, &name("a.B"), JobId::new()).await.is_err());
        assert_eq!(fake.definition_calls(), 0);
    }

    // ============================================================
    // WORKER CACHE
    // ============================================================

    fn range_sum_handle() -> TaskWorkerHandle {
        let bytes = worker_module().to_bytes().unwrap();
        registry()
            .resolve(
                ModuleDefinition::from_bytes(&bytes).unwrap(),
                ArtifactDigest::compute(&bytes),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_resolution_leaves_no_entry() {
        let cache = WorkerCache::new(5);
        let job_id = JobId::new();

        let result = cache
            .get_or_resolve(job_id, || async { Err::<TaskWorkerHandle, _>(anyhow::anyhow!("no such kind")) })
            .await;
        assert!(result.is_err());
        assert!(cache.is_empty());

        cache
            .get_or_resolve(job_id, || async { Ok::<_, anyhow::Error>(range_sum_handle()) })
            .await
            .unwrap();
        assert!(cache.contains(&job_id));
    }

    #[tokio::test]
    async fn test_concurrent_slots_share_one_resolution() {
        let cache = Arc::new(WorkerCache::new(5));
        let resolutions = Arc::new(AtomicUsize::new(0));
        let job_id = JobId::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let resolutions = resolutions.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(job_id, || async move {
                        resolutions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, anyhow::Error>(range_sum_handle())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut resolved = Vec::new();
        for handle in handles {
            resolved.push(handle.await.unwrap());
        }

        assert_eq!(resolutions.load(Ordering::SeqCst), 1);
        assert!(resolved.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_worker_cache_evicts_least_recent_job() {
        let cache = WorkerCache::new(2);
        let jobs = [JobId::new(), JobId::new(), JobId::new()];

        for job_id in jobs {
            cache
                .get_or_resolve(job_id, || async { Ok::<_, anyhow::Error>(range_sum_handle()) })
                .await
                .unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&jobs[0]));
        assert!(cache.contains(&jobs[2]));
    }

    // ============================================================
    // RUNTIME
    // ============================================================

    #[tokio::test]
    async fn test_runtime_completes_job() {
        let (_dir, coordinator) = setup_coordinator();
        let runtime = in_process_runtime(&coordinator, 1);
        let job_id = submit_range_sum(&coordinator, 50, 10);

        run_to_completion(&runtime, &coordinator, job_id).await;

        let report = coordinator.job_status(None, job_id).unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.result, Some(json!({ "sum": 1225, "chunks": 5 })));
        assert_eq!(runtime.stats().completed, 5);
        assert_eq!(runtime.artifact_stats().misses, 1);
    }

    #[tokio::test]
    async fn test_unchanged_worker_is_not_refetched_by_next_job() {
        let (_dir, coordinator) = setup_coordinator();
        let runtime = in_process_runtime(&coordinator, 1);

        let first = submit_range_sum(&coordinator, 20, 10);
        run_to_completion(&runtime, &coordinator, first).await;
        let fetched = runtime.artifact_stats().bytes_fetched;

        let second = submit_range_sum(&coordinator, 20, 10);
        run_to_completion(&runtime, &coordinator, second).await;

        let stats = runtime.artifact_stats();
        assert_eq!(stats.bytes_fetched, fetched);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_rebound_worker_is_refetched_by_next_job() {
        let (_dir, coordinator) = setup_coordinator();
        let runtime = in_process_runtime(&coordinator, 1);

        let first = submit_range_sum(&coordinator, 20, 10);
        run_to_completion(&runtime, &coordinator, first).await;

        let rebound = ModuleDefinition::new(
            crate::jobs::range_sum::WORKER_KIND,
            json!({ "revision": 2 }),
        );
        coordinator
            .set_artifact_definition(None, WORKER_ARTIFACT, None, &rebound.to_bytes().unwrap())
            .unwrap();

        let second = submit_range_sum(&coordinator, 20, 10);
        run_to_completion(&runtime, &coordinator, second).await;

        assert_eq!(runtime.artifact_stats().misses, 2);
        assert_eq!(
            coordinator.job_status(None, second).unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn test_idle_instruction_is_obeyed() {
        let (_dir, coordinator) = setup_coordinator();
        let runtime = in_process_runtime(&coordinator, 1);

        assert_eq!(runtime.run_once().await, SlotOutcome::Idle);
        assert_eq!(runtime.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_unknown_worker_kind_fails_task_and_retries_resolution() {
        let (_dir, coordinator) = setup_coordinator();
        let runtime = in_process_runtime(&coordinator, 1);

        let job_id = coordinator.create_job(None, "broken").unwrap();
        let broken = ModuleDefinition::new("no.such.kind", json!({}));
        coordinator
            .set_artifact_definition(None, WORKER_ARTIFACT, Some(job_id), &broken.to_bytes().unwrap())
            .unwrap();
        coordinator
            .submit_job(
                None,
                &JobSubmission::new(JOB_ARTIFACT, json!({ "start": 0, "end": 20, "chunk": 10 })),
                SubmitTarget::Existing(job_id),
            )
            .unwrap();

        assert_eq!(runtime.run_once().await, SlotOutcome::Failed);
        assert_eq!(runtime.run_once().await, SlotOutcome::Failed);

        // Both tasks tried to resolve; nothing was cached in between.
        assert_eq!(runtime.artifact_stats().hits, 1);
        assert_eq!(runtime.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_unreachable_coordinator_drops_and_reconnects() {
        let fake = Arc::new(FakeCoordinator::default());
        fake.state.lock().unavailable = true;
        let runtime = WorkerRuntime::new(fake.clone(), registry(), test_config(1));

        assert_eq!(runtime.run_once().await, SlotOutcome::Dropped);
        assert_eq!(fake.state.lock().pings, 1);
        assert_eq!(runtime.run_once().await, SlotOutcome::Idle);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap_without_overflow() {
        use crate::worker::runtime::next_backoff;

        assert_eq!(next_backoff(150, 5_000), 300);
        assert_eq!(next_backoff(4_000, 5_000), 5_000);
        assert_eq!(next_backoff(u64::MAX / 2 + 1, u64::MAX), u64::MAX);
        assert_eq!(next_backoff(u64::MAX, u64::MAX), u64::MAX);
        assert_eq!(next_backoff(10, 0), 1);
    }

    #[tokio::test]
    async fn test_reconnect_with_unbounded_backoff_stops_on_shutdown() {
        let fake = Arc::new(FakeCoordinator::default());
        {
            let mut state = fake.state.lock();
            state.unavailable = true;
            state.unreachable = true;
        }
        let config = WorkerConfig {
            reconnect_initial_ms: u64::MAX,
            reconnect_max_ms: u64::MAX,
            ..test_config(1)
        };
        let runtime = WorkerRuntime::new(fake.clone(), registry(), config);

        let slot = tokio::spawn({
            let runtime = runtime.clone();
            async move { runtime.run_once().await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while fake.state.lock().pings == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        runtime.shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(5), slot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SlotOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_pool_completes_job_and_stops_on_shutdown() {
        let (_dir, coordinator) = setup_coordinator();
        coordinator.coordinator().set_idle_time(1);
        let runtime = in_process_runtime(&coordinator, 3);
        let job_id = submit_range_sum(&coordinator, 100, 7);

        let running = tokio::spawn(runtime.clone().run());

        let completed = tokio::time::timeout(Duration::from_secs(10), async {
            while coordinator.coordinator().active_jobs().contains(&job_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(completed.is_ok());

        runtime.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        let report = coordinator.job_status(None, job_id).unwrap();
        assert_eq!(report.result, Some(json!({ "sum": 4950, "chunks": 15 })));
        assert_eq!(runtime.stats().completed, 15);
    }

    async fn wait_for_job(coordinator: &SecuredCoordinator, job_id: JobId) {
        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            while coordinator.coordinator().active_jobs().contains(&job_id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(finished.is_ok(), "job {} did not complete", job_id);
    }

    #[tokio::test]
    async fn test_shutdown_lets_running_task_finish_and_report() {
        let (_dir, coordinator) = setup_coordinator();
        coordinator.coordinator().set_idle_time(1);

        let started = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let registry = TaskWorkerRegistry::new();
        {
            let started = started.clone();
            let gate = gate.clone();
            registry.register(WORKER_KIND, move |input| {
                let started = started.clone();
                let gate = gate.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    sum_chunk(input).await
                }
            });
        }
        let runtime = WorkerRuntime::new(
            Arc::new(InProcessCoordinator::new(coordinator.clone(), None)),
            registry,
            test_config(2),
        );
        let job_id = submit_range_sum(&coordinator, 10, 10);

        let running = tokio::spawn(runtime.clone().run());
        tokio::time::timeout(Duration::from_secs(5), async {
            while started.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        runtime.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!running.is_finished());

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        let report = coordinator.job_status(None, job_id).unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.tasks_completed, 1);
        assert_eq!(report.result, Some(json!({ "sum": 45, "chunks": 1 })));
        assert_eq!(runtime.stats().completed, 1);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_concurrency() {
        let (_dir, coordinator) = setup_coordinator();
        coordinator.coordinator().set_idle_time(1);

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = TaskWorkerRegistry::new();
        {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            registry.register(WORKER_KIND, move |input| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(3)).await;
                    let results = sum_chunk(input).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    results
                }
            });
        }
        let runtime = WorkerRuntime::new(
            Arc::new(InProcessCoordinator::new(coordinator.clone(), None)),
            registry,
            test_config(3),
        );
        let job_id = submit_range_sum(&coordinator, 200, 5);

        let running = tokio::spawn(runtime.clone().run());
        wait_for_job(&coordinator, job_id).await;
        runtime.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        let report = coordinator.job_status(None, job_id).unwrap();
        assert_eq!(report.result, Some(json!({ "sum": 19900, "chunks": 40 })));
        assert_eq!(runtime.stats().completed, 40);
        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=3).contains(&peak), "peak of {} concurrent tasks", peak);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_runtime_returns_immediately() {
        let (_dir, coordinator) = setup_coordinator();
        let runtime = in_process_runtime(&coordinator, 2);
        runtime.shutdown_token().cancel();

        tokio::time::timeout(Duration::from_secs(1), runtime.clone().run())
            .await
            .unwrap();
    }
}
