//! Job Coordinator
//!
//! Tracks jobs from creation to completion, feeds their tasks to the scheduler and
//! routes results back to the job logic.
//!
//! ## Responsibilities
//! - **Isolation**: every job reads code through its own `Generation`, created with
//!   the job and released when it completes, is cancelled or fails.
//! - **Pipelining**: whenever a task of a job is handed out, the job is asked for its
//!   next one, so one task per job is always queued ahead of the workers.
//! - **Linearizability**: each job sits behind its own mutex. Independent jobs never
//!   wait on each other; the scheduler lock is only held for queue bookkeeping.
//!
//! Lock order is job, then scheduler.

use super::error::CoordinatorError;
use super::job::{JobExecutionError, JobFactoryRegistry, ParallelizableJob};
use super::scheduler::{DEFAULT_PRIORITY, TaskScheduler};
use super::types::*;
use crate::codestore::{ArtifactDigest, CodeStore, Generation, GenerationGuard, WriteOutcome};
use crate::module::ModuleDefinition;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const DEFAULT_IDLE_SECONDS: u64 = 10;
/// Final reports kept after their jobs finish. Older ones are forgotten.
pub const DEFAULT_FINISHED_CAPACITY: usize = 1024;

type Result<T> = std::result::Result<T, CoordinatorError>;

struct ScheduledJob {
    id: JobId,
    description: String,
    state: JobState,
    priority: i32,
    generation: Option<GenerationGuard>,
    job: Option<Box<dyn ParallelizableJob>>,
    worker: Option<WorkerSpec>,
    tasks_issued: u64,
    completed: HashSet<TaskId>,
}

impl ScheduledJob {
    fn new(id: JobId, description: String, generation: GenerationGuard) -> Self {
        Self {
            id,
            description,
            state: JobState::Created,
            priority: DEFAULT_PRIORITY,
            generation: Some(generation),
            job: None,
            worker: None,
            tasks_issued: 0,
            completed: HashSet::new(),
        }
    }

    fn report(&self, result: Option<Value>) -> JobStatusReport {
        JobStatusReport {
            job_id: self.id,
            description: self.description.clone(),
            state: self.state,
            priority: self.priority,
            tasks_issued: self.tasks_issued,
            tasks_completed: self.completed.len() as u64,
            result,
        }
    }
}

pub struct JobCoordinator {
    /// Source of job and worker code. Each job gets its own generation of it.
    store: CodeStore,
    /// Module kind -> job constructor.
    factories: Arc<JobFactoryRegistry>,
    /// Jobs that are neither completed nor cancelled.
    jobs: DashMap<JobId, Arc<Mutex<ScheduledJob>>>,
    /// Final reports of completed and cancelled jobs, most recent first.
    finished: Mutex<LruCache<JobId, JobStatusReport>>,
    scheduler: Mutex<Box<dyn TaskScheduler>>,
    /// Hint handed to workers when no task is available.
    idle_seconds: AtomicU64,
}

impl JobCoordinator {
    /// Creates a coordinator keeping up to `DEFAULT_FINISHED_CAPACITY` final reports.
    ///
    /// # Arguments
    /// * `store` - Code store the jobs read their modules from.
    /// * `factories` - Job constructors, looked up by the kind of a job's module.
    /// * `scheduler` - Decides which job's queued task goes out next.
    ///
    /// # Returns
    /// A shared coordinator with no jobs and the default idle time.
    pub fn new(
        store: CodeStore,
        factories: Arc<JobFactoryRegistry>,
        scheduler: Box<dyn TaskScheduler>,
    ) -> Arc<Self> {
        Self::with_finished_capacity(store, factories, scheduler, DEFAULT_FINISHED_CAPACITY)
    }

    /// Like `new`, but keeps only the `capacity` most recent final reports. A status
    /// query for an evicted job answers `NotFound`.
    pub fn with_finished_capacity(
        store: CodeStore,
        factories: Arc<JobFactoryRegistry>,
        scheduler: Box<dyn TaskScheduler>,
        capacity: usize,
    ) -> Arc<Self> {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Arc::new(Self {
            store,
            factories,
            jobs: DashMap::new(),
            finished: Mutex::new(LruCache::new(capacity)),
            scheduler: Mutex::new(scheduler),
            idle_seconds: AtomicU64::new(DEFAULT_IDLE_SECONDS),
        })
    }

    pub fn store(&self) -> &CodeStore {
        &self.store
    }

    /// Allocates a job and its private generation. No logic is attached yet.
    pub fn create_job(&self, description: &str) -> JobId {
        let id = JobId::new();
        let generation = self.store.scoped_generation();
        tracing::info!(
            "Created job {} ('{}') on generation {}",
            id,
            description,
            generation.id()
        );

        self.jobs.insert(
            id,
            Arc::new(Mutex::new(ScheduledJob::new(
                id,
                description.to_string(),
                generation,
            ))),
        );
        id
    }

    /// Attaches job logic, resolved through the job's own generation, and queues its
    /// first task.
    ///
    /// A job created by this call is cancelled if the submission fails. An existing
    /// job stays pending after a resolution failure, so its code can be fixed and the
    /// submission retried; a failure of the job logic itself cancels it.
    pub fn submit_job(&self, submission: &JobSubmission, target: SubmitTarget) -> Result<JobId> {
        let (job_id, created_here) = match target {
            SubmitTarget::Existing(id) => (id, false),
            SubmitTarget::New { description } => (self.create_job(&description), true),
        };

        let handle = self.job_handle(&job_id)?;
        let mut sched = handle.lock();

        if sched.state != JobState::Created {
            return Err(CoordinatorError::InvalidState(format!(
                "job {} is not pending submission (state {:?})",
                job_id, sched.state
            )));
        }

        if let Err(e) = self.initialize(&mut sched, submission) {
            tracing::warn!("Submission of job {} failed: {}", job_id, e);
            if created_here || matches!(e, CoordinatorError::Job(_)) {
                self.retire(&mut sched, JobState::Cancelled, None);
            }
            return Err(e);
        }

        tracing::info!(
            "Submitted job {} (module {}, worker {:?})",
            job_id,
            submission.module,
            sched.worker.as_ref().map(|w| w.artifact.to_string())
        );
        Ok(job_id)
    }

    fn initialize(&self, sched: &mut ScheduledJob, submission: &JobSubmission) -> Result<()> {
        let generation = sched
            .generation
            .as_ref()
            .ok_or_else(|| CoordinatorError::InvalidState(format!("job {} is retired", sched.id)))?;

        let bytes = generation
            .get_definition(&submission.module)?
            .ok_or_else(|| {
                CoordinatorError::Resolution(format!("artifact '{}' not found", submission.module))
            })?;

        let module = ModuleDefinition::from_bytes(&bytes).map_err(|e| {
            CoordinatorError::Resolution(format!(
                "artifact '{}' is not a module definition: {}",
                submission.module, e
            ))
        })?;

        let job = self
            .factories
            .create(&module, &submission.params)
            .ok_or_else(|| {
                CoordinatorError::Resolution(format!("no job factory for kind '{}'", module.kind))
            })??;

        let worker = job.worker_artifact();
        if generation.get_digest(worker.as_str())?.is_none() {
            return Err(CoordinatorError::Resolution(format!(
                "worker artifact '{}' not found",
                worker
            )));
        }

        sched.worker = Some(WorkerSpec { artifact: worker });
        sched.job = Some(job);
        sched.state = JobState::Submitted;

        self.schedule_next_task(sched)?;
        self.complete_if_done(sched)?;
        Ok(())
    }

    /// Hands out the next queued task, or an idle instruction if there is none.
    pub fn request_task(&self) -> TaskDescription {
        let next = self.scheduler.lock().next_task();
        let Some(task) = next else {
            return TaskDescription::idle(self.idle_seconds());
        };

        if let Some(job_id) = task.job_id
            && let Ok(handle) = self.job_handle(&job_id)
        {
            let mut sched = handle.lock();
            if let Err(e) = self.schedule_next_task(&mut sched) {
                self.fail(&mut sched, e);
            }
        }

        tracing::debug!("Delivering task {} of job {:?}", task.task_id, task.job_id);
        task
    }

    /// Accepts the results of a delivered task.
    ///
    /// Fails with not-found for unknown jobs and tasks, and with invalid-state when
    /// results for the task were already accepted. A failure inside the job logic
    /// cancels the job but is not reported to the submitter.
    pub fn submit_task_results(&self, job_id: JobId, task_id: TaskId, results: Value) -> Result<()> {
        let handle = self.job_handle(&job_id)?;
        let mut sched = handle.lock();

        if !sched.state.is_running() {
            return Err(CoordinatorError::NotFound(format!("no running job {}", job_id)));
        }

        let removed = self.scheduler.lock().remove(&job_id, task_id);
        let Some(task) = removed else {
            return Err(if sched.completed.contains(&task_id) {
                CoordinatorError::InvalidState(format!(
                    "results for task {} of job {} were already accepted",
                    task_id, job_id
                ))
            } else {
                CoordinatorError::NotFound(format!("task {} of job {}", task_id, job_id))
            });
        };
        sched.completed.insert(task_id);
        tracing::debug!("Accepted results of task {} of job {}", task_id, job_id);

        let outcome = match sched.job.as_mut() {
            Some(job) => job.submit_task_results(task, results),
            None => Ok(()),
        };

        let outcome = outcome.and_then(|_| {
            if self.complete_if_done(&mut sched)? {
                return Ok(());
            }
            if sched.state == JobState::Draining {
                self.schedule_next_task(&mut sched)?;
            }
            Ok(())
        });

        if let Err(e) = outcome {
            self.fail(&mut sched, e);
        }
        Ok(())
    }

    pub fn cancel_job(&self, job_id: JobId) -> Result<()> {
        let handle = self.job_handle(&job_id)?;
        let mut sched = handle.lock();
        if sched.state.is_terminal() {
            return Err(CoordinatorError::NotFound(format!("no active job {}", job_id)));
        }

        self.retire(&mut sched, JobState::Cancelled, None);
        Ok(())
    }

    pub fn set_job_priority(&self, job_id: JobId, priority: i32) -> Result<()> {
        let handle = self.job_handle(&job_id)?;
        let mut sched = handle.lock();
        if sched.state.is_terminal() {
            return Err(CoordinatorError::NotFound(format!("no active job {}", job_id)));
        }

        sched.priority = priority;
        self.scheduler.lock().set_job_priority(&job_id, priority);
        tracing::info!("Job {} priority set to {}", job_id, priority);
        Ok(())
    }

    pub fn get_task_worker(&self, job_id: JobId) -> Result<WorkerSpec> {
        let handle = self.job_handle(&job_id)?;
        let sched = handle.lock();
        sched.worker.clone().ok_or_else(|| {
            CoordinatorError::InvalidState(format!("job {} has not been submitted", job_id))
        })
    }

    /// Digest of `name` as seen by the job, or the current binding without a job.
    pub fn get_artifact_digest(
        &self,
        name: &str,
        job_id: Option<JobId>,
    ) -> Result<Option<ArtifactDigest>> {
        let digest = match job_id {
            Some(id) => self.job_generation(&id)?.get_digest(name)?,
            None => self.store.get_digest(name)?,
        };
        Ok(digest)
    }

    pub fn get_artifact_definition(&self, name: &str, job_id: JobId) -> Result<Vec<u8>> {
        self.job_generation(&job_id)?
            .get_definition(name)?
            .ok_or_else(|| {
                CoordinatorError::NotFound(format!("artifact '{}' for job {}", name, job_id))
            })
    }

    /// Rebinds `name` in the store, or stages a private version for a pending job.
    pub fn set_artifact_definition(
        &self,
        name: &str,
        job_id: Option<JobId>,
        bytes: &[u8],
    ) -> Result<WriteOutcome> {
        let Some(job_id) = job_id else {
            return Ok(self.store.set_definition(name, bytes)?);
        };

        let handle = self.job_handle(&job_id)?;
        let sched = handle.lock();
        if sched.state != JobState::Created {
            return Err(CoordinatorError::InvalidState(format!(
                "job {} is no longer pending (state {:?})",
                job_id, sched.state
            )));
        }

        let generation = sched
            .generation
            .as_ref()
            .ok_or_else(|| CoordinatorError::NotFound(format!("job {}", job_id)))?;
        generation.set_definition(name, bytes)?;
        tracing::info!("Staged artifact {} for job {}", name, job_id);
        Ok(WriteOutcome::Installed)
    }

    pub fn set_idle_time(&self, seconds: u64) {
        self.idle_seconds.store(seconds, Ordering::SeqCst);
        tracing::info!("Idle time set to {}s", seconds);
    }

    pub fn idle_seconds(&self) -> u64 {
        self.idle_seconds.load(Ordering::SeqCst)
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobStatusReport> {
        if let Ok(handle) = self.job_handle(&job_id) {
            return Ok(handle.lock().report(None));
        }
        self.finished
            .lock()
            .get(&job_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(format!("job {}", job_id)))
    }

    /// Ids of jobs that are neither completed nor cancelled.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    fn job_handle(&self, job_id: &JobId) -> Result<Arc<Mutex<ScheduledJob>>> {
        // Clone the handle out so no map shard stays locked while the job is locked.
        self.jobs
            .get(job_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoordinatorError::NotFound(format!("job {}", job_id)))
    }

    fn job_generation(&self, job_id: &JobId) -> Result<Generation> {
        let handle = self.job_handle(job_id)?;
        let sched = handle.lock();
        sched
            .generation
            .as_ref()
            .map(|guard| Generation::clone(guard))
            .ok_or_else(|| CoordinatorError::NotFound(format!("job {}", job_id)))
    }

    fn schedule_next_task(
        &self,
        sched: &mut ScheduledJob,
    ) -> std::result::Result<(), JobExecutionError> {
        if !sched.state.is_running() {
            return Ok(());
        }
        let Some(job) = sched.job.as_mut() else {
            return Ok(());
        };

        match job.next_task()? {
            Some(payload) => {
                let task_id = self.scheduler.lock().add(sched.id, payload);
                sched.tasks_issued += 1;
                sched.state = JobState::Submitted;
                tracing::trace!("Queued task {} of job {}", task_id, sched.id);
            }
            None => {
                if sched.state == JobState::Submitted {
                    tracing::debug!("Job {} has no further tasks, draining", sched.id);
                }
                sched.state = JobState::Draining;
            }
        }
        Ok(())
    }

    fn complete_if_done(&self, sched: &mut ScheduledJob) -> std::result::Result<bool, JobExecutionError> {
        let Some(job) = sched.job.as_mut() else {
            return Ok(false);
        };
        if !job.is_complete() {
            return Ok(false);
        }

        let result = job.finish()?;
        self.retire(sched, JobState::Completed, Some(result));
        Ok(true)
    }

    fn fail(&self, sched: &mut ScheduledJob, error: JobExecutionError) {
        tracing::warn!("Job {} failed, cancelling: {}", sched.id, error);
        self.retire(sched, JobState::Cancelled, None);
    }

    /// Moves a job to a terminal state: drops its tasks, releases its generation and
    /// keeps only its final report.
    fn retire(&self, sched: &mut ScheduledJob, state: JobState, result: Option<Value>) {
        sched.state = state;
        sched.job = None;
        self.scheduler.lock().remove_job(&sched.id);

        if let Some(generation) = sched.generation.take()
            && let Err(e) = generation.release()
        {
            tracing::warn!("Failed to release generation of job {}: {}", sched.id, e);
        }

        // A job is always in `jobs` or `finished` until evicted.
        self.finished.lock().put(sched.id, sched.report(result));
        self.jobs.remove(&sched.id);

        tracing::info!(
            "Job {} {:?} after {} of {} tasks",
            sched.id,
            state,
            sched.completed.len(),
            sched.tasks_issued
        );
    }
}
