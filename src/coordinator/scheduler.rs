//! Task Scheduling
//!
//! The coordinator owns job state, a `TaskScheduler` owns the order in which queued
//! tasks are handed out. A task is delivered at most once by `next_task`; it stays
//! known to the scheduler (so its results can be matched) until `remove` or
//! `remove_job`.

use super::types::{JobId, TaskDescription, TaskId};

use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_PRIORITY: i32 = 0;

pub trait TaskScheduler: Send {
    /// Queues a task for `job_id` and returns the id assigned to it.
    fn add(&mut self, job_id: JobId, payload: Value) -> TaskId;

    /// Forgets a task, whether delivered or still queued. Returns its payload, or
    /// `None` if the scheduler does not know it.
    fn remove(&mut self, job_id: &JobId, task_id: TaskId) -> Option<Value>;

    /// Next task to deliver, `None` if nothing is queued.
    fn next_task(&mut self) -> Option<TaskDescription>;

    /// Drops every task of the job. None of them can be delivered or removed afterwards.
    fn remove_job(&mut self, job_id: &JobId);

    /// Affects only tasks not yet delivered.
    fn set_job_priority(&mut self, job_id: &JobId, priority: i32);
}

#[derive(Debug)]
struct JobQueue {
    priority: i32,
    order: u64,
    next_task_id: u64,
    tasks: HashMap<TaskId, Value>,
    queued: VecDeque<TaskId>,
}

/// Serves the highest-priority job first, ties broken by the order in which jobs
/// were first seen. Tasks of one job are delivered in the order they were added.
#[derive(Debug, Default)]
pub struct PrioritySerialScheduler {
    jobs: HashMap<JobId, JobQueue>,
    next_order: u64,
}

impl PrioritySerialScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn job_queue(&mut self, job_id: JobId) -> &mut JobQueue {
        let next_order = &mut self.next_order;
        self.jobs.entry(job_id).or_insert_with(|| {
            let order = *next_order;
            *next_order += 1;
            JobQueue {
                priority: DEFAULT_PRIORITY,
                order,
                next_task_id: 1,
                tasks: HashMap::new(),
                queued: VecDeque::new(),
            }
        })
    }

    /// Number of tasks known for the job, delivered or not.
    pub fn task_count(&self, job_id: &JobId) -> usize {
        self.jobs.get(job_id).map_or(0, |job| job.tasks.len())
    }
}

impl TaskScheduler for PrioritySerialScheduler {
    fn add(&mut self, job_id: JobId, payload: Value) -> TaskId {
        let job = self.job_queue(job_id);
        let task_id = TaskId(job.next_task_id);
        job.next_task_id += 1;
        job.tasks.insert(task_id, payload);
        job.queued.push_back(task_id);
        task_id
    }

    fn remove(&mut self, job_id: &JobId, task_id: TaskId) -> Option<Value> {
        let job = self.jobs.get_mut(job_id)?;
        let payload = job.tasks.remove(&task_id)?;
        job.queued.retain(|queued| *queued != task_id);
        Some(payload)
    }

    fn next_task(&mut self) -> Option<TaskDescription> {
        let (job_id, job) = self
            .jobs
            .iter_mut()
            .filter(|(_, job)| !job.queued.is_empty())
            .min_by_key(|(_, job)| (Reverse(job.priority), job.order))?;

        let task_id = job.queued.pop_front()?;
        let payload = job.tasks.get(&task_id)?.clone();
        Some(TaskDescription::new(*job_id, task_id, payload))
    }

    fn remove_job(&mut self, job_id: &JobId) {
        self.jobs.remove(job_id);
    }

    fn set_job_priority(&mut self, job_id: &JobId, priority: i32) {
        self.job_queue(*job_id).priority = priority;
    }
}
