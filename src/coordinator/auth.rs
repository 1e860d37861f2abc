//! Access Control
//!
//! Every remote operation needs a named permission. `SecuredCoordinator` checks it
//! against an `AccessPolicy` before touching any state and otherwise delegates to the
//! `JobCoordinator` unchanged.

use super::coordinator::JobCoordinator;
use super::error::CoordinatorError;
use super::types::*;
use crate::codestore::{ArtifactDigest, WriteOutcome};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    SubmitJob,
    CancelJob,
    Worker,
    SetArtifactDefinition,
    SetJobArtifactDefinition,
    SetIdleTime,
    SetJobPriority,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::SubmitJob => "job.submit",
            Permission::CancelJob => "job.cancel",
            Permission::Worker => "worker",
            Permission::SetArtifactDefinition => "admin.setArtifactDefinition",
            Permission::SetJobArtifactDefinition => "job.setArtifactDefinition",
            Permission::SetIdleTime => "admin.setIdleTime",
            Permission::SetJobPriority => "admin.setJobPriority",
        }
    }
}

pub trait AccessPolicy: Send + Sync {
    fn permits(&self, token: Option<&str>, permission: Permission) -> bool;
}

/// Grants everything to everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn permits(&self, _token: Option<&str>, _permission: Permission) -> bool {
        true
    }
}

/// Maps bearer tokens to permission patterns.
///
/// A pattern is an exact permission name, `*` for everything, or a prefix ending in
/// `.*` (`admin.*` grants every `admin.` permission). Requests without a known token
/// get nothing.
#[derive(Debug, Default, Clone)]
pub struct TokenPolicy {
    grants: HashMap<String, Vec<String>>,
}

impl TokenPolicy {
    pub fn new(grants: HashMap<String, Vec<String>>) -> Self {
        Self { grants }
    }

    pub fn grant(&mut self, token: &str, pattern: &str) {
        self.grants
            .entry(token.to_string())
            .or_default()
            .push(pattern.to_string());
    }
}

fn pattern_matches(pattern: &str, permission: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with('.') => permission.starts_with(prefix),
        _ => pattern == permission,
    }
}

impl AccessPolicy for TokenPolicy {
    fn permits(&self, token: Option<&str>, permission: Permission) -> bool {
        token
            .and_then(|token| self.grants.get(token))
            .is_some_and(|patterns| {
                patterns
                    .iter()
                    .any(|pattern| pattern_matches(pattern, permission.as_str()))
            })
    }
}

/// The coordinator as remote callers see it.
pub struct SecuredCoordinator {
    coordinator: Arc<JobCoordinator>,
    policy: Arc<dyn AccessPolicy>,
}

type Result<T> = std::result::Result<T, CoordinatorError>;

impl SecuredCoordinator {
    pub fn new(coordinator: Arc<JobCoordinator>, policy: Arc<dyn AccessPolicy>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            policy,
        })
    }

    pub fn coordinator(&self) -> &Arc<JobCoordinator> {
        &self.coordinator
    }

    fn authorize(&self, token: Option<&str>, permission: Permission) -> Result<()> {
        if self.policy.permits(token, permission) {
            return Ok(());
        }
        tracing::warn!("Denied '{}' to caller", permission.as_str());
        Err(CoordinatorError::Unauthorized {
            permission: permission.as_str().to_string(),
        })
    }

    pub fn create_job(&self, token: Option<&str>, description: &str) -> Result<JobId> {
        self.authorize(token, Permission::SubmitJob)?;
        Ok(self.coordinator.create_job(description))
    }

    pub fn submit_job(
        &self,
        token: Option<&str>,
        submission: &JobSubmission,
        target: SubmitTarget,
    ) -> Result<JobId> {
        self.authorize(token, Permission::SubmitJob)?;
        self.coordinator.submit_job(submission, target)
    }

    pub fn cancel_job(&self, token: Option<&str>, job_id: JobId) -> Result<()> {
        self.authorize(token, Permission::CancelJob)?;
        self.coordinator.cancel_job(job_id)
    }

    pub fn set_job_priority(&self, token: Option<&str>, job_id: JobId, priority: i32) -> Result<()> {
        self.authorize(token, Permission::SetJobPriority)?;
        self.coordinator.set_job_priority(job_id, priority)
    }

    pub fn job_status(&self, token: Option<&str>, job_id: JobId) -> Result<JobStatusReport> {
        self.authorize(token, Permission::SubmitJob)?;
        self.coordinator.job_status(job_id)
    }

    pub fn get_task_worker(&self, token: Option<&str>, job_id: JobId) -> Result<WorkerSpec> {
        self.authorize(token, Permission::Worker)?;
        self.coordinator.get_task_worker(job_id)
    }

    pub fn request_task(&self, token: Option<&str>) -> Result<TaskDescription> {
        self.authorize(token, Permission::Worker)?;
        Ok(self.coordinator.request_task())
    }

    pub fn submit_task_results(
        &self,
        token: Option<&str>,
        job_id: JobId,
        task_id: TaskId,
        results: Value,
    ) -> Result<()> {
        self.authorize(token, Permission::Worker)?;
        self.coordinator.submit_task_results(job_id, task_id, results)
    }

    pub fn get_artifact_digest(
        &self,
        token: Option<&str>,
        name: &str,
        job_id: Option<JobId>,
    ) -> Result<Option<ArtifactDigest>> {
        self.authorize(token, Permission::Worker)?;
        self.coordinator.get_artifact_digest(name, job_id)
    }

    pub fn get_artifact_definition(
        &self,
        token: Option<&str>,
        name: &str,
        job_id: JobId,
    ) -> Result<Vec<u8>> {
        self.authorize(token, Permission::Worker)?;
        self.coordinator.get_artifact_definition(name, job_id)
    }

    pub fn set_artifact_definition(
        &self,
        token: Option<&str>,
        name: &str,
        job_id: Option<JobId>,
        bytes: &[u8],
    ) -> Result<WriteOutcome> {
        let permission = match job_id {
            Some(_) => Permission::SetJobArtifactDefinition,
            None => Permission::SetArtifactDefinition,
        };
        self.authorize(token, permission)?;
        self.coordinator.set_artifact_definition(name, job_id, bytes)
    }

    pub fn set_idle_time(&self, token: Option<&str>, seconds: u64) -> Result<()> {
        self.authorize(token, Permission::SetIdleTime)?;
        self.coordinator.set_idle_time(seconds);
        Ok(())
    }
}
