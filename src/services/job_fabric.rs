//! In-process job registry and session sweep (C10, spec §4.10). Progress is
//! advisory, not a correctness signal; cancellation is cooperative, via a
//! flag the long-running task checks at its own natural checkpoints (§5:
//! "in-flight attachment downloads complete and then check").

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Job, JobStatus, JobType};
use crate::utils::scheduled_executor::ScheduledTask;

#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<DashMap<Uuid, Job>>,
    cancel_flags: Arc<DashMap<Uuid, Arc<AtomicBool>>>,
}

impl JobRegistry {
    pub fn create(&self, job_type: JobType) -> Uuid {
        let id = Uuid::new_v4();
        let job = Job {
            id,
            job_type,
            status: JobStatus::Queued,
            progress: 0,
            progress_message: None,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.jobs.insert(id, job);
        self.cancel_flags.insert(id, Arc::new(AtomicBool::new(false)));
        id
    }

    pub fn mark_processing(&self, id: Uuid) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.status = JobStatus::Processing;
        }
    }

    pub fn set_progress(&self, id: Uuid, progress: u8, message: impl Into<String>) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.progress = progress.min(100);
            job.progress_message = Some(message.into());
        }
    }

    pub fn complete(&self, id: Uuid, result: serde_json::Value) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.result = Some(result);
            job.completed_at = Some(Utc::now());
        }
    }

    pub fn fail(&self, id: Uuid, error: impl Into<String>) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.status = JobStatus::Failed;
            job.error = Some(error.into());
            job.completed_at = Some(Utc::now());
        }
    }

    /// Requests cooperative cancellation; returns `false` if the job is
    /// unknown or already terminal.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.jobs.get(&id) {
            Some(job) if matches!(job.status, JobStatus::Queued | JobStatus::Processing) => {
                if let Some(flag) = self.cancel_flags.get(&id) {
                    flag.store(true, Ordering::Relaxed);
                }
                true
            },
            _ => false,
        }
    }

    pub fn is_cancelled(&self, id: Uuid) -> bool {
        self.cancel_flags.get(&id).map(|f| f.load(Ordering::Relaxed)).unwrap_or(false)
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    pub fn list(&self) -> Vec<Job> {
        self.jobs.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Hourly (default) sweeper that hard-deletes expired sessions on the admin
/// pool, without an RLS context (§4.10, §6).
pub struct SessionSweepTask {
    admin_pool: PgPool,
}

impl SessionSweepTask {
    pub fn new(admin_pool: PgPool) -> Self {
        Self { admin_pool }
    }
}

impl ScheduledTask for SessionSweepTask {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM sessions WHERE expires_at < now()")
                .execute(&self.admin_pool)
                .await?;
            tracing::info!(deleted = result.rows_affected(), "session sweep completed");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_lifecycle_tracks_progress_and_completion() {
        let registry = JobRegistry::default();
        let id = registry.create(JobType::ReportIngest);
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Queued);

        registry.mark_processing(id);
        registry.set_progress(id, 50, "halfway");
        let job = registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 50);

        registry.complete(id, serde_json::json!({"ok": true}));
        let job = registry.get(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn cancel_is_cooperative_and_terminal_safe() {
        let registry = JobRegistry::default();
        let id = registry.create(JobType::GmailSweep);
        assert!(registry.cancel(id));
        assert!(registry.is_cancelled(id));

        registry.complete(id, serde_json::json!(null));
        assert!(!registry.cancel(id));
    }

    #[test]
    fn unknown_job_cancel_returns_false() {
        let registry = JobRegistry::default();
        assert!(!registry.cancel(Uuid::new_v4()));
    }
}
