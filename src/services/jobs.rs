//! In-memory registry of background extraction jobs.
//!
//! Jobs live in this process only: they are lost on restart and invisible to
//! other instances. Finished jobs are pruned once older than the TTL.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::extraction::{ExtractionJob, ExtractionMode, JobStatus};

#[derive(Clone)]
pub struct ExtractionJobs {
    jobs: Arc<RwLock<HashMap<Uuid, ExtractionJob>>>,
    ttl: Duration,
}

impl ExtractionJobs {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds.min(i64::MAX as u64) as i64),
        }
    }

    /// Register a queued job, pruning expired finished ones first
    pub fn create(
        &self,
        diagram_id: Uuid,
        project_id: Uuid,
        requested_by: Uuid,
        mode: ExtractionMode,
    ) -> ExtractionJob {
        let now = Utc::now();
        let job = ExtractionJob {
            id: Uuid::new_v4(),
            diagram_id,
            project_id,
            requested_by,
            mode,
            status: JobStatus::Queued,
            progress: 0,
            stage: "Queued".to_string(),
            bid_form_id: None,
            line_item_count: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        };

        let mut jobs = self.jobs.write();
        let pruned = prune(&mut jobs, now, self.ttl);
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned finished extraction jobs");
        }
        jobs.insert(job.id, job.clone());
        job
    }

    pub fn get(&self, id: Uuid) -> Option<ExtractionJob> {
        self.jobs.read().get(&id).cloned()
    }

    pub fn start(&self, id: Uuid) {
        self.update(id, |job| {
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.stage = "Starting".to_string();
        });
    }

    /// Progress never moves backwards
    pub fn progress(&self, id: Uuid, percent: u8, stage: &str) {
        self.update(id, |job| {
            job.progress = job.progress.max(percent.min(100));
            job.stage = stage.to_string();
        });
    }

    pub fn complete(&self, id: Uuid, bid_form_id: Uuid, line_item_count: usize) {
        self.update(id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 100;
            job.stage = "Completed".to_string();
            job.bid_form_id = Some(bid_form_id);
            job.line_item_count = Some(line_item_count);
            job.finished_at = Some(Utc::now());
        });
    }

    pub fn fail(&self, id: Uuid, error: impl Into<String>) {
        let error = error.into();
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.stage = "Failed".to_string();
            job.error = Some(error);
            job.finished_at = Some(Utc::now());
        });
    }

    /// Apply a change to a job that has not finished yet
    fn update(&self, id: Uuid, change: impl FnOnce(&mut ExtractionJob)) {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&id) {
            Some(job) if !job.status.is_finished() => change(job),
            Some(_) => tracing::debug!(job_id = %id, "Ignoring update to finished job"),
            None => tracing::debug!(job_id = %id, "Ignoring update to unknown job"),
        }
    }
}

/// Drop finished jobs whose `finished_at` is older than `ttl`
fn prune(jobs: &mut HashMap<Uuid, ExtractionJob>, now: DateTime<Utc>, ttl: Duration) -> usize {
    let before = jobs.len();
    jobs.retain(|_, job| match job.finished_at {
        Some(finished) if job.status.is_finished() => now - finished <= ttl,
        _ => true,
    });
    before - jobs.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ExtractionJobs {
        ExtractionJobs::new(3600)
    }

    #[test]
    fn lifecycle_to_completion() {
        let jobs = registry();
        let job = jobs.create(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), ExtractionMode::Standard);
        assert_eq!(job.status, JobStatus::Queued);

        jobs.start(job.id);
        assert_eq!(jobs.get(job.id).unwrap().status, JobStatus::Running);

        jobs.progress(job.id, 40, "Analyzing");
        jobs.progress(job.id, 20, "Late report");
        let current = jobs.get(job.id).unwrap();
        assert_eq!(current.progress, 40);
        assert_eq!(current.stage, "Late report");

        let form = Uuid::new_v4();
        jobs.complete(job.id, form, 7);
        let done = jobs.get(job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.bid_form_id, Some(form));
        assert_eq!(done.line_item_count, Some(7));
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn finished_jobs_ignore_further_updates() {
        let jobs = registry();
        let job = jobs.create(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), ExtractionMode::Comprehensive);
        jobs.start(job.id);
        jobs.fail(job.id, "vision API unavailable");
        jobs.progress(job.id, 90, "Too late");
        jobs.complete(job.id, Uuid::new_v4(), 1);

        let failed = jobs.get(job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("vision API unavailable"));
        assert!(failed.bid_form_id.is_none());
    }

    #[test]
    fn unknown_jobs_are_none() {
        assert!(registry().get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn prune_drops_only_expired_finished_jobs() {
        let jobs = registry();
        let old = jobs.create(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), ExtractionMode::Standard);
        let running = jobs.create(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), ExtractionMode::Standard);
        jobs.complete(old.id, Uuid::new_v4(), 0);
        jobs.start(running.id);

        let later = Utc::now() + Duration::hours(2);
        let mut map = jobs.jobs.write();
        assert_eq!(prune(&mut map, later, Duration::hours(1)), 1);
        assert!(map.contains_key(&running.id));
        assert!(!map.contains_key(&old.id));
    }
}
