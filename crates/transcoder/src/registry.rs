//! Authoritative in-memory store of jobs.
//!
//! Every mutation goes through one mutex and every read returns an owned
//! snapshot, so no caller can observe a half-applied transition.

use std::collections::HashMap;
use std::path::PathBuf;
use log::{debug, error};
use parking_lot::Mutex;
use crate::job::{Job, JobId, JobStatus};
use crate::params::TranscodeParams;

/// Source facts gathered before a job is created
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SourceInfo {
    pub input_size: Option<u64>,
    pub duration: f64,
}

#[derive(Debug, Default)]
struct RegistryState {
    jobs: HashMap<JobId, Job>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a pending job and return a snapshot of it
    pub fn create(
        &self,
        input: PathBuf,
        output: PathBuf,
        params: TranscodeParams,
        source: SourceInfo,
    ) -> Job {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let mut job = Job::new(input, output, params, seq);
        job.input_size = source.input_size;
        job.duration = source.duration;

        state.jobs.insert(job.id.clone(), job.clone());
        job
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.state.lock().jobs.get(id).cloned()
    }

    /// All jobs, newest first
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.admission_key().cmp(&a.admission_key()));
        jobs
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.state.lock().jobs.values().filter(|j| j.status == status).count()
    }

    /// Ids of jobs in any of `statuses`, oldest first
    pub fn ids_with_status(&self, statuses: &[JobStatus]) -> Vec<JobId> {
        let state = self.state.lock();
        let mut matching: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| statuses.contains(&j.status))
            .collect();
        matching.sort_by_key(|j| j.admission_key());
        matching.into_iter().map(|j| j.id.clone()).collect()
    }

    /// Pending job ids in admission order
    pub fn pending_oldest_first(&self) -> Vec<JobId> {
        self.ids_with_status(&[JobStatus::Pending])
    }

    /// True when nothing is pending or running
    pub fn is_idle(&self) -> bool {
        !self.state.lock().jobs.values().any(|j| j.status.is_active())
    }

    /// Move a job from one of `from` to `to`, applying `apply` in the same critical section.
    ///
    /// Returns the state the job was in, or `None` when the job is missing or has
    /// already moved on (a lost race, not an error). Asking for an edge the state
    /// machine does not have is a contract violation.
    pub fn transition<F>(&self, id: &JobId, from: &[JobStatus], to: JobStatus, apply: F) -> Option<JobStatus>
    where
        F: FnOnce(&mut Job),
    {
        for state in from {
            if !state.can_transition_to(to) {
                error!("Job {}: illegal transition requested {} -> {}", id, state, to);
                debug_assert!(false, "illegal transition {} -> {}", state, to);
                return None;
            }
        }

        let mut state = self.state.lock();
        let job = state.jobs.get_mut(id)?;
        let previous = job.status;
        if !from.contains(&previous) {
            debug!("Job {}: skipped {} -> {}, job is {}", id, from_list(from), to, previous);
            return None;
        }

        job.status = to;
        apply(job);
        Some(previous)
    }

    /// Move a job to `to` when `guard` accepts its current snapshot.
    ///
    /// Used by the supervisor, whose guard pins both the state and the attempt
    /// number so a stale run can never finalize a newer one.
    pub fn transition_if<G, F>(&self, id: &JobId, to: JobStatus, guard: G, apply: F) -> bool
    where
        G: FnOnce(&Job) -> bool,
        F: FnOnce(&mut Job),
    {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.get_mut(id) else {
            return false;
        };
        if !guard(job) {
            return false;
        }
        if !job.status.can_transition_to(to) {
            error!("Job {}: illegal transition requested {} -> {}", id, job.status, to);
            debug_assert!(false, "illegal transition {} -> {}", job.status, to);
            return false;
        }

        job.status = to;
        apply(job);
        true
    }

    /// Raise progress of a running attempt; never lowers it
    pub fn update_progress(&self, id: &JobId, attempt: u32, progress: f64) -> bool {
        let mut state = self.state.lock();
        match state.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Running && job.attempt == attempt => {
                let progress = progress.clamp(0.0, 100.0);
                if progress > job.progress {
                    job.progress = progress;
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Record the command line of a running attempt
    pub fn record_command(&self, id: &JobId, attempt: u32, command: String) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(id) {
            if job.attempt == attempt {
                job.command = Some(command);
            }
        }
    }

    /// Current status and attempt, read together
    pub fn status_of(&self, id: &JobId) -> Option<(JobStatus, u32)> {
        self.state.lock().jobs.get(id).map(|j| (j.status, j.attempt))
    }
}

fn from_list(from: &[JobStatus]) -> String {
    from.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use proptest::prelude::*;

    fn create(registry: &JobRegistry, name: &str) -> Job {
        registry.create(
            PathBuf::from(format!("/in/{}.mkv", name)),
            PathBuf::from(format!("/out/{}.mp4", name)),
            TranscodeParams::default(),
            SourceInfo { input_size: Some(1000), duration: 60.0 },
        )
    }

    #[test]
    fn test_create_and_get() {
        let registry = JobRegistry::new();
        let job = create(&registry, "a");
        let stored = registry.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.input_size, Some(1000));
        assert_eq!(stored.duration, 60.0);
        assert!(registry.get(&JobId::from("missing")).is_none());
    }

    #[test]
    fn test_list_is_newest_first_and_pending_oldest_first() {
        let registry = JobRegistry::new();
        let a = create(&registry, "a");
        let b = create(&registry, "b");
        let c = create(&registry, "c");

        let listed: Vec<JobId> = registry.list().into_iter().map(|j| j.id).collect();
        assert_eq!(listed, vec![c.id.clone(), b.id.clone(), a.id.clone()]);
        assert_eq!(registry.pending_oldest_first(), vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_transition_applies_fields_atomically() {
        let registry = JobRegistry::new();
        let job = create(&registry, "a");

        let prev = registry.transition(&job.id, &[JobStatus::Pending], JobStatus::Running, |j| {
            j.attempt += 1;
        });
        assert_eq!(prev, Some(JobStatus::Pending));

        let stored = registry.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.attempt, 1);
    }

    #[test]
    fn test_lost_race_is_a_noop() {
        let registry = JobRegistry::new();
        let job = create(&registry, "a");

        // Selected for admission, then cancelled before the promotion lands
        let selected = registry.pending_oldest_first();
        registry.transition(&job.id, &[JobStatus::Pending], JobStatus::Cancelled, |_| {});

        let promoted = registry.transition(&selected[0], &[JobStatus::Pending], JobStatus::Running, |_| {});
        assert_eq!(promoted, None);
        assert_eq!(registry.get(&job.id).unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_illegal_transition_is_ignored_in_release() {
        let registry = JobRegistry::new();
        let job = create(&registry, "a");
        assert!(registry.transition(&job.id, &[JobStatus::Pending], JobStatus::Completed, |_| {}).is_none());
        assert_eq!(registry.get(&job.id).unwrap().status, JobStatus::Pending);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "illegal transition")]
    fn test_illegal_transition_asserts_in_debug() {
        let registry = JobRegistry::new();
        let job = create(&registry, "a");
        registry.transition(&job.id, &[JobStatus::Completed], JobStatus::Running, |_| {});
    }

    #[test]
    fn test_transition_if_pins_attempt() {
        let registry = JobRegistry::new();
        let job = create(&registry, "a");
        registry.transition(&job.id, &[JobStatus::Pending], JobStatus::Running, |j| j.attempt = 2);

        let stale = registry.transition_if(&job.id, JobStatus::Completed, |j| j.attempt == 1, |_| {});
        assert!(!stale);
        let current = registry.transition_if(&job.id, JobStatus::Completed, |j| j.attempt == 2, |j| j.progress = 100.0);
        assert!(current);
        assert_eq!(registry.get(&job.id).unwrap().progress, 100.0);
    }

    #[test]
    fn test_progress_only_moves_forward_while_running() {
        let registry = JobRegistry::new();
        let job = create(&registry, "a");
        assert!(!registry.update_progress(&job.id, 0, 10.0));

        registry.transition(&job.id, &[JobStatus::Pending], JobStatus::Running, |j| j.attempt = 1);
        assert!(registry.update_progress(&job.id, 1, 40.0));
        assert!(!registry.update_progress(&job.id, 1, 30.0));
        assert!(!registry.update_progress(&job.id, 0, 90.0));
        assert!(registry.update_progress(&job.id, 1, 250.0));
        assert_eq!(registry.get(&job.id).unwrap().progress, 100.0);
    }

    #[test]
    fn test_idle_tracking() {
        let registry = JobRegistry::new();
        assert!(registry.is_idle());
        let job = create(&registry, "a");
        assert!(!registry.is_idle());
        registry.transition(&job.id, &[JobStatus::Pending], JobStatus::Cancelled, |_| {});
        assert!(registry.is_idle());
    }

    #[test]
    fn test_concurrent_promotions_admit_once() {
        let registry = Arc::new(JobRegistry::new());
        let job = create(&registry, "a");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let id = job.id.clone();
                std::thread::spawn(move || {
                    registry
                        .transition(&id, &[JobStatus::Pending], JobStatus::Running, |j| j.attempt += 1)
                        .is_some()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        let stored = registry.get(&job.id).unwrap();
        assert_eq!(stored.attempt, 1);
    }

    proptest! {
        /// Feeding an increasing elapsed-time stream yields non-decreasing progress.
        #[test]
        fn test_progress_monotonic(samples in proptest::collection::vec(0.0f64..150.0, 1..40)) {
            let registry = JobRegistry::new();
            let job = create(&registry, "p");
            registry.transition(&job.id, &[JobStatus::Pending], JobStatus::Running, |j| j.attempt = 1);

            let mut last = 0.0;
            for s in samples {
                registry.update_progress(&job.id, 1, s);
                let now = registry.get(&job.id).unwrap().progress;
                prop_assert!(now >= last);
                prop_assert!(now <= 100.0);
                last = now;
            }
        }
    }
}
