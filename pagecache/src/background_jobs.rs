//! Per-file accounting of outstanding background jobs.
//!
//! Every job the cache dispatches on behalf of a file (prefetch reads,
//! queued evictions, cleaner work) registers here first. Closing a file
//! flips the manager into the draining state, after which new jobs are
//! refused and the closer blocks until the count reaches zero.

use parking_lot::{Condvar, Mutex};

struct JobsState {
    num_jobs: u32,
    accepting: bool,
}

/// Counter of in-flight background jobs with a draining gate.
pub struct JobManager {
    state: Mutex<JobsState>,
    zero_cond: Condvar,
}

impl JobManager {
    pub fn new() -> Self {
        JobManager {
            state: Mutex::new(JobsState {
                num_jobs: 0,
                accepting: true,
            }),
            zero_cond: Condvar::new(),
        }
    }

    /// Registers a job. Returns `false` once draining has begun; the caller
    /// must then skip the work it was about to dispatch.
    pub fn add_job(&self) -> bool {
        let mut state = self.state.lock();
        if !state.accepting {
            return false;
        }
        state.num_jobs += 1;
        true
    }

    /// Marks one registered job finished and wakes waiters at zero.
    pub fn remove_job(&self) {
        let mut state = self.state.lock();
        assert!(state.num_jobs > 0, "job counter underflow");
        state.num_jobs -= 1;
        if state.num_jobs == 0 {
            self.zero_cond.notify_all();
        }
    }

    /// Blocks until every registered job has finished.
    pub fn wait_for_jobs(&self) {
        let mut state = self.state.lock();
        while state.num_jobs > 0 {
            self.zero_cond.wait(&mut state);
        }
    }

    /// Stops accepting new jobs and waits out the ones in flight.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        state.accepting = false;
        while state.num_jobs > 0 {
            self.zero_cond.wait(&mut state);
        }
    }

    /// Re-opens the gate. Used by the checkpointer, which reuses one
    /// manager across checkpoint cycles.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        assert_eq!(state.num_jobs, 0, "reset with jobs still in flight");
        state.accepting = true;
    }

    #[cfg(test)]
    pub(crate) fn num_jobs(&self) -> u32 {
        self.state.lock().num_jobs
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}
