// src/runs.rs
//! Execution guard: at most one pipeline step runs per project at a time.
//!
//! A process-wide map from project id to the step currently executing, held
//! in `AppState` and passed by reference to handlers. A second request for a
//! busy project is rejected immediately (409), never queued. `begin_run`
//! hands back a [`RunGuard`] that removes the entry when dropped, so the
//! project becomes runnable again on every exit path — success, error,
//! panic, or the owning future being dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{AppError, Result};

#[derive(Debug, Default)]
pub struct RunTracker {
    running: Arc<Mutex<HashMap<String, u32>>>,
}

/// Releases the tracker entry for one project on drop.
#[derive(Debug)]
#[must_use = "dropping the guard immediately releases the run entry"]
pub struct RunGuard {
    running: Arc<Mutex<HashMap<String, u32>>>,
    project: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.project);
        }
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `step` is now executing for `project`. Fails with a
    /// conflict if any step is already in flight for that project. The
    /// returned guard removes the entry when dropped.
    pub fn begin_run(&self, project: &str, step: u32) -> Result<RunGuard> {
        let mut running = self.running.lock().expect("run tracker lock poisoned");
        if let Some(active) = running.get(project) {
            return Err(AppError::Conflict {
                project: project.to_string(),
                step: *active,
            });
        }
        running.insert(project.to_string(), step);
        Ok(RunGuard {
            running: self.running.clone(),
            project: project.to_string(),
        })
    }

    pub fn running_step(&self, project: &str) -> Option<u32> {
        let running = self.running.lock().expect("run tracker lock poisoned");
        running.get(project).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_begin_for_same_project_conflicts() {
        let tracker = RunTracker::new();
        let _guard = tracker.begin_run("p1", 2).unwrap();
        let err = tracker.begin_run("p1", 5).unwrap_err();
        match err {
            AppError::Conflict { project, step } => {
                assert_eq!(project, "p1");
                assert_eq!(step, 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn dropping_the_guard_makes_the_project_runnable_again() {
        let tracker = RunTracker::new();
        let guard = tracker.begin_run("p1", 2).unwrap();
        assert_eq!(tracker.running_step("p1"), Some(2));
        drop(guard);
        assert_eq!(tracker.running_step("p1"), None);
        let _guard = tracker.begin_run("p1", 3).unwrap();
        assert_eq!(tracker.running_step("p1"), Some(3));
    }

    #[test]
    fn guard_releases_even_when_its_owner_panics() {
        let tracker = Arc::new(RunTracker::new());
        let panicking = tracker.clone();
        let result = std::thread::spawn(move || {
            let _guard = panicking.begin_run("p1", 4).unwrap();
            panic!("step blew up");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(tracker.running_step("p1"), None);
    }

    #[test]
    fn projects_are_tracked_independently() {
        let tracker = RunTracker::new();
        let _g1 = tracker.begin_run("p1", 4).unwrap();
        let _g2 = tracker.begin_run("p2", 4).unwrap();
        assert_eq!(tracker.running_step("p1"), Some(4));
        assert_eq!(tracker.running_step("p2"), Some(4));
        assert_eq!(tracker.running_step("p3"), None);
    }
}
