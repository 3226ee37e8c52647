// src/progress.rs
//! Progress inference: completed step is derived from which artifacts exist,
//! never stored.
//!
//! All six presence checks are evaluated independently and the HIGHEST true
//! one wins. An inconsistent directory (say `movie.mp4` without
//! `script.json`) still reports step 6 — forward artifacts are trusted over
//! backward consistency, so callers must not assume intermediate files exist
//! just because the completed step is high.

use serde::Serialize;

use crate::store;

/// Defining artifact for each step, in step order (index 0 = step 1).
const STEP_ARTIFACTS: [&str; 6] = [
    store::INPUT_FILE,
    store::SCRIPT_FILE,
    store::CHARACTER_IMAGE,
    store::KEYFRAME_URLS_FILE,
    "segment1.mp4",
    store::MOVIE_FILE,
];

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    pub completed_step: u32,
    pub artifacts: Vec<String>,
    pub running_step: Option<u32>,
}

/// Highest step whose defining artifact is present; 0 for an empty listing.
pub fn completed_step(artifacts: &[String]) -> u32 {
    STEP_ARTIFACTS
        .iter()
        .enumerate()
        .filter(|(_, name)| artifacts.iter().any(|a| a == *name))
        .map(|(i, _)| i as u32 + 1)
        .max()
        .unwrap_or(0)
}

pub fn status(artifacts: Vec<String>, running_step: Option<u32>) -> ProjectStatus {
    ProjectStatus {
        completed_step: completed_step(&artifacts),
        artifacts,
        running_step,
    }
}
