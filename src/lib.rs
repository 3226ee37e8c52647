// lib.rs - Main library file that exports all modules
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod runs;
pub mod script;
pub mod store;

use pipeline::Pipeline;
use runs::RunTracker;
use store::ProjectStore;

/// Shared application state: the artifact store, the per-project run
/// tracker, and the pipeline with its capability handles.
pub struct AppState {
    pub store: ProjectStore,
    pub runs: RunTracker,
    pub pipeline: Pipeline,
}
