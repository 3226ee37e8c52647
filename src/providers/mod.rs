// src/providers/mod.rs
//! Generation capability seams.
//!
//! The pipeline only sees these traits; the concrete DashScope adapter lives
//! in [`dashscope`]. Tests substitute instrumented mocks.

use async_trait::async_trait;

use crate::error::Result;

pub mod dashscope;

pub use dashscope::DashScopeClient;

/// Text generation: one prompt in, the raw model response out.
#[async_trait]
pub trait TextGeneration: Send + Sync {
    async fn generate_text(&self, prompt: &str) -> Result<String>;
}

/// Image generation: returns the URL of a single generated image. An
/// optional reference image URL keeps the subject consistent across calls.
#[async_trait]
pub trait ImageGeneration: Send + Sync {
    async fn generate_image(&self, prompt: &str, reference_image_url: Option<&str>)
        -> Result<String>;
}

/// Video generation between two boundary frames: returns the URL of the
/// finished clip. Implementations may take minutes (submit/poll/resolve).
#[async_trait]
pub trait VideoGeneration: Send + Sync {
    async fn generate_video(
        &self,
        prompt: &str,
        first_frame_url: &str,
        last_frame_url: &str,
    ) -> Result<String>;
}

/// Byte download seam, so artifact fetching is mockable alongside the
/// generation calls.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}
