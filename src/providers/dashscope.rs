// src/providers/dashscope.rs
//! DashScope adapter for the three generation capabilities.
//!
//! Text and image are single request/response calls. Video is a three-phase
//! protocol: submit an async task, poll its status on a fixed interval, then
//! resolve the returned file handle to a download URL. The poll loop is
//! bounded; exhausting it surfaces a distinct timeout error rather than
//! spinning forever.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::providers::{ImageGeneration, MediaFetcher, TextGeneration, VideoGeneration};

const TEXT_API: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/text-generation/generation";
const IMAGE_API: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/text2image/image-synthesis";
const VIDEO_API: &str =
    "https://dashscope.aliyuncs.com/api/v1/services/aigc/video-generation/video-synthesis";
const TASKS_API: &str = "https://dashscope.aliyuncs.com/api/v1/tasks";
const FILES_API: &str = "https://dashscope.aliyuncs.com/api/v1/files";

const TEXT_MODEL: &str = "qwen-plus";
const IMAGE_MODEL: &str = "wanx-v1";
const VIDEO_MODEL: &str = "wanx-kf2v";

const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// 120 attempts at 5s = 10 minutes before a stuck task times out.
const MAX_POLL_ATTEMPTS: u32 = 120;

#[derive(Debug, Clone)]
pub struct DashScopeClient {
    client: Client,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct TextResponse {
    output: TextOutput,
}

#[derive(Debug, Deserialize)]
struct TextOutput {
    choices: Vec<TextChoice>,
}

#[derive(Debug, Deserialize)]
struct TextChoice {
    message: TextMessage,
}

#[derive(Debug, Deserialize)]
struct TextMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    output: ImageOutput,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ImageOutput {
    #[serde(default)]
    results: Vec<ImageResult>,
}

#[derive(Debug, Deserialize)]
struct ImageResult {
    url: String,
}

#[derive(Debug, Deserialize)]
struct TaskSubmitResponse {
    output: TaskSubmitOutput,
}

#[derive(Debug, Deserialize)]
struct TaskSubmitOutput {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    output: TaskStatusOutput,
}

#[derive(Debug, Deserialize)]
struct TaskStatusOutput {
    task_status: String,
    #[serde(default)]
    video_file_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileLookupResponse {
    url: String,
}

impl DashScopeClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");
        Self { client, api_key }
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    async fn provider_error(response: reqwest::Response, what: &str) -> AppError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        AppError::Provider(format!("{} failed with HTTP {}: {}", what, status, body))
    }

    /// Poll a submitted task until it reaches a terminal status, returning
    /// the finished file handle.
    async fn wait_for_video_task(&self, task_id: &str) -> Result<String> {
        for attempt in 1..=MAX_POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;

            let response = self
                .client
                .get(format!("{}/{}", TASKS_API, task_id))
                .header("Authorization", self.auth())
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "Task {} status query failed (HTTP {}): {}",
                    task_id, status, body
                );
                continue;
            }

            let task: TaskStatusResponse = response.json().await?;
            match task.output.task_status.as_str() {
                "SUCCEEDED" => {
                    return task.output.video_file_id.ok_or_else(|| {
                        AppError::Provider(format!(
                            "video task {} succeeded but returned no file handle",
                            task_id
                        ))
                    });
                }
                "FAILED" => {
                    return Err(AppError::Provider(format!(
                        "video task {} failed: {}",
                        task_id,
                        task.output.message.unwrap_or_else(|| "no detail".to_string())
                    )));
                }
                other => {
                    info!(
                        "Video task {} status: {} (attempt {}/{})",
                        task_id, other, attempt, MAX_POLL_ATTEMPTS
                    );
                }
            }
        }

        Err(AppError::Timeout {
            attempts: MAX_POLL_ATTEMPTS,
        })
    }

    /// Resolve a finished task's file handle to a downloadable URL.
    async fn resolve_file_url(&self, file_id: &str) -> Result<String> {
        let response = self
            .client
            .get(format!("{}/{}", FILES_API, file_id))
            .header("Authorization", self.auth())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error(response, "file URL lookup").await);
        }

        let lookup: FileLookupResponse = response.json().await?;
        Ok(lookup.url)
    }
}

#[async_trait]
impl TextGeneration for DashScopeClient {
    async fn generate_text(&self, prompt: &str) -> Result<String> {
        let request_body = json!({
            "model": TEXT_MODEL,
            "input": {
                "messages": [
                    { "role": "user", "content": prompt }
                ]
            },
            "parameters": { "result_format": "message" }
        });

        let response = self
            .client
            .post(TEXT_API)
            .header("Authorization", self.auth())
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error(response, "text generation").await);
        }

        let body: TextResponse = response.json().await?;
        let content = body
            .output
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                AppError::Provider("text generation returned no choices".to_string())
            })?;
        Ok(content)
    }
}

#[async_trait]
impl ImageGeneration for DashScopeClient {
    async fn generate_image(
        &self,
        prompt: &str,
        reference_image_url: Option<&str>,
    ) -> Result<String> {
        let mut input = json!({ "prompt": prompt });
        if let Some(reference) = reference_image_url {
            input["ref_img"] = json!(reference);
        }
        let request_body = json!({
            "model": IMAGE_MODEL,
            "input": input,
            "parameters": { "size": "1280*720", "n": 1 }
        });

        let response = self
            .client
            .post(IMAGE_API)
            .header("Authorization", self.auth())
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error(response, "image generation").await);
        }

        let body: ImageResponse = response.json().await?;
        if let Some(code) = body.code.filter(|c| !c.is_empty()) {
            return Err(AppError::Provider(format!(
                "image generation returned code {}: {}",
                code,
                body.message.unwrap_or_default()
            )));
        }
        body.output
            .results
            .into_iter()
            .next()
            .map(|r| r.url)
            .ok_or_else(|| AppError::Provider("image generation returned no results".to_string()))
    }
}

#[async_trait]
impl VideoGeneration for DashScopeClient {
    async fn generate_video(
        &self,
        prompt: &str,
        first_frame_url: &str,
        last_frame_url: &str,
    ) -> Result<String> {
        let request_body = json!({
            "model": VIDEO_MODEL,
            "input": {
                "prompt": prompt,
                "first_frame_url": first_frame_url,
                "last_frame_url": last_frame_url
            },
            "parameters": { "resolution": "720P" }
        });

        let response = self
            .client
            .post(VIDEO_API)
            .header("Authorization", self.auth())
            .header("Content-Type", "application/json")
            .header("X-DashScope-Async", "enable")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::provider_error(response, "video task submission").await);
        }

        let submit: TaskSubmitResponse = response.json().await?;
        let task_id = submit.output.task_id;
        info!("Video generation task submitted: {}", task_id);

        let file_id = self.wait_for_video_task(&task_id).await?;
        self.resolve_file_url(&file_id).await
    }
}

#[async_trait]
impl MediaFetcher for DashScopeClient {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Self::provider_error(response, "media download").await);
        }
        Ok(response.bytes().await?.to_vec())
    }
}
