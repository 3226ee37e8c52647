// src/pipeline/mod.rs
//! The six-stage generation pipeline.
//!
//! Each step reads its inputs from the project directory, makes zero or more
//! capability calls, and writes its outputs back. Steps 4 and 5 fan out one
//! call per keyframe/segment, capped at five in flight; every dispatched
//! call is awaited before the step settles, and the first failure aborts the
//! step without cancelling work already in flight. Partial downloads are
//! left on disk; a re-run overwrites them.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::info;

use crate::error::{AppError, Result};
use crate::providers::{ImageGeneration, MediaFetcher, TextGeneration, VideoGeneration};
use crate::script::{self, MAX_SEGMENTS, MIN_SEGMENTS};
use crate::store::{self, ProjectStore};

/// Hard cap on simultaneous outbound generation calls within a step.
const MAX_CONCURRENT_GENERATIONS: usize = 5;

const CONCAT_MANIFEST: &str = "concat.txt";

pub struct Pipeline {
    text: Arc<dyn TextGeneration>,
    image: Arc<dyn ImageGeneration>,
    video: Arc<dyn VideoGeneration>,
    fetcher: Arc<dyn MediaFetcher>,
}

impl Pipeline {
    pub fn new(
        text: Arc<dyn TextGeneration>,
        image: Arc<dyn ImageGeneration>,
        video: Arc<dyn VideoGeneration>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        Self {
            text,
            image,
            video,
            fetcher,
        }
    }

    /// Run one pipeline step for a project. The caller is responsible for
    /// the per-project execution guard; this function only checks that the
    /// inputs it needs are on disk.
    pub async fn run_step(
        &self,
        store: &ProjectStore,
        id: &str,
        step: u32,
        description: Option<&str>,
    ) -> Result<()> {
        match step {
            1 => {
                let description = description.ok_or_else(|| {
                    AppError::Validation("description is required for step 1".to_string())
                })?;
                self.step_input(store, id, description).await
            }
            2 => self.step_script(store, id).await,
            3 => self.step_character(store, id).await,
            4 => self.step_keyframes(store, id).await,
            5 => self.step_segments(store, id).await,
            6 => self.step_stitch(store, id).await,
            other => Err(AppError::Validation(format!(
                "step must be between 1 and 6, got {}",
                other
            ))),
        }
    }

    /// Step 1: persist the description verbatim.
    async fn step_input(&self, store: &ProjectStore, id: &str, description: &str) -> Result<()> {
        store.write_description(id, description).await?;
        info!("Project {}: description written", id);
        Ok(())
    }

    /// Step 2: one text-generation call, parsed defensively and validated
    /// before anything is persisted.
    async fn step_script(&self, store: &ProjectStore, id: &str) -> Result<()> {
        let description = store.read_description(id).await?;
        let prompt = build_script_prompt(&description);
        let response = self.text.generate_text(&prompt).await?;
        let script = script::parse_script_response(&response)?;
        store.write_script(id, &script).await?;
        info!(
            "Project {}: script written ({} segments, {} keyframes)",
            id,
            script.segments.len(),
            script.keyframes.len()
        );
        Ok(())
    }

    /// Step 3: generate the character reference image. The source URL is
    /// persisted separately because step 4 feeds it back to the provider as
    /// a subject reference.
    async fn step_character(&self, store: &ProjectStore, id: &str) -> Result<()> {
        let script = store.read_script(id).await?;
        let url = self
            .image
            .generate_image(&script.main_character_description, None)
            .await?;
        let bytes = self.fetcher.fetch(&url).await?;
        store.write_artifact(id, store::CHARACTER_IMAGE, &bytes).await?;
        store.write_character_url(id, &url).await?;
        info!("Project {}: character reference written", id);
        Ok(())
    }

    /// Step 4: one image call per keyframe description, five in flight at
    /// most, all using the character URL as subject reference.
    async fn step_keyframes(&self, store: &ProjectStore, id: &str) -> Result<()> {
        let script = store.read_script(id).await?;
        if script.keyframes.is_empty() {
            return Err(AppError::Validation(format!(
                "project {} script has no keyframes; re-run step 2",
                id
            )));
        }
        let reference = store.read_character_url(id).await?;

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_GENERATIONS));
        let calls = script.keyframes.iter().enumerate().map(|(i, description)| {
            let semaphore = semaphore.clone();
            let image = self.image.clone();
            let reference = reference.clone();
            let description = description.clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| AppError::Provider("concurrency limiter closed".to_string()))?;
                let url = image.generate_image(&description, Some(&reference)).await?;
                Ok::<(usize, String), AppError>((i, url))
            }
        });

        let mut urls = vec![None; script.keyframes.len()];
        let mut first_error = None;
        for result in join_all(calls).await {
            match result {
                Ok((i, url)) => urls[i] = Some(url),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        // All slots filled once no call failed.
        let urls: Vec<String> = urls.into_iter().flatten().collect();

        for (i, url) in urls.iter().enumerate() {
            let bytes = self.fetcher.fetch(url).await?;
            store
                .write_artifact(id, &store::keyframe_image(i), &bytes)
                .await?;
        }
        store.write_keyframe_urls(id, &urls).await?;
        info!("Project {}: {} keyframes written", id, urls.len());
        Ok(())
    }

    /// Step 5: one video call per segment, bounded the same way. Segment i
    /// is bracketed by keyframes i and i+1 so consecutive clips share their
    /// boundary frame.
    async fn step_segments(&self, store: &ProjectStore, id: &str) -> Result<()> {
        let script = store.read_script(id).await?;
        let keyframe_urls = store.read_keyframe_urls(id).await?;
        if keyframe_urls.len() != script.segments.len() + 1 {
            return Err(AppError::Validation(format!(
                "project {} has {} keyframe URLs for {} segments; re-run step 4",
                id,
                keyframe_urls.len(),
                script.segments.len()
            )));
        }

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_GENERATIONS));
        let calls = script.segments.iter().enumerate().map(|(i, segment)| {
            let semaphore = semaphore.clone();
            let video = self.video.clone();
            let prompt = segment.script.clone();
            let first_frame = keyframe_urls[i].clone();
            let last_frame = keyframe_urls[i + 1].clone();
            async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| AppError::Provider("concurrency limiter closed".to_string()))?;
                let url = video
                    .generate_video(&prompt, &first_frame, &last_frame)
                    .await?;
                Ok::<(usize, String), AppError>((i, url))
            }
        });

        let mut urls = vec![None; script.segments.len()];
        let mut first_error = None;
        for result in join_all(calls).await {
            match result {
                Ok((i, url)) => urls[i] = Some(url),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        let urls: Vec<String> = urls.into_iter().flatten().collect();

        for (i, url) in urls.iter().enumerate() {
            let bytes = self.fetcher.fetch(url).await?;
            store
                .write_artifact(id, &store::segment_video(i + 1), &bytes)
                .await?;
        }
        info!("Project {}: {} segments written", id, urls.len());
        Ok(())
    }

    /// Step 6: concatenate the segment files into the final movie with the
    /// ffmpeg concat demuxer. Blocks on the subprocess.
    async fn step_stitch(&self, store: &ProjectStore, id: &str) -> Result<()> {
        let script = store.read_script(id).await?;
        let count = script.segment_count();
        for i in 1..=count {
            if !store.artifact_exists(id, &store::segment_video(i)).await {
                return Err(AppError::Storage(format!(
                    "project {} is missing {}; re-run step 5",
                    id,
                    store::segment_video(i)
                )));
            }
        }

        let manifest = build_concat_manifest(count);
        store
            .write_artifact(id, CONCAT_MANIFEST, manifest.as_bytes())
            .await?;

        let dir = store.project_dir(id);
        let result = run_ffmpeg_concat(&dir, CONCAT_MANIFEST, store::MOVIE_FILE);
        tokio::fs::remove_file(dir.join(CONCAT_MANIFEST)).await.ok();
        result?;

        info!("Project {}: movie written from {} segments", id, count);
        Ok(())
    }
}

/// Prompt for step 2. The shape instructions mirror the Script model; the
/// response is still parsed defensively because models do not always comply.
fn build_script_prompt(description: &str) -> String {
    format!(
        r#"You are writing the shooting script for a short film made of one continuous take.

Return a single JSON object with exactly these fields:
- "mainCharacterDescription": a full-body visual description of the protagonist
- "keyframes": an array of still-frame visual descriptions marking the segment boundaries; the first is the opening frame, the last is the ending frame
- "segments": an array of objects of the form {{"script": "..."}} describing the action between two consecutive keyframes

Use between {} and {} segments, and exactly one more keyframe than segments.
Keep the protagonist visually consistent across all keyframes.
Respond with the JSON object only, no commentary.

Film description:
{}"#,
        MIN_SEGMENTS, MAX_SEGMENTS, description
    )
}

/// Concat-demuxer file list for `segment1.mp4`..`segmentN.mp4`.
fn build_concat_manifest(segment_count: usize) -> String {
    let mut manifest = String::new();
    for i in 1..=segment_count {
        manifest.push_str(&format!("file '{}'\n", store::segment_video(i)));
    }
    manifest
}

fn run_ffmpeg_concat(project_dir: &Path, manifest: &str, output: &str) -> Result<()> {
    let output_result = Command::new("ffmpeg")
        .current_dir(project_dir)
        .args([
            "-y", "-f", "concat", "-safe", "0", "-i", manifest, "-c", "copy", output,
        ])
        .output()
        .map_err(|e| AppError::Ffmpeg(format!("failed to execute ffmpeg: {}", e)))?;

    if !output_result.status.success() {
        let stderr = String::from_utf8_lossy(&output_result.stderr);
        return Err(AppError::Ffmpeg(format!("concat failed: {}", stderr)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn script_json(segments: usize) -> String {
        let keyframes: Vec<String> = (0..=segments)
            .map(|i| format!("\"still frame {}\"", i))
            .collect();
        let segs: Vec<String> = (0..segments)
            .map(|i| format!("{{\"script\": \"beat {}\"}}", i))
            .collect();
        format!(
            "{{\"mainCharacterDescription\": \"a lone astronaut in a dusty suit\", \"keyframes\": [{}], \"segments\": [{}]}}",
            keyframes.join(", "),
            segs.join(", ")
        )
    }

    struct ScriptedText {
        response: String,
    }

    #[async_trait]
    impl TextGeneration for ScriptedText {
        async fn generate_text(&self, _prompt: &str) -> Result<String> {
            Ok(self.response.clone())
        }
    }

    /// Image mock that counts concurrent entries and hands out one URL per
    /// call, failing on the indices listed in `fail_on`.
    struct CountingImage {
        current: AtomicUsize,
        max_seen: AtomicUsize,
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    impl CountingImage {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                fail_on: Vec::new(),
            }
        }

        fn failing_on(indices: Vec<usize>) -> Self {
            Self {
                fail_on: indices,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl ImageGeneration for CountingImage {
        async fn generate_image(
            &self,
            prompt: &str,
            reference_image_url: Option<&str>,
        ) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let in_flight = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(in_flight, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(25)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if self.fail_on.contains(&call) {
                return Err(AppError::Provider(format!("image call {} rejected", call)));
            }
            Ok(format!(
                "http://images.test/{}/{}?ref={}",
                call,
                prompt.len(),
                reference_image_url.is_some()
            ))
        }
    }

    /// Video mock recording (prompt, first, last) per call.
    struct RecordingVideo {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingVideo {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl VideoGeneration for RecordingVideo {
        async fn generate_video(
            &self,
            prompt: &str,
            first_frame_url: &str,
            last_frame_url: &str,
        ) -> Result<String> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((
                prompt.to_string(),
                first_frame_url.to_string(),
                last_frame_url.to_string(),
            ));
            Ok(format!("http://videos.test/{}", calls.len()))
        }
    }

    /// Fetcher that returns the URL itself as the file body, so tests can
    /// see which URL each artifact came from.
    struct EchoFetcher;

    #[async_trait]
    impl MediaFetcher for EchoFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            Ok(url.as_bytes().to_vec())
        }
    }

    fn pipeline_with(
        text_response: &str,
        image: Arc<CountingImage>,
        video: Arc<RecordingVideo>,
    ) -> Pipeline {
        Pipeline::new(
            Arc::new(ScriptedText {
                response: text_response.to_string(),
            }),
            image,
            video,
            Arc::new(EchoFetcher),
        )
    }

    async fn read_artifact(store: &ProjectStore, id: &str, name: &str) -> String {
        let path = store.project_dir(id).join(name);
        String::from_utf8(tokio::fs::read(path).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn end_to_end_through_step_five() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store
            .create_project("a lone astronaut walks across a red desert")
            .await
            .unwrap();

        let wrapped = format!("Sure! Here is the script:\n{}\nHope you like it.", script_json(4));
        let video = Arc::new(RecordingVideo::new());
        let pipeline = pipeline_with(&wrapped, Arc::new(CountingImage::new()), video.clone());

        pipeline.run_step(&store, &id, 2, None).await.unwrap();
        pipeline.run_step(&store, &id, 3, None).await.unwrap();
        pipeline.run_step(&store, &id, 4, None).await.unwrap();
        pipeline.run_step(&store, &id, 5, None).await.unwrap();

        let artifacts = store.list_artifacts(&id).await.unwrap();
        for expected in [
            "input.txt",
            "script.json",
            "character.jpg",
            "character_url.txt",
            "keyframes.json",
        ] {
            assert!(artifacts.contains(&expected.to_string()), "missing {}", expected);
        }
        for i in 0..=4 {
            assert!(artifacts.contains(&format!("keyframe{}.jpg", i)));
        }
        for i in 1..=4 {
            assert!(artifacts.contains(&format!("segment{}.mp4", i)));
        }

        let status = crate::progress::status(artifacts, None);
        assert_eq!(status.completed_step, 5);

        // Segment i is bracketed by keyframe URLs i and i+1.
        let keyframe_urls = store.read_keyframe_urls(&id).await.unwrap();
        let calls = video.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        for (i, (prompt, first, last)) in calls.iter().enumerate() {
            assert_eq!(prompt, &format!("beat {}", i));
            assert_eq!(first, &keyframe_urls[i]);
            assert_eq!(last, &keyframe_urls[i + 1]);
        }
    }

    #[tokio::test]
    async fn keyframe_fan_out_never_exceeds_five_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("desert").await.unwrap();

        // 6 segments means 7 keyframe calls against a 5-permit limiter.
        let image = Arc::new(CountingImage::new());
        let pipeline = pipeline_with(&script_json(6), image.clone(), Arc::new(RecordingVideo::new()));
        pipeline.run_step(&store, &id, 2, None).await.unwrap();
        pipeline.run_step(&store, &id, 3, None).await.unwrap();
        pipeline.run_step(&store, &id, 4, None).await.unwrap();

        assert_eq!(image.calls.load(Ordering::SeqCst), 8); // 1 character + 7 keyframes
        assert_eq!(image.max_seen.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn keyframe_failure_aborts_after_awaiting_all_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("desert").await.unwrap();

        // Call 0 is the character image; fail the third keyframe call.
        let image = Arc::new(CountingImage::failing_on(vec![3]));
        let pipeline = pipeline_with(&script_json(4), image.clone(), Arc::new(RecordingVideo::new()));
        pipeline.run_step(&store, &id, 2, None).await.unwrap();
        pipeline.run_step(&store, &id, 3, None).await.unwrap();

        let err = pipeline.run_step(&store, &id, 4, None).await.unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));
        // All five keyframe calls were still dispatched and awaited.
        assert_eq!(image.calls.load(Ordering::SeqCst), 6);
        assert!(!store.artifact_exists(&id, store::KEYFRAME_URLS_FILE).await);
    }

    #[tokio::test]
    async fn rerunning_step_three_overwrites_without_touching_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("desert").await.unwrap();

        let image = Arc::new(CountingImage::new());
        let pipeline = pipeline_with(&script_json(3), image.clone(), Arc::new(RecordingVideo::new()));
        pipeline.run_step(&store, &id, 2, None).await.unwrap();
        pipeline.run_step(&store, &id, 3, None).await.unwrap();
        let first_url = store.read_character_url(&id).await.unwrap();

        // Simulate a prior step-4 output that a step-3 re-run must not touch.
        store
            .write_artifact(&id, &store::keyframe_image(0), b"stale keyframe")
            .await
            .unwrap();

        pipeline.run_step(&store, &id, 3, None).await.unwrap();
        let second_url = store.read_character_url(&id).await.unwrap();
        assert_ne!(first_url, second_url);
        assert_eq!(read_artifact(&store, &id, store::CHARACTER_IMAGE).await, second_url);
        assert_eq!(
            read_artifact(&store, &id, &store::keyframe_image(0)).await,
            "stale keyframe"
        );
    }

    #[tokio::test]
    async fn steps_fail_with_storage_errors_when_upstream_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("desert").await.unwrap();

        let pipeline = pipeline_with(
            &script_json(3),
            Arc::new(CountingImage::new()),
            Arc::new(RecordingVideo::new()),
        );

        let err = pipeline.run_step(&store, &id, 3, None).await.unwrap_err();
        assert!(err.to_string().contains("re-run step 2"));
        let err = pipeline.run_step(&store, &id, 5, None).await.unwrap_err();
        assert!(err.to_string().contains("re-run step 2"));
    }

    #[tokio::test]
    async fn out_of_range_step_is_a_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("desert").await.unwrap();
        let pipeline = pipeline_with(
            &script_json(3),
            Arc::new(CountingImage::new()),
            Arc::new(RecordingVideo::new()),
        );
        let err = pipeline.run_step(&store, &id, 7, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let err = pipeline.run_step(&store, &id, 0, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn step_one_requires_a_description() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("desert").await.unwrap();
        let pipeline = pipeline_with(
            &script_json(3),
            Arc::new(CountingImage::new()),
            Arc::new(RecordingVideo::new()),
        );
        let err = pipeline.run_step(&store, &id, 1, None).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        pipeline
            .run_step(&store, &id, 1, Some("a new description"))
            .await
            .unwrap();
        assert_eq!(store.read_description(&id).await.unwrap(), "a new description");
    }

    #[test]
    fn concat_manifest_lists_segments_in_order() {
        assert_eq!(
            build_concat_manifest(3),
            "file 'segment1.mp4'\nfile 'segment2.mp4'\nfile 'segment3.mp4'\n"
        );
        assert_eq!(build_concat_manifest(0), "");
    }
}
