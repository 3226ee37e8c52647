// src/store.rs
//! Filesystem-backed artifact store.
//!
//! One flat directory per project holds every input and output under a fixed
//! naming convention. The directory is the single source of truth: progress
//! is derived from which files exist, nothing else is persisted.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;

use crate::error::{AppError, Result};
use crate::script::Script;

pub const INPUT_FILE: &str = "input.txt";
pub const SCRIPT_FILE: &str = "script.json";
pub const CHARACTER_IMAGE: &str = "character.jpg";
pub const CHARACTER_URL_FILE: &str = "character_url.txt";
pub const KEYFRAME_URLS_FILE: &str = "keyframes.json";
pub const MOVIE_FILE: &str = "movie.mp4";

pub fn keyframe_image(index: usize) -> String {
    format!("keyframe{}.jpg", index)
}

pub fn segment_video(index: usize) -> String {
    format!("segment{}.mp4", index)
}

/// Maps project ids to their artifact directories under a common root.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
}

impl ProjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub async fn project_exists(&self, id: &str) -> bool {
        fs::metadata(self.project_dir(id)).await.is_ok()
    }

    /// Create a project directory and write its description. This is step 1
    /// for a brand-new project; the returned id doubles as the directory name.
    ///
    /// Ids are derived from the creation time (UTC, millisecond precision)
    /// and bumped on collision, so a descending name sort is newest-first.
    pub async fn create_project(&self, description: &str) -> Result<String> {
        fs::create_dir_all(&self.root).await?;

        let base = Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let mut id = base.clone();
        let mut bump = 0u32;
        while self.project_exists(&id).await {
            bump += 1;
            id = format!("{}-{}", base, bump);
        }

        fs::create_dir_all(self.project_dir(&id)).await?;
        self.write_description(&id, description).await?;
        Ok(id)
    }

    /// Project ids, newest first.
    pub async fn list_projects(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            // No root yet means no projects yet.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    /// Filenames present in a project's directory, sorted.
    pub async fn list_artifacts(&self, id: &str) -> Result<Vec<String>> {
        let dir = self.project_dir(id);
        let mut entries = fs::read_dir(&dir).await.map_err(|_| {
            AppError::Storage(format!("project {} not found", id))
        })?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn write_description(&self, id: &str, description: &str) -> Result<()> {
        fs::write(self.project_dir(id).join(INPUT_FILE), description).await?;
        Ok(())
    }

    pub async fn read_description(&self, id: &str) -> Result<String> {
        fs::read_to_string(self.project_dir(id).join(INPUT_FILE))
            .await
            .map_err(|_| AppError::Storage(format!("project {} has no description; re-run step 1", id)))
    }

    pub async fn write_script(&self, id: &str, script: &Script) -> Result<()> {
        let json = serde_json::to_string_pretty(script)?;
        fs::write(self.project_dir(id).join(SCRIPT_FILE), json).await?;
        Ok(())
    }

    pub async fn read_script(&self, id: &str) -> Result<Script> {
        let raw = fs::read_to_string(self.project_dir(id).join(SCRIPT_FILE))
            .await
            .map_err(|_| AppError::Storage(format!("project {} has no script; re-run step 2", id)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn script_file_exists(&self, id: &str) -> bool {
        fs::metadata(self.project_dir(id).join(SCRIPT_FILE)).await.is_ok()
    }

    pub async fn write_character_url(&self, id: &str, url: &str) -> Result<()> {
        fs::write(self.project_dir(id).join(CHARACTER_URL_FILE), url).await?;
        Ok(())
    }

    pub async fn read_character_url(&self, id: &str) -> Result<String> {
        fs::read_to_string(self.project_dir(id).join(CHARACTER_URL_FILE))
            .await
            .map_err(|_| {
                AppError::Storage(format!(
                    "project {} has no character reference; re-run step 3",
                    id
                ))
            })
    }

    pub async fn write_keyframe_urls(&self, id: &str, urls: &[String]) -> Result<()> {
        let json = serde_json::to_string_pretty(urls)?;
        fs::write(self.project_dir(id).join(KEYFRAME_URLS_FILE), json).await?;
        Ok(())
    }

    pub async fn read_keyframe_urls(&self, id: &str) -> Result<Vec<String>> {
        let raw = fs::read_to_string(self.project_dir(id).join(KEYFRAME_URLS_FILE))
            .await
            .map_err(|_| {
                AppError::Storage(format!("project {} has no keyframe URLs; re-run step 4", id))
            })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn write_artifact(&self, id: &str, name: &str, bytes: &[u8]) -> Result<()> {
        fs::write(self.project_dir(id).join(name), bytes).await?;
        Ok(())
    }

    pub async fn artifact_exists(&self, id: &str, name: &str) -> bool {
        fs::metadata(self.project_dir(id).join(name)).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Segment;

    fn sample_script() -> Script {
        Script {
            main_character_description: "a lone astronaut in a dusty suit".to_string(),
            keyframes: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            segments: vec![
                Segment { script: "one".into() },
                Segment { script: "two".into() },
                Segment { script: "three".into() },
            ],
        }
    }

    #[tokio::test]
    async fn create_project_writes_description() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("a red desert").await.unwrap();
        assert_eq!(store.read_description(&id).await.unwrap(), "a red desert");
        assert!(store.artifact_exists(&id, INPUT_FILE).await);
    }

    #[tokio::test]
    async fn project_ids_are_unique_and_listed_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let a = store.create_project("first").await.unwrap();
        let b = store.create_project("second").await.unwrap();
        let c = store.create_project("third").await.unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        let listed = store.list_projects().await.unwrap();
        assert_eq!(listed.len(), 3);
        // Descending by id; ids grow with creation time (with a bump suffix
        // when two land on the same millisecond).
        let mut sorted = listed.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(listed, sorted);
    }

    #[tokio::test]
    async fn script_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("x").await.unwrap();
        let script = sample_script();
        store.write_script(&id, &script).await.unwrap();
        assert_eq!(store.read_script(&id).await.unwrap(), script);
    }

    #[tokio::test]
    async fn missing_upstream_artifacts_name_the_step_to_re_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path());
        let id = store.create_project("x").await.unwrap();
        let err = store.read_script(&id).await.unwrap_err();
        assert!(err.to_string().contains("re-run step 2"));
        let err = store.read_character_url(&id).await.unwrap_err();
        assert!(err.to_string().contains("re-run step 3"));
        let err = store.read_keyframe_urls(&id).await.unwrap_err();
        assert!(err.to_string().contains("re-run step 4"));
    }

    #[tokio::test]
    async fn listing_without_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectStore::new(dir.path().join("does-not-exist-yet"));
        assert!(store.list_projects().await.unwrap().is_empty());
    }
}
