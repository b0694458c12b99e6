//! Read-only access to the workload's remote storage volume.
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::command::PlatformCommand;
use super::runner::{CommandExit, CommandRunner};
use crate::error::{Result, RotorError};

pub const WORKFLOW_EXTENSION: &str = "json";
pub const OUTPUT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif", "mp4", "webm", "mov"];

#[derive(Debug, Clone)]
pub struct VolumeLayout {
    pub volume: String,
    pub workflows_path: String,
    pub outputs_path: String,
    pub download_dir: PathBuf,
}

/// Lists and downloads files from the volume of the currently active profile.
#[derive(Clone)]
pub struct VolumeBrowser {
    runner: Arc<dyn CommandRunner>,
    layout: VolumeLayout,
    timeout: Duration,
}

impl VolumeBrowser {
    pub fn new(runner: Arc<dyn CommandRunner>, layout: VolumeLayout, timeout: Duration) -> Self {
        Self {
            runner,
            layout,
            timeout,
        }
    }

    pub async fn list_workflows(&self) -> Result<Vec<String>> {
        let entries = self.list(&self.layout.workflows_path).await?;
        Ok(entries
            .into_iter()
            .filter(|name| has_extension(name, &[WORKFLOW_EXTENSION]))
            .collect())
    }

    pub async fn list_outputs(&self) -> Result<Vec<String>> {
        let entries = self.list(&self.layout.outputs_path).await?;
        Ok(entries
            .into_iter()
            .filter(|name| has_extension(name, OUTPUT_EXTENSIONS))
            .collect())
    }

    /// Downloads a workflow and parses it. `.json` is appended when missing.
    pub async fn fetch_workflow(&self, name: &str) -> Result<serde_json::Value> {
        let mut name = validate_relative(name)?.to_string();
        if !has_extension(&name, &[WORKFLOW_EXTENSION]) {
            name.push_str(".json");
        }
        let local = self.download(&self.layout.workflows_path, &name).await?;
        let contents = tokio::fs::read_to_string(&local).await?;
        serde_json::from_str(&contents).map_err(|e| {
            RotorError::InvalidInput(format!("workflow '{name}' is not valid JSON: {e}"))
        })
    }

    /// Downloads an output file and returns where it landed locally.
    pub async fn fetch_output(&self, name: &str) -> Result<PathBuf> {
        let name = validate_relative(name)?.to_string();
        self.download(&self.layout.outputs_path, &name).await
    }

    /// Reads a small file from the volume root straight into memory.
    pub async fn read_file(&self, remote: &str) -> Result<String> {
        let command = PlatformCommand::VolumeGet {
            volume: self.layout.volume.clone(),
            remote: remote.to_string(),
            local: "-".to_string(),
        };
        let output = self.runner.run(&command, self.timeout).await?;
        match output.exit {
            CommandExit::Code(0) => Ok(output.stdout),
            CommandExit::Timeout => Err(RotorError::Timeout(format!("'{command}'"))),
            CommandExit::Code(_) => Err(RotorError::Command(format!(
                "'{command}' failed: {}",
                output.failure_detail()
            ))),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        let command = PlatformCommand::VolumeList {
            volume: self.layout.volume.clone(),
            path: path.to_string(),
        };
        let output = self.runner.run(&command, self.timeout).await?;
        match output.exit {
            CommandExit::Code(0) => {}
            CommandExit::Timeout => return Err(RotorError::Timeout(format!("'{command}'"))),
            CommandExit::Code(_) => {
                error!(command = %command, "Volume listing failed.");
                return Err(RotorError::Command(format!(
                    "'{command}' failed: {}",
                    output.failure_detail()
                )));
            }
        }

        let mut entries: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| line.rsplit('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    async fn download(&self, directory: &str, name: &str) -> Result<PathBuf> {
        let local = self.layout.download_dir.join(name);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let remote = format!("{}/{}", directory.trim_end_matches('/'), name);

        let command = PlatformCommand::VolumeGet {
            volume: self.layout.volume.clone(),
            remote,
            local: local.to_string_lossy().into_owned(),
        };
        let output = self.runner.run(&command, self.timeout).await?;
        match output.exit {
            CommandExit::Code(0) => {
                info!(file = %name, local = ?local, "Downloaded file from volume.");
                Ok(local)
            }
            CommandExit::Timeout => Err(RotorError::Timeout(format!("'{command}'"))),
            CommandExit::Code(_) => Err(RotorError::Command(format!(
                "'{command}' failed: {}",
                output.failure_detail()
            ))),
        }
    }
}

fn has_extension(name: &str, allowed: &[&str]) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Accepts only plain relative paths that stay inside the target directory.
fn validate_relative(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    let path = Path::new(trimmed);
    let plain = !trimmed.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if plain {
        Ok(trimmed)
    } else {
        Err(RotorError::InvalidInput(format!(
            "'{name}' is not a plain relative path"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePlatform;

    fn browser(platform: &Arc<FakePlatform>, download_dir: &Path) -> VolumeBrowser {
        VolumeBrowser::new(
            platform.clone(),
            VolumeLayout {
                volume: "workspace".to_string(),
                workflows_path: "ComfyUI/user/default/workflows".to_string(),
                outputs_path: "ComfyUI/output".to_string(),
                download_dir: download_dir.to_path_buf(),
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_workflow_listing_keeps_json_only() {
        let platform = Arc::new(FakePlatform::new());
        platform.set_listing(
            "ComfyUI/user/default/workflows",
            &["ComfyUI/user/default/workflows/portrait.json", "notes.txt", "upscale.JSON"],
        );
        let dir = tempfile::tempdir().unwrap();

        let workflows = browser(&platform, dir.path()).list_workflows().await.unwrap();
        assert_eq!(workflows, vec!["portrait.json", "upscale.JSON"]);
    }

    #[tokio::test]
    async fn test_output_listing_uses_allow_list() {
        let platform = Arc::new(FakePlatform::new());
        platform.set_listing(
            "ComfyUI/output",
            &["a.png", "b.mp4", "c.safetensors", "d.webp", "_temp"],
        );
        let dir = tempfile::tempdir().unwrap();

        let outputs = browser(&platform, dir.path()).list_outputs().await.unwrap();
        assert_eq!(outputs, vec!["a.png", "b.mp4", "d.webp"]);
    }

    #[tokio::test]
    async fn test_fetch_workflow_appends_extension() {
        let platform = Arc::new(FakePlatform::new());
        platform.set_file(
            "ComfyUI/user/default/workflows/portrait.json",
            r#"{"nodes": [1, 2]}"#,
        );
        let dir = tempfile::tempdir().unwrap();

        let workflow = browser(&platform, dir.path())
            .fetch_workflow("portrait")
            .await
            .unwrap();
        assert_eq!(workflow["nodes"][1], 2);
        assert!(dir.path().join("portrait.json").exists());
    }

    #[tokio::test]
    async fn test_fetch_rejects_path_traversal() {
        let platform = Arc::new(FakePlatform::new());
        let dir = tempfile::tempdir().unwrap();
        let volume = browser(&platform, dir.path());

        for name in ["../secrets.png", "/etc/passwd", "", "a/../../b.png"] {
            assert!(matches!(
                volume.fetch_output(name).await,
                Err(RotorError::InvalidInput(_))
            ));
        }
        assert_eq!(platform.count("volume get"), 0);
    }

    #[tokio::test]
    async fn test_missing_output_is_command_error() {
        let platform = Arc::new(FakePlatform::new());
        let dir = tempfile::tempdir().unwrap();

        let result = browser(&platform, dir.path()).fetch_output("gone.png").await;
        assert!(matches!(result, Err(RotorError::Command(_))));
    }
}
