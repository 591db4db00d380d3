//! Container image utilities for cart-stack
//!
//! Builds images from a local context directory and pulls remote images
//! through a Docker-compatible CLI (`docker` or `podman`). Layer
//! construction itself is left to the runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors related to image building and pulling
#[derive(Error, Debug)]
pub enum ImageBuilderError {
    #[error("Build failed for image '{image}': {reason}")]
    BuildFailed { image: String, reason: String },
    #[error("Build context '{path}' does not exist or is not a directory")]
    ContextNotFound { path: String },
    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },
    #[error("Failed to push image '{image}': {reason}")]
    PushFailed { image: String, reason: String },
    #[error("Failed to inspect image '{image}': {reason}")]
    InspectFailed { image: String, reason: String },
    #[error("Failed to remove image '{image}': {reason}")]
    RemoveFailed { image: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ImageBuilderResult<T> = Result<T, ImageBuilderError>;

/// Configuration for building an image from a local context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuildConfig {
    /// Full image name including tag, e.g. `backend:dev`
    pub image_name: String,
    /// Build context directory
    pub context: PathBuf,
    /// Dockerfile relative to the context, runtime default when unset
    pub dockerfile: Option<PathBuf>,
    /// Skip pushing the image to a registry after the build
    pub skip_push: bool,
}

impl ImageBuildConfig {
    pub fn new(image_name: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            image_name: image_name.into(),
            context: context.into(),
            dockerfile: None,
            skip_push: true,
        }
    }

    pub fn with_dockerfile(mut self, dockerfile: impl Into<PathBuf>) -> Self {
        self.dockerfile = Some(dockerfile.into());
        self
    }

    pub fn with_push(mut self) -> Self {
        self.skip_push = false;
        self
    }

    pub fn validate(&self) -> ImageBuilderResult<()> {
        if self.image_name.is_empty() {
            return Err(ImageBuilderError::InvalidConfig(
                "Image name cannot be empty".to_string(),
            ));
        }

        if !self.context.is_dir() {
            return Err(ImageBuilderError::ContextNotFound {
                path: self.context.display().to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration for pulling a remote image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullConfig {
    /// Remote reference, e.g. `mongo:bionic`
    pub reference: String,
    /// Reuse a locally present copy instead of pulling again
    pub prefer_local: bool,
}

impl PullConfig {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            prefer_local: true,
        }
    }
}

/// Result of a successful build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltImage {
    pub image_name: String,
    pub image_id: String,
}

/// Result of a successful pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulledImage {
    pub reference: String,
    pub repo_digest: String,
    pub image_id: String,
}

/// Runs image operations through a Docker-compatible CLI
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    program: String,
}

impl ImageBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Build an image and return its name and id
    pub async fn build(&self, config: &ImageBuildConfig) -> ImageBuilderResult<BuiltImage> {
        config.validate()?;

        let mut cmd = Command::new(&self.program);
        cmd.args(["build", "-t", &config.image_name]);
        if let Some(dockerfile) = &config.dockerfile {
            cmd.arg("-f").arg(config.context.join(dockerfile));
        }
        cmd.arg(&config.context);

        info!(
            image = %config.image_name,
            context = %config.context.display(),
            "Building image"
        );
        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(ImageBuilderError::BuildFailed {
                image: config.image_name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let image_id = self.inspect(&config.image_name, "{{.Id}}").await?;

        if !config.skip_push {
            self.push(&config.image_name).await?;
        }

        Ok(BuiltImage {
            image_name: config.image_name.clone(),
            image_id,
        })
    }

    /// Pull a remote image unless a local copy may be reused
    pub async fn pull(&self, config: &PullConfig) -> ImageBuilderResult<PulledImage> {
        if config.prefer_local && self.exists(&config.reference).await? {
            debug!(image = %config.reference, "Image present locally, skipping pull");
        } else {
            info!(image = %config.reference, "Pulling image");
            let output = Command::new(&self.program)
                .args(["pull", &config.reference])
                .output()
                .await?;

            if !output.status.success() {
                return Err(ImageBuilderError::PullFailed {
                    image: config.reference.clone(),
                    reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        }

        let image_id = self.inspect(&config.reference, "{{.Id}}").await?;
        let digests = self
            .inspect(&config.reference, "{{range .RepoDigests}}{{println .}}{{end}}")
            .await?;
        let repo_digest = first_repo_digest(&digests).unwrap_or_else(|| image_id.clone());

        Ok(PulledImage {
            reference: config.reference.clone(),
            repo_digest,
            image_id,
        })
    }

    /// Push an image to the registry encoded in its name
    pub async fn push(&self, image: &str) -> ImageBuilderResult<()> {
        info!(image = %image, "Pushing image");
        let output = Command::new(&self.program)
            .args(["push", image])
            .output()
            .await?;

        if !output.status.success() {
            return Err(ImageBuilderError::PushFailed {
                image: image.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Check whether an image exists locally
    pub async fn exists(&self, image: &str) -> ImageBuilderResult<bool> {
        let output = Command::new(&self.program)
            .args(["image", "inspect", image])
            .output()
            .await?;
        Ok(output.status.success())
    }

    /// Remove a local image; an image that is already gone is not an error
    pub async fn remove(&self, image: &str) -> ImageBuilderResult<()> {
        info!(image = %image, "Removing image");
        let output = Command::new(&self.program)
            .args(["rmi", image])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_image(&stderr) {
                debug!(image = %image, "Image already removed");
                return Ok(());
            }
            return Err(ImageBuilderError::RemoveFailed {
                image: image.to_string(),
                reason: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn inspect(&self, image: &str, format: &str) -> ImageBuilderResult<String> {
        let output = Command::new(&self.program)
            .args(["image", "inspect", "--format", format, image])
            .output()
            .await?;

        if !output.status.success() {
            return Err(ImageBuilderError::InspectFailed {
                image: image.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn first_repo_digest(listing: &str) -> Option<String> {
    listing
        .lines()
        .map(str::trim)
        .find(|line| line.contains("@sha256:"))
        .map(str::to_string)
}

fn is_missing_image(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such image") || stderr.contains("image not known")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_defaults() {
        let config = ImageBuildConfig::new("backend:dev", "/src/app/backend");
        assert_eq!(config.image_name, "backend:dev");
        assert_eq!(config.context, PathBuf::from("/src/app/backend"));
        assert!(config.skip_push);
        assert!(config.dockerfile.is_none());
    }

    #[test]
    fn test_build_config_builder() {
        let config = ImageBuildConfig::new("frontend:prod", ".")
            .with_dockerfile("Dockerfile.prod")
            .with_push();
        assert!(!config.skip_push);
        assert_eq!(config.dockerfile, Some(PathBuf::from("Dockerfile.prod")));
    }

    #[test]
    fn test_validate_missing_context() {
        let config = ImageBuildConfig::new("backend:dev", "/nonexistent/app/backend");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ImageBuilderError::ContextNotFound { .. }));
        assert!(err.to_string().contains("/nonexistent/app/backend"));
    }

    #[test]
    fn test_validate_empty_name() {
        let dir = tempfile::tempdir().unwrap();
        let config = ImageBuildConfig::new("", dir.path());
        assert!(matches!(
            config.validate(),
            Err(ImageBuilderError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_existing_context() {
        let dir = tempfile::tempdir().unwrap();
        let config = ImageBuildConfig::new("backend:dev", dir.path());
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_build_rejects_missing_context_before_running() {
        // The program does not exist; validation has to fail first.
        let builder = ImageBuilder::new("definitely-not-a-container-runtime");
        let config = ImageBuildConfig::new("backend:dev", "/nonexistent/context");
        let result = builder.build(&config).await;
        assert!(matches!(
            result,
            Err(ImageBuilderError::ContextNotFound { .. })
        ));
    }

    #[test]
    fn test_pull_config_prefers_local() {
        let config = PullConfig::new("mongo:bionic");
        assert_eq!(config.reference, "mongo:bionic");
        assert!(config.prefer_local);
    }

    #[test]
    fn test_first_repo_digest() {
        let listing = "\nmongo@sha256:abc123\nother@sha256:def\n";
        assert_eq!(
            first_repo_digest(listing),
            Some("mongo@sha256:abc123".to_string())
        );
        assert_eq!(first_repo_digest(""), None);
        assert_eq!(first_repo_digest("<no value>"), None);
    }

    #[test]
    fn test_missing_image_detection() {
        assert!(is_missing_image("Error: No such image: backend:dev"));
        assert!(is_missing_image("Error: backend:dev: image not known"));
        assert!(!is_missing_image("Error: conflict: image is being used"));
    }

    #[test]
    fn test_error_display() {
        let err = ImageBuilderError::BuildFailed {
            image: "backend:dev".to_string(),
            reason: "COPY failed".to_string(),
        };
        assert!(err.to_string().contains("backend:dev"));
        assert!(err.to_string().contains("COPY failed"));
    }
}
