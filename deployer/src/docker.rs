//! Provider backed by the Docker (or Podman) command line.

use crate::container::{
    ensure_network, remove_container, remove_network, run_container, ContainerError,
    ContainerRuntime,
};
use async_trait::async_trait;
use image_builder::{ImageBuildConfig, ImageBuilder, PullConfig};
use resources::{
    required_output, Attribute, Outputs, Provider, ProviderError, ProviderResult, Resource,
    ResourceKind, ResourceType,
};
use std::process::Stdio;
use tracing::info;

pub struct DockerProvider {
    runtime: ContainerRuntime,
    images: ImageBuilder,
}

impl DockerProvider {
    pub fn new(runtime: ContainerRuntime) -> Result<Self, ContainerError> {
        if !runtime.is_available() {
            return Err(ContainerError::NoRuntimeAvailable);
        }
        Ok(Self {
            runtime,
            images: ImageBuilder::new(runtime.command()),
        })
    }

    pub fn runtime(&self) -> ContainerRuntime {
        self.runtime
    }
}

fn create_failed(resource: &Resource, reason: impl ToString) -> ProviderError {
    ProviderError::CreateFailed {
        resource: resource.name.clone(),
        reason: reason.to_string(),
    }
}

fn delete_failed(resource_type: ResourceType, name: &str, reason: impl ToString) -> ProviderError {
    ProviderError::DeleteFailed {
        resource: format!("{} {}", resource_type, name),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn create(&self, resource: &Resource) -> ProviderResult<Outputs> {
        match &resource.kind {
            ResourceKind::Image(image) => {
                let mut config = ImageBuildConfig::new(&image.image_name, &image.context);
                if !image.skip_push {
                    config = config.with_push();
                }
                let built = self
                    .images
                    .build(&config)
                    .await
                    .map_err(|e| create_failed(resource, e))?;
                Ok(Outputs::from([
                    (Attribute::ImageName, built.image_name),
                    (Attribute::ImageId, built.image_id),
                ]))
            }
            ResourceKind::RemoteImage(image) => {
                let pulled = self
                    .images
                    .pull(&PullConfig::new(&image.reference))
                    .await
                    .map_err(|e| create_failed(resource, e))?;
                Ok(Outputs::from([
                    (Attribute::ImageName, pulled.reference),
                    (Attribute::RepoDigest, pulled.repo_digest),
                    (Attribute::ImageId, pulled.image_id),
                ]))
            }
            ResourceKind::Network(network) => {
                let id = ensure_network(self.runtime, &network.name, &network.driver)
                    .await
                    .map_err(|e| create_failed(resource, e))?;
                Ok(Outputs::from([
                    (Attribute::NetworkName, network.name.clone()),
                    (Attribute::NetworkId, id),
                ]))
            }
            ResourceKind::Container(container) => {
                let id = run_container(self.runtime, container)
                    .await
                    .map_err(|e| match e {
                        ContainerError::UnresolvedInput { field, input, .. } => {
                            ProviderError::UnresolvedInput {
                                resource: resource.name.clone(),
                                input: format!("{} {}", field, input),
                            }
                        }
                        other => create_failed(resource, other),
                    })?;
                Ok(Outputs::from([
                    (Attribute::ContainerName, container.name.clone()),
                    (Attribute::ContainerId, id),
                ]))
            }
        }
    }

    async fn delete(&self, resource_type: ResourceType, outputs: &Outputs) -> ProviderResult<()> {
        match resource_type {
            ResourceType::Image | ResourceType::RemoteImage => {
                let name = required_output(resource_type, outputs, Attribute::ImageName)?;
                self.images
                    .remove(name)
                    .await
                    .map_err(|e| delete_failed(resource_type, name, e))
            }
            ResourceType::Network => {
                let name = required_output(resource_type, outputs, Attribute::NetworkName)?;
                remove_network(self.runtime, name)
                    .await
                    .map_err(|e| delete_failed(resource_type, name, e))
            }
            ResourceType::Container => {
                let name = required_output(resource_type, outputs, Attribute::ContainerName)?;
                info!(container = %name, "Removing container");
                remove_container(self.runtime, name)
                    .await
                    .map_err(|e| delete_failed(resource_type, name, e))
            }
        }
    }

    async fn health_check(&self) -> ProviderResult<()> {
        let status = tokio::process::Command::new(self.runtime.command())
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ProviderError::Unavailable {
                message: e.to_string(),
            })?;

        if !status.success() {
            return Err(ProviderError::Unavailable {
                message: format!(
                    "'{} info' failed; is the daemon running?",
                    self.runtime.command()
                ),
            });
        }
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        self.runtime.command()
    }
}
