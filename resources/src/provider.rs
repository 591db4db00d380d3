use crate::types::{Attribute, Outputs, Resource, ResourceType};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to create {resource}: {reason}")]
    CreateFailed { resource: String, reason: String },

    #[error("Failed to delete {resource}: {reason}")]
    DeleteFailed { resource: String, reason: String },

    #[error("Input '{input}' of {resource} is not resolved")]
    UnresolvedInput { resource: String, input: String },

    #[error("Missing output '{attribute}' for {resource_type}")]
    MissingOutput {
        resource_type: ResourceType,
        attribute: Attribute,
    },

    #[error("Provider unavailable: {message}")]
    Unavailable { message: String },
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Creates and deletes single resources.
///
/// `create` receives a descriptor whose inputs are already resolved and
/// returns the computed outputs. `delete` works from recorded outputs alone
/// so resources can be torn down after the descriptor is gone.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn create(&self, resource: &Resource) -> ProviderResult<Outputs>;

    async fn delete(&self, resource_type: ResourceType, outputs: &Outputs) -> ProviderResult<()>;

    async fn health_check(&self) -> ProviderResult<()>;

    fn provider_name(&self) -> &'static str;
}

/// Look up an output the provider needs for a delete
pub fn required_output(
    resource_type: ResourceType,
    outputs: &Outputs,
    attribute: Attribute,
) -> ProviderResult<&str> {
    outputs
        .get(&attribute)
        .map(String::as_str)
        .ok_or(ProviderError::MissingOutput {
            resource_type,
            attribute,
        })
}
