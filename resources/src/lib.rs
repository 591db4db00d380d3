pub mod config;
pub mod graph;
pub mod provider;
pub mod sensitive;
pub mod types;

pub use config::{ConfigError, ConfigResult, ConfigStore, StackConfig};
pub use graph::{Edge, GraphError, GraphResult, ResourceGraph};
pub use provider::{required_output, Provider, ProviderError, ProviderResult};
pub use sensitive::Sensitive;
pub use types::{
    is_valid_object_name, Attribute, Container, EnvVar, Image, Input, Mount, MountType, Network,
    NetworkAttachment, OutputMap, Outputs, PortMapping, Protocol, Reference, RemoteImage,
    Resource, ResourceKind, ResourceType,
};

pub mod prelude {
    pub use crate::config::*;
    pub use crate::graph::*;
    pub use crate::provider::*;
    pub use crate::sensitive::*;
    pub use crate::types::*;
}
