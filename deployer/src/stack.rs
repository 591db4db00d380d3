//! The cart stack: images, network and the four containers.
//!
//! ```mermaid
//! flowchart LR
//!     mongo([mongo image]) --> M([mongoContainer])
//!     mongo --> S([dataSeedContainer])
//!     backend([backend image]) --> B([backendContainer])
//!     frontend([frontend image]) --> F([frontendContainer])
//!     M -- depends on --> B
//!     M -- depends on --> S
//!     net([network]) --> M & B & F & S
//! ```
//!
//! Descriptors are built once from an explicit [`StackConfig`] and
//! [`StackContext`]; nothing here talks to the container runtime.

use resources::{
    is_valid_object_name, Attribute, Container, EnvVar, GraphError, Image, Input, Mount,
    MountType, Network, NetworkAttachment, PortMapping, Protocol, RemoteImage, Resource,
    ResourceGraph, ResourceKind, StackConfig,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const BACKEND_IMAGE: &str = "backend";
pub const FRONTEND_IMAGE: &str = "frontend";
pub const MONGO_IMAGE: &str = "mongo";
pub const NETWORK: &str = "network";
pub const MONGO_CONTAINER: &str = "mongoContainer";
pub const BACKEND_CONTAINER: &str = "backendContainer";
pub const FRONTEND_CONTAINER: &str = "frontendContainer";
pub const DATA_SEED_CONTAINER: &str = "dataSeedContainer";

pub const MONGO_REFERENCE: &str = "mongo:bionic";
/// Port the frontend process listens on inside its container
pub const FRONTEND_INTERNAL_PORT: u16 = 3001;
pub const SEED_FILE_TARGET: &str = "/home/products.json";
pub const SEED_DATABASE: &str = "cart";
pub const SEED_COLLECTION: &str = "products";

#[derive(Error, Debug)]
pub enum StackError {
    #[error("Working directory unavailable: {0}")]
    WorkingDirectory(#[source] std::io::Error),

    #[error("Invalid stack name '{0}': use letters, digits, '_', '.' or '-'")]
    InvalidStackName(String),

    #[error("Resource graph error: {0}")]
    Graph(#[from] GraphError),
}

pub type StackResult<T> = Result<T, StackError>;

/// Ambient inputs of the stack program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackContext {
    stack: String,
    cwd: PathBuf,
}

impl StackContext {
    pub fn new(stack: impl Into<String>, cwd: impl Into<PathBuf>) -> StackResult<Self> {
        let stack = stack.into();
        // The stack name suffixes container and network names
        if !is_valid_object_name(&stack) {
            return Err(StackError::InvalidStackName(stack));
        }
        Ok(Self {
            stack,
            cwd: cwd.into(),
        })
    }

    /// Context rooted at the process working directory
    pub fn from_current_dir(stack: impl Into<String>) -> StackResult<Self> {
        let cwd = std::env::current_dir().map_err(StackError::WorkingDirectory)?;
        Self::new(stack, cwd)
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// `<base>-<stack>`
    pub fn scoped(&self, base: &str) -> String {
        format!("{}-{}", base, self.stack)
    }
}

/// Everything the stack program declares
#[derive(Debug)]
pub struct Deployment {
    pub stack: String,
    pub graph: ResourceGraph,
    pub exports: BTreeMap<String, String>,
}

/// Declare the cart stack
pub fn define_stack(config: &StackConfig, ctx: &StackContext) -> StackResult<Deployment> {
    let mut graph = ResourceGraph::new();

    graph.add(local_image(BACKEND_IMAGE, ctx, "app/backend"))?;
    graph.add(local_image(FRONTEND_IMAGE, ctx, "app/frontend"))?;
    graph.add(Resource::new(
        MONGO_IMAGE,
        ResourceKind::RemoteImage(RemoteImage {
            reference: MONGO_REFERENCE.to_string(),
            keep_locally: true,
        }),
    ))?;

    graph.add(Resource::new(
        NETWORK,
        ResourceKind::Network(Network {
            name: ctx.scoped("services"),
            driver: "bridge".to_string(),
        }),
    ))?;

    graph.add(Resource::new(
        MONGO_CONTAINER,
        ResourceKind::Container(mongo_container(config, ctx)),
    ))?;
    graph.add(
        Resource::new(
            BACKEND_CONTAINER,
            ResourceKind::Container(backend_container(config, ctx)),
        )
        .with_depends_on(&[MONGO_CONTAINER]),
    )?;
    graph.add(Resource::new(
        FRONTEND_CONTAINER,
        ResourceKind::Container(frontend_container(config, ctx)),
    ))?;
    graph.add(
        Resource::new(
            DATA_SEED_CONTAINER,
            ResourceKind::Container(data_seed_container(config, ctx)),
        )
        .with_depends_on(&[MONGO_CONTAINER]),
    )?;

    let mut exports = BTreeMap::new();
    exports.insert("url".to_string(), frontend_url(config));

    debug!(
        stack = %ctx.stack(),
        resources = graph.len(),
        edges = graph.edge_count(),
        "Stack defined"
    );

    Ok(Deployment {
        stack: ctx.stack().to_string(),
        graph,
        exports,
    })
}

pub fn frontend_url(config: &StackConfig) -> String {
    format!("http://localhost:{}", config.frontend_port)
}

fn local_image(name: &str, ctx: &StackContext, context: &str) -> Resource {
    Resource::new(
        name,
        ResourceKind::Image(Image {
            image_name: format!("{}:{}", name, ctx.stack()),
            context: ctx.cwd().join(context),
            skip_push: true,
        }),
    )
}

fn stack_network() -> NetworkAttachment {
    NetworkAttachment {
        network: Input::output(NETWORK, Attribute::NetworkName),
        aliases: Vec::new(),
    }
}

fn mongo_container(config: &StackConfig, ctx: &StackContext) -> Container {
    let mut container = Container::new(
        ctx.scoped("mongo"),
        Input::output(MONGO_IMAGE, Attribute::RepoDigest),
    );
    container.env = vec![
        EnvVar::new("MONGO_INITDB_ROOT_USERNAME", config.mongo_username.as_str()),
        EnvVar::new("MONGO_INITDB_ROOT_PASSWORD", config.mongo_password.clone()),
    ];
    container.networks = vec![NetworkAttachment {
        aliases: vec!["mongo".to_string()],
        ..stack_network()
    }];
    container
}

fn backend_container(config: &StackConfig, ctx: &StackContext) -> Container {
    let database_host = config.mongo_password.map(|password| {
        format!(
            "mongodb://{}:{}@{}:{}",
            config.mongo_username, password, config.mongo_host, config.mongo_port
        )
    });

    let mut container = Container::new(
        ctx.scoped("backend"),
        Input::output(BACKEND_IMAGE, Attribute::ImageId),
    );
    container.env = vec![
        EnvVar::new("DATABASE_HOST", database_host),
        EnvVar::new(
            "DATABASE_NAME",
            format!("{}?authSource=admin", config.database),
        ),
        EnvVar::new("NODE_ENV", config.node_environment.as_str()),
    ];
    container.networks = vec![stack_network()];
    container
}

fn frontend_container(config: &StackConfig, ctx: &StackContext) -> Container {
    let mut container = Container::new(
        ctx.scoped("frontend"),
        Input::output(FRONTEND_IMAGE, Attribute::ImageId),
    );
    container.env = vec![
        EnvVar::new("LISTEN_PORT", config.frontend_port.to_string()),
        EnvVar::new(
            "HTTP_PROXY",
            format!("{}:{}", ctx.scoped("backend"), config.backend_port),
        ),
    ];
    container.networks = vec![stack_network()];
    container.ports = vec![PortMapping {
        internal: FRONTEND_INTERNAL_PORT,
        external: config.frontend_port,
        protocol: Protocol::Tcp,
    }];
    container
}

fn data_seed_container(config: &StackConfig, ctx: &StackContext) -> Container {
    let import = config.mongo_password.map(|password| {
        format!(
            "mongoimport --host {} -u {} -p {} --authenticationDatabase admin \
             --db {} --collection {} --type json --file {} --jsonArray",
            config.mongo_host,
            config.mongo_username,
            password,
            SEED_DATABASE,
            SEED_COLLECTION,
            SEED_FILE_TARGET
        )
    });

    let mut container = Container::new(
        ctx.scoped("dataSeed"),
        Input::output(MONGO_IMAGE, Attribute::RepoDigest),
    );
    container.command = vec![Input::value("sh"), Input::value("-c"), import.into()];
    container.mounts = vec![Mount {
        source: ctx.cwd().join("app/data/products.json"),
        target: SEED_FILE_TARGET.to_string(),
        kind: MountType::Bind,
    }];
    container.networks = vec![stack_network()];
    container.must_run = false;
    container.remove_on_exit = false;
    container
}

#[cfg(test)]
mod tests {
    use super::*;
    use resources::Sensitive;

    fn config() -> StackConfig {
        StackConfig {
            frontend_port: 8080,
            backend_port: 3000,
            mongo_port: 27017,
            mongo_host: "mongo".to_string(),
            database: "cart".to_string(),
            node_environment: "production".to_string(),
            mongo_username: "admin".to_string(),
            mongo_password: Sensitive::new("p@ss".to_string()),
        }
    }

    fn context() -> StackContext {
        StackContext::new("dev", "/work").unwrap()
    }

    fn container<'a>(deployment: &'a Deployment, name: &str) -> &'a Container {
        deployment.graph.get(name).unwrap().as_container().unwrap()
    }

    #[test]
    fn test_resource_set() {
        let deployment = define_stack(&config(), &context()).unwrap();
        assert_eq!(deployment.stack, "dev");
        assert_eq!(deployment.graph.len(), 8);
        for name in [
            BACKEND_IMAGE,
            FRONTEND_IMAGE,
            MONGO_IMAGE,
            NETWORK,
            MONGO_CONTAINER,
            BACKEND_CONTAINER,
            FRONTEND_CONTAINER,
            DATA_SEED_CONTAINER,
        ] {
            assert!(deployment.graph.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_mongo_precedes_backend_and_seed() {
        let deployment = define_stack(&config(), &context()).unwrap();
        let graph = &deployment.graph;

        for dependent in [BACKEND_CONTAINER, DATA_SEED_CONTAINER] {
            let deps = graph.dependencies_of(dependent).unwrap();
            assert!(deps.contains(&MONGO_CONTAINER.to_string()));
            assert_eq!(graph.get(dependent).unwrap().depends_on, vec![MONGO_CONTAINER]);
        }
        assert!(!graph.precedes(MONGO_CONTAINER, FRONTEND_CONTAINER).unwrap());
    }

    #[test]
    fn test_network_and_images_precede_containers() {
        let deployment = define_stack(&config(), &context()).unwrap();
        let graph = &deployment.graph;

        for name in [
            MONGO_CONTAINER,
            BACKEND_CONTAINER,
            FRONTEND_CONTAINER,
            DATA_SEED_CONTAINER,
        ] {
            assert!(graph.precedes(NETWORK, name).unwrap());
        }
        assert!(graph.precedes(BACKEND_IMAGE, BACKEND_CONTAINER).unwrap());
        assert!(graph.precedes(FRONTEND_IMAGE, FRONTEND_CONTAINER).unwrap());
        assert!(graph.precedes(MONGO_IMAGE, MONGO_CONTAINER).unwrap());
        assert!(graph.precedes(MONGO_IMAGE, DATA_SEED_CONTAINER).unwrap());
    }

    #[test]
    fn test_names_are_stack_scoped() {
        let ctx = StackContext::new("staging", "/work").unwrap();
        let deployment = define_stack(&config(), &ctx).unwrap();

        assert_eq!(container(&deployment, MONGO_CONTAINER).name, "mongo-staging");
        assert_eq!(container(&deployment, BACKEND_CONTAINER).name, "backend-staging");
        assert_eq!(container(&deployment, FRONTEND_CONTAINER).name, "frontend-staging");
        assert_eq!(container(&deployment, DATA_SEED_CONTAINER).name, "dataSeed-staging");

        match &deployment.graph.get(NETWORK).unwrap().kind {
            ResourceKind::Network(network) => assert_eq!(network.name, "services-staging"),
            other => panic!("unexpected kind {:?}", other),
        }
        match &deployment.graph.get(BACKEND_IMAGE).unwrap().kind {
            ResourceKind::Image(image) => {
                assert_eq!(image.image_name, "backend:staging");
                assert_eq!(image.context, PathBuf::from("/work/app/backend"));
                assert!(image.skip_push);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_url_export() {
        let deployment = define_stack(&config(), &context()).unwrap();
        assert_eq!(deployment.exports.len(), 1);
        assert_eq!(deployment.exports["url"], "http://localhost:8080");
    }

    #[test]
    fn test_database_host_composition() {
        let deployment = define_stack(&config(), &context()).unwrap();
        let backend = container(&deployment, BACKEND_CONTAINER);
        let host = backend.env_value("DATABASE_HOST").unwrap();
        assert!(host.is_secret());
        assert_eq!(host.expose(), Some("mongodb://admin:p@ss@mongo:27017"));
        assert_eq!(
            backend.env_value("DATABASE_NAME").unwrap().expose(),
            Some("cart?authSource=admin")
        );
        assert_eq!(
            backend.env_value("NODE_ENV").unwrap().expose(),
            Some("production")
        );
        assert!(backend.ports.is_empty());
    }

    #[test]
    fn test_frontend_ports_and_proxy() {
        let deployment = define_stack(&config(), &context()).unwrap();
        let frontend = container(&deployment, FRONTEND_CONTAINER);
        assert_eq!(
            frontend.ports,
            vec![PortMapping {
                internal: 3001,
                external: 8080,
                protocol: Protocol::Tcp,
            }]
        );
        assert_eq!(
            frontend.env_value("LISTEN_PORT").unwrap().expose(),
            Some("8080")
        );
        assert_eq!(
            frontend.env_value("HTTP_PROXY").unwrap().expose(),
            Some("backend-dev:3000")
        );
    }

    #[test]
    fn test_app_containers_follow_image_id() {
        let deployment = define_stack(&config(), &context()).unwrap();
        assert_eq!(
            container(&deployment, BACKEND_CONTAINER).image,
            Input::output(BACKEND_IMAGE, Attribute::ImageId)
        );
        assert_eq!(
            container(&deployment, FRONTEND_CONTAINER).image,
            Input::output(FRONTEND_IMAGE, Attribute::ImageId)
        );
    }

    #[test]
    fn test_mongo_container() {
        let deployment = define_stack(&config(), &context()).unwrap();
        let mongo = container(&deployment, MONGO_CONTAINER);
        assert_eq!(mongo.image, Input::output(MONGO_IMAGE, Attribute::RepoDigest));
        assert_eq!(mongo.networks[0].aliases, vec!["mongo"]);
        assert!(mongo.ports.is_empty());
        assert!(mongo
            .env_value("MONGO_INITDB_ROOT_PASSWORD")
            .unwrap()
            .is_secret());

        let image = deployment.graph.get(MONGO_IMAGE).unwrap();
        assert!(image.retain_on_delete());
    }

    #[test]
    fn test_data_seed_container() {
        let deployment = define_stack(&config(), &context()).unwrap();
        let seed = container(&deployment, DATA_SEED_CONTAINER);
        assert!(!seed.must_run);
        assert!(!seed.remove_on_exit);
        assert_eq!(seed.mounts[0].source, PathBuf::from("/work/app/data/products.json"));
        assert_eq!(seed.mounts[0].target, "/home/products.json");
        assert_eq!(seed.mounts[0].kind, MountType::Bind);

        assert_eq!(seed.command.len(), 3);
        assert!(seed.command[2].is_secret());
        let script = seed.command[2].expose().unwrap();
        assert!(script.starts_with("mongoimport --host mongo -u admin -p p@ss "));
        assert!(script.contains("--db cart --collection products"));
        assert!(script.ends_with("--file /home/products.json --jsonArray"));
    }

    #[test]
    fn test_secret_absent_from_debug() {
        let deployment = define_stack(&config(), &context()).unwrap();
        assert!(!format!("{:?}", deployment).contains("p@ss"));
    }

    #[test]
    fn test_invalid_stack_name() {
        assert!(matches!(
            StackContext::new("dev stack", "/work"),
            Err(StackError::InvalidStackName(_))
        ));
        assert!(matches!(
            StackContext::new("", "/work"),
            Err(StackError::InvalidStackName(_))
        ));
    }
}
