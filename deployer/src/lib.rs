pub mod container;
pub mod docker;
pub mod engine;
pub mod stack;
pub mod state;

pub use container::{detect_runtime, ContainerError, ContainerRuntime};
pub use docker::DockerProvider;
pub use engine::{Action, Engine, EngineError, EngineResult, Plan, Step, UpResult};
pub use stack::{define_stack, frontend_url, Deployment, StackContext, StackError, StackResult};
pub use state::{PendingDelete, ResourceState, StackState, StateError, StateResult, StateStore};
