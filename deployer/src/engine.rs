//! Reconciles a [`Deployment`] against the recorded state of its stack.
//!
//! ```mermaid
//! flowchart TD
//!     L[load state] --> W{next layer}
//!     W -->|resolve inputs| F[fingerprint]
//!     F -->|unchanged| S[Same: reuse outputs]
//!     F -->|changed, same object name| R[Replace in place]
//!     F -->|changed, new object name| N[Create new, retire old]
//!     F -->|unrecorded| C[Create]
//!     S & R & N & C --> V[save state]
//!     V --> W
//!     W -->|done| D[delete stale and retired entries]
//!     D --> X[record exports]
//! ```
//!
//! Local images are built on every update; the build cache decides whether
//! the image id moves, and containers follow the id. A replaced network
//! first takes down the recorded resources that use it.
//!
//! Resources within a layer are applied concurrently. The first failure
//! stops the run after the layer's successful resources are recorded; there
//! is no rollback.

use crate::stack::Deployment;
use crate::state::{PendingDelete, ResourceState, StackState, StateError, StateStore};
use futures::future::join_all;
use resources::{
    GraphError, OutputMap, Outputs, Provider, ProviderError, Resource, ResourceType,
};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Resource graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Resource '{resource}' failed: {source}")]
    Provider {
        resource: String,
        #[source]
        source: ProviderError,
    },

    #[error("Cannot fingerprint resource '{resource}': {source}")]
    Fingerprint {
        resource: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("State error: {0}")]
    State(#[from] StateError),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Same,
    Replace,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Action::Create => "+",
            Action::Same => " ",
            Action::Replace => "+-",
            Action::Delete => "-",
        };
        write!(f, "{:>2}", symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub resource: String,
    pub resource_type: ResourceType,
    pub action: Action,
}

/// Ordered steps of an update or destroy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    fn push(&mut self, resource: impl Into<String>, resource_type: ResourceType, action: Action) {
        self.steps.push(Step {
            resource: resource.into(),
            resource_type,
            action,
        });
    }

    pub fn count(&self, action: Action) -> usize {
        self.steps.iter().filter(|step| step.action == action).count()
    }

    /// Nothing would be created, replaced or deleted
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|step| step.action == Action::Same)
    }

    pub fn action_of(&self, resource: &str) -> Option<Action> {
        self.steps
            .iter()
            .find(|step| step.resource == resource)
            .map(|step| step.action)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            writeln!(
                f,
                "{} {:<18} {}",
                step.action, step.resource_type, step.resource
            )?;
        }
        write!(
            f,
            "Resources: {} to create, {} to replace, {} to delete, {} unchanged",
            self.count(Action::Create),
            self.count(Action::Replace),
            self.count(Action::Delete),
            self.count(Action::Same)
        )
    }
}

#[derive(Debug, Clone)]
pub struct UpResult {
    pub update_id: Uuid,
    pub plan: Plan,
    pub outputs: BTreeMap<String, String>,
}

pub struct Engine {
    provider: Box<dyn Provider>,
    store: StateStore,
}

impl Engine {
    pub fn new(provider: Box<dyn Provider>, store: StateStore) -> Self {
        Self { provider, store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// What `up` would do, without touching the provider
    pub fn preview(&self, deployment: &Deployment) -> EngineResult<Plan> {
        let state = self.store.load(&deployment.stack)?;
        let mut plan = Plan::default();
        let mut known = OutputMap::new();

        for name in deployment.graph.topological_order()? {
            let resource = deployment.graph.get(&name)?;
            let action = match state.resources.get(&name) {
                None => Action::Create,
                // Inputs that depend on a pending create cannot be fingerprinted
                // yet; treat the resource as changed.
                Some(previous) => {
                    let unchanged = match resource.resolve(&known) {
                        Ok(resolved) => fingerprint(&resolved)? == previous.fingerprint,
                        Err(_) => false,
                    };
                    if unchanged {
                        known.insert(name.clone(), previous.outputs.clone());
                        Action::Same
                    } else {
                        Action::Replace
                    }
                }
            };
            plan.push(name, resource.resource_type(), action);
        }

        for name in state.deletion_order()? {
            if !deployment.graph.contains(&name) {
                plan.push(name.clone(), state.resources[&name].resource_type, Action::Delete);
            }
        }
        Ok(plan)
    }

    /// Bring the stack to the declared state and record its exports
    pub async fn up(&self, deployment: &Deployment) -> EngineResult<UpResult> {
        let update_id = Uuid::new_v4();
        let mut state = self.store.load(&deployment.stack)?;
        state.last_update = Some(update_id);
        info!(
            stack = %deployment.stack,
            update = %update_id,
            provider = self.provider.provider_name(),
            "Starting update"
        );

        let mut plan = Plan::default();
        let mut outputs = OutputMap::new();
        let mut evicted = HashSet::new();

        for (depth, layer) in deployment.graph.layers()?.into_iter().enumerate() {
            debug!(layer = depth, resources = ?layer, "Applying layer");

            let mut jobs = Vec::with_capacity(layer.len());
            for name in &layer {
                let resource = deployment.graph.get(name)?;
                let resolved = resource.resolve(&outputs).map_err(GraphError::from)?;
                let fingerprint = fingerprint(&resolved)?;
                let previous = state.resources.get(name).cloned();

                // Docker refuses to remove a network that containers still use
                if let Some(previous) = &previous {
                    if previous.resource_type == ResourceType::Network
                        && previous.fingerprint != fingerprint
                        && swap_for(resource, previous) == Swap::DeleteFirst
                    {
                        for (removed, resource_type) in
                            self.evict_dependents(&mut state, name).await?
                        {
                            if !deployment.graph.contains(&removed) {
                                plan.push(removed.clone(), resource_type, Action::Delete);
                            }
                            evicted.insert(removed);
                        }
                    }
                }

                jobs.push(Job {
                    resource,
                    resolved,
                    fingerprint,
                    previous,
                    dependencies: deployment.graph.dependencies_of(name)?,
                    evicted: evicted.contains(name),
                });
            }

            let mut failure = None;
            for result in join_all(jobs.into_iter().map(|job| self.apply(job))).await {
                match result {
                    Ok(applied) => {
                        plan.push(applied.name.clone(), applied.entry.resource_type, applied.action);
                        outputs.insert(applied.name.clone(), applied.entry.outputs.clone());
                        if let Some(retired) = applied.retired {
                            state.pending_deletes.push(PendingDelete {
                                resource: applied.name.clone(),
                                state: retired,
                            });
                        }
                        state.resources.insert(applied.name, applied.entry);
                    }
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }

            self.store.save(&mut state)?;
            if let Some(e) = failure {
                warn!(stack = %deployment.stack, error = %e, "Update failed");
                return Err(e);
            }
        }

        for name in state.deletion_order()? {
            if deployment.graph.contains(&name) {
                continue;
            }
            if let Some(entry) = state.resources.get(&name).cloned() {
                self.delete_recorded(&name, &entry).await?;
                plan.push(name.clone(), entry.resource_type, Action::Delete);
                state.resources.remove(&name);
                self.store.save(&mut state)?;
            }
        }
        self.drain_pending_deletes(&mut state).await?;

        state.outputs = deployment.exports.clone();
        self.store.save(&mut state)?;

        info!(
            stack = %deployment.stack,
            created = plan.count(Action::Create),
            replaced = plan.count(Action::Replace),
            deleted = plan.count(Action::Delete),
            unchanged = plan.count(Action::Same),
            "Update complete"
        );

        Ok(UpResult {
            update_id,
            plan,
            outputs: state.outputs,
        })
    }

    async fn apply(&self, job: Job<'_>) -> EngineResult<Applied> {
        let Job {
            resource,
            resolved,
            fingerprint,
            previous,
            dependencies,
            evicted,
        } = job;
        let name = resource.name.clone();

        let entry = |outputs: Outputs| ResourceState {
            resource_type: resource.resource_type(),
            fingerprint: fingerprint.clone(),
            outputs,
            dependencies: dependencies.clone(),
            retain_on_delete: resource.retain_on_delete(),
        };

        let Some(previous) = previous else {
            info!(resource = %name, kind = %resource.resource_type(), "Creating");
            let created = self.create(&resolved).await?;
            let action = if evicted {
                Action::Replace
            } else {
                Action::Create
            };
            return Ok(Applied {
                name,
                action,
                entry: entry(created),
                retired: None,
            });
        };

        let rebuild = resource.resource_type() == ResourceType::Image;
        if previous.fingerprint == fingerprint && !rebuild {
            debug!(resource = %name, "Unchanged");
            return Ok(Applied {
                name,
                action: Action::Same,
                entry: entry(previous.outputs.clone()),
                retired: None,
            });
        }

        let swap = swap_for(resource, &previous);
        match swap {
            Swap::DeleteFirst => {
                info!(resource = %name, "Replacing");
                self.delete_recorded(&name, &previous).await?;
            }
            Swap::Overwrite if rebuild => debug!(resource = %name, "Rebuilding"),
            Swap::Overwrite => info!(resource = %name, "Replacing in place"),
            Swap::DeleteLater => info!(resource = %name, "Replacing under a new name"),
        }

        let created = self.create(&resolved).await?;
        let action = if previous.fingerprint == fingerprint && previous.outputs == created {
            Action::Same
        } else {
            Action::Replace
        };
        let retired = (swap == Swap::DeleteLater).then_some(previous);
        Ok(Applied {
            name,
            action,
            entry: entry(created),
            retired,
        })
    }

    async fn create(&self, resolved: &Resource) -> EngineResult<Outputs> {
        self.provider
            .create(resolved)
            .await
            .map_err(|source| EngineError::Provider {
                resource: resolved.name.clone(),
                source,
            })
    }

    /// Delete the recorded resources that use `name`, dependents first, so
    /// that `name` itself can be deleted. Later layers recreate them.
    async fn evict_dependents(
        &self,
        state: &mut StackState,
        name: &str,
    ) -> EngineResult<Vec<(String, ResourceType)>> {
        let users = state.dependents_of(name);
        let mut removed = Vec::with_capacity(users.len());
        for user in state.deletion_order()? {
            if !users.contains(&user) {
                continue;
            }
            if let Some(entry) = state.resources.get(&user).cloned() {
                info!(resource = %user, used = %name, "Removing dependent before replacement");
                self.delete_recorded(&user, &entry).await?;
                state.resources.remove(&user);
                self.store.save(state)?;
                removed.push((user, entry.resource_type));
            }
        }
        Ok(removed)
    }

    /// Delete objects retired during an update, most recent first
    async fn drain_pending_deletes(&self, state: &mut StackState) -> EngineResult<()> {
        while let Some(pending) = state.pending_deletes.last().cloned() {
            self.delete_recorded(&pending.resource, &pending.state).await?;
            state.pending_deletes.pop();
            self.store.save(state)?;
        }
        Ok(())
    }

    async fn delete_recorded(&self, name: &str, entry: &ResourceState) -> EngineResult<()> {
        if entry.retain_on_delete {
            info!(resource = %name, "Keeping resource in place");
            return Ok(());
        }
        info!(resource = %name, kind = %entry.resource_type, "Deleting");
        self.provider
            .delete(entry.resource_type, &entry.outputs)
            .await
            .map_err(|source| EngineError::Provider {
                resource: name.to_string(),
                source,
            })
    }

    /// Delete every recorded resource of `stack` and drop its state
    pub async fn destroy(&self, stack: &str) -> EngineResult<Plan> {
        let update_id = Uuid::new_v4();
        let mut state = self.store.load(stack)?;
        state.last_update = Some(update_id);
        info!(stack = %stack, update = %update_id, "Starting destroy");
        let mut plan = Plan::default();

        self.drain_pending_deletes(&mut state).await?;
        for name in state.deletion_order()? {
            if let Some(entry) = state.resources.get(&name).cloned() {
                self.delete_recorded(&name, &entry).await?;
                plan.push(name.clone(), entry.resource_type, Action::Delete);
                state.resources.remove(&name);
                self.store.save(&mut state)?;
            }
        }

        self.store.remove(stack)?;
        info!(stack = %stack, deleted = plan.steps.len(), "Stack destroyed");
        Ok(plan)
    }

    /// Exports recorded by the last successful `up`
    pub fn outputs(&self, stack: &str) -> EngineResult<BTreeMap<String, String>> {
        let state: StackState = self.store.load(stack)?;
        Ok(state.outputs)
    }
}

/// How a changed resource gives way to its new version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Swap {
    /// Build or pull over the same tag; the old object needs no delete
    Overwrite,
    /// The new object takes the old one's name, so the old one goes first
    DeleteFirst,
    /// The new object has its own name; the old one is deleted after the update
    DeleteLater,
}

fn swap_for(resource: &Resource, previous: &ResourceState) -> Swap {
    let resource_type = resource.resource_type();
    if previous.resource_type != resource_type {
        return Swap::DeleteFirst;
    }
    let same_name = previous
        .outputs
        .get(&resource_type.name_attribute())
        .map(String::as_str)
        == Some(resource.object_name());
    match resource_type {
        _ if !same_name => Swap::DeleteLater,
        ResourceType::Image | ResourceType::RemoteImage => Swap::Overwrite,
        ResourceType::Network | ResourceType::Container => Swap::DeleteFirst,
    }
}

fn fingerprint(resolved: &Resource) -> EngineResult<String> {
    resolved
        .fingerprint()
        .map_err(|source| EngineError::Fingerprint {
            resource: resolved.name.clone(),
            source,
        })
}

struct Job<'a> {
    resource: &'a Resource,
    resolved: Resource,
    fingerprint: String,
    previous: Option<ResourceState>,
    dependencies: Vec<String>,
    evicted: bool,
}

struct Applied {
    name: String,
    action: Action,
    entry: ResourceState,
    retired: Option<ResourceState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_display() {
        let mut plan = Plan::default();
        plan.push("network", ResourceType::Network, Action::Create);
        plan.push("mongo", ResourceType::RemoteImage, Action::Same);
        plan.push("old", ResourceType::Container, Action::Delete);

        let rendered = plan.to_string();
        assert!(rendered.contains(" + docker:network"));
        assert!(rendered.contains("network"));
        assert!(rendered.contains(" - docker:container"));
        assert!(rendered.ends_with(
            "Resources: 1 to create, 0 to replace, 1 to delete, 1 unchanged"
        ));
    }

    #[test]
    fn test_plan_is_noop() {
        let mut plan = Plan::default();
        assert!(plan.is_noop());
        plan.push("mongo", ResourceType::RemoteImage, Action::Same);
        assert!(plan.is_noop());
        plan.push("network", ResourceType::Network, Action::Replace);
        assert!(!plan.is_noop());
        assert_eq!(plan.action_of("network"), Some(Action::Replace));
        assert_eq!(plan.action_of("missing"), None);
    }

    #[test]
    fn test_action_symbols() {
        assert_eq!(Action::Create.to_string(), " +");
        assert_eq!(Action::Replace.to_string(), "+-");
        assert_eq!(Action::Delete.to_string(), " -");
        assert_eq!(Action::Same.to_string(), "  ");
    }
}
