//! Per-stack record of applied resources.
//!
//! Stored as JSON at `<dir>/.cart-stack/<stack>.json`. Only fingerprints and
//! provider outputs (names, ids, digests) are written; secret values never
//! reach the file.

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use resources::{is_valid_object_name, Outputs, ResourceType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const STATE_DIR: &str = ".cart-stack";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write state file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("State belongs to stack '{found}', expected '{expected}'")]
    StackMismatch { expected: String, found: String },

    #[error("Recorded dependencies form a cycle at '{0}'")]
    Cycle(String),

    #[error("Invalid stack name '{0}': use letters, digits, '_', '.' or '-'")]
    InvalidStackName(String),
}

pub type StateResult<T> = Result<T, StateError>;

/// What was applied for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub resource_type: ResourceType,
    pub fingerprint: String,
    pub outputs: Outputs,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retain_on_delete: bool,
}

/// An object superseded during an update, removed once the update is done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelete {
    pub resource: String,
    pub state: ResourceState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackState {
    pub stack: String,
    pub updated_at: DateTime<Utc>,
    /// Id of the last `up` or `destroy` run that touched this state
    #[serde(default)]
    pub last_update: Option<Uuid>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_deletes: Vec<PendingDelete>,
}

impl StackState {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            updated_at: Utc::now(),
            last_update: None,
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            pending_deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.pending_deletes.is_empty()
    }

    /// Recorded resources that depend on `name`, directly or transitively
    pub fn dependents_of(&self, name: &str) -> HashSet<String> {
        let mut found = HashSet::new();
        let mut queue = vec![name.to_string()];
        while let Some(current) = queue.pop() {
            for (candidate, resource) in &self.resources {
                if resource.dependencies.contains(&current) && found.insert(candidate.clone()) {
                    queue.push(candidate.clone());
                }
            }
        }
        found
    }

    /// Recorded resources ordered so that dependents come before their
    /// predecessors. Dependencies on unrecorded resources are ignored.
    pub fn deletion_order(&self) -> StateResult<Vec<String>> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let index: HashMap<&str, NodeIndex> = self
            .resources
            .keys()
            .map(|name| (name.as_str(), graph.add_node(name.as_str())))
            .collect();

        for (name, resource) in &self.resources {
            for dep in &resource.dependencies {
                if let Some(&from) = index.get(dep.as_str()) {
                    graph.add_edge(from, index[name.as_str()], ());
                }
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| StateError::Cycle(graph[cycle.node_id()].to_string()))?;
        Ok(order
            .into_iter()
            .rev()
            .map(|node| graph[node].to_string())
            .collect())
    }
}

/// Loads and saves [`StackState`] files under a base directory
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            dir: base.as_ref().join(STATE_DIR),
        }
    }

    pub fn path(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stack))
    }

    /// The stack name becomes a file name, so it must not carry separators
    fn checked_path(&self, stack: &str) -> StateResult<PathBuf> {
        if !is_valid_object_name(stack) {
            return Err(StateError::InvalidStackName(stack.to_string()));
        }
        Ok(self.path(stack))
    }

    /// Load the state of `stack`, or an empty state when nothing was applied yet
    pub fn load(&self, stack: &str) -> StateResult<StackState> {
        let path = self.checked_path(stack)?;
        if !path.exists() {
            debug!(path = %path.display(), "No state file, starting empty");
            return Ok(StackState::new(stack));
        }

        let content = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let state: StackState =
            serde_json::from_str(&content).map_err(|source| StateError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;

        if state.stack != stack {
            return Err(StateError::StackMismatch {
                expected: stack.to_string(),
                found: state.stack,
            });
        }
        Ok(state)
    }

    pub fn save(&self, state: &mut StackState) -> StateResult<()> {
        let path = self.checked_path(&state.stack)?;
        let write_err = |source| StateError::Write {
            path: path.display().to_string(),
            source,
        };

        std::fs::create_dir_all(&self.dir).map_err(write_err)?;
        state.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(state).map_err(|source| StateError::Corrupt {
            path: path.display().to_string(),
            source,
        })?;

        // Write then rename so an interrupted save keeps the previous file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(write_err)?;
        std::fs::rename(&tmp, &path).map_err(write_err)?;
        debug!(path = %path.display(), resources = state.resources.len(), "State saved");
        Ok(())
    }

    /// Drop the state file of `stack`
    pub fn remove(&self, stack: &str) -> StateResult<()> {
        let path = self.checked_path(stack)?;
        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| StateError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}
