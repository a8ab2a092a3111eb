pub mod catalog;
pub mod manager;
pub mod remote;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::node::{Node, NodeContext, NodeError};

pub use catalog::{CodeKind, ModuleCatalog, ModuleDescriptor};
pub use manager::{LoadStatus, ModuleInfo, NodeHandle, NodeManager};

/// Builds a node instance for a given context.
pub type NodeFactory = Arc<dyn Fn(NodeContext) -> Result<Arc<dyn Node>, NodeError> + Send + Sync>;

/// Result code for load failures other than a missing artifact.
pub const LOAD_FAILED: i64 = -3;
/// Result code when a module's code artifact is not on disk.
pub const MISSING_ARTIFACT: i64 = -4;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("unknown node type {0}")]
    UnknownType(String),
    #[error("code artifact for {node_type} not found at {path}")]
    MissingArtifact { node_type: String, path: PathBuf },
    #[error("could not construct node {node_id} of type {node_type}: {source}")]
    Construction {
        node_type: String,
        node_id: String,
        #[source]
        source: NodeError,
    },
    #[error("node type {0} is being unloaded")]
    Locked(String),
}

impl ModuleError {
    pub fn code(&self) -> i64 {
        match self {
            ModuleError::MissingArtifact { .. } => MISSING_ARTIFACT,
            _ => LOAD_FAILED,
        }
    }
}
