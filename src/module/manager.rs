use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::sync::WaitGroup;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::node::{Node, NodeContext};

use super::catalog::{CodeKind, ModuleCatalog, ModuleDescriptor};
use super::{ModuleError, NodeFactory, remote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    AlreadyLoaded,
}

impl LoadStatus {
    pub fn code(self) -> i64 {
        match self {
            LoadStatus::Loaded => 0,
            LoadStatus::AlreadyLoaded => 1,
        }
    }
}

#[derive(Default)]
struct ModuleState {
    reference_count: usize,
    // unloads currently draining
    unloading: usize,
    factory: Option<NodeFactory>,
}

/// Per-type bookkeeping: how many instances exist and whether the type is
/// mid-unload.
pub struct ModuleInfo {
    descriptor: ModuleDescriptor,
    state: Mutex<ModuleState>,
}

impl std::fmt::Debug for ModuleInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInfo")
            .field("node_type", &self.descriptor.node_type)
            .field("reference_count", &self.reference_count())
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl ModuleInfo {
    fn new(descriptor: ModuleDescriptor) -> Self {
        Self { descriptor, state: Mutex::new(ModuleState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, ModuleState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn reference_count(&self) -> usize {
        self.state().reference_count
    }

    pub fn is_locked(&self) -> bool {
        self.state().unloading > 0
    }

    pub fn is_loaded(&self) -> bool {
        self.state().factory.is_some()
    }
}

struct NodeEntry {
    node: Arc<dyn Node>,
    module: Arc<ModuleInfo>,
    // every handed-out NodeHandle holds a clone
    leases: WaitGroup,
}

/// A node lent out by the registry. While any handle is alive, unloading the
/// node waits.
pub struct NodeHandle {
    node: Arc<dyn Node>,
    _lease: WaitGroup,
}

impl Clone for NodeHandle {
    fn clone(&self) -> Self {
        Self { node: self.node.clone(), _lease: self._lease.clone() }
    }
}

impl Deref for NodeHandle {
    type Target = dyn Node;

    fn deref(&self) -> &Self::Target {
        &*self.node
    }
}

/// Node instances by id, with reference-counted module loading per type.
pub struct NodeManager {
    catalog: Arc<ModuleCatalog>,
    modules: DashMap<String, Arc<ModuleInfo>>,
    nodes: Mutex<HashMap<String, NodeEntry>>,
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("modules", &self.modules.len())
            .field("nodes", &self.node_count())
            .finish()
    }
}

impl NodeManager {
    pub fn new(catalog: Arc<ModuleCatalog>) -> Self {
        Self { catalog, modules: DashMap::new(), nodes: Mutex::new(HashMap::new()) }
    }

    pub fn catalog(&self) -> &Arc<ModuleCatalog> {
        &self.catalog
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<String, NodeEntry>> {
        self.nodes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn module_for(&self, node_type: &str) -> Result<Arc<ModuleInfo>, ModuleError> {
        let descriptor = self
            .catalog
            .resolve(node_type)
            .ok_or_else(|| ModuleError::UnknownType(node_type.to_string()))?;
        Ok(self
            .modules
            .entry(descriptor.node_type.clone())
            .or_insert_with(|| Arc::new(ModuleInfo::new(descriptor)))
            .clone())
    }

    fn load_factory(&self, descriptor: &ModuleDescriptor) -> Result<NodeFactory, ModuleError> {
        if let Some(path) = &descriptor.artifact {
            if !path.exists() {
                return Err(ModuleError::MissingArtifact {
                    node_type: descriptor.node_type.clone(),
                    path: path.clone(),
                });
            }
        }
        let factory = match descriptor.kind {
            CodeKind::Native => self
                .catalog
                .native_factory(&descriptor.node_type)
                .ok_or_else(|| ModuleError::UnknownType(descriptor.node_type.clone()))?,
            CodeKind::Managed => remote::factory(),
        };
        info!(node_type = %descriptor.node_type, kind = ?descriptor.kind, "module loaded");
        Ok(factory)
    }

    /// Return the instance for `node_id`, creating it if needed.
    pub fn load_node(&self, node_type: &str, node_id: &str, ctx: NodeContext) -> Result<(NodeHandle, LoadStatus), ModuleError> {
        if let Some(entry) = self.nodes().get(node_id) {
            return Ok((
                NodeHandle { node: entry.node.clone(), _lease: entry.leases.clone() },
                LoadStatus::AlreadyLoaded,
            ));
        }

        let module = self.module_for(node_type)?;
        let factory = {
            let mut state = module.state();
            if state.unloading > 0 {
                return Err(ModuleError::Locked(module.descriptor.node_type.clone()));
            }
            let factory = match &state.factory {
                Some(factory) => factory.clone(),
                None => {
                    let factory = self.load_factory(&module.descriptor)?;
                    state.factory = Some(factory.clone());
                    factory
                }
            };
            // reserve before constructing so a concurrent unload keeps the module
            state.reference_count += 1;
            factory
        };

        let node = match factory(ctx) {
            Ok(node) => node,
            Err(source) => {
                self.release(&module);
                return Err(ModuleError::Construction {
                    node_type: module.descriptor.node_type.clone(),
                    node_id: node_id.to_string(),
                    source,
                });
            }
        };

        let mut nodes = self.nodes();
        if let Some(existing) = nodes.get(node_id) {
            // lost a race with another loader of the same id
            let handle = NodeHandle { node: existing.node.clone(), _lease: existing.leases.clone() };
            drop(nodes);
            self.release(&module);
            return Ok((handle, LoadStatus::AlreadyLoaded));
        }
        let leases = WaitGroup::new();
        let handle = NodeHandle { node: node.clone(), _lease: leases.clone() };
        nodes.insert(node_id.to_string(), NodeEntry { node, module, leases });
        debug!(%node_id, %node_type, "node loaded");
        Ok((handle, LoadStatus::Loaded))
    }

    // Drop one reference; the last one unloads the module.
    fn release(&self, module: &ModuleInfo) {
        let mut state = module.state();
        state.reference_count = state.reference_count.saturating_sub(1);
        if state.reference_count == 0 && state.factory.take().is_some() {
            info!(node_type = %module.descriptor.node_type, "module unloaded");
        }
    }

    /// Remove a node. Blocks until every outstanding handle to it is dropped.
    /// Removing the last instance of a type locks the type while it drains,
    /// then unloads the module.
    pub fn unload_node(&self, node_id: &str) -> bool {
        let Some(entry) = self.nodes().remove(node_id) else {
            return false;
        };
        let NodeEntry { node, module, leases } = entry;
        drop(node);
        let last = {
            let mut state = module.state();
            state.reference_count = state.reference_count.saturating_sub(1);
            if state.reference_count == 0 {
                state.unloading += 1;
            }
            state.reference_count == 0
        };
        leases.wait();
        if last {
            let mut state = module.state();
            if state.reference_count == 0 && state.factory.take().is_some() {
                info!(node_type = %module.descriptor.node_type, "module unloaded");
            }
            state.unloading -= 1;
        }
        debug!(%node_id, last, "node unloaded");
        true
    }

    pub fn unload_all(&self) {
        let ids: Vec<String> = self.nodes().keys().cloned().collect();
        for id in ids {
            self.unload_node(&id);
        }
    }

    /// `None` for unknown ids and for nodes whose type is mid-unload.
    pub fn get_node(&self, node_id: &str) -> Option<NodeHandle> {
        let nodes = self.nodes();
        let entry = nodes.get(node_id)?;
        if entry.module.is_locked() {
            return None;
        }
        Some(NodeHandle { node: entry.node.clone(), _lease: entry.leases.clone() })
    }

    pub fn node_type(&self, node_id: &str) -> Option<String> {
        self.nodes().get(node_id).map(|e| e.module.descriptor.node_type.clone())
    }

    pub fn module_info(&self, node_type: &str) -> Option<Arc<ModuleInfo>> {
        if let Some(m) = self.modules.get(node_type) {
            return Some(m.clone());
        }
        let resolved = self.catalog.resolve(node_type)?;
        self.modules.get(&resolved.node_type).map(|m| m.clone())
    }

    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.nodes().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for NodeManager {
    fn drop(&mut self) {
        let remaining = self.node_count();
        if remaining > 0 {
            warn!(nodes = remaining, "node manager dropped with nodes still loaded");
        }
    }
}
