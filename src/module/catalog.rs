use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;
use tracing::{debug, info, warn};

use crate::node::{Node, NodeContext, NodeError};

use super::NodeFactory;

pub const MANIFEST_FILE: &str = "package.json";

/// How a node type's code is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CodeKind {
    /// Compiled into this process, built by a registered factory.
    #[default]
    Native,
    /// Runs in the coordinator's execution backend, reached over RPC.
    Managed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    pub node_type: String,
    pub package: String,
    pub kind: CodeKind,
    pub artifact: Option<PathBuf>,
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    name: Option<String>,
    #[serde(default)]
    nodes: HashMap<String, ManifestNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestNode {
    #[serde(default)]
    code: CodeKind,
    file: Option<String>,
    max_concurrency: Option<usize>,
}

/// Known node types: descriptors discovered on disk plus factories for
/// natively compiled types.
#[derive(Default)]
pub struct ModuleCatalog {
    descriptors: DashMap<String, ModuleDescriptor>,
    natives: DashMap<String, NodeFactory>,
}

impl std::fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("descriptors", &self.descriptors.len())
            .field("natives", &self.natives.len())
            .finish()
    }
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process node type. A descriptor without artifact is
    /// added unless discovery already described the type.
    pub fn register_native<F>(&self, node_type: &str, factory: F)
    where
        F: Fn(NodeContext) -> Result<Arc<dyn Node>, NodeError> + Send + Sync + 'static,
    {
        self.natives.insert(node_type.to_string(), Arc::new(factory));
        self.descriptors.entry(node_type.to_string()).or_insert_with(|| ModuleDescriptor {
            node_type: node_type.to_string(),
            package: "builtin".to_string(),
            kind: CodeKind::Native,
            artifact: None,
            max_concurrency: None,
        });
    }

    pub fn register(&self, descriptor: ModuleDescriptor) {
        self.descriptors.insert(descriptor.node_type.clone(), descriptor);
    }

    /// Scan `<nodes_path>/<package>/package.json` manifests. Unreadable or
    /// malformed manifests are logged and skipped. Returns the number of node
    /// types found.
    pub fn discover(&self, nodes_path: &Path) -> std::io::Result<usize> {
        let mut found = 0;
        for entry in fs::read_dir(nodes_path)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                debug!(dir = %dir.display(), "no {MANIFEST_FILE}, skipping");
                continue;
            }
            let manifest: PackageManifest = match fs::read_to_string(&manifest_path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()))
            {
                Ok(manifest) => manifest,
                Err(error) => {
                    warn!(path = %manifest_path.display(), %error, "invalid package manifest");
                    continue;
                }
            };
            let package = manifest
                .name
                .clone()
                .unwrap_or_else(|| dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
            for (node_type, node) in manifest.nodes {
                self.register(ModuleDescriptor {
                    node_type,
                    package: package.clone(),
                    kind: node.code,
                    artifact: node.file.map(|file| dir.join(file)),
                    max_concurrency: node.max_concurrency,
                });
                found += 1;
            }
        }
        info!(path = %nodes_path.display(), node_types = found, "node discovery finished");
        Ok(found)
    }

    /// Look a type up; on a miss, retry with spaces replaced by dashes.
    pub fn resolve(&self, node_type: &str) -> Option<ModuleDescriptor> {
        if let Some(d) = self.descriptors.get(node_type) {
            return Some(d.clone());
        }
        let dashed = node_type.replace(' ', "-");
        if dashed == node_type {
            return None;
        }
        self.descriptors.get(&dashed).map(|d| d.clone())
    }

    pub fn native_factory(&self, node_type: &str) -> Option<NodeFactory> {
        self.natives.get(node_type).map(|f| f.clone())
    }

    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        let mut all: Vec<_> = self.descriptors.iter().map(|d| d.clone()).collect();
        all.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::NodeInfo;
    use crate::message::Message;
    use tempfile::tempdir;

    struct Nop;
    impl Node for Nop {
        fn input(&self, _info: &NodeInfo, _port: u32, _message: Message) {}
    }

    #[test]
    fn discovers_manifests_and_skips_garbage() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("lights");
        fs::create_dir(&pkg).unwrap();
        fs::write(
            pkg.join(MANIFEST_FILE),
            r#"{"name": "lights", "nodes": {
                "light-switch": {"code": "managed", "file": "switch.js", "maxConcurrency": 4},
                "dimmer": {"file": "dimmer.so"}
            }}"#,
        )
        .unwrap();
        let broken = dir.path().join("broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join(MANIFEST_FILE), "{not json").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let catalog = ModuleCatalog::new();
        assert_eq!(catalog.discover(dir.path()).unwrap(), 2);

        let switch = catalog.resolve("light-switch").unwrap();
        assert_eq!(switch.kind, CodeKind::Managed);
        assert_eq!(switch.package, "lights");
        assert_eq!(switch.artifact, Some(pkg.join("switch.js")));
        assert_eq!(switch.max_concurrency, Some(4));
        assert_eq!(catalog.resolve("dimmer").unwrap().kind, CodeKind::Native);
    }

    #[test]
    fn resolve_falls_back_to_dashes() {
        let catalog = ModuleCatalog::new();
        catalog.register_native("light-switch", |_| Ok(Arc::new(Nop) as Arc<dyn Node>));
        assert_eq!(catalog.resolve("light switch").unwrap().node_type, "light-switch");
        assert!(catalog.resolve("light").is_none());
        assert!(catalog.native_factory("light-switch").is_some());
    }

    #[test]
    fn discovery_keeps_artifact_for_native_types() {
        let dir = tempdir().unwrap();
        let pkg = dir.path().join("p");
        fs::create_dir(&pkg).unwrap();
        fs::write(pkg.join(MANIFEST_FILE), r#"{"nodes": {"t": {"file": "t.so"}}}"#).unwrap();

        let catalog = ModuleCatalog::new();
        catalog.discover(dir.path()).unwrap();
        catalog.register_native("t", |_| Ok(Arc::new(Nop) as Arc<dyn Node>));
        let t = catalog.resolve("t").unwrap();
        assert_eq!(t.package, "p");
        assert_eq!(t.artifact, Some(pkg.join("t.so")));
    }
}
