pub mod history;
pub mod manager;
pub mod state;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use node_rpc::Fault;
use petgraph::Direction::Incoming;
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use history::{HistoryEntry, InputHistory};
pub use manager::{FlowManager, OutputItem, OutputSink};
pub use state::{FlowState, InvalidTransition};

/// Flow id under which config nodes are declared.
pub const GLOBAL_FLOW_ID: &str = "global";

/// Samples kept per output port for processing-time statistics.
pub const PROCESSING_TIME_SAMPLES: usize = 100;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("invalid flow declaration: {0}")]
    InvalidDeclaration(String),
    #[error("flow {0} is already running")]
    DuplicateFlow(String),
    #[error("unknown flow {0}")]
    UnknownFlow(String),
    #[error("node {node_id} already exists (flow {flow_id})")]
    DuplicateNode { flow_id: String, node_id: String },
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl FlowError {
    pub fn to_fault(&self) -> Fault {
        match self {
            FlowError::InvalidDeclaration(_) | FlowError::DuplicateNode { .. } => Fault::invalid_params(self.to_string()),
            _ => Fault::internal(self.to_string()),
        }
    }
}

/// One end of a connection: node id and port on that node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Wire {
    pub id: String,
    #[serde(default)]
    pub port: u32,
}

impl Wire {
    pub fn new(id: impl Into<String>, port: u32) -> Self {
        Self { id: id.into(), port }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortTimes {
    pub port: u32,
    pub samples: usize,
    pub average_us: u64,
    pub max_us: u64,
}

/// Ring of recent delivery durations per output port.
#[derive(Debug, Default)]
pub struct ProcessingTimes {
    ports: Mutex<Vec<VecDeque<Duration>>>,
}

impl ProcessingTimes {
    pub fn record(&self, port: u32, elapsed: Duration) {
        let mut ports = self.ports.lock().unwrap_or_else(|p| p.into_inner());
        let port = port as usize;
        if ports.len() <= port {
            ports.resize_with(port + 1, VecDeque::new);
        }
        let samples = &mut ports[port];
        if samples.len() == PROCESSING_TIME_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    pub fn summary(&self) -> Vec<PortTimes> {
        let ports = self.ports.lock().unwrap_or_else(|p| p.into_inner());
        ports
            .iter()
            .enumerate()
            .filter(|(_, samples)| !samples.is_empty())
            .map(|(port, samples)| {
                let total: Duration = samples.iter().sum();
                PortTimes {
                    port: port as u32,
                    samples: samples.len(),
                    average_us: (total / samples.len() as u32).as_micros() as u64,
                    max_us: samples.iter().max().copied().unwrap_or_default().as_micros() as u64,
                }
            })
            .collect()
    }
}

/// A node as declared in a flow, with its wiring resolved in both directions.
#[derive(Debug)]
pub struct NodeInfo {
    pub id: String,
    pub node_type: String,
    pub flow_id: String,
    pub declaration: Value,
    /// Outgoing connections per output port.
    pub wires_out: Vec<Vec<Wire>>,
    /// Incoming connections per input port; `Wire::port` is the source's output port.
    pub wires_in: Vec<Vec<Wire>>,
    processing_times: ProcessingTimes,
}

impl NodeInfo {
    pub fn from_declaration(flow_id: &str, declaration: &Value) -> Result<Self, FlowError> {
        let id = declaration
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FlowError::InvalidDeclaration(format!("node without id in flow {flow_id}")))?;
        let node_type = declaration
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| FlowError::InvalidDeclaration(format!("node {id} has no type")))?;
        Ok(Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            flow_id: flow_id.to_string(),
            declaration: declaration.clone(),
            wires_out: parse_wires(id, declaration.get("wires"))?,
            wires_in: Vec::new(),
            processing_times: ProcessingTimes::default(),
        })
    }

    pub fn output_count(&self) -> usize {
        self.wires_out.len()
    }

    pub fn is_config_node(&self) -> bool {
        self.flow_id == GLOBAL_FLOW_ID
    }

    pub fn record_processing_time(&self, port: u32, elapsed: Duration) {
        self.processing_times.record(port, elapsed);
    }

    pub fn processing_times(&self) -> Vec<PortTimes> {
        self.processing_times.summary()
    }
}

// `wires` is an array per output port; each target is either a bare node id
// (input port 0) or `{"id": .., "port": ..}`.
fn parse_wires(node_id: &str, wires: Option<&Value>) -> Result<Vec<Vec<Wire>>, FlowError> {
    let ports = match wires {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(ports)) => ports,
        Some(_) => return Err(FlowError::InvalidDeclaration(format!("wires of node {node_id} must be an array"))),
    };
    ports
        .iter()
        .map(|targets| {
            let Value::Array(targets) = targets else {
                return Err(FlowError::InvalidDeclaration(format!("output of node {node_id} must be an array")));
            };
            targets
                .iter()
                .map(|target| match target {
                    Value::String(id) => Ok(Wire::new(id.clone(), 0)),
                    Value::Object(_) => serde_json::from_value(target.clone())
                        .map_err(|e| FlowError::InvalidDeclaration(format!("bad wire on node {node_id}: {e}"))),
                    other => Err(FlowError::InvalidDeclaration(format!("bad wire on node {node_id}: {other}"))),
                })
                .collect()
        })
        .collect()
}

/// A started flow: its declaration, nodes in declaration order and lifecycle state.
#[derive(Debug)]
pub struct FlowInfo {
    pub id: String,
    pub declaration: Value,
    nodes: Vec<Arc<NodeInfo>>,
    cyclic: bool,
    state: Mutex<FlowState>,
}

impl FlowInfo {
    /// Parse the node declarations and compute `wires_in` for every node.
    /// Wires pointing outside this flow are kept on the sender but produce no
    /// incoming entry.
    pub fn build(flow_id: &str, declaration: Value, node_decls: &[Value]) -> Result<Self, FlowError> {
        let mut infos = node_decls
            .iter()
            .map(|decl| NodeInfo::from_declaration(flow_id, decl))
            .collect::<Result<Vec<_>, _>>()?;

        let mut graph: StableDiGraph<usize, (u32, u32)> = StableDiGraph::new();
        let mut index_of: HashMap<String, NodeIndex> = HashMap::with_capacity(infos.len());
        for (i, info) in infos.iter().enumerate() {
            if index_of.insert(info.id.clone(), graph.add_node(i)).is_some() {
                return Err(FlowError::DuplicateNode {
                    flow_id: flow_id.to_string(),
                    node_id: info.id.clone(),
                });
            }
        }
        for info in &infos {
            let from = index_of[&info.id];
            for (out_port, targets) in info.wires_out.iter().enumerate() {
                for wire in targets {
                    match index_of.get(&wire.id) {
                        Some(&to) => {
                            graph.add_edge(from, to, (out_port as u32, wire.port));
                        }
                        None => debug!(node_id = %info.id, target = %wire.id, "wire leaves flow {flow_id}"),
                    }
                }
            }
        }

        let mut incoming: Vec<Vec<Vec<Wire>>> = vec![Vec::new(); infos.len()];
        for idx in graph.node_indices() {
            let wires_in = &mut incoming[graph[idx]];
            for edge in graph.edges_directed(idx, Incoming) {
                let (out_port, in_port) = *edge.weight();
                let in_port = in_port as usize;
                if wires_in.len() <= in_port {
                    wires_in.resize_with(in_port + 1, Vec::new);
                }
                wires_in[in_port].push(Wire::new(infos[graph[edge.source()]].id.clone(), out_port));
            }
            for port in wires_in.iter_mut() {
                port.sort();
            }
        }
        for (info, wires_in) in infos.iter_mut().zip(incoming) {
            info.wires_in = wires_in;
        }

        let cyclic = petgraph::algo::is_cyclic_directed(&graph);
        if cyclic {
            debug!(%flow_id, "flow contains a cycle");
        }

        Ok(Self {
            id: flow_id.to_string(),
            declaration,
            nodes: infos.into_iter().map(Arc::new).collect(),
            cyclic,
            state: Mutex::new(FlowState::Declared),
        })
    }

    pub fn nodes(&self) -> &[Arc<NodeInfo>] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Arc<NodeInfo>> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    pub fn is_global(&self) -> bool {
        self.id == GLOBAL_FLOW_ID
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move to `next`, returning the previous state.
    pub fn advance(&self, next: FlowState) -> Result<FlowState, InvalidTransition> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let previous = *state;
        if !previous.can_advance_to(next) {
            return Err(InvalidTransition {
                flow_id: self.id.clone(),
                from: previous,
                to: next,
            });
        }
        *state = next;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(nodes: Value) -> FlowInfo {
        FlowInfo::build("f1", json!({"id": "f1"}), nodes.as_array().unwrap()).unwrap()
    }

    #[test]
    fn wires_in_is_inverse_of_wires_out() {
        let flow = build(json!([
            {"id": "a", "type": "passthrough", "wires": [["b", {"id": "c", "port": 1}], ["c"]]},
            {"id": "b", "type": "passthrough", "wires": [["c"]]},
            {"id": "c", "type": "passthrough", "wires": []},
        ]));
        let c = flow.node("c").unwrap();
        assert_eq!(c.wires_in.len(), 2);
        assert_eq!(c.wires_in[0], vec![Wire::new("a", 1), Wire::new("b", 0)]);
        assert_eq!(c.wires_in[1], vec![Wire::new("a", 0)]);
        assert_eq!(flow.node("b").unwrap().wires_in, vec![vec![Wire::new("a", 0)]]);
        assert!(flow.node("a").unwrap().wires_in.is_empty());
        assert!(!flow.is_cyclic());
    }

    #[test]
    fn wires_to_other_flows_are_kept_outgoing_only() {
        let flow = build(json!([{"id": "a", "type": "t", "wires": [["elsewhere"]]}]));
        let a = flow.node("a").unwrap();
        assert_eq!(a.output_count(), 1);
        assert!(a.wires_in.is_empty());
    }

    #[test]
    fn duplicate_ids_and_missing_fields_are_rejected() {
        let dup = FlowInfo::build("f", json!({}), &[json!({"id": "a", "type": "t"}), json!({"id": "a", "type": "t"})]);
        assert!(matches!(dup, Err(FlowError::DuplicateNode { .. })));
        let no_type = FlowInfo::build("f", json!({}), &[json!({"id": "a"})]);
        assert!(matches!(no_type, Err(FlowError::InvalidDeclaration(_))));
        let bad_wires = FlowInfo::build("f", json!({}), &[json!({"id": "a", "type": "t", "wires": [[42]]})]);
        assert!(matches!(bad_wires, Err(FlowError::InvalidDeclaration(_))));
    }

    #[test]
    fn cycles_are_detected() {
        let flow = build(json!([
            {"id": "a", "type": "t", "wires": [["b"]]},
            {"id": "b", "type": "t", "wires": [["a"]]},
        ]));
        assert!(flow.is_cyclic());
    }

    #[test]
    fn processing_times_keep_last_samples() {
        let times = ProcessingTimes::default();
        for ms in 1..=150u64 {
            times.record(1, Duration::from_millis(ms));
        }
        let summary = times.summary();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].port, 1);
        assert_eq!(summary[0].samples, PROCESSING_TIME_SAMPLES);
        assert_eq!(summary[0].max_us, 150_000);
        // samples 51..=150
        assert_eq!(summary[0].average_us, 100_500);
    }

    #[test]
    fn state_transitions_are_checked() {
        let flow = build(json!([]));
        assert_eq!(flow.advance(FlowState::NodesLoaded).unwrap(), FlowState::Declared);
        assert!(flow.advance(FlowState::Running).is_err());
        assert_eq!(flow.state(), FlowState::NodesLoaded);
    }
}
