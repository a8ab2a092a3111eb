use std::cell::Cell;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use node_rpc::dispatch::panic_message;
use serde_json::{Value, json};
use tracing::{debug, error, info, trace, warn};

use crate::logger::LogLevel;
use crate::message::Message;
use crate::module::NodeManager;
use crate::node::{ErrorSource, Node, NodeContext, NodeHost};
use crate::subscription::{EventBroadcaster, SubscriptionRegistry};
use crate::telemetry::{self, NodeMetrics};

use super::{FlowError, FlowInfo, FlowState, InputHistory, NodeInfo};

/// Nested synchronous deliveries allowed on one thread before further hops
/// go through the output queue.
pub const MAX_SYNC_DEPTH: usize = 64;

thread_local! {
    static SYNC_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// An asynchronous delivery waiting in the output queue.
#[derive(Debug, Clone)]
pub struct OutputItem {
    pub source_node: String,
    pub source_port: u32,
    pub target_node: String,
    pub target_port: u32,
    pub message: Message,
}

/// Where asynchronous deliveries are queued. Returns false when the item was
/// dropped.
pub trait OutputSink: Send + Sync {
    fn enqueue_output(&self, item: OutputItem) -> bool;
}

/// Running flows, their nodes' wiring, and message delivery between them.
pub struct FlowManager {
    nodes: Arc<NodeManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    history: InputHistory,
    flows: DashMap<String, Arc<FlowInfo>>,
    node_infos: DashMap<String, Arc<NodeInfo>>,
    fixed_inputs: DashMap<(String, u32), Value>,
    host: Weak<dyn NodeHost>,
    output: Weak<dyn OutputSink>,
    metrics: NodeMetrics,
}

impl std::fmt::Debug for FlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowManager")
            .field("flows", &self.flows.len())
            .field("nodes", &self.node_infos.len())
            .finish()
    }
}

impl FlowManager {
    pub fn new(
        nodes: Arc<NodeManager>,
        subscriptions: Arc<SubscriptionRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        history_size: usize,
        host: Weak<dyn NodeHost>,
        output: Weak<dyn OutputSink>,
    ) -> Self {
        Self {
            nodes,
            subscriptions,
            broadcaster,
            history: InputHistory::new(history_size),
            flows: DashMap::new(),
            node_infos: DashMap::new(),
            fixed_inputs: DashMap::new(),
            host,
            output,
            metrics: NodeMetrics::new(&telemetry::meter()),
        }
    }

    pub fn with_metrics(mut self, metrics: NodeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Register a flow, load and init its nodes. Nodes that fail to load or
    /// init are logged and left out; the flow still starts. Returns the number
    /// of nodes initialised.
    pub fn start_flow(&self, declaration: &Value, node_decls: &[Value]) -> Result<usize, FlowError> {
        let flow_id = declaration
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FlowError::InvalidDeclaration("flow has no id".into()))?;
        let flow = Arc::new(FlowInfo::build(flow_id, declaration.clone(), node_decls)?);
        if let Some(taken) = flow.nodes().iter().find(|n| self.node_infos.contains_key(&n.id)) {
            return Err(FlowError::DuplicateNode {
                flow_id: flow_id.to_string(),
                node_id: taken.id.clone(),
            });
        }
        match self.flows.entry(flow_id.to_string()) {
            Entry::Occupied(_) => return Err(FlowError::DuplicateFlow(flow_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(flow.clone());
            }
        }

        let mut initialised = 0;
        for info in flow.nodes() {
            self.node_infos.insert(info.id.clone(), info.clone());
            let ctx = NodeContext::new(&info.id, &info.node_type, &info.flow_id, self.host.clone());
            let node = match self.nodes.load_node(&info.node_type, &info.id, ctx) {
                Ok((node, _)) => node,
                Err(e) => {
                    error!(node_id = %info.id, node_type = %info.node_type, code = e.code(), error = %e, "could not load node");
                    continue;
                }
            };
            let ok = catch_unwind(AssertUnwindSafe(|| node.init(info))).unwrap_or_else(|panic| {
                error!(node_id = %info.id, reason = %panic_message(&panic), "node init panicked");
                false
            });
            drop(node);
            if ok {
                initialised += 1;
            } else {
                error!(node_id = %info.id, node_type = %info.node_type, "node init failed, unloading");
                self.nodes.unload_node(&info.id);
            }
        }
        flow.advance(FlowState::NodesLoaded)?;
        info!(%flow_id, nodes = flow.nodes().len(), initialised, "flow started");
        Ok(initialised)
    }

    // Global flow first so config nodes come up before their users.
    fn flows_in(&self, state: FlowState) -> Vec<Arc<FlowInfo>> {
        let mut flows: Vec<_> = self
            .flows
            .iter()
            .filter(|f| f.state() == state)
            .map(|f| f.value().clone())
            .collect();
        flows.sort_by(|a, b| b.is_global().cmp(&a.is_global()).then_with(|| a.id.cmp(&b.id)));
        flows
    }

    fn each_node(&self, flow: &FlowInfo, phase: &str, action: impl Fn(&NodeInfo, &dyn Node)) {
        for info in flow.nodes() {
            let Some(node) = self.nodes.get_node(&info.id) else {
                continue;
            };
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| action(info, &*node))) {
                error!(node_id = %info.id, phase, reason = %panic_message(&panic), "node panicked");
            }
        }
    }

    // Advance every flow in `from` to `to`, then run `action` on its nodes.
    fn run_phase(&self, from: FlowState, to: FlowState, phase: &str, action: impl Fn(&NodeInfo, &dyn Node)) -> usize {
        let flows = self.flows_in(from);
        for flow in &flows {
            if let Err(e) = flow.advance(to) {
                warn!(error = %e, "skipping flow");
                continue;
            }
            self.each_node(flow, phase, &action);
        }
        debug!(phase, flows = flows.len(), "phase complete");
        flows.len()
    }

    pub fn start_nodes(&self) -> usize {
        self.run_phase(FlowState::NodesLoaded, FlowState::Started, "start", |info, node| {
            if !node.start() {
                warn!(node_id = %info.id, "node failed to start");
            }
        })
    }

    pub fn config_nodes_started(&self) -> usize {
        self.run_phase(FlowState::Started, FlowState::ConfigNodesReady, "configNodesStarted", |_, node| {
            node.config_nodes_started()
        })
    }

    pub fn start_up_complete(&self) -> usize {
        self.run_phase(FlowState::ConfigNodesReady, FlowState::Running, "startUpComplete", |_, node| {
            node.start_up_complete()
        })
    }

    /// Tell the nodes of every active flow to stop.
    pub fn stop_nodes(&self) -> usize {
        let mut stopped = 0;
        for state in [FlowState::Running, FlowState::ConfigNodesReady, FlowState::Started, FlowState::NodesLoaded] {
            stopped += self.run_phase(state, FlowState::Stopping, "stop", |_, node| node.stop());
        }
        stopped
    }

    pub fn wait_for_nodes_stopped(&self) -> usize {
        self.run_phase(FlowState::Stopping, FlowState::NodesStopped, "waitForStop", |_, node| node.wait_for_stop())
    }

    /// Stop (if still active), unload and forget a flow.
    pub fn stop_flow(&self, flow_id: &str) -> Result<(), FlowError> {
        let (_, flow) = self
            .flows
            .remove(flow_id)
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        if flow.state().can_advance_to(FlowState::Stopping) && flow.advance(FlowState::Stopping).is_ok() {
            self.each_node(&flow, "stop", |_, node| node.stop());
        }
        if flow.advance(FlowState::NodesStopped).is_ok() {
            self.each_node(&flow, "waitForStop", |_, node| node.wait_for_stop());
        }
        for info in flow.nodes() {
            self.subscriptions.unsubscribe_all(&info.id);
            self.history.clear_node(&info.id);
            self.fixed_inputs.retain(|(node_id, _), _| node_id != &info.id);
            self.node_infos.remove(&info.id);
            self.nodes.unload_node(&info.id);
        }
        flow.advance(FlowState::Disposed)?;
        info!(%flow_id, "flow stopped");
        Ok(())
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn flow_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.flows.iter().map(|f| f.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn flow_state(&self, flow_id: &str) -> Option<FlowState> {
        self.flows.get(flow_id).map(|f| f.state())
    }

    pub fn node_info(&self, node_id: &str) -> Option<Arc<NodeInfo>> {
        self.node_infos.get(node_id).map(|n| n.value().clone())
    }

    pub fn error_source(&self, node_id: &str) -> ErrorSource {
        let flow_id = self
            .node_info(node_id)
            .map(|info| info.flow_id.clone())
            .unwrap_or_default();
        ErrorSource::new(node_id, flow_id)
    }

    /// Route a node output to every wire on `port`. Synchronous outputs are
    /// delivered on the calling thread before this returns.
    pub fn queue_output(&self, node_id: &str, port: u32, mut message: Message, synchronous: bool) {
        let Some(source) = self.node_info(node_id) else {
            debug!(%node_id, "output from node outside any flow dropped");
            return;
        };
        let Some(targets) = source.wires_out.get(port as usize) else {
            warn!(%node_id, port, outputs = source.output_count(), "output port out of range, message dropped");
            return;
        };
        let synchronous = synchronous || message.is_synchronous_output();
        let last = targets.len().saturating_sub(1);
        for (i, wire) in targets.iter().enumerate() {
            let mut msg = if i == last { std::mem::take(&mut message) } else { message.clone() };
            if let Some(fixed) = self.fixed_inputs.get(&(wire.id.clone(), wire.port)) {
                msg.set_payload(fixed.value().clone());
            }
            if synchronous {
                let depth = SYNC_DEPTH.with(Cell::get);
                if depth < MAX_SYNC_DEPTH {
                    msg.set_synchronous_output(true);
                    SYNC_DEPTH.with(|d| d.set(depth + 1));
                    let started = Instant::now();
                    self.deliver(&wire.id, wire.port, msg);
                    self.record_processing(&source, port, started.elapsed());
                    SYNC_DEPTH.with(|d| d.set(depth));
                    continue;
                }
                warn!(%node_id, target = %wire.id, depth, "synchronous chain too deep, queueing");
                msg.set_synchronous_output(false);
            }
            self.enqueue(OutputItem {
                source_node: node_id.to_string(),
                source_port: port,
                target_node: wire.id.clone(),
                target_port: wire.port,
                message: msg,
            });
        }
    }

    fn enqueue(&self, item: OutputItem) {
        match self.output.upgrade() {
            Some(sink) => {
                if !sink.enqueue_output(item) {
                    trace!("output dropped");
                }
            }
            None => debug!(target = %item.target_node, "no output queue, message dropped"),
        }
    }

    /// Run one queued delivery on the current (output queue) thread.
    pub fn process_output_item(&self, item: OutputItem) {
        let started = Instant::now();
        self.deliver(&item.target_node, item.target_port, item.message);
        if let Some(source) = self.node_info(&item.source_node) {
            self.record_processing(&source, item.source_port, started.elapsed());
        }
    }

    fn record_processing(&self, source: &NodeInfo, port: u32, elapsed: Duration) {
        source.record_processing_time(port, elapsed);
        self.metrics.record(&source.node_type, port, elapsed);
    }

    /// Inject a message from the coordinator. False when the node is unknown
    /// or not loaded.
    pub fn node_input(&self, node_id: &str, port: u32, mut message: Message, synchronous: bool) -> bool {
        if synchronous {
            message.set_synchronous_output(true);
        }
        self.deliver(node_id, port, message)
    }

    fn deliver(&self, node_id: &str, port: u32, message: Message) -> bool {
        let Some(info) = self.node_info(node_id) else {
            debug!(%node_id, "target is not part of a running flow");
            return false;
        };
        let Some(node) = self.nodes.get_node(node_id) else {
            debug!(%node_id, "target not available");
            return false;
        };
        if self.history.is_enabled() {
            self.history.record(node_id, port, &message.to_value());
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| node.input(&info, port, message))) {
            let reason = panic_message(&panic);
            error!(%node_id, port, %reason, "node input panicked");
            drop(node);
            let source = ErrorSource::new(node_id, info.flow_id.clone());
            self.broadcaster.error(&source, LogLevel::Error, &format!("input failed: {reason}"));
        }
        true
    }

    pub fn set_fixed_input(&self, node_id: &str, port: u32, value: Value) {
        self.fixed_inputs.insert((node_id.to_string(), port), value);
    }

    pub fn remove_fixed_input(&self, node_id: &str, port: u32) -> bool {
        self.fixed_inputs.remove(&(node_id.to_string(), port)).is_some()
    }

    pub fn input_history(&self) -> &InputHistory {
        &self.history
    }

    /// `{nodeId: [{port, samples, averageUs, maxUs}]}` for nodes with samples.
    pub fn processing_times(&self) -> Value {
        let times: BTreeMap<String, Value> = self
            .node_infos
            .iter()
            .filter_map(|info| {
                let summary = info.processing_times();
                (!summary.is_empty()).then(|| (info.key().clone(), json!(summary)))
            })
            .collect();
        json!(times)
    }

    /// Stop every flow.
    pub fn dispose(&self) {
        for flow_id in self.flow_ids() {
            if let Err(e) = self.stop_flow(&flow_id) {
                warn!(%flow_id, error = %e, "could not stop flow");
            }
        }
        self.fixed_inputs.clear();
        self.history.clear();
    }
}
