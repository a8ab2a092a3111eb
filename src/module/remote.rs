use std::sync::Arc;

use node_rpc::{Method, RpcResult};
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::flow::NodeInfo;
use crate::logger::LogLevel;
use crate::message::Message;
use crate::node::{ErrorSource, Node, NodeContext};

use super::NodeFactory;

/// Factory for node types executed by the coordinator's managed backend.
pub fn factory() -> NodeFactory {
    Arc::new(|ctx| Ok(Arc::new(RemoteNode::new(ctx)) as Arc<dyn Node>))
}

/// Local stand-in for a managed node: lifecycle calls, inputs and events are
/// forwarded as `remoteNodeMethod` / `remoteNodeInput` requests.
#[derive(Debug)]
pub struct RemoteNode {
    ctx: NodeContext,
}

impl RemoteNode {
    pub fn new(ctx: NodeContext) -> Self {
        Self { ctx }
    }

    fn call(&self, method: &str, args: Vec<Value>, wait: bool) -> RpcResult {
        self.ctx.invoke_with(
            Method::RemoteNodeMethod.as_ref(),
            vec![json!(self.ctx.node_id()), json!(method), Value::Array(args)],
            wait,
        )
    }

    // Lifecycle calls answer with a bool; a fault counts as failure.
    fn call_bool(&self, method: &str, args: Vec<Value>) -> bool {
        match self.call(method, args, true) {
            Ok(value) => value.as_bool().unwrap_or(true),
            Err(fault) => {
                error!(node_id = %self.ctx.node_id(), method, %fault, "managed node call failed");
                false
            }
        }
    }

    fn notify(&self, method: &str, args: Vec<Value>) {
        if let Err(fault) = self.call(method, args, false) {
            warn!(node_id = %self.ctx.node_id(), method, %fault, "could not notify managed node");
        }
    }
}

impl Node for RemoteNode {
    fn init(&self, info: &NodeInfo) -> bool {
        self.call_bool("init", vec![info.declaration.clone()])
    }

    fn start(&self) -> bool {
        self.call_bool("start", Vec::new())
    }

    fn config_nodes_started(&self) {
        self.notify("configNodesStarted", Vec::new());
    }

    fn start_up_complete(&self) {
        self.notify("startUpComplete", Vec::new());
    }

    fn stop(&self) {
        self.notify("stop", Vec::new());
    }

    fn wait_for_stop(&self) {
        self.call_bool("waitForStop", Vec::new());
    }

    fn input(&self, _info: &NodeInfo, port: u32, message: Message) {
        let wait = message.is_synchronous_output();
        let args = vec![json!(self.ctx.node_id()), json!(port), message.into_value()];
        if let Err(fault) = self.ctx.invoke_with(Method::RemoteNodeInput.as_ref(), args, wait) {
            warn!(node_id = %self.ctx.node_id(), port, %fault, "input to managed node failed");
        }
    }

    fn invoke_local(&self, method: &str, params: &[Value]) -> RpcResult {
        self.call(method, params.to_vec(), true)
    }

    fn variable_event(&self, source: &str, peer_id: u64, channel: i32, variable: &str, value: &Value) {
        self.notify("variableEvent", vec![json!(source), json!(peer_id), json!(channel), json!(variable), value.clone()]);
    }

    fn flow_variable_event(&self, flow_id: &str, variable: &str, value: &Value) {
        self.notify("flowVariableEvent", vec![json!(flow_id), json!(variable), value.clone()]);
    }

    fn global_variable_event(&self, variable: &str, value: &Value) {
        self.notify("globalVariableEvent", vec![json!(variable), value.clone()]);
    }

    fn homegear_event(&self, event_type: &str, data: &Value) {
        self.notify("homegearEvent", vec![json!(event_type), data.clone()]);
    }

    fn status_event(&self, node_id: &str, status: &Value) {
        self.notify("statusEvent", vec![json!(node_id), status.clone()]);
    }

    fn error_event(&self, source: &ErrorSource, level: LogLevel, message: &str) -> bool {
        let args = vec![
            json!(source.node_id),
            json!(source.flow_id),
            json!(source.is_config_node()),
            json!(level.level_number()),
            json!(message),
        ];
        match self.call("errorEvent", args, true) {
            Ok(handled) => handled.as_bool().unwrap_or(false),
            Err(fault) => {
                warn!(node_id = %self.ctx.node_id(), %fault, "error event to managed node failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detached_remote_node_fails_lifecycle() {
        let node = factory()(NodeContext::detached("r1", "remote-type", "f1")).unwrap();
        let info = NodeInfo::from_declaration("f1", &json!({"id": "r1", "type": "remote-type"})).unwrap();
        assert!(!node.init(&info));
        assert!(!node.start());
        assert!(node.invoke_local("anything", &[]).is_err());
        // fire-and-forget paths only log
        node.input(&info, 0, Message::new(json!(1)));
        node.stop();
    }
}
