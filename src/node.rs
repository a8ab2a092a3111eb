use std::fmt;
use std::sync::{Arc, Weak};

use node_rpc::{Fault, RpcResult};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::flow::{GLOBAL_FLOW_ID, NodeInfo};
use crate::logger::LogLevel;
use crate::message::Message;
use crate::subscription::Subscription;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid node configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

/// Where an error event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorSource {
    pub node_id: String,
    pub flow_id: String,
}

impl ErrorSource {
    pub fn new(node_id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), flow_id: flow_id.into() }
    }

    /// Config nodes live outside any user flow.
    pub fn is_config_node(&self) -> bool {
        self.flow_id == GLOBAL_FLOW_ID
    }
}

/// Contract every node implementation fulfils, whether it runs in-process or
/// behind an execution backend. All methods take `&self`: one instance is
/// shared by every thread delivering to it.
pub trait Node: Send + Sync {
    fn init(&self, _info: &NodeInfo) -> bool {
        true
    }

    fn start(&self) -> bool {
        true
    }

    fn config_nodes_started(&self) {}

    fn start_up_complete(&self) {}

    fn stop(&self) {}

    fn wait_for_stop(&self) {}

    fn input(&self, info: &NodeInfo, port: u32, message: Message);

    fn invoke_local(&self, _method: &str, _params: &[Value]) -> RpcResult {
        Err(Fault::method_not_found())
    }

    fn variable_event(&self, _source: &str, _peer_id: u64, _channel: i32, _variable: &str, _value: &Value) {}

    fn flow_variable_event(&self, _flow_id: &str, _variable: &str, _value: &Value) {}

    fn global_variable_event(&self, _variable: &str, _value: &Value) {}

    fn homegear_event(&self, _event_type: &str, _data: &Value) {}

    fn status_event(&self, _node_id: &str, _status: &Value) {}

    /// Return true when the error was handled.
    fn error_event(&self, _source: &ErrorSource, _level: LogLevel, _message: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataScope {
    Node,
    Flow,
    Global,
}

/// Everything a node can ask of the runtime hosting it.
pub trait NodeHost: Send + Sync {
    fn output(&self, node_id: &str, port: u32, message: Message, synchronous: bool);
    fn invoke(&self, method: &str, params: Vec<Value>, wait: bool) -> RpcResult;
    fn invoke_node_method(&self, node_id: &str, method: &str, params: Vec<Value>, wait: bool) -> RpcResult;
    fn subscribe(&self, node_id: &str, subscription: &Subscription);
    fn unsubscribe(&self, node_id: &str, subscription: &Subscription);
    fn node_event(&self, node_id: &str, topic: &str, value: Value, retain: bool);
    fn error_event(&self, node_id: &str, level: LogLevel, message: &str);
    fn get_data(&self, node_id: &str, scope: DataScope, key: &str) -> RpcResult;
    fn set_data(&self, node_id: &str, scope: DataScope, key: &str, value: Value) -> RpcResult;
    fn log(&self, node_id: &str, level: LogLevel, message: &str);
}

/// Handed to a node at construction; binds the node's identity to its host.
#[derive(Clone)]
pub struct NodeContext {
    node_id: String,
    node_type: String,
    flow_id: String,
    host: Option<Weak<dyn NodeHost>>,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("node_type", &self.node_type)
            .field("flow_id", &self.flow_id)
            .field("attached", &self.host().is_some())
            .finish()
    }
}

impl NodeContext {
    pub fn new(node_id: &str, node_type: &str, flow_id: &str, host: Weak<dyn NodeHost>) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            flow_id: flow_id.to_string(),
            host: Some(host),
        }
    }

    /// A context without host; outputs go nowhere and calls fail.
    pub fn detached(node_id: &str, node_type: &str, flow_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            flow_id: flow_id.to_string(),
            host: None,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    fn host(&self) -> Option<Arc<dyn NodeHost>> {
        self.host.as_ref().and_then(Weak::upgrade)
    }

    fn host_or_fault(&self) -> Result<Arc<dyn NodeHost>, Fault> {
        self.host().ok_or_else(Fault::disposing)
    }

    pub fn output(&self, port: u32, message: Message) {
        self.output_with(port, message, false);
    }

    pub fn output_sync(&self, port: u32, message: Message) {
        self.output_with(port, message, true);
    }

    fn output_with(&self, port: u32, message: Message, synchronous: bool) {
        match self.host() {
            Some(host) => host.output(&self.node_id, port, message, synchronous),
            None => debug!(node_id = %self.node_id, port, "output from detached node dropped"),
        }
    }

    /// Call a coordinator method and wait for its result.
    pub fn invoke(&self, method: &str, params: Vec<Value>) -> RpcResult {
        self.host_or_fault()?.invoke(method, params, true)
    }

    pub fn invoke_with(&self, method: &str, params: Vec<Value>, wait: bool) -> RpcResult {
        self.host_or_fault()?.invoke(method, params, wait)
    }

    pub fn invoke_node_method(&self, node_id: &str, method: &str, params: Vec<Value>, wait: bool) -> RpcResult {
        self.host_or_fault()?.invoke_node_method(node_id, method, params, wait)
    }

    pub fn subscribe(&self, subscription: &Subscription) {
        if let Some(host) = self.host() {
            host.subscribe(&self.node_id, subscription);
        }
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(host) = self.host() {
            host.unsubscribe(&self.node_id, subscription);
        }
    }

    pub fn node_event(&self, topic: &str, value: Value, retain: bool) {
        if let Some(host) = self.host() {
            host.node_event(&self.node_id, topic, value, retain);
        }
    }

    pub fn error(&self, level: LogLevel, message: &str) {
        if let Some(host) = self.host() {
            host.error_event(&self.node_id, level, message);
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        match self.host() {
            Some(host) => host.log(&self.node_id, level, message),
            None => crate::logger::log_for_node(&self.node_id, level, message),
        }
    }

    pub fn get_data(&self, scope: DataScope, key: &str) -> RpcResult {
        self.host_or_fault()?.get_data(&self.node_id, scope, key)
    }

    pub fn set_data(&self, scope: DataScope, key: &str, value: Value) -> RpcResult {
        self.host_or_fault()?.set_data(&self.node_id, scope, key, value)
    }
}
