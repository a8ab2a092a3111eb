use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Core RPC value types shared by the coordinator and its workers.
///
/// A request is `(method, params)` where `params[0]` is the correlation slot:
/// an [`Envelope`] `[scope, packetId, wait]`, or nil when nobody tracks the
/// request. A response echoes the scope and packet id and carries either a
/// value or a [`Fault`].
pub type PacketId = u64;

/// Correlation namespace under which packet ids are unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(pub u64);

static NEXT_THREAD_SCOPE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_SCOPE: Scope = Scope(NEXT_THREAD_SCOPE.fetch_add(1, Ordering::Relaxed));
}

impl Scope {
    pub const GLOBAL: Scope = Scope(0);

    /// A scope unique to the calling thread, stable for the thread's lifetime.
    pub fn current_thread() -> Scope {
        THREAD_SCOPE.with(|scope| *scope)
    }

    pub fn is_global(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// -----------------------------------------------------------------------------
// Faults
// -----------------------------------------------------------------------------

pub mod codes {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const DISPOSING: i64 = -32500;
    pub const NO_RESPONSE: i64 = -32501;
    pub const NOT_CONNECTED: i64 = -32502;
    pub const QUEUE_FULL: i64 = -32503;
    pub const UNKNOWN_NODE: i64 = -32504;
}

/// Structured error returned in place of a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("fault {code}: {message}")]
pub struct Fault {
    pub code: i64,
    pub message: String,
}

impl Fault {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn method_not_found() -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "method not found")
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    pub fn disposing() -> Self {
        Self::new(codes::DISPOSING, "connection is disposing")
    }

    pub fn no_response() -> Self {
        Self::new(codes::NO_RESPONSE, "no response")
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_CONNECTED, message)
    }

    pub fn queue_full() -> Self {
        Self::new(codes::QUEUE_FULL, "request queue is full")
    }

    pub fn unknown_node(node_id: &str) -> Self {
        Self::new(codes::UNKNOWN_NODE, format!("unknown node: {node_id}"))
    }

    pub fn is(&self, code: i64) -> bool {
        self.code == code
    }
}

pub type RpcResult = Result<Value, Fault>;

// -----------------------------------------------------------------------------
// Requests & responses
// -----------------------------------------------------------------------------

/// Correlation prefix carried in `params[0]` of every correlated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub scope: Scope,
    pub packet_id: PacketId,
    /// The sender blocks on a reply.
    pub wait: bool,
}

impl Envelope {
    pub fn to_value(&self) -> Value {
        json!([self.scope.0, self.packet_id, self.wait])
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        if items.len() != 3 {
            return None;
        }
        Some(Self {
            scope: Scope(items[0].as_u64()?),
            packet_id: items[1].as_u64()?,
            wait: items[2].as_bool()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireRequest", try_from = "WireRequest")]
pub struct RpcRequest {
    pub method: String,
    pub envelope: Option<Envelope>,
    pub args: Vec<Value>,
}

impl RpcRequest {
    /// A request without correlation envelope. The peer never replies to it.
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self { method: method.into(), envelope: None, args }
    }

    pub fn correlated(envelope: Envelope, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self { method: method.into(), envelope: Some(envelope), args }
    }

    pub fn envelope(&self) -> Option<Envelope> {
        self.envelope
    }

    /// Positional arguments following the correlation slot.
    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

/// On-the-wire request shape: the correlation slot is always `params[0]`.
#[derive(Serialize, Deserialize)]
struct WireRequest {
    method: String,
    params: Vec<Value>,
}

impl From<RpcRequest> for WireRequest {
    fn from(request: RpcRequest) -> Self {
        let mut params = Vec::with_capacity(request.args.len() + 1);
        params.push(request.envelope.map_or(Value::Null, |e| e.to_value()));
        params.extend(request.args);
        Self { method: request.method, params }
    }
}

impl TryFrom<WireRequest> for RpcRequest {
    type Error = String;

    fn try_from(wire: WireRequest) -> Result<Self, Self::Error> {
        let mut params = wire.params.into_iter();
        let envelope = match params.next() {
            Some(Value::Null) => None,
            Some(slot) => Some(
                Envelope::from_value(&slot)
                    .ok_or_else(|| format!("{}: malformed correlation slot {slot}", wire.method))?,
            ),
            None => return Err(format!("{}: missing correlation slot", wire.method)),
        };
        Ok(Self { method: wire.method, envelope, args: params.collect() })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub scope: Scope,
    pub packet_id: PacketId,
    pub result: RpcResult,
}

impl RpcResponse {
    pub fn success(envelope: Envelope, value: Value) -> Self {
        Self { scope: envelope.scope, packet_id: envelope.packet_id, result: Ok(value) }
    }

    pub fn fail(envelope: Envelope, fault: Fault) -> Self {
        Self { scope: envelope.scope, packet_id: envelope.packet_id, result: Err(fault) }
    }
}

// -----------------------------------------------------------------------------
// Method names
// -----------------------------------------------------------------------------

/// Strongly-typed list of the methods exchanged between the coordinator and
/// its flow workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    // Flow lifecycle (coordinator -> worker)
    StartFlow,
    StartNodes,
    ConfigNodesStarted,
    StartUpComplete,
    StopNodes,
    WaitForNodesStopped,
    StopFlow,
    FlowCount,
    Lifetick,
    Shutdown,

    // Delivery & invocation
    NodeInput,
    InvokeNodeMethod,
    SetFixedInputValue,
    RemoveFixedInputValue,

    // Broadcasts
    BroadcastEvent,
    BroadcastFlowVariableEvent,
    BroadcastGlobalVariableEvent,
    BroadcastHomegearEvent,
    BroadcastNewDevices,
    BroadcastDeleteDevices,
    BroadcastUpdateDevice,
    BroadcastStatus,
    BroadcastError,

    // Introspection
    EnableNodeEvents,
    DisableNodeEvents,
    GetNodeProcessingTimes,
    GetNodeInputHistory,

    // Worker -> coordinator
    RegisterFlowsClient,
    NodeEvent,
    RemoteNodeInput,
    RemoteNodeMethod,
    GetNodeData,
    SetNodeData,
    GetFlowData,
    SetFlowData,
    GetGlobalData,
    SetGlobalData,
}

impl From<Method> for String {
    fn from(method: Method) -> Self {
        method.as_ref().to_owned()
    }
}
