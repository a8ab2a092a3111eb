mod methods;

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use node_rpc::transport::connect;
use node_rpc::{DispatchTable, Fault, FrameSink, Method, RpcConnection, RpcRequest, RpcResponse, RpcResult, Scope, TransportError};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{OverflowPolicy, RuntimeConfig};
use crate::flow::{FlowManager, OutputItem, OutputSink};
use crate::logger::{LogLevel, log_for_node};
use crate::message::Message;
use crate::module::{ModuleCatalog, NodeManager};
use crate::node::{DataScope, NodeHost};
use crate::queue::{QueueManager, QueueProcessor, QueueSnapshot, QueueSpec};
use crate::subscription::{EventBroadcaster, Subscription, SubscriptionRegistry};
use crate::watchdog::{FatalAction, Watchdog, kill_self};

pub const REQUEST_QUEUE: usize = 0;
pub const RESPONSE_QUEUE: usize = 1;
pub const OUTPUT_QUEUE: usize = 2;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime is shutting down")]
    Disposing,
}

pub enum WorkItem {
    Request(Arc<RpcConnection>, RpcRequest),
    Response(Arc<RpcConnection>, RpcResponse),
    Output(OutputItem),
}

/// A flow worker: owns the node registry, flows, subscriptions and the queues
/// that connect them to the coordinator connection.
pub struct FlowsRuntime {
    config: RuntimeConfig,
    nodes: Arc<NodeManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    flows: Arc<FlowManager>,
    queues: QueueManager<WorkItem>,
    dispatch: Arc<DispatchTable>,
    connection: RwLock<Option<Arc<RpcConnection>>>,
    watchdog: Mutex<Option<Watchdog>>,
    fatal: FatalAction,
    starting_up: AtomicBool,
    disposing: AtomicBool,
    node_events: AtomicBool,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl std::fmt::Debug for FlowsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowsRuntime")
            .field("flows", &self.flows)
            .field("nodes", &self.nodes)
            .field("starting_up", &self.is_starting_up())
            .finish_non_exhaustive()
    }
}

impl FlowsRuntime {
    pub fn new(config: RuntimeConfig, catalog: Arc<ModuleCatalog>) -> Arc<Self> {
        Self::with_fatal_action(config, catalog, Arc::new(terminate))
    }

    /// Like `new`, with a custom reaction to watchdog and shutdown-deadline
    /// failures.
    pub fn with_fatal_action(config: RuntimeConfig, catalog: Arc<ModuleCatalog>, fatal: FatalAction) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let nodes = Arc::new(NodeManager::new(catalog));
            let subscriptions = Arc::new(SubscriptionRegistry::new());
            let broadcaster = Arc::new(EventBroadcaster::new(subscriptions.clone(), nodes.clone()));
            let host: Weak<dyn NodeHost> = me.clone();
            let output: Weak<dyn OutputSink> = me.clone();
            let flows = Arc::new(FlowManager::new(
                nodes.clone(),
                subscriptions.clone(),
                broadcaster.clone(),
                config.node_input_history_size,
                host,
                output,
            ));
            let q = &config.queues;
            let queues = QueueManager::new(
                vec![
                    QueueSpec::new("rpc-request", q.request_threads, q.capacity),
                    QueueSpec::new("rpc-response", q.response_threads, q.capacity),
                    QueueSpec::new("node-output", q.output_threads, q.capacity),
                ],
                config.block_timeout(),
            );
            let dispatch = Arc::new(DispatchTable::new());
            methods::register(&dispatch, me);
            let (shutdown_tx, shutdown_rx) = channel::bounded(1);
            Self {
                config,
                nodes,
                subscriptions,
                broadcaster,
                flows,
                queues,
                dispatch,
                connection: RwLock::new(None),
                watchdog: Mutex::new(None),
                fatal,
                starting_up: AtomicBool::new(true),
                disposing: AtomicBool::new(false),
                node_events: AtomicBool::new(false),
                shutdown_tx,
                shutdown_rx,
            }
        })
    }

    /// Start queue workers and the watchdog. Call before `connect`/`attach`.
    pub fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if self.is_disposing() {
            return Err(RuntimeError::Disposing);
        }
        self.queues.start(Arc::new(RuntimeProcessor(Arc::downgrade(self))))?;
        if let Some(timeout) = self.config.watchdog_timeout() {
            let weak = Arc::downgrade(self);
            let source = Arc::new(move || weak.upgrade().map(|rt| rt.queues.snapshots()).unwrap_or_default());
            let watchdog = Watchdog::start(timeout, source, self.fatal.clone())?;
            *self.watchdog.lock().unwrap_or_else(|p| p.into_inner()) = watchdog;
        }
        info!(
            request_threads = self.config.queues.request_threads,
            response_threads = self.config.queues.response_threads,
            output_threads = self.config.queues.output_threads,
            "flows runtime started"
        );
        Ok(())
    }

    /// Connect to the coordinator socket from the configuration.
    pub fn connect(self: &Arc<Self>) -> Result<Arc<RpcConnection>, RuntimeError> {
        let stream = connect(&self.config.socket_path, self.config.connect_retry_delay())?;
        self.attach(stream)
    }

    /// Serve the coordinator on an already connected stream and register with it.
    pub fn attach(self: &Arc<Self>, stream: UnixStream) -> Result<Arc<RpcConnection>, RuntimeError> {
        if self.is_disposing() {
            return Err(RuntimeError::Disposing);
        }
        let connection =
            RpcConnection::with_timeout("coordinator", stream, self.dispatch.clone(), self.config.rpc_timeout());
        connection.start(Arc::new(QueueSink(Arc::downgrade(self))))?;
        let previous = self
            .connection
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .replace(connection.clone());
        if let Some(previous) = previous {
            previous.dispose();
        }
        match connection.invoke(Method::RegisterFlowsClient.as_ref(), vec![json!(std::process::id())]) {
            Ok(_) => info!(pid = std::process::id(), "registered with coordinator"),
            Err(fault) => warn!(%fault, "coordinator did not accept registration"),
        }
        Ok(connection)
    }

    pub fn connection(&self) -> Option<Arc<RpcConnection>> {
        self.connection.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn flows(&self) -> &Arc<FlowManager> {
        &self.flows
    }

    pub fn nodes(&self) -> &Arc<NodeManager> {
        &self.nodes
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    pub fn queue_snapshots(&self) -> Vec<QueueSnapshot> {
        self.queues.snapshots()
    }

    pub fn is_starting_up(&self) -> bool {
        self.starting_up.load(Ordering::SeqCst)
    }

    pub(crate) fn finish_startup(&self) {
        if self.starting_up.swap(false, Ordering::SeqCst) {
            info!("startup complete, requests may now be dropped under load");
        }
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    pub fn node_events_enabled(&self) -> bool {
        self.node_events.load(Ordering::SeqCst)
    }

    pub(crate) fn set_node_events(&self, enabled: bool) {
        self.node_events.store(enabled, Ordering::SeqCst);
    }

    /// Ask whoever waits in `wait_for_shutdown_request` to shut down.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// True when a shutdown was requested within `timeout` (forever if `None`).
    pub fn wait_for_shutdown_request(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => match self.shutdown_rx.recv_timeout(timeout) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => true,
            },
            None => self.shutdown_rx.recv().is_ok(),
        }
    }

    /// Stop flows, close the connection, stop the queues and clear registries.
    /// Not finishing within `shutdown_timeout` is fatal.
    pub fn shutdown(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down flows runtime");
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let timeout = self.config.shutdown_timeout();
        let fatal = self.fatal.clone();
        let guard = thread::Builder::new().name("shutdown-guard".into()).spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(timeout) {
                fatal(&format!("shutdown did not finish within {} ms", timeout.as_millis()));
            }
        });
        if let Err(e) = &guard {
            warn!(error = %e, "could not start shutdown guard");
        }

        if let Some(watchdog) = self.watchdog.lock().unwrap_or_else(|p| p.into_inner()).take() {
            watchdog.stop();
        }
        self.flows.dispose();
        let connection = self.connection.write().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(connection) = connection {
            connection.dispose();
        }
        self.queues.stop();
        self.subscriptions.clear();
        self.nodes.unload_all();

        let _ = done_tx.send(());
        if let Ok(guard) = guard {
            let _ = guard.join();
        }
        self.request_shutdown();
        info!("flows runtime stopped");
    }

    fn call_coordinator(&self, method: &str, params: Vec<Value>, wait: bool) -> RpcResult {
        let Some(connection) = self.connection() else {
            return Err(Fault::not_connected("no coordinator connection"));
        };
        if wait {
            connection.send_and_wait(Scope::current_thread(), method, params, self.config.rpc_timeout())
        } else {
            connection
                .send_no_wait(Scope::current_thread(), method, params)
                .map(|_| Value::Null)
        }
    }
}

fn terminate(reason: &str) {
    kill_self(reason)
}

// Decoded frames go to the request/response queues instead of running on the
// reader thread, so handlers may issue nested calls.
struct QueueSink(Weak<FlowsRuntime>);

impl FrameSink for QueueSink {
    fn on_request(&self, connection: &Arc<RpcConnection>, request: RpcRequest) {
        let Some(rt) = self.0.upgrade() else {
            return;
        };
        let envelope = request.envelope();
        let allow_drop = !rt.is_starting_up();
        let method = request.method.clone();
        if !rt.queues.enqueue(REQUEST_QUEUE, WorkItem::Request(connection.clone(), request), allow_drop) {
            warn!(%method, "request queue full, request dropped");
            if let Some(envelope) = envelope.filter(|e| e.wait) {
                connection.reply(envelope, Err(Fault::queue_full()));
            }
        }
    }

    fn on_response(&self, connection: &Arc<RpcConnection>, response: RpcResponse) {
        let Some(rt) = self.0.upgrade() else {
            return;
        };
        let packet_id = response.packet_id;
        if !rt.queues.enqueue(RESPONSE_QUEUE, WorkItem::Response(connection.clone(), response), false) {
            error!(packet_id, "response queue full, response lost");
        }
    }
}

struct RuntimeProcessor(Weak<FlowsRuntime>);

impl QueueProcessor<WorkItem> for RuntimeProcessor {
    fn process(&self, _queue: usize, item: WorkItem) {
        match item {
            WorkItem::Request(connection, request) => connection.handle_request(request),
            WorkItem::Response(connection, response) => connection.on_response(response),
            WorkItem::Output(item) => match self.0.upgrade() {
                Some(rt) => rt.flows.process_output_item(item),
                None => debug!(target = %item.target_node, "runtime gone, output dropped"),
            },
        }
    }
}

impl OutputSink for FlowsRuntime {
    fn enqueue_output(&self, item: OutputItem) -> bool {
        let allow_drop = self.config.output_overflow == OverflowPolicy::Drop;
        self.queues.enqueue(OUTPUT_QUEUE, WorkItem::Output(item), allow_drop)
    }
}

impl NodeHost for FlowsRuntime {
    fn output(&self, node_id: &str, port: u32, message: Message, synchronous: bool) {
        self.flows.queue_output(node_id, port, message, synchronous);
    }

    fn invoke(&self, method: &str, params: Vec<Value>, wait: bool) -> RpcResult {
        self.call_coordinator(method, params, wait)
    }

    fn invoke_node_method(&self, node_id: &str, method: &str, params: Vec<Value>, wait: bool) -> RpcResult {
        if let Some(node) = self.nodes.get_node(node_id) {
            return node.invoke_local(method, &params);
        }
        self.call_coordinator(
            Method::InvokeNodeMethod.as_ref(),
            vec![json!(node_id), json!(method), Value::Array(params), json!(wait)],
            wait,
        )
    }

    fn subscribe(&self, node_id: &str, subscription: &Subscription) {
        let flow_id = self.flows.error_source(node_id).flow_id;
        self.subscriptions.subscribe(node_id, &flow_id, subscription);
    }

    fn unsubscribe(&self, node_id: &str, subscription: &Subscription) {
        self.subscriptions.unsubscribe(node_id, subscription);
    }

    fn node_event(&self, node_id: &str, topic: &str, value: Value, retain: bool) {
        if !self.node_events_enabled() {
            return;
        }
        if let Err(fault) = self.call_coordinator(
            Method::NodeEvent.as_ref(),
            vec![json!(node_id), json!(topic), value, json!(retain)],
            false,
        ) {
            debug!(%node_id, %topic, %fault, "node event not sent");
        }
    }

    fn error_event(&self, node_id: &str, level: LogLevel, message: &str) {
        log_for_node(node_id, level, message);
        let source = self.flows.error_source(node_id);
        self.broadcaster.error(&source, level, message);
    }

    fn get_data(&self, node_id: &str, scope: DataScope, key: &str) -> RpcResult {
        let (method, args) = match scope {
            DataScope::Node => (Method::GetNodeData, vec![json!(node_id), json!(key)]),
            DataScope::Flow => (Method::GetFlowData, vec![json!(self.flows.error_source(node_id).flow_id), json!(key)]),
            DataScope::Global => (Method::GetGlobalData, vec![json!(key)]),
        };
        self.call_coordinator(method.as_ref(), args, true)
    }

    fn set_data(&self, node_id: &str, scope: DataScope, key: &str, value: Value) -> RpcResult {
        let (method, args) = match scope {
            DataScope::Node => (Method::SetNodeData, vec![json!(node_id), json!(key), value]),
            DataScope::Flow => (
                Method::SetFlowData,
                vec![json!(self.flows.error_source(node_id).flow_id), json!(key), value],
            ),
            DataScope::Global => (Method::SetGlobalData, vec![json!(key), value]),
        };
        self.call_coordinator(method.as_ref(), args, true)
    }

    fn log(&self, node_id: &str, level: LogLevel, message: &str) {
        log_for_node(node_id, level, message);
    }
}
