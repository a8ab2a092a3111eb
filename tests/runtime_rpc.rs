//! Drives a `FlowsRuntime` through a coordinator connection over a socket pair.

use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};
use node_rpc::{DispatchTable, InlineSink, Method, RpcConnection, RpcResult, codes};
use nodeflow::FlowsRuntime;
use nodeflow::builtin::register_builtin;
use nodeflow::config::RuntimeConfig;
use nodeflow::flow::NodeInfo;
use nodeflow::message::Message;
use nodeflow::module::ModuleCatalog;
use nodeflow::node::{DataScope, Node, NodeContext};
use nodeflow::runtime::REQUEST_QUEUE;
use serde_json::{Value, json};

const WAIT: Duration = Duration::from_secs(5);

/// Hands every input message to the test.
struct Recorder {
    tx: Sender<Value>,
}

impl Node for Recorder {
    fn input(&self, _info: &NodeInfo, _port: u32, message: Message) {
        let _ = self.tx.send(message.into_value());
    }
}

/// Calls back into the coordinator while handling an input.
struct Asker {
    ctx: NodeContext,
    tx: Sender<(RpcResult, RpcResult)>,
}

impl Node for Asker {
    fn input(&self, _info: &NodeInfo, _port: u32, message: Message) {
        let answer = self.ctx.invoke("getAnswer", vec![message.payload().clone()]);
        let data = self.ctx.get_data(DataScope::Flow, "greeting");
        self.ctx.node_event("answered", json!(true), false);
        let _ = self.tx.send((answer, data));
    }
}

/// Holds the calling thread inside `input` until the test opens the gate.
struct Gate {
    entered: Sender<i64>,
    gate: Receiver<()>,
}

impl Node for Gate {
    fn input(&self, _info: &NodeInfo, _port: u32, message: Message) {
        let _ = self.entered.send(message.payload().as_i64().unwrap_or(0));
        let _ = self.gate.recv_timeout(WAIT);
    }
}

struct Harness {
    runtime: Arc<FlowsRuntime>,
    coordinator: Arc<RpcConnection>,
    registered: Receiver<Value>,
    node_events: Receiver<Vec<Value>>,
}

impl Harness {
    fn new(catalog: ModuleCatalog) -> Self {
        Self::with_config(catalog, |_| {})
    }

    fn with_config(catalog: ModuleCatalog, adjust: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let (worker_end, coordinator_end) = UnixStream::pair().unwrap();

        let dispatch = Arc::new(DispatchTable::new());
        let (registered_tx, registered) = unbounded();
        dispatch.register(Method::RegisterFlowsClient, move |args: &[Value]| {
            let _ = registered_tx.send(args[0].clone());
            Ok(json!(true))
        });
        let (events_tx, node_events) = unbounded();
        dispatch.register(Method::NodeEvent, move |args: &[Value]| {
            let _ = events_tx.send(args.to_vec());
            Ok(Value::Null)
        });
        dispatch.register("getAnswer", |args: &[Value]| Ok(json!(args[0].as_i64().unwrap_or(0) + 1)));
        dispatch.register(Method::GetFlowData, |args: &[Value]| {
            Ok(json!(format!("{}:{}", args[0].as_str().unwrap_or(""), args[1].as_str().unwrap_or(""))))
        });

        let coordinator = RpcConnection::new("test-coordinator", coordinator_end, dispatch);
        coordinator.start(Arc::new(InlineSink)).unwrap();

        let mut config = RuntimeConfig {
            rpc_timeout_ms: 5000,
            shutdown_timeout_ms: 10_000,
            ..RuntimeConfig::default()
        };
        adjust(&mut config);
        let runtime = FlowsRuntime::with_fatal_action(
            config,
            Arc::new(catalog),
            Arc::new(|reason: &str| -> () { panic!("fatal: {reason}") }),
        );
        runtime.start().unwrap();
        runtime.attach(worker_end).unwrap();
        Self { runtime, coordinator, registered, node_events }
    }

    fn call(&self, method: Method, args: Vec<Value>) -> RpcResult {
        self.coordinator.invoke(method.as_ref(), args)
    }

    fn start_flow(&self, flow_id: &str, nodes: Value) {
        let started = self.call(Method::StartFlow, vec![json!({"id": flow_id}), nodes]).unwrap();
        assert!(started.as_u64().unwrap() > 0);
        for method in [Method::StartNodes, Method::ConfigNodesStarted, Method::StartUpComplete] {
            assert_eq!(self.call(method, vec![]).unwrap(), json!(1), "{method}");
        }
    }

    fn input_in_background(&self, node_id: &str, payload: i64) -> JoinHandle<RpcResult> {
        let coordinator = self.coordinator.clone();
        let args = vec![json!(node_id), json!(0), json!({"payload": payload}), json!(false)];
        thread::spawn(move || coordinator.invoke(Method::NodeInput.as_ref(), args))
    }

    fn requests_queued(&self) -> usize {
        self.runtime.queue_snapshots()[REQUEST_QUEUE].queued
    }

    fn close(self) {
        self.runtime.shutdown();
        self.coordinator.dispose();
    }
}

fn catalog_with_recorder() -> (ModuleCatalog, Receiver<Value>) {
    let catalog = ModuleCatalog::new();
    register_builtin(&catalog);
    let (tx, rx) = unbounded();
    catalog.register_native("recorder", move |_ctx| Ok(Arc::new(Recorder { tx: tx.clone() }) as Arc<dyn Node>));
    (catalog, rx)
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// One request worker and room for one queued request.
fn gated_harness() -> (Harness, Receiver<i64>, Sender<()>) {
    let catalog = ModuleCatalog::new();
    let (entered_tx, entered) = unbounded();
    let (open, gate) = unbounded();
    catalog.register_native("gate", move |_ctx| {
        Ok(Arc::new(Gate { entered: entered_tx.clone(), gate: gate.clone() }) as Arc<dyn Node>)
    });
    let h = Harness::with_config(catalog, |config| {
        config.queues.request_threads = 1;
        config.queues.capacity = 1;
    });
    (h, entered, open)
}

#[test]
fn full_request_queue_answers_queue_full_after_startup() {
    let (h, entered, open) = gated_harness();
    h.start_flow("f4", json!([{"id": "g1", "type": "gate"}]));
    assert!(!h.runtime.is_starting_up());

    let running = h.input_in_background("g1", 1);
    assert_eq!(entered.recv_timeout(WAIT).unwrap(), 1);
    let queued = h.input_in_background("g1", 2);
    assert!(wait_until(|| h.requests_queued() == 1));

    let refused = h.call(Method::NodeInput, vec![json!("g1"), json!(0), json!({"payload": 3}), json!(false)]);
    assert_eq!(refused.unwrap_err().code, codes::QUEUE_FULL);

    open.send(()).unwrap();
    open.send(()).unwrap();
    assert_eq!(running.join().unwrap().unwrap(), json!(true));
    assert_eq!(queued.join().unwrap().unwrap(), json!(true));
    assert_eq!(entered.recv_timeout(WAIT).unwrap(), 2);
    assert!(entered.recv_timeout(Duration::from_millis(200)).is_err());
    h.close();
}

#[test]
fn full_request_queue_blocks_during_startup() {
    let (h, entered, open) = gated_harness();
    let started = h.call(Method::StartFlow, vec![json!({"id": "f5"}), json!([{"id": "g1", "type": "gate"}])]);
    assert!(started.unwrap().as_u64().unwrap() > 0);
    assert!(h.runtime.is_starting_up());

    let running = h.input_in_background("g1", 1);
    assert_eq!(entered.recv_timeout(WAIT).unwrap(), 1);
    let queued = h.input_in_background("g1", 2);
    assert!(wait_until(|| h.requests_queued() == 1));
    // the reader waits for room instead of refusing
    let waiting = h.input_in_background("g1", 3);
    thread::sleep(Duration::from_millis(100));
    assert!(!waiting.is_finished());

    for _ in 0..3 {
        open.send(()).unwrap();
    }
    for handle in [running, queued, waiting] {
        assert_eq!(handle.join().unwrap().unwrap(), json!(true));
    }
    assert_eq!(entered.recv_timeout(WAIT).unwrap(), 2);
    assert_eq!(entered.recv_timeout(WAIT).unwrap(), 3);
    h.close();
}

#[test]
fn flow_lifecycle_over_rpc() {
    let (catalog, recorded) = catalog_with_recorder();
    let h = Harness::new(catalog);
    assert_eq!(h.registered.recv_timeout(WAIT).unwrap(), json!(std::process::id()));
    assert!(h.runtime.is_starting_up());

    h.start_flow(
        "f1",
        json!([
            {"id": "p1", "type": "passthrough", "wires": [["r1"]]},
            {"id": "r1", "type": "recorder"},
        ]),
    );
    assert!(!h.runtime.is_starting_up());
    assert_eq!(h.call(Method::FlowCount, vec![]).unwrap(), json!(1));

    let delivered = h.call(Method::NodeInput, vec![json!("p1"), json!(0), json!({"payload": 42}), json!(false)]);
    assert_eq!(delivered.unwrap(), json!(true));
    let message = recorded.recv_timeout(WAIT).unwrap();
    assert_eq!(message["payload"], json!(42));

    let history = h.call(Method::GetNodeInputHistory, vec![json!("p1")]).unwrap();
    assert_eq!(history[0][0]["value"]["payload"], json!(42));

    let unknown = h.call(Method::NodeInput, vec![json!("nope"), json!(0), json!({}), json!(false)]);
    assert_eq!(unknown.unwrap_err().code, codes::UNKNOWN_NODE);
    let missing = h.coordinator.invoke("noSuchMethod", vec![]);
    assert_eq!(missing.unwrap_err().code, codes::METHOD_NOT_FOUND);

    assert_eq!(h.call(Method::StopNodes, vec![]).unwrap(), json!(1));
    assert_eq!(h.call(Method::WaitForNodesStopped, vec![]).unwrap(), json!(1));
    assert_eq!(h.call(Method::StopFlow, vec![json!("f1")]).unwrap(), json!(true));
    assert_eq!(h.call(Method::FlowCount, vec![]).unwrap(), json!(0));
    assert!(h.runtime.nodes().node_ids().is_empty());
    assert!(h.call(Method::StopFlow, vec![json!("f1")]).is_err());

    assert_eq!(h.call(Method::Lifetick, vec![]).unwrap(), json!(true));
    assert_eq!(h.call(Method::Shutdown, vec![]).unwrap(), json!(true));
    assert!(h.runtime.wait_for_shutdown_request(Some(WAIT)));
    h.close();
}

#[test]
fn nodes_call_back_into_the_coordinator() {
    let catalog = ModuleCatalog::new();
    let (tx, answers) = unbounded();
    catalog.register_native("asker", move |ctx| Ok(Arc::new(Asker { ctx, tx: tx.clone() }) as Arc<dyn Node>));
    let h = Harness::new(catalog);
    h.start_flow("f1", json!([{"id": "a1", "type": "asker"}]));

    // node events stay local until the coordinator asks for them
    h.call(Method::NodeInput, vec![json!("a1"), json!(0), json!({"payload": 1}), json!(false)]).unwrap();
    let (answer, data) = answers.recv_timeout(WAIT).unwrap();
    assert_eq!(answer.unwrap(), json!(2));
    assert_eq!(data.unwrap(), json!("f1:greeting"));
    assert!(h.node_events.recv_timeout(Duration::from_millis(200)).is_err());

    h.call(Method::EnableNodeEvents, vec![]).unwrap();
    h.call(Method::NodeInput, vec![json!("a1"), json!(0), json!({"payload": 41}), json!(true)]).unwrap();
    let (answer, _) = answers.recv_timeout(WAIT).unwrap();
    assert_eq!(answer.unwrap(), json!(42));
    let event = h.node_events.recv_timeout(WAIT).unwrap();
    assert_eq!(event[0], json!("a1"));
    assert_eq!(event[1], json!("answered"));
    h.close();
}

#[test]
fn broadcast_error_reaches_catch_node() {
    let (catalog, recorded) = catalog_with_recorder();
    let h = Harness::new(catalog);
    h.start_flow(
        "f2",
        json!([
            {"id": "n1", "type": "passthrough"},
            {"id": "c1", "type": "catch", "wires": [["r1"]]},
            {"id": "r1", "type": "recorder"},
        ]),
    );

    let handled = h.call(Method::BroadcastError, vec![json!("n1"), json!(2), json!("boom")]).unwrap();
    assert_eq!(handled, json!(true));
    let caught = recorded.recv_timeout(WAIT).unwrap();
    assert_eq!(caught["payload"], json!("boom"));
    assert_eq!(caught["error"]["source"]["id"], json!("n1"));
    assert_eq!(caught["error"]["source"]["flow"], json!("f2"));

    // the catch node never catches its own errors
    let own = h.call(Method::BroadcastError, vec![json!("c1"), json!(2), json!("self")]).unwrap();
    assert_eq!(own, json!(false));
    h.close();
}

#[test]
fn fixed_inputs_pin_downstream_payloads() {
    let (catalog, recorded) = catalog_with_recorder();
    let h = Harness::new(catalog);
    h.start_flow(
        "f3",
        json!([
            {"id": "p1", "type": "passthrough", "wires": [["r1"]]},
            {"id": "r1", "type": "recorder"},
        ]),
    );
    let send = |payload: i64| {
        h.call(Method::NodeInput, vec![json!("p1"), json!(0), json!({"payload": payload}), json!(false)]).unwrap();
        recorded.recv_timeout(WAIT).unwrap()["payload"].clone()
    };

    assert_eq!(h.call(Method::SetFixedInputValue, vec![json!("r1"), json!(0), json!(7)]).unwrap(), json!(true));
    assert_eq!(send(1), json!(7));
    assert_eq!(h.call(Method::RemoveFixedInputValue, vec![json!("r1"), json!(0)]).unwrap(), json!(true));
    assert_eq!(h.call(Method::RemoveFixedInputValue, vec![json!("r1"), json!(0)]).unwrap(), json!(false));
    assert_eq!(send(2), json!(2));
    assert!(h.call(Method::SetFixedInputValue, vec![json!("r1"), json!(-1), json!(7)]).is_err());

    let times = h.call(Method::GetNodeProcessingTimes, vec![]).unwrap();
    assert!(times.get("p1").is_some());
    h.close();
}
