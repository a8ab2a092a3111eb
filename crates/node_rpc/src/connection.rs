use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::correlation::PendingRequests;
use crate::dispatch::DispatchTable;
use crate::frame::{DEFAULT_MAX_FRAME_LEN, Frame, FrameDecoder};
use crate::rpc::{Envelope, Fault, PacketId, RpcRequest, RpcResponse, RpcResult, Scope};

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Where decoded frames go. The reader thread only decodes; a sink decides on
/// which thread the work happens.
pub trait FrameSink: Send + Sync {
    fn on_request(&self, connection: &Arc<RpcConnection>, request: RpcRequest);
    fn on_response(&self, connection: &Arc<RpcConnection>, response: RpcResponse);
}

/// Handles every frame directly on the reader thread.
///
/// Handlers running under this sink must not issue `send_and_wait` on the same
/// connection, the reply could never be read.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineSink;

impl FrameSink for InlineSink {
    fn on_request(&self, connection: &Arc<RpcConnection>, request: RpcRequest) {
        connection.handle_request(request);
    }

    fn on_response(&self, connection: &Arc<RpcConnection>, response: RpcResponse) {
        connection.on_response(response);
    }
}

/// One peer on a Unix stream socket: frame writer, correlation engine and
/// request dispatcher.
pub struct RpcConnection {
    name: String,
    writer: Mutex<UnixStream>,
    pending: PendingRequests,
    dispatch: Arc<DispatchTable>,
    default_timeout: Duration,
    max_frame_len: usize,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcConnection")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcConnection {
    pub fn new(name: impl Into<String>, stream: UnixStream, dispatch: Arc<DispatchTable>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            writer: Mutex::new(stream),
            pending: PendingRequests::new(),
            dispatch,
            default_timeout: DEFAULT_RPC_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    pub fn with_timeout(
        name: impl Into<String>,
        stream: UnixStream,
        dispatch: Arc<DispatchTable>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            writer: Mutex::new(stream),
            pending: PendingRequests::new(),
            dispatch,
            default_timeout,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    /// Spawn the reader thread. Frames are handed to `sink` in arrival order.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn FrameSink>) -> std::io::Result<()> {
        let stream = self.lock_writer().try_clone()?;
        let conn = self.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-reader", self.name))
            .spawn(move || conn.read_loop(stream, sink))?;
        *self.reader.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    fn read_loop(self: Arc<Self>, mut stream: UnixStream, sink: Arc<dyn FrameSink>) {
        let mut decoder = FrameDecoder::with_max_len(self.max_frame_len);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = match stream.read(&mut buf) {
                Ok(0) => {
                    info!(connection = %self.name, "peer closed the connection");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.is_closed() {
                        warn!(connection = %self.name, error = %e, "socket read failed");
                    }
                    break;
                }
            };

            let mut input = &buf[..n];
            while !input.is_empty() {
                if let Err(e) = decoder.feed(&mut input) {
                    warn!(connection = %self.name, error = %e, "protocol error, skipping to the next frame");
                }
                if !decoder.is_complete() {
                    continue;
                }
                match decoder.take_frame() {
                    Ok(Frame::Request(request)) => sink.on_request(&self, request),
                    Ok(Frame::Response(response)) => sink.on_response(&self, response),
                    Err(e) => warn!(connection = %self.name, error = %e, "discarding undecodable frame"),
                }
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        self.pending.dispose();
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, UnixStream> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn write_frame(&self, frame: &Frame) -> Result<(), Fault> {
        if self.is_closed() {
            return Err(Fault::not_connected(format!("{} is closed", self.name)));
        }
        let bytes = frame.encode().map_err(|e| Fault::internal(e.to_string()))?;
        let mut writer = self.lock_writer();
        writer.write_all(&bytes).and_then(|_| writer.flush()).map_err(|e| {
            error!(connection = %self.name, error = %e, "socket write failed");
            Fault::not_connected(e.to_string())
        })
    }

    // -------------------------------------------------------------------------
    // Outbound
    // -------------------------------------------------------------------------

    pub fn send_and_wait(&self, scope: Scope, method: &str, args: Vec<Value>, timeout: Duration) -> RpcResult {
        let packet_id = self.pending.next_packet_id();
        let slot = self.pending.register(scope, packet_id)?;
        let envelope = Envelope { scope, packet_id, wait: true };
        let request = RpcRequest::correlated(envelope, method, args);
        trace!(connection = %self.name, %method, %scope, packet_id, "sending request");

        if let Err(fault) = self.write_frame(&Frame::Request(request)) {
            // still goes through wait so the slot is removed
            self.pending.resolve(RpcResponse { scope, packet_id, result: Err(fault) });
        }
        let result = self.pending.wait(scope, packet_id, &slot, timeout);
        if let Err(fault) = &result {
            debug!(connection = %self.name, %method, %scope, packet_id, code = fault.code, "request failed");
        }
        result
    }

    /// `send_and_wait` in the global scope with the connection's default timeout.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> RpcResult {
        self.send_and_wait(Scope::GLOBAL, method, args, self.default_timeout)
    }

    pub fn send_no_wait(&self, scope: Scope, method: &str, args: Vec<Value>) -> Result<PacketId, Fault> {
        let packet_id = self.pending.next_packet_id();
        let envelope = Envelope { scope, packet_id, wait: false };
        self.write_frame(&Frame::Request(RpcRequest::correlated(envelope, method, args)))?;
        Ok(packet_id)
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    pub fn on_response(&self, response: RpcResponse) {
        self.pending.resolve(response);
    }

    /// Dispatch a request and, when the sender waits, reply with the result.
    pub fn handle_request(&self, request: RpcRequest) {
        let envelope = request.envelope();
        trace!(connection = %self.name, method = %request.method, "handling request");
        let result = self.dispatch.call(&request.method, request.args());
        if let Some(envelope) = envelope.filter(|e| e.wait) {
            self.reply(envelope, result);
        }
    }

    pub fn reply(&self, envelope: Envelope, result: RpcResult) {
        let response = RpcResponse { scope: envelope.scope, packet_id: envelope.packet_id, result };
        if let Err(fault) = self.write_frame(&Frame::Response(response)) {
            warn!(connection = %self.name, packet_id = envelope.packet_id, error = %fault, "could not send response");
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Wake all waiters, close the socket and join the reader thread.
    pub fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) && self.pending.is_disposing() {
            return;
        }
        self.pending.dispose();
        let _ = self.lock_writer().shutdown(Shutdown::Both);
        let handle = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!(connection = %self.name, "connection disposed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_disposing(&self) -> bool {
        self.pending.is_disposing()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Params;
    use crate::rpc::codes;
    use serde_json::json;
    use std::sync::mpsc;
    use std::time::Instant;

    fn pair() -> (Arc<RpcConnection>, Arc<RpcConnection>) {
        let (a, b) = UnixStream::pair().unwrap();

        let server_methods = Arc::new(DispatchTable::new());
        server_methods.register("echo", |args| Ok(Value::Array(args.to_vec())));
        server_methods.register("sleep", |args| {
            let ms = Params::new("sleep", args).u64(0)?;
            thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        });

        let client = RpcConnection::new("client", a, Arc::new(DispatchTable::new()));
        let server = RpcConnection::new("server", b, server_methods);
        client.start(Arc::new(InlineSink)).unwrap();
        server.start(Arc::new(ThreadPerRequest)).unwrap();
        (client, server)
    }

    /// Lets slow handlers overlap so correlation is exercised out of order.
    struct ThreadPerRequest;

    impl FrameSink for ThreadPerRequest {
        fn on_request(&self, connection: &Arc<RpcConnection>, request: RpcRequest) {
            let connection = connection.clone();
            thread::spawn(move || connection.handle_request(request));
        }

        fn on_response(&self, connection: &Arc<RpcConnection>, response: RpcResponse) {
            connection.on_response(response);
        }
    }

    #[test]
    fn request_round_trip() {
        let (client, server) = pair();
        let result = client.invoke("echo", vec![json!("hi"), json!(3)]);
        assert_eq!(result, Ok(json!(["hi", 3])));
        assert_eq!(client.pending_count(), 0);
        client.dispose();
        server.dispose();
    }

    #[test]
    fn unknown_method_returns_fault() {
        let (client, server) = pair();
        let err = client.invoke("missing", vec![]).unwrap_err();
        assert_eq!(err.code, codes::METHOD_NOT_FOUND);
        client.dispose();
        server.dispose();
    }

    #[test]
    fn concurrent_calls_on_one_scope_resolve_independently() {
        let (client, server) = pair();
        let scope = Scope(5);
        let (tx, rx) = mpsc::channel();
        for delay in [120u64, 10, 60, 30] {
            let client = client.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let result = client.send_and_wait(scope, "sleep", vec![json!(delay)], Duration::from_secs(5));
                tx.send((delay, result)).unwrap();
            });
        }
        drop(tx);
        let mut seen = 0;
        for (delay, result) in rx {
            assert_eq!(result, Ok(json!(delay)));
            seen += 1;
        }
        assert_eq!(seen, 4);
        client.dispose();
        server.dispose();
    }

    #[test]
    fn no_wait_request_gets_no_reply() {
        let (client, server) = pair();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        server.dispatch().register("notify", move |args| {
            tx.lock().unwrap().send(args.to_vec()).unwrap();
            Ok(Value::Null)
        });
        client.send_no_wait(Scope::GLOBAL, "notify", vec![json!(1)]).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![json!(1)]);
        assert_eq!(client.pending_count(), 0);
        client.dispose();
        server.dispose();
    }

    #[test]
    fn timeout_surfaces_as_no_response() {
        let (client, server) = pair();
        let err = client
            .send_and_wait(Scope::GLOBAL, "sleep", vec![json!(500)], Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.code, codes::NO_RESPONSE);
        assert_eq!(client.pending_count(), 0);
        client.dispose();
        server.dispose();
    }

    #[test]
    fn dispose_wakes_outstanding_waiters() {
        let (client, server) = pair();
        let waiter = {
            let client = client.clone();
            thread::spawn(move || client.send_and_wait(Scope::GLOBAL, "sleep", vec![json!(3000)], Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        client.dispose();
        assert_eq!(waiter.join().unwrap().unwrap_err().code, codes::DISPOSING);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(client.send_no_wait(Scope::GLOBAL, "echo", vec![]).is_err());
        server.dispose();
    }

    #[test]
    fn malformed_bytes_do_not_close_the_connection() {
        let (a, b) = UnixStream::pair().unwrap();
        let methods = Arc::new(DispatchTable::new());
        methods.register("ping", |_| Ok(json!("pong")));
        let server = RpcConnection::new("server", b, methods);
        server.start(Arc::new(InlineSink)).unwrap();

        let mut raw = a.try_clone().unwrap();
        raw.write_all(b"garbage!").unwrap();
        thread::sleep(Duration::from_millis(50));

        let client = RpcConnection::new("client", a, Arc::new(DispatchTable::new()));
        client.start(Arc::new(InlineSink)).unwrap();
        assert_eq!(client.invoke("ping", vec![]), Ok(json!("pong")));
        assert!(!server.is_closed());
        client.dispose();
        server.dispose();
    }

    #[test]
    fn frame_following_junk_in_the_same_read_is_delivered() {
        let (mut raw, b) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let methods = Arc::new(DispatchTable::new());
        methods.register("record", move |args| {
            tx.lock().unwrap().send(args.to_vec()).unwrap();
            Ok(Value::Null)
        });
        let server = RpcConnection::new("server", b, methods);
        server.start(Arc::new(InlineSink)).unwrap();

        let envelope = Envelope { scope: Scope::GLOBAL, packet_id: 1, wait: false };
        let mut bytes = b"stray bytes".to_vec();
        bytes.extend(Frame::Request(RpcRequest::correlated(envelope, "record", vec![json!(7)])).encode().unwrap());
        raw.write_all(&bytes).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![json!(7)]);
        assert!(!server.is_closed());
        server.dispose();
    }
}
