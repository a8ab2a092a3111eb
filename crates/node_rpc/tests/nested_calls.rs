use std::os::unix::net::UnixStream;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use node_rpc::{DispatchTable, Fault, FrameSink, InlineSink, RpcConnection, RpcRequest, RpcResponse};
use serde_json::{Value, json};

/// Runs each request on its own thread so handlers can call the peer back.
struct ThreadSink;

impl FrameSink for ThreadSink {
    fn on_request(&self, connection: &Arc<RpcConnection>, request: RpcRequest) {
        let connection = connection.clone();
        thread::spawn(move || connection.handle_request(request));
    }

    fn on_response(&self, connection: &Arc<RpcConnection>, response: RpcResponse) {
        connection.on_response(response);
    }
}

#[test]
fn handler_can_call_back_into_the_requester() {
    let (client_end, server_end) = UnixStream::pair().unwrap();

    let peer: Arc<OnceLock<Weak<RpcConnection>>> = Arc::new(OnceLock::new());
    let server_dispatch = Arc::new(DispatchTable::new());
    let handle = peer.clone();
    server_dispatch.register("outer", move |args: &[Value]| {
        let conn = handle.get().and_then(Weak::upgrade).ok_or_else(Fault::disposing)?;
        let inner = conn.invoke("inner", args.to_vec())?;
        Ok(json!(inner.as_i64().unwrap_or(0) + 1))
    });
    let server = RpcConnection::new("server", server_end, server_dispatch);
    let _ = peer.set(Arc::downgrade(&server));
    server.start(Arc::new(ThreadSink)).unwrap();

    let client_dispatch = Arc::new(DispatchTable::new());
    client_dispatch.register("inner", |args: &[Value]| Ok(json!(args[0].as_i64().unwrap_or(0) * 2)));
    let client = RpcConnection::new("client", client_end, client_dispatch);
    client.start(Arc::new(InlineSink)).unwrap();

    assert_eq!(client.invoke("outer", vec![json!(5)]).unwrap(), json!(11));

    // concurrent outer calls from different threads stay apart
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let client = client.clone();
            thread::spawn(move || client.invoke("outer", vec![json!(i)]).unwrap())
        })
        .collect();
    for (i, worker) in workers.into_iter().enumerate() {
        assert_eq!(worker.join().unwrap(), json!(i as i64 * 2 + 1));
    }

    client.dispose();
    server.dispose();
    assert!(client.invoke("outer", vec![json!(1)]).is_err());
}
