use std::io::ErrorKind;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::connection::{FrameSink, InlineSink, RpcConnection};
use crate::dispatch::DispatchTable;

pub const DEFAULT_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not bind {path}: {source}")]
    Bind { path: PathBuf, source: std::io::Error },
    #[error("could not connect to {path}: {source}")]
    Connect { path: PathBuf, source: std::io::Error },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connect to a listening socket. A failed first attempt is retried once after
/// `retry_delay` (covers a coordinator that is still replacing a stale
/// socket file); the second failure is final.
pub fn connect(path: &Path, retry_delay: Duration) -> Result<UnixStream, TransportError> {
    match UnixStream::connect(path) {
        Ok(stream) => Ok(stream),
        Err(first) => {
            warn!(path = %path.display(), error = %first, "connect failed, retrying once");
            thread::sleep(retry_delay);
            UnixStream::connect(path).map_err(|source| TransportError::Connect {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

/// Listening side: accepts workers up to `max_connections` and keeps one
/// [`RpcConnection`] per peer, all sharing the same dispatch table.
pub struct RpcServer {
    path: PathBuf,
    listener: UnixListener,
    dispatch: Arc<DispatchTable>,
    sink: Arc<dyn FrameSink>,
    max_connections: usize,
    connections: DashMap<u64, Arc<RpcConnection>>,
    next_id: AtomicU64,
    stopping: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("path", &self.path)
            .field("max_connections", &self.max_connections)
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl RpcServer {
    pub fn bind(path: impl Into<PathBuf>, dispatch: Arc<DispatchTable>, max_connections: usize) -> Result<Arc<Self>, TransportError> {
        Self::bind_with_sink(path, dispatch, max_connections, Arc::new(InlineSink))
    }

    pub fn bind_with_sink(
        path: impl Into<PathBuf>,
        dispatch: Arc<DispatchTable>,
        max_connections: usize,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<Self>, TransportError> {
        let path = path.into();
        let bind_err = |source| TransportError::Bind { path: path.clone(), source };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(bind_err)?;
            }
        }
        // stale socket from a previous run
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        info!(path = %path.display(), max_connections, "rpc server listening");

        Ok(Arc::new(Self {
            path,
            listener,
            dispatch,
            sink,
            max_connections,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            acceptor: Mutex::new(None),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        let server = self.clone();
        let handle = thread::Builder::new()
            .name("rpc-accept".into())
            .spawn(move || server.accept_loop())?;
        *self.acceptor.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    fn accept_loop(self: Arc<Self>) {
        while !self.stopping.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _)) => self.admit(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "accept failed");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn admit(&self, stream: UnixStream) {
        self.prune_closed();
        if self.connections.len() >= self.max_connections {
            warn!(max = self.max_connections, "too many connections, rejecting client");
            return;
        }
        if let Err(e) = stream.set_nonblocking(false) {
            error!(error = %e, "could not configure client socket");
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = RpcConnection::new(format!("client-{id}"), stream, self.dispatch.clone());
        match connection.start(self.sink.clone()) {
            Ok(()) => {
                debug!(id, "client connected");
                self.connections.insert(id, connection);
            }
            Err(e) => error!(error = %e, "could not start client reader"),
        }
    }

    fn prune_closed(&self) {
        self.connections.retain(|_, c| !c.is_closed());
    }

    /// Open connections, oldest first.
    pub fn connections(&self) -> Vec<Arc<RpcConnection>> {
        self.prune_closed();
        let mut open: Vec<(u64, Arc<RpcConnection>)> =
            self.connections.iter().map(|e| (*e.key(), e.value().clone())).collect();
        open.sort_by_key(|(id, _)| *id);
        open.into_iter().map(|(_, c)| c).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.prune_closed();
        self.connections.len()
    }

    /// Wait up to `timeout` for at least one client.
    pub fn wait_for_connection(&self, timeout: Duration) -> Option<Arc<RpcConnection>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(first) = self.connections().into_iter().next() {
                return Some(first);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.acceptor.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let open: Vec<Arc<RpcConnection>> = self.connections.iter().map(|e| e.value().clone()).collect();
        self.connections.clear();
        for connection in open {
            connection.dispose();
        }
        let _ = std::fs::remove_file(&self.path);
        info!(path = %self.path.display(), "rpc server stopped");
    }
}
