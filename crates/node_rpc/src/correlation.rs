use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::rpc::{Fault, PacketId, RpcResponse, RpcResult, Scope};

/// Longest single sleep of a waiter before it re-checks the disposing flag.
pub const WAIT_ROUND: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct SlotState {
    result: Option<RpcResult>,
    finished: bool,
}

/// One outstanding request awaiting its response. Each slot owns its wait
/// handle, so resolving it wakes exactly the one waiter.
#[derive(Debug, Default)]
pub struct PendingRequest {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl PendingRequest {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self, result: RpcResult) -> bool {
        let mut state = self.lock();
        if state.finished {
            return false;
        }
        state.result = Some(result);
        state.finished = true;
        self.ready.notify_one();
        true
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }
}

/// Outstanding requests keyed by `(scope, packetId)`.
#[derive(Debug)]
pub struct PendingRequests {
    slots: DashMap<(Scope, PacketId), Arc<PendingRequest>>,
    next_packet_id: AtomicU64,
    disposing: AtomicBool,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            next_packet_id: AtomicU64::new(1),
            disposing: AtomicBool::new(false),
        }
    }

    /// Packet ids increase monotonically for the lifetime of the process side
    /// of the connection and are never handed out twice.
    pub fn next_packet_id(&self) -> PacketId {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, scope: Scope, packet_id: PacketId) -> Result<Arc<PendingRequest>, Fault> {
        if self.is_disposing() {
            return Err(Fault::disposing());
        }
        match self.slots.entry((scope, packet_id)) {
            Entry::Occupied(_) => Err(Fault::internal(format!(
                "packet {packet_id} is already outstanding in scope {scope}"
            ))),
            Entry::Vacant(vacant) => {
                let slot = Arc::new(PendingRequest::default());
                vacant.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    /// Route a response to its waiter. Returns false for unknown or late
    /// responses, which are dropped.
    pub fn resolve(&self, response: RpcResponse) -> bool {
        let key = (response.scope, response.packet_id);
        let Some(slot) = self.slots.get(&key).map(|s| s.value().clone()) else {
            debug!(scope = %response.scope, packet_id = response.packet_id, "dropping response without waiter");
            return false;
        };
        slot.finish(response.result)
    }

    /// Block until the slot is resolved, the engine disposes, or `timeout`
    /// elapses. The slot is always removed before returning.
    pub fn wait(&self, scope: Scope, packet_id: PacketId, slot: &PendingRequest, timeout: Duration) -> RpcResult {
        let deadline = Instant::now() + timeout;
        let mut state = slot.lock();
        let result = loop {
            if state.finished {
                break state.result.take().unwrap_or_else(|| Err(Fault::no_response()));
            }
            if self.is_disposing() {
                break Err(Fault::disposing());
            }
            let now = Instant::now();
            if now >= deadline {
                break Err(Fault::no_response());
            }
            let round = (deadline - now).min(WAIT_ROUND);
            state = match slot.ready.wait_timeout(state, round) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        };
        drop(state);
        self.slots.remove(&(scope, packet_id));
        result
    }

    /// Wake every waiter with a disposing fault and refuse new registrations.
    pub fn dispose(&self) {
        self.disposing.store(true, Ordering::SeqCst);
        let slots: Vec<Arc<PendingRequest>> = self.slots.iter().map(|s| s.value().clone()).collect();
        for slot in slots {
            slot.finish(Err(Fault::disposing()));
        }
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
