use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, error, info};

use crate::queue::QueueSnapshot;

/// Smallest timeout that enables the watchdog.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

pub type SnapshotSource = Arc<dyn Fn() -> Vec<QueueSnapshot> + Send + Sync>;
pub type FatalAction = Arc<dyn Fn(&str) + Send + Sync>;

/// Kill the current process without unwinding or running destructors.
/// A stuck worker cannot be trusted to shut down cleanly; its supervisor
/// restarts it.
pub fn kill_self(reason: &str) -> ! {
    error!(%reason, "terminating process");
    let _ = nix::sys::signal::kill(nix::unistd::Pid::this(), nix::sys::signal::Signal::SIGKILL);
    std::process::abort()
}

/// Name of the first queue saturated for longer than `timeout`, if any.
pub fn check(snapshots: &[QueueSnapshot], timeout: Duration) -> Option<String> {
    snapshots
        .iter()
        .find(|s| s.saturated_for.is_some_and(|d| d > timeout))
        .map(|s| {
            format!(
                "queue {} has had all {} threads busy for {} ms ({} items waiting)",
                s.name,
                s.threads,
                s.saturated_for.unwrap_or_default().as_millis(),
                s.queued
            )
        })
}

/// Background sampler that fires the fatal action once a queue stays fully
/// saturated past the timeout.
pub struct Watchdog {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog").finish_non_exhaustive()
    }
}

impl Watchdog {
    /// Returns `None` (watchdog disabled) for timeouts under one second.
    pub fn start(timeout: Duration, source: SnapshotSource, on_fatal: FatalAction) -> std::io::Result<Option<Self>> {
        Self::start_with_interval(timeout, SAMPLE_INTERVAL, source, on_fatal)
    }

    pub fn start_with_interval(
        timeout: Duration,
        interval: Duration,
        source: SnapshotSource,
        on_fatal: FatalAction,
    ) -> std::io::Result<Option<Self>> {
        if timeout < MIN_TIMEOUT {
            debug!(timeout_ms = timeout.as_millis() as u64, "watchdog disabled");
            return Ok(None);
        }
        let (stop, stopped) = channel::bounded::<()>(1);
        let handle = thread::Builder::new().name("watchdog".into()).spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                if let Some(reason) = check(&source(), timeout) {
                    on_fatal(&reason);
                    break;
                }
            }
        })?;
        info!(timeout_ms = timeout.as_millis() as u64, "watchdog started");
        Ok(Some(Self { stop, handle: Some(handle) }))
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
