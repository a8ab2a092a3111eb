use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use node_rpc::dispatch::panic_message;
use opentelemetry::metrics::Meter;
use tracing::{debug, error, warn};

use crate::telemetry::{self, QueueMetrics};

/// Items that waited longer than this before pickup count as slow.
pub const SLOW_ITEM_THRESHOLD: Duration = Duration::from_secs(2);
/// At most one slow-item or drop warning per queue in this interval.
pub const WARNING_INTERVAL: Duration = Duration::from_secs(10);
const WORKER_POLL: Duration = Duration::from_millis(100);

pub trait QueueProcessor<T>: Send + Sync + 'static {
    fn process(&self, queue: usize, item: T);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub threads: usize,
    pub capacity: usize,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, threads: usize, capacity: usize) -> Self {
        Self { name: name.into(), threads: threads.max(1), capacity: capacity.max(1) }
    }
}

/// Point-in-time view of one queue, consumed by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub index: usize,
    pub name: String,
    pub threads: usize,
    pub busy: usize,
    pub queued: usize,
    pub capacity: usize,
    /// How long every worker thread has been busy without a break.
    pub saturated_for: Option<Duration>,
}

/// Rate limiter that aggregates occurrences between warnings.
#[derive(Debug, Default)]
struct Throttle {
    pending: AtomicU64,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    /// Count one occurrence; returns the aggregate when a warning is due.
    fn hit(&self, now: Instant, interval: Duration) -> Option<u64> {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        match *last {
            Some(at) if now.duration_since(at) < interval => None,
            _ => {
                *last = Some(now);
                Some(self.pending.swap(0, Ordering::Relaxed))
            }
        }
    }
}

/// Busy workers and the start of the current saturation, kept under one lock
/// so `saturated_since` is set whenever `busy >= threads`.
#[derive(Debug, Default, Clone, Copy)]
struct Occupancy {
    busy: usize,
    saturated_since: Option<Instant>,
}

#[derive(Debug)]
pub struct QueueStats {
    name: String,
    threads: usize,
    occupancy: Mutex<Occupancy>,
    metrics: QueueMetrics,
    slow: Throttle,
    drops: Throttle,
}

impl QueueStats {
    fn new(name: &str, threads: usize, meter: &Meter) -> Self {
        Self {
            name: name.to_string(),
            threads,
            occupancy: Mutex::new(Occupancy::default()),
            metrics: QueueMetrics::new(meter, name),
            slow: Throttle::default(),
            drops: Throttle::default(),
        }
    }

    fn occupancy(&self) -> MutexGuard<'_, Occupancy> {
        self.occupancy.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn begin(&self) {
        let mut occupancy = self.occupancy();
        occupancy.busy += 1;
        if occupancy.busy >= self.threads {
            occupancy.saturated_since.get_or_insert_with(Instant::now);
        }
    }

    fn end(&self) {
        {
            let mut occupancy = self.occupancy();
            occupancy.busy = occupancy.busy.saturating_sub(1);
            if occupancy.busy < self.threads {
                occupancy.saturated_since = None;
            }
        }
        self.metrics.processed();
    }

    /// Returns the number of slow items reported when a warning was emitted.
    pub fn record_slow(&self, waited: Duration) -> Option<u64> {
        self.metrics.slow();
        let count = self.slow.hit(Instant::now(), WARNING_INTERVAL)?;
        warn!(
            queue = %self.name,
            slow_items = count,
            waited_ms = waited.as_millis() as u64,
            "queue items are waiting too long before being processed"
        );
        Some(count)
    }

    fn record_drop(&self, allow_drop: bool) {
        self.metrics.dropped();
        if let Some(count) = self.drops.hit(Instant::now(), WARNING_INTERVAL) {
            warn!(queue = %self.name, dropped = count, allow_drop, "queue is full, dropping items");
        }
    }

    pub fn busy(&self) -> usize {
        self.occupancy().busy
    }

    pub fn saturated_for(&self) -> Option<Duration> {
        self.occupancy().saturated_since.map(|since| since.elapsed())
    }
}

struct Queued<T> {
    item: T,
    enqueued_at: Instant,
}

struct Queue<T> {
    spec: QueueSpec,
    stats: Arc<QueueStats>,
    sender: Sender<Queued<T>>,
    receiver: Receiver<Queued<T>>,
}

/// N independent FIFO queues, each drained by its own pool of OS threads so a
/// slow consumer in one queue never delays another.
pub struct QueueManager<T> {
    queues: Vec<Queue<T>>,
    block_timeout: Duration,
    stopping: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for QueueManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.queues.iter().map(|q| &q.spec).collect::<Vec<_>>())
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Send + 'static> QueueManager<T> {
    /// `block_timeout` bounds how long `enqueue(.., allow_drop = false)` waits.
    pub fn new(specs: Vec<QueueSpec>, block_timeout: Duration) -> Self {
        Self::with_meter(specs, block_timeout, &telemetry::meter())
    }

    pub fn with_meter(specs: Vec<QueueSpec>, block_timeout: Duration, meter: &Meter) -> Self {
        let queues = specs
            .into_iter()
            .map(|spec| {
                let (sender, receiver) = channel::bounded(spec.capacity);
                let stats = Arc::new(QueueStats::new(&spec.name, spec.threads, meter));
                Queue { stats, spec, sender, receiver }
            })
            .collect();
        Self {
            queues,
            block_timeout,
            stopping: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self, processor: Arc<dyn QueueProcessor<T>>) -> std::io::Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        for (index, queue) in self.queues.iter().enumerate() {
            for n in 0..queue.spec.threads {
                let receiver = queue.receiver.clone();
                let stats = queue.stats.clone();
                let stopping = self.stopping.clone();
                let processor = processor.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-{n}", queue.spec.name))
                    .spawn(move || worker_loop(index, stats, receiver, stopping, processor))?;
                workers.push(handle);
            }
            debug!(queue = %queue.spec.name, threads = queue.spec.threads, "queue started");
        }
        Ok(())
    }

    /// Returns false when the item was dropped.
    pub fn enqueue(&self, index: usize, item: T, allow_drop: bool) -> bool {
        let Some(queue) = self.queues.get(index) else {
            error!(index, "enqueue on unknown queue");
            return false;
        };
        if self.stopping.load(Ordering::SeqCst) {
            return false;
        }
        let queued = Queued { item, enqueued_at: Instant::now() };
        let sent = if allow_drop {
            match queue.sender.try_send(queued) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
            }
        } else {
            queue.sender.send_timeout(queued, self.block_timeout).is_ok()
        };
        if !sent {
            queue.stats.record_drop(allow_drop);
        }
        sent
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn stats(&self, index: usize) -> Option<Arc<QueueStats>> {
        self.queues.get(index).map(|q| q.stats.clone())
    }

    pub fn snapshots(&self) -> Vec<QueueSnapshot> {
        self.queues
            .iter()
            .enumerate()
            .map(|(index, q)| {
                let occupancy = *q.stats.occupancy();
                QueueSnapshot {
                    index,
                    name: q.spec.name.clone(),
                    threads: q.spec.threads,
                    busy: occupancy.busy,
                    queued: q.sender.len(),
                    capacity: q.spec.capacity,
                    saturated_for: occupancy.saturated_since.map(|since| since.elapsed()),
                }
            })
            .collect()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Stop accepting items and join the workers. Items still buffered are
    /// discarded.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        for queue in &self.queues {
            let discarded = queue.receiver.try_iter().count();
            if discarded > 0 {
                debug!(queue = %queue.spec.name, discarded, "discarded queued items on stop");
            }
        }
    }
}

fn worker_loop<T: 'static>(
    index: usize,
    stats: Arc<QueueStats>,
    receiver: Receiver<Queued<T>>,
    stopping: Arc<AtomicBool>,
    processor: Arc<dyn QueueProcessor<T>>,
) {
    while !stopping.load(Ordering::SeqCst) {
        let queued = match receiver.recv_timeout(WORKER_POLL) {
            Ok(queued) => queued,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let waited = queued.enqueued_at.elapsed();
        if waited > SLOW_ITEM_THRESHOLD {
            stats.record_slow(waited);
        }
        stats.begin();
        let item = queued.item;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| processor.process(index, item))) {
            error!(queue = %stats.name, reason = %panic_message(&panic), "queue item panicked");
        }
        stats.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::testing::MeterCapture;

    struct Gated {
        gate: Receiver<()>,
        seen: Mutex<Vec<u32>>,
    }

    impl QueueProcessor<u32> for Gated {
        fn process(&self, _queue: usize, item: u32) {
            let _ = self.gate.recv_timeout(Duration::from_secs(5));
            self.seen.lock().unwrap().push(item);
        }
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn single_slot(block_timeout: Duration) -> (QueueManager<u32>, Arc<Gated>, Sender<()>) {
        single_slot_with(block_timeout, &telemetry::meter())
    }

    fn single_slot_with(block_timeout: Duration, meter: &Meter) -> (QueueManager<u32>, Arc<Gated>, Sender<()>) {
        let (open, gate) = channel::unbounded();
        let processor = Arc::new(Gated { gate, seen: Mutex::new(Vec::new()) });
        let manager = QueueManager::with_meter(vec![QueueSpec::new("test", 1, 1)], block_timeout, meter);
        manager.start(processor.clone()).unwrap();
        (manager, processor, open)
    }

    #[test]
    fn full_queue_drops_when_allowed() {
        let capture = MeterCapture::new();
        let (manager, processor, open) = single_slot_with(Duration::from_secs(5), &capture.meter());
        assert!(manager.enqueue(0, 1, true));
        assert!(wait_until(Duration::from_secs(2), || manager.stats(0).unwrap().busy() == 1));
        assert!(manager.enqueue(0, 2, true));
        assert!(!manager.enqueue(0, 3, true));

        open.send(()).unwrap();
        open.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || processor.seen.lock().unwrap().len() == 2));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*processor.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(capture.counter("queue_items_dropped"), 1);
        assert!(wait_until(Duration::from_secs(2), || capture.counter("queue_items_processed") == 2));
        manager.stop();
    }

    #[test]
    fn blocking_enqueue_waits_for_space() {
        let (manager, processor, open) = single_slot(Duration::from_secs(5));
        assert!(manager.enqueue(0, 1, false));
        assert!(wait_until(Duration::from_secs(2), || manager.stats(0).unwrap().busy() == 1));
        assert!(manager.enqueue(0, 2, false));

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            for _ in 0..3 {
                open.send(()).unwrap();
            }
        });
        let started = Instant::now();
        assert!(manager.enqueue(0, 3, false));
        assert!(started.elapsed() >= Duration::from_millis(80));
        releaser.join().unwrap();

        assert!(wait_until(Duration::from_secs(2), || processor.seen.lock().unwrap().len() == 3));
        assert_eq!(*processor.seen.lock().unwrap(), vec![1, 2, 3]);
        manager.stop();
    }

    #[test]
    fn blocking_enqueue_gives_up_after_timeout() {
        let (manager, _processor, open) = single_slot(Duration::from_millis(50));
        assert!(manager.enqueue(0, 1, false));
        assert!(wait_until(Duration::from_secs(2), || manager.stats(0).unwrap().busy() == 1));
        assert!(manager.enqueue(0, 2, false));
        assert!(!manager.enqueue(0, 3, false));
        open.send(()).unwrap();
        open.send(()).unwrap();
        manager.stop();
    }

    #[test]
    fn saturation_is_tracked_while_all_threads_are_busy() {
        let (manager, processor, open) = single_slot(Duration::from_secs(1));
        assert_eq!(manager.snapshots()[0].saturated_for, None);
        manager.enqueue(0, 1, true);
        assert!(wait_until(Duration::from_secs(2), || manager.snapshots()[0].saturated_for.is_some()));
        open.send(()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || processor.seen.lock().unwrap().len() == 1));
        assert!(wait_until(Duration::from_secs(2), || manager.snapshots()[0].saturated_for.is_none()));
        manager.stop();
    }

    #[test]
    fn saturation_survives_interleaved_begin_and_end() {
        let stats = Arc::new(QueueStats::new("busy", 2, &telemetry::meter()));
        stats.begin();
        let stop = Arc::new(AtomicBool::new(false));
        let togglers: Vec<_> = (0..3)
            .map(|_| {
                let stats = stats.clone();
                thread::spawn(move || {
                    for _ in 0..20_000 {
                        stats.begin();
                        stats.end();
                    }
                })
            })
            .collect();
        let checker = {
            let stats = stats.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut checked = 0u64;
                loop {
                    let occupancy = *stats.occupancy();
                    assert!(
                        occupancy.busy < 2 || occupancy.saturated_since.is_some(),
                        "all workers busy but no saturation start recorded"
                    );
                    checked += 1;
                    if stop.load(Ordering::SeqCst) {
                        return checked;
                    }
                }
            })
        };
        for toggler in togglers {
            toggler.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        assert!(checker.join().unwrap() > 0);

        assert_eq!(stats.busy(), 1);
        assert_eq!(stats.saturated_for(), None);
        stats.begin();
        assert!(stats.saturated_for().is_some());
        stats.end();
        assert_eq!(stats.saturated_for(), None);
    }

    #[test]
    fn slow_item_warnings_are_aggregated() {
        let capture = MeterCapture::new();
        let stats = QueueStats::new("slow", 1, &capture.meter());
        assert_eq!(stats.record_slow(Duration::from_secs(3)), Some(1));
        assert_eq!(stats.record_slow(Duration::from_secs(3)), None);
        assert_eq!(stats.record_slow(Duration::from_secs(3)), None);
        assert_eq!(stats.slow.pending.load(Ordering::Relaxed), 2);
        assert_eq!(capture.counter("queue_items_slow"), 3);
    }

    #[test]
    fn queues_do_not_block_each_other() {
        struct Record(Mutex<Vec<(usize, u32)>>);
        impl QueueProcessor<u32> for Record {
            fn process(&self, queue: usize, item: u32) {
                if queue == 0 {
                    thread::sleep(Duration::from_millis(300));
                }
                self.0.lock().unwrap().push((queue, item));
            }
        }
        let record = Arc::new(Record(Mutex::new(Vec::new())));
        let manager = QueueManager::new(
            vec![QueueSpec::new("slow", 1, 10), QueueSpec::new("fast", 1, 10)],
            Duration::from_secs(1),
        );
        manager.start(record.clone()).unwrap();
        manager.enqueue(0, 1, true);
        manager.enqueue(1, 2, true);
        assert!(wait_until(Duration::from_millis(200), || record.0.lock().unwrap().contains(&(1, 2))));
        assert!(wait_until(Duration::from_secs(2), || record.0.lock().unwrap().len() == 2));
        manager.stop();
        assert!(!manager.enqueue(1, 3, true));
    }

    #[test]
    fn panicking_item_does_not_kill_worker() {
        struct Flaky(Mutex<Vec<u32>>);
        impl QueueProcessor<u32> for Flaky {
            fn process(&self, _queue: usize, item: u32) {
                if item == 0 {
                    panic!("bad item");
                }
                self.0.lock().unwrap().push(item);
            }
        }
        let flaky = Arc::new(Flaky(Mutex::new(Vec::new())));
        let manager = QueueManager::new(vec![QueueSpec::new("flaky", 1, 4)], Duration::from_secs(1));
        manager.start(flaky.clone()).unwrap();
        manager.enqueue(0, 0, true);
        manager.enqueue(0, 7, true);
        assert!(wait_until(Duration::from_secs(2), || *flaky.0.lock().unwrap() == vec![7]));
        manager.stop();
    }
}
