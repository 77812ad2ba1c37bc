//! Deferred reclamation of resources whose teardown may block or fail.
//!
//! Things like exited-but-unreaped encoder processes and open decoders are
//! handed to a [`Collector`] instead of being closed inline. A background
//! thread polls every registered item until its [`Garbage::collect`] reports
//! success.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, LazyLock},
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

static GLOBAL: LazyLock<Collector> = LazyLock::new(|| Collector::new(DEFAULT_INTERVAL));

/// A resource waiting to be reclaimed.
pub trait Garbage: Send {
    /// Attempts to release the resource. `Ok(true)` removes the item from the
    /// collector; `Ok(false)` and errors keep it around for the next sweep.
    fn collect(&mut self) -> anyhow::Result<bool>;
}

struct Record {
    item: Box<dyn Garbage>,
    created: Instant,
    attempts: u64,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    records: HashMap<u64, Arc<Mutex<Record>>>,
}

enum Worker {
    Idle,
    Running(Sender<()>),
    Stopped,
}

struct Shared {
    interval: Duration,
    registry: Arc<Mutex<Registry>>,
    worker: Mutex<Worker>,
}

/// Handle to a collector. Clones share the same registry and thread.
///
/// The sweeping thread is started by the first registration. It exits after
/// [`Collector::stop`], or once every handle of a non-global collector is gone.
#[derive(Clone)]
pub struct Collector {
    shared: Arc<Shared>,
}

impl Collector {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                interval,
                registry: Arc::new(Mutex::new(Registry::default())),
                worker: Mutex::new(Worker::Idle),
            }),
        }
    }

    /// The process-wide collector, created on first use.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    pub fn register<G: Garbage + 'static>(&self, garbage: G) {
        {
            let mut registry = self.shared.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.records.insert(
                id,
                Arc::new(Mutex::new(Record {
                    item: Box::new(garbage),
                    created: Instant::now(),
                    attempts: 0,
                })),
            );
        }
        self.ensure_running();
    }

    /// Number of items not reclaimed yet.
    pub fn pending(&self) -> usize {
        self.shared.registry.lock().records.len()
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    pub fn same_as(&self, other: &Collector) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Stops the sweeping thread after its current sweep. Items registered
    /// afterwards are held but no longer polled.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.shared.worker.lock(), Worker::Stopped);
        if let Worker::Running(stop) = previous {
            drop(stop);
            log::debug!("garbage collector stopping");
        }
    }

    fn ensure_running(&self) {
        let mut worker = self.shared.worker.lock();
        match *worker {
            Worker::Idle => {}
            Worker::Running(_) => return,
            Worker::Stopped => {
                log::warn!("garbage registered after the collector was stopped");
                return;
            }
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let registry = Arc::clone(&self.shared.registry);
        let interval = self.shared.interval;
        let spawned = thread::Builder::new()
            .name("garbage-collector".to_string())
            .spawn(move || run(registry, interval, stop_rx));

        match spawned {
            Ok(_) => *worker = Worker::Running(stop_tx),
            Err(e) => log::error!("failed to start garbage collector thread: {}", e),
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::global()
    }
}

fn run(registry: Arc<Mutex<Registry>>, interval: Duration, stop: Receiver<()>) {
    log::debug!("garbage collector started, interval {:?}", interval);
    loop {
        sweep(&registry);
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    log::debug!("garbage collector stopped");
}

fn sweep(registry: &Mutex<Registry>) {
    let snapshot: Vec<(u64, Arc<Mutex<Record>>)> = registry
        .lock()
        .records
        .iter()
        .map(|(id, record)| (*id, Arc::clone(record)))
        .collect();

    let mut collected = Vec::new();
    for (id, record) in snapshot {
        let mut record = record.lock();
        record.attempts += 1;
        match catch_unwind(AssertUnwindSafe(|| record.item.collect())) {
            Ok(Ok(true)) => collected.push(id),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => log::error!(
                "collection failure (attempt {}, age {:?}): {:#}",
                record.attempts,
                record.created.elapsed(),
                e
            ),
            Err(_) => log::error!(
                "collection panicked (attempt {}, age {:?})",
                record.attempts,
                record.created.elapsed()
            ),
        }
    }

    if collected.is_empty() {
        return;
    }

    let removed: Vec<Arc<Mutex<Record>>> = {
        let mut registry = registry.lock();
        collected
            .iter()
            .filter_map(|id| registry.records.remove(id))
            .collect()
    };
    log::debug!("collected {} garbage item(s)", removed.len());
}

#[cfg(test)]
#[path = "garbage_test.rs"]
mod garbage_test;
