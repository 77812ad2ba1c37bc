use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use super::{Collector, Garbage};

struct WorkingGarbage {
    item: Arc<AtomicBool>,
}

impl Garbage for WorkingGarbage {
    fn collect(&mut self) -> anyhow::Result<bool> {
        self.item.store(false, Ordering::SeqCst);
        Ok(true)
    }
}

struct BrokenGarbage {
    calls: Arc<AtomicUsize>,
}

impl Garbage for BrokenGarbage {
    fn collect(&mut self) -> anyhow::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!("collection not possible"))
    }
}

struct PanickingGarbage;

impl Garbage for PanickingGarbage {
    fn collect(&mut self) -> anyhow::Result<bool> {
        panic!("collector must survive this");
    }
}

struct SlowGarbage {
    remaining: usize,
}

impl Garbage for SlowGarbage {
    fn collect(&mut self) -> anyhow::Result<bool> {
        self.remaining = self.remaining.saturating_sub(1);
        Ok(self.remaining == 0)
    }
}

const INTERVAL: Duration = Duration::from_millis(50);

#[test]
fn test_collector_singleton() {
    assert!(Collector::default().same_as(&Collector::default()));
    assert!(Collector::global().same_as(&Collector::default()));
    assert!(!Collector::new(INTERVAL).same_as(&Collector::global()));
}

#[test]
fn test_garbage_collection() {
    let collector = Collector::new(INTERVAL);
    let item = Arc::new(AtomicBool::new(true));

    collector.register(WorkingGarbage {
        item: Arc::clone(&item),
    });
    thread::sleep(INTERVAL * 4);

    assert!(!item.load(Ordering::SeqCst));
    assert_eq!(collector.pending(), 0);
}

#[test]
fn test_garbage_collection_failure() {
    let collector = Collector::new(INTERVAL);
    let calls = Arc::new(AtomicUsize::new(0));
    let item = Arc::new(AtomicBool::new(true));

    collector.register(BrokenGarbage {
        calls: Arc::clone(&calls),
    });
    collector.register(WorkingGarbage {
        item: Arc::clone(&item),
    });
    thread::sleep(INTERVAL * 4);

    assert!(!item.load(Ordering::SeqCst));
    assert_eq!(collector.pending(), 1);
    assert!(calls.load(Ordering::SeqCst) >= 2, "broken item must be retried");
}

#[test]
fn test_garbage_collection_survives_panic() {
    let collector = Collector::new(INTERVAL);
    let item = Arc::new(AtomicBool::new(true));

    collector.register(PanickingGarbage);
    collector.register(WorkingGarbage {
        item: Arc::clone(&item),
    });
    thread::sleep(INTERVAL * 4);

    assert!(!item.load(Ordering::SeqCst));
    assert_eq!(collector.pending(), 1);
}

#[test]
fn test_garbage_is_polled_until_done() {
    let collector = Collector::new(INTERVAL);

    collector.register(SlowGarbage { remaining: 3 });
    assert_eq!(collector.pending(), 1);

    thread::sleep(INTERVAL * 6);
    assert_eq!(collector.pending(), 0);
}

#[test]
fn test_stopped_collector_no_longer_sweeps() {
    let collector = Collector::new(INTERVAL);
    let calls = Arc::new(AtomicUsize::new(0));

    collector.register(BrokenGarbage {
        calls: Arc::clone(&calls),
    });
    thread::sleep(INTERVAL * 2);
    collector.stop();
    thread::sleep(INTERVAL * 2);

    let after_stop = calls.load(Ordering::SeqCst);
    thread::sleep(INTERVAL * 3);
    assert_eq!(calls.load(Ordering::SeqCst), after_stop);

    let item = Arc::new(AtomicBool::new(true));
    collector.register(WorkingGarbage {
        item: Arc::clone(&item),
    });
    thread::sleep(INTERVAL * 2);
    assert!(item.load(Ordering::SeqCst));
    assert_eq!(collector.pending(), 2);
}
