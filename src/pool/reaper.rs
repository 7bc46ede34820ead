//! Process-wide background reaper for connection pools.
//!
//! One dedicated OS thread, started on the first registration, serves every
//! pool in the process for the lifetime of the process. Each registration has
//! its own sweep interval. Targets are held weakly: a pool that was dropped
//! without cancelling its registration is reported and forgotten. Sweeps must
//! never take the thread down, so panics are caught and logged.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Granularity at which the reaper thread checks for due sweeps.
const TICK: Duration = Duration::from_millis(100);

static REAPER: OnceLock<Arc<Reaper>> = OnceLock::new();

/// Something the reaper sweeps periodically.
pub trait Sweep: Send + Sync {
    /// Performs one sweep. Must not block for long.
    fn sweep(&self);
}

struct Entry {
    id: u64,
    interval: Duration,
    next_due: Instant,
    target: Weak<dyn Sweep>,
}

#[derive(Default)]
struct Reaper {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Reaper {
    fn global() -> Arc<Self> {
        Arc::clone(REAPER.get_or_init(|| {
            let reaper = Arc::new(Self::default());
            let worker = Arc::clone(&reaper);
            if let Err(e) = thread::Builder::new()
                .name("connection-reaper".to_string())
                .spawn(move || worker.run())
            {
                warn!(error = %e, "failed to start connection reaper thread");
            }
            reaper
        }))
    }

    fn run(&self) {
        debug!("connection reaper started");
        loop {
            thread::sleep(TICK);
            self.run_due(Instant::now());
        }
    }

    fn register(&self, target: Weak<dyn Sweep>, interval: Duration) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let interval = interval.max(TICK);
        self.lock().push(Entry {
            id,
            interval,
            next_due: Instant::now() + interval,
            target,
        });
        id
    }

    fn unregister(&self, id: u64) {
        self.lock().retain(|e| e.id != id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_due(&self, now: Instant) {
        let due: Vec<(u64, Weak<dyn Sweep>)> = {
            let mut entries = self.lock();
            entries
                .iter_mut()
                .filter(|e| now >= e.next_due)
                .map(|e| {
                    e.next_due = now + e.interval;
                    (e.id, Weak::clone(&e.target))
                })
                .collect()
        };

        for (id, target) in due {
            let Some(target) = target.upgrade() else {
                warn!(registration = id, "connection manager is not available, skipping sweep");
                self.unregister(id);
                continue;
            };
            if catch_unwind(AssertUnwindSafe(|| target.sweep())).is_err() {
                warn!(registration = id, "connection sweep panicked");
            }
        }
    }

    #[cfg(test)]
    fn is_registered(&self, id: u64) -> bool {
        self.lock().iter().any(|e| e.id == id)
    }
}

/// Registration with the shared reaper. Cancelled on drop.
#[derive(Debug)]
pub struct ReaperHandle {
    id: u64,
}

impl ReaperHandle {
    /// Stops sweeping this target. Calling it more than once is harmless.
    pub fn cancel(&self) {
        Reaper::global().unregister(self.id);
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Registers `target` to be swept every `interval` by the shared reaper thread.
pub fn register(target: Weak<dyn Sweep>, interval: Duration) -> ReaperHandle {
    let id = Reaper::global().register(target, interval);
    debug!(registration = id, interval_ms = interval.as_millis(), "registered with connection reaper");
    ReaperHandle { id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Sweep for Counter {
        fn sweep(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    impl Sweep for Panicky {
        fn sweep(&self) {
            panic!("sweep failure");
        }
    }

    #[test]
    fn test_run_due_only_sweeps_due_targets() {
        let reaper = Reaper::default();
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn Sweep> = Arc::downgrade(&counter) as Weak<dyn Sweep>;
        reaper.register(weak, Duration::from_secs(60));

        reaper.run_due(Instant::now());
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        reaper.run_due(Instant::now() + Duration::from_secs(61));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dead_target_is_dropped_with_warning() {
        let reaper = Reaper::default();
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn Sweep> = Arc::downgrade(&counter) as Weak<dyn Sweep>;
        let id = reaper.register(weak, TICK);
        drop(counter);

        reaper.run_due(Instant::now() + Duration::from_secs(1));
        assert!(!reaper.is_registered(id));
    }

    #[test]
    fn test_panicking_sweep_is_contained() {
        let reaper = Reaper::default();
        let panicky = Arc::new(Panicky);
        let weak: Weak<dyn Sweep> = Arc::downgrade(&panicky) as Weak<dyn Sweep>;
        let id = reaper.register(weak, TICK);

        reaper.run_due(Instant::now() + Duration::from_secs(1));
        reaper.run_due(Instant::now() + Duration::from_secs(2));
        assert!(reaper.is_registered(id), "a failing sweep keeps its registration");
    }

    #[test]
    fn test_shared_thread_sweeps_until_cancelled() {
        let counter = Arc::new(Counter::default());
        let weak: Weak<dyn Sweep> = Arc::downgrade(&counter) as Weak<dyn Sweep>;
        let handle = register(weak, Duration::from_millis(100));

        thread::sleep(Duration::from_millis(700));
        let swept = counter.0.load(Ordering::SeqCst);
        assert!(swept >= 2, "expected at least two sweeps, got {swept}");

        handle.cancel();
        thread::sleep(Duration::from_millis(250));
        let after_cancel = counter.0.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(400));
        assert_eq!(counter.0.load(Ordering::SeqCst), after_cancel);
    }
}
