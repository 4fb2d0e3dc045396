use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};

/// Gates the start and finish of one work unit — a search, or one self-play
/// round of N games. Workers block in `wait_for_work_items` between units;
/// the controller signals stop through the same object.
pub struct WorkCoordinator {
    generation: Mutex<u64>,
    work_ready: Condvar,
    remaining_items: AtomicI64,
    stop: AtomicBool,
    shutdown: AtomicBool,
}

impl WorkCoordinator {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            work_ready: Condvar::new(),
            remaining_items: AtomicI64::new(0),
            stop: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Publish a new work unit of `items` items and wake every worker.
    pub fn begin_work(&self, items: i64) {
        self.remaining_items.store(items, Ordering::Relaxed);
        self.stop.store(false, Ordering::Release);
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.work_ready.notify_all();
    }

    /// Block until a work unit newer than `seen_generation` exists. Returns
    /// the new generation, or `None` once the coordinator is shut down.
    pub fn wait_for_work_items(&self, seen_generation: u64) -> Option<u64> {
        let mut generation = self.generation.lock().unwrap();
        while *generation == seen_generation && !self.shutdown.load(Ordering::Acquire) {
            generation = self.work_ready.wait(generation).unwrap();
        }
        if self.shutdown.load(Ordering::Acquire) {
            None
        } else {
            Some(*generation)
        }
    }

    pub fn on_work_item_completed(&self) {
        self.remaining_items.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn all_work_items_completed(&self) -> bool {
        self.remaining_items.load(Ordering::Relaxed) <= 0
    }

    /// The only cancellation signal in the system. In-flight iterations run
    /// to their next yield point; finalization repairs the counters.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Permanently release workers blocked on `wait_for_work_items`.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _generation = self.generation.lock().unwrap();
        self.work_ready.notify_all();
    }
}

impl Default for WorkCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
