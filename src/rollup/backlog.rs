use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::export::health::HealthMetrics;

#[derive(Default)]
struct BacklogState {
    queue: VecDeque<String>,
    /// Every collection ever enqueued, including finished ones.
    known: HashSet<String>,
    running: HashSet<String>,
}

/// FIFO of collections waiting to be scanned, plus the permits bounding how
/// many scans run at once.
///
/// A collection is accepted at most once per process lifetime; the table it
/// feeds is never cleared, so scanning it twice would double count.
pub struct Backlog {
    state: Mutex<BacklogState>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl Backlog {
    pub fn new(max_concurrent: usize, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            state: Mutex::new(BacklogState::default()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            health,
        }
    }

    /// Queues `collection`. Returns false if it was seen before.
    pub fn enqueue(&self, collection: &str) -> bool {
        let mut state = self.state.lock();
        if !state.known.insert(collection.to_string()) {
            return false;
        }
        state.queue.push_back(collection.to_string());
        self.report(&state);
        true
    }

    /// Takes the oldest queued collection if a scan permit is free.
    pub fn try_admit(self: &Arc<Self>) -> Option<Admission> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;

        let mut state = self.state.lock();
        let collection = state.queue.pop_front()?;
        state.running.insert(collection.clone());
        self.report(&state);

        Some(Admission {
            collection,
            _permit: permit,
            backlog: Arc::clone(self),
        })
    }

    /// Admits as many queued collections as there are free permits.
    pub fn admit_all(self: &Arc<Self>) -> Vec<Admission> {
        std::iter::from_fn(|| self.try_admit()).collect()
    }

    /// Collections waiting for a permit.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Collections currently being scanned.
    pub fn running(&self) -> usize {
        self.state.lock().running.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn finish(&self, collection: &str) {
        let mut state = self.state.lock();
        state.running.remove(collection);
        self.report(&state);
    }

    fn report(&self, state: &BacklogState) {
        if let Some(h) = &self.health {
            h.backlog_length.set(state.queue.len() as f64);
            h.scans_running.set(state.running.len() as f64);
        }
    }
}

/// The right to scan one collection. Dropping it frees the permit.
pub struct Admission {
    collection: String,
    _permit: OwnedSemaphorePermit,
    backlog: Arc<Backlog>,
}

impl Admission {
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.backlog.finish(&self.collection);
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("collection", &self.collection)
            .finish()
    }
}
