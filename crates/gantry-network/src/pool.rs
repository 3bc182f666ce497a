//! Backend pool and selection strategies

use crate::backend::Backend;
use gantry_core::Strategy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type Backends = Arc<Vec<Arc<Backend>>>;

/// Ordered set of backends plus the strategy that picks among them.
///
/// The backend list is copy-on-append: selection clones the current `Arc`
/// under a brief read lock and scans it without holding any lock.
pub struct ServerPool {
    /// Selection strategy
    strategy: Strategy,
    /// Backends in insertion order
    backends: RwLock<Backends>,
    /// Next position to scan from (round-robin only)
    cursor: AtomicUsize,
}

impl ServerPool {
    /// Create an empty pool
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            backends: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Get the selection strategy
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Append a backend. Duplicate URLs are allowed.
    pub fn add_backend(&self, backend: Arc<Backend>) {
        let mut backends = self.backends.write();
        let mut next = Vec::with_capacity(backends.len() + 1);
        next.extend(backends.iter().cloned());
        next.push(backend);
        *backends = Arc::new(next);
    }

    /// Snapshot of all backends, in insertion order
    pub fn backends(&self) -> Backends {
        self.backends.read().clone()
    }

    pub fn size(&self) -> usize {
        self.backends.read().len()
    }

    /// Pick the backend for the next request, or `None` if none is alive
    pub fn select_next(&self) -> Option<Arc<Backend>> {
        let backends = self.backends();
        let selected = match self.strategy {
            Strategy::RoundRobin => self.next_round_robin(&backends),
            Strategy::LeastConnected => least_connected(&backends),
        };

        match &selected {
            Some(backend) => debug!(
                strategy = %self.strategy,
                backend = %backend.url(),
                "Selected backend"
            ),
            None => debug!(
                strategy = %self.strategy,
                total_backends = backends.len(),
                "No alive backend available"
            ),
        }

        selected
    }

    /// Scan once around the ring from the cursor and move the cursor just
    /// past the first alive backend. A lost race on the cursor rescans from
    /// the winner's position, so concurrent callers never share a slot.
    fn next_round_robin(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let len = backends.len();
        if len == 0 {
            return None;
        }

        let mut start = self.cursor.load(Ordering::Acquire);
        'scan: loop {
            for offset in 0..len {
                let index = (start + offset) % len;
                let backend = &backends[index];
                if !backend.is_alive() {
                    continue;
                }
                match self.cursor.compare_exchange(
                    start,
                    (index + 1) % len,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(backend.clone()),
                    Err(current) => {
                        start = current;
                        continue 'scan;
                    }
                }
            }
            return None;
        }
    }
}

/// Alive backend with the fewest active connections; ties go to the
/// earliest inserted
fn least_connected(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    let mut best: Option<(&Arc<Backend>, usize)> = None;
    for backend in backends.iter().filter(|b| b.is_alive()) {
        let connections = backend.active_connections();
        if best.map_or(true, |(_, fewest)| connections < fewest) {
            best = Some((backend, connections));
        }
    }
    best.map(|(backend, _)| backend.clone())
}
