//! Worker pool abstraction: how many workers the host runs and which one is
//! calling. Append lists size themselves from it and parallel merges fan out
//! over it.

use std::cell::Cell;
use std::panic;
use std::sync::LazyLock;
use std::thread;

static CPU_COUNT: LazyLock<usize> = LazyLock::new(|| {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
});

thread_local! {
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Host thread-index provider.
pub trait WorkerPool: Sync {
    /// Fixed for the lifetime of the pool.
    fn worker_count(&self) -> usize;

    /// Stable index of the calling worker, `None` off-pool.
    fn current_worker_index(&self) -> Option<usize>;

    /// Run `job(worker_index)` once on every worker; returns results in worker order.
    fn broadcast<F, T>(&self, job: F) -> Vec<T>
    where
        F: Fn(usize) -> T + Sync,
        T: Send;
}

/// Pool of scoped OS threads, spawned per broadcast.
#[derive(Copy, Clone, Debug)]
pub struct ScopedPool {
    workers: usize,
}

impl ScopedPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// One worker per available CPU.
    pub fn available() -> Self {
        Self::new(*CPU_COUNT)
    }
}

impl Default for ScopedPool {
    fn default() -> Self {
        Self::available()
    }
}

impl WorkerPool for ScopedPool {
    fn worker_count(&self) -> usize {
        self.workers
    }

    fn current_worker_index(&self) -> Option<usize> {
        WORKER_INDEX.with(Cell::get)
    }

    fn broadcast<F, T>(&self, job: F) -> Vec<T>
    where
        F: Fn(usize) -> T + Sync,
        T: Send,
    {
        let job = &job;
        thread::scope(|s| {
            let handles: Vec<_> = (0..self.workers)
                .map(|worker| {
                    s.spawn(move || {
                        WORKER_INDEX.with(|w| w.set(Some(worker)));
                        job(worker)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| panic::resume_unwind(e)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn broadcast_runs_every_worker_once() {
        let pool = ScopedPool::new(6);
        let hits = AtomicUsize::new(0);
        let indices = pool.broadcast(|w| {
            hits.fetch_add(1, Ordering::Relaxed);
            assert_eq!(pool.current_worker_index(), Some(w));
            w
        });
        assert_eq!(indices, (0..6).collect::<Vec<_>>());
        assert_eq!(hits.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn caller_is_not_a_worker() {
        let pool = ScopedPool::new(2);
        assert_eq!(pool.current_worker_index(), None);
    }

    #[test]
    fn at_least_one_worker() {
        assert_eq!(ScopedPool::new(0).worker_count(), 1);
        assert!(ScopedPool::available().worker_count() >= 1);
    }

    #[test]
    #[should_panic(expected = "worker 1 failed")]
    fn worker_panics_propagate() {
        ScopedPool::new(3).broadcast(|w| {
            if w == 1 {
                panic!("worker 1 failed");
            }
        });
    }
}
