//! Fixed-size pool of (optionally core-pinned) worker threads that run a
//! caller-supplied task in parallel and rejoin at a rendezvous barrier.
//!
//! Ported from `worker_pool.c` in the reference implementation. The C
//! original parks workers on `sigwait(SIGUSR1/SIGUSR2)` and rejoins on a
//! `pthread_barrier_t` of arity `n+1`. Here the park/wake signal is a
//! `Condvar` guarding a generation counter, and the rendezvous is a real
//! `std::sync::Barrier` of the same arity — the observable contract (park,
//! task, barrier, park) is unchanged.

use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::WorkerError;

type Task = dyn Fn(usize, usize) + Send + Sync;

struct State {
    generation: u64,
    task: Option<Arc<Task>>,
    stopping: bool,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    barrier: Barrier,
    worker_amount: usize,
}

/// A running pool of `worker_amount` threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_amount` threads. If `pin_cores` is set, worker `i`
    /// attempts to pin itself to logical core `i`; a failure to pin is
    /// logged but not fatal, since correctness never depends on affinity.
    pub fn new(worker_amount: usize, pin_cores: bool) -> Result<WorkerPool, WorkerError> {
        assert!(worker_amount > 0, "worker_amount must be >= 1");

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                generation: 0,
                task: None,
                stopping: false,
            }),
            wake: Condvar::new(),
            barrier: Barrier::new(worker_amount + 1),
            worker_amount,
        });

        let core_ids = if pin_cores {
            core_affinity::get_core_ids()
        } else {
            None
        };

        let mut handles = Vec::with_capacity(worker_amount);
        for index in 0..worker_amount {
            let shared = Arc::clone(&shared);
            let core_id = core_ids.as_ref().and_then(|ids| ids.get(index).copied());
            let handle = std::thread::Builder::new()
                .name(format!("threadloom-worker-{index}"))
                .spawn(move || worker_loop(shared, index, core_id))
                .map_err(|source| WorkerError::Spawn { index, source })?;
            handles.push(handle);
        }

        log::info!("worker pool started with {worker_amount} worker(s), pin_cores={pin_cores}");
        Ok(WorkerPool { shared, handles })
    }

    pub fn worker_amount(&self) -> usize {
        self.shared.worker_amount
    }

    /// Installs the task every worker runs as `task(worker_index,
    /// worker_amount)` on each subsequent [`WorkerPool::run`]. Call once
    /// before the iteration loop that drives the pool; any iteration-local
    /// state the task needs must be read through a field the task closure
    /// captures a handle to (e.g. a `Mutex`-guarded struct updated in place),
    /// not by calling this again per iteration — doing so would allocate a
    /// new `Arc` on every iteration.
    pub fn set_task<F>(&self, task: F)
    where
        F: Fn(usize, usize) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        state.task = Some(Arc::new(task));
    }

    /// Wakes every worker to run the task installed by [`WorkerPool::set_task`],
    /// then blocks until all workers have completed it and reached the
    /// barrier. Every memory write a worker makes during the task is visible
    /// to the caller once this returns. Allocation-free.
    pub fn run(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.generation += 1;
            self.shared.wake.notify_all();
        }
        self.shared.barrier.wait();
    }

    /// Signals every worker to terminate and joins all threads. Equivalent
    /// to dropping the pool; kept as an explicit call to mirror the
    /// reference implementation's `workerPool_stop`.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stopping = true;
            self.shared.wake.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        log::info!("worker pool stopped");
    }
}

/// Number of logical cores available, used as the default worker count.
pub fn core_amount() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn worker_loop(shared: Arc<Shared>, index: usize, core_id: Option<core_affinity::CoreId>) {
    if let Some(core_id) = core_id {
        if !core_affinity::set_for_current(core_id) {
            log::warn!("worker {index} failed to pin to core {core_id:?}");
        }
    }

    let mut seen_generation = 0u64;
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();
            while state.generation == seen_generation && !state.stopping {
                state = shared.wake.wait(state).unwrap();
            }
            if state.stopping {
                return;
            }
            seen_generation = state.generation;
            state.task.clone()
        };

        if let Some(task) = task {
            task(index, shared.worker_amount);
        }
        shared.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_invokes_every_worker_exactly_once() {
        let pool = WorkerPool::new(4, false).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&counter);
        let s = Arc::clone(&seen);
        pool.set_task(move |index, amount| {
            c.fetch_add(1, Ordering::SeqCst);
            assert_eq!(amount, 4);
            s.lock().unwrap().push(index);
        });
        pool.run();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        pool.stop();
    }

    #[test]
    fn sequential_runs_observe_shared_state_set_once() {
        let pool = WorkerPool::new(2, false).unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let round = Arc::new(AtomicUsize::new(0));

        let t = Arc::clone(&total);
        let r = Arc::clone(&round);
        pool.set_task(move |_, _| {
            t.fetch_add(r.load(Ordering::SeqCst), Ordering::SeqCst);
        });

        for value in 1..=3 {
            round.store(value, Ordering::SeqCst);
            pool.run();
        }
        // 2 workers x (1+2+3) per round, task installed exactly once.
        assert_eq!(total.load(Ordering::SeqCst), 2 * (1 + 2 + 3));
        pool.stop();
    }
}
