//! The work queue compiled pipelines run their parallel loops on.
//!
//! Jobs live in a fixed ring behind one mutex. A submitter becomes the
//! master of its job: it claims iterations from the head of the queue like
//! any worker (helping earlier jobs first) until its own job has been
//! retired, then waits for the last in-flight iterations to drain.
//! Iterations are claimed one at a time. The background pool is spawned on
//! first submission and never shut down.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once, OnceLock, PoisonError};
use std::thread;

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::config::RuntimeConfig;

/// Capacity of the job ring.
pub const N_JOBS: usize = 65536;
/// Upper bound on `threads`, master included.
pub const N_MAX_THREADS: usize = 64;

/// Loop body of native code: called with the iteration index and the
/// closure pointer it was submitted with.
pub type TaskFn = unsafe extern "C" fn(i32, *mut u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParForError {
    #[error("work queue overflow: all {capacity} job slots are in use")]
    QueueOverflow { capacity: usize },
    #[error("iteration range [{min}, {min} + {size}) does not fit in i32")]
    RangeOverflow { min: i32, size: i32 },
}

#[derive(Clone, Copy)]
enum Task {
    Idle,
    Native(TaskFn, *mut u8),
    Rust(*const (dyn Fn(i32) + Sync)),
}

impl Task {
    /// # Safety
    /// The closure behind the task must still be alive, which holds while
    /// its master has not returned.
    unsafe fn run(self, i: i32) {
        match self {
            Task::Idle => {}
            Task::Native(f, closure) => f(i, closure),
            Task::Rust(body) => (*body)(i),
        }
    }
}

#[derive(Clone, Copy)]
struct Job {
    task: Task,
    cursor: i32,
    bound: i32,
    /// Zero once retired.
    id: u64,
    /// Iterations claimed but not yet finished.
    active: u32,
}

impl Job {
    const EMPTY: Job = Job {
        task: Task::Idle,
        cursor: 0,
        bound: 0,
        id: 0,
        active: 0,
    };
}

// Raw task pointers are only dereferenced while their master is blocked in
// `par_for`, which keeps the pointee alive.
unsafe impl Send for Job {}

struct State {
    jobs: Vec<Job>,
    head: usize,
    tail: usize,
    next_id: u64,
    panics: Vec<(u64, Box<dyn Any + Send>)>,
    #[cfg(test)]
    claims: Vec<u64>,
}

impl State {
    fn fresh_id(&mut self) -> u64 {
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn take_panic(&mut self, id: u64) -> Option<Box<dyn Any + Send>> {
        let at = self.panics.iter().position(|(owner, _)| *owner == id)?;
        Some(self.panics.swap_remove(at).1)
    }
}

struct Shared {
    state: Mutex<State>,
    not_empty: Condvar,
    drained: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The worker loop. Background workers pass `None` and never return;
    /// a master passes its job's slot and id and returns once that job has
    /// been retired and drained.
    fn work(&self, master: Option<(usize, u64)>) {
        let mut state = self.lock();
        loop {
            if let Some((slot, id)) = master {
                if state.jobs[slot].id != id {
                    while state.jobs[slot].active > 0 {
                        state = self.drained.wait(state).unwrap_or_else(PoisonError::into_inner);
                    }
                    let panicked = state.take_panic(id);
                    drop(state);
                    if let Some(payload) = panicked {
                        panic::resume_unwind(payload);
                    }
                    return;
                }
            }

            if state.head == state.tail {
                if master.is_some() {
                    error!("work queue empty while a master's job is pending");
                    std::process::abort();
                }
                state = self.not_empty.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            let head = state.head;
            let capacity = state.jobs.len();
            let job = &mut state.jobs[head];
            if job.cursor == job.bound {
                trace!(job = job.id, "retired");
                job.id = 0;
                state.head = (head + 1) % capacity;
                continue;
            }

            let i = job.cursor;
            job.cursor += 1;
            job.active += 1;
            let (task, id) = (job.task, job.id);
            #[cfg(test)]
            state.claims.push(id);
            drop(state);

            // SAFETY: the job's master cannot return before `active` drops
            // back to zero, so the task's closure is alive.
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { task.run(i) }));

            state = self.lock();
            let job = &mut state.jobs[head];
            job.active -= 1;
            let drained = job.active == 0;
            if let Err(payload) = outcome {
                if !state.panics.iter().any(|(owner, _)| *owner == id) {
                    state.panics.push((id, payload));
                }
            }
            if drained {
                self.drained.notify_all();
            }
        }
    }
}

/// A bounded FIFO of parallel-for jobs and the pool that drains it.
/// Clones share the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
    threads: usize,
    spawn: Arc<Once>,
}

impl WorkQueue {
    /// A queue served by `threads` threads: the submitting master plus
    /// `threads - 1` background workers.
    pub fn new(threads: usize) -> Self {
        Self::with_capacity(threads, N_JOBS)
    }

    pub(crate) fn with_capacity(threads: usize, capacity: usize) -> Self {
        let threads = threads.clamp(1, N_MAX_THREADS);
        WorkQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    jobs: vec![Job::EMPTY; capacity.max(2)],
                    head: 0,
                    tail: 0,
                    next_id: 1,
                    panics: Vec::new(),
                    #[cfg(test)]
                    claims: Vec::new(),
                }),
                not_empty: Condvar::new(),
                drained: Condvar::new(),
            }),
            threads,
            spawn: Arc::new(Once::new()),
        }
    }

    /// The process-wide queue native code submits to, sized from the
    /// environment on first use.
    pub fn global() -> &'static WorkQueue {
        static GLOBAL: OnceLock<WorkQueue> = OnceLock::new();
        GLOBAL.get_or_init(|| WorkQueue::new(RuntimeConfig::from_env().threads))
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    fn spawn_pool(&self) {
        self.spawn.call_once(|| {
            let workers = self.threads - 1;
            debug!(workers, "starting work queue pool");
            for n in 0..workers {
                let shared = Arc::clone(&self.shared);
                let spawned = thread::Builder::new()
                    .name(format!("prism-worker-{}", n))
                    .spawn(move || shared.work(None));
                if let Err(e) = spawned {
                    warn!(worker = n, error = %e, "cannot start worker thread");
                }
            }
        });
    }

    fn submit(&self, task: Task, min: i32, size: i32) -> Result<(), ParForError> {
        if size <= 0 {
            return Ok(());
        }
        let bound = min
            .checked_add(size)
            .ok_or(ParForError::RangeOverflow { min, size })?;
        self.spawn_pool();

        let mut state = self.shared.lock();
        let capacity = state.jobs.len();
        let slot = state.tail;
        let next = (slot + 1) % capacity;
        if next == state.head || state.jobs[slot].active != 0 {
            return Err(ParForError::QueueOverflow { capacity });
        }
        let id = state.fresh_id();
        state.jobs[slot] = Job {
            task,
            cursor: min,
            bound,
            id,
            active: 0,
        };
        state.tail = next;
        trace!(job = id, min, size, "submitted");
        drop(state);

        self.shared.not_empty.notify_all();
        self.shared.work(Some((slot, id)));
        Ok(())
    }

    /// Run `body(i)` for every `i` in `[min, min + size)` across the pool,
    /// returning once all iterations have finished. A panic in any
    /// iteration is re-raised here.
    pub fn try_par_for(&self, min: i32, size: i32, body: &(dyn Fn(i32) + Sync)) -> Result<(), ParForError> {
        let body: *const (dyn Fn(i32) + Sync + '_) = body;
        // SAFETY: `submit` does not return before every claimed iteration
        // has finished, so erasing the borrow's lifetime is sound.
        let body: *const (dyn Fn(i32) + Sync + 'static) = unsafe {
            std::mem::transmute::<*const (dyn Fn(i32) + Sync + '_), *const (dyn Fn(i32) + Sync + 'static)>(body)
        };
        self.submit(Task::Rust(body), min, size)
    }

    /// Like [`try_par_for`](Self::try_par_for), but a full queue or a bad
    /// range is fatal.
    pub fn par_for(&self, min: i32, size: i32, body: &(dyn Fn(i32) + Sync)) {
        if let Err(e) = self.try_par_for(min, size, body) {
            error!(error = %e, "par_for");
            std::process::abort();
        }
    }

    /// Native form of [`par_for`](Self::par_for).
    ///
    /// # Safety
    /// `f` must be safe to call with `closure` for every index in range,
    /// from any thread.
    pub unsafe fn par_for_native(&self, f: TaskFn, min: i32, size: i32, closure: *mut u8) {
        if let Err(e) = self.submit(Task::Native(f, closure), min, size) {
            error!(error = %e, "par_for");
            std::process::abort();
        }
    }

    #[cfg(test)]
    fn claims(&self) -> Vec<u64> {
        self.shared.lock().claims.clone()
    }
}

/// Parallel-for entry point for compiled code.
///
/// # Safety
/// See [`WorkQueue::par_for_native`].
#[no_mangle]
pub unsafe extern "C" fn prism_do_par_for(f: TaskFn, min: i32, size: i32, closure: *mut u8) {
    WorkQueue::global().par_for_native(f, min, size, closure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    fn run_counts(queue: &WorkQueue, min: i32, size: i32) -> Vec<u32> {
        let counts: Vec<AtomicU32> = (0..size).map(|_| AtomicU32::new(0)).collect();
        queue.par_for(min, size, &|i| {
            counts[(i - min) as usize].fetch_add(1, Ordering::Relaxed);
        });
        counts.into_iter().map(AtomicU32::into_inner).collect()
    }

    #[test]
    fn test_every_iteration_once_for_all_pool_sizes() {
        for threads in 1..=N_MAX_THREADS {
            let queue = WorkQueue::new(threads);
            let counts = run_counts(&queue, -7, 300);
            assert!(
                counts.iter().all(|&c| c == 1),
                "pool of {} workers",
                threads - 1
            );
        }
    }

    #[test]
    fn test_master_only() {
        let queue = WorkQueue::new(1);
        let seen = Mutex::new(Vec::new());
        queue.par_for(0, 5, &|i| seen.lock().unwrap().push(i));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_range() {
        let queue = WorkQueue::new(4);
        let calls = AtomicUsize::new(0);
        queue.par_for(3, 0, &|_| {
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_nested_par_for() {
        let queue = WorkQueue::new(4);
        let total = AtomicUsize::new(0);
        queue.par_for(0, 8, &|_| {
            queue.par_for(0, 16, &|_| {
                total.fetch_add(1, Ordering::Relaxed);
            });
        });
        assert_eq!(total.load(Ordering::Relaxed), 128);
    }

    #[test]
    fn test_fifo_across_jobs() {
        let queue = WorkQueue::new(3);
        let started = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                queue.par_for(0, 200, &|_| {
                    started.store(true, Ordering::Release);
                    thread::sleep(Duration::from_micros(50));
                });
            });
            while !started.load(Ordering::Acquire) {
                thread::yield_now();
            }
            queue.par_for(0, 200, &|_| {});
        });
        let claims = queue.claims();
        assert_eq!(claims.len(), 400);
        let first = claims[0];
        let switch = claims.iter().position(|&id| id != first).unwrap();
        assert!(claims[..switch].iter().all(|&id| id == first));
        assert!(claims[switch..].iter().all(|&id| id != first));
    }

    #[test]
    fn test_panic_reaches_master() {
        let queue = WorkQueue::new(4);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            queue.par_for(0, 32, &|i| {
                if i == 17 {
                    panic!("iteration {}", i);
                }
            });
        }));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<String>().unwrap(), "iteration 17");
        // The queue keeps working afterwards.
        assert!(run_counts(&queue, 0, 10).iter().all(|&c| c == 1));
    }

    #[test]
    fn test_overflow_is_reported() {
        let queue = WorkQueue::with_capacity(1, 2);
        let inner = Mutex::new(None);
        queue.par_for(0, 1, &|_| {
            *inner.lock().unwrap() = Some(queue.try_par_for(0, 1, &|_| {}));
        });
        assert_eq!(
            inner.into_inner().unwrap(),
            Some(Err(ParForError::QueueOverflow { capacity: 2 }))
        );
    }

    #[test]
    fn test_range_past_i32_is_rejected() {
        let queue = WorkQueue::new(2);
        let ran = AtomicBool::new(false);
        let result = queue.try_par_for(i32::MAX - 4, 10, &|_| ran.store(true, Ordering::SeqCst));
        assert_eq!(
            result,
            Err(ParForError::RangeOverflow {
                min: i32::MAX - 4,
                size: 10
            })
        );
        assert!(!ran.load(Ordering::SeqCst));

        let hits = AtomicUsize::new(0);
        queue.par_for(i32::MAX - 4, 4, &|_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    static NATIVE_HITS: AtomicU32 = AtomicU32::new(0);

    unsafe extern "C" fn native_body(i: i32, closure: *mut u8) {
        let scale = *(closure as *const u32);
        NATIVE_HITS.fetch_add(i as u32 * scale, Ordering::Relaxed);
    }

    #[test]
    fn test_native_abi() {
        let mut scale = 2u32;
        let queue = WorkQueue::new(2);
        unsafe { queue.par_for_native(native_body, 1, 4, &mut scale as *mut u32 as *mut u8) };
        assert_eq!(NATIVE_HITS.load(Ordering::Relaxed), 2 * (1 + 2 + 3 + 4));
    }
}
