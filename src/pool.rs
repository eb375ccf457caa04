//! Work-stealing thread pool hosting the per-peer ingest tasks
//!
//! One worker per hardware thread. Submissions from a worker land on that
//! worker's local deque front (LIFO for the owner); submissions from
//! outside go to a global FIFO. Idle workers steal from the back of other
//! workers' deques, round-robin from their right-hand neighbour. Idle
//! workers park on a condition variable keyed on "task available or
//! shutdown". Drop drains every queue, waits out in-flight tasks, then
//! joins the workers.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    // (pool identity, worker index) of the pool this thread works for.
    static WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Per-worker deque. The owner pushes and pops at the front; thieves take
/// from the back, so local work is LIFO while stolen work is FIFO.
struct StealQueue {
    deque: Mutex<VecDeque<Task>>,
}

impl StealQueue {
    fn new() -> Self {
        StealQueue {
            deque: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, task: Task) {
        lock(&self.deque).push_front(task);
    }

    fn try_pop(&self) -> Option<Task> {
        lock(&self.deque).pop_front()
    }

    fn try_steal(&self) -> Option<Task> {
        lock(&self.deque).pop_back()
    }

    fn is_empty(&self) -> bool {
        lock(&self.deque).is_empty()
    }
}

struct PoolShared {
    global: Mutex<VecDeque<Task>>,
    locals: Vec<StealQueue>,
    done: AtomicBool,
    // Workers currently running a task; the drain wait needs this so a
    // task that resubmits work cannot slip past shutdown.
    active: AtomicUsize,
    gate: Mutex<()>,
    work_cv: Condvar,
    drain_cv: Condvar,
}

impl PoolShared {
    fn has_work(&self) -> bool {
        !lock(&self.global).is_empty() || self.locals.iter().any(|q| !q.is_empty())
    }
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Sizes itself from the hardware parallelism hint.
    pub fn new() -> Self {
        let count = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self::with_threads(count)
    }

    pub fn with_threads(count: usize) -> Self {
        let count = count.max(1);
        let shared = Arc::new(PoolShared {
            global: Mutex::new(VecDeque::new()),
            locals: (0..count).map(|_| StealQueue::new()).collect(),
            done: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            gate: Mutex::new(()),
            work_cv: Condvar::new(),
            drain_cv: Condvar::new(),
        });
        let threads = (0..count)
            .map(|index| {
                let shared = shared.clone();
                thread::spawn(move || worker_loop(shared, index))
            })
            .collect();
        ThreadPool { shared, threads }
    }

    pub fn thread_count(&self) -> usize {
        self.shared.locals.len()
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    /// Queue a task. From a worker of this pool it lands on that worker's
    /// local deque; from anywhere else it goes to the global queue.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task: Task = Box::new(task);
        match WORKER.get() {
            Some((pool, index)) if pool == self.id() => self.shared.locals[index].push(task),
            _ => lock(&self.shared.global).push_back(task),
        }
        let _g = lock(&self.shared.gate);
        self.shared.work_cv.notify_one();
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    /// Waits until every queue is empty and no task is executing, then
    /// shuts the workers down and joins them.
    fn drop(&mut self) {
        {
            let mut g = lock(&self.shared.gate);
            while self.shared.has_work() || self.shared.active.load(Ordering::SeqCst) > 0 {
                g = self
                    .shared
                    .drain_cv
                    .wait(g)
                    .unwrap_or_else(|e| e.into_inner());
            }
            self.shared.done.store(true, Ordering::SeqCst);
            self.shared.work_cv.notify_all();
        }
        for handle in std::mem::take(&mut self.threads) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    WORKER.set(Some((Arc::as_ptr(&shared) as usize, index)));
    loop {
        // Claim before looking: the drain wait must never observe
        // "queues empty, nothing active" while a task is being taken.
        shared.active.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = find_task(&shared, index) {
            // A panicking task must not strand the active count.
            let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task));
            shared.active.fetch_sub(1, Ordering::SeqCst);
            let _g = lock(&shared.gate);
            shared.drain_cv.notify_all();
        } else {
            shared.active.fetch_sub(1, Ordering::SeqCst);
            let mut g = lock(&shared.gate);
            shared.drain_cv.notify_all();
            if shared.done.load(Ordering::SeqCst) {
                break;
            }
            if !shared.has_work() {
                g = shared.work_cv.wait(g).unwrap_or_else(|e| e.into_inner());
            }
            drop(g);
        }
    }
    WORKER.set(None);
}

fn find_task(shared: &PoolShared, index: usize) -> Option<Task> {
    if let Some(task) = shared.locals[index].try_pop() {
        return Some(task);
    }
    if let Some(task) = lock(&shared.global).pop_front() {
        return Some(task);
    }
    let n = shared.locals.len();
    for i in 0..n {
        let victim = (index + i + 1) % n;
        if let Some(task) = shared.locals[victim].try_steal() {
            return Some(task);
        }
    }
    None
}
